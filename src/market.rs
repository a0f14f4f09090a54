//! Items listed on the market and the members trading them

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    #[n(0)]
    Valid,
    #[n(1)]
    Hidden,
    #[n(2)]
    Sold,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Item {
    #[n(0)]
    pub item_id: String,
    #[n(1)]
    pub seller_id: String,
    #[n(2)]
    pub name: String,
    #[n(3)]
    pub price: u64,
    #[n(4)]
    pub state: ItemState,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactKind {
    #[n(0)]
    Phone,
    #[n(1)]
    Email,
    #[n(2)]
    Telegram,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ContactInfo {
    #[n(0)]
    pub kind: ContactKind,
    #[n(1)]
    pub value: String,
}

/// A registered user as far as trading is concerned.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Member {
    #[n(0)]
    pub user_id: String,
    #[n(1)]
    pub roles: Vec<String>,
    #[n(2)]
    pub contacts: Vec<ContactInfo>,
}

impl Item {
    pub fn new(item_id: String, seller_id: String, name: &str, price: u64) -> Self {
        Self {
            item_id,
            seller_id,
            name: name.to_owned(),
            price,
            state: ItemState::Valid,
        }
    }
}

impl Member {
    pub fn new(user_id: String) -> Self {
        Self {
            user_id,
            roles: vec![],
            contacts: vec![],
        }
    }
    pub fn with_role(mut self, role: &str) -> Self {
        self.roles.push(role.to_owned());
        self
    }
    pub fn with_contact(mut self, kind: ContactKind, value: &str) -> Self {
        self.contacts.push(ContactInfo {
            kind,
            value: value.to_owned(),
        });
        self
    }

    /// Contact channels that actually carry a value.
    pub fn contact_channels(&self) -> usize {
        self.contacts
            .iter()
            .filter(|c| !c.value.trim().is_empty())
            .count()
    }
}
