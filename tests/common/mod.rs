//! Shared fixtures: a throwaway sled database, the default role set and a
//! handful of members and items.
#![allow(dead_code)]

use std::sync::Arc;

use campus_trade::actor::{Actor, Session};
use campus_trade::config::MarketConfig;
use campus_trade::market::{ContactKind, Item, Member};
use campus_trade::notify::NotificationSender;
use campus_trade::rbac::CompiledPermissionGraph;
use campus_trade::service::{TradeService, TradeSettings};
use campus_trade::store::MarketStore;
use campus_trade::utils::{ITEM_PREFIX, USER_PREFIX, new_uuid_to_bech32};
use tempfile::{TempDir, tempdir};

pub struct Market {
    // keeps the database directory alive for the test
    pub dir: TempDir,
    pub config: MarketConfig,
    pub permissions: Arc<CompiledPermissionGraph>,
    pub store: MarketStore,
    pub service: TradeService,
}

pub fn open_store(dir: &TempDir) -> anyhow::Result<MarketStore> {
    // Sled locks its directory, so every test gets its own database.
    let db = sled::open(dir.path().join("market.db"))?;
    Ok(MarketStore::new(Arc::new(db))?)
}

pub fn market_with(
    config: MarketConfig,
    notifier: Option<NotificationSender>,
) -> anyhow::Result<Market> {
    let dir = tempdir()?;
    let store = open_store(&dir)?;
    let permissions = config.compile_permissions()?;

    let mut service = TradeService::new(store.clone(), permissions.clone(), config.trade.clone());
    if let Some(notifier) = notifier {
        service = service.with_notifier(Arc::new(notifier));
    }

    Ok(Market {
        dir,
        config,
        permissions,
        store,
        service,
    })
}

pub fn market() -> anyhow::Result<Market> {
    market_with(MarketConfig::default(), None)
}

pub fn market_with_settings(settings: TradeSettings) -> anyhow::Result<Market> {
    let config = MarketConfig {
        trade: settings,
        ..MarketConfig::default()
    };
    market_with(config, None)
}

impl Market {
    /// A `member` with one e-mail contact, and the actor of their session.
    pub fn member(&self) -> anyhow::Result<(Member, Actor)> {
        let member = Member::new(new_uuid_to_bech32(USER_PREFIX)?)
            .with_role("member")
            .with_contact(ContactKind::Email, "someone@campus.edu");
        Ok((member.clone(), self.register(member)?))
    }

    pub fn register(&self, member: Member) -> anyhow::Result<Actor> {
        self.store.put_member(&member)?;
        Ok(self.actor_for(&member))
    }

    pub fn actor_for(&self, member: &Member) -> Actor {
        Actor::from_session(Some(&Session::for_member(member)), &self.config.session)
    }

    pub fn guest(&self) -> Actor {
        Actor::from_session(None, &self.config.session)
    }

    pub fn item_of(&self, seller: &Member) -> anyhow::Result<Item> {
        let item = Item::new(
            new_uuid_to_bech32(ITEM_PREFIX)?,
            seller.user_id.clone(),
            "second-hand calculus textbook",
            2_000,
        );
        self.store.put_item(&item)?;
        Ok(item)
    }
}
