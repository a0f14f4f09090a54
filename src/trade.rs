//! Trade records and their state vocabulary
use std::cmp::Ordering;

use chrono::{DateTime, TimeZone, Utc};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TradeState {
    #[n(0)]
    Pending,
    #[n(1)]
    Processing,
    #[n(2)]
    Success,
    #[n(3)]
    Cancelled,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CancelReason {
    #[n(0)]
    SellerRejected,
    #[n(1)]
    SellerAcceptTimeout,
    #[n(2)]
    CancelledByBuyer,
    #[n(3)]
    CancelledBySeller,
    #[n(4)]
    SellerConfirmTimeout,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct TimeStamp<T: TimeZone>(DateTime<T>);

/// A negotiation between a buyer and the seller of one item.
///
/// The seller is denormalised from the item when the trade is started so that
/// guards can check ownership without a second lookup.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TradeRecord {
    #[n(0)]
    pub trade_id: String,
    #[n(1)]
    pub buyer_id: String,
    #[n(2)]
    pub item_id: String,
    #[n(3)]
    pub seller_id: String,
    #[n(4)]
    pub state: TradeState,
    #[n(5)]
    pub created_time: TimeStamp<Utc>,
    #[n(6)]
    pub accepted_time: Option<TimeStamp<Utc>>,
    #[n(7)]
    pub confirmed_time: Option<TimeStamp<Utc>>,
    #[n(8)]
    pub completed_time: Option<TimeStamp<Utc>>,
    #[n(9)]
    pub cancel_reason: Option<CancelReason>,
    #[n(10)]
    pub buyer_confirmed_time: Option<TimeStamp<Utc>>,
    #[n(11)]
    pub seller_confirmed_time: Option<TimeStamp<Utc>>,
    // soft removal by a cascade, independent of the business state
    #[n(12)]
    pub archived_time: Option<TimeStamp<Utc>>,
}

/// Which side of a trade an actor is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Buyer,
    Seller,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Pending => "pending",
            TradeState::Processing => "processing",
            TradeState::Success => "success",
            TradeState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TradeState::Success | TradeState::Cancelled)
    }

    /// Pending or processing: the trade still occupies its (buyer, item) slot.
    pub fn is_open(&self) -> bool {
        !self.is_terminal()
    }
}

impl CancelReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelReason::SellerRejected => "seller_rejected",
            CancelReason::SellerAcceptTimeout => "seller_accept_timeout",
            CancelReason::CancelledByBuyer => "cancelled_by_buyer",
            CancelReason::CancelledBySeller => "cancelled_by_seller",
            CancelReason::SellerConfirmTimeout => "seller_confirm_timeout",
        }
    }
}

impl TimeStamp<Utc> {
    pub fn new() -> Self {
        Self(Utc::now())
    }
}

// `Utc` itself is not ordered, so the derive would not apply.
impl Ord for TimeStamp<Utc> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for TimeStamp<Utc> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Default for TimeStamp<Utc> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: TimeZone> From<DateTime<T>> for TimeStamp<T> {
    fn from(value: DateTime<T>) -> Self {
        TimeStamp(value)
    }
}

impl<C> minicbor::Encode<C> for TimeStamp<Utc> {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp<Utc> {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}

impl TradeRecord {
    /// A fresh `pending` trade.
    pub fn new(
        trade_id: String,
        buyer_id: String,
        item_id: String,
        seller_id: String,
        created_time: TimeStamp<Utc>,
    ) -> Self {
        Self {
            trade_id,
            buyer_id,
            item_id,
            seller_id,
            state: TradeState::Pending,
            created_time,
            accepted_time: None,
            confirmed_time: None,
            completed_time: None,
            cancel_reason: None,
            buyer_confirmed_time: None,
            seller_confirmed_time: None,
            archived_time: None,
        }
    }

    pub fn party_of(&self, user_id: &str) -> Option<Party> {
        if user_id == self.buyer_id {
            Some(Party::Buyer)
        } else if user_id == self.seller_id {
            Some(Party::Seller)
        } else {
            None
        }
    }

    /// The other participant, as seen from `user_id`.
    pub fn counterpart_of(&self, user_id: &str) -> Option<&str> {
        match self.party_of(user_id)? {
            Party::Buyer => Some(&self.seller_id),
            Party::Seller => Some(&self.buyer_id),
        }
    }

    /// Derive why `actor` is cancelling this trade. `None` when the actor is
    /// unrelated to the trade or the trade is already closed.
    pub fn determine_cancel_reason(&self, actor: &str) -> Option<CancelReason> {
        match (self.state, self.party_of(actor)?) {
            (TradeState::Pending, Party::Seller) => Some(CancelReason::SellerRejected),
            (TradeState::Pending, Party::Buyer) => Some(CancelReason::CancelledByBuyer),
            (TradeState::Processing, Party::Seller) => Some(CancelReason::CancelledBySeller),
            (TradeState::Processing, Party::Buyer) => Some(CancelReason::CancelledByBuyer),
            _ => None,
        }
    }

    pub fn is_archived(&self) -> bool {
        self.archived_time.is_some()
    }

    pub fn confirmed_by(&self, party: Party) -> bool {
        match party {
            Party::Buyer => self.buyer_confirmed_time.is_some(),
            Party::Seller => self.seller_confirmed_time.is_some(),
        }
    }
}
