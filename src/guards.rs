//! Guard predicates for trade transitions.
//!
//! Guards only read. The service gathers everything a transition needs from a
//! single storage snapshot and then runs the guards over those values, so the
//! checks and the write that follows see the same state.
use crate::error::GuardViolation;
use crate::market::{Item, ItemState, Member};
use crate::trade::{Party, TradeRecord, TradeState};

/// What `start` needs to know about the buyer and the item.
#[derive(Debug, Clone, Copy)]
pub struct StartSnapshot<'a> {
    pub buyer: &'a Member,
    pub item: &'a Item,
    /// Trade currently processing on the item, if any.
    pub item_processing: Option<&'a str>,
    /// Number of the buyer's trades in `processing`.
    pub buyer_processing: u32,
    /// Pending or processing trade of this buyer on this item, if any.
    pub open_trade: Option<&'a str>,
}

pub fn item_eligible(item: &Item, processing_trade: Option<&str>) -> Result<(), GuardViolation> {
    if item.state != ItemState::Valid {
        return Err(GuardViolation::InvalidItem);
    }
    if processing_trade.is_some() {
        return Err(GuardViolation::ProcessingTransactionExists);
    }
    Ok(())
}

pub fn buyer_eligible(buyer: &Member, processing: u32, limit: u32) -> Result<(), GuardViolation> {
    if buyer.contact_channels() == 0 {
        return Err(GuardViolation::NoValidContactInfo);
    }
    if processing >= limit {
        return Err(GuardViolation::ProcessingTransactionLimitExceeded { limit });
    }
    Ok(())
}

pub fn not_self_trade(buyer_id: &str, item: &Item) -> Result<(), GuardViolation> {
    if buyer_id == item.seller_id {
        return Err(GuardViolation::IdenticalSellerBuyer);
    }
    Ok(())
}

pub fn no_duplicate(open_trade: Option<&str>) -> Result<(), GuardViolation> {
    match open_trade {
        Some(_) => Err(GuardViolation::DuplicatedTransaction),
        None => Ok(()),
    }
}

/// All guards of `start`, self-trade first so it wins over every other failure.
pub fn check_start(snapshot: &StartSnapshot<'_>, limit: u32) -> Result<(), GuardViolation> {
    not_self_trade(&snapshot.buyer.user_id, snapshot.item)?;
    item_eligible(snapshot.item, snapshot.item_processing)?;
    buyer_eligible(snapshot.buyer, snapshot.buyer_processing, limit)?;
    no_duplicate(snapshot.open_trade)
}

pub fn acceptance_eligible(
    actor_id: &str,
    trade: &TradeRecord,
    item: &Item,
    item_processing: Option<&str>,
) -> Result<(), GuardViolation> {
    if actor_id != item.seller_id {
        return Err(GuardViolation::NotSeller);
    }
    if trade.state != TradeState::Pending {
        return Err(GuardViolation::TransactionNotPending);
    }
    item_eligible(item, item_processing)
}

pub fn cancellable(trade: &TradeRecord, enforce_validity: bool) -> Result<(), GuardViolation> {
    if trade.state.is_terminal() {
        return Err(GuardViolation::TransactionClosed);
    }
    if enforce_validity && trade.confirmed_time.is_some() {
        return Err(GuardViolation::CouldNotCancelConfirmedTransaction);
    }
    Ok(())
}

/// Returns the side the actor confirms for.
pub fn confirmable(actor_id: &str, trade: &TradeRecord) -> Result<Party, GuardViolation> {
    let party = trade
        .party_of(actor_id)
        .ok_or(GuardViolation::NotTradeParty)?;
    if trade.state != TradeState::Processing {
        return Err(GuardViolation::TransactionNotProcessing);
    }
    if trade.confirmed_by(party) {
        return Err(GuardViolation::AlreadyConfirmed);
    }
    Ok(party)
}
