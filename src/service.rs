//! Service layer API for trade workflow operations
use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, warn};

use crate::actor::Actor;
use crate::error::TradeError;
use crate::guards::{
    StartSnapshot, acceptance_eligible, cancellable, check_start, confirmable, not_self_trade,
};
use crate::market::ItemState;
use crate::notify::{NotificationContent, NotificationKind, NotificationSender};
use crate::rbac::{CompiledPermissionGraph, permission_set};
use crate::store::{MarketStore, abort};
use crate::trade::{CancelReason, Party, TimeStamp, TradeRecord, TradeState};
use crate::utils::{TRADE_PREFIX, new_uuid_to_bech32};

pub const DEFAULT_MAX_PROCESSING_PER_BUYER: u32 = 5;

/// How many sides must confirm before a processing trade succeeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConfirmationPolicy {
    SingleSided,
    DualSided,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TradeSettings {
    pub max_processing_per_buyer: u32,
    pub confirmation: ConfirmationPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeAction {
    Start,
    Accept,
    Cancel,
    Confirm,
}

/// Summary of a cascade touching many records at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOperationInfo {
    pub operation: String,
    pub count: usize,
}

pub struct TradeService {
    store: MarketStore,
    permissions: Arc<CompiledPermissionGraph>,
    settings: TradeSettings,
    notifier: Option<Arc<NotificationSender>>,
}

impl Default for TradeSettings {
    fn default() -> Self {
        Self {
            max_processing_per_buyer: DEFAULT_MAX_PROCESSING_PER_BUYER,
            confirmation: ConfirmationPolicy::DualSided,
        }
    }
}

impl TradeAction {
    pub fn permission(&self) -> &'static str {
        match self {
            TradeAction::Start => "trade:start",
            TradeAction::Accept => "trade:accept",
            TradeAction::Cancel => "trade:cancel",
            TradeAction::Confirm => "trade:confirm",
        }
    }
}

fn new_trade_id() -> Result<String, TradeError> {
    new_uuid_to_bech32(TRADE_PREFIX).map_err(|e| TradeError::Encode(e.to_string()))
}

impl TradeService {
    pub fn new(
        store: MarketStore,
        permissions: Arc<CompiledPermissionGraph>,
        settings: TradeSettings,
    ) -> Self {
        Self {
            store,
            permissions,
            settings,
            notifier: None,
        }
    }

    /// Send a notification to the counterpart after every committed transition.
    pub fn with_notifier(mut self, notifier: Arc<NotificationSender>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Check the actor's capability for `action` and return its user id.
    fn authorize(&self, actor: &Actor, action: TradeAction) -> Result<String, TradeError> {
        actor.authorize(&self.permissions, &permission_set([action.permission()]))?;
        actor
            .user_id()
            .map(str::to_owned)
            .ok_or(TradeError::AnonymousActor)
    }

    /// Open a `pending` trade of the actor on `item_id`.
    pub async fn start(&self, actor: &Actor, item_id: &str) -> Result<TradeRecord, TradeError> {
        let buyer_id = self.authorize(actor, TradeAction::Start)?;
        let trade_id = new_trade_id()?;
        let now = TimeStamp::new();
        let limit = self.settings.max_processing_per_buyer;

        let trade = self.store.transact(|tx| {
            let item = tx.item(item_id)?;
            // the seller's own item fails the same way whatever else is missing
            if let Err(violation) = not_self_trade(&buyer_id, &item) {
                return abort(violation);
            }
            let buyer = tx.member(&buyer_id)?;
            let item_processing = tx.processing_trade(item_id)?;
            let open_trade = tx.open_trade(&buyer_id, item_id)?;

            let snapshot = StartSnapshot {
                buyer: &buyer,
                item: &item,
                item_processing: item_processing.as_deref(),
                buyer_processing: tx.processing_count(&buyer_id)?,
                open_trade: open_trade.as_deref(),
            };
            if let Err(violation) = check_start(&snapshot, limit) {
                return abort(violation);
            }

            let trade = TradeRecord::new(
                trade_id.clone(),
                buyer_id.clone(),
                item.item_id.clone(),
                item.seller_id.clone(),
                now.clone(),
            );
            tx.put_trade(&trade)?;
            tx.claim_open(&trade)?;
            Ok(trade)
        })?;

        info!(
            trade = %trade.trade_id,
            item = %trade.item_id,
            state = trade.state.as_str(),
            "trade started"
        );
        self.notify_counterpart(&buyer_id, &trade, NotificationKind::TradeStarted)
            .await;
        Ok(trade)
    }

    /// The seller takes a pending trade into `processing`.
    pub async fn accept(&self, actor: &Actor, trade_id: &str) -> Result<TradeRecord, TradeError> {
        let seller_id = self.authorize(actor, TradeAction::Accept)?;
        let now = TimeStamp::new();

        let trade = self.store.transact(|tx| {
            let mut trade = tx.trade(trade_id)?;
            let item = tx.item(&trade.item_id)?;
            let item_processing = tx.processing_trade(&trade.item_id)?;
            if let Err(violation) =
                acceptance_eligible(&seller_id, &trade, &item, item_processing.as_deref())
            {
                return abort(violation);
            }

            trade.state = TradeState::Processing;
            trade.accepted_time = Some(now.clone());
            tx.put_trade(&trade)?;
            tx.claim_processing(&trade)?;
            Ok(trade)
        })?;

        info!(trade = %trade.trade_id, state = trade.state.as_str(), "trade accepted");
        self.notify_counterpart(&seller_id, &trade, NotificationKind::TradeAccepted)
            .await;
        Ok(trade)
    }

    /// Cancel an open trade.
    ///
    /// Without an explicit `reason` it is derived from the actor's side and the
    /// trade state; an actor outside the trade must supply one. With
    /// `enforce_validity`, trades that were already confirmed can not be
    /// cancelled.
    pub async fn cancel(
        &self,
        actor: &Actor,
        trade_id: &str,
        reason: Option<CancelReason>,
        enforce_validity: bool,
    ) -> Result<TradeRecord, TradeError> {
        let actor_id = self.authorize(actor, TradeAction::Cancel)?;

        let trade = self.store.transact(|tx| {
            let mut trade = tx.trade(trade_id)?;
            if let Err(violation) = cancellable(&trade, enforce_validity) {
                return abort(violation);
            }

            let reason = match reason.or_else(|| trade.determine_cancel_reason(&actor_id)) {
                Some(reason) => reason,
                None => {
                    return abort(TradeError::UndeterminedCancelReason {
                        trade_id: trade.trade_id.clone(),
                        actor: actor_id.clone(),
                    });
                }
            };

            tx.release_slots(&trade)?;
            trade.state = TradeState::Cancelled;
            trade.cancel_reason = Some(reason);
            tx.put_trade(&trade)?;
            Ok(trade)
        })?;

        info!(
            trade = %trade.trade_id,
            state = trade.state.as_str(),
            reason = trade.cancel_reason.map(|r| r.as_str()),
            "trade cancelled"
        );
        self.notify_counterpart(&actor_id, &trade, NotificationKind::TradeCancelled)
            .await;
        Ok(trade)
    }

    /// Record the actor's confirmation. The trade succeeds once the configured
    /// [`ConfirmationPolicy`] is met, and the item is marked sold.
    pub async fn confirm(&self, actor: &Actor, trade_id: &str) -> Result<TradeRecord, TradeError> {
        let actor_id = self.authorize(actor, TradeAction::Confirm)?;
        let now = TimeStamp::new();
        let policy = self.settings.confirmation;

        let trade = self.store.transact(|tx| {
            let mut trade = tx.trade(trade_id)?;
            let party = match confirmable(&actor_id, &trade) {
                Ok(party) => party,
                Err(violation) => return abort(violation),
            };

            match party {
                Party::Buyer => trade.buyer_confirmed_time = Some(now.clone()),
                Party::Seller => trade.seller_confirmed_time = Some(now.clone()),
            }
            if trade.confirmed_time.is_none() {
                trade.confirmed_time = Some(now.clone());
            }

            let complete = match policy {
                ConfirmationPolicy::SingleSided => true,
                ConfirmationPolicy::DualSided => {
                    trade.confirmed_by(Party::Buyer) && trade.confirmed_by(Party::Seller)
                }
            };
            if complete {
                tx.release_slots(&trade)?;
                trade.state = TradeState::Success;
                trade.completed_time = Some(now.clone());

                let mut item = tx.item(&trade.item_id)?;
                item.state = ItemState::Sold;
                tx.put_item(&item)?;
            }

            tx.put_trade(&trade)?;
            Ok(trade)
        })?;

        info!(trade = %trade.trade_id, state = trade.state.as_str(), "trade confirmed");
        let kind = match trade.state {
            TradeState::Success => NotificationKind::TradeCompleted,
            _ => NotificationKind::TradeConfirmed,
        };
        self.notify_counterpart(&actor_id, &trade, kind).await;
        Ok(trade)
    }

    pub fn get_trade(&self, trade_id: &str) -> Result<TradeRecord, TradeError> {
        self.store.get_trade(trade_id)
    }

    /// Live trades of a buyer, newest first.
    pub fn trades_of_buyer(&self, buyer_id: &str) -> Result<Vec<TradeRecord>, TradeError> {
        self.store.find_trades(|t| t.buyer_id == buyer_id)
    }

    /// Live trades on an item, newest first.
    pub fn trades_for_item(&self, item_id: &str) -> Result<Vec<TradeRecord>, TradeError> {
        self.store.find_trades(|t| t.item_id == item_id)
    }

    /// Soft-remove every trade bought by one of `buyer_ids`, as part of removing
    /// those users. States are kept; negotiation slots are released.
    pub fn archive_trades_of_buyers(
        &self,
        buyer_ids: &[&str],
    ) -> Result<BulkOperationInfo, TradeError> {
        let buyers: BTreeSet<&str> = buyer_ids.iter().copied().collect();
        let trade_ids: Vec<String> = self
            .store
            .find_trades(|t| buyers.contains(t.buyer_id.as_str()))?
            .into_iter()
            .map(|t| t.trade_id)
            .collect();
        let now = TimeStamp::new();

        let count = self.store.transact(|tx| {
            let mut count = 0;
            for trade_id in &trade_ids {
                if tx.archive_trade(trade_id, &now)?.is_some() {
                    count += 1;
                }
            }
            Ok(count)
        })?;

        info!(buyers = buyers.len(), count, "trades archived");
        Ok(BulkOperationInfo {
            operation: "Archive trades of buyers".to_owned(),
            count,
        })
    }

    async fn notify_counterpart(
        &self,
        actor_id: &str,
        trade: &TradeRecord,
        kind: NotificationKind,
    ) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        // actors outside the trade (e.g. a sweep job) notify the buyer
        let receiver = trade.counterpart_of(actor_id).unwrap_or(&trade.buyer_id);
        let content = NotificationContent::about_trade(
            kind,
            &trade.trade_id,
            &trade.item_id,
            format!("trade {} is now {}", trade.trade_id, trade.state.as_str()),
        );

        if let Err(err) = notifier.send(Some(actor_id), receiver, content).await {
            warn!(trade = %trade.trade_id, error = %err, "companion notification failed");
        }
    }
}
