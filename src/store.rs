//! sled-backed persistence for items, members, trades and notifications.
//!
//! Trades carry three kinds of uniqueness slots in the `slots` tree:
//!
//! * `processing/<item>` holds the one trade processing on an item,
//! * `open/<buyer>/<item>` holds the one pending or processing trade of a
//!   buyer on an item,
//! * `count/<buyer>` holds how many of the buyer's trades are processing.
//!
//! Slots are only touched inside sled transactions together with the trade
//! record they describe. sled runs transactions serializably and re-runs the
//! closure on conflict, so a racing writer re-reads the winner's slot and
//! fails the matching guard instead of overwriting it.
use std::sync::Arc;

use chrono::Utc;
use minicbor::{Decode, Encode};
use sled::Transactional;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};

use crate::error::TradeError;
use crate::market::{Item, ItemState, Member};
use crate::notify::Notification;
use crate::trade::{TimeStamp, TradeRecord, TradeState};

pub type TxResult<T> = ConflictableTransactionResult<T, TradeError>;

#[derive(Clone)]
pub struct MarketStore {
    items: sled::Tree,
    members: sled::Tree,
    trades: sled::Tree,
    slots: sled::Tree,
    notifications: sled::Tree,
}

/// The trees of one running transaction.
pub struct TxView<'a> {
    items: &'a TransactionalTree,
    members: &'a TransactionalTree,
    trades: &'a TransactionalTree,
    slots: &'a TransactionalTree,
}

pub(crate) fn encode<T: Encode<()>>(value: &T) -> Result<Vec<u8>, TradeError> {
    minicbor::to_vec(value).map_err(|e| TradeError::Encode(e.to_string()))
}

pub(crate) fn decode<T>(bytes: &[u8]) -> Result<T, TradeError>
where
    T: for<'b> Decode<'b, ()>,
{
    Ok(minicbor::decode(bytes)?)
}

pub(crate) fn abort<T>(err: impl Into<TradeError>) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(err.into()))
}

fn in_tx<T>(res: Result<T, TradeError>) -> TxResult<T> {
    res.map_err(ConflictableTransactionError::Abort)
}

fn not_found(kind: &'static str, id: &str) -> TradeError {
    TradeError::NotFound {
        kind,
        id: id.to_owned(),
    }
}

fn processing_key(item_id: &str) -> String {
    format!("processing/{item_id}")
}

fn open_key(buyer_id: &str, item_id: &str) -> String {
    format!("open/{buyer_id}/{item_id}")
}

fn count_key(buyer_id: &str) -> String {
    format!("count/{buyer_id}")
}

impl MarketStore {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self, TradeError> {
        Ok(Self {
            items: instance.open_tree("items")?,
            members: instance.open_tree("members")?,
            trades: instance.open_tree("trades")?,
            slots: instance.open_tree("slots")?,
            notifications: instance.open_tree("notifications")?,
        })
    }

    /// Run `f` as one serializable transaction over the trade related trees.
    ///
    /// `f` may be called several times; it must not have effects outside the view.
    pub fn transact<T, F>(&self, f: F) -> Result<T, TradeError>
    where
        F: Fn(&TxView<'_>) -> TxResult<T>,
    {
        (&self.items, &self.members, &self.trades, &self.slots)
            .transaction(|(items, members, trades, slots)| {
                f(&TxView {
                    items,
                    members,
                    trades,
                    slots,
                })
            })
            .map_err(|err| match err {
                TransactionError::Abort(err) => err,
                TransactionError::Storage(err) => TradeError::Store(err),
            })
    }

    pub fn put_item(&self, item: &Item) -> Result<(), TradeError> {
        self.items.insert(item.item_id.as_bytes(), encode(item)?)?;
        Ok(())
    }

    pub fn set_item_state(&self, item_id: &str, state: ItemState) -> Result<Item, TradeError> {
        self.transact(|tx| {
            let mut item = tx.item(item_id)?;
            item.state = state;
            tx.put_item(&item)?;
            Ok(item)
        })
    }

    pub fn get_item(&self, item_id: &str) -> Result<Item, TradeError> {
        match self.items.get(item_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(not_found("item", item_id)),
        }
    }

    pub fn put_member(&self, member: &Member) -> Result<(), TradeError> {
        self.members
            .insert(member.user_id.as_bytes(), encode(member)?)?;
        Ok(())
    }

    pub fn get_member(&self, user_id: &str) -> Result<Member, TradeError> {
        match self.members.get(user_id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(not_found("user", user_id)),
        }
    }

    /// Soft-removed trades are reported as missing.
    pub fn get_trade(&self, trade_id: &str) -> Result<TradeRecord, TradeError> {
        let trade: TradeRecord = match self.trades.get(trade_id.as_bytes())? {
            Some(bytes) => decode(&bytes)?,
            None => return Err(not_found("trade", trade_id)),
        };
        if trade.is_archived() {
            return Err(not_found("trade", trade_id));
        }
        Ok(trade)
    }

    /// Live trades matching `filter`, newest first.
    pub fn find_trades<F>(&self, filter: F) -> Result<Vec<TradeRecord>, TradeError>
    where
        F: Fn(&TradeRecord) -> bool,
    {
        let mut found = vec![];
        for entry in self.trades.iter() {
            let (_, bytes) = entry?;
            let trade: TradeRecord = decode(&bytes)?;
            if !trade.is_archived() && filter(&trade) {
                found.push(trade);
            }
        }
        found.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        Ok(found)
    }

    pub(crate) fn put_notification(&self, notification: &Notification) -> Result<(), TradeError> {
        self.notifications
            .insert(notification.notification_id.as_bytes(), encode(notification)?)?;
        Ok(())
    }

    pub(crate) fn get_notification(&self, id: &str) -> Result<Notification, TradeError> {
        match self.notifications.get(id.as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(not_found("notification", id)),
        }
    }

    pub(crate) fn find_notifications<F>(&self, filter: F) -> Result<Vec<Notification>, TradeError>
    where
        F: Fn(&Notification) -> bool,
    {
        let mut found = vec![];
        for entry in self.notifications.iter() {
            let (_, bytes) = entry?;
            let notification: Notification = decode(&bytes)?;
            if filter(&notification) {
                found.push(notification);
            }
        }
        Ok(found)
    }
}

impl TxView<'_> {
    fn read<T>(tree: &TransactionalTree, key: &str) -> TxResult<Option<T>>
    where
        T: for<'b> Decode<'b, ()>,
    {
        match tree.get(key.as_bytes())? {
            Some(bytes) => in_tx(decode(&bytes)).map(Some),
            None => Ok(None),
        }
    }

    fn write<T: Encode<()>>(tree: &TransactionalTree, key: &str, value: &T) -> TxResult<()> {
        let bytes = in_tx(encode(value))?;
        tree.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn item(&self, item_id: &str) -> TxResult<Item> {
        match Self::read(self.items, item_id)? {
            Some(item) => Ok(item),
            None => abort(not_found("item", item_id)),
        }
    }

    pub fn put_item(&self, item: &Item) -> TxResult<()> {
        Self::write(self.items, &item.item_id, item)
    }

    pub fn member(&self, user_id: &str) -> TxResult<Member> {
        match Self::read(self.members, user_id)? {
            Some(member) => Ok(member),
            None => abort(not_found("user", user_id)),
        }
    }

    /// Soft-removed trades are reported as missing.
    pub fn trade(&self, trade_id: &str) -> TxResult<TradeRecord> {
        match Self::read::<TradeRecord>(self.trades, trade_id)? {
            Some(trade) if !trade.is_archived() => Ok(trade),
            _ => abort(not_found("trade", trade_id)),
        }
    }

    pub fn put_trade(&self, trade: &TradeRecord) -> TxResult<()> {
        Self::write(self.trades, &trade.trade_id, trade)
    }

    pub fn processing_trade(&self, item_id: &str) -> TxResult<Option<String>> {
        Self::read(self.slots, &processing_key(item_id))
    }

    pub fn open_trade(&self, buyer_id: &str, item_id: &str) -> TxResult<Option<String>> {
        Self::read(self.slots, &open_key(buyer_id, item_id))
    }

    pub fn processing_count(&self, buyer_id: &str) -> TxResult<u32> {
        Ok(Self::read(self.slots, &count_key(buyer_id))?.unwrap_or(0))
    }

    pub fn claim_open(&self, trade: &TradeRecord) -> TxResult<()> {
        Self::write(
            self.slots,
            &open_key(&trade.buyer_id, &trade.item_id),
            &trade.trade_id,
        )
    }

    /// Mark `trade` as the processing trade of its item and count it for the buyer.
    pub fn claim_processing(&self, trade: &TradeRecord) -> TxResult<()> {
        Self::write(self.slots, &processing_key(&trade.item_id), &trade.trade_id)?;
        let count = self.processing_count(&trade.buyer_id)?;
        Self::write(self.slots, &count_key(&trade.buyer_id), &(count + 1))
    }

    /// Release whichever slots `trade` holds in its current state.
    pub fn release_slots(&self, trade: &TradeRecord) -> TxResult<()> {
        if trade.state.is_open() {
            self.release_if_owned(&open_key(&trade.buyer_id, &trade.item_id), &trade.trade_id)?;
        }
        if trade.state == TradeState::Processing
            && self.release_if_owned(&processing_key(&trade.item_id), &trade.trade_id)?
        {
            let count = self.processing_count(&trade.buyer_id)?;
            Self::write(
                self.slots,
                &count_key(&trade.buyer_id),
                &count.saturating_sub(1),
            )?;
        }
        Ok(())
    }

    fn release_if_owned(&self, key: &str, trade_id: &str) -> TxResult<bool> {
        match Self::read::<String>(self.slots, key)? {
            Some(owner) if owner == trade_id => {
                self.slots.remove(key.as_bytes())?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Stamp the trade as soft-removed and free its slots. The state is kept.
    pub fn archive_trade(
        &self,
        trade_id: &str,
        now: &TimeStamp<Utc>,
    ) -> TxResult<Option<TradeRecord>> {
        let Some(mut trade) = Self::read::<TradeRecord>(self.trades, trade_id)? else {
            return Ok(None);
        };
        if trade.is_archived() {
            return Ok(None);
        }
        self.release_slots(&trade)?;
        trade.archived_time = Some(now.clone());
        self.put_trade(&trade)?;
        Ok(Some(trade))
    }
}
