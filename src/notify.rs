//! Notifications between members and the staged sender that delivers them.
use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::actor::Actor;
use crate::error::{NotifyError, TradeError};
use crate::pipeline::{CallbackPipeline, Checkpoint, Handler, Signal};
use crate::rbac::CompiledPermissionGraph;
use crate::store::MarketStore;
use crate::trade::TimeStamp;
use crate::utils::{NOTIFICATION_PREFIX, new_uuid_to_bech32};

/// Holders of this permission may read any notification.
pub const READ_ALL_PERMISSION: &str = "notification:read:all";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    #[n(0)]
    TradeStarted,
    #[n(1)]
    TradeAccepted,
    #[n(2)]
    TradeCancelled,
    #[n(3)]
    TradeConfirmed,
    #[n(4)]
    TradeCompleted,
    #[n(5)]
    Message,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    #[n(0)]
    pub kind: NotificationKind,
    #[n(1)]
    pub trade_id: Option<String>,
    #[n(2)]
    pub item_id: Option<String>,
    #[n(3)]
    pub message: String,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    #[n(0)]
    pub notification_id: String,
    // `None` means sent on behalf of the system
    #[n(1)]
    pub sender_id: Option<String>,
    #[n(2)]
    pub receiver_id: String,
    #[n(3)]
    pub content: NotificationContent,
    #[n(4)]
    pub created_time: TimeStamp<Utc>,
    #[n(5)]
    pub read_time: Option<TimeStamp<Utc>>,
    #[n(6)]
    pub deleted_time: Option<TimeStamp<Utc>>,
}

/// The send in progress, as seen and adjusted by pipeline handlers.
///
/// `record` is only filled from the `upon` checkpoint on.
#[derive(Debug, Clone)]
pub struct OutgoingNotification {
    pub sender_id: Option<String>,
    pub receiver_id: String,
    pub content: NotificationContent,
    pub record: Option<Notification>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationQuery {
    pub sent: bool,
    pub received: bool,
    pub ignore_read: bool,
    pub newest_first: bool,
}

pub struct NotificationSender {
    store: MarketStore,
    pipeline: CallbackPipeline<OutgoingNotification>,
    trusted: bool,
}

/// Logs every delivered notification.
pub struct LogHandler;

impl NotificationContent {
    pub fn message(message: &str) -> Self {
        Self {
            kind: NotificationKind::Message,
            trade_id: None,
            item_id: None,
            message: message.to_owned(),
        }
    }

    pub fn about_trade(
        kind: NotificationKind,
        trade_id: &str,
        item_id: &str,
        message: String,
    ) -> Self {
        Self {
            kind,
            trade_id: Some(trade_id.to_owned()),
            item_id: Some(item_id.to_owned()),
            message,
        }
    }
}

impl Notification {
    pub fn is_deleted(&self) -> bool {
        self.deleted_time.is_some()
    }
}

impl Default for NotificationQuery {
    fn default() -> Self {
        Self {
            sent: false,
            received: true,
            ignore_read: false,
            newest_first: true,
        }
    }
}

#[async_trait]
impl Handler<OutgoingNotification> for LogHandler {
    async fn call(&self, ctx: &mut OutgoingNotification) -> anyhow::Result<Signal> {
        debug!(
            sender = ctx.sender_id.as_deref().unwrap_or("system"),
            receiver = %ctx.receiver_id,
            notification = ctx.record.as_ref().map(|n| n.notification_id.as_str()),
            "notification sent"
        );
        Ok(Signal::Continue)
    }
}

impl NotificationSender {
    /// A sender without handlers. Only a `trusted` sender may send on behalf
    /// of the system.
    pub fn new(store: MarketStore, trusted: bool) -> Self {
        Self {
            store,
            pipeline: CallbackPipeline::new(),
            trusted,
        }
    }

    /// A sender with [`LogHandler`] registered at `after`.
    pub fn with_default_handlers(store: MarketStore, trusted: bool) -> Result<Self, NotifyError> {
        let mut sender = Self::new(store, trusted);
        sender.pipeline.add(Checkpoint::After, "log", LogHandler)?;
        Ok(sender)
    }

    pub fn pipeline_mut(&mut self) -> &mut CallbackPipeline<OutgoingNotification> {
        &mut self.pipeline
    }

    fn check_validity(&self, ctx: &OutgoingNotification) -> Result<(), NotifyError> {
        if ctx.content.message.trim().is_empty() {
            return Err(NotifyError::InvalidContent);
        }
        if ctx.receiver_id.is_empty() {
            return Err(NotifyError::InvalidReceiver);
        }
        match self.store.get_member(&ctx.receiver_id) {
            Ok(_) => {}
            Err(TradeError::NotFound { .. }) => return Err(NotifyError::InvalidReceiver),
            Err(err) => return Err(err.into()),
        }
        if ctx.sender_id.is_none() && !self.trusted {
            return Err(NotifyError::SenderNotTrusted);
        }
        Ok(())
    }

    /// Validate, persist and return one notification.
    ///
    /// A veto at `before` or `upon` surfaces as [`NotifyError::Pipeline`] and
    /// leaves the store untouched.
    pub async fn send(
        &self,
        sender_id: Option<&str>,
        receiver_id: &str,
        content: NotificationContent,
    ) -> Result<Notification, NotifyError> {
        let mut ctx = OutgoingNotification {
            sender_id: sender_id.map(str::to_owned),
            receiver_id: receiver_id.to_owned(),
            content,
            record: None,
        };

        self.pipeline.trigger(Checkpoint::Before, &mut ctx).await?;

        self.check_validity(&ctx)?;

        let notification_id = new_uuid_to_bech32(NOTIFICATION_PREFIX)
            .map_err(|e| TradeError::Encode(e.to_string()))?;
        ctx.record = Some(Notification {
            notification_id,
            sender_id: ctx.sender_id.clone(),
            receiver_id: ctx.receiver_id.clone(),
            content: ctx.content.clone(),
            created_time: TimeStamp::new(),
            read_time: None,
            deleted_time: None,
        });

        self.pipeline.trigger(Checkpoint::Upon, &mut ctx).await?;

        // handlers may have replaced the record, but not removed it
        let Some(record) = ctx.record.clone() else {
            return Err(NotifyError::InvalidContent);
        };
        self.store.put_notification(&record)?;

        self.pipeline.trigger(Checkpoint::After, &mut ctx).await?;

        Ok(record)
    }

    pub fn notification(&self, notification_id: &str) -> Result<Notification, NotifyError> {
        let notification = self.store.get_notification(notification_id)?;
        if notification.is_deleted() {
            return Err(TradeError::NotFound {
                kind: "notification",
                id: notification_id.to_owned(),
            }
            .into());
        }
        Ok(notification)
    }

    /// Notifications sent and/or received by `user_id`, ordered by creation time.
    pub fn notifications_of(
        &self,
        user_id: &str,
        query: NotificationQuery,
    ) -> Result<Vec<Notification>, NotifyError> {
        if !query.sent && !query.received {
            return Err(NotifyError::ParamError);
        }

        let mut found = self.store.find_notifications(|n| {
            let involved = (query.sent && n.sender_id.as_deref() == Some(user_id))
                || (query.received && n.receiver_id == user_id);
            involved && !n.is_deleted() && !(query.ignore_read && n.read_time.is_some())
        })?;

        if query.newest_first {
            found.sort_by(|a, b| b.created_time.cmp(&a.created_time));
        } else {
            found.sort_by(|a, b| a.created_time.cmp(&b.created_time));
        }
        Ok(found)
    }

    /// Stamp the read time. Only the receiver may do this; repeated calls keep
    /// the first stamp.
    pub fn mark_read(
        &self,
        notification_id: &str,
        reader: &str,
    ) -> Result<Notification, NotifyError> {
        let mut notification = self.notification(notification_id)?;
        if notification.receiver_id != reader {
            return Err(NotifyError::PermissionRequired {
                id: notification_id.to_owned(),
                user: reader.to_owned(),
            });
        }
        if notification.read_time.is_none() {
            notification.read_time = Some(TimeStamp::new());
            self.store.put_notification(&notification)?;
        }
        Ok(notification)
    }
}

/// Whether `actor` may read `notification`.
pub fn check_reader(
    actor: &Actor,
    compiled: &CompiledPermissionGraph,
    notification: &Notification,
) -> Result<(), NotifyError> {
    if notification.is_deleted() {
        return Err(TradeError::NotFound {
            kind: "notification",
            id: notification.notification_id.clone(),
        }
        .into());
    }

    if actor.probe(compiled, &BTreeSet::from([READ_ALL_PERMISSION.to_owned()])) {
        return Ok(());
    }

    let involved = |user: &str| {
        notification.sender_id.as_deref() == Some(user) || notification.receiver_id == user
    };
    let user = actor.user_id();
    if user.is_some_and(involved) {
        return Ok(());
    }

    Err(NotifyError::PermissionRequired {
        id: notification.notification_id.clone(),
        user: user.unwrap_or("guest").to_owned(),
    })
}
