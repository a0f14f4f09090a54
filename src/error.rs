use std::collections::BTreeSet;

/// Role graph problems found while compiling permissions. Fatal at startup.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum RbacError {
    #[error("role `{referenced}` referenced by {context} is not a declared role")]
    InvalidRoleReference {
        referenced: String,
        context: String,
    },
    #[error("role `{0}` is declared more than once")]
    DuplicateRole(String),
    #[error("permission compilation did not converge after {passes} passes")]
    CompileDiverged { passes: usize },
}

impl RbacError {
    pub fn name(&self) -> &'static str {
        match self {
            RbacError::InvalidRoleReference { .. } => "invalid_role_reference",
            RbacError::DuplicateRole(_) => "duplicate_role",
            RbacError::CompileDiverged { .. } => "rbac_compile_error",
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("role `{0}` is not a configured role")]
    InvalidRole(String),
    #[error("none of the roles {roles:?} holds all of {required:?}")]
    PermissionDenied {
        roles: BTreeSet<String>,
        required: BTreeSet<String>,
    },
}

impl AuthzError {
    pub fn name(&self) -> &'static str {
        match self {
            AuthzError::InvalidRole(_) => "invalid_role",
            AuthzError::PermissionDenied { .. } => "insufficient_permission",
        }
    }
}

/// A trade guard that did not pass. Each variant maps to one stable identifier.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("item is not in a valid state for a transaction")]
    InvalidItem,
    #[error("item already has a processing transaction")]
    ProcessingTransactionExists,
    #[error("buyer has no valid contact information")]
    NoValidContactInfo,
    #[error("buyer already has {limit} processing transactions")]
    ProcessingTransactionLimitExceeded { limit: u32 },
    #[error("buyer and seller are the same user")]
    IdenticalSellerBuyer,
    #[error("buyer already has an open transaction on this item")]
    DuplicatedTransaction,
    #[error("only the seller of the item may do this")]
    NotSeller,
    #[error("transaction is not pending")]
    TransactionNotPending,
    #[error("transaction is not processing")]
    TransactionNotProcessing,
    #[error("transaction is already closed")]
    TransactionClosed,
    #[error("a confirmed transaction can not be cancelled")]
    CouldNotCancelConfirmedTransaction,
    #[error("user is neither buyer nor seller of this transaction")]
    NotTradeParty,
    #[error("this side has already confirmed the transaction")]
    AlreadyConfirmed,
}

impl GuardViolation {
    pub fn name(&self) -> &'static str {
        match self {
            GuardViolation::InvalidItem => "invalid_item",
            GuardViolation::ProcessingTransactionExists => "processing_transaction_exists",
            GuardViolation::NoValidContactInfo => "no_valid_contact_info",
            GuardViolation::ProcessingTransactionLimitExceeded { .. } => {
                "processing_transaction_limit_exceeded"
            }
            GuardViolation::IdenticalSellerBuyer => "identical_seller_buyer",
            GuardViolation::DuplicatedTransaction => "duplicated_transaction",
            GuardViolation::NotSeller => "not_seller",
            GuardViolation::TransactionNotPending => "transaction_not_pending",
            GuardViolation::TransactionNotProcessing => "transaction_not_processing",
            GuardViolation::TransactionClosed => "transaction_closed",
            GuardViolation::CouldNotCancelConfirmedTransaction => {
                "could_not_cancel_confirmed_transaction"
            }
            GuardViolation::NotTradeParty => "not_trade_party",
            GuardViolation::AlreadyConfirmed => "already_confirmed",
        }
    }

    /// Status hint for the API layer.
    pub fn status(&self) -> u16 {
        match self {
            GuardViolation::InvalidItem | GuardViolation::NoValidContactInfo => 404,
            GuardViolation::ProcessingTransactionExists
            | GuardViolation::DuplicatedTransaction
            | GuardViolation::TransactionNotPending
            | GuardViolation::TransactionNotProcessing
            | GuardViolation::TransactionClosed
            | GuardViolation::CouldNotCancelConfirmedTransaction
            | GuardViolation::AlreadyConfirmed => 409,
            GuardViolation::ProcessingTransactionLimitExceeded { .. }
            | GuardViolation::IdenticalSellerBuyer => 400,
            GuardViolation::NotSeller | GuardViolation::NotTradeParty => 403,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum TradeError {
    #[error(transparent)]
    Guard(#[from] GuardViolation),
    #[error(transparent)]
    Authz(#[from] AuthzError),
    #[error("guest actors can not take part in trades")]
    AnonymousActor,
    #[error("could not determine a cancel reason for `{actor}` on trade `{trade_id}`")]
    UndeterminedCancelReason { trade_id: String, actor: String },
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },
    #[error("storage failure")]
    Store(#[from] sled::Error),
    #[error("failed to decode record")]
    Decode(#[from] minicbor::decode::Error),
    #[error("failed to encode record: {0}")]
    Encode(String),
}

impl TradeError {
    pub fn name(&self) -> &'static str {
        match self {
            TradeError::Guard(violation) => violation.name(),
            TradeError::Authz(err) => err.name(),
            TradeError::AnonymousActor => "anonymous_actor",
            TradeError::UndeterminedCancelReason { .. } => "could_not_determine_cancel_reason",
            TradeError::NotFound { .. } => "no_result",
            TradeError::Store(_) | TradeError::Decode(_) | TradeError::Encode(_) => {
                "internal_error"
            }
        }
    }

    /// The guard violation behind this error, if any.
    pub fn violation(&self) -> Option<&GuardViolation> {
        match self {
            TradeError::Guard(violation) => Some(violation),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error("operation interrupted by handler `{handler}` at {checkpoint}: {reason}")]
    Interrupted {
        checkpoint: &'static str,
        handler: String,
        reason: String,
    },
    #[error("handler `{handler}` failed at {checkpoint}")]
    HandlerFailed {
        checkpoint: &'static str,
        handler: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("handler `{0}` is already registered at this checkpoint")]
    DuplicateHandler(String),
    #[error("handler `{0}` is not registered at this checkpoint")]
    HandlerNotFound(String),
}

impl PipelineError {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineError::Interrupted { .. } => "operation_interrupted",
            PipelineError::HandlerFailed { .. } => "handler_failed",
            PipelineError::DuplicateHandler(_) => "duplicate_handler",
            PipelineError::HandlerNotFound(_) => "handler_not_found",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum NotifyError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("notification content is empty")]
    InvalidContent,
    #[error("notification has no receiver")]
    InvalidReceiver,
    #[error("an untrusted sender can not send on behalf of the system")]
    SenderNotTrusted,
    #[error("sent and received can not both be false")]
    ParamError,
    #[error("user `{user}` may not read notification `{id}`")]
    PermissionRequired { id: String, user: String },
    #[error(transparent)]
    Trade(#[from] TradeError),
}

impl NotifyError {
    pub fn name(&self) -> &'static str {
        match self {
            NotifyError::Pipeline(err) => err.name(),
            NotifyError::InvalidContent => "invalid_content",
            NotifyError::InvalidReceiver => "invalid_receiver",
            NotifyError::SenderNotTrusted => "sender_not_trusted",
            NotifyError::ParamError => "param_error",
            NotifyError::PermissionRequired { .. } => "permission_required",
            NotifyError::Trade(err) => err.name(),
        }
    }
}
