use thiserror::Error;

use crate::types::{TxnId, TxnState};

/// Convenience alias for `Result<T, KestrelError>`.
pub type KestrelResult<T> = Result<T, KestrelError>;

/// Wire-level status taxonomy. Every response carries one of these; the
/// classification drives client retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Status {
    Ok,
    Created,
    NotFound,
    BadParameter,
    AbortConflict,
    AbortRequestTooOld,
    RefreshCollection,
    OperationNotAllowed,
    ServiceUnavailable,
    RequestTimeout,
    InternalError,
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok | Status::Created)
    }
}

/// Error classification for retry/escalation decisions.
///
/// - `UserError`    — malformed request shape; permanent for this request
/// - `SiAbort`      — snapshot-isolation conflict; the whole txn must abort
/// - `Retryable`    — stale partition map or unassigned partition; refresh + reissue
/// - `Transient`    — deadline expiry / backpressure; client MAY retry after back-off
/// - `InternalBug`  — invariant violation; fatal for the partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    SiAbort,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type for the transaction core and its clients.
#[derive(Error, Debug)]
pub enum KestrelError {
    #[error("Bad parameter: {0}")]
    BadParameter(String),

    #[error("Key not found")]
    KeyNotFound,

    #[error("Schema not known: {name} v{version}")]
    SchemaNotFound { name: String, version: u32 },

    #[error("Operation not allowed: {0}")]
    OperationNotAllowed(String),

    #[error("Transaction {0} conflict: lost push arbitration")]
    AbortConflict(TxnId),

    #[error("Request too old: {0}")]
    AbortRequestTooOld(String),

    #[error("Collection {0} partition map is stale; refresh from the CPO")]
    RefreshCollection(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Deadline exceeded: {0}")]
    RequestTimeout(String),

    #[error("Transaction {txn_id} invalid state transition: {from} → {to}")]
    InvalidTransition {
        txn_id: TxnId,
        from: TxnState,
        to: TxnState,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invariant violation — should never occur; fatal for the partition.
    #[error("Internal [{error_code}]: {message}")]
    Internal {
        error_code: &'static str,
        message: String,
    },
}

impl KestrelError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            KestrelError::BadParameter(_)
            | KestrelError::KeyNotFound
            | KestrelError::SchemaNotFound { .. }
            | KestrelError::OperationNotAllowed(_) => ErrorKind::UserError,

            KestrelError::AbortConflict(_) | KestrelError::AbortRequestTooOld(_) => {
                ErrorKind::SiAbort
            }

            KestrelError::RefreshCollection(_) | KestrelError::ServiceUnavailable(_) => {
                ErrorKind::Retryable
            }

            KestrelError::RequestTimeout(_) => ErrorKind::Transient,

            KestrelError::InvalidTransition { .. }
            | KestrelError::Io(_)
            | KestrelError::Serialization(_)
            | KestrelError::Internal { .. } => ErrorKind::InternalBug,
        }
    }

    /// The wire status this error maps to.
    pub fn status(&self) -> Status {
        match self {
            KestrelError::BadParameter(_) => Status::BadParameter,
            KestrelError::KeyNotFound => Status::NotFound,
            KestrelError::SchemaNotFound { .. } | KestrelError::OperationNotAllowed(_) => {
                Status::OperationNotAllowed
            }
            KestrelError::AbortConflict(_) => Status::AbortConflict,
            KestrelError::AbortRequestTooOld(_) => Status::AbortRequestTooOld,
            KestrelError::RefreshCollection(_) => Status::RefreshCollection,
            KestrelError::ServiceUnavailable(_) => Status::ServiceUnavailable,
            KestrelError::RequestTimeout(_) => Status::RequestTimeout,
            KestrelError::InvalidTransition { .. }
            | KestrelError::Io(_)
            | KestrelError::Serialization(_)
            | KestrelError::Internal { .. } => Status::InternalError,
        }
    }

    /// Returns true when the client should refresh routing state and reissue.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    /// Returns true when the whole transaction must be aborted.
    pub fn is_si_abort(&self) -> bool {
        matches!(self.kind(), ErrorKind::SiAbort)
    }

    /// Construct an internal-bug error with a stable code.
    pub fn internal(error_code: &'static str, message: impl Into<String>) -> Self {
        KestrelError::Internal {
            error_code,
            message: message.into(),
        }
    }

    /// Emit a structured log entry for fatal errors. Called before a fatal
    /// error is surfaced to the dispatch layer.
    pub fn log_if_fatal(&self) {
        if self.kind() == ErrorKind::InternalBug {
            tracing::error!(error = %self, "fatal partition error");
        }
    }
}
