use thiserror::Error;

/// Broad error classes surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Illegal state transitions, unknown names, malformed input.
    ProtocolOrUsage,
    /// I/O or journal failures; fatal to the in-flight transaction.
    Durability,
    /// Address full or message too large.
    Capacity,
    /// Authentication and permission failures.
    Security,
    /// On-disk data that could not be decoded.
    Corruption,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("payload too large")]
    PayloadTooLarge,
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("component not started")]
    NotStarted,
    #[error("address does not exist: {0}")]
    AddressDoesNotExist(String),
    #[error("address full: {0}")]
    AddressFull(String),
    #[error("queue already exists: {0}")]
    QueueExists(String),
    #[error("queue does not exist: {0}")]
    QueueDoesNotExist(String),
    #[error("transaction not found: {0}")]
    TransactionNotFound(String),
    #[error("xid already exists: {0}")]
    XidExists(String),
    #[error("transaction marked rollback only: {0}")]
    RollbackOnly(String),
    #[error("invalid filter `{expression}`: {reason}")]
    InvalidFilter { expression: String, reason: String },
    #[error("security violation: {0}")]
    Security(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("journal write failed: {0}")]
    Journal(String),
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Io(_) | Error::Journal(_) => ErrorCategory::Durability,
            Error::Corrupt(_) => ErrorCategory::Corruption,
            Error::PayloadTooLarge | Error::AddressFull(_) => ErrorCategory::Capacity,
            Error::Security(_) => ErrorCategory::Security,
            Error::Unsupported(_)
            | Error::IllegalState(_)
            | Error::NotStarted
            | Error::AddressDoesNotExist(_)
            | Error::QueueExists(_)
            | Error::QueueDoesNotExist(_)
            | Error::TransactionNotFound(_)
            | Error::XidExists(_)
            | Error::RollbackOnly(_)
            | Error::InvalidFilter { .. }
            | Error::Config(_) => ErrorCategory::ProtocolOrUsage,
        }
    }

    pub(crate) fn illegal_state(msg: impl Into<String>) -> Self {
        Error::IllegalState(msg.into())
    }

    pub(crate) fn poisoned<T>(_: T) -> Self {
        Error::Corrupt("lock poisoned")
    }
}

pub type Result<T> = std::result::Result<T, Error>;
