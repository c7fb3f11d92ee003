//! Error types for the accounting engine
//!
//! A declined charge or deposit is *not* an error: it is reported as `false`
//! in the operation's result. Everything in this module is a failure.

use thiserror::Error;

/// Result type for accounting operations
pub type Result<T> = std::result::Result<T, Error>;

/// Accounting errors
#[derive(Error, Debug)]
pub enum Error {
    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Product category is not in the catalog
    #[error("Unknown product category: {0}")]
    UnknownCategory(String),

    /// No wallet exists for the owner and category
    #[error("Wallet not found: {0}")]
    WalletNotFound(String),

    /// Allocation does not exist
    #[error("Allocation not found: {0}")]
    AllocationNotFound(String),

    /// Caller may not perform the operation
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Request conflicts with existing ledger state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The active processor could not be reached
    #[error("Leader unreachable: {0}")]
    LeaderUnreachable(String),

    /// The active processor answered with an unexpected response
    #[error("Forwarding error: {0}")]
    Forwarding(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the caller may retry with the same transaction id
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Storage(_) | Error::Concurrency(_) | Error::LeaderUnreachable(_)
        )
    }

    /// Whether the failure was caused by the request rather than the system
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::UnknownCategory(_)
                | Error::WalletNotFound(_)
                | Error::AllocationNotFound(_)
                | Error::Forbidden(_)
                | Error::Conflict(_)
                | Error::InvalidRequest(_)
        )
    }

    /// Stable machine-readable name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Storage(_) => "storage",
            Error::Serialization(_) => "serialization",
            Error::UnknownCategory(_) => "unknown_category",
            Error::WalletNotFound(_) => "wallet_not_found",
            Error::AllocationNotFound(_) => "allocation_not_found",
            Error::Forbidden(_) => "forbidden",
            Error::Conflict(_) => "conflict",
            Error::InvalidRequest(_) => "invalid_request",
            Error::LeaderUnreachable(_) => "leader_unreachable",
            Error::Forwarding(_) => "forwarding",
            Error::Concurrency(_) => "concurrency",
            Error::Config(_) => "config",
            Error::Io(_) => "io",
            Error::Other(_) => "other",
        }
    }

    /// Rebuild an error from its kind and message, as relayed by a leader
    pub fn from_kind(kind: &str, message: String) -> Self {
        match kind {
            "storage" => Error::Storage(message),
            "unknown_category" => Error::UnknownCategory(message),
            "wallet_not_found" => Error::WalletNotFound(message),
            "allocation_not_found" => Error::AllocationNotFound(message),
            "forbidden" => Error::Forbidden(message),
            "conflict" => Error::Conflict(message),
            "invalid_request" => Error::InvalidRequest(message),
            "leader_unreachable" => Error::LeaderUnreachable(message),
            "concurrency" => Error::Concurrency(message),
            _ => Error::Forwarding(message),
        }
    }
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            Error::LeaderUnreachable(err.to_string())
        } else {
            Error::Forwarding(err.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Storage("disk".into()).is_retryable());
        assert!(Error::LeaderUnreachable("timeout".into()).is_retryable());
        assert!(!Error::Conflict("dup".into()).is_retryable());
        assert!(!Error::WalletNotFound("w".into()).is_retryable());
    }

    #[test]
    fn test_kind_round_trip() {
        let err = Error::AllocationNotFound("42".into());
        let rebuilt = Error::from_kind(err.kind(), "42".into());
        assert!(matches!(rebuilt, Error::AllocationNotFound(ref id) if id == "42"));
        assert!(rebuilt.is_client_error());
    }
}
