//! Error and outcome types shared by every layer of the engine.
//!
//! Only [`StoreError`] is ever returned to callers as a failure. Remote
//! problems are carried inside [`WriteOutcome::LocalOnly`] so that callers can
//! inspect them without the operation itself failing.

use thiserror::Error;

/// Local durable store failure. Fatal to the operation that hit it.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    LockPoisoned,

    #[error("database is closed")]
    Closed,

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        StoreError::InvalidState(msg.into())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Cloud authority or LAN relay problem. Never surfaced as a user-facing error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    #[error("no remote transport configured")]
    NotConfigured,

    #[error("remote unavailable: {0}")]
    Unavailable(String),

    #[error("remote call timed out")]
    Timeout,

    #[error("remote rejected request (HTTP {status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("relay cooling down")]
    CoolingDown,

    #[error("invalid remote payload: {0}")]
    Decode(String),
}

/// A row that could not be mapped onto the local schema.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown table: {0}")]
    UnknownTable(String),

    #[error("{table}: missing field {field}")]
    MissingField { table: String, field: &'static str },

    #[error("{table}: invalid value for {field}: {value}")]
    InvalidValue {
        table: String,
        field: &'static str,
        value: String,
    },

    #[error("event is not an object")]
    NotAnObject,
}

/// Engine configuration or credential store problem. Only raised at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("credential store: {0}")]
    Credential(String),
}

/// Startup failure of [`crate::engine::SyncEngine::init`].
#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("transport setup: {0}")]
    Transport(#[from] RemoteError),
}

/// Result of a mutating use case whose local write succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The cloud acknowledged every row; nothing is owed.
    Synced,
    /// Persisted locally only; rows stay `pending_sync` until replayed.
    LocalOnly(RemoteError),
}

impl WriteOutcome {
    pub fn is_synced(&self) -> bool {
        matches!(self, WriteOutcome::Synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_messages() {
        let err = StoreError::not_found("order", "ord-1");
        assert_eq!(err.to_string(), "order not found: ord-1");

        let err = StoreError::invalid("order ord-1 is closed");
        assert_eq!(err.to_string(), "invalid state: order ord-1 is closed");
    }

    #[test]
    fn test_write_outcome_is_synced() {
        assert!(WriteOutcome::Synced.is_synced());
        assert!(!WriteOutcome::LocalOnly(RemoteError::Timeout).is_synced());
    }
}
