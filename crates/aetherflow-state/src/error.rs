//! State store error types.

use aetherflow_types::FlowError;

/// Errors produced by [`StateStore`](crate::StateStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("state store lock poisoned")]
    LockPoisoned,

    /// A stored status string did not parse back into a known status.
    #[error("unexpected status value: {0}")]
    InvalidStatus(String),
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

impl From<StateError> for FlowError {
    fn from(err: StateError) -> Self {
        FlowError::State(err.to_string())
    }
}
