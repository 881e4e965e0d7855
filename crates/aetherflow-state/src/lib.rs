//! Run state persistence for the AetherFlow engine.
//!
//! Provides the [`StateStore`] trait and the canonical SQLite
//! implementation covering the three durable record kinds: job runs, step
//! runs, and TTL locks.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod sqlite;

pub use backend::StateStore;
pub use error::StateError;
pub use sqlite::SqliteStateStore;

/// Common imports for typical usage.
pub mod prelude {
    pub use crate::backend::StateStore;
    pub use crate::error::{Result, StateError};
    pub use crate::sqlite::SqliteStateStore;
    pub use aetherflow_types::state::{JobStatus, StepStatus};
}

#[cfg(test)]
mod tests {
    #[test]
    fn prelude_re_exports_key_types() {
        use super::prelude::*;
        let store = SqliteStateStore::in_memory().unwrap();
        let _: &dyn StateStore = &store;
        let _status = JobStatus::Success;
        let _step = StepStatus::Skipped;
        let _err: Option<StateError> = None;
    }
}
