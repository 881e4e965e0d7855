//! Shared AetherFlow spec, state, and error model types.
//!
//! Pure data types used across the engine, state store, and CLI crates.
//! No I/O lives here.

#![warn(clippy::pedantic)]

pub mod envfile;
pub mod error;
pub mod flow;
pub mod manifest;
pub mod state;
pub mod summary;

pub use envfile::{EnvFileKind, EnvFileSpec};
pub use error::FlowError;
pub use flow::{
    CleanupPolicy, FlowMeta, FlowSpec, JobSpec, LockScope, OnNoData, ProfileSpec, ResourceSpec,
    StepSpec,
};
pub use manifest::{BundleManifest, RunMode};
pub use state::{JobStatus, StepStatus};
pub use summary::{JobSummary, RunSummary, StepSummary};
