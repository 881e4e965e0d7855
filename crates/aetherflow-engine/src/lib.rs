//! Flow validation and execution engine for AetherFlow.
//!
//! The engine parses a declarative flow document, validates it, resolves
//! all templated values through a single strict resolver, executes jobs and
//! steps sequentially against resolved connector handles, persists per-step
//! outcomes in a durable state store, and resumes deterministically on
//! rerun with the same run identifier.

pub mod bundle;
pub mod connectors;
pub mod context;
pub mod envfiles;
pub mod observer;
pub mod registry;
pub mod resolver;
pub mod resources;
pub mod runner;
pub mod secrets;
pub mod settings;
pub mod spec;
pub mod steps;
pub mod when;

pub use connectors::{Connector, Connectors};
pub use context::{new_run_id, RunContext};
pub use observer::{MetricsSink, RunObserver};
pub use registry::{ConnectorRegistry, StepRegistry};
pub use runner::{Engine, EngineBuilder, RunOptions};
pub use secrets::SecretsHook;
pub use settings::Settings;
pub use spec::validator::{ValidationIssue, ValidationReport};
pub use steps::{Step, StepExec, StepInit, StepOutcome};
