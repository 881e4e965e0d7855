//! Error taxonomy for flow validation and execution.
//!
//! Kinds map one-to-one onto the runtime policy table: spec and resolver
//! errors abort before any job executes, step errors fail the owning job,
//! and lock/timeout errors surface as step errors the caller may retry.

/// Fixed prefix carried by every resolver syntax error.
pub const UNSUPPORTED_TEMPLATE_MSG: &str =
    "Unsupported templating syntax. Use {{VAR}} or {{VAR:DEFAULT}}";

/// Top-level error for flow validation and execution.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    /// Schema or semantic spec failure. Fails the run before any job.
    #[error("spec error: {0}")]
    Spec(String),

    /// Disallowed templating form. The message always starts with
    /// [`UNSUPPORTED_TEMPLATE_MSG`].
    #[error("{0}")]
    ResolverSyntax(String),

    /// Template PATH without a default did not resolve.
    #[error("missing template key: {0}")]
    ResolverMissingKey(String),

    /// Resource construction or credential decode failure.
    #[error("connector error: {0}")]
    Connector(String),

    /// Runtime failure raised by a step.
    #[error("step error: {0}")]
    Step(String),

    /// `with_lock` could not acquire its key; the caller retries later.
    #[error("lock not acquired: {0}")]
    LockNotAcquired(String),

    /// `external.process` exceeded its timeout budget.
    #[error("timeout: {0}")]
    Timeout(String),

    /// `external.process` success rules unmet after exit.
    #[error("outputs invalid: {0}")]
    OutputsInvalid(String),

    /// Required environment key absent at validation or startup.
    #[error("missing required environment: {0}")]
    MissingEnv(String),

    /// State store failure.
    #[error("state error: {0}")]
    State(String),

    /// Filesystem failure while managing the workspace.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowError {
    /// Build a resolver syntax error with the fixed message plus detail.
    #[must_use]
    pub fn template_syntax(detail: &str) -> Self {
        Self::ResolverSyntax(format!("{UNSUPPORTED_TEMPLATE_MSG}\n{detail}"))
    }

    /// CLI exit code contract: 0 success, 1 step/run failure, 2 spec or
    /// template validation failure, 3 missing required environment.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Spec(_) | Self::ResolverSyntax(_) | Self::ResolverMissingKey(_) => 2,
            Self::MissingEnv(_) => 3,
            _ => 1,
        }
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, FlowError>;
