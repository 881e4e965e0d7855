//! Step contract and built-in steps.
//!
//! A step is one unit of work, constructed by name through the step
//! registry from its rendered inputs. Steps return a status plus an output
//! mapping; `SKIPPED` is a first-class non-error outcome.

pub mod lock;
pub mod process;

use std::path::PathBuf;

use serde_json::Value;

use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::flow::ConfigMap;
use aetherflow_types::state::StepStatus;

use crate::context::RunContext;
use crate::registry::StepRegistry;

/// Rendered inputs handed to a step constructor.
pub struct StepInit {
    pub id: String,
    pub inputs: ConfigMap,
}

/// Structured step outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    pub outputs: ConfigMap,
}

impl StepOutcome {
    #[must_use]
    pub fn success(outputs: ConfigMap) -> Self {
        Self {
            status: StepStatus::Success,
            outputs,
        }
    }

    /// A skip outcome; `reason` lands in `outputs.reason` unless the step
    /// already set one.
    #[must_use]
    pub fn skipped(mut outputs: ConfigMap, reason: Option<&str>) -> Self {
        if let Some(reason) = reason {
            outputs
                .entry("reason".to_string())
                .or_insert_with(|| Value::String(reason.to_string()));
        }
        Self {
            status: StepStatus::Skipped,
            outputs,
        }
    }
}

/// Everything a running step may reach: the run context, its coordinates,
/// and the step registry (for composite steps that wrap an inner step).
pub struct StepExec<'a> {
    pub ctx: &'a RunContext,
    pub job_id: &'a str,
    pub step_id: &'a str,
    pub steps: &'a StepRegistry,
}

/// One unit of work invoked by the runner.
pub trait Step: Send + Sync {
    /// Execute the step. Any error fails the owning job.
    ///
    /// # Errors
    ///
    /// Step-specific; the runner records no step row for a failed step.
    fn run(&self, exec: &StepExec<'_>) -> Result<StepOutcome>;
}

impl std::fmt::Debug for dyn Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Step")
    }
}

/// Resolve a step path input: absolute paths pass through, relative paths
/// land in the job artifacts directory.
pub(crate) fn resolve_path(exec: &StepExec<'_>, path: &str) -> Result<PathBuf> {
    let p = PathBuf::from(path);
    if p.is_absolute() {
        Ok(p)
    } else {
        Ok(exec.ctx.artifacts_dir(exec.job_id)?.join(p))
    }
}

// ---------------------------------------------------------------------------
// Input accessors
// ---------------------------------------------------------------------------
//
// Rendered inputs may carry typed values (standalone tokens keep their
// type), so numeric and boolean accessors also accept string spellings.

pub(crate) fn input_str(inputs: &ConfigMap, key: &str) -> Option<String> {
    match inputs.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

pub(crate) fn input_bool(inputs: &ConfigMap, key: &str, default: bool) -> bool {
    match inputs.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
        _ => default,
    }
}

pub(crate) fn value_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn input_f64(inputs: &ConfigMap, key: &str) -> Option<f64> {
    inputs.get(key).and_then(value_f64)
}

pub(crate) fn value_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub(crate) fn input_i64(inputs: &ConfigMap, key: &str) -> Option<i64> {
    inputs.get(key).and_then(value_i64)
}

pub(crate) fn input_u64(inputs: &ConfigMap, key: &str) -> Option<u64> {
    input_i64(inputs, key).and_then(|n| u64::try_from(n).ok())
}

/// Coerce a scalar-or-list input to a string list. `None` and absent yield
/// an empty list; a lone scalar becomes a one-element list.
pub(crate) fn str_list(value: Option<&Value>) -> Result<Vec<String>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Number(n)) => Ok(vec![n.to_string()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| match v {
                Value::String(s) => Ok(s.clone()),
                Value::Number(n) => Ok(n.to_string()),
                Value::Bool(b) => Ok(b.to_string()),
                other => Err(FlowError::Step(format!(
                    "expected scalar list entry, got {other}"
                ))),
            })
            .collect(),
        Some(other) => Err(FlowError::Step(format!(
            "expected string or list, got {other}"
        ))),
    }
}

pub(crate) fn i64_list(value: Option<&Value>) -> Result<Vec<i64>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(single) if value_i64(single).is_some() => Ok(vec![value_i64(single).unwrap_or(0)]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                value_i64(v).ok_or_else(|| {
                    FlowError::Step(format!("expected integer list entry, got {v}"))
                })
            })
            .collect(),
        Some(other) => Err(FlowError::Step(format!(
            "expected integer or list, got {other}"
        ))),
    }
}
