//! `with_lock`: run an inner step under a keyed TTL mutex.
//!
//! Acquisition is non-blocking: contention fails the job fast and the
//! caller (typically a scheduler) retries later. Release is guaranteed on
//! normal, error, and panic exits via a drop guard; a lock left behind by a
//! dead process expires with its TTL.

use serde_json::Value;

use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::flow::ConfigMap;

use crate::context::RunContext;
use crate::steps::{input_str, input_u64, Step, StepExec, StepInit, StepOutcome};

const DEFAULT_TTL_SECONDS: u64 = 600;

#[derive(Debug)]
pub struct WithLock {
    id: String,
    lock_key: String,
    ttl_seconds: u64,
    inner_type: String,
    inner_id: String,
    inner_inputs: ConfigMap,
}

impl WithLock {
    /// Parse `with_lock` inputs.
    ///
    /// # Errors
    ///
    /// Fails when `lock_key` is missing/empty or `step` is not an inline
    /// step spec with a `type`.
    pub fn from_init(init: StepInit) -> Result<Self> {
        let lock_key = input_str(&init.inputs, "lock_key")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                FlowError::Step(format!(
                    "with_lock step '{}' requires a non-empty lock_key",
                    init.id
                ))
            })?;
        let ttl_seconds = input_u64(&init.inputs, "ttl_seconds").unwrap_or(DEFAULT_TTL_SECONDS);

        let Some(Value::Object(inner)) = init.inputs.get("step") else {
            return Err(FlowError::Step(format!(
                "with_lock step '{}' requires an inline step spec",
                init.id
            )));
        };
        let inner_type = input_str(inner, "type").ok_or_else(|| {
            FlowError::Step(format!(
                "with_lock step '{}' inner step needs a type",
                init.id
            ))
        })?;
        let inner_id = input_str(inner, "id").unwrap_or_else(|| format!("{}_inner", init.id));
        let inner_inputs = match inner.get("inputs") {
            Some(Value::Object(map)) => map.clone(),
            None | Some(Value::Null) => ConfigMap::new(),
            Some(other) => {
                return Err(FlowError::Step(format!(
                    "with_lock inner step inputs must be a mapping, got {other}"
                )))
            }
        };

        Ok(Self {
            id: init.id,
            lock_key,
            ttl_seconds,
            inner_type,
            inner_id,
            inner_inputs,
        })
    }
}

/// Releases the lock when dropped, covering error and panic exits.
struct ReleaseGuard<'a> {
    ctx: &'a RunContext,
    key: &'a str,
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.ctx.release_lock(self.key) {
            tracing::warn!(lock_key = %self.key, error = %err, "lock release failed");
        }
    }
}

impl Step for WithLock {
    fn run(&self, exec: &StepExec<'_>) -> Result<StepOutcome> {
        if !exec.ctx.acquire_lock(&self.lock_key, self.ttl_seconds)? {
            return Err(FlowError::LockNotAcquired(self.lock_key.clone()));
        }
        let _guard = ReleaseGuard {
            ctx: exec.ctx,
            key: &self.lock_key,
        };
        tracing::debug!(step_id = %self.id, lock_key = %self.lock_key, "lock acquired");

        let inner = exec.steps.create(
            &self.inner_type,
            StepInit {
                id: self.inner_id.clone(),
                inputs: self.inner_inputs.clone(),
            },
        )?;
        let inner_exec = StepExec {
            ctx: exec.ctx,
            job_id: exec.job_id,
            step_id: &self.inner_id,
            steps: exec.steps,
        };
        inner.run(&inner_exec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use aetherflow_state::{SqliteStateStore, StateStore};
    use serde_json::json;

    use crate::connectors::Connectors;
    use crate::registry::{ConnectorRegistry, StepRegistry};
    use crate::settings::{CachePolicy, Settings};

    fn test_ctx(state: Arc<dyn StateStore>, run_id: &str) -> RunContext {
        let tmp = tempfile::tempdir().unwrap();
        RunContext {
            settings: Settings::default(),
            flow_id: "f".into(),
            run_id: run_id.into(),
            env: BTreeMap::new(),
            work_root: tmp.into_path(),
            layout: BTreeMap::new(),
            state,
            connectors: Connectors::new(
                Arc::new(ConnectorRegistry::new()),
                BTreeMap::new(),
                CachePolicy::Run,
            ),
        }
    }

    fn registry_with(name: &str, outcome: fn() -> Result<StepOutcome>) -> StepRegistry {
        struct Fixed(fn() -> Result<StepOutcome>);
        impl Step for Fixed {
            fn run(&self, _exec: &StepExec<'_>) -> Result<StepOutcome> {
                (self.0)()
            }
        }
        let mut registry = StepRegistry::new();
        registry.register(name, move |_init| Ok(Box::new(Fixed(outcome)) as Box<dyn Step>));
        registry
    }

    fn with_lock(key: &str, inner_type: &str) -> WithLock {
        WithLock::from_init(StepInit {
            id: "locked".into(),
            inputs: json!({
                "lock_key": key,
                "ttl_seconds": 60,
                "step": {"type": inner_type},
            })
            .as_object()
            .cloned()
            .unwrap(),
        })
        .unwrap()
    }

    #[test]
    fn inner_result_passes_through() {
        let state: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
        let ctx = test_ctx(Arc::clone(&state), "run-a");
        let registry = registry_with("inner.ok", || {
            let mut out = ConfigMap::new();
            out.insert("rows".into(), json!(3));
            Ok(StepOutcome::success(out))
        });

        let step = with_lock("K", "inner.ok");
        let exec = StepExec {
            ctx: &ctx,
            job_id: "j",
            step_id: "locked",
            steps: &registry,
        };
        let out = step.run(&exec).unwrap();
        assert_eq!(out.outputs["rows"], 3);

        // Lock was released: another owner can take it.
        assert!(state.try_acquire_lock("K", "other", 60).unwrap());
    }

    #[test]
    fn contention_raises_lock_not_acquired() {
        let state: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
        state.try_acquire_lock("K", "someone-else", 600).unwrap();

        let ctx = test_ctx(Arc::clone(&state), "run-a");
        let registry = registry_with("inner.ok", || Ok(StepOutcome::success(ConfigMap::new())));
        let step = with_lock("K", "inner.ok");
        let exec = StepExec {
            ctx: &ctx,
            job_id: "j",
            step_id: "locked",
            steps: &registry,
        };
        let err = step.run(&exec).unwrap_err();
        assert!(matches!(err, FlowError::LockNotAcquired(ref k) if k == "K"));
    }

    #[test]
    fn lock_released_when_inner_fails() {
        let state: Arc<dyn StateStore> = Arc::new(SqliteStateStore::in_memory().unwrap());
        let ctx = test_ctx(Arc::clone(&state), "run-a");
        let registry = registry_with("inner.boom", || Err(FlowError::Step("boom".into())));

        let step = with_lock("K", "inner.boom");
        let exec = StepExec {
            ctx: &ctx,
            job_id: "j",
            step_id: "locked",
            steps: &registry,
        };
        assert!(step.run(&exec).is_err());
        assert!(state.try_acquire_lock("K", "other", 60).unwrap());
    }

    #[test]
    fn missing_lock_key_rejected_at_construction() {
        let err = WithLock::from_init(StepInit {
            id: "s".into(),
            inputs: json!({"step": {"type": "x"}}).as_object().cloned().unwrap(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("lock_key"));

        let err = WithLock::from_init(StepInit {
            id: "s".into(),
            inputs: json!({"lock_key": "K"}).as_object().cloned().unwrap(),
        })
        .unwrap_err();
        assert!(err.to_string().contains("inline step"));
    }
}
