//! Name-keyed registries for steps and connectors.
//!
//! Steps are keyed by their `type` string, connectors by `(kind, driver)`.
//! New kinds are added by registering a constructor at startup; the core
//! never hard-codes a concrete driver. Registries are explicit values owned
//! by the engine, not process globals.

use std::collections::HashMap;
use std::sync::Arc;

use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::flow::ConfigMap;

use crate::connectors::Connector;
use crate::steps::{self, Step, StepInit};

/// Constructor for a step instance from its rendered inputs.
pub type StepFactory = Box<dyn Fn(StepInit) -> Result<Box<dyn Step>> + Send + Sync>;

pub struct StepRegistry {
    factories: HashMap<String, StepFactory>,
}

impl StepRegistry {
    /// Empty registry (no built-ins).
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in steps.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("with_lock", |init| {
            steps::lock::WithLock::from_init(init).map(|s| Box::new(s) as Box<dyn Step>)
        });
        registry.register("external.process", |init| {
            steps::process::ExternalProcess::from_init(init).map(|s| Box::new(s) as Box<dyn Step>)
        });
        registry
    }

    /// Register (or replace) a step constructor under `step_type`.
    pub fn register<F>(&mut self, step_type: &str, factory: F)
    where
        F: Fn(StepInit) -> Result<Box<dyn Step>> + Send + Sync + 'static,
    {
        self.factories
            .insert(step_type.to_string(), Box::new(factory));
    }

    #[must_use]
    pub fn contains(&self, step_type: &str) -> bool {
        self.factories.contains_key(step_type)
    }

    /// Registered step types, sorted for stable diagnostics.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Construct a step instance for `step_type`.
    ///
    /// # Errors
    ///
    /// Fails with a spec error for unknown types, or with the factory's
    /// own error for invalid inputs.
    pub fn create(&self, step_type: &str, init: StepInit) -> Result<Box<dyn Step>> {
        let factory = self.factories.get(step_type).ok_or_else(|| {
            FlowError::Spec(format!(
                "Unknown step type: {step_type}. Loaded: {:?}",
                self.names()
            ))
        })?;
        factory(init)
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Everything a connector constructor receives.
pub struct ConnectorInit {
    pub name: String,
    pub kind: String,
    pub driver: String,
    pub config: ConfigMap,
    pub options: ConfigMap,
}

/// Constructor for a connector handle from its resolved resource.
pub type ConnectorFactory = Box<dyn Fn(&ConnectorInit) -> Result<Arc<dyn Connector>> + Send + Sync>;

#[derive(Default)]
pub struct ConnectorRegistry {
    factories: HashMap<(String, String), ConnectorFactory>,
}

impl ConnectorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a connector constructor under `(kind, driver)`.
    pub fn register<F>(&mut self, kind: &str, driver: &str, factory: F)
    where
        F: Fn(&ConnectorInit) -> Result<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        self.factories
            .insert((kind.to_string(), driver.to_string()), Box::new(factory));
    }

    #[must_use]
    pub fn contains(&self, kind: &str, driver: &str) -> bool {
        self.factories
            .contains_key(&(kind.to_string(), driver.to_string()))
    }

    /// Construct a connector for a resolved resource.
    ///
    /// # Errors
    ///
    /// Fails with a connector error for unknown `(kind, driver)` pairs, or
    /// with the factory's own error.
    pub fn create(&self, init: &ConnectorInit) -> Result<Arc<dyn Connector>> {
        let factory = self
            .factories
            .get(&(init.kind.clone(), init.driver.clone()))
            .ok_or_else(|| {
                FlowError::Connector(format!(
                    "No connector registered for kind={} driver={}",
                    init.kind, init.driver
                ))
            })?;
        factory(init)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aetherflow_types::error::Result;
    use aetherflow_types::state::StepStatus;
    use crate::steps::{StepExec, StepOutcome};

    struct Noop;

    impl Step for Noop {
        fn run(&self, _exec: &StepExec<'_>) -> Result<StepOutcome> {
            Ok(StepOutcome::success(ConfigMap::new()))
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = StepRegistry::with_builtins();
        assert!(registry.contains("with_lock"));
        assert!(registry.contains("external.process"));
        assert_eq!(registry.names(), vec!["external.process", "with_lock"]);
    }

    #[test]
    fn unknown_step_type_lists_loaded() {
        let registry = StepRegistry::with_builtins();
        let init = StepInit {
            id: "s".into(),
            inputs: ConfigMap::new(),
        };
        let err = registry.create("no.such.step", init).unwrap_err();
        assert!(err.to_string().contains("no.such.step"));
        assert!(err.to_string().contains("external.process"));
    }

    #[test]
    fn custom_step_registers_and_constructs() {
        let mut registry = StepRegistry::new();
        registry.register("noop", |_init| Ok(Box::new(Noop) as Box<dyn Step>));
        assert!(registry.contains("noop"));
        let step = registry
            .create(
                "noop",
                StepInit {
                    id: "s".into(),
                    inputs: ConfigMap::new(),
                },
            )
            .unwrap();
        let _ = step; // constructed fine
        let _ = StepStatus::Success;
    }

    #[test]
    fn connector_registry_keyed_by_kind_and_driver() {
        struct Null;
        impl Connector for Null {
            fn kind(&self) -> &str {
                "db"
            }
        }

        let mut registry = ConnectorRegistry::new();
        registry.register("db", "sqlite", |_init| Ok(Arc::new(Null)));

        assert!(registry.contains("db", "sqlite"));
        assert!(!registry.contains("db", "postgres"));

        let init = ConnectorInit {
            name: "db_main".into(),
            kind: "db".into(),
            driver: "postgres".into(),
            config: ConfigMap::new(),
            options: ConfigMap::new(),
        };
        let err = registry.create(&init).unwrap_err();
        assert!(err.to_string().contains("kind=db driver=postgres"));
    }
}
