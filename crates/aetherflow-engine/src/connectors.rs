//! Connector handles and the caching accessor.
//!
//! A connector is a thin, stateful handle around an external driver.
//! Handles are shared within a run; the optional process-wide cache reuses
//! them across runs in the same process for pooled engines. Closing is
//! best-effort at run end.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, LazyLock, Mutex};

use serde_json::Value;

use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::flow::ConfigMap;

use crate::registry::{ConnectorInit, ConnectorRegistry};
use crate::settings::CachePolicy;

/// A thin, stateful handle around an external driver.
///
/// Drivers must be safe for sequential use within a run or internally
/// serialize.
pub trait Connector: Send + Sync {
    /// Connector kind, e.g. `db`, `sftp`, `rest`.
    fn kind(&self) -> &str;

    /// Release driver-level session state. Best-effort; errors are logged
    /// by the caller.
    fn close(&self) {}
}

impl std::fmt::Debug for dyn Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector").field("kind", &self.kind()).finish()
    }
}

/// A resource after profile overlay, env expansion, and decode.
#[derive(Debug, Clone)]
pub struct ResolvedResource {
    pub kind: String,
    pub driver: String,
    pub config: ConfigMap,
    pub options: ConfigMap,
}

impl ResolvedResource {
    /// Cache policy requested by the resource itself, if any.
    fn cache_override(&self) -> Option<CachePolicy> {
        self.options
            .get("cache")
            .and_then(Value::as_str)
            .map(CachePolicy::parse)
    }
}

/// Process-wide cache for connectors (opt-in via `cache: process`).
static PROCESS_CACHE: LazyLock<Mutex<HashMap<(String, String, u64), Arc<dyn Connector>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

fn config_fingerprint(resource: &ResolvedResource) -> u64 {
    let mut hasher = DefaultHasher::new();
    Value::Object(resource.config.clone()).to_string().hash(&mut hasher);
    Value::Object(resource.options.clone()).to_string().hash(&mut hasher);
    hasher.finish()
}

/// Connector accessor with caching and per-resource policy resolution.
///
/// Policy resolution order: resource `options.cache`, then the settings
/// default.
pub struct Connectors {
    registry: Arc<ConnectorRegistry>,
    resources: BTreeMap<String, ResolvedResource>,
    default_policy: CachePolicy,
    run_cache: Mutex<HashMap<String, Arc<dyn Connector>>>,
}

impl Connectors {
    #[must_use]
    pub fn new(
        registry: Arc<ConnectorRegistry>,
        resources: BTreeMap<String, ResolvedResource>,
        default_policy: CachePolicy,
    ) -> Self {
        Self {
            registry,
            resources,
            default_policy,
            run_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Declared resource names, in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.resources.keys().map(String::as_str).collect()
    }

    fn build(&self, name: &str, resource: &ResolvedResource) -> Result<Arc<dyn Connector>> {
        let init = ConnectorInit {
            name: name.to_string(),
            kind: resource.kind.clone(),
            driver: resource.driver.clone(),
            config: resource.config.clone(),
            options: resource.options.clone(),
        };
        self.registry.create(&init)
    }

    /// Fetch (and cache, per policy) the connector for a resource name.
    ///
    /// # Errors
    ///
    /// Fails for unknown resource names or when construction fails.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Connector>> {
        let resource = self.resources.get(name).ok_or_else(|| {
            FlowError::Connector(format!(
                "Unknown resource: {name}. Known: {:?}",
                self.names()
            ))
        })?;

        let policy = resource.cache_override().unwrap_or(self.default_policy);
        match policy {
            CachePolicy::None => self.build(name, resource),
            CachePolicy::Process => {
                let key = (
                    resource.kind.clone(),
                    resource.driver.clone(),
                    config_fingerprint(resource),
                );
                let mut cache = PROCESS_CACHE
                    .lock()
                    .map_err(|_| FlowError::Connector("process cache poisoned".to_string()))?;
                if let Some(handle) = cache.get(&key) {
                    return Ok(Arc::clone(handle));
                }
                let handle = self.build(name, resource)?;
                cache.insert(key, Arc::clone(&handle));
                Ok(handle)
            }
            CachePolicy::Run => {
                let mut cache = self
                    .run_cache
                    .lock()
                    .map_err(|_| FlowError::Connector("run cache poisoned".to_string()))?;
                if let Some(handle) = cache.get(name) {
                    return Ok(Arc::clone(handle));
                }
                let handle = self.build(name, resource)?;
                cache.insert(name.to_string(), Arc::clone(&handle));
                Ok(handle)
            }
        }
    }

    /// Close run-scoped connectors. Process-scoped handles remain alive.
    pub fn close_all(&self) {
        let Ok(mut cache) = self.run_cache.lock() else {
            return;
        };
        for (name, handle) in cache.drain() {
            tracing::debug!(resource = %name, "closing connector");
            handle.close();
        }
    }
}
