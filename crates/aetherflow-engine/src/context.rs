//! Immutable per-run container for identifiers, env, connectors, and state.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use aetherflow_state::StateStore;
use aetherflow_types::error::Result;

use crate::connectors::Connectors;
use crate::settings::Settings;

/// Built at run start, immutable thereafter. Owns the connector accessor
/// and the state store handle; steps receive it by reference.
pub struct RunContext {
    pub settings: Settings,
    pub flow_id: String,
    pub run_id: String,
    pub env: BTreeMap<String, String>,
    pub work_root: PathBuf,
    pub layout: BTreeMap<String, String>,
    pub state: Arc<dyn StateStore>,
    pub connectors: Connectors,
}

impl RunContext {
    /// Per-job run directory: `<work_root>/<flow_id>/<job_id>/<run_id>`.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created.
    pub fn job_dir(&self, job_id: &str) -> Result<PathBuf> {
        let dir = self
            .work_root
            .join(&self.flow_id)
            .join(job_id)
            .join(&self.run_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn layout_dir(&self, job_id: &str, key: &str) -> Result<PathBuf> {
        let sub = self.layout.get(key).map_or(key, String::as_str);
        let dir = self.job_dir(job_id)?.join(sub);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Per-job artifacts directory; relative step paths resolve here.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created.
    pub fn artifacts_dir(&self, job_id: &str) -> Result<PathBuf> {
        self.layout_dir(job_id, "artifacts")
    }

    /// Per-job scratch directory.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created.
    pub fn scratch_dir(&self, job_id: &str) -> Result<PathBuf> {
        self.layout_dir(job_id, "scratch")
    }

    /// Per-job manifests directory.
    ///
    /// # Errors
    ///
    /// Fails when the directory cannot be created.
    pub fn manifests_dir(&self, job_id: &str) -> Result<PathBuf> {
        self.layout_dir(job_id, "manifests")
    }

    /// Acquire a keyed TTL lock owned by this run.
    ///
    /// # Errors
    ///
    /// Fails on state store errors; returns `Ok(false)` on contention.
    pub fn acquire_lock(&self, key: &str, ttl_seconds: u64) -> Result<bool> {
        Ok(self.state.try_acquire_lock(key, &self.run_id, ttl_seconds)?)
    }

    /// Release a lock owned by this run.
    ///
    /// # Errors
    ///
    /// Fails on state store errors.
    pub fn release_lock(&self, key: &str) -> Result<()> {
        Ok(self.state.release_lock(key, &self.run_id)?)
    }
}

/// Generate a short opaque run identifier.
#[must_use]
pub fn new_run_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}
