//! Typed flow specification model.
//!
//! Mirrors the YAML/JSON flow document: flow metadata, resource
//! declarations, jobs, and steps. Unknown fields are rejected at
//! deserialization so schema drift surfaces as a spec error, not silent
//! acceptance.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mapping type shared by `config`, `options`, `decode`, `inputs`, and
/// `outputs` subtrees. YAML and JSON documents both land in this tree so the
/// template resolver can walk one shape.
pub type ConfigMap = serde_json::Map<String, Value>;

/// Workspace cleanup policy applied after each job ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupPolicy {
    /// Delete the per-job run directory only when the job succeeded.
    OnSuccess,
    /// Delete regardless of outcome.
    Always,
    /// Preserve everything.
    Never,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self::OnSuccess
    }
}

/// Default scope for implicit locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockScope {
    None,
    Job,
    Flow,
}

impl Default for LockScope {
    fn default() -> Self {
        Self::Job
    }
}

/// Per-flow workspace layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceSpec {
    /// Root directory for run artifacts. Templatable over `env.*`.
    #[serde(default = "default_work_root")]
    pub root: String,
    #[serde(default)]
    pub cleanup_policy: CleanupPolicy,
    /// Subdirectory names under each per-job run directory.
    #[serde(default = "default_layout")]
    pub layout: BTreeMap<String, String>,
}

fn default_work_root() -> String {
    "/tmp/work".to_string()
}

fn default_layout() -> BTreeMap<String, String> {
    [
        ("artifacts", "artifacts"),
        ("scratch", "scratch"),
        ("manifests", "manifests"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

impl Default for WorkspaceSpec {
    fn default() -> Self {
        Self {
            root: default_work_root(),
            cleanup_policy: CleanupPolicy::default(),
            layout: default_layout(),
        }
    }
}

/// State store backing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateSpec {
    #[serde(default = "default_state_backend")]
    pub backend: String,
    #[serde(default = "default_state_path")]
    pub path: String,
}

fn default_state_backend() -> String {
    "sqlite".to_string()
}

fn default_state_path() -> String {
    "/tmp/state/aetherflow.sqlite".to_string()
}

impl Default for StateSpec {
    fn default() -> Self {
        Self {
            backend: default_state_backend(),
            path: default_state_path(),
        }
    }
}

/// Flow-level lock defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocksSpec {
    #[serde(default)]
    pub scope: LockScope,
    #[serde(default = "default_lock_ttl")]
    pub ttl_seconds: u64,
}

fn default_lock_ttl() -> u64 {
    3600
}

impl Default for LocksSpec {
    fn default() -> Self {
        Self {
            scope: LockScope::default(),
            ttl_seconds: default_lock_ttl(),
        }
    }
}

/// Flow metadata block (`flow:` in the document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub workspace: WorkspaceSpec,
    #[serde(default)]
    pub state: StateSpec,
    #[serde(default)]
    pub locks: LocksSpec,
}

/// A named resource declaration that yields a connector handle.
///
/// `decode` mirrors `config`/`options` with boolean leaves marking fields
/// that must pass through the secrets decode hook. The path-list shapes
/// `config_paths`/`options_paths` are also accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceSpec {
    pub kind: String,
    pub driver: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub options: ConfigMap,
    #[serde(default)]
    pub decode: ConfigMap,
}

/// Profile fragment overlaid onto a matching [`ResourceSpec`] before
/// template expansion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileSpec {
    #[serde(default)]
    pub config: ConfigMap,
    #[serde(default)]
    pub options: ConfigMap,
    #[serde(default)]
    pub decode: ConfigMap,
}

/// A profiles file is a root mapping from profile name to fragment.
pub type ProfilesFile = BTreeMap<String, ProfileSpec>;

/// Runner reaction to a step reporting `SKIPPED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnNoData {
    /// Skip the remaining steps and end the job as `SKIPPED`.
    SkipJob,
}

/// One unit of work inside a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepSpec {
    pub id: String,
    /// Step registry key, e.g. `external.process`.
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default)]
    pub inputs: ConfigMap,
    /// Job-output promotions rendered after the step returns, with
    /// `result` in scope.
    #[serde(default)]
    pub outputs: ConfigMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_no_data: Option<OnNoData>,
}

/// An ordered sequence of steps; the unit of dependency and gating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Restricted boolean gate over `jobs.<id>.outputs.<key>` and `env.*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    pub steps: Vec<StepSpec>,
}

/// Root flow document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlowSpec {
    #[serde(default = "default_version")]
    pub version: u32,
    pub flow: FlowMeta,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceSpec>,
    pub jobs: Vec<JobSpec>,
}

fn default_version() -> u32 {
    1
}
