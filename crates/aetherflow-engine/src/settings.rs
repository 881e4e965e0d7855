//! Engine settings derived from the run's env snapshot.
//!
//! An explicit value passed into the runner; nothing here reads ambient
//! process state, which keeps runs deterministic and testable.

use std::collections::BTreeMap;
use std::path::PathBuf;

use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::manifest::RunMode;

/// Connector handle caching scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Cache within a single flow run (default).
    Run,
    /// Reuse across runs in the same process (pooled engines).
    Process,
    /// Construct fresh on every access.
    None,
}

impl CachePolicy {
    /// Parse a policy string; unknown values fall back to `Run`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "process" => Self::Process,
            "none" => Self::None,
            _ => Self::Run,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub work_root: PathBuf,
    pub state_root: PathBuf,
    pub mode: RunMode,
    pub strict_templates: bool,
    pub validate_env_strict: bool,
    pub log_format: LogFormat,
    pub log_level: String,
    pub connector_cache_default: CachePolicy,
    pub profiles_file: Option<PathBuf>,
    pub profiles_json: Option<String>,
    pub plugin_paths: Vec<PathBuf>,
    /// Secrets hook source advertised by the environment. Hooks are code,
    /// so the embedder must still install one on the engine; these fields
    /// exist so a misconfigured deployment is diagnosable.
    pub secrets_module: Option<String>,
    pub secrets_path: Option<PathBuf>,
}

fn env_bool(env: &BTreeMap<String, String>, key: &str, default: bool) -> bool {
    env.get(key)
        .map_or(default, |v| v.trim().eq_ignore_ascii_case("true"))
}

impl Settings {
    /// Build settings from an explicit env snapshot.
    ///
    /// # Errors
    ///
    /// Fails when both `AETHERFLOW_PROFILES_FILE` and
    /// `AETHERFLOW_PROFILES_JSON` are set.
    pub fn from_env(env: &BTreeMap<String, String>) -> Result<Self> {
        let profiles_file = env
            .get("AETHERFLOW_PROFILES_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        let profiles_json = env
            .get("AETHERFLOW_PROFILES_JSON")
            .filter(|v| !v.trim().is_empty())
            .cloned();
        if profiles_file.is_some() && profiles_json.is_some() {
            return Err(FlowError::Spec(
                "Set only one of AETHERFLOW_PROFILES_JSON or AETHERFLOW_PROFILES_FILE".to_string(),
            ));
        }

        let mode = env
            .get("AETHERFLOW_MODE")
            .map_or(RunMode::InternalFast, |v| RunMode::parse(v));

        // Plugin paths come from ambient env only outside enterprise mode;
        // the bundle layer strips the variable before this point otherwise.
        let plugin_paths = if mode == RunMode::Enterprise {
            Vec::new()
        } else {
            env.get("AETHERFLOW_PLUGIN_PATHS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|p| !p.is_empty())
                        .map(PathBuf::from)
                        .collect()
                })
                .unwrap_or_default()
        };

        Ok(Self {
            work_root: env
                .get("AETHERFLOW_WORK_ROOT")
                .map_or_else(|| PathBuf::from("/tmp/work"), PathBuf::from),
            state_root: env
                .get("AETHERFLOW_STATE_ROOT")
                .map_or_else(|| PathBuf::from("/tmp/state"), PathBuf::from),
            mode,
            strict_templates: env_bool(env, "AETHERFLOW_STRICT_TEMPLATES", true),
            validate_env_strict: env_bool(env, "AETHERFLOW_VALIDATE_ENV_STRICT", false),
            log_format: match env.get("AETHERFLOW_LOG_FORMAT").map(String::as_str) {
                Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            log_level: env
                .get("AETHERFLOW_LOG_LEVEL")
                .cloned()
                .unwrap_or_else(|| "info".to_string()),
            connector_cache_default: env
                .get("AETHERFLOW_CONNECTOR_CACHE_DEFAULT")
                .map_or(CachePolicy::Run, |v| CachePolicy::parse(v)),
            profiles_file,
            profiles_json,
            plugin_paths,
            secrets_module: env
                .get("AETHERFLOW_SECRETS_MODULE")
                .filter(|v| !v.trim().is_empty())
                .cloned(),
            secrets_path: env
                .get("AETHERFLOW_SECRETS_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_env(&BTreeMap::new()).expect("defaults never conflict")
    }
}
