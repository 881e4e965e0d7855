//! Bundle manifest model.
//!
//! A bundle is a fingerprinted collection of flows/profiles/plugins plus
//! env-file defaults. Fetching remote bundles is an external concern; the
//! engine consumes an already-local bundle root.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::envfile::EnvFileSpec;

/// Deployment mode. Enterprise tightens plugin and archive-driver policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    InternalFast,
    Enterprise,
}

impl Default for RunMode {
    fn default() -> Self {
        Self::InternalFast
    }
}

impl RunMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InternalFast => "internal_fast",
            Self::Enterprise => "enterprise",
        }
    }

    /// Parse a mode string; anything unrecognized falls back to the default.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "enterprise" => Self::Enterprise,
            _ => Self::InternalFast,
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the bundle content comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleSourceType {
    Local,
    Git,
    Archive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleSource {
    #[serde(rename = "type")]
    pub source_type: BundleSourceType,
    /// Filesystem path (local), repository URL (git), or archive path.
    pub location: String,
}

/// Relative paths inside the bundle root.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleLayout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flows: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleSpec {
    pub source: BundleSource,
    #[serde(default)]
    pub layout: BundleLayout,
}

/// Trusted paths configured by the manifest (enterprise deployments load
/// plugins only from here, never from ambient env vars).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundlePaths {
    #[serde(default)]
    pub plugins: Vec<String>,
}

/// Root bundle manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BundleManifest {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub mode: RunMode,
    pub bundle: BundleSpec,
    #[serde(default)]
    pub paths: BundlePaths,
    /// Archive-driver allowlist enforced in enterprise mode.
    #[serde(default)]
    pub zip_drivers: BTreeSet<String>,
    /// Env-file defaults, resolved relative to the bundle root, applied
    /// after the external env-file list.
    #[serde(default)]
    pub env_files: Vec<EnvFileSpec>,
}

fn default_version() -> u32 {
    1
}
