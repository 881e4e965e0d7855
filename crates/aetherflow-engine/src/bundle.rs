//! Bundle manifest application.
//!
//! Remote bundle fetch and fingerprinting are external concerns; the
//! engine consumes a bundle that is already local. Applying a manifest
//! folds its mode, env files, and layout paths into the run env snapshot
//! and resolves relative flow paths against the bundle root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::manifest::{BundleManifest, BundleSourceType, RunMode};

use crate::envfiles;
use crate::spec::parser;

/// A manifest applied against a local bundle root.
#[derive(Debug)]
pub struct BundleContext {
    pub manifest: BundleManifest,
    pub root: PathBuf,
}

impl BundleContext {
    /// Resolve a flow path: absolute paths pass through, relative paths
    /// land under the bundle's flows directory.
    #[must_use]
    pub fn resolve_flow_path(&self, flow: &Path) -> PathBuf {
        if flow.is_absolute() {
            return flow.to_path_buf();
        }
        match &self.manifest.bundle.layout.flows {
            Some(flows_dir) => self.root.join(flows_dir).join(flow),
            None => self.root.join(flow),
        }
    }
}

/// Load a manifest and fold it into the env snapshot.
///
/// Ordering: the manifest's env files apply after the external env-file
/// list already present in the snapshot. Enterprise mode drops ambient
/// plugin paths and installs only the manifest's trusted ones.
///
/// # Errors
///
/// Fails when the manifest cannot be parsed, names a non-local source, or
/// a required env file is missing.
pub fn apply_manifest(
    manifest_path: &Path,
    snapshot: &mut BTreeMap<String, String>,
) -> Result<BundleContext> {
    let manifest =
        parser::parse_manifest_path(manifest_path).map_err(|e| FlowError::Spec(format!("{e:#}")))?;

    if manifest.bundle.source.source_type != BundleSourceType::Local {
        return Err(FlowError::Spec(format!(
            "bundle source type {:?} requires an external sync step; point the manifest at the synced local copy",
            manifest.bundle.source.source_type
        )));
    }
    let root = PathBuf::from(&manifest.bundle.source.location);

    snapshot.insert(
        "AETHERFLOW_MODE".to_string(),
        manifest.mode.as_str().to_string(),
    );

    if manifest.mode == RunMode::Enterprise {
        // Never inherit plugin paths from the ambient environment in
        // enterprise deployments; only manifest-trusted paths load.
        snapshot.remove("AETHERFLOW_PLUGIN_PATHS");
        if !manifest.paths.plugins.is_empty() {
            snapshot.insert(
                "AETHERFLOW_PLUGIN_PATHS".to_string(),
                manifest.paths.plugins.join(","),
            );
        }
    } else if let Some(plugins_dir) = &manifest.bundle.layout.plugins {
        snapshot.insert(
            "AETHERFLOW_PLUGIN_PATHS".to_string(),
            root.join(plugins_dir).to_string_lossy().into_owned(),
        );
    }

    if !manifest.env_files.is_empty() {
        let loaded = envfiles::load_env_files(&manifest.env_files, Some(&root))
            .map_err(|e| FlowError::Spec(format!("{e:#}")))?;
        snapshot.extend(loaded);
    }

    if let Some(profiles) = &manifest.bundle.layout.profiles {
        snapshot.insert(
            "AETHERFLOW_PROFILES_FILE".to_string(),
            root.join(profiles).to_string_lossy().into_owned(),
        );
    }

    Ok(BundleContext { manifest, root })
}
