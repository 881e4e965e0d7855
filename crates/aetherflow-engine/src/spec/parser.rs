//! Flow/profile/manifest document parsing.
//!
//! YAML is the first-class format; `.json` files parse through `serde_json`
//! into the same typed model. Unknown fields reject at the serde layer.

use std::path::Path;

use anyhow::{Context, Result};

use aetherflow_types::flow::{FlowSpec, ProfilesFile};
use aetherflow_types::manifest::BundleManifest;

/// Parse a flow document from YAML text.
///
/// # Errors
///
/// Returns an error when the YAML is invalid or violates the schema.
pub fn parse_flow_str(yaml: &str) -> Result<FlowSpec> {
    serde_yaml::from_str(yaml).context("Failed to parse flow YAML")
}

/// Parse a flow document file (`.json` parses as JSON, anything else as
/// YAML).
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn parse_flow_path(path: &Path) -> Result<FlowSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read flow file: {}", path.display()))?;
    if path.extension().is_some_and(|ext| ext == "json") {
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse flow JSON: {}", path.display()))
    } else {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse flow YAML: {}", path.display()))
    }
}

/// Parse a profiles document from YAML text.
///
/// # Errors
///
/// Returns an error when the YAML is invalid or a fragment violates the
/// schema.
pub fn parse_profiles_str(yaml: &str) -> Result<ProfilesFile> {
    serde_yaml::from_str(yaml).context("Failed to parse profiles YAML")
}

/// Parse a profiles document from a JSON string
/// (`AETHERFLOW_PROFILES_JSON`).
///
/// # Errors
///
/// Returns an error when the JSON is invalid or a fragment violates the
/// schema.
pub fn parse_profiles_json(raw: &str) -> Result<ProfilesFile> {
    serde_json::from_str(raw).context("Failed to parse AETHERFLOW_PROFILES_JSON")
}

/// Parse a profiles file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn parse_profiles_path(path: &Path) -> Result<ProfilesFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read profiles file: {}", path.display()))?;
    parse_profiles_str(&content)
}

/// Parse a bundle manifest file.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn parse_manifest_path(path: &Path) -> Result<BundleManifest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read bundle manifest: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse bundle manifest: {}", path.display()))
}
