//! Env-file loading and the run environment snapshot.
//!
//! Loading order is deterministic, last-wins: process environment, then the
//! external env-file list (`AETHERFLOW_ENV_FILES_JSON`), then manifest
//! env files. The process environment itself is never mutated.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use aetherflow_types::envfile::{EnvFileKind, EnvFileSpec};

/// Env var naming the external env-file list (a JSON array of specs).
pub const ENV_FILES_JSON_VAR: &str = "AETHERFLOW_ENV_FILES_JSON";

fn read_dotenv(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dotenv file: {}", path.display()))?;
    let mut out = BTreeMap::new();
    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let mut value = value.trim();
        // Strip one layer of simple quoting.
        if value.len() >= 2
            && ((value.starts_with('"') && value.ends_with('"'))
                || (value.starts_with('\'') && value.ends_with('\'')))
        {
            value = &value[1..value.len() - 1];
        }
        if !key.is_empty() {
            out.insert(key.to_string(), value.to_string());
        }
    }
    Ok(out)
}

fn read_json(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read json env file: {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("Invalid JSON in env file: {}", path.display()))?;
    let Value::Object(obj) = value else {
        anyhow::bail!("json env file must be a JSON object: {}", path.display());
    };
    let mut out = BTreeMap::new();
    for (key, value) in obj {
        let text = match value {
            Value::Null => continue,
            Value::String(s) => s,
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            nested @ (Value::Array(_) | Value::Object(_)) => nested.to_string(),
        };
        out.insert(key, text);
    }
    Ok(out)
}

fn read_dir(path: &Path) -> Result<BTreeMap<String, String>> {
    if !path.is_dir() {
        anyhow::bail!("env dir is not a directory: {}", path.display());
    }
    let mut entries: Vec<PathBuf> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read env dir: {}", path.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    let mut out = BTreeMap::new();
    for file in entries {
        let Some(name) = file.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let content = std::fs::read_to_string(&file)
            .with_context(|| format!("Failed to read env dir entry: {}", file.display()))?;
        out.insert(
            name.to_string(),
            content.trim_end_matches('\n').to_string(),
        );
    }
    Ok(out)
}

/// Load env vars for a list of specs. Later specs override earlier ones.
///
/// Relative paths resolve against `base_dir` when given.
///
/// # Errors
///
/// Fails when a non-optional file is missing or unreadable.
pub fn load_env_files(
    specs: &[EnvFileSpec],
    base_dir: Option<&Path>,
) -> Result<BTreeMap<String, String>> {
    let mut merged = BTreeMap::new();
    for spec in specs {
        let mut path = PathBuf::from(&spec.path);
        if let Some(base) = base_dir {
            if path.is_relative() {
                path = base.join(path);
            }
        }

        if !path.exists() {
            if spec.optional {
                continue;
            }
            anyhow::bail!("env file not found: {}", path.display());
        }

        let data = match spec.kind {
            EnvFileKind::Dotenv => read_dotenv(&path)?,
            EnvFileKind::Json => read_json(&path)?,
            EnvFileKind::Dir => read_dir(&path)?,
        };

        for (key, value) in data {
            merged.insert(format!("{}{key}", spec.prefix), value);
        }
    }
    Ok(merged)
}

/// Parse the `AETHERFLOW_ENV_FILES_JSON` value into env-file specs.
///
/// # Errors
///
/// Fails when the value is not a JSON list of spec objects.
pub fn parse_env_files_json(raw: &str) -> Result<Vec<EnvFileSpec>> {
    serde_json::from_str(raw).context("AETHERFLOW_ENV_FILES_JSON must be a JSON list of specs")
}

/// Snapshot the process environment as strings.
#[must_use]
pub fn process_env_snapshot() -> BTreeMap<String, String> {
    std::env::vars().collect()
}

/// Overlay the external env-file list (if configured) onto a snapshot.
///
/// # Errors
///
/// Fails when the configured list is malformed or a required file is
/// missing.
pub fn apply_env_files_var(snapshot: &mut BTreeMap<String, String>) -> Result<()> {
    let Some(raw) = snapshot.get(ENV_FILES_JSON_VAR).cloned() else {
        return Ok(());
    };
    let specs = parse_env_files_json(&raw)?;
    let loaded = load_env_files(&specs, None)?;
    snapshot.extend(loaded);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(kind: EnvFileKind, path: &Path) -> EnvFileSpec {
        EnvFileSpec {
            kind,
            path: path.to_string_lossy().into_owned(),
            optional: false,
            prefix: String::new(),
        }
    }

    #[test]
    fn dotenv_parses_comments_and_quotes() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("common.env");
        std::fs::write(
            &file,
            "# comment\nHOST=db01\nQUOTED=\"v 1\"\nSINGLE='v2'\n\nNOEQ\nEMPTYKEY=\n",
        )
        .unwrap();

        let out = load_env_files(&[spec(EnvFileKind::Dotenv, &file)], None).unwrap();
        assert_eq!(out["HOST"], "db01");
        assert_eq!(out["QUOTED"], "v 1");
        assert_eq!(out["SINGLE"], "v2");
        assert_eq!(out["EMPTYKEY"], "");
        assert!(!out.contains_key("NOEQ"));
    }

    #[test]
    fn json_coerces_values_to_strings() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("env.json");
        std::fs::write(
            &file,
            r#"{"A": "text", "B": 5, "C": true, "D": null, "E": {"k": 1}}"#,
        )
        .unwrap();

        let out = load_env_files(&[spec(EnvFileKind::Json, &file)], None).unwrap();
        assert_eq!(out["A"], "text");
        assert_eq!(out["B"], "5");
        assert_eq!(out["C"], "true");
        assert!(!out.contains_key("D"));
        assert_eq!(out["E"], r#"{"k":1}"#);
    }

    #[test]
    fn json_non_object_fails() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("env.json");
        std::fs::write(&file, "[1, 2]").unwrap();
        assert!(load_env_files(&[spec(EnvFileKind::Json, &file)], None).is_err());
    }

    #[test]
    fn dir_entries_become_keys() {
        let dir = tempdir().unwrap();
        let secrets = dir.path().join("secrets");
        std::fs::create_dir(&secrets).unwrap();
        std::fs::write(secrets.join("DB_PASSWORD"), "hunter2\n").unwrap();
        std::fs::write(secrets.join("API_KEY"), "k-123").unwrap();

        let out = load_env_files(&[spec(EnvFileKind::Dir, &secrets)], None).unwrap();
        assert_eq!(out["DB_PASSWORD"], "hunter2");
        assert_eq!(out["API_KEY"], "k-123");
    }

    #[test]
    fn prefix_applied_and_later_specs_win() {
        let dir = tempdir().unwrap();
        let first = dir.path().join("a.env");
        let second = dir.path().join("b.env");
        std::fs::write(&first, "KEY=first\nONLY_A=1\n").unwrap();
        std::fs::write(&second, "KEY=second\n").unwrap();

        let specs = vec![
            spec(EnvFileKind::Dotenv, &first),
            spec(EnvFileKind::Dotenv, &second),
        ];
        let out = load_env_files(&specs, None).unwrap();
        assert_eq!(out["KEY"], "second");
        assert_eq!(out["ONLY_A"], "1");

        let mut prefixed = spec(EnvFileKind::Dotenv, &first);
        prefixed.prefix = "UC1_".to_string();
        let out = load_env_files(&[prefixed], None).unwrap();
        assert_eq!(out["UC1_KEY"], "first");
    }

    #[test]
    fn missing_required_file_fails_optional_skips() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.env");

        assert!(load_env_files(&[spec(EnvFileKind::Dotenv, &missing)], None).is_err());

        let mut optional = spec(EnvFileKind::Dotenv, &missing);
        optional.optional = true;
        let out = load_env_files(&[optional], None).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn relative_paths_resolve_against_base_dir() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("rel.env"), "R=1\n").unwrap();

        let rel = EnvFileSpec {
            kind: EnvFileKind::Dotenv,
            path: "rel.env".to_string(),
            optional: false,
            prefix: String::new(),
        };
        let out = load_env_files(&[rel], Some(dir.path())).unwrap();
        assert_eq!(out["R"], "1");
    }

    #[test]
    fn env_files_json_parses() {
        let specs =
            parse_env_files_json(r#"[{"type": "dotenv", "path": "x.env", "optional": true}]"#)
                .unwrap();
        assert_eq!(specs.len(), 1);
        assert!(specs[0].optional);

        assert!(parse_env_files_json(r#"{"type": "dotenv"}"#).is_err());
    }

    #[test]
    fn apply_env_files_var_overlays_snapshot() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("o.env");
        std::fs::write(&file, "FROM_FILE=yes\nBASE=overridden\n").unwrap();

        let mut snapshot = BTreeMap::from([
            ("BASE".to_string(), "original".to_string()),
            (
                ENV_FILES_JSON_VAR.to_string(),
                format!(r#"[{{"type": "dotenv", "path": "{}"}}]"#, file.display()),
            ),
        ]);
        apply_env_files_var(&mut snapshot).unwrap();
        assert_eq!(snapshot["FROM_FILE"], "yes");
        assert_eq!(snapshot["BASE"], "overridden");
    }
}
