//! Env-file source specification.

use serde::{Deserialize, Serialize};

/// Supported env-file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvFileKind {
    /// `KEY=VALUE` lines, `#` comments, simple quote stripping.
    Dotenv,
    /// Top-level JSON object coerced to strings.
    Json,
    /// Directory where each file name is a key and its content the value.
    Dir,
}

/// One env-file source. Loading order across a list is deterministic,
/// last-wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvFileSpec {
    #[serde(rename = "type")]
    pub kind: EnvFileKind,
    pub path: String,
    /// Missing files are skipped instead of failing.
    #[serde(default)]
    pub optional: bool,
    /// Prepended to every loaded key.
    #[serde(default)]
    pub prefix: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_parses_with_defaults() {
        let spec: EnvFileSpec =
            serde_json::from_str(r#"{"type": "dotenv", "path": "env/common.env"}"#).unwrap();
        assert_eq!(spec.kind, EnvFileKind::Dotenv);
        assert_eq!(spec.path, "env/common.env");
        assert!(!spec.optional);
        assert_eq!(spec.prefix, "");
    }

    #[test]
    fn dir_kind_parses() {
        let spec: EnvFileSpec = serde_json::from_str(
            r#"{"type": "dir", "path": "/run/secrets", "optional": true, "prefix": "SEC_"}"#,
        )
        .unwrap();
        assert_eq!(spec.kind, EnvFileKind::Dir);
        assert!(spec.optional);
        assert_eq!(spec.prefix, "SEC_");
    }

    #[test]
    fn unknown_field_rejected() {
        let err = serde_json::from_str::<EnvFileSpec>(
            r#"{"type": "json", "path": "a.json", "mode": "strict"}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mode"));
    }
}
