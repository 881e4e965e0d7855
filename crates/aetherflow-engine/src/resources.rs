//! Profile overlay and resource resolution.
//!
//! For each declared resource, in declaration order: merge the profile
//! fragment, run the secrets env-expansion hook over a copy of the
//! snapshot, render `config`/`options` under the env-only scope, then pass
//! decode-marked leaves through the decode hook. Any failure aborts the
//! run before job execution.

use std::collections::BTreeMap;

use serde_json::Value;

use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::flow::{ConfigMap, FlowSpec, ProfilesFile};
use aetherflow_types::manifest::RunMode;

use crate::connectors::ResolvedResource;
use crate::resolver::{self, Scope};
use crate::secrets::SecretsHook;

/// Which subtree a decode request points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeSection {
    Config,
    Options,
}

impl DecodeSection {
    fn key(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Options => "options",
        }
    }
}

/// Deep-merge two mappings: nested mappings merge recursively, everything
/// else (including sequences) is overwritten by the overlay. Keeps profile
/// defaults alive when a resource overrides just one nested key.
#[must_use]
pub fn deep_merge(base: &ConfigMap, overlay: &ConfigMap) -> ConfigMap {
    let mut out = base.clone();
    for (key, value) in overlay {
        match (out.get(key), value) {
            (Some(Value::Object(b)), Value::Object(o)) => {
                out.insert(key.clone(), Value::Object(deep_merge(b, o)));
            }
            _ => {
                out.insert(key.clone(), value.clone());
            }
        }
    }
    out
}

/// Merge decode fragments: the nested bool-map shapes deep-merge, the
/// `*_paths` list shapes concatenate with order-preserving de-dupe.
#[must_use]
pub fn merge_decode(profile: &ConfigMap, resource: &ConfigMap) -> ConfigMap {
    let mut out = profile.clone();
    for (key, value) in resource {
        if matches!(key.as_str(), "config" | "options") {
            if let (Some(Value::Object(base)), Value::Object(overlay)) = (out.get(key), value) {
                out.insert(key.clone(), Value::Object(deep_merge(base, overlay)));
                continue;
            }
        }
        if matches!(key.as_str(), "config_paths" | "options_paths") {
            let mut merged: Vec<Value> = out
                .get(key)
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            if let Some(items) = value.as_array() {
                for item in items {
                    if !merged.contains(item) {
                        merged.push(item.clone());
                    }
                }
            }
            out.insert(key.clone(), Value::Array(merged));
            continue;
        }
        if let (Some(Value::Object(base)), Value::Object(overlay)) = (out.get(key), value) {
            out.insert(key.clone(), Value::Object(deep_merge(base, overlay)));
            continue;
        }
        out.insert(key.clone(), value.clone());
    }
    out
}

fn decode_shape_error(detail: &str) -> FlowError {
    FlowError::template_syntax(detail)
}

/// Collect `(section, dotted-path)` decode requests from a decode spec.
///
/// Supports the nested bool-map shape (`decode.config.password: true`) and
/// the path-list shape (`decode.config_paths: [password]`), de-duped in
/// order.
///
/// # Errors
///
/// Fails on malformed decode shapes (non-boolean leaves, non-string
/// paths).
pub fn collect_decode_requests(decode: &ConfigMap) -> Result<Vec<(DecodeSection, String)>> {
    let mut requests: Vec<(DecodeSection, String)> = Vec::new();

    fn walk(
        section: DecodeSection,
        node: &Value,
        prefix: &str,
        requests: &mut Vec<(DecodeSection, String)>,
    ) -> Result<()> {
        match node {
            Value::Object(map) => {
                for (key, value) in map {
                    let child = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}.{key}")
                    };
                    walk(section, value, &child, requests)?;
                }
                Ok(())
            }
            Value::Bool(true) => {
                if prefix.is_empty() {
                    return Err(decode_shape_error("decode leaf without a path"));
                }
                requests.push((section, prefix.to_string()));
                Ok(())
            }
            Value::Bool(false) | Value::Null => Ok(()),
            other => Err(decode_shape_error(&format!(
                "unsupported decode leaf at '{prefix}': {other}"
            ))),
        }
    }

    for section in [DecodeSection::Config, DecodeSection::Options] {
        if let Some(node) = decode.get(section.key()) {
            walk(section, node, "", &mut requests)?;
        }
    }

    for (key, section) in [
        ("config_paths", DecodeSection::Config),
        ("options_paths", DecodeSection::Options),
    ] {
        if let Some(value) = decode.get(key) {
            let Some(items) = value.as_array() else {
                return Err(decode_shape_error(&format!("{key} must be a list")));
            };
            for item in items {
                match item.as_str() {
                    Some(path) if !path.is_empty() => {
                        requests.push((section, path.to_string()));
                    }
                    _ => {
                        return Err(decode_shape_error(&format!(
                            "{key} entries must be non-empty strings"
                        )))
                    }
                }
            }
        }
    }

    let mut seen = std::collections::HashSet::new();
    requests.retain(|item| seen.insert(item.clone()));
    Ok(requests)
}

/// Fetch a leaf by dotted path.
#[must_use]
pub fn get_by_path<'a>(root: &'a ConfigMap, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut cur = root.get(parts.next()?)?;
    for part in parts {
        cur = cur.as_object()?.get(part)?;
    }
    Some(cur)
}

fn set_by_path(root: &mut ConfigMap, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut cur = root;
    for part in &parts[..parts.len() - 1] {
        let entry = cur
            .entry((*part).to_string())
            .or_insert_with(|| Value::Object(ConfigMap::new()));
        match entry {
            Value::Object(map) => cur = map,
            _ => return,
        }
    }
    if let Some(last) = parts.last() {
        cur.insert((*last).to_string(), value);
    }
}

/// Build every declared resource into its resolved form.
///
/// # Errors
///
/// Fails on enterprise policy violations, resolver errors, decode shape or
/// concatenation violations, and decode-without-hook.
pub fn build_resources(
    spec: &FlowSpec,
    profiles: &ProfilesFile,
    env_snapshot: &BTreeMap<String, String>,
    mode: RunMode,
    archive_allowlist: &std::collections::BTreeSet<String>,
    secrets: Option<&dyn SecretsHook>,
) -> Result<BTreeMap<String, ResolvedResource>> {
    // The expansion hook sees a copy; the run snapshot itself stays frozen.
    let env = match secrets {
        Some(hook) => hook.expand_env(env_snapshot)?,
        None => env_snapshot.clone(),
    };
    let env_value = Value::Object(
        env.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    );
    let mut vars = serde_json::Map::new();
    vars.insert("env".to_string(), env_value);
    let vars = Value::Object(vars);

    let mut resolved = BTreeMap::new();
    for (name, resource) in &spec.resources {
        if mode == RunMode::Enterprise
            && resource.kind == "archive"
            && !archive_allowlist.contains(&resource.driver)
        {
            return Err(FlowError::Connector(format!(
                "Enterprise mode requires resources.{name}.driver in {archive_allowlist:?} for kind=archive; got {:?}",
                resource.driver
            )));
        }

        let profile = resource
            .profile
            .as_ref()
            .and_then(|profile_name| {
                let found = profiles.get(profile_name);
                if found.is_none() {
                    tracing::warn!(
                        resource = %name,
                        profile = %profile_name,
                        "profile not found, using resource values only"
                    );
                }
                found
            })
            .cloned()
            .unwrap_or_default();

        let raw_config = deep_merge(&profile.config, &resource.config);
        let raw_options = deep_merge(&profile.options, &resource.options);
        let decode = merge_decode(&profile.decode, &resource.decode);

        let scope = Scope::resource(&vars);
        let config = render_map(&raw_config, scope)?;
        let options = render_map(&raw_options, scope)?;

        let mut out = ResolvedResource {
            kind: resource.kind.clone(),
            driver: resource.driver.clone(),
            config,
            options,
        };

        let requests = collect_decode_requests(&decode)?;
        if !requests.is_empty() {
            let Some(hook) = secrets else {
                return Err(FlowError::Connector(format!(
                    "resources.{name} marks fields for decode but no secrets hook is installed"
                )));
            };

            // The concatenation rule applies to the raw, pre-render value:
            // a decoded field must be a standalone token, never templated
            // text glued to other text.
            for (section, path) in &requests {
                let raw_root = match section {
                    DecodeSection::Config => &raw_config,
                    DecodeSection::Options => &raw_options,
                };
                if let Some(Value::String(raw)) = get_by_path(raw_root, path) {
                    if (raw.contains("{{") || raw.contains("}}"))
                        && !resolver::is_standalone_token(raw)
                    {
                        return Err(FlowError::template_syntax(&format!(
                            "resources.{name}.{}.{path} mixes a template token with literal text; decode targets must be standalone tokens",
                            section.key()
                        )));
                    }
                }
            }

            for (section, path) in &requests {
                let target = match section {
                    DecodeSection::Config => &mut out.config,
                    DecodeSection::Options => &mut out.options,
                };
                if let Some(Value::String(current)) = get_by_path(target, path).cloned() {
                    let decoded = hook.decode(&current)?;
                    set_by_path(target, path, Value::String(decoded));
                }
            }
        }

        resolved.insert(name.clone(), out);
    }
    Ok(resolved)
}

fn render_map(map: &ConfigMap, scope: Scope<'_>) -> Result<ConfigMap> {
    match resolver::render_value(&Value::Object(map.clone()), scope)? {
        Value::Object(rendered) => Ok(rendered),
        _ => Err(FlowError::Spec("resource subtree must stay a mapping".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aetherflow_types::flow::{FlowMeta, ProfileSpec, ResourceSpec};
    use serde_json::json;
    use std::collections::BTreeSet;

    fn as_map(v: Value) -> ConfigMap {
        v.as_object().cloned().unwrap()
    }

    fn flow_with_resource(name: &str, resource: ResourceSpec) -> FlowSpec {
        FlowSpec {
            version: 1,
            flow: FlowMeta {
                id: "f".into(),
                description: None,
                workspace: aetherflow_types::flow::WorkspaceSpec::default(),
                state: aetherflow_types::flow::StateSpec::default(),
                locks: aetherflow_types::flow::LocksSpec::default(),
            },
            resources: BTreeMap::from([(name.to_string(), resource)]),
            jobs: vec![],
        }
    }

    struct UpperHook;
    impl SecretsHook for UpperHook {
        fn expand_env(
            &self,
            env: &BTreeMap<String, String>,
        ) -> aetherflow_types::error::Result<BTreeMap<String, String>> {
            let mut out = env.clone();
            out.insert("INJECTED".to_string(), "from-hook".to_string());
            Ok(out)
        }

        fn decode(&self, value: &str) -> aetherflow_types::error::Result<String> {
            Ok(value.to_uppercase())
        }
    }

    #[test]
    fn deep_merge_overrides_nested_keys_only() {
        let base = as_map(json!({"a": {"x": 1, "y": 2}, "keep": "base"}));
        let overlay = as_map(json!({"a": {"y": 9}, "new": true}));
        let merged = deep_merge(&base, &overlay);
        assert_eq!(merged["a"]["x"], 1);
        assert_eq!(merged["a"]["y"], 9);
        assert_eq!(merged["keep"], "base");
        assert_eq!(merged["new"], true);
    }

    #[test]
    fn deep_merge_replaces_sequences() {
        let base = as_map(json!({"list": [1, 2, 3]}));
        let overlay = as_map(json!({"list": [9]}));
        assert_eq!(deep_merge(&base, &overlay)["list"], json!([9]));
    }

    #[test]
    fn merge_decode_concatenates_path_lists() {
        let profile = as_map(json!({"config_paths": ["password"], "config": {"token": true}}));
        let resource = as_map(json!({"config_paths": ["password", "api_key"]}));
        let merged = merge_decode(&profile, &resource);
        assert_eq!(merged["config_paths"], json!(["password", "api_key"]));
        assert_eq!(merged["config"]["token"], true);
    }

    #[test]
    fn decode_requests_both_shapes() {
        let decode = as_map(json!({
            "config": {"password": true, "headers": {"Authorization": true}, "off": false},
            "options_paths": ["token"],
        }));
        let requests = collect_decode_requests(&decode).unwrap();
        assert_eq!(
            requests,
            vec![
                (DecodeSection::Config, "headers.Authorization".to_string()),
                (DecodeSection::Config, "password".to_string()),
                (DecodeSection::Options, "token".to_string()),
            ]
        );
    }

    #[test]
    fn decode_bad_leaf_rejected() {
        let decode = as_map(json!({"config": {"password": "yes"}}));
        assert!(collect_decode_requests(&decode).is_err());
        let decode = as_map(json!({"config_paths": "password"}));
        assert!(collect_decode_requests(&decode).is_err());
    }

    #[test]
    fn resource_renders_env_and_decodes() {
        let resource = ResourceSpec {
            kind: "db".into(),
            driver: "postgres".into(),
            profile: None,
            config: as_map(json!({"host": "{{env.DB_HOST}}", "password": "{{env.DB_PASS}}"})),
            options: ConfigMap::new(),
            decode: as_map(json!({"config": {"password": true}})),
        };
        let spec = flow_with_resource("db_main", resource);
        let env = BTreeMap::from([
            ("DB_HOST".to_string(), "db01".to_string()),
            ("DB_PASS".to_string(), "cipher".to_string()),
        ]);

        let resolved = build_resources(
            &spec,
            &ProfilesFile::new(),
            &env,
            RunMode::InternalFast,
            &BTreeSet::new(),
            Some(&UpperHook),
        )
        .unwrap();
        let db = &resolved["db_main"];
        assert_eq!(db.config["host"], "db01");
        assert_eq!(db.config["password"], "CIPHER");
    }

    #[test]
    fn profile_overlays_under_resource() {
        let resource = ResourceSpec {
            kind: "db".into(),
            driver: "postgres".into(),
            profile: Some("dev".into()),
            config: as_map(json!({"database": "etl"})),
            options: ConfigMap::new(),
            decode: ConfigMap::new(),
        };
        let spec = flow_with_resource("db_main", resource);
        let profiles = ProfilesFile::from([(
            "dev".to_string(),
            ProfileSpec {
                config: as_map(json!({"host": "devhost", "database": "ignored"})),
                options: as_map(json!({"pool": 2})),
                decode: ConfigMap::new(),
            },
        )]);

        let resolved = build_resources(
            &spec,
            &profiles,
            &BTreeMap::new(),
            RunMode::InternalFast,
            &BTreeSet::new(),
            None,
        )
        .unwrap();
        let db = &resolved["db_main"];
        assert_eq!(db.config["host"], "devhost");
        assert_eq!(db.config["database"], "etl");
        assert_eq!(db.options["pool"], 2);
    }

    #[test]
    fn expand_env_hook_feeds_templates() {
        let resource = ResourceSpec {
            kind: "rest".into(),
            driver: "generic".into(),
            profile: None,
            config: as_map(json!({"token": "{{env.INJECTED}}"})),
            options: ConfigMap::new(),
            decode: ConfigMap::new(),
        };
        let spec = flow_with_resource("api", resource);
        let resolved = build_resources(
            &spec,
            &ProfilesFile::new(),
            &BTreeMap::new(),
            RunMode::InternalFast,
            &BTreeSet::new(),
            Some(&UpperHook),
        )
        .unwrap();
        assert_eq!(resolved["api"].config["token"], "from-hook");
    }

    #[test]
    fn decode_concatenation_rejected() {
        let resource = ResourceSpec {
            kind: "db".into(),
            driver: "postgres".into(),
            profile: None,
            config: as_map(json!({"password": "prefix-{{env.DB_PASS}}"})),
            options: ConfigMap::new(),
            decode: as_map(json!({"config": {"password": true}})),
        };
        let spec = flow_with_resource("db_main", resource);
        let env = BTreeMap::from([("DB_PASS".to_string(), "c".to_string())]);
        let err = build_resources(
            &spec,
            &ProfilesFile::new(),
            &env,
            RunMode::InternalFast,
            &BTreeSet::new(),
            Some(&UpperHook),
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::ResolverSyntax(_)));
    }

    #[test]
    fn decode_without_hook_fails() {
        let resource = ResourceSpec {
            kind: "db".into(),
            driver: "postgres".into(),
            profile: None,
            config: as_map(json!({"password": "cipher"})),
            options: ConfigMap::new(),
            decode: as_map(json!({"config": {"password": true}})),
        };
        let spec = flow_with_resource("db_main", resource);
        let err = build_resources(
            &spec,
            &ProfilesFile::new(),
            &BTreeMap::new(),
            RunMode::InternalFast,
            &BTreeSet::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::Connector(_)));
        assert!(err.to_string().contains("secrets hook"));
    }

    #[test]
    fn enterprise_archive_allowlist_enforced() {
        let resource = ResourceSpec {
            kind: "archive".into(),
            driver: "sevenzip".into(),
            profile: None,
            config: ConfigMap::new(),
            options: ConfigMap::new(),
            decode: ConfigMap::new(),
        };
        let spec = flow_with_resource("zipper", resource);
        let allowlist = BTreeSet::from(["zipfile".to_string()]);

        let err = build_resources(
            &spec,
            &ProfilesFile::new(),
            &BTreeMap::new(),
            RunMode::Enterprise,
            &allowlist,
            None,
        )
        .unwrap_err();
        assert!(err.to_string().contains("zipper"));

        // Same flow passes outside enterprise mode.
        assert!(build_resources(
            &spec,
            &ProfilesFile::new(),
            &BTreeMap::new(),
            RunMode::InternalFast,
            &allowlist,
            None,
        )
        .is_ok());
    }

    #[test]
    fn missing_env_in_resource_fails_fast() {
        let resource = ResourceSpec {
            kind: "db".into(),
            driver: "postgres".into(),
            profile: None,
            config: as_map(json!({"host": "{{env.NOT_SET}}"})),
            options: ConfigMap::new(),
            decode: ConfigMap::new(),
        };
        let spec = flow_with_resource("db_main", resource);
        let err = build_resources(
            &spec,
            &ProfilesFile::new(),
            &BTreeMap::new(),
            RunMode::InternalFast,
            &BTreeSet::new(),
            None,
        )
        .unwrap_err();
        assert!(matches!(err, FlowError::ResolverMissingKey(_)));
    }
}
