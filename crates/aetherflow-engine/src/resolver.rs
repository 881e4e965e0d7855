//! The single strict template resolver.
//!
//! Allowed tokens, exhaustively: `{{PATH}}` and `{{PATH:DEFAULT}}`, where
//! `PATH = IDENT('.'IDENT)*` and whitespace may surround PATH. Every other
//! brace form (`${…}`, `{%…%}`, `{#…#}`, `{}`) fails with a syntax error
//! carrying the fixed message. Scoping by phase is achieved by passing a
//! smaller variable root; there is exactly one template engine.
//!
//! A string that is exactly one token renders to the looked-up value with
//! its type preserved; multi-token strings always render to text.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use aetherflow_types::error::{FlowError, Result};

static STANDALONE_TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)(?::([^}]*))?\s*\}\}$",
    )
    .expect("valid standalone token regex")
});

/// Variable root plus the roots a rendering phase may reference.
///
/// The root value must be a JSON object; the first PATH segment is checked
/// against `allowed_roots` before lookup, so a disallowed root is a syntax
/// error regardless of whether the mapping happens to contain it.
#[derive(Clone, Copy)]
pub struct Scope<'a> {
    vars: &'a Value,
    allowed_roots: &'a [&'a str],
    strict: bool,
}

/// Roots available while rendering resource `config`/`options`.
pub const RESOURCE_ROOTS: &[&str] = &["env"];
/// Roots available while rendering flow metadata.
pub const FLOW_META_ROOTS: &[&str] = &["env"];
/// Roots available while rendering step inputs.
pub const STEP_ROOTS: &[&str] = &["env", "steps", "job", "jobs", "run_id", "flow_id"];
/// Roots available while promoting step outputs (`result` joins the scope).
pub const STEP_OUTPUT_ROOTS: &[&str] =
    &["env", "steps", "job", "jobs", "run_id", "flow_id", "result"];

impl<'a> Scope<'a> {
    /// Scope for resource template expansion: `env` only.
    #[must_use]
    pub fn resource(vars: &'a Value) -> Self {
        Self {
            vars,
            allowed_roots: RESOURCE_ROOTS,
            strict: true,
        }
    }

    /// Scope for flow metadata expansion: `env` only.
    #[must_use]
    pub fn flow_meta(vars: &'a Value) -> Self {
        Self {
            vars,
            allowed_roots: FLOW_META_ROOTS,
            strict: true,
        }
    }

    /// Scope for step input rendering.
    #[must_use]
    pub fn step(vars: &'a Value) -> Self {
        Self {
            vars,
            allowed_roots: STEP_ROOTS,
            strict: true,
        }
    }

    /// Scope for step output promotion (`result` available).
    #[must_use]
    pub fn step_outputs(vars: &'a Value) -> Self {
        Self {
            vars,
            allowed_roots: STEP_OUTPUT_ROOTS,
            strict: true,
        }
    }

    /// Missing keys render to empty instead of failing. Used when
    /// re-promoting outputs of a resume-skipped step, whose runtime result
    /// no longer exists.
    #[must_use]
    pub fn lenient(mut self) -> Self {
        self.strict = false;
        self
    }
}

fn syntax_error(detail: &str) -> FlowError {
    FlowError::template_syntax(detail)
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn is_valid_path(path: &str) -> bool {
    !path.is_empty() && path.split('.').all(is_identifier)
}

/// Hard-forbidden brace patterns, checked on every rendered string.
fn contains_forbidden_syntax(value: &str) -> bool {
    value.contains("${")
        || value.contains("{%")
        || value.contains("%}")
        || value.contains("{#")
        || value.contains("#}")
        || value.contains("{}")
}

/// True when the string is exactly one `{{TOKEN}}` / `{{TOKEN:DEFAULT}}`.
#[must_use]
pub fn is_standalone_token(value: &str) -> bool {
    STANDALONE_TOKEN_RE.is_match(value.trim())
}

/// Traverse PATH through nested objects. Empty strings and nulls count as
/// missing per the resolver contract.
fn lookup_path<'v>(vars: &'v Value, path: &str) -> Option<&'v Value> {
    let mut cur = vars;
    for part in path.split('.') {
        cur = cur.as_object()?.get(part)?;
    }
    match cur {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        other => Some(other),
    }
}

/// Textual form of a resolved value for inline substitution.
fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn check_root(path: &str, scope: &Scope<'_>) -> Result<()> {
    let root = path.split('.').next().unwrap_or_default();
    if scope.allowed_roots.contains(&root) {
        Ok(())
    } else {
        Err(syntax_error(&format!(
            "template root '{root}' is not allowed here (allowed: {})",
            scope.allowed_roots.join(", ")
        )))
    }
}

fn resolve_token(path: &str, default: Option<&str>, scope: &Scope<'_>) -> Result<Option<Value>> {
    if !is_valid_path(path) {
        return Err(syntax_error(&format!("invalid template path '{path}'")));
    }
    check_root(path, scope)?;

    match lookup_path(scope.vars, path) {
        Some(v) => Ok(Some(v.clone())),
        None => match default {
            Some(d) => Ok(Some(Value::String(d.to_string()))),
            None if scope.strict => Err(FlowError::ResolverMissingKey(path.to_string())),
            None => Ok(None),
        },
    }
}

/// Render a single string under the strict template contract.
///
/// # Errors
///
/// Fails with `ResolverSyntax` on any disallowed form and with
/// `ResolverMissingKey` when a PATH without default does not resolve.
pub fn render_str(value: &str, scope: Scope<'_>) -> Result<String> {
    if contains_forbidden_syntax(value) {
        return Err(syntax_error(&format!("forbidden pattern in {value:?}")));
    }
    if !value.contains("{{") && !value.contains("}}") {
        return Ok(value.to_string());
    }

    let mut out = String::new();
    let mut rest = value;

    loop {
        let Some(start) = rest.find("{{") else {
            // Text after the last token may contain stray closing braces
            // (inline JSON and the like); only a close *before* an opening
            // token is malformed.
            out.push_str(rest);
            break;
        };

        if rest[..start].contains("}}") {
            return Err(syntax_error(&format!("unmatched '}}}}' in {value:?}")));
        }
        out.push_str(&rest[..start]);

        let body = &rest[start + 2..];
        let Some(end) = body.find("}}") else {
            return Err(syntax_error(&format!("missing '}}}}' in {value:?}")));
        };
        let token = body[..end].trim();

        if token.is_empty() || token.contains('{') || token.contains('}') {
            return Err(syntax_error(&format!("malformed token in {value:?}")));
        }

        // Split PATH[:DEFAULT] at the first colon; the default keeps its
        // exact spelling, including leading spaces.
        let (path, default) = match token.split_once(':') {
            Some((p, d)) => (p.trim(), Some(d)),
            None => (token, None),
        };

        match resolve_token(path, default, &scope)? {
            Some(v) => out.push_str(&value_to_text(&v)),
            None => {}
        }

        rest = &body[end + 2..];
    }

    // Legacy expansion sneaking in through substituted values is forbidden
    // too.
    if contains_forbidden_syntax(&out) {
        return Err(syntax_error(&format!("forbidden pattern in {out:?}")));
    }
    Ok(out)
}

/// Render one string, preserving the looked-up type for standalone tokens.
fn render_str_or_typed(value: &str, scope: Scope<'_>) -> Result<Value> {
    if contains_forbidden_syntax(value) {
        return Err(syntax_error(&format!("forbidden pattern in {value:?}")));
    }
    if !value.contains("{{") && !value.contains("}}") {
        return Ok(Value::String(value.to_string()));
    }

    if let Some(caps) = STANDALONE_TOKEN_RE.captures(value) {
        let path = caps.get(1).map_or("", |m| m.as_str());
        let default = caps.get(2).map(|m| m.as_str());
        return match resolve_token(path, default, &scope)? {
            Some(v) => Ok(v),
            None => Ok(Value::Null),
        };
    }

    render_str(value, scope).map(Value::String)
}

/// Deep-walk a value tree, rendering every string leaf.
///
/// # Errors
///
/// Propagates the first resolver error encountered.
pub fn render_value(value: &Value, scope: Scope<'_>) -> Result<Value> {
    match value {
        Value::String(s) => render_str_or_typed(s, scope),
        Value::Array(items) => items
            .iter()
            .map(|v| render_value(v, scope))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), render_value(v, scope)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aetherflow_types::error::UNSUPPORTED_TEMPLATE_MSG;
    use serde_json::json;

    fn env_scope(vars: &Value) -> Scope<'_> {
        Scope::resource(vars)
    }

    #[test]
    fn plain_string_passes_through() {
        let vars = json!({"env": {}});
        assert_eq!(
            render_str("postgres://localhost", env_scope(&vars)).unwrap(),
            "postgres://localhost"
        );
    }

    #[test]
    fn single_token_substitutes() {
        let vars = json!({"env": {"HOST": "db01"}});
        assert_eq!(
            render_str("https://{{env.HOST}}/api", env_scope(&vars)).unwrap(),
            "https://db01/api"
        );
    }

    #[test]
    fn whitespace_inside_braces_allowed() {
        let vars = json!({"env": {"HOST": "db01"}});
        assert_eq!(
            render_str("{{  env.HOST  }}", env_scope(&vars)).unwrap(),
            "db01"
        );
    }

    #[test]
    fn default_used_when_missing() {
        let vars = json!({"env": {}});
        assert_eq!(
            render_str("{{env.MISSING:localhost}}", env_scope(&vars)).unwrap(),
            "localhost"
        );
    }

    #[test]
    fn default_keeps_spacing_after_colon() {
        let vars = json!({"env": {}});
        assert_eq!(
            render_str("x{{env.MISSING: two words}}y", env_scope(&vars)).unwrap(),
            "x two wordsy"
        );
    }

    #[test]
    fn empty_string_counts_as_missing() {
        let vars = json!({"env": {"BLANK": ""}});
        assert_eq!(
            render_str("{{env.BLANK:fallback}}", env_scope(&vars)).unwrap(),
            "fallback"
        );
        let err = render_str("{{env.BLANK}}", env_scope(&vars)).unwrap_err();
        assert!(matches!(err, FlowError::ResolverMissingKey(_)));
    }

    #[test]
    fn missing_without_default_names_path() {
        let vars = json!({"env": {}});
        let err = render_str("{{env.MISSING}}", env_scope(&vars)).unwrap_err();
        match err {
            FlowError::ResolverMissingKey(path) => assert_eq!(path, "env.MISSING"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn forbidden_forms_fail_with_fixed_message() {
        let vars = json!({"env": {}});
        for bad in ["${env.X}", "{% for x %}", "{# comment #}", "literal {}"] {
            let err = render_str(bad, env_scope(&vars)).unwrap_err();
            assert!(
                err.to_string().starts_with(UNSUPPORTED_TEMPLATE_MSG),
                "for input {bad:?} got: {err}"
            );
        }
    }

    #[test]
    fn unmatched_braces() {
        let vars = json!({"env": {"X": "v"}});
        // Missing close and close-before-open are malformed.
        assert!(render_str("{{env.X", env_scope(&vars)).is_err());
        assert!(render_str("}}{{env.X}}", env_scope(&vars)).is_err());
        assert!(render_str("{{env.X}} }} {{env.X}}", env_scope(&vars)).is_err());
        // Stray closes with no token before them pass through verbatim.
        assert_eq!(
            render_str(r#"{"filter": {"x": 1}}"#, env_scope(&vars)).unwrap(),
            r#"{"filter": {"x": 1}}"#
        );
        assert_eq!(
            render_str("{{env.X}} then }}", env_scope(&vars)).unwrap(),
            "v then }}"
        );
    }

    #[test]
    fn invalid_path_fails() {
        let vars = json!({"env": {}});
        assert!(render_str("{{env..X}}", env_scope(&vars)).is_err());
        assert!(render_str("{{9lives}}", env_scope(&vars)).is_err());
        assert!(render_str("{{env.X-Y}}", env_scope(&vars)).is_err());
    }

    #[test]
    fn disallowed_root_is_syntax_error() {
        let vars = json!({"env": {}, "steps": {"a": {"out": "v"}}});
        let err = render_str("{{steps.a.out}}", Scope::resource(&vars)).unwrap_err();
        assert!(err.to_string().starts_with(UNSUPPORTED_TEMPLATE_MSG));
    }

    #[test]
    fn step_scope_allows_runtime_roots() {
        let vars = json!({
            "env": {"X": "1"},
            "steps": {"probe": {"count": 5}},
            "job": {"id": "j1"},
            "jobs": {},
            "run_id": "r1",
            "flow_id": "f1",
        });
        let scope = Scope::step(&vars);
        assert_eq!(render_str("{{run_id}}", scope).unwrap(), "r1");
        assert_eq!(render_str("{{steps.probe.count}}", scope).unwrap(), "5");
        assert_eq!(render_str("{{job.id}}", scope).unwrap(), "j1");
    }

    #[test]
    fn result_only_in_output_scope() {
        let vars = json!({"env": {}, "result": {"rows": 3}});
        assert!(render_str("{{result.rows}}", Scope::step(&vars)).is_err());
        assert_eq!(
            render_str("{{result.rows}}", Scope::step_outputs(&vars)).unwrap(),
            "3"
        );
    }

    #[test]
    fn standalone_token_keeps_type() {
        let vars = json!({"env": {}, "result": {"has_data": false, "count": 0}});
        let scope = Scope::step_outputs(&vars);
        let rendered = render_value(&json!("{{result.has_data}}"), scope).unwrap();
        assert_eq!(rendered, json!(false));
        let rendered = render_value(&json!("{{result.count}}"), scope).unwrap();
        assert_eq!(rendered, json!(0));
    }

    #[test]
    fn inline_token_renders_to_text() {
        let vars = json!({"env": {}, "result": {"count": 7}});
        let rendered =
            render_value(&json!("rows={{result.count}}"), Scope::step_outputs(&vars)).unwrap();
        assert_eq!(rendered, json!("rows=7"));
    }

    #[test]
    fn rendering_is_idempotent() {
        let vars = json!({"env": {"HOST": "db01"}});
        let once = render_str("{{env.HOST}}/x", env_scope(&vars)).unwrap();
        let twice = render_str(&once, env_scope(&vars)).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn deep_walk_renders_nested_structures() {
        let vars = json!({"env": {"HOST": "h", "PORT": "5432"}});
        let input = json!({
            "url": "{{env.HOST}}:{{env.PORT}}",
            "nested": {"host": "{{env.HOST}}"},
            "list": ["{{env.PORT}}", 7, true],
        });
        let out = render_value(&input, env_scope(&vars)).unwrap();
        assert_eq!(out["url"], "h:5432");
        assert_eq!(out["nested"]["host"], "h");
        assert_eq!(out["list"][0], "5432");
        assert_eq!(out["list"][1], 7);
    }

    #[test]
    fn lenient_scope_yields_null_for_missing() {
        let vars = json!({"env": {}, "result": {}});
        let scope = Scope::step_outputs(&vars).lenient();
        assert_eq!(
            render_value(&json!("{{result.has_data}}"), scope).unwrap(),
            Value::Null
        );
        assert_eq!(render_str("x={{result.n}}", scope).unwrap(), "x=");
    }

    #[test]
    fn standalone_detection() {
        assert!(is_standalone_token("{{env.X}}"));
        assert!(is_standalone_token("  {{ env.X :dflt}} "));
        assert!(!is_standalone_token("prefix {{env.X}}"));
        assert!(!is_standalone_token("{{env.X}} suffix"));
        assert!(!is_standalone_token("{{env.X}}{{env.Y}}"));
    }
}
