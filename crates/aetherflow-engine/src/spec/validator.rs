//! Semantic validation for parsed flow documents.
//!
//! Collects every issue it can find before reporting, so operators fix a
//! flow in one pass. Failures here abort before any job executes and
//! before any state write.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use aetherflow_types::error::FlowError;
use aetherflow_types::flow::{ConfigMap, FlowSpec, ProfilesFile, StepSpec};
use aetherflow_types::manifest::RunMode;

use crate::registry::{ConnectorRegistry, StepRegistry};
use crate::resolver::{self, Scope, STEP_OUTPUT_ROOTS};
use crate::resources;
use crate::when::WhenExpr;

/// One validation finding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub loc: String,
    pub msg: String,
}

impl ValidationIssue {
    fn new(code: &str, loc: String, msg: String) -> Self {
        Self {
            code: code.to_string(),
            loc,
            msg,
        }
    }
}

/// Validation outcome: `ok` iff `errors` is empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    /// Collapse the report into a spec error carrying the first finding.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the report holds any error.
    pub fn into_result(self) -> Result<Self, FlowError> {
        if self.ok {
            Ok(self)
        } else {
            let first = self
                .errors
                .first()
                .map_or_else(|| "Validation failed".to_string(), |e| e.msg.clone());
            Err(FlowError::Spec(first))
        }
    }
}

/// Knobs the caller resolves from settings and manifest.
pub struct ValidateOptions {
    pub strict_env: bool,
    pub mode: RunMode,
    pub archive_allowlist: BTreeSet<String>,
}

impl Default for ValidateOptions {
    fn default() -> Self {
        Self {
            strict_env: false,
            mode: RunMode::InternalFast,
            archive_allowlist: BTreeSet::new(),
        }
    }
}

static TOKEN_SCAN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(.*?)\}\}").expect("valid token scan regex"));

/// Best-effort extraction of template roots, used only to group unknown
/// root findings apart from generic syntax failures.
fn extract_template_roots(s: &str) -> BTreeSet<String> {
    let mut roots = BTreeSet::new();
    for caps in TOKEN_SCAN_RE.captures_iter(s) {
        let inner = caps.get(1).map_or("", |m| m.as_str()).trim();
        if inner.is_empty() {
            continue;
        }
        let head = inner.split(':').next().unwrap_or("").trim();
        let root = head.split('.').next().unwrap_or("").trim();
        if !root.is_empty() {
            roots.insert(root.to_string());
        }
    }
    roots
}

fn iter_strings<'v>(value: &'v Value, loc: &str, out: &mut Vec<(String, &'v str)>) {
    match value {
        Value::String(s) => out.push((loc.to_string(), s.as_str())),
        Value::Object(map) => {
            for (key, child) in map {
                let child_loc = if loc.is_empty() {
                    key.clone()
                } else {
                    format!("{loc}.{key}")
                };
                iter_strings(child, &child_loc, out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                iter_strings(child, &format!("{loc}[{i}]"), out);
            }
        }
        _ => {}
    }
}

fn env_value(env: &BTreeMap<String, String>) -> Value {
    Value::Object(
        env.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Classify a resolver failure against a probe scope: missing `env.*` keys
/// become strict-mode-dependent findings, syntax failures are always
/// errors, and missing runtime keys (steps/jobs/result) are expected at
/// validation time and ignored.
fn record_render_result(
    result: Result<Value, FlowError>,
    loc: &str,
    strict_env: bool,
    errors: &mut Vec<ValidationIssue>,
    warnings: &mut Vec<ValidationIssue>,
) {
    match result {
        Ok(_) => {}
        Err(FlowError::ResolverMissingKey(key)) => {
            if key == "env" || key.starts_with("env.") {
                let issue = ValidationIssue::new(
                    "semantic:missing_env",
                    loc.to_string(),
                    format!("Missing env {key}"),
                );
                if strict_env {
                    errors.push(issue);
                } else {
                    warnings.push(issue);
                }
            }
        }
        Err(FlowError::ResolverSyntax(msg)) => {
            errors.push(ValidationIssue::new(
                "template:syntax",
                loc.to_string(),
                msg,
            ));
        }
        Err(other) => {
            errors.push(ValidationIssue::new(
                "semantic:template",
                loc.to_string(),
                other.to_string(),
            ));
        }
    }
}

/// Extra semantic checks for the built-in `external.process` step,
/// catching common misconfigurations before anything runs.
fn validate_external_process(inputs: &ConfigMap, loc: &str, errors: &mut Vec<ValidationIssue>) {
    match inputs.get("command") {
        None => {
            errors.push(ValidationIssue::new(
                "semantic:external_process_missing_command",
                format!("{loc}.inputs.command"),
                "external.process requires inputs.command".to_string(),
            ));
            return;
        }
        Some(Value::String(_) | Value::Array(_)) => {}
        Some(_) => {
            errors.push(ValidationIssue::new(
                "semantic:external_process_command_type",
                format!("{loc}.inputs.command"),
                "external.process inputs.command must be a string or list".to_string(),
            ));
        }
    }

    if let Some(Value::Object(log_cfg)) = inputs.get("log") {
        for key in ["stdout", "stderr"] {
            if let Some(Value::String(mode)) = log_cfg.get(key) {
                if !matches!(mode.as_str(), "inherit" | "capture" | "file" | "discard") {
                    errors.push(ValidationIssue::new(
                        "semantic:external_process_log_mode",
                        format!("{loc}.inputs.log.{key}"),
                        format!("Unknown log mode: {mode}"),
                    ));
                }
            }
        }
        let uses_file = ["stdout", "stderr"]
            .iter()
            .any(|k| log_cfg.get(*k) == Some(&Value::String("file".to_string())));
        if uses_file && !log_cfg.contains_key("file_path") {
            errors.push(ValidationIssue::new(
                "semantic:external_process_log_file",
                format!("{loc}.inputs.log.file_path"),
                "log.file_path is required when stdout/stderr mode is 'file'".to_string(),
            ));
        }
    }

    if let Some(Value::Object(idem)) = inputs.get("idempotency") {
        if idem.get("strategy") == Some(&Value::String("atomic_dir".to_string()))
            && (!idem.contains_key("temp_output_dir") || !idem.contains_key("final_output_dir"))
        {
            errors.push(ValidationIssue::new(
                "semantic:external_process_atomic_dir",
                format!("{loc}.inputs.idempotency"),
                "atomic_dir requires temp_output_dir and final_output_dir".to_string(),
            ));
        }
    }
}

fn scan_step_templates(
    step: &StepSpec,
    loc_prefix: &str,
    probe: &Value,
    strict_env: bool,
    errors: &mut Vec<ValidationIssue>,
    warnings: &mut Vec<ValidationIssue>,
) {
    for (section, subtree) in [("inputs", &step.inputs), ("outputs", &step.outputs)] {
        let loc = format!("{loc_prefix}.{section}");
        let tree = Value::Object(subtree.clone());

        let mut strings = Vec::new();
        iter_strings(&tree, "", &mut strings);
        for (string_loc, s) in &strings {
            for root in extract_template_roots(s) {
                if !STEP_OUTPUT_ROOTS.contains(&root.as_str()) {
                    errors.push(ValidationIssue::new(
                        "template:unknown_root",
                        if string_loc.is_empty() {
                            loc.clone()
                        } else {
                            format!("{loc}.{string_loc}")
                        },
                        format!("Unknown template root: {root}"),
                    ));
                }
            }
        }

        record_render_result(
            resolver::render_value(&tree, Scope::step_outputs(probe)),
            &loc,
            strict_env,
            errors,
            warnings,
        );
    }
}

/// Validate a parsed flow against registries and the env snapshot.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn validate_flow(
    spec: &FlowSpec,
    steps: &StepRegistry,
    connectors: &ConnectorRegistry,
    env: &BTreeMap<String, String>,
    opts: &ValidateOptions,
) -> ValidationReport {
    let mut errors: Vec<ValidationIssue> = Vec::new();
    let mut warnings: Vec<ValidationIssue> = Vec::new();

    if spec.version != 1 {
        errors.push(ValidationIssue::new(
            "schema:version",
            "version".to_string(),
            format!("Unsupported flow version {}, expected 1", spec.version),
        ));
    }
    if spec.flow.id.trim().is_empty() {
        errors.push(ValidationIssue::new(
            "schema:flow_id",
            "flow.id".to_string(),
            "Flow id must not be empty".to_string(),
        ));
    }

    // Job ids unique.
    let job_ids: Vec<&str> = spec.jobs.iter().map(|j| j.id.as_str()).collect();
    let mut seen = HashSet::new();
    for id in &job_ids {
        if !seen.insert(*id) {
            errors.push(ValidationIssue::new(
                "semantic:duplicate_job_id",
                "jobs".to_string(),
                format!("Duplicate job id: {id}"),
            ));
        }
    }

    // Step ids unique within each job.
    for (j_i, job) in spec.jobs.iter().enumerate() {
        let mut seen = HashSet::new();
        for step in &job.steps {
            if !seen.insert(step.id.as_str()) {
                errors.push(ValidationIssue::new(
                    "semantic:duplicate_step_id",
                    format!("jobs[{j_i}].steps"),
                    format!("Duplicate step id in job '{}': {}", job.id, step.id),
                ));
            }
        }
    }

    // depends_on targets declared and earlier-only.
    let job_idx: BTreeMap<&str, usize> = job_ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
    for (j_i, job) in spec.jobs.iter().enumerate() {
        for dep in &job.depends_on {
            match job_idx.get(dep.as_str()) {
                None => errors.push(ValidationIssue::new(
                    "semantic:depends_on_unknown_job",
                    format!("jobs[{j_i}].depends_on"),
                    format!("Job '{}' depends_on unknown job: {dep}", job.id),
                )),
                Some(dep_idx) if *dep_idx >= j_i => errors.push(ValidationIssue::new(
                    "semantic:depends_on_order",
                    format!("jobs[{j_i}].depends_on"),
                    format!(
                        "Job '{}' depends_on '{dep}' which appears after it; reorder jobs",
                        job.id
                    ),
                )),
                Some(_) => {}
            }
        }
    }

    // Step types exist; built-in extra checks; resource references declared.
    for (j_i, job) in spec.jobs.iter().enumerate() {
        for (s_i, step) in job.steps.iter().enumerate() {
            let loc = format!("jobs[{j_i}].steps[{s_i}]");
            if !steps.contains(&step.step_type) {
                errors.push(ValidationIssue::new(
                    "semantic:unknown_step_type",
                    format!("{loc}.type"),
                    format!(
                        "Unknown step type: {}. Loaded: {:?}",
                        step.step_type,
                        steps.names()
                    ),
                ));
            }
            if step.step_type == "external.process" {
                validate_external_process(&step.inputs, &loc, &mut errors);
            }
            if let Some(Value::String(resource)) = step.inputs.get("resource") {
                if !resource.contains("{{") && !spec.resources.contains_key(resource) {
                    errors.push(ValidationIssue::new(
                        "semantic:unknown_resource",
                        format!("{loc}.inputs.resource"),
                        format!(
                            "Step '{}' references undeclared resource: {resource}",
                            step.id
                        ),
                    ));
                }
            }
        }
    }

    // `when` grammar.
    for (j_i, job) in spec.jobs.iter().enumerate() {
        if let Some(when) = &job.when {
            if let Err(err) = WhenExpr::parse(when) {
                errors.push(ValidationIssue::new(
                    "semantic:invalid_when",
                    format!("jobs[{j_i}].when"),
                    err.to_string(),
                ));
            }
        }
    }

    // Resources: connector registration, env-only template scan, decode
    // concatenation rule.
    for (name, resource) in &spec.resources {
        if !connectors.contains(&resource.kind, &resource.driver) {
            errors.push(ValidationIssue::new(
                "semantic:unknown_connector",
                format!("resources.{name}"),
                format!(
                    "No connector registered for kind={} driver={}",
                    resource.kind, resource.driver
                ),
            ));
        }
        if opts.mode == RunMode::Enterprise
            && resource.kind == "archive"
            && !opts.archive_allowlist.contains(&resource.driver)
        {
            errors.push(ValidationIssue::new(
                "semantic:enterprise_archive_driver",
                format!("resources.{name}.driver"),
                format!(
                    "Enterprise mode requires archive driver in {:?}; got {:?}",
                    opts.archive_allowlist, resource.driver
                ),
            ));
        }

        let mut env_vars = serde_json::Map::new();
        env_vars.insert("env".to_string(), env_value(env));
        let env_vars = Value::Object(env_vars);
        for (section, subtree) in [("config", &resource.config), ("options", &resource.options)] {
            record_render_result(
                resolver::render_value(&Value::Object(subtree.clone()), Scope::resource(&env_vars)),
                &format!("resources.{name}.{section}"),
                opts.strict_env,
                &mut errors,
                &mut warnings,
            );
        }

        match resources::collect_decode_requests(&resource.decode) {
            Ok(requests) => {
                for (section, path) in requests {
                    let raw_root = match section {
                        resources::DecodeSection::Config => &resource.config,
                        resources::DecodeSection::Options => &resource.options,
                    };
                    if let Some(Value::String(raw)) = resources::get_by_path(raw_root, &path) {
                        if (raw.contains("{{") || raw.contains("}}"))
                            && !resolver::is_standalone_token(raw)
                        {
                            errors.push(ValidationIssue::new(
                                "template:syntax",
                                format!("resources.{name}.decode"),
                                "Decode target must be a standalone template token like '{{TOKEN}}' (no prefix/suffix)".to_string(),
                            ));
                        }
                    }
                }
            }
            Err(err) => errors.push(ValidationIssue::new(
                "template:syntax",
                format!("resources.{name}.decode"),
                err.to_string(),
            )),
        }
    }

    // Flow metadata: env-only template scan.
    {
        let mut env_vars = serde_json::Map::new();
        env_vars.insert("env".to_string(), env_value(env));
        let env_vars = Value::Object(env_vars);
        let meta = serde_json::to_value(&spec.flow).unwrap_or(Value::Null);
        record_render_result(
            resolver::render_value(&meta, Scope::flow_meta(&env_vars)),
            "flow",
            opts.strict_env,
            &mut errors,
            &mut warnings,
        );
    }

    // Step inputs/outputs: probe render under the full runtime root set.
    let probe = serde_json::json!({
        "env": env_value(env),
        "steps": {},
        "job": {},
        "jobs": {},
        "run_id": "RUN_ID",
        "flow_id": "FLOW_ID",
        "result": {},
    });
    for (j_i, job) in spec.jobs.iter().enumerate() {
        for (s_i, step) in job.steps.iter().enumerate() {
            scan_step_templates(
                step,
                &format!("jobs[{j_i}].steps[{s_i}]"),
                &probe,
                opts.strict_env,
                &mut errors,
                &mut warnings,
            );
        }
    }

    ValidationReport {
        ok: errors.is_empty(),
        errors,
        warnings,
    }
}

/// Scan a profiles document (resource semantics: `env.*` only; decode
/// values must be standalone tokens when templated).
#[must_use]
pub fn validate_profiles(
    profiles: &ProfilesFile,
    env: &BTreeMap<String, String>,
    strict_env: bool,
) -> ValidationReport {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    let mut env_vars = serde_json::Map::new();
    env_vars.insert("env".to_string(), env_value(env));
    let env_vars = Value::Object(env_vars);

    for (name, profile) in profiles {
        for (section, subtree) in [("config", &profile.config), ("options", &profile.options)] {
            record_render_result(
                resolver::render_value(&Value::Object(subtree.clone()), Scope::resource(&env_vars)),
                &format!("profiles.{name}.{section}"),
                strict_env,
                &mut errors,
                &mut warnings,
            );
        }

        let mut strings = Vec::new();
        let decode_tree = Value::Object(profile.decode.clone());
        iter_strings(&decode_tree, "", &mut strings);
        for (loc, s) in strings {
            if s.contains("{{") && !resolver::is_standalone_token(s) {
                errors.push(ValidationIssue::new(
                    "template:syntax",
                    format!("profiles.{name}.decode.{loc}"),
                    aetherflow_types::error::UNSUPPORTED_TEMPLATE_MSG.to_string(),
                ));
            }
        }
    }

    ValidationReport {
        ok: errors.is_empty(),
        errors,
        warnings,
    }
}
