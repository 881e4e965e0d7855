//! The engine: validation entrypoint and the job/step lifecycle.
//!
//! One run: build the env snapshot, validate the spec, resolve resources,
//! then execute jobs in declaration order, steps sequentially within each
//! job. Per-step outcomes persist in the state store, so rerunning with
//! the same run id resumes instead of repeating completed work.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::{json, Value};

use aetherflow_state::{SqliteStateStore, StateStore};
use aetherflow_types::error::{FlowError, Result};
use aetherflow_types::flow::{
    CleanupPolicy, ConfigMap, FlowMeta, FlowSpec, JobSpec, OnNoData, ProfilesFile,
};
use aetherflow_types::state::{JobStatus, StepStatus};
use aetherflow_types::summary::RunSummary;

use crate::bundle::{self, BundleContext};
use crate::connectors::{Connector, Connectors};
use crate::context::{new_run_id, RunContext};
use crate::envfiles;
use crate::observer::{MetricsSink, NoopMetrics, RunObserver};
use crate::registry::{ConnectorInit, ConnectorRegistry, StepRegistry};
use crate::resolver::{self, Scope};
use crate::resources;
use crate::secrets::SecretsHook;
use crate::settings::Settings;
use crate::spec::parser;
use crate::spec::validator::{self, ValidateOptions, ValidationReport};
use crate::steps::{Step, StepExec, StepInit};
use crate::when::WhenExpr;

/// Per-invocation options for [`Engine::run_flow`].
#[derive(Default)]
pub struct RunOptions {
    /// Caller-supplied run id; omitted means a fresh one (no resume).
    pub run_id: Option<String>,
    /// Execute only the named job.
    pub only_job: Option<String>,
    /// Bundle manifest to apply before loading the flow.
    pub manifest: Option<PathBuf>,
    /// Explicit settings; omitted means derive from the env snapshot.
    pub settings: Option<Settings>,
}

pub struct EngineBuilder {
    steps: StepRegistry,
    connectors: ConnectorRegistry,
    secrets: Option<Arc<dyn SecretsHook>>,
    metrics: Arc<dyn MetricsSink>,
}

impl EngineBuilder {
    /// Register a custom step type.
    #[must_use]
    pub fn register_step<F>(mut self, step_type: &str, factory: F) -> Self
    where
        F: Fn(StepInit) -> Result<Box<dyn Step>> + Send + Sync + 'static,
    {
        self.steps.register(step_type, factory);
        self
    }

    /// Register a connector constructor under `(kind, driver)`.
    #[must_use]
    pub fn register_connector<F>(mut self, kind: &str, driver: &str, factory: F) -> Self
    where
        F: Fn(&ConnectorInit) -> Result<Arc<dyn Connector>> + Send + Sync + 'static,
    {
        self.connectors.register(kind, driver, factory);
        self
    }

    /// Install the secrets hook invoked during resource resolution.
    #[must_use]
    pub fn secrets_hook(mut self, hook: Arc<dyn SecretsHook>) -> Self {
        self.secrets = Some(hook);
        self
    }

    /// Install a metrics sink receiving observer events.
    #[must_use]
    pub fn metrics_sink(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = sink;
        self
    }

    #[must_use]
    pub fn build(self) -> Engine {
        Engine {
            steps: Arc::new(self.steps),
            connectors: Arc::new(self.connectors),
            secrets: self.secrets,
            metrics: self.metrics,
        }
    }
}

/// Flow validation and execution engine.
pub struct Engine {
    steps: Arc<StepRegistry>,
    connectors: Arc<ConnectorRegistry>,
    secrets: Option<Arc<dyn SecretsHook>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Engine {
    /// Builder pre-loaded with the built-in steps.
    #[must_use]
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            steps: StepRegistry::with_builtins(),
            connectors: ConnectorRegistry::new(),
            secrets: None,
            metrics: Arc::new(NoopMetrics),
        }
    }

    fn env_snapshot(&self, manifest: Option<&Path>) -> Result<(BTreeMap<String, String>, Option<BundleContext>)> {
        let mut snapshot = envfiles::process_env_snapshot();
        envfiles::apply_env_files_var(&mut snapshot)
            .map_err(|e| FlowError::Spec(format!("{e:#}")))?;
        let bundle = match manifest {
            Some(path) => Some(bundle::apply_manifest(path, &mut snapshot)?),
            None => None,
        };
        Ok((snapshot, bundle))
    }

    fn load_profiles(&self, settings: &Settings) -> Result<ProfilesFile> {
        if let Some(raw) = &settings.profiles_json {
            return parser::parse_profiles_json(raw).map_err(|e| FlowError::Spec(format!("{e:#}")));
        }
        if let Some(path) = &settings.profiles_file {
            return parser::parse_profiles_path(path).map_err(|e| FlowError::Spec(format!("{e:#}")));
        }
        Ok(ProfilesFile::new())
    }

    fn validate_options(
        settings: &Settings,
        bundle: Option<&BundleContext>,
    ) -> ValidateOptions {
        ValidateOptions {
            strict_env: settings.validate_env_strict,
            mode: settings.mode,
            archive_allowlist: bundle
                .map(|b| b.manifest.zip_drivers.clone())
                .unwrap_or_else(BTreeSet::new),
        }
    }

    /// Validate a flow (schema, semantics, templates, profiles) without
    /// executing anything.
    ///
    /// # Errors
    ///
    /// Fails on environment/bundle problems; validation findings are
    /// returned inside the report.
    pub fn validate(&self, flow_path: &Path, manifest: Option<&Path>) -> Result<ValidationReport> {
        let (snapshot, bundle) = self.env_snapshot(manifest)?;
        let settings = Settings::from_env(&snapshot)?;
        let resolved_path = bundle
            .as_ref()
            .map_or_else(|| flow_path.to_path_buf(), |b| b.resolve_flow_path(flow_path));

        let spec = match parser::parse_flow_path(&resolved_path) {
            Ok(spec) => spec,
            Err(err) => {
                return Ok(ValidationReport {
                    ok: false,
                    errors: vec![validator::ValidationIssue {
                        code: "schema:parse".to_string(),
                        loc: resolved_path.display().to_string(),
                        msg: format!("{err:#}"),
                    }],
                    warnings: Vec::new(),
                })
            }
        };

        let opts = Self::validate_options(&settings, bundle.as_ref());
        let mut report =
            validator::validate_flow(&spec, &self.steps, &self.connectors, &snapshot, &opts);

        let profiles = self.load_profiles(&settings)?;
        if !profiles.is_empty() {
            let profile_report =
                validator::validate_profiles(&profiles, &snapshot, settings.validate_env_strict);
            report.errors.extend(profile_report.errors);
            report.warnings.extend(profile_report.warnings);
            report.ok = report.errors.is_empty();
        }
        Ok(report)
    }

    /// Validate then execute a flow, returning the run summary.
    ///
    /// # Errors
    ///
    /// Validation failures surface as spec/resolver errors before any job
    /// executes; a step failure marks its job `FAILED` and terminates the
    /// run with the step's error.
    #[allow(clippy::too_many_lines)]
    pub fn run_flow(&self, flow_path: &Path, opts: RunOptions) -> Result<RunSummary> {
        let (snapshot, bundle) = self.env_snapshot(opts.manifest.as_deref())?;
        let settings = match opts.settings {
            Some(settings) => settings,
            None => Settings::from_env(&snapshot)?,
        };
        let resolved_path = bundle
            .as_ref()
            .map_or_else(|| flow_path.to_path_buf(), |b| b.resolve_flow_path(flow_path));

        let spec =
            parser::parse_flow_path(&resolved_path).map_err(|e| FlowError::Spec(format!("{e:#}")))?;

        let profiles = self.load_profiles(&settings)?;
        let validate_opts = Self::validate_options(&settings, bundle.as_ref());
        validator::validate_flow(&spec, &self.steps, &self.connectors, &snapshot, &validate_opts)
            .into_result()?;
        if !profiles.is_empty() {
            validator::validate_profiles(&profiles, &snapshot, settings.validate_env_strict)
                .into_result()?;
        }

        if self.secrets.is_none()
            && (settings.secrets_module.is_some() || settings.secrets_path.is_some())
        {
            tracing::warn!(
                "AETHERFLOW_SECRETS_MODULE/AETHERFLOW_SECRETS_PATH are set but no secrets hook \
                 is installed on the engine; decode-marked resources will fail"
            );
        }

        let meta = render_flow_meta(&spec.flow, &snapshot)?;
        if meta.state.backend != "sqlite" {
            return Err(FlowError::Spec(format!(
                "Unsupported state backend: {}",
                meta.state.backend
            )));
        }

        let flow_id = meta.id.clone();
        let run_id = opts.run_id.clone().unwrap_or_else(new_run_id);

        let state: Arc<dyn StateStore> =
            Arc::new(SqliteStateStore::open(Path::new(&meta.state.path))?);

        let resolved = resources::build_resources(
            &spec,
            &profiles,
            &snapshot,
            settings.mode,
            &validate_opts.archive_allowlist,
            self.secrets.as_deref(),
        )?;
        let connectors = Connectors::new(
            Arc::clone(&self.connectors),
            resolved,
            settings.connector_cache_default,
        );
        // Instantiate every declared resource up front; construction
        // failures abort before any job executes.
        let resource_names: Vec<String> =
            connectors.names().into_iter().map(String::from).collect();
        for name in &resource_names {
            connectors.get(name)?;
        }

        let ctx = RunContext {
            settings: settings.clone(),
            flow_id: flow_id.clone(),
            run_id: run_id.clone(),
            env: snapshot,
            work_root: PathBuf::from(&meta.workspace.root),
            layout: meta.workspace.layout.clone(),
            state,
            connectors,
        };

        let mut observer = RunObserver::new(
            &flow_id,
            &run_id,
            settings.log_format,
            Arc::clone(&self.metrics),
        );
        observer.run_start(&resolved_path.display().to_string());

        let outcome = self.run_jobs(&spec, &meta, &ctx, &mut observer, opts.only_job.as_deref());
        ctx.connectors.close_all();
        let statuses = outcome?;

        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for status in statuses.values() {
            *counts.entry(status.to_string()).or_insert(0) += 1;
        }
        Ok(observer.run_end(counts))
    }

    fn run_jobs(
        &self,
        spec: &FlowSpec,
        meta: &FlowMeta,
        ctx: &RunContext,
        observer: &mut RunObserver,
        only_job: Option<&str>,
    ) -> Result<BTreeMap<String, JobStatus>> {
        let mut statuses: BTreeMap<String, JobStatus> = BTreeMap::new();
        let mut jobs_view = serde_json::Map::new();
        let env_value = env_to_value(&ctx.env);

        for job in &spec.jobs {
            if only_job.is_some_and(|only| only != job.id) {
                continue;
            }

            if !job.depends_on.is_empty()
                && !job
                    .depends_on
                    .iter()
                    .all(|dep| statuses.get(dep) == Some(&JobStatus::Success))
            {
                tracing::warn!(job_id = %job.id, depends_on = ?job.depends_on, "job blocked");
                ctx.state
                    .set_job_status(&job.id, &ctx.run_id, JobStatus::Blocked)?;
                statuses.insert(job.id.clone(), JobStatus::Blocked);
                jobs_view.insert(
                    job.id.clone(),
                    json!({"status": "BLOCKED", "outputs": {}}),
                );
                continue;
            }

            if let Some(when) = &job.when {
                let view = json!({
                    "jobs": Value::Object(jobs_view.clone()),
                    "env": env_value.clone(),
                });
                let gate = WhenExpr::parse(when)?
                    .map_or(Ok(true), |expr| expr.eval(&view))
                    .map_err(|e| {
                        FlowError::Spec(format!("Invalid job.when for job_id={}: {e}", job.id))
                    })?;
                if !gate {
                    tracing::info!(job_id = %job.id, when = %when, "job skipped by gate");
                    ctx.state
                        .set_job_status(&job.id, &ctx.run_id, JobStatus::Skipped)?;
                    statuses.insert(job.id.clone(), JobStatus::Skipped);
                    jobs_view.insert(
                        job.id.clone(),
                        json!({"status": "SKIPPED", "outputs": {}, "skip_reason": "condition=false"}),
                    );
                    continue;
                }
            }

            ctx.state
                .set_job_status(&job.id, &ctx.run_id, JobStatus::Running)?;
            observer.job_start(&job.id);
            let job_dir = ctx.job_dir(&job.id)?;
            ctx.artifacts_dir(&job.id)?;
            ctx.scratch_dir(&job.id)?;
            ctx.manifests_dir(&job.id)?;

            match self.run_steps(job, ctx, observer, &jobs_view, &env_value) {
                Ok((status, outputs, skip_reason)) => {
                    ctx.state.set_job_status(&job.id, &ctx.run_id, status)?;
                    statuses.insert(job.id.clone(), status);
                    let mut entry = serde_json::Map::new();
                    entry.insert("status".to_string(), Value::String(status.to_string()));
                    entry.insert("outputs".to_string(), Value::Object(outputs));
                    if let Some(reason) = &skip_reason {
                        entry.insert("skip_reason".to_string(), Value::String(reason.clone()));
                    }
                    jobs_view.insert(job.id.clone(), Value::Object(entry));
                    observer.job_end(&job.id, status, skip_reason.as_deref());

                    let delete = match meta.workspace.cleanup_policy {
                        CleanupPolicy::Always => true,
                        CleanupPolicy::OnSuccess => status == JobStatus::Success,
                        CleanupPolicy::Never => false,
                    };
                    if delete {
                        let _ = std::fs::remove_dir_all(&job_dir);
                        tracing::info!(job_id = %job.id, "job workspace cleaned up");
                    }
                }
                Err(err) => {
                    ctx.state
                        .set_job_status(&job.id, &ctx.run_id, JobStatus::Failed)?;
                    statuses.insert(job.id.clone(), JobStatus::Failed);
                    tracing::error!(job_id = %job.id, error = %err, "job failed");
                    observer.job_end(&job.id, JobStatus::Failed, None);
                    if meta.workspace.cleanup_policy == CleanupPolicy::Always {
                        let _ = std::fs::remove_dir_all(&job_dir);
                    }
                    return Err(err);
                }
            }
        }
        Ok(statuses)
    }

    #[allow(clippy::too_many_lines)]
    fn run_steps(
        &self,
        job: &JobSpec,
        ctx: &RunContext,
        observer: &mut RunObserver,
        jobs_view: &serde_json::Map<String, Value>,
        env_value: &Value,
    ) -> Result<(JobStatus, ConfigMap, Option<String>)> {
        let mut step_outputs = serde_json::Map::new();
        let mut job_outputs = ConfigMap::new();
        let mut skip_rest = false;
        let mut skip_reason: Option<String> = None;

        for step in &job.steps {
            if skip_rest {
                tracing::info!(
                    job_id = %job.id,
                    step_id = %step.id,
                    reason = skip_reason.as_deref().unwrap_or(""),
                    "step skipped (job short-circuit)"
                );
                ctx.state
                    .set_step_status(&job.id, &ctx.run_id, &step.id, StepStatus::Skipped)?;
                step_outputs.insert(
                    step.id.clone(),
                    json!({"skipped": true, "reason": skip_reason.clone()}),
                );
                continue;
            }

            if let Some(prev) = ctx.state.get_step_status(&job.id, &ctx.run_id, &step.id)? {
                tracing::info!(
                    job_id = %job.id,
                    step_id = %step.id,
                    prev = %prev,
                    "step skipped (resume)"
                );
                step_outputs.insert(
                    step.id.clone(),
                    json!({"skipped": true, "resumed": true, "status": prev.as_str()}),
                );
                // Promote declared outputs so downstream gates stay
                // evaluable; the runtime result is gone, so render
                // leniently against an empty one.
                if !step.outputs.is_empty() {
                    let vars = step_scope(
                        env_value,
                        &step_outputs,
                        &job.id,
                        &job_outputs,
                        jobs_view,
                        ctx,
                        None,
                    );
                    let rendered = resolver::render_value(
                        &Value::Object(step.outputs.clone()),
                        Scope::step_outputs(&vars).lenient(),
                    )?;
                    merge_outputs(&mut job_outputs, rendered);
                }
                continue;
            }

            let vars = step_scope(
                env_value,
                &step_outputs,
                &job.id,
                &job_outputs,
                jobs_view,
                ctx,
                None,
            );
            let input_scope = if ctx.settings.strict_templates {
                Scope::step(&vars)
            } else {
                Scope::step(&vars).lenient()
            };
            let rendered_inputs =
                match resolver::render_value(&Value::Object(step.inputs.clone()), input_scope)? {
                    Value::Object(map) => map,
                    _ => ConfigMap::new(),
                };

            observer.step_start(&job.id, &step.id, &step.step_type);
            let instance = self.steps.create(
                &step.step_type,
                StepInit {
                    id: step.id.clone(),
                    inputs: rendered_inputs,
                },
            )?;
            let exec = StepExec {
                ctx,
                job_id: &job.id,
                step_id: &step.id,
                steps: &self.steps,
            };
            let outcome = instance.run(&exec)?;

            ctx.state
                .set_step_status(&job.id, &ctx.run_id, &step.id, outcome.status)?;
            step_outputs.insert(step.id.clone(), Value::Object(outcome.outputs.clone()));

            if !step.outputs.is_empty() {
                let vars = step_scope(
                    env_value,
                    &step_outputs,
                    &job.id,
                    &job_outputs,
                    jobs_view,
                    ctx,
                    Some(&outcome.outputs),
                );
                let rendered = resolver::render_value(
                    &Value::Object(step.outputs.clone()),
                    Scope::step_outputs(&vars),
                )?;
                merge_outputs(&mut job_outputs, rendered);
            }

            observer.step_end(&job.id, &step.id, &step.step_type, outcome.status.as_str());

            if outcome.status == StepStatus::Skipped && step.on_no_data == Some(OnNoData::SkipJob)
            {
                skip_rest = true;
                skip_reason = outcome
                    .outputs
                    .get("reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .or_else(|| Some("step requested skip_job".to_string()));
                tracing::info!(
                    job_id = %job.id,
                    step_id = %step.id,
                    reason = skip_reason.as_deref().unwrap_or(""),
                    "job short-circuit"
                );
            }
        }

        if skip_rest {
            let mut all_recorded = true;
            for step in &job.steps {
                if ctx
                    .state
                    .get_step_status(&job.id, &ctx.run_id, &step.id)?
                    .is_none()
                {
                    all_recorded = false;
                    break;
                }
            }
            if all_recorded {
                return Ok((JobStatus::Skipped, job_outputs, skip_reason));
            }
        }
        Ok((JobStatus::Success, job_outputs, None))
    }
}

fn env_to_value(env: &BTreeMap<String, String>) -> Value {
    Value::Object(
        env.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

fn merge_outputs(job_outputs: &mut ConfigMap, rendered: Value) {
    if let Value::Object(map) = rendered {
        for (key, value) in map {
            job_outputs.insert(key, value);
        }
    }
}

fn step_scope(
    env_value: &Value,
    step_outputs: &serde_json::Map<String, Value>,
    job_id: &str,
    job_outputs: &ConfigMap,
    jobs_view: &serde_json::Map<String, Value>,
    ctx: &RunContext,
    result: Option<&ConfigMap>,
) -> Value {
    json!({
        "env": env_value.clone(),
        "steps": Value::Object(step_outputs.clone()),
        "job": {"id": job_id, "outputs": Value::Object(job_outputs.clone())},
        "jobs": Value::Object(jobs_view.clone()),
        "run_id": ctx.run_id.clone(),
        "flow_id": ctx.flow_id.clone(),
        "result": Value::Object(result.cloned().unwrap_or_default()),
    })
}

/// Render flow metadata under the env-only scope back into its typed form.
fn render_flow_meta(meta: &FlowMeta, env: &BTreeMap<String, String>) -> Result<FlowMeta> {
    let mut vars = serde_json::Map::new();
    vars.insert("env".to_string(), env_to_value(env));
    let vars = Value::Object(vars);

    let raw = serde_json::to_value(meta)
        .map_err(|e| FlowError::Spec(format!("flow metadata serialization failed: {e}")))?;
    let rendered = resolver::render_value(&raw, Scope::flow_meta(&vars))?;
    serde_json::from_value(rendered)
        .map_err(|e| FlowError::Spec(format!("flow metadata invalid after templating: {e}")))
}
