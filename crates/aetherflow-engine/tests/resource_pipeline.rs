//! Resource resolution through full runs: profile overlay, secrets decode,
//! eager connector construction, and pre-job abort on connector failure.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use aetherflow_engine::{Connector, Engine, RunOptions, Settings};
use aetherflow_types::flow::ConfigMap;
use aetherflow_types::FlowError;

struct RecordingConnector {
    kind: String,
}

impl Connector for RecordingConnector {
    fn kind(&self) -> &str {
        &self.kind
    }
}

#[derive(Clone, Default)]
struct BuiltConfigs(Arc<Mutex<Vec<(String, ConfigMap)>>>);

impl BuiltConfigs {
    fn names(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    fn config_for(&self, name: &str) -> Option<ConfigMap> {
        self.0
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c.clone())
    }
}

struct ReversingSecrets;

impl aetherflow_engine::SecretsHook for ReversingSecrets {
    fn decode(&self, value: &str) -> Result<String, FlowError> {
        Ok(value.chars().rev().collect())
    }
}

fn engine(built: &BuiltConfigs) -> Engine {
    let sink = built.clone();
    Engine::builder()
        .register_connector("db", "postgres", move |init| {
            sink.0
                .lock()
                .unwrap()
                .push((init.name.clone(), init.config.clone()));
            Ok(Arc::new(RecordingConnector {
                kind: init.kind.clone(),
            }) as Arc<dyn Connector>)
        })
        .secrets_hook(Arc::new(ReversingSecrets))
        .build()
}

fn write_flow(tmp: &Path, body: &str) -> PathBuf {
    let path = tmp.join("flow.yaml");
    std::fs::write(&path, body).unwrap();
    path
}

fn flow_body(tmp: &Path, resources: &str) -> String {
    format!(
        "version: 1\nflow:\n  id: resourceful\n  workspace:\n    root: {work}\n    cleanup_policy: never\n  state:\n    path: {state}\nresources:\n{resources}jobs: []\n",
        work = tmp.join("work").display(),
        state = tmp.join("state.sqlite").display(),
    )
}

fn settings_with_profiles(profiles_json: &str) -> Settings {
    let env = BTreeMap::from([(
        "AETHERFLOW_PROFILES_JSON".to_string(),
        profiles_json.to_string(),
    )]);
    Settings::from_env(&env).unwrap()
}

#[test]
fn every_declared_resource_yields_a_connector() {
    let tmp = tempfile::tempdir().unwrap();
    let built = BuiltConfigs::default();

    let body = flow_body(
        tmp.path(),
        "  db_main:\n    kind: db\n    driver: postgres\n    config:\n      host: a\n  db_audit:\n    kind: db\n    driver: postgres\n    config:\n      host: b\n",
    );
    let flow = write_flow(tmp.path(), &body);

    let summary = engine(&built)
        .run_flow(&flow, RunOptions::default())
        .unwrap();

    let mut names = built.names();
    names.sort();
    assert_eq!(names, vec!["db_audit".to_string(), "db_main".to_string()]);
    assert!(summary.status_counts.is_empty());
}

#[test]
fn profile_overlay_and_decode_reach_the_connector() {
    let tmp = tempfile::tempdir().unwrap();
    let built = BuiltConfigs::default();

    let body = flow_body(
        tmp.path(),
        "  db_main:\n    kind: db\n    driver: postgres\n    profile: prod\n    config:\n      database: etl\n      password: terces\n    decode:\n      config:\n        password: true\n",
    );
    let flow = write_flow(tmp.path(), &body);

    let profiles = r#"{"prod": {"config": {"host": "prod-db01", "database": "ignored"}}}"#;
    let opts = RunOptions {
        settings: Some(settings_with_profiles(profiles)),
        ..RunOptions::default()
    };
    engine(&built).run_flow(&flow, opts).unwrap();

    let config = built.config_for("db_main").unwrap();
    assert_eq!(config["host"], "prod-db01", "profile fills missing keys");
    assert_eq!(config["database"], "etl", "resource overrides profile");
    assert_eq!(config["password"], "secret", "decode hook applied");
}

#[test]
fn connector_failure_aborts_before_any_job() {
    let tmp = tempfile::tempdir().unwrap();

    let engine = Engine::builder()
        .register_connector("db", "postgres", |_init| {
            Err(FlowError::Connector("connection refused".to_string()))
        })
        .build();

    let body = format!(
        "version: 1\nflow:\n  id: doomed\n  workspace:\n    root: {work}\n    cleanup_policy: never\n  state:\n    path: {state}\nresources:\n  db_main:\n    kind: db\n    driver: postgres\njobs:\n  - id: never_runs\n    steps:\n      - id: s\n        type: external.process\n        inputs:\n          command: ['true']\n",
        work = tmp.path().join("work").display(),
        state = tmp.path().join("state.sqlite").display(),
    );
    let flow = write_flow(tmp.path(), &body);

    let err = engine.run_flow(&flow, RunOptions::default()).unwrap_err();
    assert!(matches!(err, FlowError::Connector(_)));

    let state = aetherflow_state::SqliteStateStore::open(&tmp.path().join("state.sqlite")).unwrap();
    use aetherflow_state::StateStore;
    assert!(
        state.get_job_status("never_runs", "any").unwrap().is_none(),
        "no job rows when resources fail to build"
    );
}

#[test]
fn undeclared_connector_kind_fails_validation() {
    let tmp = tempfile::tempdir().unwrap();
    let built = BuiltConfigs::default();

    let body = flow_body(
        tmp.path(),
        "  queue:\n    kind: mq\n    driver: rabbit\n",
    );
    let flow = write_flow(tmp.path(), &body);

    let report = engine(&built)
        .validate(&flow, None)
        .unwrap();
    assert!(!report.ok);
    assert!(report
        .errors
        .iter()
        .any(|e| e.code == "semantic:unknown_connector"));
}
