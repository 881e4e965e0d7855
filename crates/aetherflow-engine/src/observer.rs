//! Structured lifecycle events and the run summary.
//!
//! Emits `run_start` / `job_start` / `step_start` / `step_end` / `job_end`
//! / `run_summary` events, collects per-job and per-step timings, and
//! forwards every event to an optional metrics sink. Sink failures are
//! logged and never break the run.

use std::collections::BTreeMap;
use std::time::Instant;

use aetherflow_types::state::JobStatus;
use aetherflow_types::summary::{JobSummary, RunSummary, StepSummary};

use crate::settings::LogFormat;

/// Optional metrics sink. A stable hook point for production metrics
/// stacks without forcing a dependency on any of them.
pub trait MetricsSink: Send + Sync {
    fn on_run_start(&self, _flow_id: &str, _run_id: &str) {}
    fn on_run_end(&self, _flow_id: &str, _run_id: &str, _summary: &RunSummary) {}
    fn on_job_start(&self, _flow_id: &str, _run_id: &str, _job_id: &str) {}
    fn on_job_end(
        &self,
        _flow_id: &str,
        _run_id: &str,
        _job_id: &str,
        _status: JobStatus,
        _duration_ms: u64,
    ) {
    }
    fn on_step_start(&self, _flow_id: &str, _run_id: &str, _job_id: &str, _step_id: &str) {}
    fn on_step_end(
        &self,
        _flow_id: &str,
        _run_id: &str,
        _job_id: &str,
        _step_id: &str,
        _status: &str,
        _duration_ms: u64,
    ) {
    }
}

/// Default sink: does nothing.
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

fn dur_ms(t0: Instant) -> u64 {
    u64::try_from(t0.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Collects run/job/step timings and emits the end-of-run summary.
pub struct RunObserver {
    flow_id: String,
    run_id: String,
    log_format: LogFormat,
    metrics: std::sync::Arc<dyn MetricsSink>,
    run_t0: Instant,
    job_t0: BTreeMap<String, Instant>,
    step_t0: BTreeMap<(String, String), Instant>,
    jobs: Vec<JobSummary>,
}

impl RunObserver {
    #[must_use]
    pub fn new(
        flow_id: &str,
        run_id: &str,
        log_format: LogFormat,
        metrics: std::sync::Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            run_id: run_id.to_string(),
            log_format,
            metrics,
            run_t0: Instant::now(),
            job_t0: BTreeMap::new(),
            step_t0: BTreeMap::new(),
            jobs: Vec::new(),
        }
    }

    fn log_event(&self, event: &str, fields: &[(&str, String)]) {
        match self.log_format {
            LogFormat::Json => {
                let mut payload = serde_json::Map::new();
                payload.insert(
                    "event".to_string(),
                    serde_json::Value::String(event.to_string()),
                );
                payload.insert(
                    "flow_id".to_string(),
                    serde_json::Value::String(self.flow_id.clone()),
                );
                payload.insert(
                    "run_id".to_string(),
                    serde_json::Value::String(self.run_id.clone()),
                );
                for (key, value) in fields {
                    payload.insert(
                        (*key).to_string(),
                        serde_json::Value::String(value.clone()),
                    );
                }
                tracing::info!("{}", serde_json::Value::Object(payload));
            }
            LogFormat::Text => {
                let mut line = format!(
                    "{event} flow_id={} run_id={}",
                    self.flow_id, self.run_id
                );
                for (key, value) in fields {
                    line.push_str(&format!(" {key}={value}"));
                }
                tracing::info!("{line}");
            }
        }
    }

    fn job_summary_mut(&mut self, job_id: &str) -> Option<&mut JobSummary> {
        self.jobs.iter_mut().find(|j| j.job_id == job_id)
    }

    pub fn run_start(&mut self, flow_path: &str) {
        self.run_t0 = Instant::now();
        self.log_event("run_start", &[("flow", flow_path.to_string())]);
        self.metrics.on_run_start(&self.flow_id, &self.run_id);
    }

    pub fn job_start(&mut self, job_id: &str) {
        self.job_t0.insert(job_id.to_string(), Instant::now());
        self.jobs.push(JobSummary {
            job_id: job_id.to_string(),
            status: JobStatus::Running,
            duration_ms: 0,
            skip_reason: None,
            steps: Vec::new(),
        });
        self.log_event("job_start", &[("job_id", job_id.to_string())]);
        self.metrics.on_job_start(&self.flow_id, &self.run_id, job_id);
    }

    pub fn step_start(&mut self, job_id: &str, step_id: &str, step_type: &str) {
        self.step_t0
            .insert((job_id.to_string(), step_id.to_string()), Instant::now());
        self.log_event(
            "step_start",
            &[
                ("job_id", job_id.to_string()),
                ("step_id", step_id.to_string()),
                ("step_type", step_type.to_string()),
            ],
        );
        self.metrics
            .on_step_start(&self.flow_id, &self.run_id, job_id, step_id);
    }

    pub fn step_end(&mut self, job_id: &str, step_id: &str, step_type: &str, status: &str) {
        let duration_ms = self
            .step_t0
            .remove(&(job_id.to_string(), step_id.to_string()))
            .map_or(0, dur_ms);
        if let Some(job) = self.job_summary_mut(job_id) {
            job.steps.push(StepSummary {
                step_id: step_id.to_string(),
                step_type: step_type.to_string(),
                status: status.to_string(),
                duration_ms,
            });
        }
        self.log_event(
            "step_end",
            &[
                ("job_id", job_id.to_string()),
                ("step_id", step_id.to_string()),
                ("step_type", step_type.to_string()),
                ("status", status.to_string()),
                ("duration_ms", duration_ms.to_string()),
            ],
        );
        self.metrics
            .on_step_end(&self.flow_id, &self.run_id, job_id, step_id, status, duration_ms);
    }

    pub fn job_end(&mut self, job_id: &str, status: JobStatus, skip_reason: Option<&str>) {
        let duration_ms = self.job_t0.remove(job_id).map_or(0, dur_ms);
        if let Some(job) = self.job_summary_mut(job_id) {
            job.status = status;
            job.duration_ms = duration_ms;
            job.skip_reason = skip_reason.map(str::to_string);
        }
        let mut fields = vec![
            ("job_id", job_id.to_string()),
            ("status", status.to_string()),
            ("duration_ms", duration_ms.to_string()),
        ];
        if let Some(reason) = skip_reason {
            fields.push(("skip_reason", reason.to_string()));
        }
        self.log_event("job_end", &fields);
        self.metrics
            .on_job_end(&self.flow_id, &self.run_id, job_id, status, duration_ms);
    }

    /// Emit the run summary and hand it back.
    pub fn run_end(&mut self, status_counts: BTreeMap<String, u32>) -> RunSummary {
        let summary = RunSummary {
            flow_id: self.flow_id.clone(),
            run_id: self.run_id.clone(),
            duration_ms: dur_ms(self.run_t0),
            status_counts,
            jobs: std::mem::take(&mut self.jobs),
        };
        match serde_json::to_string(&summary) {
            Ok(json) => self.log_event("run_summary", &[("summary", json)]),
            Err(err) => tracing::warn!(error = %err, "run summary serialization failed"),
        }
        self.metrics.on_run_end(&self.flow_id, &self.run_id, &summary);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSink {
        events: Arc<AtomicUsize>,
    }

    impl MetricsSink for CountingSink {
        fn on_run_start(&self, _f: &str, _r: &str) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn on_run_end(&self, _f: &str, _r: &str, _s: &RunSummary) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn on_job_start(&self, _f: &str, _r: &str, _j: &str) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn on_job_end(&self, _f: &str, _r: &str, _j: &str, _s: JobStatus, _d: u64) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn on_step_start(&self, _f: &str, _r: &str, _j: &str, _s: &str) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn on_step_end(&self, _f: &str, _r: &str, _j: &str, _s: &str, _st: &str, _d: u64) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn full_cycle(observer: &mut RunObserver) -> RunSummary {
        observer.run_start("flow.yaml");
        observer.job_start("j1");
        observer.step_start("j1", "s1", "external.process");
        observer.step_end("j1", "s1", "external.process", "SUCCESS");
        observer.job_end("j1", JobStatus::Success, None);
        observer.job_start("j2");
        observer.job_end("j2", JobStatus::Skipped, Some("condition=false"));
        observer.run_end(BTreeMap::from([
            ("SUCCESS".to_string(), 1),
            ("SKIPPED".to_string(), 1),
        ]))
    }

    #[test]
    fn summary_collects_jobs_and_steps() {
        let mut observer =
            RunObserver::new("f", "r", LogFormat::Text, Arc::new(NoopMetrics));
        let summary = full_cycle(&mut observer);

        assert_eq!(summary.flow_id, "f");
        assert_eq!(summary.jobs.len(), 2);
        assert_eq!(summary.jobs[0].status, JobStatus::Success);
        assert_eq!(summary.jobs[0].steps.len(), 1);
        assert_eq!(summary.jobs[0].steps[0].status, "SUCCESS");
        assert_eq!(summary.jobs[1].status, JobStatus::Skipped);
        assert_eq!(summary.jobs[1].skip_reason.as_deref(), Some("condition=false"));
        assert_eq!(summary.status_counts["SUCCESS"], 1);
        assert!(summary.ok());
    }

    #[test]
    fn metrics_sink_receives_all_events() {
        let events = Arc::new(AtomicUsize::new(0));
        let sink = CountingSink {
            events: Arc::clone(&events),
        };
        let mut observer = RunObserver::new("f", "r", LogFormat::Json, Arc::new(sink));
        full_cycle(&mut observer);
        // run_start + run_end + 2*(job_start + job_end) + step_start + step_end
        assert_eq!(events.load(Ordering::SeqCst), 8);
    }
}
