//! Run, job, and step summaries emitted by the observer at end of run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::state::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub step_type: String,
    pub status: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default)]
    pub steps: Vec<StepSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub flow_id: String,
    pub run_id: String,
    pub duration_ms: u64,
    /// Job count per terminal status string.
    pub status_counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub jobs: Vec<JobSummary>,
}

impl RunSummary {
    /// True when no job failed or was blocked.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.status_counts.get("FAILED").copied().unwrap_or(0) == 0
            && self.status_counts.get("BLOCKED").copied().unwrap_or(0) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary_with(counts: &[(&str, u32)]) -> RunSummary {
        RunSummary {
            flow_id: "f".into(),
            run_id: "r".into(),
            duration_ms: 10,
            status_counts: counts
                .iter()
                .map(|(k, v)| ((*k).to_string(), *v))
                .collect(),
            jobs: vec![],
        }
    }

    #[test]
    fn ok_when_all_success() {
        assert!(summary_with(&[("SUCCESS", 2), ("SKIPPED", 1)]).ok());
    }

    #[test]
    fn not_ok_when_failed_or_blocked() {
        assert!(!summary_with(&[("SUCCESS", 1), ("FAILED", 1)]).ok());
        assert!(!summary_with(&[("BLOCKED", 1)]).ok());
    }

    #[test]
    fn serde_roundtrip() {
        let s = RunSummary {
            flow_id: "f".into(),
            run_id: "r".into(),
            duration_ms: 42,
            status_counts: BTreeMap::from([("SUCCESS".to_string(), 1)]),
            jobs: vec![JobSummary {
                job_id: "j".into(),
                status: JobStatus::Success,
                duration_ms: 40,
                skip_reason: None,
                steps: vec![StepSummary {
                    step_id: "s".into(),
                    step_type: "external.process".into(),
                    status: "SUCCESS".into(),
                    duration_ms: 39,
                }],
            }],
        };
        let json = serde_json::to_string(&s).unwrap();
        let back: RunSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
    }
}
