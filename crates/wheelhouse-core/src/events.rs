//! Append-only event log for one pipeline run.
//!
//! Shared by every job of a run; sequence numbers are assigned under a
//! single lock, so the log has a total order even with concurrent jobs.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::job::StageKind;
use crate::matrix::Platform;
use crate::publish::{ActionStatus, PublishAction};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    JobQueued,
    JobStarted,
    StageStarted { stage: StageKind },
    StageFinished { stage: StageKind, duration_ms: u64 },
    StageFailed { stage: StageKind, class: String, message: String },
    LintVerdict { platform: Platform, passed: bool },
    PublishAction { action: PublishAction, status: ActionStatus },
    JobFinished { succeeded: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineEvent {
    pub seq: u64,
    pub at: DateTime<Utc>,
    /// `None` for run-level events such as lint verdicts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, job_id: Option<Uuid>, kind: EventKind) -> u64 {
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        let seq = events.len() as u64 + 1;
        events.push(PipelineEvent {
            seq,
            at: Utc::now(),
            job_id,
            kind,
        });
        seq
    }

    pub fn job(&self, job_id: Uuid, kind: EventKind) -> u64 {
        self.record(Some(job_id), kind)
    }

    pub fn snapshot(&self) -> Vec<PipelineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialize events as JSON lines.
pub fn to_jsonl(events: &[PipelineEvent]) -> Result<String> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event)?);
        out.push('\n');
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic_across_clones() {
        let recorder = EventRecorder::new();
        let other = recorder.clone();
        let job = Uuid::new_v4();
        assert_eq!(recorder.job(job, EventKind::JobQueued), 1);
        assert_eq!(other.job(job, EventKind::JobStarted), 2);
        assert_eq!(recorder.len(), 2);
    }

    #[test]
    fn test_jsonl_export() {
        let recorder = EventRecorder::new();
        recorder.job(
            Uuid::new_v4(),
            EventKind::StageStarted {
                stage: StageKind::Build,
            },
        );
        recorder.record(
            None,
            EventKind::LintVerdict {
                platform: Platform::Windows,
                passed: true,
            },
        );
        let jsonl = to_jsonl(&recorder.snapshot()).unwrap();
        let lines: Vec<&str> = jsonl.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "stage_started");
        assert_eq!(first["stage"], "build");
        let second: PipelineEvent = serde_json::from_str(lines[1]).unwrap();
        assert!(second.job_id.is_none());
    }
}
