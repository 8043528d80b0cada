//! Aggregate gate for a pipeline run.
//!
//! Fail-closed: the run fails if any required job failed, or if the event
//! log shows a stage that started but never reported back. Advisory job
//! failures are listed as warnings and do not affect the verdict.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::{EventKind, PipelineEvent};
use crate::job::{JobOutcome, StageKind};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GateVerdict {
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Advisory failures, reported but not counted.
    #[serde(default)]
    pub warnings: Vec<String>,

    pub message: String,
}

pub struct RunGate;

impl RunGate {
    pub fn evaluate(outcomes: &[JobOutcome], events: &[PipelineEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut warnings = Vec::new();

        for outcome in outcomes {
            if outcome.succeeded() {
                continue;
            }
            let reason = match &outcome.failure {
                Some(f) => format!("failed at {} ({}): {}", f.stage, f.class, f.message),
                None => format!("ended {:?} without a recorded failure", outcome.job.status),
            };
            let line = format!("job '{}' {}", outcome.job.slug(), reason);
            if outcome.job.required {
                violations.push(line);
            } else {
                warnings.push(format!("advisory {line}"));
            }
        }

        let advisory: HashSet<Uuid> = outcomes
            .iter()
            .filter(|o| !o.job.required)
            .map(|o| o.job.id)
            .collect();

        // Stages that started but never finished or failed.
        let mut started: Vec<(Uuid, StageKind)> = Vec::new();
        let mut closed: HashSet<(Uuid, StageKind)> = HashSet::new();
        for event in events {
            let Some(job_id) = event.job_id else { continue };
            match &event.kind {
                EventKind::StageStarted { stage } => started.push((job_id, *stage)),
                EventKind::StageFinished { stage, .. } | EventKind::StageFailed { stage, .. } => {
                    closed.insert((job_id, *stage));
                }
                _ => {}
            }
        }
        for (job_id, stage) in started {
            if closed.contains(&(job_id, stage)) || advisory.contains(&job_id) {
                continue;
            }
            let line = format!("stage '{stage}' of job {job_id} started but never completed");
            if !violations.contains(&line) {
                violations.push(line);
            }
        }

        let passed = violations.is_empty();
        let message = if passed && warnings.is_empty() {
            format!("All {} required job(s) passed", outcomes.iter().filter(|o| o.job.required).count())
        } else if passed {
            format!("Passed with {} advisory failure(s)", warnings.len())
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            warnings,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StageError;
    use crate::events::EventRecorder;
    use crate::fakes::job_for;
    use crate::job::{JobFailure, JobStatus};
    use crate::matrix::{InterpreterVersion, Platform};

    fn outcome(status: JobStatus, required: bool) -> JobOutcome {
        let mut job = job_for(Platform::Windows, &[InterpreterVersion::new(3, 8)]);
        job.status = status;
        job.required = required;
        let failure = (status == JobStatus::Failed).then(|| {
            JobFailure::new(
                StageKind::Build,
                &StageError::Build {
                    sub_stage: "build_ext".to_string(),
                    reason: "exited with code 2".to_string(),
                },
            )
        });
        JobOutcome {
            job,
            stages: Vec::new(),
            artifacts: Vec::new(),
            publish: None,
            failure,
        }
    }

    #[test]
    fn test_empty_run_passes() {
        let verdict = RunGate::evaluate(&[], &[]);
        assert!(verdict.passed);
    }

    #[test]
    fn test_required_failure_fails_the_run() {
        let outcomes = vec![outcome(JobStatus::Succeeded, true), outcome(JobStatus::Failed, true)];
        let verdict = RunGate::evaluate(&outcomes, &[]);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("build_error"));
    }

    #[test]
    fn test_advisory_failure_is_a_warning() {
        let outcomes = vec![outcome(JobStatus::Succeeded, true), outcome(JobStatus::Failed, false)];
        let verdict = RunGate::evaluate(&outcomes, &[]);
        assert!(verdict.passed);
        assert_eq!(verdict.warnings.len(), 1);
        assert!(verdict.message.contains("advisory"));
    }

    #[test]
    fn test_stage_started_but_never_completed() {
        let ok = outcome(JobStatus::Succeeded, true);
        let recorder = EventRecorder::new();
        recorder.job(ok.job.id, EventKind::StageStarted { stage: StageKind::Build });
        recorder.job(ok.job.id, EventKind::StageFinished { stage: StageKind::Build, duration_ms: 5 });
        recorder.job(ok.job.id, EventKind::StageStarted { stage: StageKind::Collect });

        let verdict = RunGate::evaluate(&[ok], &recorder.snapshot());
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("never completed"));
    }
}
