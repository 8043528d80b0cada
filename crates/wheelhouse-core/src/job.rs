//! Jobs: one runtime instance per surviving matrix cell.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::collector::Artifact;
use crate::error::StageError;
use crate::event::TriggerEvent;
use crate::matrix::{BuildCell, InterpreterVersion};
use crate::publish::PublishReport;

/// Stages a job may run, in their only legal order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    ResolveDependencies,
    Build,
    /// Wait for the platform's lint verdict before testing.
    LintGate,
    Test,
    Collect,
    Publish,
}

impl StageKind {
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::ResolveDependencies => "resolve_dependencies",
            StageKind::Build => "build",
            StageKind::LintGate => "lint_gate",
            StageKind::Test => "test",
            StageKind::Collect => "collect",
            StageKind::Publish => "publish",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    /// Legal transitions: pending → running → succeeded | failed, and
    /// pending → failed for jobs cancelled before they start.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
        )
    }
}

/// A runtime job: one trigger event, one build cell, an ordered stage list.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    pub id: Uuid,
    pub run_id: Uuid,
    pub event: TriggerEvent,
    pub cell: BuildCell,
    /// Interpreters this job builds. One entry except for platforms that
    /// fan out internally, where it lists every matrix version.
    pub interpreters: Vec<InterpreterVersion>,
    pub stages: Vec<StageKind>,
    pub status: JobStatus,
    /// Advisory jobs may fail without failing the aggregate.
    pub required: bool,
    /// Whether this is the single job that builds and publishes the sdist.
    pub publishes_sdist: bool,
}

impl Job {
    /// Directory-safe identifier.
    pub fn slug(&self) -> String {
        if self.interpreters.len() > 1 {
            format!("{}-all-{}", self.cell.platform, self.cell.architecture)
        } else {
            self.cell.slug()
        }
    }

    /// Isolated work directory for this job.
    pub fn work_dir(&self, root: &Path) -> PathBuf {
        root.join(self.run_id.to_string()).join(self.slug())
    }

    pub fn has_stage(&self, stage: StageKind) -> bool {
        self.stages.contains(&stage)
    }

    /// Move to `next`, returning false (and leaving the status alone) for
    /// an illegal transition.
    pub fn transition(&mut self, next: JobStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Succeeded,
    Failed,
}

/// What happened to one stage of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageRecord {
    pub stage: StageKind,
    pub status: StageStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Terminal failure of a job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobFailure {
    pub stage: StageKind,
    /// Error class (`dependency_error`, `build_error`, ...).
    pub class: String,
    pub message: String,
}

impl JobFailure {
    pub fn new(stage: StageKind, err: &StageError) -> Self {
        Self {
            stage,
            class: err.class().to_string(),
            message: err.to_string(),
        }
    }
}

/// Final record of a job after all its stages reported.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job: Job,
    pub stages: Vec<StageRecord>,
    pub artifacts: Vec<Artifact>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<JobFailure>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.job.status == JobStatus::Succeeded
    }

    /// Whether a given stage ever started.
    pub fn ran(&self, stage: StageKind) -> bool {
        self.stages.iter().any(|s| s.stage == stage)
    }

    pub fn failed_class(&self) -> Option<&str> {
        self.failure.as_ref().map(|f| f.class.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Architecture, Platform};

    fn job(interpreters: Vec<InterpreterVersion>) -> Job {
        Job {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            event: TriggerEvent::Push,
            cell: BuildCell::new(Platform::Linux, interpreters[0], Architecture::X64),
            interpreters,
            stages: vec![StageKind::ResolveDependencies, StageKind::Build],
            status: JobStatus::Pending,
            required: true,
            publishes_sdist: false,
        }
    }

    #[test]
    fn test_status_transitions() {
        let mut j = job(vec![InterpreterVersion::new(3, 8)]);
        assert!(!j.transition(JobStatus::Succeeded));
        assert_eq!(j.status, JobStatus::Pending);
        assert!(j.transition(JobStatus::Running));
        assert!(j.transition(JobStatus::Failed));
        assert!(j.status.is_terminal());
        assert!(!j.transition(JobStatus::Running));
    }

    #[test]
    fn test_cancelled_before_start_can_fail() {
        let mut j = job(vec![InterpreterVersion::new(3, 8)]);
        assert!(j.transition(JobStatus::Failed));
    }

    #[test]
    fn test_slug_for_internal_fan_out() {
        let single = job(vec![InterpreterVersion::new(3, 8)]);
        assert_eq!(single.slug(), "linux-3.8-x64");
        let fanned = job(vec![InterpreterVersion::new(3, 7), InterpreterVersion::new(3, 8)]);
        assert_eq!(fanned.slug(), "linux-all-x64");
    }

    #[test]
    fn test_work_dir_is_scoped_by_run() {
        let j = job(vec![InterpreterVersion::new(3, 8)]);
        let dir = j.work_dir(Path::new("/tmp/wh"));
        assert!(dir.starts_with("/tmp/wh"));
        assert!(dir.to_string_lossy().contains(&j.run_id.to_string()));
    }

    #[test]
    fn test_job_failure_from_stage_error() {
        let err = StageError::Collection {
            searched: "dist".to_string(),
        };
        let failure = JobFailure::new(StageKind::Collect, &err);
        assert_eq!(failure.class, "collection_error");
        assert!(failure.message.contains("dist"));
    }
}
