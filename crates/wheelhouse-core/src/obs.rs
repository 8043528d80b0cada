//! Structured lifecycle events for pipeline runs.
//!
//! - [`job_span`] builds a job-scoped span so every log line of a job
//!   carries its run id, job id and cell.
//! - `emit_*` functions log the key lifecycle points at `info!` level.
//!
//! None of these take credential values.

use tracing::{info, warn};

use crate::event::TriggerEvent;

/// Job-scoped span, attached to the job's future with `Instrument`.
pub fn job_span(run_id: &str, job_id: &str, slug: &str) -> tracing::Span {
    tracing::info_span!("wheelhouse.job", run_id = %run_id, job_id = %job_id, cell = %slug)
}

pub fn emit_run_started(run_id: &str, event: TriggerEvent, jobs: usize, max_parallel: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        trigger = %event,
        jobs = jobs,
        max_parallel = max_parallel,
    );
}

pub fn emit_job_started(job_id: &str, slug: &str) {
    info!(event = "job.started", job_id = %job_id, cell = %slug);
}

/// Emit event: a stage finished; `error` is the failure class, if any.
pub fn emit_stage_finished(job_id: &str, stage: &str, duration_ms: u64, error: Option<&str>) {
    match error {
        None => info!(event = "stage.finished", job_id = %job_id, stage = %stage, duration_ms = duration_ms),
        Some(class) => warn!(
            event = "stage.failed",
            job_id = %job_id,
            stage = %stage,
            duration_ms = duration_ms,
            error = %class,
        ),
    }
}

pub fn emit_job_finished(job_id: &str, slug: &str, succeeded: bool, required: bool) {
    info!(
        event = "job.finished",
        job_id = %job_id,
        cell = %slug,
        succeeded = succeeded,
        required = required,
    );
}

pub fn emit_publish_action(job_id: &str, action: &str, status: &str, artifacts: usize) {
    info!(
        event = "publish.action",
        job_id = %job_id,
        action = %action,
        status = %status,
        artifacts = artifacts,
    );
}

pub fn emit_gate_evaluated(run_id: &str, passed: bool, violations: usize, warnings: usize) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        passed = passed,
        violations = violations,
        warnings = warnings,
    );
}
