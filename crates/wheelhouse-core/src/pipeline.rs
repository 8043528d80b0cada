//! Per-job stage sequencing.
//!
//! Stages run strictly in order. The first failing stage ends the job;
//! later stages never start. Each stage produces one `StageStarted` event
//! followed by either `StageFinished` or `StageFailed`, which is what the
//! run gate checks for.

use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::builder::{BuilderRegistry, CompiledExtension};
use crate::cancel::CancelHandle;
use crate::collector::{Artifact, ArtifactCollector};
use crate::context::JobContext;
use crate::credentials::Credentials;
use crate::error::{StageError, StageResult};
use crate::event::EventContext;
use crate::events::{EventKind, EventRecorder};
use crate::job::{JobFailure, JobOutcome, JobStatus, StageKind, StageRecord, StageStatus};
use crate::lint::LintGates;
use crate::obs;
use crate::publish::{PublicationController, PublishReport};
use crate::resolver::DependencyResolver;
use crate::test_runner::TestRunner;

/// Run-scoped collaborators shared by every job of one event.
#[derive(Clone)]
pub struct RunServices {
    pub event: Arc<EventContext>,
    pub builders: BuilderRegistry,
    pub lint_gates: LintGates,
    pub publication: Arc<PublicationController>,
    /// Resolved once at event time. Only the publish stage reads them.
    pub credentials: Arc<Credentials>,
    pub recorder: EventRecorder,
    pub cancel: CancelHandle,
}

/// Values handed from one stage to the next.
#[derive(Default)]
struct JobState {
    compiled: Option<CompiledExtension>,
    artifacts: Vec<Artifact>,
    publish: Option<PublishReport>,
}

pub struct JobPipeline;

impl JobPipeline {
    /// Drive one job through its stages.
    pub async fn run(ctx: JobContext, services: &RunServices) -> JobOutcome {
        let mut job = ctx.job.clone();
        let job_id = job.id.to_string();
        job.transition(JobStatus::Running);
        services.recorder.job(job.id, EventKind::JobStarted);
        obs::emit_job_started(&job_id, &job.slug());

        let mut state = JobState::default();
        let mut records = Vec::with_capacity(job.stages.len());
        let mut failure = None;

        for stage in job.stages.clone() {
            if services.cancel.is_cancelled() {
                let err = StageError::Cancelled {
                    stage: stage.name().to_string(),
                };
                failure = Some(JobFailure::new(stage, &err));
                break;
            }

            services.recorder.job(job.id, EventKind::StageStarted { stage });
            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = services.cancel.cancelled() => Err(StageError::Cancelled {
                    stage: stage.name().to_string(),
                }),
                r = Self::run_stage(stage, &ctx, services, &mut state) => r,
            };
            let duration_ms = start.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    services
                        .recorder
                        .job(job.id, EventKind::StageFinished { stage, duration_ms });
                    obs::emit_stage_finished(&job_id, stage.name(), duration_ms, None);
                    records.push(StageRecord {
                        stage,
                        status: StageStatus::Succeeded,
                        duration_ms,
                        error: None,
                    });
                }
                Err(err) => {
                    services.recorder.job(
                        job.id,
                        EventKind::StageFailed {
                            stage,
                            class: err.class().to_string(),
                            message: err.to_string(),
                        },
                    );
                    obs::emit_stage_finished(&job_id, stage.name(), duration_ms, Some(err.class()));
                    records.push(StageRecord {
                        stage,
                        status: StageStatus::Failed,
                        duration_ms,
                        error: Some(err.to_string()),
                    });
                    failure = Some(JobFailure::new(stage, &err));
                    break;
                }
            }
        }

        let succeeded = failure.is_none();
        job.transition(if succeeded {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        });
        services
            .recorder
            .job(job.id, EventKind::JobFinished { succeeded });
        obs::emit_job_finished(&job_id, &job.slug(), succeeded, job.required);
        if let Some(f) = &failure {
            warn!(job = %job.slug(), stage = %f.stage, class = %f.class, "job failed");
        }

        JobOutcome {
            job,
            stages: records,
            artifacts: state.artifacts,
            publish: state.publish,
            failure,
        }
    }

    async fn run_stage(
        stage: StageKind,
        ctx: &JobContext,
        services: &RunServices,
        state: &mut JobState,
    ) -> StageResult<()> {
        let platform = ctx.job.cell.platform;
        match stage {
            StageKind::ResolveDependencies => DependencyResolver::resolve(ctx).await,
            StageKind::Build => {
                let builder = services.builders.get(platform)?;
                state.compiled = Some(builder.build(ctx).await?);
                Ok(())
            }
            StageKind::LintGate => services.lint_gates.wait(platform).await,
            StageKind::Test => {
                let compiled = compiled(state, "test")?;
                let report = TestRunner::test(ctx, compiled).await.ensure_passed()?;
                info!(job = %ctx.job.slug(), interpreters = report.interpreters.len(), "tests passed");
                Ok(())
            }
            StageKind::Collect => {
                let compiled = compiled(state, "collect")?;
                state.artifacts = ArtifactCollector::collect(ctx, compiled).await?;
                Ok(())
            }
            StageKind::Publish => {
                let report = services
                    .publication
                    .publish(&services.event, &ctx.job, &state.artifacts, &services.credentials)
                    .await;
                for action in &report.actions {
                    services.recorder.job(
                        ctx.job.id,
                        EventKind::PublishAction {
                            action: action.action,
                            status: action.status,
                        },
                    );
                }
                let failure = report.failure();
                state.publish = Some(report);
                match failure {
                    Some(err) => Err(err),
                    None => Ok(()),
                }
            }
        }
    }
}

fn compiled<'a>(state: &'a JobState, stage: &str) -> StageResult<&'a CompiledExtension> {
    state.compiled.as_ref().ok_or_else(|| StageError::Build {
        sub_stage: stage.to_string(),
        reason: "no compiled extension available".to_string(),
    })
}
