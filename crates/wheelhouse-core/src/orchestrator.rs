//! Event → job fan-out.
//!
//! [`expand`] is a pure function from an event and a matrix to the job
//! list. [`Orchestrator::run`] executes those jobs with a bounded number in
//! flight, runs one linter per gated platform alongside them, and
//! aggregates the outcomes. A failing job never cancels its siblings.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use crate::builder::BuilderRegistry;
use crate::cancel::CancelHandle;
use crate::command::CommandRunner;
use crate::config::PipelineConfig;
use crate::context::JobContext;
use crate::credentials::{CredentialSource, Credentials, EnvCredentialSource};
use crate::error::{Result, StageError, WheelhouseError};
use crate::event::{EventContext, TriggerEvent};
use crate::events::{EventKind, EventRecorder, PipelineEvent};
use crate::gate::{GateVerdict, RunGate};
use crate::job::{Job, JobFailure, JobOutcome, JobStatus, StageKind};
use crate::lint::{LintGates, LintVerdict, LinterGate};
use crate::matrix::{InterpreterVersion, MatrixSpec, Platform};
use crate::obs;
use crate::pipeline::{JobPipeline, RunServices};
use crate::publish::PublicationController;

/// Event-independent knobs that shape the job list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpansionPolicy {
    pub test_platforms: Vec<Platform>,
    pub lint_platforms: Vec<Platform>,
    pub sdist_version: InterpreterVersion,
    pub sdist_platform: Option<Platform>,
}

impl ExpansionPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            test_platforms: config.test_platforms(),
            lint_platforms: config.lint_platforms(),
            sdist_version: config.sdist.interpreter_version,
            sdist_platform: config.sdist.platform,
        }
    }
}

impl Default for ExpansionPolicy {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

/// Expand an event and a matrix into pending jobs.
///
/// One job per surviving cell, except on platforms that fan out
/// internally, which get one job per architecture carrying every
/// interpreter. On releases exactly one job is designated to build the
/// sdist.
pub fn expand(event: &EventContext, matrix: &MatrixSpec, policy: &ExpansionPolicy) -> Result<Vec<Job>> {
    let cells = matrix.expand_cells()?;

    // (job, every cell it covers)
    let mut groups: Vec<(Job, Vec<bool>)> = Vec::new();
    for cell in cells {
        let advisory = matrix.is_advisory(&cell);
        if cell.platform.fans_out_internally() {
            if let Some((job, flags)) = groups.iter_mut().find(|(j, _)| {
                j.cell.platform == cell.platform && j.cell.architecture == cell.architecture
            }) {
                job.interpreters.push(cell.interpreter_version);
                flags.push(advisory);
                continue;
            }
        }

        let mut stages = vec![StageKind::ResolveDependencies, StageKind::Build];
        if policy.lint_platforms.contains(&cell.platform) {
            stages.push(StageKind::LintGate);
        }
        if policy.test_platforms.contains(&cell.platform) {
            stages.push(StageKind::Test);
        }
        stages.extend([StageKind::Collect, StageKind::Publish]);

        groups.push((
            Job {
                id: Uuid::new_v4(),
                run_id: event.run_id,
                event: event.event,
                cell,
                interpreters: vec![cell.interpreter_version],
                stages,
                status: JobStatus::Pending,
                required: true,
                publishes_sdist: false,
            },
            vec![advisory],
        ));
    }

    let mut jobs: Vec<Job> = groups
        .into_iter()
        .map(|(mut job, flags)| {
            // A grouped job is advisory only when all of its cells are.
            job.required = !flags.iter().all(|a| *a);
            job
        })
        .collect();

    // The sdist only goes to the index, so only releases build one.
    if event.event == TriggerEvent::Release {
        let designated = jobs.iter_mut().find(|j| {
            j.interpreters.contains(&policy.sdist_version)
                && policy.sdist_platform.map_or(true, |p| p == j.cell.platform)
        });
        match designated {
            Some(job) => job.publishes_sdist = true,
            None => {
                return Err(WheelhouseError::InvalidMatrix(format!(
                    "release has no job for the sdist interpreter {}",
                    policy.sdist_version
                )))
            }
        }
    }

    Ok(jobs)
}

/// Aggregate result of one event run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub event: EventContext,
    pub outcomes: Vec<JobOutcome>,
    pub events: Vec<PipelineEvent>,
    pub verdict: GateVerdict,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.verdict.passed
    }

    pub fn exit_code(&self) -> i32 {
        if self.verdict.passed {
            0
        } else {
            1
        }
    }

    pub fn outcome(&self, slug: &str) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| o.job.slug() == slug)
    }
}

pub struct Orchestrator {
    config: Arc<PipelineConfig>,
    runner: Arc<dyn CommandRunner>,
    builders: BuilderRegistry,
    credentials: Arc<dyn CredentialSource>,
    publication: Arc<PublicationController>,
}

impl Orchestrator {
    /// Orchestrator with the standard builders, environment credentials
    /// and command-backed publication.
    pub fn new(config: PipelineConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let publication = PublicationController::from_config(&config.publish, runner.clone())
            .with_retry(config.retry);
        Self {
            config: Arc::new(config),
            runner,
            builders: BuilderRegistry::standard(),
            credentials: Arc::new(EnvCredentialSource),
            publication: Arc::new(publication),
        }
    }

    pub fn with_builders(mut self, builders: BuilderRegistry) -> Self {
        self.builders = builders;
        self
    }

    pub fn with_credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
        self.credentials = source;
        self
    }

    pub fn with_publication(mut self, publication: PublicationController) -> Self {
        self.publication = Arc::new(publication);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Jobs the event would run, without running them.
    pub fn plan(&self, event: &EventContext) -> Result<Vec<Job>> {
        self.config.validate()?;
        expand(event, &self.config.matrix, &ExpansionPolicy::from_config(&self.config))
    }

    /// Run every job of the event and aggregate.
    pub async fn run(&self, event: EventContext, cancel: CancelHandle) -> Result<RunReport> {
        let jobs = self.plan(&event)?;
        let run_id = event.run_id.to_string();
        let max_parallel = self.config.matrix.max_parallel.max(1);
        obs::emit_run_started(&run_id, event.event, jobs.len(), max_parallel);

        // Pull requests never publish, so they never see credentials.
        let credentials = if event.event == TriggerEvent::PullRequest {
            Credentials::default()
        } else {
            self.credentials.resolve()
        };

        let recorder = EventRecorder::new();
        for job in &jobs {
            recorder.job(job.id, EventKind::JobQueued);
        }

        let mut gated: Vec<Platform> = jobs
            .iter()
            .filter(|j| j.has_stage(StageKind::LintGate))
            .map(|j| j.cell.platform)
            .collect();
        gated.sort();
        gated.dedup();
        let lint_gates = LintGates::new(&gated);

        let services = RunServices {
            event: Arc::new(event.clone()),
            builders: self.builders.clone(),
            lint_gates: lint_gates.clone(),
            publication: self.publication.clone(),
            credentials: Arc::new(credentials),
            recorder: recorder.clone(),
            cancel: cancel.clone(),
        };

        let lint_tasks: Vec<JoinHandle<()>> = gated
            .iter()
            .map(|platform| self.spawn_lint(*platform, &services))
            .collect();

        let semaphore = Arc::new(Semaphore::new(max_parallel));
        let mut tasks: Vec<(Job, JoinHandle<JobOutcome>)> = Vec::with_capacity(jobs.len());
        for job in jobs {
            let ctx = JobContext::new(job.clone(), self.config.clone(), self.runner.clone());
            let services = services.clone();
            let semaphore = semaphore.clone();
            let span = obs::job_span(&run_id, &job.id.to_string(), &job.slug());

            let task = tokio::spawn(
                async move {
                    let permit = tokio::select! {
                        biased;
                        _ = services.cancel.cancelled() => None,
                        permit = semaphore.acquire_owned() => permit.ok(),
                    };
                    match permit {
                        Some(_permit) => JobPipeline::run(ctx, &services).await,
                        None => cancelled_before_start(ctx.job, &services.recorder),
                    }
                }
                .instrument(span),
            );
            tasks.push((job, task));
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        for (job, task) in tasks {
            match task.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(job = %job.slug(), error = %e, "job task aborted");
                    outcomes.push(aborted(job, &e.to_string(), &recorder));
                }
            }
        }
        for result in futures::future::join_all(lint_tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "lint task aborted");
            }
        }

        let events = recorder.snapshot();
        let verdict = RunGate::evaluate(&outcomes, &events);
        obs::emit_gate_evaluated(&run_id, verdict.passed, verdict.violations.len(), verdict.warnings.len());
        info!(run_id = %run_id, passed = verdict.passed, "{}", verdict.message);

        Ok(RunReport {
            event,
            outcomes,
            events,
            verdict,
        })
    }

    /// Lint one platform and publish its verdict to waiting jobs.
    fn spawn_lint(&self, platform: Platform, services: &RunServices) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let config = self.config.clone();
        let cancel = services.cancel.clone();
        let verdict = VerdictSlot {
            gates: services.lint_gates.clone(),
            recorder: services.recorder.clone(),
            platform,
            settled: false,
        };

        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(StageError::Cancelled {
                    stage: format!("lint_{platform}"),
                }),
                r = LinterGate::lint(
                    runner.as_ref(),
                    &config.lint,
                    &config.package.source_dir,
                    platform,
                    config.sdist.interpreter_version,
                ) => r,
            };
            verdict.settle(match result {
                Ok(()) => LintVerdict::Passed,
                Err(StageError::Lint { reason, .. }) => LintVerdict::Failed { reason },
                Err(other) => LintVerdict::Failed {
                    reason: other.to_string(),
                },
            });
        })
    }
}

/// Publishes a lint verdict exactly once. Dropped unsettled (the lint task
/// panicked or was aborted), it fails the gate so waiting jobs never hang.
struct VerdictSlot {
    gates: LintGates,
    recorder: EventRecorder,
    platform: Platform,
    settled: bool,
}

impl VerdictSlot {
    fn settle(mut self, verdict: LintVerdict) {
        self.publish(verdict);
    }

    fn publish(&mut self, verdict: LintVerdict) {
        self.settled = true;
        self.recorder.record(
            None,
            EventKind::LintVerdict {
                platform: self.platform,
                passed: verdict == LintVerdict::Passed,
            },
        );
        self.gates.publish(self.platform, verdict);
    }
}

impl Drop for VerdictSlot {
    fn drop(&mut self) {
        if !self.settled {
            warn!(platform = %self.platform, "lint task ended without a verdict");
            self.publish(LintVerdict::Failed {
                reason: "lint task ended without a verdict".to_string(),
            });
        }
    }
}

fn cancelled_before_start(mut job: Job, recorder: &EventRecorder) -> JobOutcome {
    let stage = job.stages.first().copied().unwrap_or(StageKind::ResolveDependencies);
    let err = StageError::Cancelled {
        stage: stage.name().to_string(),
    };
    job.transition(JobStatus::Failed);
    recorder.job(job.id, EventKind::JobFinished { succeeded: false });
    JobOutcome {
        job,
        stages: Vec::new(),
        artifacts: Vec::new(),
        publish: None,
        failure: Some(JobFailure::new(stage, &err)),
    }
}

fn aborted(mut job: Job, reason: &str, recorder: &EventRecorder) -> JobOutcome {
    let stage = job.stages.first().copied().unwrap_or(StageKind::ResolveDependencies);
    job.status = JobStatus::Failed;
    recorder.job(job.id, EventKind::JobFinished { succeeded: false });
    JobOutcome {
        job,
        stages: Vec::new(),
        artifacts: Vec::new(),
        publish: None,
        failure: Some(JobFailure {
            stage,
            class: "aborted".to_string(),
            message: reason.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{Architecture, CellFilter};

    const V37: InterpreterVersion = InterpreterVersion::new(3, 7);
    const V38: InterpreterVersion = InterpreterVersion::new(3, 8);
    const V39: InterpreterVersion = InterpreterVersion::new(3, 9);

    fn matrix(platforms: Vec<Platform>) -> MatrixSpec {
        MatrixSpec::new(platforms, vec![V37, V38, V39], vec![Architecture::X64])
    }

    #[test]
    fn test_expand_default_matrix() {
        let jobs = expand(
            &EventContext::release("v0.7.1"),
            &matrix(vec![Platform::Linux, Platform::Macos, Platform::Windows]),
            &ExpansionPolicy::default(),
        )
        .unwrap();
        // linux collapses to one job; macos and windows keep one per version.
        assert_eq!(jobs.len(), 7);
        assert_eq!(jobs[0].slug(), "linux-all-x64");
        assert_eq!(jobs[0].interpreters, vec![V37, V38, V39]);
        assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));
        assert_eq!(jobs.iter().filter(|j| j.publishes_sdist).count(), 1);
    }

    #[test]
    fn test_expand_stage_lists_follow_policy() {
        let jobs = expand(
            &EventContext::push("main"),
            &matrix(vec![Platform::Macos, Platform::Windows]),
            &ExpansionPolicy::default(),
        )
        .unwrap();
        let mac = &jobs[0];
        assert!(!mac.has_stage(StageKind::Test));
        assert!(!mac.has_stage(StageKind::LintGate));
        let win = jobs.iter().find(|j| j.cell.platform == Platform::Windows).unwrap();
        assert_eq!(
            win.stages,
            vec![
                StageKind::ResolveDependencies,
                StageKind::Build,
                StageKind::LintGate,
                StageKind::Test,
                StageKind::Collect,
                StageKind::Publish,
            ]
        );
    }

    #[test]
    fn test_sdist_designation_honours_platform() {
        let policy = ExpansionPolicy {
            sdist_platform: Some(Platform::Windows),
            ..ExpansionPolicy::default()
        };
        let jobs = expand(
            &EventContext::release("v1"),
            &matrix(vec![Platform::Linux, Platform::Windows]),
            &policy,
        )
        .unwrap();
        let designated: Vec<_> = jobs.iter().filter(|j| j.publishes_sdist).collect();
        assert_eq!(designated.len(), 1);
        assert_eq!(designated[0].slug(), "windows-3.8-x64");
    }

    #[test]
    fn test_exclusions_and_advisory() {
        let spec = matrix(vec![Platform::Windows])
            .with_exclusion(CellFilter {
                interpreter_version: Some(V37),
                ..CellFilter::default()
            })
            .with_advisory(CellFilter {
                interpreter_version: Some(V39),
                ..CellFilter::default()
            });
        let jobs = expand(&EventContext::push("main"), &spec, &ExpansionPolicy::default()).unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].required);
        assert!(!jobs[1].required);
    }

    #[test]
    fn test_no_sdist_outside_releases() {
        let spec = matrix(vec![Platform::Windows]);
        for event in [EventContext::push("main"), EventContext::pull_request("f")] {
            let jobs = expand(&event, &spec, &ExpansionPolicy::default()).unwrap();
            assert!(jobs.iter().all(|j| !j.publishes_sdist));
        }
    }

    #[test]
    fn test_release_without_sdist_cell_is_rejected() {
        let spec = matrix(vec![Platform::Windows]).with_exclusion(CellFilter {
            interpreter_version: Some(V38),
            ..CellFilter::default()
        });
        let err = expand(&EventContext::release("v1"), &spec, &ExpansionPolicy::default()).unwrap_err();
        assert!(matches!(err, WheelhouseError::InvalidMatrix(_)));
        // Events that never publish an sdist still expand.
        let jobs = expand(&EventContext::push("main"), &spec, &ExpansionPolicy::default()).unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[test]
    fn test_expand_is_scoped_to_the_event() {
        let event = EventContext::push("main");
        let jobs = expand(&event, &matrix(vec![Platform::Macos]), &ExpansionPolicy::default()).unwrap();
        assert!(jobs.iter().all(|j| j.run_id == event.run_id && j.event == TriggerEvent::Push));
    }
}
