//! In-memory fakes for the external collaborators (testing only).
//!
//! [`ScriptedRunner`] stands in for every external command: it records
//! what was invoked, fails the stages it was told to fail and writes the
//! files a build step declares so the collector has something to find.
//! [`RecordingIndex`], [`RecordingStore`] and [`RecordingArchive`] record
//! publication calls instead of talking to the network.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::collector::Artifact;
use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::credentials::{IndexCredentials, StoreCredentials};
use crate::error::{StageError, StageResult};
use crate::event::TriggerEvent;
use crate::job::{Job, JobStatus, StageKind};
use crate::matrix::{Architecture, BuildCell, InterpreterVersion, Platform};
use crate::publish::{ArchiveSink, ObjectStore, PackageIndex};

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// One recorded command invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: String,
    pub command: String,
    pub env_keys: Vec<String>,
    pub secret_env_keys: Vec<String>,
    pub cwd: Option<PathBuf>,
}

/// Command runner driven by a script instead of real processes.
///
/// Every stage succeeds unless configured otherwise.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    failures: HashMap<String, i32>,
    transient: Mutex<HashMap<String, u32>>,
    suppressed: HashSet<String>,
    delays: HashMap<String, Duration>,
    stdout: HashMap<String, String>,
    panics: HashSet<String>,
    invocations: Mutex<Vec<Invocation>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation of `stage` exits with `exit_code`.
    pub fn fail_stage(mut self, stage: &str, exit_code: i32) -> Self {
        self.failures.insert(stage.to_string(), exit_code);
        self
    }

    /// The first `times` invocations of `stage` exit with 1, later ones pass.
    pub fn fail_stage_times(self, stage: &str, times: u32) -> Self {
        self.transient
            .lock()
            .unwrap()
            .insert(stage.to_string(), times);
        self
    }

    /// `stage` succeeds but writes none of its declared outputs.
    pub fn suppress_outputs(mut self, stage: &str) -> Self {
        self.suppressed.insert(stage.to_string());
        self
    }

    /// `stage` sleeps before returning.
    pub fn delay_stage(mut self, stage: &str, delay: Duration) -> Self {
        self.delays.insert(stage.to_string(), delay);
        self
    }

    /// Canned stdout for `stage`.
    pub fn stdout_for(mut self, stage: &str, stdout: &str) -> Self {
        self.stdout.insert(stage.to_string(), stdout.to_string());
        self
    }

    /// `stage` panics instead of returning, like a crashing task would.
    pub fn panic_on(mut self, stage: &str) -> Self {
        self.panics.insert(stage.to_string());
        self
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn count_stage(&self, stage: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.stage == stage)
            .count()
    }

    /// Stages invoked, in order.
    pub fn stages(&self) -> Vec<String> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .map(|i| i.stage.clone())
            .collect()
    }

    /// Highest number of commands observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn scripted_exit_code(&self, stage: &str) -> i32 {
        if let Some(code) = self.failures.get(stage) {
            return *code;
        }
        let mut transient = self.transient.lock().unwrap();
        match transient.get_mut(stage) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                1
            }
            _ => 0,
        }
    }
}

/// Turn a declared glob into a concrete file name.
fn materialize(pattern: &str) -> PathBuf {
    PathBuf::from(pattern.replace('*', "0"))
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        self.invocations.lock().unwrap().push(Invocation {
            stage: spec.stage.clone(),
            command: spec.display(),
            env_keys: spec.env.iter().map(|(k, _)| k.clone()).collect(),
            secret_env_keys: spec.secret_env.iter().map(|(k, _)| k.clone()).collect(),
            cwd: spec.cwd.clone(),
        });
        if self.panics.contains(&spec.stage) {
            panic!("scripted panic in {}", spec.stage);
        }

        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = ActiveGuard(&self.active);

        if let Some(delay) = self.delays.get(&spec.stage) {
            tokio::time::sleep(*delay).await;
        }

        let exit_code = self.scripted_exit_code(&spec.stage);
        if exit_code == 0 && !self.suppressed.contains(&spec.stage) {
            for pattern in &spec.declared_outputs {
                let path = materialize(pattern);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, format!("built by {}", spec.stage)).await?;
            }
        }

        Ok(CommandOutput {
            stage: spec.stage.clone(),
            exit_code,
            stdout: self.stdout.get(&spec.stage).cloned().unwrap_or_default(),
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("scripted failure of {}", spec.stage)
            },
            duration_ms: 0,
        })
    }
}

/// Pending job for one platform, every stage enabled.
pub fn job_for(platform: Platform, interpreters: &[InterpreterVersion]) -> Job {
    let first = interpreters
        .first()
        .copied()
        .unwrap_or(InterpreterVersion::new(3, 8));
    Job {
        id: Uuid::new_v4(),
        run_id: Uuid::new_v4(),
        event: TriggerEvent::Push,
        cell: BuildCell::new(platform, first, Architecture::X64),
        interpreters: interpreters.to_vec(),
        stages: vec![
            StageKind::ResolveDependencies,
            StageKind::Build,
            StageKind::LintGate,
            StageKind::Test,
            StageKind::Collect,
            StageKind::Publish,
        ],
        status: JobStatus::Pending,
        required: true,
        publishes_sdist: false,
    }
}

// ---------------------------------------------------------------------------
// Publication fakes
// ---------------------------------------------------------------------------

/// Package index that records uploaded artifact names.
#[derive(Debug, Default)]
pub struct RecordingIndex {
    uploads: Mutex<Vec<String>>,
    failure: Option<String>,
}

impl RecordingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upload fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().unwrap().len()
    }
}

#[async_trait]
impl PackageIndex for RecordingIndex {
    async fn upload(&self, artifact: &Artifact, _credentials: &IndexCredentials) -> StageResult<()> {
        if let Some(reason) = &self.failure {
            return Err(StageError::Publish {
                action: "publish_index".to_string(),
                reason: reason.clone(),
            });
        }
        self.uploads.lock().unwrap().push(artifact.name.clone());
        Ok(())
    }
}

/// A recorded object-store mirror call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorCall {
    pub destination: String,
    pub artifacts: Vec<String>,
}

/// Object store that records mirror calls.
#[derive(Debug, Default)]
pub struct RecordingStore {
    mirrors: Mutex<Vec<MirrorCall>>,
    failure: Option<String>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            failure: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn mirrors(&self) -> Vec<MirrorCall> {
        self.mirrors.lock().unwrap().clone()
    }

    pub fn mirror_count(&self) -> usize {
        self.mirrors.lock().unwrap().len()
    }
}

#[async_trait]
impl ObjectStore for RecordingStore {
    async fn mirror(
        &self,
        _source_dir: &Path,
        artifacts: &[Artifact],
        destination: &str,
        _credentials: &StoreCredentials,
    ) -> StageResult<()> {
        if let Some(reason) = &self.failure {
            return Err(StageError::Publish {
                action: "mirror_store".to_string(),
                reason: reason.clone(),
            });
        }
        self.mirrors.lock().unwrap().push(MirrorCall {
            destination: destination.to_string(),
            artifacts: artifacts.iter().map(|a| a.name.clone()).collect(),
        });
        Ok(())
    }
}

/// Archive sink that records archived artifact names per job.
#[derive(Debug, Default)]
pub struct RecordingArchive {
    archived: Mutex<Vec<(String, Vec<String>)>>,
}

impl RecordingArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// (job slug, artifact names) per archive call.
    pub fn archived(&self) -> Vec<(String, Vec<String>)> {
        self.archived.lock().unwrap().clone()
    }

    pub fn archive_count(&self) -> usize {
        self.archived.lock().unwrap().len()
    }
}

#[async_trait]
impl ArchiveSink for RecordingArchive {
    async fn archive(&self, job: &Job, artifacts: &[Artifact]) -> StageResult<Vec<PathBuf>> {
        self.archived.lock().unwrap().push((
            job.slug(),
            artifacts.iter().map(|a| a.name.clone()).collect(),
        ));
        Ok(artifacts.iter().map(|a| a.path.clone()).collect())
    }
}
