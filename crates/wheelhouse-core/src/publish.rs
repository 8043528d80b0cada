//! Publication controller.
//!
//! The only component that sees credentials. Event-type decisions live in
//! one place, [`PublishAction::for_event`]:
//!
//! | event          | actions                      |
//! |----------------|------------------------------|
//! | `push`         | archive, mirror-store        |
//! | `release`      | publish-index, mirror-store  |
//! | `pull_request` | skip                         |
//!
//! A failed action ends publication for the job; already-succeeded build
//! and test stages are not rolled back.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::collector::Artifact;
use crate::command::{CommandRunner, CommandSpec};
use crate::config::PublishConfig;
use crate::credentials::{redact, Credentials, IndexCredentials, StoreCredentials};
use crate::error::{StageError, StageResult};
use crate::event::{EventContext, TriggerEvent};
use crate::job::Job;
use crate::obs;
use crate::retry::{retry, RetryPolicy};

/// Named transitions of the publication state machine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PublishAction {
    Archive,
    PublishIndex,
    MirrorStore,
    Skip,
}

impl PublishAction {
    pub fn name(&self) -> &'static str {
        match self {
            PublishAction::Archive => "archive",
            PublishAction::PublishIndex => "publish_index",
            PublishAction::MirrorStore => "mirror_store",
            PublishAction::Skip => "skip",
        }
    }

    /// Ordered actions for an event.
    pub fn for_event(event: TriggerEvent) -> &'static [PublishAction] {
        match event {
            TriggerEvent::Push => &[PublishAction::Archive, PublishAction::MirrorStore],
            TriggerEvent::Release => &[PublishAction::PublishIndex, PublishAction::MirrorStore],
            TriggerEvent::PullRequest => &[PublishAction::Skip],
        }
    }

    /// Whether the action writes outside the job's work directory.
    pub fn is_external_write(&self) -> bool {
        !matches!(self, PublishAction::Skip)
    }
}

impl std::fmt::Display for PublishAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Succeeded,
    Failed,
    Skipped,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Succeeded => "succeeded",
            ActionStatus::Failed => "failed",
            ActionStatus::Skipped => "skipped",
        }
    }
}

/// What one action did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRecord {
    pub action: PublishAction,
    pub status: ActionStatus,
    /// Artifact names the action handled.
    pub artifacts: Vec<String>,
    /// Failure reason, scrubbed of secret values.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Publication result for one job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishReport {
    pub event: TriggerEvent,
    pub actions: Vec<ActionRecord>,
}

impl PublishReport {
    pub fn succeeded(&self) -> bool {
        self.actions.iter().all(|a| a.status != ActionStatus::Failed)
    }

    /// Number of actions that wrote outside the job.
    pub fn external_writes(&self) -> usize {
        self.actions
            .iter()
            .filter(|a| a.status == ActionStatus::Succeeded && a.action.is_external_write())
            .count()
    }

    pub fn action(&self, action: PublishAction) -> Option<&ActionRecord> {
        self.actions.iter().find(|a| a.action == action)
    }

    /// The first failed action as a `PublishError`.
    pub fn failure(&self) -> Option<StageError> {
        self.actions
            .iter()
            .find(|a| a.status == ActionStatus::Failed)
            .map(|a| StageError::Publish {
                action: a.action.name().to_string(),
                reason: a.detail.clone().unwrap_or_default(),
            })
    }
}

// ---------------------------------------------------------------------------
// Back ends
// ---------------------------------------------------------------------------

/// Package index upload, one call per artifact.
#[async_trait]
pub trait PackageIndex: Send + Sync {
    async fn upload(&self, artifact: &Artifact, credentials: &IndexCredentials) -> StageResult<()>;
}

/// External object store mirror.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn mirror(
        &self,
        source_dir: &Path,
        artifacts: &[Artifact],
        destination: &str,
        credentials: &StoreCredentials,
    ) -> StageResult<()>;
}

/// Workflow-attached storage for `push` builds. Needs no credentials.
#[async_trait]
pub trait ArchiveSink: Send + Sync {
    async fn archive(&self, job: &Job, artifacts: &[Artifact]) -> StageResult<Vec<PathBuf>>;
}

async fn run_publish_command(
    runner: &dyn CommandRunner,
    action: PublishAction,
    spec: &CommandSpec,
) -> StageResult<()> {
    let output = runner.run(spec).await.map_err(|e| StageError::Publish {
        action: action.name().to_string(),
        reason: format!("{} could not run: {}", spec.display(), e),
    })?;
    if output.passed() {
        Ok(())
    } else {
        Err(StageError::Publish {
            action: action.name().to_string(),
            reason: output.failure_reason(),
        })
    }
}

/// Uploads with `twine`. Credentials travel in the child environment.
pub struct TwineIndex {
    runner: Arc<dyn CommandRunner>,
    repository_url: String,
    timeout_secs: u64,
}

impl TwineIndex {
    pub fn new(runner: Arc<dyn CommandRunner>, repository_url: impl Into<String>, timeout_secs: u64) -> Self {
        Self {
            runner,
            repository_url: repository_url.into(),
            timeout_secs,
        }
    }

    pub fn command(&self, artifact: &Artifact, credentials: &IndexCredentials) -> CommandSpec {
        CommandSpec::new("twine_upload", "twine")
            .args(["upload", "--non-interactive", "--repository-url"])
            .arg(self.repository_url.as_str())
            .arg(artifact.path.to_string_lossy())
            .secret_env("TWINE_USERNAME", credentials.username.clone())
            .secret_env("TWINE_PASSWORD", credentials.password.clone())
            .timeout_secs(self.timeout_secs)
    }
}

#[async_trait]
impl PackageIndex for TwineIndex {
    async fn upload(&self, artifact: &Artifact, credentials: &IndexCredentials) -> StageResult<()> {
        let spec = self.command(artifact, credentials);
        run_publish_command(self.runner.as_ref(), PublishAction::PublishIndex, &spec).await
    }
}

/// Mirrors the collected directory with `aws s3 sync`.
pub struct S3SyncStore {
    runner: Arc<dyn CommandRunner>,
    bucket: Option<String>,
    timeout_secs: u64,
}

impl S3SyncStore {
    pub fn new(runner: Arc<dyn CommandRunner>, bucket: Option<String>, timeout_secs: u64) -> Self {
        Self {
            runner,
            bucket,
            timeout_secs,
        }
    }
}

#[async_trait]
impl ObjectStore for S3SyncStore {
    async fn mirror(
        &self,
        source_dir: &Path,
        artifacts: &[Artifact],
        destination: &str,
        credentials: &StoreCredentials,
    ) -> StageResult<()> {
        let bucket = self.bucket.as_deref().ok_or_else(|| StageError::Publish {
            action: PublishAction::MirrorStore.name().to_string(),
            reason: "no object store bucket configured".to_string(),
        })?;
        let mut spec = CommandSpec::new("s3_sync", "aws")
            .args(["s3", "sync"])
            .arg(source_dir.to_string_lossy())
            .arg(format!("{}/{}/", bucket.trim_end_matches('/'), destination))
            .args(["--exclude", "*"]);
        for artifact in artifacts {
            spec = spec.arg("--include").arg(artifact.name.as_str());
        }
        let spec = spec
            .secret_env("AWS_ACCESS_KEY_ID", credentials.key_id.clone())
            .secret_env("AWS_SECRET_ACCESS_KEY", credentials.secret.clone())
            .timeout_secs(self.timeout_secs);
        run_publish_command(self.runner.as_ref(), PublishAction::MirrorStore, &spec).await
    }
}

/// Copies artifacts into `<root>/<run id>/<job slug>/`.
pub struct DirectoryArchive {
    root: PathBuf,
}

impl DirectoryArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl ArchiveSink for DirectoryArchive {
    async fn archive(&self, job: &Job, artifacts: &[Artifact]) -> StageResult<Vec<PathBuf>> {
        let dir = self.root.join(job.run_id.to_string()).join(job.slug());
        tokio::fs::create_dir_all(&dir).await?;
        let mut stored = Vec::with_capacity(artifacts.len());
        for artifact in artifacts {
            let target = dir.join(&artifact.name);
            tokio::fs::copy(&artifact.path, &target).await?;
            stored.push(target);
        }
        Ok(stored)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

pub struct PublicationController {
    index: Arc<dyn PackageIndex>,
    store: Arc<dyn ObjectStore>,
    archive: Arc<dyn ArchiveSink>,
    retry: RetryPolicy,
    store_prefix: String,
}

impl PublicationController {
    pub fn new(
        index: Arc<dyn PackageIndex>,
        store: Arc<dyn ObjectStore>,
        archive: Arc<dyn ArchiveSink>,
    ) -> Self {
        Self {
            index,
            store,
            archive,
            retry: RetryPolicy::none(),
            store_prefix: PublishConfig::default().prefix,
        }
    }

    /// Controller with the command-backed back ends.
    pub fn from_config(config: &PublishConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self::new(
            Arc::new(TwineIndex::new(runner.clone(), config.repository_url.as_str(), config.timeout_secs)),
            Arc::new(S3SyncStore::new(runner, config.bucket.clone(), config.timeout_secs)),
            Arc::new(DirectoryArchive::new(config.archive_dir.clone())),
        )
        .with_store_prefix(config.prefix.as_str())
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_store_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store_prefix = prefix.into();
        self
    }

    /// Object store key prefix for an event.
    pub fn destination(&self, event: &EventContext) -> String {
        format!("{}/{}", self.store_prefix.trim_matches('/'), event.reference())
    }

    /// Run the event's actions over the job's collected artifacts.
    pub async fn publish(
        &self,
        event: &EventContext,
        job: &Job,
        artifacts: &[Artifact],
        credentials: &Credentials,
    ) -> PublishReport {
        let actions = PublishAction::for_event(event.event);
        let secrets = credentials.secret_values();
        let mut report = PublishReport {
            event: event.event,
            actions: Vec::with_capacity(actions.len()),
        };

        // Only the designated job ever hands an sdist to the index.
        let artifacts: Vec<Artifact> = artifacts
            .iter()
            .filter(|a| {
                let keep = !a.is_sdist() || job.publishes_sdist;
                if !keep {
                    warn!(job = %job.slug(), artifact = %a.name, "dropping sdist from non-designated job");
                }
                keep
            })
            .cloned()
            .collect();
        let names: Vec<String> = artifacts.iter().map(|a| a.name.clone()).collect();

        for action in actions {
            let result = match action {
                PublishAction::Skip => {
                    info!(job = %job.slug(), "no publication for {}", event.event);
                    report.actions.push(ActionRecord {
                        action: *action,
                        status: ActionStatus::Skipped,
                        artifacts: Vec::new(),
                        detail: None,
                    });
                    obs::emit_publish_action(&job.id.to_string(), action.name(), "skipped", 0);
                    continue;
                }
                _ if artifacts.is_empty() => Err(StageError::Publish {
                    action: action.name().to_string(),
                    reason: "no collected artifacts to publish".to_string(),
                }),
                PublishAction::Archive => self.archive.archive(job, &artifacts).await.map(|_| ()),
                PublishAction::PublishIndex => self.publish_index(&artifacts, credentials).await,
                PublishAction::MirrorStore => self.mirror(event, &artifacts, credentials).await,
            };

            let (status, detail) = match result {
                Ok(()) => (ActionStatus::Succeeded, None),
                Err(e) => (ActionStatus::Failed, Some(failure_reason(e, &secrets))),
            };
            obs::emit_publish_action(&job.id.to_string(), action.name(), status.as_str(), names.len());
            if let Some(detail) = &detail {
                warn!(job = %job.slug(), action = %action, reason = %detail, "publication action failed");
            }
            report.actions.push(ActionRecord {
                action: *action,
                status,
                artifacts: names.clone(),
                detail,
            });
            if status == ActionStatus::Failed {
                break;
            }
        }
        report
    }

    async fn publish_index(&self, artifacts: &[Artifact], credentials: &Credentials) -> StageResult<()> {
        let creds = credentials.index.as_ref().ok_or_else(|| StageError::Publish {
            action: PublishAction::PublishIndex.name().to_string(),
            reason: "package index credentials are not configured".to_string(),
        })?;
        let secrets = credentials.secret_values();
        let secrets = secrets.as_slice();
        for artifact in artifacts {
            retry(&self.retry, PublishAction::PublishIndex.name(), || async move {
                self.index
                    .upload(artifact, creds)
                    .await
                    .map_err(|e| scrubbed(PublishAction::PublishIndex, e, secrets))
            })
            .await?;
        }
        Ok(())
    }

    async fn mirror(&self, event: &EventContext, artifacts: &[Artifact], credentials: &Credentials) -> StageResult<()> {
        let creds = credentials.store.as_ref().ok_or_else(|| StageError::Publish {
            action: PublishAction::MirrorStore.name().to_string(),
            reason: "object store credentials are not configured".to_string(),
        })?;
        let source_dir = artifacts
            .first()
            .and_then(|a| a.path.parent())
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let destination = self.destination(event);
        let (source_dir, destination) = (source_dir.as_path(), destination.as_str());
        let secrets = credentials.secret_values();
        let secrets = secrets.as_slice();
        retry(&self.retry, PublishAction::MirrorStore.name(), || async move {
            self.store
                .mirror(source_dir, artifacts, destination, creds)
                .await
                .map_err(|e| scrubbed(PublishAction::MirrorStore, e, secrets))
        })
        .await
    }
}

/// Reason text for a failed action with every secret value masked.
fn failure_reason(err: StageError, secrets: &[&str]) -> String {
    match err {
        StageError::Publish { reason, .. } => redact(&reason, secrets),
        other => redact(&other.to_string(), secrets),
    }
}

fn scrubbed(action: PublishAction, err: StageError, secrets: &[&str]) -> StageError {
    StageError::Publish {
        action: action.name().to_string(),
        reason: failure_reason(err, secrets),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::ArtifactKind;
    use crate::credentials::{CredentialSource, StaticCredentialSource, INDEX_PASSWORD_VAR, INDEX_USERNAME_VAR, STORE_KEY_ID_VAR, STORE_SECRET_VAR};
    use crate::fakes::{job_for, RecordingArchive, RecordingIndex, RecordingStore, ScriptedRunner};
    use crate::matrix::{InterpreterVersion, Platform};

    fn wheel(name: &str) -> Artifact {
        Artifact {
            name: name.to_string(),
            path: PathBuf::from("/work/collected").join(name),
            kind: ArtifactKind::Wheel,
            interpreter: Some(InterpreterVersion::new(3, 8)),
            sha256: "00".repeat(32),
            size: 1,
        }
    }

    fn sdist() -> Artifact {
        Artifact {
            kind: ArtifactKind::Sdist,
            interpreter: None,
            ..wheel("aequilibrae-0.7.1.tar.gz")
        }
    }

    fn credentials() -> Credentials {
        StaticCredentialSource::new()
            .with(INDEX_USERNAME_VAR, "__token__")
            .with(INDEX_PASSWORD_VAR, "pypi-secret-value")
            .with(STORE_KEY_ID_VAR, "AKIAEXAMPLE")
            .with(STORE_SECRET_VAR, "store-secret-value")
            .resolve()
    }

    struct Fakes {
        index: Arc<RecordingIndex>,
        store: Arc<RecordingStore>,
        archive: Arc<RecordingArchive>,
    }

    fn controller(index: RecordingIndex, store: RecordingStore) -> (Fakes, PublicationController) {
        let fakes = Fakes {
            index: Arc::new(index),
            store: Arc::new(store),
            archive: Arc::new(RecordingArchive::new()),
        };
        let controller = PublicationController::new(fakes.index.clone(), fakes.store.clone(), fakes.archive.clone());
        (fakes, controller)
    }

    #[test]
    fn test_state_machine_is_keyed_by_event() {
        assert_eq!(
            PublishAction::for_event(TriggerEvent::Push),
            &[PublishAction::Archive, PublishAction::MirrorStore]
        );
        assert_eq!(
            PublishAction::for_event(TriggerEvent::Release),
            &[PublishAction::PublishIndex, PublishAction::MirrorStore]
        );
        assert_eq!(PublishAction::for_event(TriggerEvent::PullRequest), &[PublishAction::Skip]);
    }

    #[tokio::test]
    async fn test_pull_request_makes_no_external_calls() {
        let (fakes, c) = controller(RecordingIndex::new(), RecordingStore::new());
        let job = job_for(Platform::Windows, &[InterpreterVersion::new(3, 8)]);
        let report = c
            .publish(&EventContext::pull_request("feature"), &job, &[wheel("a.whl")], &credentials())
            .await;
        assert!(report.succeeded());
        assert_eq!(report.external_writes(), 0);
        assert_eq!(fakes.index.upload_count() + fakes.store.mirror_count() + fakes.archive.archive_count(), 0);
    }

    #[tokio::test]
    async fn test_push_archives_and_mirrors() {
        let (fakes, c) = controller(RecordingIndex::new(), RecordingStore::new());
        let job = job_for(Platform::Linux, &[InterpreterVersion::new(3, 8)]);
        let report = c
            .publish(&EventContext::push("main"), &job, &[wheel("a.whl")], &credentials())
            .await;
        assert!(report.succeeded());
        assert_eq!(fakes.archive.archive_count(), 1);
        assert_eq!(fakes.store.mirrors()[0].destination, "wheels/main");
        assert_eq!(fakes.index.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_release_drops_sdist_from_non_designated_job() {
        let (fakes, c) = controller(RecordingIndex::new(), RecordingStore::new());
        let job = job_for(Platform::Windows, &[InterpreterVersion::new(3, 7)]);
        let report = c
            .publish(&EventContext::release("v0.7.1"), &job, &[wheel("a.whl"), sdist()], &credentials())
            .await;
        assert!(report.succeeded());
        assert_eq!(fakes.index.uploads(), vec!["a.whl".to_string()]);
    }

    #[tokio::test]
    async fn test_missing_index_credentials_is_publish_error() {
        let (fakes, c) = controller(RecordingIndex::new(), RecordingStore::new());
        let job = job_for(Platform::Windows, &[InterpreterVersion::new(3, 8)]);
        let report = c
            .publish(&EventContext::release("v1"), &job, &[wheel("a.whl")], &Credentials::default())
            .await;
        assert!(!report.succeeded());
        let err = report.failure().unwrap();
        assert_eq!(err.class(), "publish_error");
        // Mirroring never started after the index failure.
        assert!(report.action(PublishAction::MirrorStore).is_none());
        assert_eq!(fakes.store.mirror_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_detail_is_scrubbed() {
        let (_fakes, c) = controller(
            RecordingIndex::failing("403 for user __token__ with pypi-secret-value"),
            RecordingStore::new(),
        );
        let job = job_for(Platform::Windows, &[InterpreterVersion::new(3, 8)]);
        let report = c
            .publish(&EventContext::release("v1"), &job, &[wheel("a.whl")], &credentials())
            .await;
        let detail = report.actions[0].detail.clone().unwrap();
        assert!(!detail.contains("pypi-secret-value"));
        assert!(detail.contains("****"));
    }

    #[tokio::test]
    async fn test_twine_credentials_are_secret_env_only() {
        let runner = Arc::new(ScriptedRunner::new());
        let index = TwineIndex::new(runner.clone(), "https://upload.pypi.org/legacy/", 60);
        let creds = credentials();
        index.upload(&wheel("a.whl"), creds.index.as_ref().unwrap()).await.unwrap();

        let invocation = &runner.invocations()[0];
        assert!(!invocation.command.contains("pypi-secret-value"));
        assert_eq!(invocation.secret_env_keys, vec!["TWINE_USERNAME", "TWINE_PASSWORD"]);
    }

    #[tokio::test]
    async fn test_s3_store_requires_bucket() {
        let runner = Arc::new(ScriptedRunner::new());
        let store = S3SyncStore::new(runner.clone(), None, 60);
        let creds = credentials();
        let err = store
            .mirror(Path::new("/work/collected"), &[wheel("a.whl")], "wheels/main", creds.store.as_ref().unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.class(), "publish_error");
        assert_eq!(runner.count_stage("s3_sync"), 0);
    }

    #[tokio::test]
    async fn test_directory_archive_copies_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("collected");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::write(src.join("a.whl"), b"x").unwrap();
        let artifact = Artifact {
            path: src.join("a.whl"),
            ..wheel("a.whl")
        };
        let job = job_for(Platform::Macos, &[InterpreterVersion::new(3, 9)]);
        let archive = DirectoryArchive::new(tmp.path().join("archive"));
        let stored = archive.archive(&job, &[artifact]).await.unwrap();
        assert!(stored[0].exists());
        assert!(stored[0].starts_with(tmp.path().join("archive").join(job.run_id.to_string())));
    }
}
