//! Per-job execution context shared by the stage components.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::config::PipelineConfig;
use crate::error::{StageError, StageResult};
use crate::job::Job;
use crate::matrix::{InterpreterVersion, Platform};

/// Everything a stage needs to act on one job. Holds no credentials.
#[derive(Clone)]
pub struct JobContext {
    pub job: Job,
    pub config: Arc<PipelineConfig>,
    pub runner: Arc<dyn CommandRunner>,
    /// Isolated work directory, exclusive to this job.
    pub work_dir: PathBuf,
}

impl JobContext {
    pub fn new(job: Job, config: Arc<PipelineConfig>, runner: Arc<dyn CommandRunner>) -> Self {
        let work_dir = job.work_dir(&config.package.work_dir);
        Self {
            job,
            config,
            runner,
            work_dir,
        }
    }

    pub fn source_dir(&self) -> &Path {
        &self.config.package.source_dir
    }

    /// Job-private copy of the source tree. Every step that writes into
    /// the tree (`build/`, `*.egg-info`, in-place extensions) runs here.
    pub fn build_tree(&self) -> PathBuf {
        self.work_dir.join("src")
    }

    /// Refresh [`Self::build_tree`] from the shared source tree.
    pub async fn stage_source(&self) -> StageResult<PathBuf> {
        let source = self.source_dir().to_path_buf();
        let tree = self.build_tree();
        let skip = absolute(&self.config.package.work_dir);
        let dest = tree.clone();
        tokio::task::spawn_blocking(move || {
            if dest.exists() {
                std::fs::remove_dir_all(&dest)?;
            }
            copy_tree(&source, &dest, &skip)
        })
        .await
        .map_err(|e| StageError::Build {
            sub_stage: "stage_source".to_string(),
            reason: e.to_string(),
        })?
        .map_err(|e| StageError::Build {
            sub_stage: "stage_source".to_string(),
            reason: format!("copying {:?}: {}", self.source_dir(), e),
        })?;
        debug!(job = %self.job.slug(), tree = %tree.display(), "source staged");
        Ok(tree)
    }

    /// Where build sub-stages write distributables.
    pub fn dist_dir(&self) -> PathBuf {
        self.work_dir.join("dist")
    }

    /// Canonical collection directory.
    pub fn collected_dir(&self) -> PathBuf {
        self.work_dir.join("collected")
    }

    /// Interpreter invocation on the job's native host.
    pub fn python(&self, stage: &str, version: InterpreterVersion) -> CommandSpec {
        host_python(stage, self.job.cell.platform, version)
    }

    /// Run a command, turning spawn failures and non-zero exits into a
    /// reason string for the caller's error type.
    pub async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput, String> {
        let output = self
            .runner
            .run(spec)
            .await
            .map_err(|e| format!("{} could not run: {}", spec.display(), e))?;
        if output.passed() {
            Ok(output)
        } else {
            Err(output.failure_reason())
        }
    }
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("job", &self.job.slug())
            .field("work_dir", &self.work_dir)
            .finish()
    }
}

/// Resolve `path` against the current directory when it is relative.
pub fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// Build leftovers and VCS metadata that never belong in a job's tree.
fn is_build_residue(name: &str) -> bool {
    matches!(name, ".git" | "build" | "dist" | "__pycache__" | ".tox" | ".venv")
        || name.ends_with(".egg-info")
}

/// Recursively copy `src` into `dst`, leaving out build residue and the
/// `skip` directory (the work root may live inside the source tree).
fn copy_tree(src: &Path, dst: &Path, skip: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let path = entry.path();
        if is_build_residue(&entry.file_name().to_string_lossy()) || absolute(&path) == skip {
            continue;
        }
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&path, &target, skip)?;
        } else {
            std::fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

/// `py -3.8` on Windows, `python3.8` elsewhere.
pub fn host_python(stage: &str, platform: Platform, version: InterpreterVersion) -> CommandSpec {
    match platform {
        Platform::Windows => CommandSpec::new(stage, "py").arg(format!("-{version}")),
        Platform::Linux | Platform::Macos => CommandSpec::new(stage, version.executable()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_python_per_platform() {
        let v = InterpreterVersion::new(3, 8);
        let win = host_python("x", Platform::Windows, v);
        assert_eq!(win.display(), "py -3.8");
        let mac = host_python("x", Platform::Macos, v);
        assert_eq!(mac.display(), "python3.8");
    }

    #[tokio::test]
    async fn test_stage_source_copies_without_residue() {
        use crate::fakes::{job_for, ScriptedRunner};

        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("pkg");
        std::fs::create_dir_all(source.join("aequilibrae/paths")).unwrap();
        std::fs::create_dir_all(source.join("build/lib")).unwrap();
        std::fs::create_dir_all(source.join("aequilibrae.egg-info")).unwrap();
        std::fs::write(source.join("setup.py"), "setup()").unwrap();
        std::fs::write(source.join("aequilibrae/paths/graph.pyx"), "").unwrap();

        let mut config = PipelineConfig::default();
        config.package.source_dir = source.clone();
        config.package.work_dir = source.join("out");
        let ctx = JobContext::new(
            job_for(Platform::Macos, &[InterpreterVersion::new(3, 8)]),
            Arc::new(config),
            Arc::new(ScriptedRunner::new()),
        );

        let tree = ctx.stage_source().await.unwrap();
        assert!(tree.starts_with(&ctx.work_dir));
        assert!(tree.join("setup.py").exists());
        assert!(tree.join("aequilibrae/paths/graph.pyx").exists());
        assert!(!tree.join("build").exists());
        assert!(!tree.join("aequilibrae.egg-info").exists());
        assert!(!tree.join("out").exists());

        // Re-staging replaces whatever the last build left behind.
        std::fs::write(tree.join("stale.so"), "").unwrap();
        ctx.stage_source().await.unwrap();
        assert!(!tree.join("stale.so").exists());
    }
}
