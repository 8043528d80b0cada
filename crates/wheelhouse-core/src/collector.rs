//! Artifact collection.
//!
//! After a successful build the collector searches the job's output
//! directories for distributables, keeps only the files that belong to
//! this job (right distribution, interpreter tags and platform tag), and
//! moves them into the job's canonical `collected/` directory. Finding
//! nothing is a collection error even when every earlier stage passed.

use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::builder::CompiledExtension;
use crate::context::JobContext;
use crate::error::{StageError, StageResult};
use crate::matrix::InterpreterVersion;

pub const MANIFEST_FILE: &str = "manifest.json";

const WHEEL_NAME: &str = r"^(?P<dist>[A-Za-z0-9_.]+)-(?P<version>[^-]+)(?:-\d[^-]*)?-(?P<py>[^-]+)-(?P<abi>[^-]+)-(?P<plat>[^-]+)\.whl$";
const SDIST_NAME: &str = r"^(?P<dist>[A-Za-z0-9_.]+)-(?P<version>[^-]+)\.tar\.gz$";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    Wheel,
    Sdist,
}

/// A collected distributable, owned by the publication stage from here on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    /// File name.
    pub name: String,
    /// Location under the job's `collected/` directory.
    pub path: PathBuf,
    pub kind: ArtifactKind,
    /// Interpreter a wheel targets; `None` for sdists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<InterpreterVersion>,
    pub sha256: String,
    pub size: u64,
}

impl Artifact {
    pub fn is_sdist(&self) -> bool {
        self.kind == ArtifactKind::Sdist
    }
}

/// File-name rules for one job.
struct NameRules {
    wheel: Regex,
    sdist: Regex,
    dist_name: String,
}

impl NameRules {
    fn new(ctx: &JobContext) -> StageResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))
        };
        Ok(Self {
            wheel: compile(WHEEL_NAME)?,
            sdist: compile(SDIST_NAME)?,
            dist_name: ctx.config.package.dist_name().to_ascii_lowercase(),
        })
    }

    /// Classify a file name, or `None` when it does not belong to the job.
    fn classify(&self, ctx: &JobContext, file_name: &str) -> Option<(ArtifactKind, Option<InterpreterVersion>)> {
        if let Some(caps) = self.wheel.captures(file_name) {
            if caps["dist"].to_ascii_lowercase() != self.dist_name {
                return None;
            }
            let interpreter = ctx.job.interpreters.iter().copied().find(|v| {
                caps["py"] == v.python_tag() && caps["abi"] == v.abi_tag()
            })?;
            let cell = ctx.job.cell;
            let plat = &caps["plat"];
            let fragments = cell.platform.wheel_tag_fragments(cell.architecture);
            if !fragments.iter().all(|f| plat.contains(f)) {
                return None;
            }
            return Some((ArtifactKind::Wheel, Some(interpreter)));
        }
        if let Some(caps) = self.sdist.captures(file_name) {
            if caps["dist"].to_ascii_lowercase() == self.dist_name && ctx.job.publishes_sdist {
                return Some((ArtifactKind::Sdist, None));
            }
        }
        None
    }
}

pub struct ArtifactCollector;

impl ArtifactCollector {
    /// Collect the job's artifacts into `collected/` and write a manifest.
    pub async fn collect(ctx: &JobContext, compiled: &CompiledExtension) -> StageResult<Vec<Artifact>> {
        let rules = NameRules::new(ctx)?;
        let collected_dir = ctx.collected_dir();
        tokio::fs::create_dir_all(&collected_dir).await?;

        let mut artifacts = Vec::new();
        for dir in &compiled.output_dirs {
            for candidate in candidates(dir) {
                let Some(file_name) = candidate.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some((kind, interpreter)) = rules.classify(ctx, file_name) else {
                    warn!(job = %ctx.job.slug(), file = %file_name, "ignoring file that does not match the job");
                    continue;
                };
                let target = collected_dir.join(file_name);
                relocate(&candidate, &target).await?;
                let bytes = tokio::fs::read(&target).await?;
                debug!(job = %ctx.job.slug(), artifact = %file_name, "collected");
                artifacts.push(Artifact {
                    name: file_name.to_string(),
                    path: target,
                    kind,
                    interpreter,
                    sha256: hex::encode(Sha256::digest(&bytes)),
                    size: bytes.len() as u64,
                });
            }
        }

        if artifacts.is_empty() {
            let searched = compiled
                .output_dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(StageError::Collection { searched });
        }

        for version in &ctx.job.interpreters {
            if !artifacts.iter().any(|a| a.interpreter == Some(*version)) {
                warn!(job = %ctx.job.slug(), interpreter = %version, "no wheel collected for interpreter");
            }
        }

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        let manifest = serde_json::to_vec_pretty(&artifacts)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(collected_dir.join(MANIFEST_FILE), manifest).await?;

        info!(job = %ctx.job.slug(), count = artifacts.len(), "artifacts collected");
        Ok(artifacts)
    }
}

/// Wheels and sdists directly inside `dir`.
fn candidates(dir: &Path) -> Vec<PathBuf> {
    let mut found = Vec::new();
    for suffix in ["*.whl", "*.tar.gz"] {
        let pattern = dir.join(suffix).to_string_lossy().into_owned();
        match glob::glob(&pattern) {
            Ok(paths) => found.extend(paths.filter_map(|p| p.ok())),
            Err(e) => warn!(pattern = %pattern, error = %e, "invalid collection pattern"),
        }
    }
    found.sort();
    found
}

/// Move a file, falling back to copy + remove across filesystems.
async fn relocate(from: &Path, to: &Path) -> std::io::Result<()> {
    if tokio::fs::rename(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to).await?;
    tokio::fs::remove_file(from).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::fakes::{job_for, ScriptedRunner};
    use crate::matrix::Platform;
    use std::sync::Arc;

    const V37: InterpreterVersion = InterpreterVersion::new(3, 7);
    const V38: InterpreterVersion = InterpreterVersion::new(3, 8);

    fn setup(platform: Platform, versions: &[InterpreterVersion], sdist: bool) -> (tempfile::TempDir, JobContext, CompiledExtension) {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job_for(platform, versions);
        job.publishes_sdist = sdist;
        let mut config = PipelineConfig::default();
        config.package.work_dir = dir.path().to_path_buf();
        let ctx = JobContext::new(job, Arc::new(config), Arc::new(ScriptedRunner::new()));
        std::fs::create_dir_all(ctx.dist_dir()).unwrap();
        let compiled = CompiledExtension {
            platform,
            interpreters: versions.to_vec(),
            output_dirs: vec![ctx.dist_dir()],
            in_place: false,
            sub_stages: vec![],
        };
        (dir, ctx, compiled)
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"wheel bytes").unwrap();
    }

    #[tokio::test]
    async fn test_collects_matching_wheel_with_manifest() {
        let (_tmp, ctx, compiled) = setup(Platform::Windows, &[V38], false);
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1-cp38-cp38-win_amd64.whl");

        let artifacts = ArtifactCollector::collect(&ctx, &compiled).await.unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].interpreter, Some(V38));
        assert_eq!(artifacts[0].size, 11);
        assert_eq!(artifacts[0].sha256.len(), 64);
        assert!(artifacts[0].path.starts_with(ctx.collected_dir()));
        assert!(!ctx.dist_dir().join(&artifacts[0].name).exists());

        let manifest = std::fs::read_to_string(ctx.collected_dir().join(MANIFEST_FILE)).unwrap();
        let parsed: Vec<Artifact> = serde_json::from_str(&manifest).unwrap();
        assert_eq!(parsed, artifacts);
    }

    #[tokio::test]
    async fn test_rejects_wrong_interpreter_and_platform() {
        let (_tmp, ctx, compiled) = setup(Platform::Windows, &[V38], false);
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1-cp39-cp39-win_amd64.whl");
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1-cp38-cp38-win32.whl");

        let err = ArtifactCollector::collect(&ctx, &compiled).await.unwrap_err();
        assert_eq!(err.class(), "collection_error");
    }

    #[tokio::test]
    async fn test_empty_output_is_collection_error() {
        let (_tmp, ctx, compiled) = setup(Platform::Macos, &[V38], false);
        let err = ArtifactCollector::collect(&ctx, &compiled).await.unwrap_err();
        assert!(matches!(err, StageError::Collection { .. }));
    }

    #[tokio::test]
    async fn test_sdist_only_collected_by_designated_job() {
        let (_tmp, ctx, compiled) = setup(Platform::Windows, &[V38], false);
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1-cp38-cp38-win_amd64.whl");
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1.tar.gz");
        let artifacts = ArtifactCollector::collect(&ctx, &compiled).await.unwrap();
        assert!(artifacts.iter().all(|a| !a.is_sdist()));

        let (_tmp, ctx, compiled) = setup(Platform::Windows, &[V38], true);
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1-cp38-cp38-win_amd64.whl");
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1.tar.gz");
        let artifacts = ArtifactCollector::collect(&ctx, &compiled).await.unwrap();
        assert_eq!(artifacts.iter().filter(|a| a.is_sdist()).count(), 1);
    }

    #[tokio::test]
    async fn test_linux_collects_every_interpreter_tag() {
        let (_tmp, ctx, compiled) = setup(Platform::Linux, &[V37, V38], false);
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1-cp37-cp37m-manylinux2014_x86_64.whl");
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1-cp38-cp38-manylinux2014_x86_64.whl");
        // Unrepaired wheel with a plain linux tag is not publishable.
        touch(&ctx.dist_dir(), "aequilibrae-0.7.1-cp38-cp38-linux_x86_64.whl");

        let artifacts = ArtifactCollector::collect(&ctx, &compiled).await.unwrap();
        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].interpreter, Some(V37));
    }
}
