//! Platform builders.
//!
//! Each variant declares the ordered sub-stages it needs for a job
//! ([`PlatformBuilder::sub_stages`]); the shared [`PlatformBuilder::build`]
//! runs whatever list the variant exposes. Nothing above this module
//! branches on platform to decide how to build.
//!
//! - [`LinuxBuilder`]: one container run per interpreter tag inside an
//!   ABI-pinned manylinux image.
//! - [`MacosBuilder`]: `bdist_wheel` on the native host.
//! - [`WindowsBuilder`]: fetch and stage the spatial-data dependency,
//!   `build_ext` in place, then `bdist_wheel`.
//!
//! A build sub-stage is never retried here.

mod linux;
mod macos;
mod windows;

pub use linux::LinuxBuilder;
pub use macos::MacosBuilder;
pub use windows::WindowsBuilder;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::command::CommandSpec;
use crate::context::JobContext;
use crate::error::{StageError, StageResult};
use crate::matrix::{InterpreterVersion, Platform};

/// Result of a successful build: where the distributables are and which
/// interpreters they target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CompiledExtension {
    pub platform: Platform,
    pub interpreters: Vec<InterpreterVersion>,
    /// Directories the collector searches.
    pub output_dirs: Vec<PathBuf>,
    /// Whether the extension was also compiled into the source tree, so
    /// the test suite can import it directly.
    pub in_place: bool,
    /// Sub-stages executed, in order.
    pub sub_stages: Vec<String>,
}

#[async_trait]
pub trait PlatformBuilder: Send + Sync {
    fn platform(&self) -> Platform;

    /// Ordered sub-stage commands for this job.
    fn sub_stages(&self, ctx: &JobContext) -> Vec<CommandSpec>;

    /// Directories the build writes distributables into.
    fn output_dirs(&self, ctx: &JobContext) -> Vec<PathBuf> {
        vec![ctx.dist_dir()]
    }

    fn compiles_in_place(&self) -> bool {
        false
    }

    /// Stage the job's private source tree, then run every sub-stage in
    /// order. The first failure is fatal.
    async fn build(&self, ctx: &JobContext) -> StageResult<CompiledExtension> {
        ctx.stage_source().await?;
        let output_dirs = self.output_dirs(ctx);
        for dir in &output_dirs {
            tokio::fs::create_dir_all(dir).await?;
        }

        let steps = self.sub_stages(ctx);
        let mut executed = Vec::with_capacity(steps.len());
        for step in &steps {
            info!(job = %ctx.job.slug(), sub_stage = %step.stage, "build sub-stage");
            ctx.run_checked(step)
                .await
                .map_err(|reason| StageError::Build {
                    sub_stage: step.stage.clone(),
                    reason,
                })?;
            executed.push(step.stage.clone());
        }

        Ok(CompiledExtension {
            platform: self.platform(),
            interpreters: ctx.job.interpreters.clone(),
            output_dirs,
            in_place: self.compiles_in_place(),
            sub_stages: executed,
        })
    }
}

/// Glob for the wheel a job must produce for one interpreter.
pub fn wheel_pattern(ctx: &JobContext, dir: &std::path::Path, version: InterpreterVersion) -> String {
    let cell = ctx.job.cell;
    let platform_tag = match cell.platform {
        Platform::Windows => cell.platform.wheel_tag_fragments(cell.architecture).join("*"),
        Platform::Linux | Platform::Macos => {
            let fragments = cell.platform.wheel_tag_fragments(cell.architecture);
            format!("{}*_{}", fragments[0], fragments[1])
        }
    };
    dir.join(format!(
        "{}-*-{}-{}-{}.whl",
        ctx.config.package.dist_name(),
        version.python_tag(),
        version.abi_tag(),
        platform_tag
    ))
    .to_string_lossy()
    .into_owned()
}

/// Glob for the job's source distribution.
pub fn sdist_pattern(ctx: &JobContext) -> String {
    ctx.dist_dir()
        .join(format!("{}-*.tar.gz", ctx.config.package.dist_name()))
        .to_string_lossy()
        .into_owned()
}

/// Native source distribution sub-stage, appended only for the
/// designated job. Runs under an interpreter the resolver installed into.
pub fn sdist_step(ctx: &JobContext) -> Option<CommandSpec> {
    if !ctx.job.publishes_sdist {
        return None;
    }
    Some(
        ctx.python("sdist", ctx.config.sdist.interpreter_version)
            .args(["setup.py", "sdist", "-d"])
            .arg(ctx.dist_dir().to_string_lossy())
            .cwd(ctx.build_tree())
            .timeout_secs(ctx.config.build.timeout_secs)
            .declares_output(sdist_pattern(ctx)),
    )
}

/// Platform → builder lookup.
#[derive(Clone, Default)]
pub struct BuilderRegistry {
    builders: HashMap<Platform, Arc<dyn PlatformBuilder>>,
}

impl BuilderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the three standard platform builders.
    pub fn standard() -> Self {
        Self::new()
            .with(Arc::new(LinuxBuilder))
            .with(Arc::new(MacosBuilder))
            .with(Arc::new(WindowsBuilder))
    }

    /// Register (or replace) the builder for its platform.
    pub fn with(mut self, builder: Arc<dyn PlatformBuilder>) -> Self {
        self.builders.insert(builder.platform(), builder);
        self
    }

    pub fn get(&self, platform: Platform) -> StageResult<Arc<dyn PlatformBuilder>> {
        self.builders
            .get(&platform)
            .cloned()
            .ok_or_else(|| StageError::Build {
                sub_stage: "select_builder".to_string(),
                reason: format!("no builder registered for {platform}"),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::fakes::{job_for, ScriptedRunner};

    fn ctx(platform: Platform, versions: &[InterpreterVersion], sdist: bool) -> JobContext {
        let mut job = job_for(platform, versions);
        job.publishes_sdist = sdist;
        let mut config = PipelineConfig::default();
        config.package.work_dir = PathBuf::from("/tmp/wh-test");
        JobContext::new(job, Arc::new(config), Arc::new(ScriptedRunner::new()))
    }

    fn stage_names(steps: &[CommandSpec]) -> Vec<&str> {
        steps.iter().map(|s| s.stage.as_str()).collect()
    }

    const V37: InterpreterVersion = InterpreterVersion::new(3, 7);
    const V38: InterpreterVersion = InterpreterVersion::new(3, 8);
    const V39: InterpreterVersion = InterpreterVersion::new(3, 9);

    #[test]
    fn test_windows_capability_set() {
        let c = ctx(Platform::Windows, &[V38], false);
        let steps = WindowsBuilder.sub_stages(&c);
        assert_eq!(
            stage_names(&steps),
            vec!["fetch_spatialite", "stage_spatialite", "build_ext", "bdist_wheel"]
        );
        assert!(WindowsBuilder.compiles_in_place());
    }

    #[test]
    fn test_linux_fans_out_per_interpreter_tag() {
        let c = ctx(Platform::Linux, &[V37, V38, V39], false);
        let steps = LinuxBuilder.sub_stages(&c);
        assert_eq!(
            stage_names(&steps),
            vec!["manylinux_cp37", "manylinux_cp38", "manylinux_cp39"]
        );
        assert!(steps.iter().all(|s| s.program == "docker"));
        assert!(steps[0]
            .args
            .iter()
            .any(|a| a == "quay.io/pypa/manylinux2014_x86_64"));
        let mount = format!("{}:/io", c.build_tree().display());
        assert!(steps[0].args.contains(&mount));
    }

    #[test]
    fn test_linux_sdist_runs_in_container() {
        let c = ctx(Platform::Linux, &[V37, V38, V39], true);
        let steps = LinuxBuilder.sub_stages(&c);
        let sdist = steps.last().unwrap();
        assert_eq!(sdist.stage, "sdist");
        assert_eq!(sdist.program, "docker");
        assert!(sdist
            .args
            .iter()
            .any(|a| a == "/opt/python/cp38-cp38/bin/python setup.py sdist -d /out/dist"));
    }

    #[test]
    fn test_native_steps_run_in_job_tree() {
        let c = ctx(Platform::Windows, &[V38], true);
        let tree = c.build_tree();
        for step in WindowsBuilder.sub_stages(&c) {
            if matches!(step.stage.as_str(), "build_ext" | "bdist_wheel" | "sdist") {
                assert_eq!(step.cwd.as_deref(), Some(tree.as_path()), "{}", step.stage);
            }
        }
        let c = ctx(Platform::Macos, &[V39], false);
        let steps = MacosBuilder.sub_stages(&c);
        assert_eq!(steps[0].cwd.as_deref(), Some(c.build_tree().as_path()));
    }

    #[test]
    fn test_macos_builds_natively() {
        let c = ctx(Platform::Macos, &[V39], false);
        let steps = MacosBuilder.sub_stages(&c);
        assert_eq!(stage_names(&steps), vec!["bdist_wheel"]);
        assert_eq!(steps[0].program, "python3.9");
    }

    #[test]
    fn test_sdist_only_for_designated_job() {
        let c = ctx(Platform::Windows, &[V38], true);
        let steps = WindowsBuilder.sub_stages(&c);
        assert_eq!(steps.last().map(|s| s.stage.as_str()), Some("sdist"));

        let c = ctx(Platform::Windows, &[V38], false);
        assert!(sdist_step(&c).is_none());
    }

    #[test]
    fn test_wheel_pattern_is_qualified() {
        let c = ctx(Platform::Windows, &[V38], false);
        let pattern = wheel_pattern(&c, &c.dist_dir(), V38);
        assert!(pattern.ends_with("aequilibrae-*-cp38-cp38-win_amd64.whl"));

        let c = ctx(Platform::Linux, &[V37], false);
        let pattern = wheel_pattern(&c, &c.dist_dir(), V37);
        assert!(pattern.ends_with("aequilibrae-*-cp37-cp37m-manylinux*_x86_64.whl"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = BuilderRegistry::standard();
        assert_eq!(registry.get(Platform::Linux).unwrap().platform(), Platform::Linux);
        assert!(BuilderRegistry::new().get(Platform::Windows).is_err());
    }

    #[tokio::test]
    async fn test_build_stops_at_failing_sub_stage() {
        let dir = tempfile::tempdir().unwrap();
        let mut job = job_for(Platform::Windows, &[V38]);
        job.publishes_sdist = false;
        let mut config = PipelineConfig::default();
        config.package.work_dir = dir.path().to_path_buf();
        let runner = Arc::new(ScriptedRunner::new().fail_stage("build_ext", 2));
        let c = JobContext::new(job, Arc::new(config), runner.clone());

        let err = WindowsBuilder.build(&c).await.unwrap_err();
        match err {
            StageError::Build { sub_stage, .. } => assert_eq!(sub_stage, "build_ext"),
            other => panic!("expected build error, got {other:?}"),
        }
        assert_eq!(runner.count_stage("fetch_spatialite"), 1);
        assert_eq!(runner.count_stage("bdist_wheel"), 0);
    }
}
