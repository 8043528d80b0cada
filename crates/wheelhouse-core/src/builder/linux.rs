//! Linux: build inside an ABI-pinned manylinux container.

use std::path::PathBuf;

use crate::command::CommandSpec;
use crate::context::{absolute, JobContext};
use crate::matrix::{InterpreterVersion, Platform};

use super::{sdist_pattern, wheel_pattern, PlatformBuilder};

/// Runs one container per interpreter tag. The job covers every matrix
/// interpreter for its architecture; the orchestrator does not fan out
/// Linux cells itself. The sdist, when designated, is built in the same
/// image so the host needs nothing beyond docker.
pub struct LinuxBuilder;

impl LinuxBuilder {
    fn wheelhouse(ctx: &JobContext) -> PathBuf {
        ctx.work_dir.join("wheelhouse")
    }

    /// `docker run` with the job's tree at `/io` and its work dir at `/out`.
    fn container(ctx: &JobContext, stage: String, script: String) -> CommandSpec {
        let image = ctx.config.linux.image(ctx.job.cell.architecture);
        CommandSpec::new(stage, "docker")
            .args(["run", "--rm", "-v"])
            .arg(format!("{}:/io", absolute(&ctx.build_tree()).display()))
            .arg("-v")
            .arg(format!("{}:/out", absolute(&ctx.work_dir).display()))
            .args(["-w", "/io"])
            .arg(image)
            .args(["sh", "-c"])
            .arg(script)
            .timeout_secs(ctx.config.build.timeout_secs)
    }

    fn interpreter(version: InterpreterVersion) -> String {
        format!("/opt/python/{}/bin/python", version.interpreter_tag())
    }
}

impl PlatformBuilder for LinuxBuilder {
    fn platform(&self) -> Platform {
        Platform::Linux
    }

    fn sub_stages(&self, ctx: &JobContext) -> Vec<CommandSpec> {
        let wheelhouse = Self::wheelhouse(ctx);

        let mut steps: Vec<CommandSpec> = ctx
            .job
            .interpreters
            .iter()
            .map(|version| {
                let tag = version.interpreter_tag();
                let script = format!(
                    "{} -m pip wheel /io --no-deps -w /tmp/raw-{tag} \
                     && auditwheel repair /tmp/raw-{tag}/*.whl -w /out/wheelhouse",
                    Self::interpreter(*version)
                );
                Self::container(ctx, format!("manylinux_{}", version.python_tag()), script)
                    .declares_output(wheel_pattern(ctx, &wheelhouse, *version))
            })
            .collect();

        if ctx.job.publishes_sdist {
            let script = format!(
                "{} setup.py sdist -d /out/dist",
                Self::interpreter(ctx.config.sdist.interpreter_version)
            );
            steps.push(
                Self::container(ctx, "sdist".to_string(), script)
                    .declares_output(sdist_pattern(ctx)),
            );
        }
        steps
    }

    fn output_dirs(&self, ctx: &JobContext) -> Vec<PathBuf> {
        vec![Self::wheelhouse(ctx), ctx.dist_dir()]
    }
}
