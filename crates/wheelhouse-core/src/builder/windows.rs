//! Windows: stage the spatial-data extension, compile in place, package.

use crate::command::CommandSpec;
use crate::context::JobContext;
use crate::matrix::Platform;

use super::{sdist_step, wheel_pattern, PlatformBuilder};

/// Compiles the extension as its own `build_ext` sub-stage so the test
/// suite can run against the in-place build before packaging.
pub struct WindowsBuilder;

impl PlatformBuilder for WindowsBuilder {
    fn platform(&self) -> Platform {
        Platform::Windows
    }

    fn sub_stages(&self, ctx: &JobContext) -> Vec<CommandSpec> {
        let timeout = ctx.config.build.timeout_secs;
        let staging = ctx.work_dir.join(&ctx.config.windows.staging_dir);
        let archive = staging.join("spatialite.7z");
        let dist_dir = ctx.dist_dir();

        let mut steps = vec![
            CommandSpec::new("fetch_spatialite", "curl")
                .args(["-L", "--fail", "--create-dirs", "-o"])
                .arg(archive.to_string_lossy())
                .arg(ctx.config.windows.spatialite_url.as_str())
                .timeout_secs(timeout),
            CommandSpec::new("stage_spatialite", "7z")
                .args(["x", "-y"])
                .arg(archive.to_string_lossy())
                .arg(format!("-o{}", staging.display()))
                .timeout_secs(timeout),
        ];

        for version in &ctx.job.interpreters {
            steps.push(
                ctx.python("build_ext", *version)
                    .args(["setup.py", "build_ext", "--inplace"])
                    .cwd(ctx.build_tree())
                    .env("SPATIALITE_DIR", staging.to_string_lossy())
                    .timeout_secs(timeout),
            );
            steps.push(
                ctx.python("bdist_wheel", *version)
                    .args(["setup.py", "bdist_wheel", "-d"])
                    .arg(dist_dir.to_string_lossy())
                    .cwd(ctx.build_tree())
                    .env("SPATIALITE_DIR", staging.to_string_lossy())
                    .timeout_secs(timeout)
                    .declares_output(wheel_pattern(ctx, &dist_dir, *version)),
            );
        }

        steps.extend(sdist_step(ctx));
        steps
    }

    fn compiles_in_place(&self) -> bool {
        true
    }
}
