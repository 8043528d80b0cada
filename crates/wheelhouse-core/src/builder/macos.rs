//! macOS: native `bdist_wheel` per matrix cell.

use crate::command::CommandSpec;
use crate::context::JobContext;
use crate::matrix::Platform;

use super::{sdist_step, wheel_pattern, PlatformBuilder};

pub struct MacosBuilder;

impl PlatformBuilder for MacosBuilder {
    fn platform(&self) -> Platform {
        Platform::Macos
    }

    fn sub_stages(&self, ctx: &JobContext) -> Vec<CommandSpec> {
        let dist_dir = ctx.dist_dir();
        let mut steps: Vec<CommandSpec> = ctx
            .job
            .interpreters
            .iter()
            .map(|version| {
                ctx.python("bdist_wheel", *version)
                    .args(["setup.py", "bdist_wheel", "-d"])
                    .arg(dist_dir.to_string_lossy())
                    .cwd(ctx.build_tree())
                    .timeout_secs(ctx.config.build.timeout_secs)
                    .declares_output(wheel_pattern(ctx, &dist_dir, *version))
            })
            .collect();
        steps.extend(sdist_step(ctx));
        steps
    }
}
