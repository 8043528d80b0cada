//! Dependency resolution: install the job's build dependency set.
//!
//! Runs before any build step. Every command is idempotent (`pip install
//! --upgrade`, `docker pull`), so a retried or re-run resolution is safe.

use tracing::{debug, info};

use crate::command::CommandSpec;
use crate::context::JobContext;
use crate::error::{StageError, StageResult};
use crate::matrix::Platform;
use crate::retry::retry;

pub struct DependencyResolver;

impl DependencyResolver {
    /// Install commands for the job, in execution order.
    pub fn plan(ctx: &JobContext) -> Vec<CommandSpec> {
        let deps = &ctx.config.dependencies;
        let cell = ctx.job.cell;

        if cell.platform == Platform::Linux {
            // Interpreters and build tools live inside the pinned image.
            let image = ctx.config.linux.image(cell.architecture);
            return vec![CommandSpec::new("pull_image", "docker")
                .args(["pull", image.as_str()])
                .timeout_secs(deps.timeout_secs)];
        }

        let mut commands = Vec::new();
        for version in &ctx.job.interpreters {
            if !deps.packages.is_empty() {
                commands.push(
                    ctx.python("pip_install", *version)
                        .args(["-m", "pip", "install", "--upgrade"])
                        .args(deps.packages.iter().cloned())
                        .cwd(ctx.source_dir())
                        .timeout_secs(deps.timeout_secs),
                );
            }
            for requirements in &deps.requirements {
                commands.push(
                    ctx.python("pip_install_requirements", *version)
                        .args(["-m", "pip", "install", "-r"])
                        .arg(requirements.to_string_lossy())
                        .cwd(ctx.source_dir())
                        .timeout_secs(deps.timeout_secs),
                );
            }
        }
        commands
    }

    /// Install the dependency set, failing fast on the first command that
    /// still fails after the configured retry policy.
    pub async fn resolve(ctx: &JobContext) -> StageResult<()> {
        let commands = Self::plan(ctx);
        info!(job = %ctx.job.slug(), commands = commands.len(), "resolving dependencies");

        for spec in &commands {
            retry(&ctx.config.retry, &spec.stage, || async move {
                ctx.run_checked(spec)
                    .await
                    .map_err(|reason| StageError::Dependency {
                        step: spec.stage.clone(),
                        reason,
                    })
            })
            .await?;
            debug!(step = %spec.stage, command = %spec.display(), "dependency step done");
        }
        Ok(())
    }
}
