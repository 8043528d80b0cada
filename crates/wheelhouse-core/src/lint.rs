//! Linter gate.
//!
//! The linter runs once per (event, platform). Its verdict is published
//! on a watch channel; a job's test stage blocks on that channel and only
//! starts when the verdict is `Passed`. A failed verdict fails every
//! waiting job of that platform without running its tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::command::{CommandRunner, CommandSpec};
use crate::config::LintConfig;
use crate::context::host_python;
use crate::error::{StageError, StageResult};
use crate::matrix::{InterpreterVersion, Platform};

/// Lint outcome as seen by waiting jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LintVerdict {
    Pending,
    Passed,
    Failed { reason: String },
}

/// Static-analysis pass over the source tree. Needs no build artifacts.
pub struct LinterGate;

impl LinterGate {
    /// Run the configured linter. A bare `python` in the command means the
    /// platform's host interpreter for `version`.
    pub async fn lint(
        runner: &dyn CommandRunner,
        config: &LintConfig,
        source_dir: &Path,
        platform: Platform,
        version: InterpreterVersion,
    ) -> StageResult<()> {
        let stage = format!("lint_{platform}");
        let spec = match config.command.split_first() {
            Some((program, rest)) if program == "python" => {
                Some(host_python(&stage, platform, version).args(rest.iter().cloned()))
            }
            _ => CommandSpec::from_argv(stage, &config.command),
        }
        .ok_or_else(|| StageError::Lint {
            platform,
            reason: "lint command is empty".to_string(),
        })?
        .cwd(source_dir)
            .timeout_secs(config.timeout_secs);

        let output = runner.run(&spec).await.map_err(|e| StageError::Lint {
            platform,
            reason: format!("{} could not run: {}", spec.display(), e),
        })?;
        if output.passed() {
            info!(platform = %platform, "lint passed");
            Ok(())
        } else {
            warn!(platform = %platform, exit_code = output.exit_code, "lint failed");
            Err(StageError::Lint {
                platform,
                reason: output.failure_reason(),
            })
        }
    }
}

/// Per-run lint verdict channels, keyed by platform.
#[derive(Debug, Clone, Default)]
pub struct LintGates {
    gates: Arc<HashMap<Platform, watch::Sender<LintVerdict>>>,
}

impl LintGates {
    pub fn new(platforms: &[Platform]) -> Self {
        let gates = platforms
            .iter()
            .map(|p| (*p, watch::channel(LintVerdict::Pending).0))
            .collect();
        Self {
            gates: Arc::new(gates),
        }
    }

    pub fn is_gated(&self, platform: Platform) -> bool {
        self.gates.contains_key(&platform)
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.gates.keys().copied().collect();
        platforms.sort();
        platforms
    }

    /// Publish the verdict for a platform. Later publications are ignored.
    pub fn publish(&self, platform: Platform, verdict: LintVerdict) {
        if let Some(tx) = self.gates.get(&platform) {
            tx.send_if_modified(|current| {
                if *current == LintVerdict::Pending {
                    *current = verdict;
                    true
                } else {
                    false
                }
            });
        }
    }

    pub fn current(&self, platform: Platform) -> Option<LintVerdict> {
        self.gates.get(&platform).map(|tx| tx.borrow().clone())
    }

    /// Block until the platform's verdict is known. Ungated platforms
    /// pass immediately.
    pub async fn wait(&self, platform: Platform) -> StageResult<()> {
        let Some(tx) = self.gates.get(&platform) else {
            return Ok(());
        };
        let mut rx = tx.subscribe();
        let verdict = rx
            .wait_for(|v| *v != LintVerdict::Pending)
            .await
            .map(|v| (*v).clone())
            .map_err(|_| StageError::Lint {
                platform,
                reason: "lint gate closed without a verdict".to_string(),
            })?;
        match verdict {
            LintVerdict::Passed => Ok(()),
            LintVerdict::Failed { reason } => Err(StageError::Lint { platform, reason }),
            LintVerdict::Pending => Err(StageError::Lint {
                platform,
                reason: "lint gate closed without a verdict".to_string(),
            }),
        }
    }
}
