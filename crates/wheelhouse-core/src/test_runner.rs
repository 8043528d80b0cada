//! Test stage: run the package's suite against the compiled extension.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::builder::CompiledExtension;
use crate::command::CommandSpec;
use crate::context::JobContext;
use crate::error::{StageError, StageResult};
use crate::matrix::InterpreterVersion;

/// Outcome of one test stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TestReport {
    pub passed: bool,
    /// Failed test count reported by the suite (at least 1 when it failed
    /// without a parsable summary).
    pub failed: usize,
    pub interpreters: Vec<InterpreterVersion>,
    /// Last lines of the suite output for failing runs.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub diagnostics: String,
}

impl TestReport {
    /// Turn a failing report into a `TestFailure`.
    pub fn ensure_passed(self) -> StageResult<Self> {
        if self.passed {
            Ok(self)
        } else {
            Err(StageError::TestFailure {
                failed: self.failed,
                summary: self.diagnostics,
            })
        }
    }
}

pub struct TestRunner;

impl TestRunner {
    /// Commands for one interpreter. When the build did not compile in
    /// place, the freshly built wheel is installed first.
    pub fn plan(ctx: &JobContext, compiled: &CompiledExtension, version: InterpreterVersion) -> Vec<CommandSpec> {
        let config = &ctx.config.test;
        let mut commands = Vec::new();

        if !compiled.in_place {
            let mut install = ctx
                .python("test_install", version)
                .args(["-m", "pip", "install", "--no-index"]);
            for dir in &compiled.output_dirs {
                install = install.arg("--find-links").arg(dir.to_string_lossy());
            }
            commands.push(
                install
                    .arg(ctx.config.package.name.as_str())
                    .cwd(ctx.build_tree())
                    .timeout_secs(config.timeout_secs),
            );
        }

        // A bare `python` in the configured command means the job's interpreter.
        let suite = match config.command.split_first() {
            Some((program, rest)) if program == "python" => {
                Some(ctx.python("test", version).args(rest.iter().cloned()))
            }
            _ => CommandSpec::from_argv("test", &config.command),
        };
        commands.extend(
            suite.map(|s| s.cwd(ctx.build_tree()).timeout_secs(config.timeout_secs)),
        );
        commands
    }

    /// Run the suite for every interpreter the job built.
    pub async fn test(ctx: &JobContext, compiled: &CompiledExtension) -> TestReport {
        let mut report = TestReport {
            passed: true,
            failed: 0,
            interpreters: compiled.interpreters.clone(),
            diagnostics: String::new(),
        };

        'interpreters: for version in &compiled.interpreters {
            for spec in Self::plan(ctx, compiled, *version) {
                match ctx.runner.run(&spec).await {
                    Ok(output) if output.passed() => {}
                    Ok(output) => {
                        let combined = format!("{}\n{}", output.stdout, output.stderr);
                        report.passed = false;
                        report.failed += failed_count(&combined).unwrap_or(1);
                        report.diagnostics = format!("{} ({}): {}", spec.stage, version, output.failure_reason());
                        break 'interpreters;
                    }
                    Err(e) => {
                        report.passed = false;
                        report.failed += 1;
                        report.diagnostics = format!("{} could not run: {}", spec.display(), e);
                        break 'interpreters;
                    }
                }
            }
        }

        if report.passed {
            info!(job = %ctx.job.slug(), "test suite passed");
        } else {
            warn!(job = %ctx.job.slug(), failed = report.failed, "test suite failed");
        }
        report
    }
}

static FAILED_SUMMARY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+) (?:failed|errors?)\b").unwrap());

/// Failure count from a pytest-style summary line (`3 failed, 10 passed`).
fn failed_count(output: &str) -> Option<usize> {
    let total: usize = FAILED_SUMMARY
        .captures_iter(output)
        .filter_map(|c| c[1].parse::<usize>().ok())
        .sum();
    (total > 0).then_some(total)
}
