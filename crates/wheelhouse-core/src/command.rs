//! External command specification and execution.
//!
//! Every stage talks to its external collaborator (pip, the compiler
//! toolchain, docker, the linter, the test runner, twine, the object store
//! CLI) through a [`CommandSpec`] handed to a [`CommandRunner`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::credentials::{redact, Secret};

/// A single external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Sub-stage name used in logs and errors (e.g. `build_ext`).
    pub stage: String,

    /// Executable.
    pub program: String,

    pub args: Vec<String>,

    /// Working directory (inherits the current one when unset).
    pub cwd: Option<PathBuf>,

    /// Plain environment variables.
    pub env: Vec<(String, String)>,

    /// Secret environment variables. Passed to the child process only;
    /// never rendered by [`CommandSpec::display`].
    pub secret_env: Vec<(String, Secret)>,

    /// Timeout in seconds (0 = none).
    pub timeout_secs: u64,

    /// Glob patterns of files this command is expected to write.
    pub declared_outputs: Vec<String>,
}

impl CommandSpec {
    pub fn new(stage: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            secret_env: Vec::new(),
            timeout_secs: 0,
            declared_outputs: Vec::new(),
        }
    }

    /// Build from an argv vector (first element is the executable).
    pub fn from_argv(stage: impl Into<String>, argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(stage, program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn secret_env(mut self, key: impl Into<String>, value: Secret) -> Self {
        self.secret_env.push((key.into(), value));
        self
    }

    pub fn timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn declares_output(mut self, pattern: impl Into<String>) -> Self {
        self.declared_outputs.push(pattern.into());
        self
    }

    /// Loggable command line. Secret env values never appear here.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn secret_values(&self) -> Vec<&str> {
        self.secret_env.iter().map(|(_, v)| v.expose()).collect()
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stage: String,

    /// Exit code (0 = success, -1 when killed by a signal).
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,

    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }

    /// Last non-empty line of stderr (or stdout), for error messages.
    pub fn tail(&self) -> String {
        let source = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        source
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .trim()
            .to_string()
    }

    /// Human-readable failure reason.
    pub fn failure_reason(&self) -> String {
        let tail = self.tail();
        if tail.is_empty() {
            format!("exited with code {}", self.exit_code)
        } else {
            format!("exited with code {}: {}", self.exit_code, tail)
        }
    }
}

/// Executes commands on behalf of pipeline stages.
///
/// `Err` means the command could not run at all (spawn failure, timeout);
/// a command that ran and exited non-zero is `Ok` with a non-zero code.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let start = Instant::now();
        debug!(stage = %spec.stage, command = %spec.display(), "spawning command");

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }
        for (key, value) in &spec.secret_env {
            command.env(key, value.expose());
        }

        let child = command.spawn()?;
        let output = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| {
                std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!(
                        "{} timed out after {} seconds",
                        spec.stage, spec.timeout_secs
                    ),
                )
            })??
        } else {
            child.wait_with_output().await?
        };

        let secrets = spec.secret_values();
        Ok(CommandOutput {
            stage: spec.stage.clone(),
            exit_code: output.status.code().unwrap_or(-1),
            stdout: redact(&String::from_utf8_lossy(&output.stdout), &secrets),
            stderr: redact(&String::from_utf8_lossy(&output.stderr), &secrets),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_excludes_secret_env() {
        let spec = CommandSpec::new("upload", "twine")
            .args(["upload", "dist/pkg.whl"])
            .secret_env("TWINE_PASSWORD", Secret::new("hunter2"));
        assert_eq!(spec.display(), "twine upload dist/pkg.whl");
        assert!(!format!("{spec:?}").contains("hunter2"));
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["flake8".to_string(), "--count".to_string()];
        let spec = CommandSpec::from_argv("lint", &argv).unwrap();
        assert_eq!(spec.program, "flake8");
        assert_eq!(spec.args, vec!["--count"]);
        assert!(CommandSpec::from_argv("lint", &[]).is_none());
    }

    #[test]
    fn test_failure_reason_uses_last_stderr_line() {
        let out = CommandOutput {
            stage: "build_ext".to_string(),
            exit_code: 1,
            stdout: "compiling\n".to_string(),
            stderr: "warning: x\nerror: missing Python.h\n\n".to_string(),
            duration_ms: 10,
        };
        assert!(!out.passed());
        assert_eq!(out.failure_reason(), "exited with code 1: error: missing Python.h");
    }

    #[tokio::test]
    async fn test_process_runner_runs_command() {
        let spec = CommandSpec::new("echo_test", "echo").arg("hello").timeout_secs(60);
        let out = ProcessRunner.run(&spec).await.expect("run failed");
        assert!(out.passed());
        assert!(out.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_process_runner_reports_nonzero_exit() {
        let spec = CommandSpec::new("false_test", "false");
        let out = ProcessRunner.run(&spec).await.expect("run failed");
        assert!(!out.passed());
    }

    #[tokio::test]
    async fn test_process_runner_redacts_secret_output() {
        let spec = CommandSpec::new("leak", "sh")
            .args(["-c", "echo token=$LEAKY"])
            .secret_env("LEAKY", Secret::new("topsecret"));
        let out = ProcessRunner.run(&spec).await.expect("run failed");
        assert!(out.stdout.contains("token=****"));
        assert!(!out.stdout.contains("topsecret"));
    }

    #[tokio::test]
    async fn test_process_runner_timeout() {
        let spec = CommandSpec::new("sleepy", "sleep").arg("5").timeout_secs(1);
        let err = ProcessRunner.run(&spec).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_process_runner_spawn_failure() {
        let spec = CommandSpec::new("missing", "definitely-not-a-real-binary-xyz");
        assert!(ProcessRunner.run(&spec).await.is_err());
    }
}
