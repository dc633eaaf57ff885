//! The explicit run context threaded through the engine.
//!
//! Everything a phase handler may touch travels through `RunContext`; there
//! is no ambient global state. External commands go through the
//! `CommandRunner` seam so dry runs and tests never shell out.

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::config::Config;

/// Captured result of an external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { exit_code: 0, stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self { exit_code, stdout: String::new(), stderr: stderr.into() }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes external commands on behalf of phase handlers and platform
/// adapters.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Production runner: spawns the command and captures its output.
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!(program, ?args, "running command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to spawn command: {program}"))?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Context passed explicitly through the scheduler, failure handler, and
/// every phase handler.
#[derive(Clone)]
pub struct RunContext {
    pub config: Config,
    pub runner: Arc<dyn CommandRunner>,
    pub dry_run: bool,
}

impl RunContext {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>, dry_run: bool) -> Self {
        Self { config, runner, dry_run }
    }

    /// Run a command, turning a non-zero exit into an error that carries
    /// the captured stderr.
    pub async fn run_ok(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.runner.run(program, args).await?;
        if !output.success() {
            anyhow::bail!(
                "{program} exited with code {}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn host_runner_captures_output() {
        let runner = HostRunner;
        let output = runner.run("echo", &["hello"]).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn host_runner_reports_nonzero_exit() {
        let runner = HostRunner;
        let output = runner.run("sh", &["-c", "exit 3"]).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert!(!output.success());
    }

    #[tokio::test]
    async fn run_ok_surfaces_stderr_on_failure() {
        let dir = tempdir().unwrap();
        let (ctx, runner) = stub_context_with_runner(dir.path());
        runner.respond("systemctl", CommandOutput::failed(1, "unit not found"));

        let err = ctx.run_ok("systemctl", &["start", "ghost"]).await.unwrap_err();
        assert!(err.to_string().contains("unit not found"));
        assert_eq!(runner.calls(), vec!["systemctl start ghost"]);
    }

    #[tokio::test]
    async fn recording_runner_defaults_to_success() {
        let dir = tempdir().unwrap();
        let (ctx, _runner) = stub_context_with_runner(dir.path());
        let output = ctx.run_ok("anything", &[]).await.unwrap();
        assert!(output.success());
    }
}
