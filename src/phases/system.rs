//! Host-level phases: preflight checks, base packages, hardware detection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use super::{PhaseHandler, PhaseOutcome};
use crate::context::RunContext;
use crate::health::HealthCheckResult;
use crate::util::retry;

/// Tools the base package set must provide.
const BASE_PACKAGES: &[&str] = &["curl", "jq", "rsync", "git"];

/// Host sanity checks before anything mutates the system.
pub struct PreflightPhase;

#[async_trait]
impl PhaseHandler for PreflightPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        let df = ctx.run_ok("df", &["-P", "/"]).await?;
        if let Some(pct) = parse_root_usage(&df.stdout) {
            if pct >= 95 {
                return Ok(PhaseOutcome::failed(format!(
                    "root filesystem is {pct}% full; free space before deploying"
                )));
            }
        }
        let ping = ctx.runner.run("ping", &["-c", "1", "-W", "2", "1.1.1.1"]).await?;
        if !ping.success() {
            return Ok(PhaseOutcome::failed("no network reachability (ping failed)"));
        }
        Ok(PhaseOutcome::success_with("disk and network look sane"))
    }
}

/// Percentage used on the root filesystem, from `df -P /` output.
fn parse_root_usage(df_output: &str) -> Option<u32> {
    df_output
        .lines()
        .nth(1)?
        .split_whitespace()
        .nth(4)?
        .trim_end_matches('%')
        .parse()
        .ok()
}

/// Install the base package set.
pub struct BasePackagesPhase;

#[async_trait]
impl PhaseHandler for BasePackagesPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        let pm = ctx.config.toml.commands.package_manager.clone();
        let mut args: Vec<&str> = vec!["install", "-y"];
        args.extend(BASE_PACKAGES);

        // Package mirrors flake; one retry is usually enough.
        retry(2, Duration::from_secs(5), 2.0, || {
            let args = args.clone();
            let pm = pm.clone();
            async move { ctx.run_ok(&pm, &args).await }
        })
        .await
        .context("package installation failed")?;

        Ok(PhaseOutcome::success_with(format!("installed {} packages", BASE_PACKAGES.len())))
    }

    async fn health_check(&self, ctx: &RunContext) -> Result<HealthCheckResult> {
        let mut missing = Vec::new();
        for &tool in BASE_PACKAGES {
            let output = ctx.runner.run("which", &[tool]).await?;
            if !output.success() {
                missing.push(tool);
            }
        }
        Ok(if missing.is_empty() {
            HealthCheckResult::pass("all base tools resolve on PATH")
        } else {
            HealthCheckResult::fail(format!("missing tools after install: {}", missing.join(", ")))
        })
    }

    async fn probe_outputs(&self, ctx: &RunContext) -> Result<bool> {
        for &tool in BASE_PACKAGES {
            if !ctx.runner.run("which", &[tool]).await?.success() {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Detect GPU/CPU and record the hardware profile for later phases.
pub struct HardwareDetectPhase;

impl HardwareDetectPhase {
    fn profile_path(ctx: &RunContext) -> std::path::PathBuf {
        ctx.config.state_dir.join("hardware.toml")
    }
}

#[async_trait]
impl PhaseHandler for HardwareDetectPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        let lspci = ctx.runner.run("lspci", &[]).await?;
        let gpu = lspci
            .stdout
            .lines()
            .find(|l| l.contains("VGA") || l.contains("3D controller"))
            .map(|l| l.trim().to_string());

        let nproc = ctx.runner.run("nproc", &[]).await?;
        let cpus = nproc.stdout.trim().to_string();

        let profile = format!(
            "gpu = {:?}\ncpus = {:?}\n",
            gpu.as_deref().unwrap_or("none"),
            if cpus.is_empty() { "unknown" } else { &cpus },
        );
        let path = Self::profile_path(ctx);
        std::fs::write(&path, profile)
            .with_context(|| format!("Failed to write hardware profile: {}", path.display()))?;

        info!(gpu = gpu.as_deref().unwrap_or("none"), "hardware profile recorded");
        Ok(PhaseOutcome::success_with(match gpu {
            Some(gpu) => format!("gpu: {gpu}"),
            None => "no discrete gpu detected".to_string(),
        }))
    }

    async fn probe_outputs(&self, ctx: &RunContext) -> Result<bool> {
        Ok(Self::profile_path(ctx).exists())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::stub_context_with_runner;
    use crate::context::CommandOutput;
    use crate::health::HealthStatus;
    use tempfile::tempdir;

    const DF_OK: &str = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                         /dev/sda1 100000 40000 60000 40% /\n";
    const DF_FULL: &str = "Filesystem 1024-blocks Used Available Capacity Mounted on\n\
                           /dev/sda1 100000 97000 3000 97% /\n";

    #[test]
    fn parse_root_usage_reads_capacity_column() {
        assert_eq!(parse_root_usage(DF_OK), Some(40));
        assert_eq!(parse_root_usage(DF_FULL), Some(97));
        assert_eq!(parse_root_usage(""), None);
    }

    #[tokio::test]
    async fn preflight_fails_on_full_disk() {
        let dir = tempdir().unwrap();
        let (ctx, runner) = stub_context_with_runner(dir.path());
        runner.respond("df", CommandOutput::ok(DF_FULL));

        let outcome = PreflightPhase.execute(&ctx).await.unwrap();
        match outcome {
            PhaseOutcome::Failed { message } => assert!(message.contains("97%")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn preflight_fails_without_network() {
        let dir = tempdir().unwrap();
        let (ctx, runner) = stub_context_with_runner(dir.path());
        runner.respond("df", CommandOutput::ok(DF_OK));
        runner.respond("ping", CommandOutput::failed(1, "unreachable"));

        let outcome = PreflightPhase.execute(&ctx).await.unwrap();
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn preflight_succeeds_on_healthy_host() {
        let dir = tempdir().unwrap();
        let (ctx, runner) = stub_context_with_runner(dir.path());
        runner.respond("df", CommandOutput::ok(DF_OK));

        assert!(PreflightPhase.execute(&ctx).await.unwrap().is_success());
    }

    #[tokio::test]
    async fn packages_health_check_reports_missing_tools() {
        let dir = tempdir().unwrap();
        let (ctx, runner) = stub_context_with_runner(dir.path());
        runner.respond("which", CommandOutput::failed(1, ""));

        let result = BasePackagesPhase.health_check(&ctx).await.unwrap();
        assert_eq!(result.status, HealthStatus::Fail);
        assert!(result.message.contains("curl"));
    }

    #[tokio::test]
    async fn packages_probe_outputs_true_when_all_tools_present() {
        let dir = tempdir().unwrap();
        let (ctx, _runner) = stub_context_with_runner(dir.path());
        // RecordingRunner defaults every command to success
        assert!(BasePackagesPhase.probe_outputs(&ctx).await.unwrap());
    }

    #[tokio::test]
    async fn hardware_detect_writes_profile_and_probe_sees_it() {
        let dir = tempdir().unwrap();
        let (ctx, runner) = stub_context_with_runner(dir.path());
        runner.respond(
            "lspci",
            CommandOutput::ok("01:00.0 VGA compatible controller: NVIDIA RTX A4000\n"),
        );
        runner.respond("nproc", CommandOutput::ok("16\n"));

        assert!(!HardwareDetectPhase.probe_outputs(&ctx).await.unwrap());
        let outcome = HardwareDetectPhase.execute(&ctx).await.unwrap();
        assert!(outcome.is_success());
        assert!(HardwareDetectPhase.probe_outputs(&ctx).await.unwrap());

        let profile = std::fs::read_to_string(ctx.config.state_dir.join("hardware.toml")).unwrap();
        assert!(profile.contains("NVIDIA"));
        assert!(profile.contains("16"));
    }
}
