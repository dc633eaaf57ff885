//! Cluster phases: bootstrap, workload deployment, end-to-end verification.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::info;

use super::{PhaseHandler, PhaseOutcome};
use crate::context::RunContext;
use crate::health::HealthCheckResult;
use crate::util::retry;

/// Endpoints probed by the verify phase.
const VERIFY_ENDPOINTS: &[&str] = &[
    "http://127.0.0.1/healthz",
    "http://127.0.0.1:9100/metrics",
];

/// Bring up the single-node workload cluster.
pub struct ClusterBootstrapPhase;

#[async_trait]
impl PhaseHandler for ClusterBootstrapPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        let kubectl = ctx.config.toml.commands.kubectl.clone();

        // Already up? Bootstrap is idempotent.
        if ctx.runner.run(&kubectl, &["get", "nodes", "--no-headers"]).await?.success() {
            return Ok(PhaseOutcome::success_with("cluster already reachable"));
        }

        ctx.run_ok("systemctl", &["enable", "--now", "k3s"])
            .await
            .context("failed to start the cluster service")?;

        // The API server takes a few seconds to come up after the unit starts.
        retry(5, Duration::from_secs(3), 1.5, || {
            let kubectl = kubectl.clone();
            async move { ctx.run_ok(&kubectl, &["get", "nodes", "--no-headers"]).await }
        })
        .await
        .context("cluster API never became reachable")?;

        Ok(PhaseOutcome::success_with("cluster bootstrapped"))
    }

    async fn health_check(&self, ctx: &RunContext) -> Result<HealthCheckResult> {
        let kubectl = &ctx.config.toml.commands.kubectl;
        let output = ctx.runner.run(kubectl, &["get", "nodes", "--no-headers"]).await?;
        if !output.success() {
            return Ok(HealthCheckResult::fail("cluster API unreachable"));
        }
        let not_ready: Vec<&str> = output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty() && !node_is_ready(l))
            .filter_map(|l| l.split_whitespace().next())
            .collect();
        Ok(if not_ready.is_empty() {
            HealthCheckResult::pass("all nodes ready")
        } else {
            HealthCheckResult::fail(format!("nodes not ready: {}", not_ready.join(", ")))
        })
    }

    async fn probe_outputs(&self, ctx: &RunContext) -> Result<bool> {
        let kubectl = &ctx.config.toml.commands.kubectl;
        Ok(ctx.runner.run(kubectl, &["get", "nodes", "--no-headers"]).await?.success())
    }
}

fn node_is_ready(line: &str) -> bool {
    line.split_whitespace().nth(1) == Some("Ready")
}

/// Apply the workload manifests to the cluster.
pub struct WorkloadsPhase;

impl WorkloadsPhase {
    fn manifests_dir(ctx: &RunContext) -> std::path::PathBuf {
        ctx.config.inputs_dir.join("workloads")
    }
}

#[async_trait]
impl PhaseHandler for WorkloadsPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        let manifests = Self::manifests_dir(ctx);
        if !manifests.is_dir() {
            return Ok(PhaseOutcome::failed(format!(
                "no workload manifests under {}",
                manifests.display()
            )));
        }
        let kubectl = &ctx.config.toml.commands.kubectl;
        let dir = manifests.to_string_lossy().into_owned();
        ctx.run_ok(kubectl, &["apply", "-R", "-f", &dir])
            .await
            .context("kubectl apply failed")?;
        info!(dir = %manifests.display(), "workload manifests applied");
        Ok(PhaseOutcome::success())
    }

    async fn health_check(&self, ctx: &RunContext) -> Result<HealthCheckResult> {
        let kubectl = &ctx.config.toml.commands.kubectl;
        let output = ctx
            .run_ok(kubectl, &["get", "pods", "--all-namespaces", "--no-headers"])
            .await?;
        let unhealthy = unhealthy_pods(&output.stdout);
        Ok(if unhealthy.is_empty() {
            HealthCheckResult::pass("all workloads running")
        } else {
            HealthCheckResult::fail(format!("workloads not running: {}", unhealthy.join(", ")))
        })
    }

    /// Workload failures are the self-healing class: pods stuck because a
    /// referenced artifact is missing get the remediation loop before the
    /// failure handler sees them.
    fn heals_on_failure(&self) -> bool {
        true
    }
}

/// Pod names whose status column is neither Running nor Completed.
/// Input is `kubectl get pods -A --no-headers` output.
pub(crate) fn unhealthy_pods(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // namespace name ready status restarts age
            let (name, status) = (cols.get(1)?, cols.get(3)?);
            if *status == "Running" || *status == "Completed" {
                None
            } else {
                Some((*name).to_string())
            }
        })
        .collect()
}

/// Probe the deployed host end to end.
pub struct VerifyPhase;

#[async_trait]
impl PhaseHandler for VerifyPhase {
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome> {
        let mut failures = Vec::new();
        for &endpoint in VERIFY_ENDPOINTS {
            let output = ctx.runner.run("curl", &["-fsS", "--max-time", "10", endpoint]).await?;
            if !output.success() {
                failures.push(endpoint);
            }
        }
        Ok(if failures.is_empty() {
            PhaseOutcome::success_with(format!("{} endpoints verified", VERIFY_ENDPOINTS.len()))
        } else {
            PhaseOutcome::failed(format!("endpoints unreachable: {}", failures.join(", ")))
        })
    }
}
