//! Rollback points and generation restore.
//!
//! Before any phase runs, the orchestrator captures the current system
//! generation as the run's rollback point. Generation mechanics live behind
//! the `Platform` trait; the production implementation shells out to the
//! commands configured in `rigger.toml`.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::CommandRunner;

/// Persisted "undo to here" marker. One active point per run; superseded
/// only by the next run's capture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackPoint {
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub prior_generation_id: String,
    pub backup_root: PathBuf,
}

/// Generation control seam.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Identifier of the currently active generation.
    async fn current_generation(&self) -> Result<String>;
    /// Activate the named generation.
    async fn switch_to(&self, generation: &str) -> Result<()>;
    /// Whether the active system answers its health probe.
    async fn health_probe(&self) -> Result<bool>;
}

/// Production platform driving the configured generation commands.
pub struct HostPlatform {
    runner: Arc<dyn CommandRunner>,
    generation_cmd: String,
    switch_cmd: String,
    probe_cmd: String,
}

impl HostPlatform {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        generation_cmd: String,
        switch_cmd: String,
        probe_cmd: String,
    ) -> Self {
        Self { runner, generation_cmd, switch_cmd, probe_cmd }
    }
}

#[async_trait]
impl Platform for HostPlatform {
    async fn current_generation(&self) -> Result<String> {
        let output = self.runner.run(&self.generation_cmd, &[]).await?;
        if !output.success() {
            bail!("{} exited with code {}", self.generation_cmd, output.exit_code);
        }
        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            bail!("{} printed no generation identifier", self.generation_cmd);
        }
        Ok(id)
    }

    async fn switch_to(&self, generation: &str) -> Result<()> {
        let output = self.runner.run(&self.switch_cmd, &[generation]).await?;
        if !output.success() {
            bail!(
                "switch to generation {generation} failed (code {}): {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    async fn health_probe(&self) -> Result<bool> {
        Ok(self.runner.run(&self.probe_cmd, &[]).await?.success())
    }
}

pub struct RollbackManager {
    point_file: PathBuf,
    backup_root: PathBuf,
    platform: Arc<dyn Platform>,
}

impl RollbackManager {
    pub fn new(point_file: PathBuf, backup_root: PathBuf, platform: Arc<dyn Platform>) -> Self {
        Self { point_file, backup_root, platform }
    }

    /// Capture the current generation as this run's rollback point.
    /// Called once, before phase execution begins.
    pub async fn capture(&self, description: &str) -> Result<RollbackPoint> {
        let prior = self
            .platform
            .current_generation()
            .await
            .context("failed to read the current generation")?;
        let point = RollbackPoint {
            description: description.to_string(),
            created_at: Utc::now(),
            prior_generation_id: prior,
            backup_root: self.backup_root.clone(),
        };
        let content =
            serde_json::to_string_pretty(&point).context("Failed to serialize rollback point")?;
        if let Some(parent) = self.point_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.point_file, content).with_context(|| {
            format!("Failed to write rollback point: {}", self.point_file.display())
        })?;
        info!(generation = %point.prior_generation_id, "rollback point captured");
        Ok(point)
    }

    /// The captured point, if this or an earlier run wrote one.
    pub fn load_point(&self) -> Result<Option<RollbackPoint>> {
        if !self.point_file.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.point_file).with_context(|| {
            format!("Failed to read rollback point: {}", self.point_file.display())
        })?;
        Ok(Some(serde_json::from_str(&content).with_context(|| {
            format!("Failed to parse rollback point: {}", self.point_file.display())
        })?))
    }

    /// Restore the prior generation from the captured point.
    pub async fn rollback(&self) -> Result<RollbackPoint> {
        let point = self
            .load_point()?
            .context("no rollback point captured; nothing to restore")?;
        warn!(generation = %point.prior_generation_id, "rolling back");
        self.platform.switch_to(&point.prior_generation_id).await?;
        Ok(point)
    }

    /// Exercise the rollback machinery without leaving the system changed:
    /// roll back, probe, restore, probe again. Fails when either probe
    /// fails or the restored generation is not the pre-test one.
    pub async fn self_test(&self) -> Result<()> {
        let point = self
            .load_point()?
            .context("no rollback point captured; run capture first")?;
        let pre_test = self.platform.current_generation().await?;

        self.platform.switch_to(&point.prior_generation_id).await
            .context("self-test rollback step failed")?;
        if !self.platform.health_probe().await? {
            // Restore before reporting so a failed probe does not strand
            // the host on the old generation.
            self.platform.switch_to(&pre_test).await
                .context("failed to restore after a failed post-rollback probe")?;
            bail!("health probe failed after rolling back to {}", point.prior_generation_id);
        }

        self.platform.switch_to(&pre_test).await
            .context("self-test restore step failed")?;
        if !self.platform.health_probe().await? {
            bail!("health probe failed after restoring generation {pre_test}");
        }

        let final_generation = self.platform.current_generation().await?;
        if final_generation != pre_test {
            bail!(
                "restored generation {final_generation} does not match pre-test generation {pre_test}"
            );
        }
        info!("rollback self-test passed");
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::FakePlatform;
    use super::*;
    use crate::context::test_support::RecordingRunner;
    use crate::context::CommandOutput;
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path, platform: Arc<FakePlatform>) -> RollbackManager {
        RollbackManager::new(
            dir.join("rollback.json"),
            PathBuf::from("/var/lib/rigger/backup"),
            platform,
        )
    }

    #[tokio::test]
    async fn capture_persists_the_current_generation() {
        let dir = tempdir().unwrap();
        let platform = Arc::new(FakePlatform::new("gen-41"));
        let mgr = manager(dir.path(), platform);

        let point = mgr.capture("pre-run").await.unwrap();
        assert_eq!(point.prior_generation_id, "gen-41");
        assert_eq!(point.description, "pre-run");

        let loaded = mgr.load_point().unwrap().unwrap();
        assert_eq!(loaded, point);
    }

    #[tokio::test]
    async fn rollback_switches_to_the_captured_generation() {
        let dir = tempdir().unwrap();
        let platform = Arc::new(FakePlatform::new("gen-41"));
        let mgr = manager(dir.path(), platform.clone());

        mgr.capture("pre-run").await.unwrap();
        // The run advanced the system before failing
        *platform.active.lock().unwrap() = "gen-42".to_string();

        mgr.rollback().await.unwrap();
        assert_eq!(*platform.active.lock().unwrap(), "gen-41");
    }

    #[tokio::test]
    async fn rollback_without_a_point_is_an_error() {
        let dir = tempdir().unwrap();
        let platform = Arc::new(FakePlatform::new("gen-41"));
        let mgr = manager(dir.path(), platform);

        let err = mgr.rollback().await.unwrap_err();
        assert!(err.to_string().contains("no rollback point"));
    }

    #[tokio::test]
    async fn self_test_round_trips_and_probes_twice() {
        let dir = tempdir().unwrap();
        let platform = Arc::new(FakePlatform::new("gen-41"));
        let mgr = manager(dir.path(), platform.clone());

        mgr.capture("pre-run").await.unwrap();
        *platform.active.lock().unwrap() = "gen-42".to_string();

        mgr.self_test().await.unwrap();

        assert_eq!(*platform.active.lock().unwrap(), "gen-42", "must end where it started");
        assert_eq!(*platform.probes.lock().unwrap(), 2, "both probes must run");
        assert_eq!(*platform.switches.lock().unwrap(), vec!["gen-41", "gen-42"]);
    }

    #[tokio::test]
    async fn self_test_fails_and_restores_when_probe_fails() {
        let dir = tempdir().unwrap();
        let platform = Arc::new(FakePlatform::new("gen-41"));
        let mgr = manager(dir.path(), platform.clone());

        mgr.capture("pre-run").await.unwrap();
        *platform.active.lock().unwrap() = "gen-42".to_string();
        platform.set_probe_healthy(false);

        let err = mgr.self_test().await.unwrap_err();
        assert!(err.to_string().contains("health probe failed"));
        assert_eq!(
            *platform.active.lock().unwrap(),
            "gen-42",
            "failed self-test must not strand the host on the old generation"
        );
    }

    #[tokio::test]
    async fn host_platform_parses_generation_and_rejects_empty() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("rigger-generation", CommandOutput::ok("gen-7\n"));
        let platform = HostPlatform::new(
            runner.clone(),
            "rigger-generation".into(),
            "rigger-switch".into(),
            "rigger-probe".into(),
        );
        assert_eq!(platform.current_generation().await.unwrap(), "gen-7");

        runner.respond("rigger-generation", CommandOutput::ok("  \n"));
        assert!(platform.current_generation().await.is_err());
    }

    #[tokio::test]
    async fn host_platform_switch_surfaces_stderr() {
        let runner = Arc::new(RecordingRunner::new());
        runner.respond("rigger-switch", CommandOutput::failed(1, "unknown generation"));
        let platform = HostPlatform::new(
            runner,
            "rigger-generation".into(),
            "rigger-switch".into(),
            "rigger-probe".into(),
        );
        let err = platform.switch_to("gen-9").await.unwrap_err();
        assert!(err.to_string().contains("unknown generation"));
    }
}
