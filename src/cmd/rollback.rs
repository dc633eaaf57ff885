//! Generation rollback commands — `rigger rollback` and `rigger test-rollback`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use super::super::Cli;

fn build_manager(
    cli: &Cli,
    project_dir: &Path,
) -> Result<(rigger::rollback::RollbackManager, rigger::lock::LockManager, std::time::Duration)> {
    use rigger::config::Config;
    use rigger::context::{CommandRunner, HostRunner};
    use rigger::lock::LockManager;
    use rigger::rollback::{HostPlatform, RollbackManager};

    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    config.ensure_directories()?;

    let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);
    let platform = HostPlatform::new(
        runner,
        config.toml.platform.generation_cmd.clone(),
        config.toml.platform.switch_cmd.clone(),
        config.toml.platform.probe_cmd.clone(),
    );
    let manager = RollbackManager::new(
        config.rollback_file.clone(),
        config.toml.platform.backup_root.clone().into(),
        Arc::new(platform),
    );
    let locks = LockManager::new(config.lock_file.clone(), config.lock_poll_interval());
    Ok((manager, locks, config.lock_timeout()))
}

pub async fn cmd_rollback(cli: &Cli, project_dir: &Path) -> Result<()> {
    let (manager, locks, timeout) = build_manager(cli, project_dir)?;
    let _guard = locks.acquire(timeout).await?;

    let point = manager.rollback().await?;
    println!(
        "Rolled back to generation {} (captured {}: {})",
        point.prior_generation_id, point.created_at, point.description
    );
    Ok(())
}

pub async fn cmd_test_rollback(cli: &Cli, project_dir: &Path) -> Result<()> {
    let (manager, locks, timeout) = build_manager(cli, project_dir)?;
    let _guard = locks.acquire(timeout).await?;

    manager.self_test().await?;
    println!("Rollback self-test passed: both probes healthy, generation restored.");
    Ok(())
}
