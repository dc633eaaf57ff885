//! Pipeline execution — `rigger run` and `rigger test-phase <id>`.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use super::super::Cli;

/// Wire the production orchestrator: real command runner, kubectl-backed
/// cluster ops, and the generation commands from `rigger.toml`.
pub fn build_orchestrator(
    cli: &Cli,
    project_dir: &Path,
    dry_run: bool,
) -> Result<rigger::executor::Orchestrator> {
    use rigger::config::Config;
    use rigger::context::{CommandRunner, HostRunner, RunContext};
    use rigger::executor::Orchestrator;
    use rigger::heal::{KubeClusterOps, SelfHealer};
    use rigger::lock::LockManager;
    use rigger::phase::PhaseRegistry;
    use rigger::phases::standard_handlers;
    use rigger::recovery::select_provider;
    use rigger::rollback::{HostPlatform, RollbackManager};
    use rigger::state::StateStore;
    use rigger::ui::OrchestratorUI;

    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    config.ensure_directories()?;

    let registry = PhaseRegistry::standard();
    let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner);

    let platform = HostPlatform::new(
        runner.clone(),
        config.toml.platform.generation_cmd.clone(),
        config.toml.platform.switch_cmd.clone(),
        config.toml.platform.probe_cmd.clone(),
    );
    let rollback = RollbackManager::new(
        config.rollback_file.clone(),
        config.toml.platform.backup_root.clone().into(),
        Arc::new(platform),
    );
    let cluster = KubeClusterOps::new(
        runner.clone(),
        config.toml.commands.kubectl.clone(),
        config.toml.commands.build.clone(),
        config.toml.commands.publish.clone(),
    );
    let healer = SelfHealer::new(Arc::new(cluster), config.heal_verify_delay());
    let prompts = select_provider(cli.yes, &config.toml.recovery.default);
    let ui = OrchestratorUI::new(registry.phases().len() as u64);
    let store = StateStore::new(config.state_file.clone());
    let locks = LockManager::new(config.lock_file.clone(), config.lock_poll_interval());
    let ctx = RunContext::new(config, runner, dry_run);

    Ok(Orchestrator::new(
        registry,
        standard_handlers(),
        store,
        locks,
        rollback,
        healer,
        prompts,
        ctx,
        ui,
    ))
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    skip: Vec<u32>,
    start_from: Option<u32>,
    restart_phase: Option<u32>,
    dry_run: bool,
) -> Result<()> {
    let opts = rigger::executor::RunOptions {
        skip,
        start_from,
        restart_phase,
        test_phase: None,
        dry_run,
        assume_yes: cli.yes,
    };
    drive(cli, project_dir, opts).await
}

pub async fn cmd_test_phase(cli: &Cli, project_dir: &Path, id: u32) -> Result<()> {
    let opts = rigger::executor::RunOptions {
        test_phase: Some(id),
        assume_yes: cli.yes,
        ..Default::default()
    };
    drive(cli, project_dir, opts).await?;
    println!("Phase {id} passed in isolation (not marked complete)");
    Ok(())
}

/// Run the orchestrator with SIGINT handling: on interrupt the run future
/// is dropped, which releases the lock through its guard; the interruption
/// is recorded in the state file before exit. No automatic rollback.
async fn drive(cli: &Cli, project_dir: &Path, opts: rigger::executor::RunOptions) -> Result<()> {
    use rigger::config::Config;
    use rigger::state::StateStore;

    let orchestrator = build_orchestrator(cli, project_dir, opts.dry_run)?;

    tokio::select! {
        result = orchestrator.run(&opts) => {
            result?;
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
            StateStore::new(config.state_file).record_error("interrupted by operator", 130)?;
            anyhow::bail!("Interrupted. State preserved; lock released. Re-run to resume.");
        }
    }
}
