use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use rigger::errors::OrchestratorError;

mod cmd;

#[derive(Parser)]
#[command(name = "rigger")]
#[command(version, about = "Resumable, dependency-gated deployment orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Assume yes / non-interactive: failures fall back to the configured
    /// default recovery choice
    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the pipeline, resuming from the first incomplete phase
    Run {
        /// Phase id to skip; repeatable
        #[arg(long = "skip-phase")]
        skip_phase: Vec<u32>,

        /// Start from this phase instead of resuming
        #[arg(long)]
        start_from: Option<u32>,

        /// Re-execute this phase even if it is marked complete
        #[arg(long)]
        restart_phase: Option<u32>,

        /// Log intended actions without side effects
        #[arg(long)]
        dry_run: bool,
    },
    /// Execute one phase in isolation, without marking it complete
    TestPhase { id: u32 },
    /// List all pipeline phases
    ListPhases,
    /// Show one phase's dependencies and recorded history
    ShowPhase { id: u32 },
    /// Summarize completed phases and last health outcomes
    Status,
    /// Archive the state file and start fresh
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// Check recorded state against the current inputs; exits non-zero on drift
    ValidateState,
    /// Truncate completion markers invalidated by changed inputs
    RepairState,
    /// Restore the previously captured generation
    Rollback,
    /// Round-trip rollback self-test: roll back, probe, restore, probe
    TestRollback,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = dispatch(&cli).await {
        eprintln!("Error: {err:#}");
        let code = err
            .downcast_ref::<OrchestratorError>()
            .map(OrchestratorError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn dispatch(cli: &Cli) -> Result<()> {
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run { skip_phase, start_from, restart_phase, dry_run } => {
            cmd::cmd_run(
                cli,
                &project_dir,
                skip_phase.clone(),
                *start_from,
                *restart_phase,
                *dry_run,
            )
            .await?;
        }
        Commands::TestPhase { id } => cmd::cmd_test_phase(cli, &project_dir, *id).await?,
        Commands::ListPhases => cmd::cmd_list_phases()?,
        Commands::ShowPhase { id } => cmd::cmd_show_phase(cli, &project_dir, *id)?,
        Commands::Status => cmd::cmd_status(cli, &project_dir)?,
        Commands::Reset { force } => cmd::cmd_reset(cli, &project_dir, *force)?,
        Commands::ValidateState => cmd::cmd_validate_state(cli, &project_dir)?,
        Commands::RepairState => cmd::cmd_repair_state(cli, &project_dir)?,
        Commands::Rollback => cmd::cmd_rollback(cli, &project_dir).await?,
        Commands::TestRollback => cmd::cmd_test_rollback(cli, &project_dir).await?,
    }
    Ok(())
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "rigger=debug" } else { "rigger=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
