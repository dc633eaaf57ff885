//! Phase listing, inspection, status, and reset commands.

use anyhow::Result;
use std::path::Path;

use super::super::Cli;

pub fn cmd_list_phases() -> Result<()> {
    use rigger::phase::PhaseRegistry;

    let registry = PhaseRegistry::standard();

    println!();
    println!("{:<4} {:<16} {:<12} Description", "Id", "Name", "Depends on");
    println!("{:<4} {:<16} {:<12} -----------", "--", "----", "----------");
    for phase in registry.phases() {
        let deps = if phase.depends_on.is_empty() {
            "-".to_string()
        } else {
            phase
                .depends_on
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        let mut flags = Vec::new();
        if phase.safe_restart_point {
            flags.push("safe restart");
        }
        if phase.digest_sensitive {
            flags.push("digest-sensitive");
        }
        let suffix = if flags.is_empty() {
            String::new()
        } else {
            format!(" {}", console::style(format!("[{}]", flags.join(", "))).dim())
        };
        println!(
            "{:<4} {:<16} {:<12} {}{suffix}",
            phase.id, phase.name, deps, phase.description
        );
    }
    println!();
    println!("{} phases", registry.phases().len());
    println!();
    Ok(())
}

pub fn cmd_show_phase(cli: &Cli, project_dir: &Path, id: u32) -> Result<()> {
    use rigger::config::Config;
    use rigger::phase::PhaseRegistry;
    use rigger::state::StateStore;

    let registry = PhaseRegistry::standard();
    let Some(phase) = registry.get(id) else {
        anyhow::bail!("Unknown phase id {id}; see 'rigger list-phases'");
    };

    println!();
    println!("Phase {}: {}", phase.id, phase.name);
    println!("  {}", phase.description);
    if !phase.depends_on.is_empty() {
        println!(
            "  Depends on: {}",
            phase
                .depends_on
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    println!("  Safe restart point: {}", phase.safe_restart_point);
    println!("  Digest-sensitive:   {}", phase.digest_sensitive);

    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    let record = StateStore::new(config.state_file).load()?;
    match record.completed_steps.iter().find(|s| s.step == id) {
        Some(step) => println!("  Completed at: {}", step.completed_at),
        None => println!("  Completed at: never"),
    }
    if let Some(health) = record.last_health(id) {
        println!(
            "  Last health:  {} ({}) at {}",
            health.status, health.message, health.checked_at
        );
    }
    println!();
    Ok(())
}

pub fn cmd_status(cli: &Cli, project_dir: &Path) -> Result<()> {
    use console::style;
    use rigger::config::Config;
    use rigger::health::HealthStatus;
    use rigger::phase::PhaseRegistry;
    use rigger::state::StateStore;

    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    let registry = PhaseRegistry::standard();
    let record = StateStore::new(config.state_file).load()?;

    println!();
    println!("Rigger Status");
    println!("=============");
    match record.started_at {
        Some(at) => println!("Started: {at}"),
        None => {
            println!("No run recorded yet.");
            println!();
            return Ok(());
        }
    }
    println!();

    for phase in registry.phases() {
        let marker = if record.is_complete(phase.id) {
            style("done").green()
        } else {
            style("pending").yellow()
        };
        let health = match record.last_health(phase.id) {
            Some(entry) => {
                let colored = match entry.status {
                    HealthStatus::Pass => style(entry.status.to_string()).green(),
                    HealthStatus::Warn => style(entry.status.to_string()).yellow(),
                    HealthStatus::Fail => style(entry.status.to_string()).red(),
                    HealthStatus::Skipped => style(entry.status.to_string()).dim(),
                };
                format!("health: {colored}")
            }
            None => "health: -".to_string(),
        };
        println!("  [{}] {:<16} {:<8} {health}", phase.id, phase.name, marker);
    }

    if let Some(err) = &record.last_error {
        println!();
        println!(
            "Last error (exit {}): {err}",
            record.last_exit_code.unwrap_or(1)
        );
    }
    println!();
    Ok(())
}

pub fn cmd_reset(cli: &Cli, project_dir: &Path, force: bool) -> Result<()> {
    use dialoguer::Confirm;
    use rigger::config::Config;
    use rigger::state::StateStore;

    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt("This will archive all recorded progress. Are you sure?")
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    let store = StateStore::new(config.state_file);
    match store.reset()? {
        Some(archive) => println!("State archived to {}", archive.display()),
        None => println!("No state file to reset"),
    }
    Ok(())
}
