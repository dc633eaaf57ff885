//! State validation and repair — drift between the recorded digest and the
//! current inputs.

use anyhow::Result;
use std::path::Path;

use super::super::Cli;

/// Strict check: exits non-zero when the recorded completion markers no
/// longer match the observed inputs. Never mutates state.
pub fn cmd_validate_state(cli: &Cli, project_dir: &Path) -> Result<()> {
    use rigger::config::Config;
    use rigger::errors::OrchestratorError;
    use rigger::phase::PhaseRegistry;
    use rigger::state::{check_drift, compute_digest, StateStore};

    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    let registry = PhaseRegistry::standard();
    registry.validate()?;

    let record = StateStore::new(config.state_file).load()?;
    let current = compute_digest(&config.inputs_dir)?;

    if let Some(from) = check_drift(&record, &registry, &current) {
        let stale: Vec<u32> = record
            .completed_steps
            .iter()
            .map(|s| s.step)
            .filter(|s| *s >= from)
            .collect();
        return Err(OrchestratorError::StateDrift(format!(
            "inputs changed since the recorded digest; completion markers for \
             phases {stale:?} are stale (run 'rigger repair-state' or 'rigger run')"
        ))
        .into());
    }

    if record.content_digest.is_none() {
        println!("State has no recorded digest yet (no completed run); nothing to validate.");
    } else {
        println!("State is consistent with the current inputs.");
    }
    Ok(())
}

/// Explicit repair: drops completion markers from the first digest-sensitive
/// phase onward and restamps the digest.
pub fn cmd_repair_state(cli: &Cli, project_dir: &Path) -> Result<()> {
    use rigger::config::Config;
    use rigger::phase::PhaseRegistry;
    use rigger::state::{check_drift, compute_digest, StateStore};

    let config = Config::new(project_dir.to_path_buf(), cli.verbose)?;
    let registry = PhaseRegistry::standard();
    let store = StateStore::new(config.state_file);
    let current = compute_digest(&config.inputs_dir)?;

    let record = store.load()?;
    let Some(from) = check_drift(&record, &registry, &current) else {
        println!("State is consistent with the current inputs; nothing to repair.");
        return Ok(());
    };

    let removed = store.remove_steps_from(from)?;
    store.set_digest(&current)?;
    println!(
        "Removed completion markers for phases {removed:?}; next run re-executes from phase {from}."
    );
    Ok(())
}
