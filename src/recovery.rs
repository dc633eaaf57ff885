//! Interactive failure recovery.
//!
//! When a phase execution or its health check fails, the scheduler asks the
//! failure handler what to do next: retry (after the phase's remediation
//! hook), skip, roll back, or abort. The choice comes through an injectable
//! `PromptProvider` so automated runs and tests supply scripted answers
//! instead of a real terminal.

use anyhow::Result;
use console::style;
use dialoguer::{theme::ColorfulTheme, Select};
use std::io::IsTerminal;

use crate::phase::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryChoice {
    /// Re-run the phase, invoking its remediation hook first
    Retry,
    /// Record the failure and move on without marking complete
    Skip,
    /// Restore the rollback point, then terminate
    Rollback,
    /// Terminate without rollback
    Abort,
}

impl RecoveryChoice {
    /// Parse a `rigger.toml` recovery default. Unknown values fall back to
    /// abort, the safe direction.
    pub fn from_config(value: &str) -> Self {
        match value {
            "retry" => Self::Retry,
            "skip" => Self::Skip,
            "rollback" => Self::Rollback,
            _ => Self::Abort,
        }
    }
}

/// Source of recovery decisions.
pub trait PromptProvider: Send + Sync {
    fn choose(&self, phase: &Phase, failure: &str) -> Result<RecoveryChoice>;
}

/// Real-terminal prompt via dialoguer.
pub struct TerminalPrompt;

impl PromptProvider for TerminalPrompt {
    fn choose(&self, phase: &Phase, failure: &str) -> Result<RecoveryChoice> {
        println!(
            "  {} phase {} ({}): {}",
            style("Failed:").red().bold(),
            phase.id,
            phase.name,
            failure
        );

        let options = &[
            "Retry the phase (run its remediation hook first)",
            "Skip this phase (accept the risk, do not mark complete)",
            "Roll back to the captured rollback point and stop",
            "Abort the run",
        ];

        let selection = Select::with_theme(&ColorfulTheme::default())
            .with_prompt("How do you want to proceed?")
            .items(options)
            .default(0)
            .interact()?;

        Ok(match selection {
            0 => RecoveryChoice::Retry,
            1 => RecoveryChoice::Skip,
            2 => RecoveryChoice::Rollback,
            3 => RecoveryChoice::Abort,
            _ => unreachable!(),
        })
    }
}

/// Fixed answer for non-interactive runs (dry runs, CI, `--yes`).
pub struct AutoPrompt {
    choice: RecoveryChoice,
}

impl AutoPrompt {
    pub fn new(choice: RecoveryChoice) -> Self {
        Self { choice }
    }
}

impl PromptProvider for AutoPrompt {
    fn choose(&self, _phase: &Phase, _failure: &str) -> Result<RecoveryChoice> {
        Ok(self.choice)
    }
}

/// Scripted answers consumed in order; used by tests. Exhausting the script
/// aborts, mirroring the non-interactive default.
pub struct ScriptedPrompt {
    answers: std::sync::Mutex<std::collections::VecDeque<RecoveryChoice>>,
}

impl ScriptedPrompt {
    pub fn new(answers: impl IntoIterator<Item = RecoveryChoice>) -> Self {
        Self { answers: std::sync::Mutex::new(answers.into_iter().collect()) }
    }
}

impl PromptProvider for ScriptedPrompt {
    fn choose(&self, _phase: &Phase, _failure: &str) -> Result<RecoveryChoice> {
        let mut answers = self.answers.lock().unwrap_or_else(|p| p.into_inner());
        Ok(answers.pop_front().unwrap_or(RecoveryChoice::Abort))
    }
}

/// Pick the prompt provider for a run: a terminal prompt when an operator
/// is attached, otherwise the configured non-interactive default.
pub fn select_provider(assume_yes: bool, configured_default: &str) -> Box<dyn PromptProvider> {
    if assume_yes || !std::io::stdin().is_terminal() {
        Box::new(AutoPrompt::new(RecoveryChoice::from_config(configured_default)))
    } else {
        Box::new(TerminalPrompt)
    }
}
