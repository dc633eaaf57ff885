//! Terminal presentation for orchestrator runs.
//!
//! One overall progress bar tracks the pipeline; each phase gets a spinner
//! that resolves to a check, cross, or skip marker. Engine diagnostics go
//! through `tracing`; this layer is operator-facing output only. Hidden mode
//! is used by tests and non-interactive runs.

use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::Mutex;
use std::time::Duration;

use crate::phase::Phase;

pub struct OrchestratorUI {
    multi: MultiProgress,
    overall: ProgressBar,
    current: Mutex<Option<ProgressBar>>,
}

impl OrchestratorUI {
    pub fn new(total_phases: u64) -> Self {
        Self::with_target(total_phases, ProgressDrawTarget::stderr())
    }

    /// No terminal output. Progress state is still tracked so callers
    /// behave identically.
    pub fn hidden(total_phases: u64) -> Self {
        Self::with_target(total_phases, ProgressDrawTarget::hidden())
    }

    fn with_target(total_phases: u64, target: ProgressDrawTarget) -> Self {
        let multi = MultiProgress::with_draw_target(target);
        let overall = multi.add(ProgressBar::new(total_phases));
        overall.set_style(
            ProgressStyle::with_template("{bar:30.cyan/blue} {pos}/{len} phases")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { multi, overall, current: Mutex::new(None) }
    }

    pub fn banner(&self, text: &str) {
        let _ = self.multi.println(format!("{}", style(text).bold()));
    }

    pub fn note(&self, text: &str) {
        let _ = self.multi.println(text.to_string());
    }

    pub fn phase_start(&self, phase: &Phase) {
        let spinner = self.multi.add(ProgressBar::new_spinner());
        spinner.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_message(format!("[{}] {}", phase.id, phase.description));
        spinner.enable_steady_tick(Duration::from_millis(100));
        if let Ok(mut current) = self.current.lock() {
            *current = Some(spinner);
        }
    }

    fn finish_current(&self, line: String) {
        let spinner = self.current.lock().ok().and_then(|mut c| c.take());
        match spinner {
            Some(spinner) => spinner.finish_with_message(line),
            None => self.note(&line),
        }
    }

    pub fn phase_done(&self, phase: &Phase, detail: Option<&str>) {
        let suffix = detail.map(|d| format!(" ({d})")).unwrap_or_default();
        self.finish_current(format!(
            "{} [{}] {}{suffix}",
            style("✓").green(),
            phase.id,
            phase.name
        ));
        self.overall.inc(1);
    }

    pub fn phase_failed(&self, phase: &Phase, message: &str) {
        self.finish_current(format!(
            "{} [{}] {}: {message}",
            style("✗").red(),
            phase.id,
            phase.name
        ));
    }

    pub fn phase_skipped(&self, phase: &Phase, reason: &str) {
        self.finish_current(format!(
            "{} [{}] {} ({reason})",
            style("→").yellow(),
            phase.id,
            phase.name
        ));
        self.overall.inc(1);
    }

    pub fn finish(&self, success: bool) {
        if success {
            self.overall.finish_with_message("done");
        } else {
            self.overall.abandon();
        }
    }
}
