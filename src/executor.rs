//! Scheduler and executor: the engine that drives phases through the
//! pipeline.
//!
//! A run acquires the instance lock, reconciles recorded state against the
//! current input digest, captures a rollback point, then walks the registry
//! in ascending id order: skip-set and completion filtering, dependency
//! gating with best-effort backfill, execution, health check, self-healing
//! interception for the workloads failure class, and the interactive
//! failure handler. Completion markers are written only after a successful
//! execution and a non-fail health check.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::RunContext;
use crate::errors::OrchestratorError;
use crate::heal::SelfHealer;
use crate::health::HealthRunner;
use crate::lock::LockManager;
use crate::phase::{Phase, PhaseRegistry};
use crate::phases::{PhaseHandler, PhaseOutcome};
use crate::recovery::{PromptProvider, RecoveryChoice};
use crate::rollback::RollbackManager;
use crate::state::{check_drift, compute_digest, StateRecord, StateStore};
use crate::ui::OrchestratorUI;

/// Operator-selected scheduling options for one run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Phases to skip outright (logged, never executed)
    pub skip: Vec<u32>,
    /// Start here instead of the first incomplete phase
    pub start_from: Option<u32>,
    /// Re-execute this phase even though it is marked complete
    pub restart_phase: Option<u32>,
    /// Run a single phase in isolation and stop
    pub test_phase: Option<u32>,
    pub dry_run: bool,
    pub assume_yes: bool,
}

/// How a phase attempt failed; decides the terminal error variant.
enum Failure {
    Execution(String),
    Health(String),
}

impl Failure {
    fn message(&self) -> &str {
        match self {
            Failure::Execution(m) | Failure::Health(m) => m,
        }
    }

    fn into_error(self, phase: &Phase) -> OrchestratorError {
        match self {
            Failure::Execution(message) => OrchestratorError::PhaseFailed {
                phase: phase.id,
                name: phase.name.clone(),
                message,
            },
            Failure::Health(message) => {
                OrchestratorError::HealthCheckFailed { phase: phase.id, message }
            }
        }
    }
}

pub struct Orchestrator {
    registry: PhaseRegistry,
    handlers: HashMap<u32, Arc<dyn PhaseHandler>>,
    store: StateStore,
    locks: LockManager,
    rollback: RollbackManager,
    healer: SelfHealer,
    prompts: Box<dyn PromptProvider>,
    ctx: RunContext,
    ui: OrchestratorUI,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: PhaseRegistry,
        handlers: HashMap<u32, Arc<dyn PhaseHandler>>,
        store: StateStore,
        locks: LockManager,
        rollback: RollbackManager,
        healer: SelfHealer,
        prompts: Box<dyn PromptProvider>,
        ctx: RunContext,
        ui: OrchestratorUI,
    ) -> Self {
        Self { registry, handlers, store, locks, rollback, healer, prompts, ctx, ui }
    }

    fn handler(&self, id: u32) -> Result<&Arc<dyn PhaseHandler>> {
        self.handlers
            .get(&id)
            .ok_or_else(|| anyhow!("no handler registered for phase {id}"))
    }

    fn known_phase(&self, id: u32) -> Result<&Phase> {
        self.registry
            .get(id)
            .ok_or_else(|| anyhow!("unknown phase id {id}"))
    }

    /// Drive a full run. Holds the instance lock for the duration; the
    /// guard releases it on every exit path, including panics and signals
    /// that unwind.
    pub async fn run(&self, opts: &RunOptions) -> Result<(), OrchestratorError> {
        self.registry.validate()?;
        self.validate_options(opts)?;

        let _guard = self.locks.acquire(self.ctx.config.lock_timeout()).await?;

        if !opts.dry_run {
            self.store.ensure_started()?;
        }
        self.reconcile_digest(opts)?;

        if let Some(id) = opts.test_phase {
            return self.run_single(id, opts).await;
        }

        let record = self.store.load()?;
        let Some(start) = self.starting_phase(&record, opts) else {
            info!("all phases complete; nothing to do");
            self.ui.note("Nothing to do: every phase is already complete.");
            return Ok(());
        };

        if !opts.dry_run {
            self.rollback
                .capture(&format!("pre-run from phase {start}"))
                .await?;
        }

        let result = self.run_from(start, opts).await;

        if let Err(err) = &result {
            self.store.record_error(&err.to_string(), err.exit_code())?;
        }
        self.ui.finish(result.is_ok());
        result
    }

    fn validate_options(&self, opts: &RunOptions) -> Result<()> {
        for id in opts
            .skip
            .iter()
            .chain(&opts.start_from)
            .chain(&opts.restart_phase)
            .chain(&opts.test_phase)
        {
            self.known_phase(*id)?;
        }
        if let Some(id) = opts.start_from {
            if !self.registry.is_safe_restart_point(id) {
                warn!(phase = id, "starting from a phase that is not a safe restart point");
            }
        }
        Ok(())
    }

    /// Compare the recorded input digest against the current one and
    /// invalidate completion markers from the first digest-sensitive phase
    /// when they disagree. Dry-run only reports.
    fn reconcile_digest(&self, opts: &RunOptions) -> Result<()> {
        let current = compute_digest(&self.ctx.config.inputs_dir)?;
        let record = self.store.load()?;

        if let Some(from) = check_drift(&record, &self.registry, &current) {
            if opts.dry_run {
                info!(invalidate_from = from, "inputs changed; a real run would re-execute from here");
                self.ui
                    .note(&format!("Inputs changed: phases {from}+ would be re-executed."));
                return Ok(());
            }
            let removed = self.store.remove_steps_from(from)?;
            warn!(
                invalidate_from = from,
                removed = ?removed,
                "inputs changed since last run; re-executing digest-sensitive phases"
            );
            self.store.set_digest(&current)?;
        } else if record.content_digest.is_none() && !opts.dry_run {
            self.store.set_digest(&current)?;
        }
        Ok(())
    }

    /// First phase the loop should visit, or `None` when there is nothing
    /// left to run.
    fn starting_phase(&self, record: &StateRecord, opts: &RunOptions) -> Option<u32> {
        let resume = opts
            .start_from
            .or_else(|| record.first_incomplete(&self.registry));
        match (resume, opts.restart_phase) {
            (Some(start), Some(restart)) => Some(start.min(restart)),
            (Some(start), None) => Some(start),
            (None, restart) => restart,
        }
    }

    async fn run_from(&self, start: u32, opts: &RunOptions) -> Result<(), OrchestratorError> {
        for phase in self.registry.phases().iter().filter(|p| p.id >= start) {
            if opts.skip.contains(&phase.id) {
                info!(phase = phase.id, "phase in the skip set");
                self.ui.phase_skipped(phase, "skipped by request");
                continue;
            }

            let record = self.store.load()?;
            let restart_requested = opts.restart_phase == Some(phase.id);
            if record.is_complete(phase.id) && !restart_requested {
                debug!(phase = phase.id, "already complete");
                self.ui.phase_skipped(phase, "already complete");
                continue;
            }

            self.check_dependencies(phase, &record, opts).await?;

            if opts.dry_run {
                info!(phase = phase.id, name = %phase.name, "dry-run: would execute");
                self.ui.phase_skipped(phase, "dry-run");
                continue;
            }

            self.execute_with_recovery(phase, opts).await?;
        }
        Ok(())
    }

    /// Dependency gate with best-effort backfill: a dependency without a
    /// completion marker still satisfies the gate when its handler can
    /// observe the outputs in place. Backfill is logged and never promoted
    /// to a completion marker.
    async fn check_dependencies(
        &self,
        phase: &Phase,
        record: &StateRecord,
        opts: &RunOptions,
    ) -> Result<(), OrchestratorError> {
        for dep in &phase.depends_on {
            if record.is_complete(*dep) {
                continue;
            }
            let backfilled = match self.handler(*dep)?.probe_outputs(&self.ctx).await {
                Ok(found) => found,
                Err(err) => {
                    warn!(phase = *dep, error = %err, "output probe failed; treating as absent");
                    false
                }
            };
            if backfilled {
                warn!(
                    phase = phase.id,
                    dependency = *dep,
                    "dependency has no completion marker but its outputs exist; \
                     continuing on best-effort backfill"
                );
                continue;
            }
            if opts.dry_run {
                warn!(
                    phase = phase.id,
                    dependency = *dep,
                    "dry-run: dependency unsatisfied, a real run would abort here"
                );
                continue;
            }
            return Err(OrchestratorError::DependencyUnsatisfied {
                phase: phase.id,
                dependency: *dep,
            });
        }
        Ok(())
    }

    /// Failure-handler loop around one phase: retry with remediation, skip
    /// without completion marker, rollback then terminate, or abort.
    async fn execute_with_recovery(
        &self,
        phase: &Phase,
        _opts: &RunOptions,
    ) -> Result<(), OrchestratorError> {
        loop {
            let failure = match self.attempt(phase).await? {
                None => {
                    self.store.mark_complete(phase.id)?;
                    self.ui.phase_done(phase, None);
                    return Ok(());
                }
                Some(failure) => failure,
            };
            self.ui.phase_failed(phase, failure.message());

            match self.prompts.choose(phase, failure.message())? {
                RecoveryChoice::Retry => {
                    info!(phase = phase.id, "retrying after remediation");
                    self.handler(phase.id)?.remediate(&self.ctx).await?;
                }
                RecoveryChoice::Skip => {
                    warn!(
                        phase = phase.id,
                        "continuing past failed phase without a completion marker"
                    );
                    self.ui.phase_skipped(phase, "failure accepted by operator");
                    return Ok(());
                }
                RecoveryChoice::Rollback => {
                    let original = failure.message().to_string();
                    return match self.rollback.rollback().await {
                        Ok(point) => {
                            info!(generation = %point.prior_generation_id, "rolled back");
                            Err(failure.into_error(phase))
                        }
                        Err(err) => Err(OrchestratorError::RollbackFailed {
                            message: format!("{err:#}"),
                            original,
                        }),
                    };
                }
                RecoveryChoice::Abort => {
                    return Err(failure.into_error(phase));
                }
            }
        }
    }

    /// One execution attempt: run the handler, then its health check, with
    /// self-healing interception for phases in the healing failure class.
    /// `None` means the phase may be marked complete.
    async fn attempt(&self, phase: &Phase) -> Result<Option<Failure>, OrchestratorError> {
        let handler = self.handler(phase.id)?;
        self.ui.phase_start(phase);
        info!(phase = phase.id, name = %phase.name, "executing");

        let outcome = match handler.execute(&self.ctx).await {
            Ok(outcome) => outcome,
            Err(err) => PhaseOutcome::failed(format!("{err:#}")),
        };
        if let PhaseOutcome::Failed { message } = outcome {
            return Ok(Some(Failure::Execution(message)));
        }

        let mut health = HealthRunner::run(phase, handler.as_ref(), &self.ctx, &self.store).await?;

        if health.status.blocks_progress() && handler.heals_on_failure() {
            info!(phase = phase.id, "health check failed; attempting self-heal");
            match self.healer.heal().await {
                Ok(report) if report.converged() => {
                    health =
                        HealthRunner::run(phase, handler.as_ref(), &self.ctx, &self.store).await?;
                }
                Ok(report) => {
                    warn!(
                        phase = phase.id,
                        unrecovered = ?report.unrecovered,
                        "self-heal did not converge; escalating"
                    );
                }
                Err(err) => {
                    warn!(phase = phase.id, error = %err, "self-heal errored; escalating");
                }
            }
        }

        if health.status.blocks_progress() {
            return Ok(Some(Failure::Health(health.message)));
        }
        Ok(None)
    }

    /// Isolated single-phase run: dependencies validated, phase executed
    /// alone, no completion marker written, no rollback point captured.
    async fn run_single(&self, id: u32, opts: &RunOptions) -> Result<(), OrchestratorError> {
        let phase = self.known_phase(id)?.clone();
        let record = self.store.load()?;
        self.check_dependencies(&phase, &record, opts).await?;

        if opts.dry_run {
            info!(phase = id, "dry-run: would execute in isolation");
            self.ui.phase_skipped(&phase, "dry-run");
            return Ok(());
        }

        match self.attempt(&phase).await? {
            None => {
                self.ui.phase_done(&phase, Some("isolated test, not marked complete"));
                Ok(())
            }
            Some(failure) => {
                self.ui.phase_failed(&phase, failure.message());
                Err(failure.into_error(&phase))
            }
        }
    }
}
