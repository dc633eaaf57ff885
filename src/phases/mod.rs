//! Phase handlers: the boundary to domain-specific work.
//!
//! The engine treats phases as opaque units behind `PhaseHandler`. Handlers
//! do their side effects through the `CommandRunner` on the context, return
//! success or failure with an optional message, and may register a health
//! check, a remediation hook for retries, and an output probe used for
//! best-effort dependency backfill.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::RunContext;
use crate::health::HealthCheckResult;

mod cluster;
mod deploy;
mod system;

pub use cluster::{ClusterBootstrapPhase, VerifyPhase, WorkloadsPhase};
pub use deploy::{ConfigRenderPhase, SecretsPhase, ServicesPhase};
pub use system::{BasePackagesPhase, HardwareDetectPhase, PreflightPhase};

/// Result of one phase execution.
#[derive(Debug, Clone, PartialEq)]
pub enum PhaseOutcome {
    Success { message: Option<String> },
    Failed { message: String },
}

impl PhaseOutcome {
    pub fn success() -> Self {
        Self::Success { message: None }
    }

    pub fn success_with(message: impl Into<String>) -> Self {
        Self::Success { message: Some(message.into()) }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed { message: message.into() }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

/// Contract every phase implements.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    /// Perform the phase's side effects.
    async fn execute(&self, ctx: &RunContext) -> Result<PhaseOutcome>;

    /// Post-condition probe. The default means "no check registered";
    /// the health runner records it as `skipped`, which gates like a pass.
    async fn health_check(&self, _ctx: &RunContext) -> Result<HealthCheckResult> {
        Ok(HealthCheckResult::skipped())
    }

    /// Remediation hook, invoked before a retry (e.g. regenerate inputs).
    async fn remediate(&self, _ctx: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Whether observable outputs of this phase already exist. Used for
    /// best-effort dependency backfill when no completion marker was
    /// written; never treated as authoritative state.
    async fn probe_outputs(&self, _ctx: &RunContext) -> Result<bool> {
        Ok(false)
    }

    /// Whether a health-check failure of this phase should trigger the
    /// self-healing loop before escalating to the failure handler.
    fn heals_on_failure(&self) -> bool {
        false
    }
}

/// Handler bindings for the standard pipeline, keyed by phase id.
/// Must stay in step with `PhaseRegistry::standard()`.
pub fn standard_handlers() -> HashMap<u32, Arc<dyn PhaseHandler>> {
    let mut handlers: HashMap<u32, Arc<dyn PhaseHandler>> = HashMap::new();
    handlers.insert(1, Arc::new(PreflightPhase));
    handlers.insert(2, Arc::new(BasePackagesPhase));
    handlers.insert(3, Arc::new(ConfigRenderPhase));
    handlers.insert(4, Arc::new(SecretsPhase));
    handlers.insert(5, Arc::new(HardwareDetectPhase));
    handlers.insert(6, Arc::new(ServicesPhase));
    handlers.insert(7, Arc::new(ClusterBootstrapPhase));
    handlers.insert(8, Arc::new(WorkloadsPhase));
    handlers.insert(9, Arc::new(VerifyPhase));
    handlers
}
