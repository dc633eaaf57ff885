//! Post-phase health checks.
//!
//! A health check is a post-condition probe run after a phase to confirm its
//! effects actually took hold. Checks are registered on the phase handler;
//! a phase without one is treated as passing (recorded as `skipped`).

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::context::RunContext;
use crate::phase::Phase;
use crate::phases::PhaseHandler;
use crate::state::StateStore;

/// Outcome class of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

impl HealthStatus {
    /// `fail` blocks forward progress; everything else permits continuation.
    pub fn blocks_progress(&self) -> bool {
        matches!(self, HealthStatus::Fail)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Pass => "pass",
            HealthStatus::Warn => "warn",
            HealthStatus::Fail => "fail",
            HealthStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: String,
}

impl HealthCheckResult {
    pub fn pass(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Pass, message: message.into() }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Warn, message: message.into() }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self { status: HealthStatus::Fail, message: message.into() }
    }

    pub fn skipped() -> Self {
        Self { status: HealthStatus::Skipped, message: "no health check registered".into() }
    }
}

/// Runs a phase's health check and records the outcome.
pub struct HealthRunner;

impl HealthRunner {
    /// Run the handler's health check for `phase`.
    ///
    /// A check that returns an error is converted to `fail` with the error
    /// message; check-internal failures never propagate. The result is
    /// recorded into the state store before it is returned, so a crash
    /// immediately afterward still leaves the attempt on record.
    pub async fn run(
        phase: &Phase,
        handler: &dyn PhaseHandler,
        ctx: &RunContext,
        store: &StateStore,
    ) -> Result<HealthCheckResult> {
        let result = match handler.health_check(ctx).await {
            Ok(result) => result,
            Err(err) => {
                warn!(phase = phase.id, error = %err, "health check errored; recording as fail");
                HealthCheckResult::fail(format!("health check errored: {err:#}"))
            }
        };
        store.record_health_check(phase.id, result.status, &result.message)?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::stub_context;
    use crate::phases::PhaseOutcome;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct FixedCheck(Option<Result<HealthCheckResult>>);

    #[async_trait]
    impl PhaseHandler for FixedCheck {
        async fn execute(&self, _ctx: &RunContext) -> Result<PhaseOutcome> {
            Ok(PhaseOutcome::success())
        }

        async fn health_check(&self, _ctx: &RunContext) -> Result<HealthCheckResult> {
            match &self.0 {
                None => Ok(HealthCheckResult::skipped()),
                Some(Ok(result)) => Ok(result.clone()),
                Some(Err(_)) => Err(anyhow::anyhow!("probe exploded")),
            }
        }
    }

    fn phase() -> Phase {
        Phase::new(3, "config-render", "Render configuration templates", vec![1])
    }

    #[tokio::test]
    async fn missing_check_records_skipped() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let ctx = stub_context(dir.path());

        let result = HealthRunner::run(&phase(), &FixedCheck(None), &ctx, &store)
            .await
            .unwrap();
        assert_eq!(result.status, HealthStatus::Skipped);

        let record = store.load().unwrap();
        assert_eq!(record.health_checks.len(), 1);
        assert_eq!(record.health_checks[0].status, HealthStatus::Skipped);
    }

    #[tokio::test]
    async fn check_error_is_converted_to_fail_and_recorded() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let ctx = stub_context(dir.path());

        let handler = FixedCheck(Some(Err(anyhow::anyhow!("probe exploded"))));
        let result = HealthRunner::run(&phase(), &handler, &ctx, &store).await.unwrap();

        assert_eq!(result.status, HealthStatus::Fail);
        assert!(result.message.contains("probe exploded"));

        let record = store.load().unwrap();
        assert_eq!(record.health_checks[0].status, HealthStatus::Fail);
        assert!(record.health_checks[0].message.contains("probe exploded"));
    }

    #[tokio::test]
    async fn warn_is_recorded_but_does_not_block() {
        let dir = tempdir().unwrap();
        let store = StateStore::new(dir.path().join("state.json"));
        let ctx = stub_context(dir.path());

        let handler = FixedCheck(Some(Ok(HealthCheckResult::warn("3 of 4 services up"))));
        let result = HealthRunner::run(&phase(), &handler, &ctx, &store).await.unwrap();

        assert_eq!(result.status, HealthStatus::Warn);
        assert!(!result.status.blocks_progress());
        assert_eq!(store.load().unwrap().health_checks.len(), 1);
    }

    #[test]
    fn only_fail_blocks_progress() {
        assert!(HealthStatus::Fail.blocks_progress());
        assert!(!HealthStatus::Pass.blocks_progress());
        assert!(!HealthStatus::Warn.blocks_progress());
        assert!(!HealthStatus::Skipped.blocks_progress());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&HealthStatus::Fail).unwrap(), "\"fail\"");
        assert_eq!(serde_json::to_string(&HealthStatus::Skipped).unwrap(), "\"skipped\"");
    }
}
