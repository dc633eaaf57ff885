//! Typed error hierarchy for the rigger orchestrator.
//!
//! `OrchestratorError` covers every terminal failure class of a run and maps
//! each one to a distinct process exit code, so automation wrapping the CLI
//! can tell a dependency violation from lock contention or a failed rollback.

use thiserror::Error;

/// Terminal failures of an orchestrator run.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Phase {phase} depends on phase {dependency}, which has not completed")]
    DependencyUnsatisfied { phase: u32, dependency: u32 },

    #[error("Another rigger instance (pid {holder_pid}) held the lock past the {timeout_secs}s timeout")]
    LockContention { holder_pid: u32, timeout_secs: u64 },

    #[error("Phase {phase} ({name}) failed: {message}")]
    PhaseFailed {
        phase: u32,
        name: String,
        message: String,
    },

    #[error("Health check for phase {phase} failed: {message}")]
    HealthCheckFailed { phase: u32, message: String },

    #[error("Recorded state disagrees with observed inputs: {0}")]
    StateDrift(String),

    #[error("Rollback failed: {message} (originally triggered by: {original})")]
    RollbackFailed { message: String, original: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Exit code for this failure class.
    ///
    /// `0` is success and never produced here; `1` is reserved for
    /// uncategorized errors.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::DependencyUnsatisfied { .. } => 2,
            Self::LockContention { .. } => 3,
            Self::PhaseFailed { .. } | Self::HealthCheckFailed { .. } => 4,
            Self::StateDrift(_) => 5,
            Self::RollbackFailed { .. } => 6,
            Self::Other(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependency_unsatisfied_carries_both_ids() {
        let err = OrchestratorError::DependencyUnsatisfied {
            phase: 7,
            dependency: 6,
        };
        let msg = err.to_string();
        assert!(msg.contains('7'), "expected phase id in message: {msg}");
        assert!(msg.contains('6'), "expected dependency id in message: {msg}");
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn lock_contention_names_the_holder() {
        let err = OrchestratorError::LockContention {
            holder_pid: 4242,
            timeout_secs: 60,
        };
        assert!(err.to_string().contains("4242"));
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn phase_and_health_failures_share_an_exit_code() {
        let phase = OrchestratorError::PhaseFailed {
            phase: 3,
            name: "config-render".into(),
            message: "template missing".into(),
        };
        let health = OrchestratorError::HealthCheckFailed {
            phase: 3,
            message: "rendered dir empty".into(),
        };
        assert_eq!(phase.exit_code(), health.exit_code());
        assert_eq!(phase.exit_code(), 4);
    }

    #[test]
    fn rollback_failure_reports_the_original_trigger() {
        let err = OrchestratorError::RollbackFailed {
            message: "switch to generation 41 failed".into(),
            original: "phase 6 health check failed".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("generation 41"));
        assert!(msg.contains("phase 6"));
        assert_eq!(err.exit_code(), 6);
    }

    #[test]
    fn anyhow_errors_convert_and_fall_back_to_exit_one() {
        let err: OrchestratorError = anyhow::anyhow!("disk full").into();
        assert_eq!(err.exit_code(), 1);
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn all_variants_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&OrchestratorError::StateDrift("digest mismatch".into()));
    }
}
