//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                                  |
//! |-------------|---------------------------------------------------|
//! | `run`       | `Run`, `TestPhase`                                |
//! | `phase`     | `ListPhases`, `ShowPhase`, `Status`, `Reset`      |
//! | `state`     | `ValidateState`, `RepairState`                    |
//! | `rollback`  | `Rollback`, `TestRollback`                        |

pub mod phase;
pub mod rollback;
pub mod run;
pub mod state;

pub use phase::{cmd_list_phases, cmd_reset, cmd_show_phase, cmd_status};
pub use rollback::{cmd_rollback, cmd_test_rollback};
pub use run::{cmd_run, cmd_test_phase};
pub use state::{cmd_repair_state, cmd_validate_state};
