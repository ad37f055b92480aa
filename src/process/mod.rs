//! Bounded interactions with child processes.
//!
//! Every wait in this module takes an explicit timeout; callers escalate instead of waiting again.

pub mod bounded;
pub mod sudo;
pub mod terminate;

pub use bounded::{CommandOutput, join_bounded, run_bounded, wait_with_timeout};
pub use sudo::wrap_with_sudo;
pub use terminate::{ExitInfo, TerminationMethod, TerminationReport, terminate_child, terminate_pid};
