//! Process supervision and hang diagnosis for CI workloads.
//!
//! [`Supervisor`] runs a workload under a staged-timeout [`monitor`], records what it did in an
//! [`tracer::ExecutionTracer`] trace, classifies failures and hangs with the [`diagnosis`]
//! detector and drives [`recovery`] sessions before re-running it.

pub mod cli;
pub mod command;
pub mod config;
pub mod diagnosis;
pub mod local_logger;
pub mod logger;
pub mod monitor;
pub mod preflight;
pub mod process;
pub mod recovery;
pub mod resources;
pub mod run_logger;
pub mod runtime;
pub mod supervisor;
pub mod tracer;
pub mod workload;

mod prelude;

#[cfg(test)]
mod testing;

pub use config::SupervisorConfig;
pub use local_logger::clean_logger;
pub use supervisor::{RunOptions, SupervisedRun, Supervisor};
pub use workload::Workload;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
