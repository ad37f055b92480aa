//! The individual recovery actions. Each returns exactly one finished [`RecoveryAttempt`] and
//! never fails: errors become failure reasons.

use super::session::{AttemptStatus, RecoveryAttempt, RecoveryKind};
use crate::config::{RecoveryConfig, TerminationConfig};
use crate::prelude::*;
use crate::process::{CommandOutput, terminate_pid};
use crate::runtime::{ContainerRuntime, PruneTarget};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// The workload process a recovery session is about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedProcess {
    pub pid: Option<u32>,
    pub command: Vec<String>,
}

pub(super) struct StepContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub config: &'a RecoveryConfig,
    pub termination: &'a TerminationConfig,
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    }
}

pub(super) fn clear_buffers(context: &StepContext) -> RecoveryAttempt {
    let mut attempt = RecoveryAttempt::begin(RecoveryKind::BufferClear);
    let mut cleared = 0;
    for path in &context.config.scratch_paths {
        if !path.exists() {
            continue;
        }
        match remove_path(path) {
            Ok(()) => {
                cleared += 1;
                attempt.succeeded(format!("removed {}", path.display()));
            }
            Err(e) => attempt.failed(format!("cannot remove {}: {e}", path.display())),
        }
    }
    attempt.finish(None, format!("Cleared {cleared} scratch path(s)"))
}

fn group_alive(pid: u32) -> bool {
    let Ok(pid) = i32::try_from(pid) else {
        return false;
    };
    killpg(Pid::from_raw(pid), None::<Signal>).is_ok()
}

/// Make sure nothing of the failed process survives and that its command can be launched again.
/// The relaunch itself is the supervised re-run.
pub(super) fn restart_process(context: &StepContext, failed: &FailedProcess) -> RecoveryAttempt {
    let mut attempt = RecoveryAttempt::begin(RecoveryKind::ProcessRestart);

    if let Some(pid) = failed.pid {
        if group_alive(pid) {
            let report = terminate_pid(pid, context.termination);
            if report.possible_zombie() {
                attempt.failed(format!("process {pid} survived SIGKILL, possible zombie"));
            } else {
                attempt.succeeded(format!("stopped process {pid} ({:?})", report.method));
            }
            // Grandchildren that ignored the leader's death
            if group_alive(pid) {
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        } else {
            attempt.succeeded(format!("process {pid} already gone"));
        }
    }

    match failed.command.first() {
        Some(program) => match which::which(program) {
            Ok(path) => attempt.succeeded(format!("{program} resolves to {}", path.display())),
            Err(e) => attempt.failed(format!("{program} cannot be launched: {e}")),
        },
        None => attempt.failed("no command to restart"),
    }
    attempt.finish(None, "Previous process cleaned up, ready for a re-run")
}

/// Probe the runtime, restart it when down, then try fixing the socket permissions.
pub(super) fn reconnect_runtime(context: &StepContext) -> RecoveryAttempt {
    let mut attempt = RecoveryAttempt::begin(RecoveryKind::ExternalChannelReconnect);
    let runtime = context.runtime;
    let timeout = context.config.step_timeout;

    let probe = runtime.ping(timeout);
    if probe.success() {
        attempt.succeeded(format!("{} reachable", runtime.name()));
        return attempt.finish(None, format!("{} was already reachable", runtime.name()));
    }
    let first_failure = probe.summary();

    let restart = runtime.restart_service(timeout);
    if restart.success() {
        std::thread::sleep(context.config.reconnect_settle);
        if runtime.ping(timeout).success() {
            attempt.succeeded(format!("{} restarted", runtime.name()));
            return attempt.finish(None, format!("Reconnected after restarting {}", runtime.name()));
        }
    } else {
        debug!("Restarting {} failed: {}", runtime.name(), restart.summary());
    }

    let fix = runtime.fix_socket_permissions(timeout);
    if fix.success() && runtime.ping(timeout).success() {
        attempt.succeeded("socket permissions fixed");
        return attempt.finish(None, "Reconnected after fixing the socket permissions");
    }

    attempt.failed(first_failure);
    if !restart.success() {
        attempt.failed(format!("restart failed: {}", restart.summary()));
    }
    if !fix.success() {
        attempt.failed(format!("permission fix failed: {}", fix.summary()));
    }
    attempt.finish(
        Some(AttemptStatus::Failed),
        format!("{} is still unreachable", runtime.name()),
    )
}

fn note(attempt: &mut RecoveryAttempt, what: &str, output: &CommandOutput) {
    if output.success() {
        attempt.succeeded(what.to_string());
    } else {
        attempt.failed(format!("{what}: {}", output.summary()));
    }
}

/// Stop stale workload containers and prune what they left behind.
pub(super) fn reset_sandbox(context: &StepContext) -> RecoveryAttempt {
    let mut attempt = RecoveryAttempt::begin(RecoveryKind::SandboxReset);
    let runtime = context.runtime;
    let timeout = context.config.step_timeout;

    let stop = runtime.stop_containers(&context.config.container_name_filter, timeout);
    note(&mut attempt, "stopped stale containers", &stop);
    for target in [PruneTarget::Containers, PruneTarget::Networks, PruneTarget::Volumes] {
        let output = runtime.prune(target, timeout);
        note(&mut attempt, &format!("pruned {}", target.as_str()), &output);
    }

    // Best effort, does not affect the outcome
    let system = runtime.prune(PruneTarget::System, timeout);
    if !system.success() {
        debug!("System prune failed: {}", system.summary());
    }

    attempt.finish(None, "Sandbox state reset")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRuntime, failed_output, ok_output};
    use std::os::unix::process::CommandExt;
    use std::time::Duration;

    fn config() -> RecoveryConfig {
        RecoveryConfig {
            reconnect_settle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn context<'a>(
        runtime: &'a FakeRuntime,
        config: &'a RecoveryConfig,
        termination: &'a TerminationConfig,
    ) -> StepContext<'a> {
        StepContext {
            runtime,
            config,
            termination,
        }
    }

    #[test]
    fn test_clear_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("buffer.log");
        let sub = dir.path().join("scratch");
        std::fs::write(&file, "stale").unwrap();
        std::fs::create_dir_all(sub.join("nested")).unwrap();
        let config = RecoveryConfig {
            scratch_paths: vec![file.clone(), sub.clone(), dir.path().join("absent")],
            ..config()
        };
        let runtime = FakeRuntime::healthy();
        let termination = TerminationConfig::default();

        let attempt = clear_buffers(&context(&runtime, &config, &termination));
        assert_eq!(attempt.status, AttemptStatus::Success);
        assert_eq!(attempt.success_indicators.len(), 2);
        assert!(!file.exists());
        assert!(!sub.exists());
    }

    #[test]
    fn test_reconnect_when_reachable() {
        let runtime = FakeRuntime::healthy();
        let (config, termination) = (config(), TerminationConfig::default());
        let attempt = reconnect_runtime(&context(&runtime, &config, &termination));
        assert!(attempt.is_success());
        assert_eq!(runtime.calls(), vec!["ping"]);
    }

    #[test]
    fn test_reconnect_after_restart() {
        let runtime = FakeRuntime::healthy()
            .respond("ping", failed_output("Cannot connect"))
            .respond("ping", ok_output(""));
        let (config, termination) = (config(), TerminationConfig::default());
        let attempt = reconnect_runtime(&context(&runtime, &config, &termination));
        assert!(attempt.is_success());
        assert_eq!(runtime.calls(), vec!["ping", "restart_service", "ping"]);
    }

    #[test]
    fn test_reconnect_failure_lists_every_reason() {
        let runtime = FakeRuntime::healthy()
            .respond("ping", failed_output("Cannot connect"))
            .respond("restart_service", failed_output("sudo: a password is required"))
            .respond("fix_socket_permissions", failed_output("not permitted"));
        let (config, termination) = (config(), TerminationConfig::default());
        let attempt = reconnect_runtime(&context(&runtime, &config, &termination));
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.failure_reasons.len(), 3);
        assert_eq!(
            runtime.calls(),
            vec!["ping", "restart_service", "fix_socket_permissions"]
        );
    }

    #[test]
    fn test_reset_sandbox_partial() {
        let runtime = FakeRuntime::healthy().respond("prune", failed_output("daemon busy"));
        let (config, termination) = (config(), TerminationConfig::default());
        let attempt = reset_sandbox(&context(&runtime, &config, &termination));
        assert_eq!(attempt.status, AttemptStatus::Partial);
        assert_eq!(attempt.success_indicators, vec!["stopped stale containers"]);
        assert_eq!(attempt.failure_reasons.len(), 3);
        assert!(runtime.calls().contains(&"prune system".to_string()));
    }

    #[test]
    fn test_restart_stops_survivors() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let failed = FailedProcess {
            pid: Some(child.id()),
            command: vec!["sh".into(), "-c".into(), "true".into()],
        };
        let runtime = FakeRuntime::healthy();
        let termination = TerminationConfig {
            graceful_wait: Duration::from_secs(1),
            group_wait: Duration::from_millis(500),
            kill_wait: Duration::from_secs(1),
        };
        let config = config();

        // Our own child, so the staged termination reaps it through waitpid
        let attempt = restart_process(&context(&runtime, &config, &termination), &failed);
        assert!(attempt.is_success(), "{attempt:?}");
        assert_eq!(attempt.success_indicators.len(), 2);
    }

    #[test]
    fn test_restart_without_pid_signals_nothing() {
        let mut bystander = std::process::Command::new("sleep")
            .arg("30")
            .process_group(0)
            .spawn()
            .unwrap();
        let failed = FailedProcess {
            pid: None,
            command: vec!["sh".into()],
        };
        let runtime = FakeRuntime::healthy();
        let (config, termination) = (config(), TerminationConfig::default());

        let attempt = restart_process(&context(&runtime, &config, &termination), &failed);
        assert!(attempt.is_success(), "{attempt:?}");
        assert_eq!(attempt.success_indicators.len(), 1);
        assert!(attempt.success_indicators[0].starts_with("sh resolves to"));
        assert!(bystander.try_wait().unwrap().is_none());

        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[test]
    fn test_restart_with_unknown_program() {
        let failed = FailedProcess {
            pid: None,
            command: vec!["definitely-not-a-binary".into()],
        };
        let runtime = FakeRuntime::healthy();
        let (config, termination) = (config(), TerminationConfig::default());
        let attempt = restart_process(&context(&runtime, &config, &termination), &failed);
        assert_eq!(attempt.status, AttemptStatus::Failed);
    }
}
