use crate::config::TerminationConfig;
use crate::prelude::*;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, getpgid};
use serde::{Deserialize, Serialize};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
            signal: status.signal(),
        }
    }
}

/// The step of the staged termination that got rid of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TerminationMethod {
    AlreadyExited,
    Graceful,
    ProcessGroup,
    Kill,
    /// Still alive after SIGKILL.
    PossibleZombie,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminationReport {
    pub pid: u32,
    pub method: TerminationMethod,
    pub exit: Option<ExitInfo>,
    pub elapsed: Duration,
    pub steps: Vec<String>,
}

impl TerminationReport {
    pub fn possible_zombie(&self) -> bool {
        self.method == TerminationMethod::PossibleZombie
    }

    /// Whether a signal had to be sent at all.
    pub fn forced(&self) -> bool {
        self.method != TerminationMethod::AlreadyExited
    }
}

/// Something the staged termination can signal and poll.
trait Target {
    fn pid(&self) -> Pid;
    /// `Some` once the process is gone.
    fn poll_exit(&mut self) -> Option<Option<ExitInfo>>;
}

impl Target for &mut Child {
    fn pid(&self) -> Pid {
        Pid::from_raw(self.id() as i32)
    }

    fn poll_exit(&mut self) -> Option<Option<ExitInfo>> {
        match self.try_wait() {
            Ok(Some(status)) => Some(Some(status.into())),
            Ok(None) => None,
            // The handle can no longer be waited on, fall back to probing the pid
            Err(_) => probe_pid(Target::pid(self)),
        }
    }
}

struct PidTarget(Pid);

impl Target for PidTarget {
    fn pid(&self) -> Pid {
        self.0
    }

    fn poll_exit(&mut self) -> Option<Option<ExitInfo>> {
        match waitpid(self.0, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(_, code)) => Some(Some(ExitInfo {
                code: Some(code),
                signal: None,
            })),
            Ok(WaitStatus::Signaled(_, signal, _)) => Some(Some(ExitInfo {
                code: None,
                signal: Some(signal as i32),
            })),
            Ok(_) => None,
            // Not our child: only existence can be observed
            Err(_) => probe_pid(self.0),
        }
    }
}

fn probe_pid(pid: Pid) -> Option<Option<ExitInfo>> {
    match kill(pid, None) {
        Err(Errno::ESRCH) => Some(None),
        _ => None,
    }
}

fn wait_for_exit(target: &mut impl Target, timeout: Duration) -> Option<Option<ExitInfo>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(exit) = target.poll_exit() {
            return Some(exit);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

/// The process group of `pid`, unless it is our own group (signalling it would hit us too).
fn own_process_group(pid: Pid) -> Option<Pid> {
    let group = getpgid(Some(pid)).ok()?;
    let ours = getpgid(None).ok()?;
    (group != ours).then_some(group)
}

fn terminate(mut target: impl Target, policy: &TerminationConfig) -> TerminationReport {
    let started = Instant::now();
    let pid = target.pid();
    let mut steps = Vec::new();
    let report = |method, exit, steps| TerminationReport {
        pid: pid.as_raw() as u32,
        method,
        exit,
        elapsed: started.elapsed(),
        steps,
    };

    if let Some(exit) = target.poll_exit() {
        return report(TerminationMethod::AlreadyExited, exit, steps);
    }
    let group = own_process_group(pid);

    // Stage 1: graceful stop
    steps.push(format!("SIGTERM sent to {pid}"));
    if let Err(e) = kill(pid, Signal::SIGTERM) {
        debug!("Failed to send SIGTERM to {pid}: {e}");
    }
    if let Some(exit) = wait_for_exit(&mut target, policy.graceful_wait) {
        sweep_group(group);
        info!("Process {pid} stopped after SIGTERM");
        return report(TerminationMethod::Graceful, exit, steps);
    }

    // Stage 2: stop the whole process group
    if let Some(group) = group {
        steps.push(format!("SIGTERM sent to process group {group}"));
        if let Err(e) = killpg(group, Signal::SIGTERM) {
            debug!("Failed to send SIGTERM to process group {group}: {e}");
        }
        if let Some(exit) = wait_for_exit(&mut target, policy.group_wait) {
            sweep_group(Some(group));
            warn!("Process {pid} stopped after its process group was signalled");
            return report(TerminationMethod::ProcessGroup, exit, steps);
        }
    } else {
        steps.push("process shares our process group, group stop skipped".to_string());
    }

    // Stage 3: kill
    steps.push(format!("SIGKILL sent to {pid}"));
    if let Err(e) = kill(pid, Signal::SIGKILL) {
        debug!("Failed to send SIGKILL to {pid}: {e}");
    }
    sweep_group(group);
    if let Some(exit) = wait_for_exit(&mut target, policy.kill_wait) {
        warn!("Process {pid} had to be killed");
        return report(TerminationMethod::Kill, exit, steps);
    }

    error!(
        "Process {pid} is still alive {:?} after SIGKILL, possible zombie",
        policy.kill_wait
    );
    steps.push("still alive after SIGKILL".to_string());
    report(TerminationMethod::PossibleZombie, None, steps)
}

/// Kill whatever is left in the process group, so that leftover grandchildren release the pipes.
fn sweep_group(group: Option<Pid>) {
    if let Some(group) = group {
        let _ = killpg(group, Signal::SIGKILL);
    }
}

/// Staged termination of a child we own: SIGTERM, then the process group, then SIGKILL.
///
/// Never blocks longer than [`TerminationConfig::grace_period`] and never fails: a process that
/// survives SIGKILL is reported as [`TerminationMethod::PossibleZombie`].
pub fn terminate_child(child: &mut Child, policy: &TerminationConfig) -> TerminationReport {
    terminate(child, policy)
}

/// Same contract as [`terminate_child`] for a process known only by its pid.
pub fn terminate_pid(pid: u32, policy: &TerminationConfig) -> TerminationReport {
    terminate(PidTarget(Pid::from_raw(pid as i32)), policy)
}
