use super::deadlock::DeadlockIndicator;
use super::stream::{ProcessActivity, StreamKind, StreamReader};
use crate::command::CommandBuilder;
use crate::config::TerminationConfig;
use crate::prelude::*;
use crate::process::{TerminationReport, terminate_child, wait_with_timeout};
use crate::tracer::ExecutionTracer;
use chrono::{DateTime, Utc};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use std::os::unix::process::CommandExt;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A spawned workload and everything attached to it for the lifetime of one run.
///
/// Dropping it without [`MonitoredProcess::release`] kills the process group, so no exit path
/// leaves the workload behind.
pub struct MonitoredProcess {
    pub command: Vec<String>,
    pub started: Instant,
    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
    child: Child,
    pid: u32,
    activity: Arc<ProcessActivity>,
    readers: Vec<StreamReader>,
    indicators: Vec<DeadlockIndicator>,
    force_killed: bool,
    exited: bool,
}

/// What is left of a [`MonitoredProcess`] once its readers were joined.
#[derive(Debug)]
pub struct ReleasedProcess {
    pub stdout: String,
    pub stderr: String,
    pub indicators: Vec<DeadlockIndicator>,
    pub force_killed: bool,
    /// False when at least one reader had to be detached.
    pub readers_joined: bool,
}

impl MonitoredProcess {
    /// Spawn `builder` in its own process group with both output streams piped to reader threads.
    pub fn spawn(
        builder: &CommandBuilder,
        timeout: Duration,
        echo: bool,
        tracer: Option<Arc<ExecutionTracer>>,
    ) -> Result<Self> {
        let command = builder.argv();
        let mut cmd = builder.build();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let started = Instant::now();
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn `{}`", builder.as_command_line()))?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let activity = Arc::new(ProcessActivity::new(started));
        let mut process = Self {
            command,
            started,
            started_at: Utc::now(),
            timeout,
            child,
            pid,
            activity: Arc::clone(&activity),
            readers: Vec::with_capacity(2),
            indicators: vec![],
            force_killed: false,
            exited: false,
        };

        // A failed reader spawn drops `process`, which kills the workload
        if let Some(stdout) = stdout {
            process.readers.push(StreamReader::spawn(
                StreamKind::Stdout,
                stdout,
                Arc::clone(&activity),
                echo,
                tracer.clone(),
            )?);
        }
        if let Some(stderr) = stderr {
            process.readers.push(StreamReader::spawn(
                StreamKind::Stderr,
                stderr,
                activity,
                echo,
                tracer,
            )?);
        }
        debug!("Spawned workload with pid {pid}: {}", builder.as_command_line());
        Ok(process)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn activity(&self) -> &Arc<ProcessActivity> {
        &self.activity
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Non-blocking exit check.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.exited = true;
        }
        Ok(status)
    }

    /// Record `indicator`. Returns false when an indicator of the same kind was already recorded.
    pub fn record_indicator(&mut self, indicator: DeadlockIndicator) -> bool {
        if self.indicators.iter().any(|known| known.kind == indicator.kind) {
            return false;
        }
        self.indicators.push(indicator);
        true
    }

    pub fn indicators(&self) -> &[DeadlockIndicator] {
        &self.indicators
    }

    pub fn force_killed(&self) -> bool {
        self.force_killed
    }

    /// Staged termination of the workload, see [`terminate_child`].
    pub fn force_terminate(&mut self, policy: &TerminationConfig) -> TerminationReport {
        let report = terminate_child(&mut self.child, policy);
        self.force_killed |= report.forced();
        self.exited = !report.possible_zombie();
        report
    }

    /// Join the readers (bounded) and hand back the captured output.
    pub fn release(mut self, reader_join_timeout: Duration) -> ReleasedProcess {
        if !self.exited {
            // Release is only reached with a live child on error paths
            self.kill_group();
        }
        // Grandchildren may still hold the pipes open
        self.sweep_group();

        let mut readers_joined = true;
        for reader in std::mem::take(&mut self.readers) {
            let kind = reader.kind;
            if !reader.join(reader_join_timeout) {
                warn!("The {kind} reader of process {} did not stop in time", self.pid);
                readers_joined = false;
            }
        }

        ReleasedProcess {
            stdout: self.activity.stdout.captured(),
            stderr: self.activity.stderr.captured(),
            indicators: std::mem::take(&mut self.indicators),
            force_killed: self.force_killed,
            readers_joined,
        }
    }

    fn sweep_group(&self) {
        if let Ok(pid) = i32::try_from(self.pid) {
            let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    fn kill_group(&mut self) {
        self.sweep_group();
        let _ = self.child.kill();
        if let Ok(Some(_)) = wait_with_timeout(&mut self.child, Duration::from_secs(1)) {
            self.exited = true;
        }
    }
}

impl Drop for MonitoredProcess {
    fn drop(&mut self) {
        if !self.exited && matches!(self.child.try_wait(), Ok(None)) {
            warn!("Workload {} dropped while running, killing it", self.pid);
            self.kill_group();
        }
    }
}
