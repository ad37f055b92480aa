use crate::command::CommandBuilder;
use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// How long the output readers of a killed probe get to drain.
const PROBE_READER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll `child` until it exits or `timeout` elapses.
///
/// Returns `Ok(None)` when the process is still running after the timeout.
pub fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(None);
        }
        thread::sleep(WAIT_POLL_INTERVAL.min(deadline - now));
    }
}

/// Join `handle` if it finishes within `timeout`.
///
/// std threads cannot be cancelled, so on expiry the handle is dropped and the thread detached.
/// Returns the thread result when it was joined.
pub fn join_bounded<T>(handle: JoinHandle<T>, timeout: Duration) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            warn!("Thread {name} did not finish within {timeout:?}, detaching it");
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
    handle.join().ok()
}

/// Outcome of a command run with [`run_bounded`]. Never an error: spawn failures and timeouts
/// are reported in the fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub argv: Vec<String>,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
    pub error: Option<String>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.error.is_none() && self.exit_code == Some(0)
    }

    /// Short human-readable description of what went wrong, or of the output on success.
    pub fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return error.clone();
        }
        if self.timed_out {
            return format!("`{}` timed out after {:?}", self.argv.join(" "), self.elapsed);
        }
        let detail = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let detail = detail.lines().last().unwrap_or_default();
        match self.exit_code {
            Some(0) => detail.to_string(),
            Some(code) => format!("`{}` exited with {code}: {detail}", self.argv.join(" ")),
            None => format!("`{}` was killed by a signal", self.argv.join(" ")),
        }
    }

    /// Combined stdout and stderr, lowercased, for pattern matching.
    pub fn combined_lowercase(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr).to_lowercase()
    }
}

fn capture<R: Read + Send + 'static>(mut reader: R, name: &str) -> Option<JoinHandle<Vec<u8>>> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let mut buffer = Vec::new();
            // A read error simply ends the capture with what was read so far
            let _ = reader.read_to_end(&mut buffer);
            buffer
        })
        .ok()
}

fn kill_process_group(child: &mut Child) {
    if let Ok(pid) = i32::try_from(child.id()) {
        let _ = nix::sys::signal::killpg(
            nix::unistd::Pid::from_raw(pid),
            nix::sys::signal::Signal::SIGKILL,
        );
    }
    let _ = child.kill();
}

/// Run a short command with captured output, killing it (and its process group) after `timeout`.
pub fn run_bounded(builder: &CommandBuilder, timeout: Duration) -> CommandOutput {
    let argv = builder.argv();
    let started = Instant::now();
    let mut output = CommandOutput {
        argv: argv.clone(),
        ..Default::default()
    };

    let mut command = builder.build();
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0);

    trace!("Running bounded command: {}", builder.as_command_line());
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            output.error = Some(format!("failed to spawn `{}`: {e}", argv.join(" ")));
            output.elapsed = started.elapsed();
            return output;
        }
    };

    let stdout_reader = child
        .stdout
        .take()
        .and_then(|stdout| capture(stdout, "bounded-stdout"));
    let stderr_reader = child
        .stderr
        .take()
        .and_then(|stderr| capture(stderr, "bounded-stderr"));

    match wait_with_timeout(&mut child, timeout) {
        Ok(Some(status)) => {
            output.exit_code = status.code().or_else(|| status.signal().map(|s| 128 + s));
        }
        Ok(None) => {
            output.timed_out = true;
            kill_process_group(&mut child);
            let _ = wait_with_timeout(&mut child, Duration::from_secs(1));
        }
        Err(e) => {
            output.error = Some(format!("failed to wait for `{}`: {e}", argv.join(" ")));
            kill_process_group(&mut child);
            let _ = wait_with_timeout(&mut child, Duration::from_secs(1));
        }
    }

    if let Some(data) = stdout_reader.and_then(|h| join_bounded(h, PROBE_READER_JOIN_TIMEOUT)) {
        output.stdout = String::from_utf8_lossy(&data).into_owned();
    }
    if let Some(data) = stderr_reader.and_then(|h| join_bounded(h, PROBE_READER_JOIN_TIMEOUT)) {
        output.stderr = String::from_utf8_lossy(&data).into_owned();
    }
    output.elapsed = started.elapsed();
    output
}
