//! In-process fakes for the collaborators that normally shell out.

use crate::process::CommandOutput;
use crate::resources::{ChildProcessInfo, ResourceSampler, ResourceUsage, SystemResources};
use crate::runtime::{ContainerRuntime, PruneTarget};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

pub fn ok_output(stdout: &str) -> CommandOutput {
    CommandOutput {
        argv: vec!["docker".into()],
        exit_code: Some(0),
        stdout: stdout.into(),
        elapsed: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn failed_output(stderr: &str) -> CommandOutput {
    CommandOutput {
        argv: vec!["docker".into()],
        exit_code: Some(1),
        stderr: stderr.into(),
        elapsed: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn hung_output() -> CommandOutput {
    CommandOutput {
        argv: vec!["docker".into()],
        elapsed: Duration::from_secs(10),
        timed_out: true,
        ..Default::default()
    }
}

/// Scripted [`ContainerRuntime`]. Each operation answers from its queue, the last answer
/// repeating, and defaults to success.
#[derive(Default)]
pub struct FakeRuntime {
    pub socket: Option<PathBuf>,
    pub(crate) responses: Mutex<HashMap<&'static str, VecDeque<CommandOutput>>>,
    pub(crate) calls: Mutex<Vec<String>>,
}

impl FakeRuntime {
    pub fn healthy() -> Self {
        Self::default()
    }

    pub fn respond(self, operation: &'static str, output: CommandOutput) -> Self {
        self.responses
            .lock()
            .unwrap()
            .entry(operation)
            .or_default()
            .push_back(output);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn answer(&self, operation: &'static str) -> CommandOutput {
        self.calls.lock().unwrap().push(operation.to_string());
        let mut responses = self.responses.lock().unwrap();
        match responses.get_mut(operation) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap_or_else(|| ok_output("")),
            None => ok_output(""),
        }
    }
}

impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    fn socket_path(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    fn ping(&self, _: Duration) -> CommandOutput {
        self.answer("ping")
    }

    fn info(&self, _: Duration) -> CommandOutput {
        self.answer("info")
    }

    fn version(&self, _: Duration) -> CommandOutput {
        self.answer("version")
    }

    fn list_containers(&self, _: Duration) -> CommandOutput {
        self.answer("list_containers")
    }

    fn restart_service(&self, _: Duration) -> CommandOutput {
        self.answer("restart_service")
    }

    fn fix_socket_permissions(&self, _: Duration) -> CommandOutput {
        self.answer("fix_socket_permissions")
    }

    fn stop_containers(&self, _: &str, _: Duration) -> CommandOutput {
        self.answer("stop_containers")
    }

    fn prune(&self, target: PruneTarget, _: Duration) -> CommandOutput {
        self.calls
            .lock()
            .unwrap()
            .push(format!("prune {}", target.as_str()));
        self.answer("prune")
    }

    fn run_script(&self, _: &str, _: &Path, _: &str, _: Duration) -> CommandOutput {
        self.answer("run_script")
    }
}

/// [`ResourceSampler`] reporting fixed system-wide memory pressure.
pub struct PressureSampler {
    pub memory_percent: f32,
    pub root_disk_available_mb: Option<u64>,
}

impl ResourceSampler for PressureSampler {
    fn sample_process(&self, _pid: u32) -> Option<ResourceUsage> {
        None
    }

    fn system_snapshot(&self) -> Option<SystemResources> {
        Some(SystemResources {
            timestamp: Utc::now(),
            cpu_percent: 12.0,
            memory_percent: self.memory_percent,
            total_memory_mb: 16_000,
            available_memory_mb: (16_000.0 * (100.0 - self.memory_percent as f64) / 100.0) as u64,
            load_average: [0.5, 0.5, 0.5],
            root_disk_available_mb: self.root_disk_available_mb,
        })
    }

    fn child_processes(&self, _pid: u32) -> Vec<ChildProcessInfo> {
        vec![]
    }
}
