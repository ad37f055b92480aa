//! Best-effort resource metrics.
//!
//! Metrics are a capability, not a requirement: every query returns `None` (or an empty list)
//! when the platform cannot answer, and callers treat that as neutral evidence.

use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use sysinfo::{Disks, Networks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Point-in-time resource usage of one process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub pid: u32,
    pub cpu_percent: f32,
    pub memory_mb: f64,
    /// Share of the total system memory used by the process.
    pub memory_percent: f32,
    pub disk_read_bytes: u64,
    pub disk_written_bytes: u64,
    /// System-wide network counters, per-process counters are not available.
    pub network_received_bytes: u64,
    pub network_transmitted_bytes: u64,
    pub open_handles: Option<u64>,
    pub thread_count: Option<u64>,
}

/// Point-in-time resource usage of the whole machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemResources {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub load_average: [f64; 3],
    /// Available space on the filesystem holding `/`, when it could be determined.
    pub root_disk_available_mb: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildProcessInfo {
    pub pid: u32,
    pub parent_pid: u32,
    pub name: String,
    pub command: String,
    pub status: String,
}

pub trait ResourceSampler: Send + Sync {
    fn sample_process(&self, pid: u32) -> Option<ResourceUsage>;

    fn system_snapshot(&self) -> Option<SystemResources>;

    /// Every descendant of `pid`, breadth first.
    fn child_processes(&self, pid: u32) -> Vec<ChildProcessInfo>;
}

/// The "metrics unavailable" sentinel.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableSampler;

impl ResourceSampler for UnavailableSampler {
    fn sample_process(&self, _pid: u32) -> Option<ResourceUsage> {
        None
    }

    fn system_snapshot(&self) -> Option<SystemResources> {
        None
    }

    fn child_processes(&self, _pid: u32) -> Vec<ChildProcessInfo> {
        vec![]
    }
}

/// [`ResourceSampler`] backed by `sysinfo`, with handle and thread counts from procfs on Linux.
///
/// CPU percentages are computed between two refreshes, so the first sample of a process
/// reports 0%.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
fn handle_and_thread_count(pid: u32) -> (Option<u64>, Option<u64>) {
    let Ok(process) = procfs::process::Process::new(pid as i32) else {
        return (None, None);
    };
    let handles = process.fd_count().ok().map(|count| count as u64);
    let threads = process
        .stat()
        .ok()
        .and_then(|stat| u64::try_from(stat.num_threads).ok());
    (handles, threads)
}

#[cfg(not(target_os = "linux"))]
fn handle_and_thread_count(_pid: u32) -> (Option<u64>, Option<u64>) {
    (None, None)
}

fn network_totals() -> (u64, u64) {
    let networks = Networks::new_with_refreshed_list();
    networks.iter().fold((0, 0), |(rx, tx), (_, data)| {
        (rx + data.total_received(), tx + data.total_transmitted())
    })
}

const BYTES_PER_MB: u64 = 1024 * 1024;

impl ResourceSampler for SysinfoSampler {
    fn sample_process(&self, pid: u32) -> Option<ResourceUsage> {
        let (cpu_percent, memory_bytes, disk_usage, total_memory) = {
            let mut system = self.system.lock().ok()?;
            let sys_pid = Pid::from_u32(pid);
            system.refresh_processes_specifics(
                ProcessesToUpdate::Some(&[sys_pid]),
                true,
                ProcessRefreshKind::nothing()
                    .with_cpu()
                    .with_memory()
                    .with_disk_usage(),
            );
            system.refresh_memory();
            let process = system.process(sys_pid)?;
            (
                process.cpu_usage(),
                process.memory(),
                process.disk_usage(),
                system.total_memory(),
            )
        };

        let (open_handles, thread_count) = handle_and_thread_count(pid);
        let (network_received_bytes, network_transmitted_bytes) = network_totals();
        let memory_percent = if total_memory > 0 {
            (memory_bytes as f64 / total_memory as f64 * 100.0) as f32
        } else {
            0.0
        };

        Some(ResourceUsage {
            timestamp: Utc::now(),
            pid,
            cpu_percent,
            memory_mb: memory_bytes as f64 / BYTES_PER_MB as f64,
            memory_percent,
            disk_read_bytes: disk_usage.total_read_bytes,
            disk_written_bytes: disk_usage.total_written_bytes,
            network_received_bytes,
            network_transmitted_bytes,
            open_handles,
            thread_count,
        })
    }

    fn system_snapshot(&self) -> Option<SystemResources> {
        let mut system = self.system.lock().ok()?;
        system.refresh_memory();
        system.refresh_cpu_usage();

        let total = system.total_memory();
        if total == 0 {
            return None;
        }
        let available = system.available_memory();
        let load = System::load_average();
        let root_disk_available_mb = Disks::new_with_refreshed_list()
            .iter()
            .filter(|disk| disk.mount_point() == std::path::Path::new("/"))
            .map(|disk| disk.available_space() / BYTES_PER_MB)
            .next();

        Some(SystemResources {
            timestamp: Utc::now(),
            cpu_percent: system.global_cpu_usage(),
            memory_percent: (system.used_memory() as f64 / total as f64 * 100.0) as f32,
            total_memory_mb: total / BYTES_PER_MB,
            available_memory_mb: available / BYTES_PER_MB,
            load_average: [load.one, load.five, load.fifteen],
            root_disk_available_mb,
        })
    }

    fn child_processes(&self, pid: u32) -> Vec<ChildProcessInfo> {
        let Ok(mut system) = self.system.lock() else {
            return vec![];
        };
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(sysinfo::UpdateKind::OnlyIfNotSet),
        );

        let mut children_of: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child_pid, process) in system.processes() {
            // Threads show up as tasks of their process, skip them
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children_of.entry(parent).or_default().push(*child_pid);
            }
        }

        let mut descendants = Vec::new();
        let mut queue = VecDeque::from([Pid::from_u32(pid)]);
        while let Some(parent) = queue.pop_front() {
            let Some(children) = children_of.get(&parent) else {
                continue;
            };
            for child in children {
                if let Some(process) = system.process(*child) {
                    descendants.push(ChildProcessInfo {
                        pid: child.as_u32(),
                        parent_pid: parent.as_u32(),
                        name: process.name().to_string_lossy().into_owned(),
                        command: process
                            .cmd()
                            .iter()
                            .map(|arg| arg.to_string_lossy())
                            .join(" "),
                        status: process.status().to_string(),
                    });
                }
                queue.push_back(*child);
            }
        }
        descendants
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    #[test]
    fn test_unavailable_sampler_is_neutral() {
        let sampler = UnavailableSampler;
        assert!(sampler.sample_process(std::process::id()).is_none());
        assert!(sampler.system_snapshot().is_none());
        assert!(sampler.child_processes(1).is_empty());
    }

    #[test]
    fn test_sample_current_process() {
        let sampler = SysinfoSampler::new();
        let usage = sampler
            .sample_process(std::process::id())
            .expect("the test process is always visible");
        assert_eq!(usage.pid, std::process::id());
        assert!(usage.memory_mb > 0.0);
        #[cfg(target_os = "linux")]
        {
            assert!(usage.open_handles.unwrap() > 0);
            assert!(usage.thread_count.unwrap() >= 1);
        }
    }

    #[test]
    fn test_sample_unknown_pid() {
        let sampler = SysinfoSampler::new();
        assert!(sampler.sample_process(u32::MAX - 1).is_none());
    }

    #[test]
    fn test_child_processes_include_spawned_child() {
        let mut child = Command::new("sleep").arg("5").spawn().unwrap();
        let sampler = SysinfoSampler::new();
        let children = sampler.child_processes(std::process::id());
        assert!(children.iter().any(|c| c.pid == child.id()));
        child.kill().unwrap();
        child.wait().unwrap();
    }
}
