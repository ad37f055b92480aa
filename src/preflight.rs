//! Environment pre-flight checks and the system snapshot attached to error reports.

use crate::config::DiagnosisConfig;
use crate::prelude::*;
use crate::runtime::ContainerRuntime;
use nix::unistd::{AccessFlags, User, access, geteuid};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

pub const RUNTIME_REACHABLE_CHECK: &str = "runtime-reachable";
pub const BINARIES_PRESENT_CHECK: &str = "binaries-present";
pub const SOCKET_PERMISSIONS_CHECK: &str = "socket-permissions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Ok,
    Warning,
    Error,
}

impl Display for ProbeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeStatus::Ok => write!(f, "ok"),
            ProbeStatus::Warning => write!(f, "warning"),
            ProbeStatus::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeResult {
    pub name: String,
    pub status: ProbeStatus,
    pub message: String,
    pub recommendations: Vec<String>,
}

impl ProbeResult {
    pub fn ok(name: &str, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status: ProbeStatus::Ok,
            message: message.into(),
            recommendations: vec![],
        }
    }

    pub fn warning(name: &str, message: impl Into<String>, recommendations: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            status: ProbeStatus::Warning,
            message: message.into(),
            recommendations,
        }
    }

    pub fn error(name: &str, message: impl Into<String>, recommendations: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            status: ProbeStatus::Error,
            message: message.into(),
            recommendations,
        }
    }
}

/// A cheap environment check run before a supervised run.
pub trait PreflightCheck: Send + Sync {
    fn name(&self) -> &str;

    /// Never fails: problems are reported through the result status.
    fn run(&self) -> ProbeResult;
}

pub struct RuntimeReachableCheck {
    runtime: Arc<dyn ContainerRuntime>,
    timeout: Duration,
}

impl RuntimeReachableCheck {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Self {
        Self { runtime, timeout }
    }
}

impl PreflightCheck for RuntimeReachableCheck {
    fn name(&self) -> &str {
        RUNTIME_REACHABLE_CHECK
    }

    fn run(&self) -> ProbeResult {
        let output = self.runtime.ping(self.timeout);
        if output.success() {
            return ProbeResult::ok(
                self.name(),
                format!(
                    "{} daemon {} answered in {:.1}s",
                    self.runtime.name(),
                    output.stdout.trim(),
                    output.elapsed.as_secs_f64()
                ),
            );
        }
        ProbeResult::error(
            self.name(),
            format!("{} daemon is not reachable: {}", self.runtime.name(), output.summary()),
            vec![
                format!("Start the {} daemon", self.runtime.name()),
                format!("Check that `{} info` works for the current user", self.runtime.name()),
            ],
        )
    }
}

pub struct BinariesPresentCheck {
    binaries: Vec<String>,
}

impl BinariesPresentCheck {
    pub fn new(binaries: Vec<String>) -> Self {
        Self { binaries }
    }
}

impl PreflightCheck for BinariesPresentCheck {
    fn name(&self) -> &str {
        BINARIES_PRESENT_CHECK
    }

    fn run(&self) -> ProbeResult {
        let missing = self
            .binaries
            .iter()
            .filter(|binary| which::which(binary.as_str()).is_err())
            .collect::<Vec<_>>();
        if missing.is_empty() {
            return ProbeResult::ok(
                self.name(),
                format!("found {}", self.binaries.iter().join(", ")),
            );
        }
        ProbeResult::error(
            self.name(),
            format!("missing from PATH: {}", missing.iter().join(", ")),
            missing
                .iter()
                .map(|binary| format!("Install `{binary}` or add it to PATH"))
                .collect(),
        )
    }
}

pub struct SocketPermissionsCheck {
    socket: Option<PathBuf>,
}

impl SocketPermissionsCheck {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self { socket }
    }
}

impl PreflightCheck for SocketPermissionsCheck {
    fn name(&self) -> &str {
        SOCKET_PERMISSIONS_CHECK
    }

    fn run(&self) -> ProbeResult {
        let Some(socket) = &self.socket else {
            return ProbeResult::ok(self.name(), "no runtime socket configured");
        };
        if !socket.exists() {
            return ProbeResult::error(
                self.name(),
                format!("{} does not exist", socket.display()),
                vec!["Start the container runtime daemon".into()],
            );
        }
        match access(socket.as_path(), AccessFlags::R_OK | AccessFlags::W_OK) {
            Ok(()) => ProbeResult::ok(self.name(), format!("{} is accessible", socket.display())),
            Err(e) => ProbeResult::warning(
                self.name(),
                format!("{} is not accessible: {e}", socket.display()),
                vec![
                    "Add the current user to the docker group: sudo usermod -aG docker $USER"
                        .into(),
                    format!("Or relax the socket permissions: sudo chmod 666 {}", socket.display()),
                ],
            ),
        }
    }
}

/// The checks run before every supervised run unless skipped.
pub fn default_checks(
    config: &DiagnosisConfig,
    runtime: Arc<dyn ContainerRuntime>,
) -> Vec<Box<dyn PreflightCheck>> {
    vec![
        Box::new(BinariesPresentCheck::new(config.required_binaries.clone())),
        Box::new(SocketPermissionsCheck::new(config.runtime_socket.clone())),
        Box::new(RuntimeReachableCheck::new(runtime, config.probe_timeout)),
    ]
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreflightReport {
    pub results: Vec<ProbeResult>,
}

impl PreflightReport {
    pub fn run(checks: &[Box<dyn PreflightCheck>]) -> Self {
        start_group!("Running pre-flight checks");
        let results = checks
            .iter()
            .map(|check| {
                let result = check.run();
                match result.status {
                    ProbeStatus::Ok => debug!("{}: {}", result.name, result.message),
                    ProbeStatus::Warning => warn!("{}: {}", result.name, result.message),
                    ProbeStatus::Error => error!("{}: {}", result.name, result.message),
                }
                result
            })
            .collect();
        end_group!();
        Self { results }
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| r.status == ProbeStatus::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ProbeResult> {
        self.results
            .iter()
            .filter(|r| r.status == ProbeStatus::Error)
    }

    pub fn worst_status(&self) -> ProbeStatus {
        self.results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(ProbeStatus::Ok)
    }
}

/// Host description shipped in error reports. Every field is best effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub arch: String,
    pub host: Option<String>,
    pub user: Option<String>,
    pub cpu_brand: Option<String>,
    pub cpu_cores: Option<usize>,
    pub total_memory_gb: u64,
    pub is_root: bool,
}

impl SystemInfo {
    pub fn collect() -> Self {
        let system = System::new_with_specifics(
            RefreshKind::nothing()
                .with_cpu(CpuRefreshKind::everything())
                .with_memory(MemoryRefreshKind::everything()),
        );
        let user = User::from_uid(geteuid())
            .ok()
            .flatten()
            .map(|user| user.name);

        SystemInfo {
            os: System::distribution_id(),
            os_version: System::os_version(),
            kernel_version: System::kernel_version(),
            arch: System::cpu_arch(),
            host: System::host_name(),
            user,
            cpu_brand: system.cpus().first().map(|cpu| cpu.brand().to_string()),
            cpu_cores: system.physical_core_count(),
            total_memory_gb: system.total_memory().div_ceil(1024_u64.pow(3)),
            is_root: geteuid().is_root(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use crate::runtime::PruneTarget;
    use std::path::Path;

    struct StaticRuntime {
        reachable: bool,
    }

    impl StaticRuntime {
        fn output(&self) -> CommandOutput {
            CommandOutput {
                exit_code: Some(if self.reachable { 0 } else { 1 }),
                stdout: "27.0.1\n".into(),
                stderr: if self.reachable {
                    String::new()
                } else {
                    "Cannot connect to the Docker daemon".into()
                },
                ..Default::default()
            }
        }
    }

    impl ContainerRuntime for StaticRuntime {
        fn name(&self) -> &str {
            "docker"
        }
        fn socket_path(&self) -> Option<&Path> {
            None
        }
        fn ping(&self, _: Duration) -> CommandOutput {
            self.output()
        }
        fn info(&self, _: Duration) -> CommandOutput {
            self.output()
        }
        fn version(&self, _: Duration) -> CommandOutput {
            self.output()
        }
        fn list_containers(&self, _: Duration) -> CommandOutput {
            self.output()
        }
        fn restart_service(&self, _: Duration) -> CommandOutput {
            self.output()
        }
        fn fix_socket_permissions(&self, _: Duration) -> CommandOutput {
            self.output()
        }
        fn stop_containers(&self, _: &str, _: Duration) -> CommandOutput {
            self.output()
        }
        fn prune(&self, _: PruneTarget, _: Duration) -> CommandOutput {
            self.output()
        }
        fn run_script(&self, _: &str, _: &Path, _: &str, _: Duration) -> CommandOutput {
            self.output()
        }
    }

    #[test]
    fn test_runtime_reachable() {
        let check = RuntimeReachableCheck::new(
            Arc::new(StaticRuntime { reachable: true }),
            Duration::from_secs(1),
        );
        let result = check.run();
        assert_eq!(result.status, ProbeStatus::Ok);
        assert!(result.message.contains("27.0.1"));

        let check = RuntimeReachableCheck::new(
            Arc::new(StaticRuntime { reachable: false }),
            Duration::from_secs(1),
        );
        let result = check.run();
        assert_eq!(result.status, ProbeStatus::Error);
        assert!(result.message.contains("Cannot connect"));
        assert!(!result.recommendations.is_empty());
    }

    #[test]
    fn test_binaries_present() {
        let result = BinariesPresentCheck::new(vec!["sh".into()]).run();
        assert_eq!(result.status, ProbeStatus::Ok);

        let result =
            BinariesPresentCheck::new(vec!["sh".into(), "definitely-not-installed-42".into()])
                .run();
        assert_eq!(result.status, ProbeStatus::Error);
        assert!(result.message.contains("definitely-not-installed-42"));
        assert!(!result.message.contains("sh,"));
    }

    #[test]
    fn test_socket_permissions() {
        let dir = tempfile::TempDir::new().unwrap();
        let socket = dir.path().join("docker.sock");

        let result = SocketPermissionsCheck::new(Some(socket.clone())).run();
        assert_eq!(result.status, ProbeStatus::Error);

        std::fs::write(&socket, "").unwrap();
        let result = SocketPermissionsCheck::new(Some(socket)).run();
        assert_eq!(result.status, ProbeStatus::Ok);

        let result = SocketPermissionsCheck::new(None).run();
        assert_eq!(result.status, ProbeStatus::Ok);
    }

    #[test]
    fn test_report_status() {
        let checks: Vec<Box<dyn PreflightCheck>> = vec![
            Box::new(BinariesPresentCheck::new(vec!["sh".into()])),
            Box::new(RuntimeReachableCheck::new(
                Arc::new(StaticRuntime { reachable: false }),
                Duration::from_secs(1),
            )),
        ];
        let report = PreflightReport::run(&checks);
        assert!(report.has_errors());
        assert_eq!(report.errors().count(), 1);
        assert_eq!(report.worst_status(), ProbeStatus::Error);
        assert!(!PreflightReport::default().has_errors());
    }

    #[test]
    fn test_collect_system_info() {
        let info = SystemInfo::collect();
        assert!(!info.arch.is_empty());
        assert!(info.total_memory_gb > 0);
    }
}
