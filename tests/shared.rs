#![allow(dead_code)]

use hangwatch::command::{CommandBuilder, FixedCommandFactory};
use hangwatch::config::{DiagnosisConfig, MonitorConfig, RecoveryConfig, TerminationConfig};
use hangwatch::process::CommandOutput;
use hangwatch::resources::UnavailableSampler;
use hangwatch::runtime::{ContainerRuntime, PruneTarget};
use hangwatch::{Supervisor, SupervisorConfig};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

pub fn sh(script: &str) -> CommandBuilder {
    let mut builder = CommandBuilder::new("sh");
    builder.arg("-c").arg(script);
    builder
}

/// Container runtime answering every call the same way, counting calls.
#[derive(Default)]
pub struct StaticRuntime {
    pub reachable: bool,
    pub calls: AtomicUsize,
}

impl StaticRuntime {
    pub fn healthy() -> Self {
        Self {
            reachable: true,
            ..Default::default()
        }
    }

    pub fn broken() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self) -> CommandOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.reachable {
            CommandOutput {
                argv: vec!["docker".into()],
                exit_code: Some(0),
                elapsed: Duration::from_millis(5),
                ..Default::default()
            }
        } else {
            CommandOutput {
                argv: vec!["docker".into()],
                exit_code: Some(1),
                stderr: "Cannot connect to the Docker daemon at unix:///var/run/docker.sock".into(),
                elapsed: Duration::from_millis(5),
                ..Default::default()
            }
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
        self.answer()
    }

    fn info(&self, _: Duration) -> CommandOutput {
        self.answer()
    }

    fn version(&self, _: Duration) -> CommandOutput {
        self.answer()
    }

    fn list_containers(&self, _: Duration) -> CommandOutput {
        self.answer()
    }

    fn restart_service(&self, _: Duration) -> CommandOutput {
        self.answer()
    }

    fn fix_socket_permissions(&self, _: Duration) -> CommandOutput {
        self.answer()
    }

    fn stop_containers(&self, _: &str, _: Duration) -> CommandOutput {
        self.answer()
    }

    fn prune(&self, _: PruneTarget, _: Duration) -> CommandOutput {
        self.answer()
    }

    fn run_script(&self, _: &str, _: &Path, _: &str, _: Duration) -> CommandOutput {
        self.answer()
    }
}

/// Quick ticks and short termination waits, with the given staged timeouts.
pub fn monitor_config(warning: Duration, escalation: Duration, final_timeout: Duration) -> MonitorConfig {
    MonitorConfig {
        poll_interval: Duration::from_millis(50),
        echo_output: false,
        termination: TerminationConfig {
            graceful_wait: Duration::from_secs(1),
            group_wait: Duration::from_millis(500),
            kill_wait: Duration::from_secs(1),
        },
        ..MonitorConfig::with_timeouts(warning, escalation, final_timeout)
    }
}

pub fn supervisor_config() -> SupervisorConfig {
    SupervisorConfig {
        monitor: monitor_config(
            Duration::from_secs(2),
            Duration::from_secs(3),
            Duration::from_secs(4),
        ),
        diagnosis: DiagnosisConfig {
            required_binaries: vec!["sh".into()],
            runtime_socket: None,
            ..Default::default()
        },
        recovery: RecoveryConfig {
            reconnect_settle: Duration::ZERO,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn supervisor(
    config: SupervisorConfig,
    runtime: Arc<StaticRuntime>,
    script: &str,
) -> hangwatch::supervisor::SupervisorBuilder {
    Supervisor::builder(config)
        .sampler(Arc::new(UnavailableSampler))
        .runtime(runtime)
        .command_factory(FixedCommandFactory::new(vec![
            "sh".into(),
            "-c".into(),
            script.into(),
        ]))
        .preflight_checks(vec![])
}
