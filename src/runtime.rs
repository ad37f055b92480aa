//! Container runtime collaborator.
//!
//! Diagnosis probes it and recovery restarts, repairs and prunes it. Every call is bounded by an
//! explicit timeout and reports a [`CommandOutput`] instead of failing.

use crate::command::CommandBuilder;
use crate::prelude::*;
use crate::process::{CommandOutput, run_bounded, wrap_with_sudo};
use crate::tracer::{ExecutionTracer, SpanStatus};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneTarget {
    Containers,
    Networks,
    Volumes,
    /// System-wide prune, the most invasive one.
    System,
}

impl PruneTarget {
    pub fn as_str(self) -> &'static str {
        match self {
            PruneTarget::Containers => "containers",
            PruneTarget::Networks => "networks",
            PruneTarget::Volumes => "volumes",
            PruneTarget::System => "system",
        }
    }
}

pub trait ContainerRuntime: Send + Sync {
    /// Human readable name, used in issue titles and logs.
    fn name(&self) -> &str;

    fn socket_path(&self) -> Option<&Path>;

    /// Cheap reachability probe.
    fn ping(&self, timeout: Duration) -> CommandOutput;

    /// Full runtime information, slower than [`ContainerRuntime::ping`].
    fn info(&self, timeout: Duration) -> CommandOutput;

    fn version(&self, timeout: Duration) -> CommandOutput;

    fn list_containers(&self, timeout: Duration) -> CommandOutput;

    fn restart_service(&self, timeout: Duration) -> CommandOutput;

    fn fix_socket_permissions(&self, timeout: Duration) -> CommandOutput;

    /// Stop every running container whose name contains `name_filter`.
    fn stop_containers(&self, name_filter: &str, timeout: Duration) -> CommandOutput;

    fn prune(&self, target: PruneTarget, timeout: Duration) -> CommandOutput;

    /// Run `script` with `sh -c` inside a throwaway container of `image`, with `workdir` mounted.
    fn run_script(&self, image: &str, workdir: &Path, script: &str, timeout: Duration)
    -> CommandOutput;
}

/// [`ContainerRuntime`] driving the `docker` CLI.
pub struct DockerCli {
    binary: String,
    socket: Option<PathBuf>,
    tracer: Option<Arc<ExecutionTracer>>,
}

impl DockerCli {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self {
            binary: "docker".into(),
            socket,
            tracer: None,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Record every call as an external operation of the tracer's active trace.
    pub fn with_tracer(mut self, tracer: Arc<ExecutionTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    fn docker<I, S>(&self, args: I) -> CommandBuilder
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut builder = CommandBuilder::new(&self.binary);
        builder.args(args);
        builder
    }

    fn run(&self, kind: &str, builder: &CommandBuilder, timeout: Duration) -> CommandOutput {
        let span = self
            .tracer
            .as_ref()
            .and_then(|tracer| tracer.trace_external_operation(kind, &builder.argv()));

        let output = run_bounded(builder, timeout);

        if let (Some(tracer), Some(span)) = (&self.tracer, span) {
            let status = if output.timed_out {
                SpanStatus::TimedOut
            } else if output.success() {
                SpanStatus::Succeeded
            } else {
                SpanStatus::Failed
            };
            let error = (!output.success()).then(|| output.summary());
            tracer.update_external_operation(
                span,
                status,
                output.exit_code,
                &format!("{}{}", output.stdout, output.stderr),
                error,
            );
        }
        if !output.success() {
            debug!("{} {kind} failed: {}", self.binary, output.summary());
        }
        output
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new(Some(PathBuf::from("/var/run/docker.sock")))
    }
}

impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    fn socket_path(&self) -> Option<&Path> {
        self.socket.as_deref()
    }

    fn ping(&self, timeout: Duration) -> CommandOutput {
        let builder = self.docker(["version", "--format", "{{.Server.Version}}"]);
        self.run("ping", &builder, timeout)
    }

    fn info(&self, timeout: Duration) -> CommandOutput {
        let builder = self.docker(["info", "--format", "{{json .}}"]);
        self.run("info", &builder, timeout)
    }

    fn version(&self, timeout: Duration) -> CommandOutput {
        let builder = self.docker(["version", "--format", "{{json .}}"]);
        self.run("version", &builder, timeout)
    }

    fn list_containers(&self, timeout: Duration) -> CommandOutput {
        let builder = self.docker([
            "ps",
            "--all",
            "--format",
            "{{.ID}} {{.Names}} {{.Status}}",
        ]);
        self.run("list-containers", &builder, timeout)
    }

    fn restart_service(&self, timeout: Duration) -> CommandOutput {
        let mut builder = CommandBuilder::new("systemctl");
        builder.args(["restart", "docker"]);
        self.run("restart-service", &wrap_with_sudo(builder), timeout)
    }

    fn fix_socket_permissions(&self, timeout: Duration) -> CommandOutput {
        let Some(socket) = &self.socket else {
            return CommandOutput {
                error: Some("no runtime socket configured".into()),
                ..Default::default()
            };
        };
        let mut builder = CommandBuilder::new("chmod");
        builder.arg("666").arg(socket);
        self.run("fix-socket-permissions", &wrap_with_sudo(builder), timeout)
    }

    fn stop_containers(&self, name_filter: &str, timeout: Duration) -> CommandOutput {
        // `docker ps -q` piped into `docker stop`, without failing when nothing matches
        let script = format!(
            "ids=$({binary} ps -q --filter name={filter}); [ -z \"$ids\" ] || {binary} stop $ids",
            binary = shell_words::quote(&self.binary),
            filter = shell_words::quote(name_filter),
        );
        let mut builder = CommandBuilder::new("sh");
        builder.arg("-c").arg(script);
        self.run("stop-containers", &builder, timeout)
    }

    fn prune(&self, target: PruneTarget, timeout: Duration) -> CommandOutput {
        let builder = match target {
            PruneTarget::Containers => self.docker(["container", "prune", "--force"]),
            PruneTarget::Networks => self.docker(["network", "prune", "--force"]),
            PruneTarget::Volumes => self.docker(["volume", "prune", "--force"]),
            PruneTarget::System => self.docker(["system", "prune", "--force"]),
        };
        self.run(&format!("prune-{}", target.as_str()), &builder, timeout)
    }

    fn run_script(
        &self,
        image: &str,
        workdir: &Path,
        script: &str,
        timeout: Duration,
    ) -> CommandOutput {
        let mut builder = self.docker(["run", "--rm", "-v"]);
        builder
            .arg(format!("{}:/workspace", workdir.display()))
            .args(["-w", "/workspace", image, "sh", "-c", script]);
        self.run("run-script", &builder, timeout)
    }
}
