use super::issue::{HangupAnalysis, HangupKind};
use crate::preflight::SystemInfo;
use crate::runtime::ContainerRuntime;
use crate::tracer::ExecutionTrace;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Environment variables worth shipping in a report. Anything else may hold secrets.
const ENV_ALLOW_LIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "LANG",
    "CI",
    "GITHUB_ACTIONS",
    "RUNNER_OS",
    "DOCKER_HOST",
    "DOCKER_CONTEXT",
    "ACT",
    "HANGWATCH_LOG",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSnapshot {
    pub system: SystemInfo,
    pub env_vars: BTreeMap<String, String>,
    pub working_dir: Option<String>,
}

impl EnvironmentSnapshot {
    pub fn collect() -> Self {
        let env_vars = ENV_ALLOW_LIST
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
            .collect();
        Self {
            system: SystemInfo::collect(),
            env_vars,
            working_dir: std::env::current_dir()
                .ok()
                .map(|dir| dir.display().to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeStatus {
    pub name: String,
    pub reachable: bool,
    pub version: Option<String>,
    /// Raw `info` output, only queried when the runtime answered the version probe.
    pub info: Option<String>,
    pub error: Option<String>,
}

impl RuntimeStatus {
    pub fn collect(runtime: &dyn ContainerRuntime, timeout: Duration) -> Self {
        let version = runtime.version(timeout);
        let mut status = RuntimeStatus {
            name: runtime.name().to_string(),
            reachable: version.success(),
            ..Default::default()
        };
        if !version.success() {
            status.error = Some(version.summary());
            return status;
        }
        status.version = Some(version.stdout.trim().to_string());

        let info = runtime.info(timeout);
        if info.success() {
            status.info = Some(info.stdout);
        } else {
            status.error = Some(info.summary());
        }
        status
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolStatus {
    pub name: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TroubleshootingSection {
    pub title: String,
    pub steps: Vec<String>,
}

/// Everything known about a failed run, in a shareable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub report_id: String,
    pub generated_at: DateTime<Utc>,
    pub hangwatch_version: String,
    pub analysis: Option<HangupAnalysis>,
    pub environment: EnvironmentSnapshot,
    pub runtime_status: RuntimeStatus,
    pub tools: Vec<ToolStatus>,
    pub troubleshooting: Vec<TroubleshootingSection>,
    pub next_steps: Vec<String>,
    pub trace: Option<ExecutionTrace>,
}

impl ErrorReport {
    pub fn analysis_id(&self) -> Option<&str> {
        self.analysis
            .as_ref()
            .map(|analysis| analysis.analysis_id.as_str())
    }

    pub fn primary_cause_title(&self) -> Option<&str> {
        self.analysis
            .as_ref()
            .and_then(|analysis| analysis.primary_cause.as_ref())
            .map(|issue| issue.title.as_str())
    }
}

pub(super) fn tool_statuses(binaries: &[String]) -> Vec<ToolStatus> {
    binaries
        .iter()
        .map(|name| ToolStatus {
            name: name.clone(),
            path: which::which(name)
                .ok()
                .map(|path| path.display().to_string()),
        })
        .collect()
}

fn section(title: &str, steps: &[&str]) -> TroubleshootingSection {
    TroubleshootingSection {
        title: title.to_string(),
        steps: steps.iter().map(|step| step.to_string()).collect(),
    }
}

pub(super) fn troubleshooting_outline() -> Vec<TroubleshootingSection> {
    vec![
        section(
            "Container runtime",
            &[
                "Check that the daemon is running: `systemctl status docker`",
                "Check that the CLI reaches it: `docker info`",
                "Restart it if calls hang: `sudo systemctl restart docker`",
            ],
        ),
        section(
            "Permissions",
            &[
                "Check the socket owner: `ls -l /var/run/docker.sock`",
                "Add the user to the docker group: `sudo usermod -aG docker $USER`",
            ],
        ),
        section(
            "Workload",
            &[
                "Re-run the failing job alone: `act -j <job> -v`",
                "Look for steps reading stdin or waiting on the network",
                "Remove leftover containers: `docker ps -a --filter name=act-`",
            ],
        ),
        section(
            "Resources",
            &[
                "Check free memory: `free -m`",
                "Check free disk space: `df -h`",
                "Reclaim space: `docker system prune`",
            ],
        ),
    ]
}

pub(super) fn next_steps(analysis: Option<&HangupAnalysis>) -> Vec<String> {
    let Some(analysis) = analysis else {
        return vec![
            "Run `hangwatch diagnose` to analyze the environment".to_string(),
            "Re-run the workload with HANGWATCH_LOG=debug".to_string(),
        ];
    };
    let Some(primary) = &analysis.primary_cause else {
        return vec![
            "No cause passed the confidence threshold, re-run with HANGWATCH_LOG=debug".to_string(),
            "Attach the debug bundle to the bug report".to_string(),
        ];
    };

    let mut steps = primary
        .fix_commands
        .iter()
        .map(|command| format!("Run `{command}`"))
        .collect::<Vec<_>>();
    steps.extend(primary.recommendations.iter().cloned());
    if analysis.issues.len() > 1 {
        steps.push(format!(
            "Then address the {} other detected issue(s)",
            analysis.issues.len() - 1
        ));
    }
    if primary.kind != HangupKind::EnvironmentCheckFailed {
        steps.push("Re-run with `--auto-recovery` once the cause is fixed".to_string());
    }
    steps
}
