//! One detector per [`HangupKind`]. Detectors never fail: a probe that errors or times out is
//! itself evidence, and missing capabilities yield no issue at all.

use super::issue::{HangupIssue, HangupKind, Severity};
use crate::config::DiagnosisConfig;
use crate::monitor::MEMORY_EXHAUSTION_PERCENT;
use crate::preflight::{
    BINARIES_PRESENT_CHECK, ProbeResult, ProbeStatus, RUNTIME_REACHABLE_CHECK,
    SOCKET_PERMISSIONS_CHECK,
};
use crate::process::CommandOutput;
use crate::resources::{ResourceSampler, SystemResources};
use crate::runtime::ContainerRuntime;
use crate::tracer::{ExecutionTrace, SpanStatus, Stage, seconds_between};
use chrono::Utc;
use nix::unistd::{AccessFlags, access};
use serde_json::json;
use std::sync::OnceLock;

/// Trace metadata key under which the facade stores the deadlock indicators of the run.
pub const DEADLOCK_INDICATORS_KEY: &str = "deadlock_indicators";

/// Root filesystem free space below which the runtime is likely to stall.
const LOW_DISK_MB: u64 = 1024;

/// Inputs shared by every detector. Probe results are computed at most once per analysis.
pub struct DiagnosisContext<'a> {
    pub config: &'a DiagnosisConfig,
    pub runtime: &'a dyn ContainerRuntime,
    pub sampler: &'a dyn ResourceSampler,
    pub trace: Option<&'a ExecutionTrace>,
    pub probes: &'a [ProbeResult],
    pub container_filter: &'a str,
    ping: OnceLock<CommandOutput>,
    system: OnceLock<Option<SystemResources>>,
}

impl<'a> DiagnosisContext<'a> {
    pub fn new(
        config: &'a DiagnosisConfig,
        runtime: &'a dyn ContainerRuntime,
        sampler: &'a dyn ResourceSampler,
        trace: Option<&'a ExecutionTrace>,
        probes: &'a [ProbeResult],
        container_filter: &'a str,
    ) -> Self {
        Self {
            config,
            runtime,
            sampler,
            trace,
            probes,
            container_filter,
            ping: OnceLock::new(),
            system: OnceLock::new(),
        }
    }

    pub fn ping(&self) -> &CommandOutput {
        self.ping
            .get_or_init(|| self.runtime.ping(self.config.probe_timeout))
    }

    pub fn system(&self) -> Option<&SystemResources> {
        self.system
            .get_or_init(|| self.sampler.system_snapshot())
            .as_ref()
    }

    fn permission_denied(&self) -> bool {
        self.ping()
            .combined_lowercase()
            .contains("permission denied")
    }
}

pub type Detector = fn(&DiagnosisContext) -> Vec<HangupIssue>;

/// Every detector, in the order they run.
pub const DETECTORS: &[(HangupKind, Detector)] = &[
    (HangupKind::MissingDependency, detect_missing_dependencies),
    (HangupKind::RuntimeUnavailable, detect_runtime_unavailable),
    (HangupKind::RuntimeUnresponsive, detect_runtime_unresponsive),
    (HangupKind::PermissionDenied, detect_permission_issues),
    (HangupKind::StaleHeartbeat, detect_stale_heartbeat),
    (HangupKind::ExternalOperationStuck, detect_stuck_external_operations),
    (HangupKind::ProcessStall, detect_process_stall),
    (HangupKind::ResourceExhaustion, detect_resource_exhaustion),
    (HangupKind::OrphanedContainers, detect_orphaned_containers),
    (HangupKind::EnvironmentCheckFailed, detect_failed_environment_checks),
];

pub fn detect_missing_dependencies(context: &DiagnosisContext) -> Vec<HangupIssue> {
    let missing = context
        .config
        .required_binaries
        .iter()
        .filter(|binary| which::which(binary.as_str()).is_err())
        .cloned()
        .collect::<Vec<_>>();
    if missing.is_empty() {
        return vec![];
    }
    vec![
        HangupIssue::new(
            HangupKind::MissingDependency,
            Severity::Critical,
            0.95,
            format!("Required tools missing: {}", missing.join(", ")),
        )
        .describe("Some binaries the workload depends on cannot be found in PATH")
        .root_cause("The job runner or the container runtime CLI is not installed")
        .evidence("missing", missing.clone())
        .evidence("path", std::env::var("PATH").unwrap_or_default())
        .recommend(
            missing
                .iter()
                .map(|binary| format!("Install `{binary}` and make sure it is in PATH")),
        )
        .fix(missing.iter().map(|binary| format!("which {binary}"))),
    ]
}

pub fn detect_runtime_unavailable(context: &DiagnosisContext) -> Vec<HangupIssue> {
    let runtime = context.runtime.name();
    if let Some(socket) = context.runtime.socket_path() {
        if !socket.exists() {
            return vec![
                HangupIssue::new(
                    HangupKind::RuntimeUnavailable,
                    Severity::Critical,
                    0.95,
                    format!("{runtime} socket is missing"),
                )
                .describe(format!("{} does not exist", socket.display()))
                .root_cause(format!("The {runtime} daemon is not running"))
                .evidence("socket", socket.display().to_string())
                .recommend([format!("Start the {runtime} daemon")])
                .fix([
                    format!("sudo systemctl start {runtime}"),
                    format!("ls -l {}", socket.display()),
                ]),
            ];
        }
    }

    let ping = context.ping();
    // Spawn failures belong to missing dependencies, timeouts to unresponsiveness
    if ping.success() || ping.timed_out || ping.error.is_some() || context.permission_denied() {
        return vec![];
    }
    vec![
        HangupIssue::new(
            HangupKind::RuntimeUnavailable,
            Severity::Critical,
            0.90,
            format!("{runtime} daemon is not reachable"),
        )
        .describe(ping.summary())
        .root_cause(format!(
            "The {runtime} CLI cannot talk to its daemon, every container step will block or fail"
        ))
        .evidence("command", ping.argv.join(" "))
        .evidence("exit_code", ping.exit_code)
        .evidence("stderr", ping.stderr.trim())
        .recommend([
            format!("Restart the {runtime} daemon"),
            format!("Check `{runtime} info` for errors"),
        ])
        .fix([
            format!("sudo systemctl restart {runtime}"),
            format!("{runtime} info"),
        ]),
    ]
}

pub fn detect_runtime_unresponsive(context: &DiagnosisContext) -> Vec<HangupIssue> {
    let runtime = context.runtime.name();
    let ping = context.ping();
    let elapsed = ping.elapsed.as_secs_f64();

    if ping.timed_out {
        return vec![
            HangupIssue::new(
                HangupKind::RuntimeUnresponsive,
                Severity::Critical,
                0.90,
                format!("{runtime} daemon does not answer"),
            )
            .describe(format!(
                "`{}` did not return within {:.0}s",
                ping.argv.join(" "),
                context.config.probe_timeout.as_secs_f64()
            ))
            .root_cause(format!(
                "The {runtime} daemon is hung, calls made by the workload block forever"
            ))
            .evidence("elapsed_secs", elapsed)
            .evidence("timeout_secs", context.config.probe_timeout.as_secs_f64())
            .recommend([
                format!("Restart the {runtime} daemon"),
                "Look for stuck containers holding daemon locks".to_string(),
            ])
            .fix([format!("sudo systemctl restart {runtime}")]),
        ];
    }

    if ping.success() && ping.elapsed > context.config.slow_response_threshold {
        return vec![
            HangupIssue::new(
                HangupKind::RuntimeUnresponsive,
                Severity::Medium,
                0.80,
                format!("{runtime} daemon responds slowly"),
            )
            .describe(format!("The daemon answered in {elapsed:.1}s"))
            .root_cause("The daemon is overloaded, which can look like a hang under load")
            .evidence("elapsed_secs", elapsed)
            .evidence(
                "threshold_secs",
                context.config.slow_response_threshold.as_secs_f64(),
            )
            .recommend([
                "Reduce the number of concurrent containers",
                "Prune unused containers, networks and volumes",
            ])
            .fix([format!("{runtime} system prune --force")]),
        ];
    }
    vec![]
}

pub fn detect_permission_issues(context: &DiagnosisContext) -> Vec<HangupIssue> {
    let runtime = context.runtime.name();
    if context.permission_denied() {
        return vec![
            HangupIssue::new(
                HangupKind::PermissionDenied,
                Severity::High,
                0.90,
                format!("Permission denied talking to the {runtime} daemon"),
            )
            .describe(context.ping().summary())
            .root_cause("The current user may not access the runtime socket")
            .evidence("stderr", context.ping().stderr.trim())
            .recommend([
                format!("Add the current user to the {runtime} group and log in again"),
            ])
            .fix([format!("sudo usermod -aG {runtime} $USER")]),
        ];
    }

    let Some(socket) = context.runtime.socket_path() else {
        return vec![];
    };
    if !socket.exists() {
        return vec![];
    }
    match access(socket, AccessFlags::R_OK | AccessFlags::W_OK) {
        Ok(()) => vec![],
        Err(e) => vec![
            HangupIssue::new(
                HangupKind::PermissionDenied,
                Severity::High,
                0.85,
                format!("{} is not accessible", socket.display()),
            )
            .describe(format!("access(2) on the socket failed: {e}"))
            .root_cause("The current user may not access the runtime socket")
            .evidence("socket", socket.display().to_string())
            .evidence("errno", e.to_string())
            .recommend([format!("Add the current user to the {runtime} group")])
            .fix([
                format!("sudo usermod -aG {runtime} $USER"),
                format!("sudo chmod 666 {}", socket.display()),
            ]),
        ],
    }
}

pub fn detect_stale_heartbeat(context: &DiagnosisContext) -> Vec<HangupIssue> {
    let Some(trace) = context.trace else {
        return vec![];
    };
    let end = trace.ended_at.unwrap_or_else(Utc::now);
    let threshold = context.config.stale_heartbeat_threshold.as_secs_f64();

    let (silence, confidence, reference) = match trace.last_heartbeat {
        Some(heartbeat) => (seconds_between(heartbeat, end), 0.85, "last heartbeat"),
        // No heartbeat at all is weaker evidence, the run may simply have produced no output
        None => (seconds_between(trace.started_at, end), 0.75, "trace start"),
    };
    if silence <= threshold {
        return vec![];
    }

    let mut issue = HangupIssue::new(
        HangupKind::StaleHeartbeat,
        Severity::High,
        confidence,
        "Workload stopped making progress",
    )
    .describe(format!(
        "{silence:.0}s elapsed since the {reference} during stage {}",
        trace.current_stage
    ))
    .root_cause("The workload is blocked, waiting on something that never answers")
    .evidence("silence_secs", silence)
    .evidence("threshold_secs", threshold)
    .evidence("stage", trace.current_stage.to_string())
    .recommend([
        "Inspect the last lines of the workload output for the step that hangs",
        "Run the failing step alone with verbose logging",
    ]);
    if let Some(hang_point) = &trace.hang_point {
        issue = issue.evidence("hang_point", json!(hang_point));
    }
    vec![issue]
}

pub fn detect_stuck_external_operations(context: &DiagnosisContext) -> Vec<HangupIssue> {
    let Some(trace) = context.trace else {
        return vec![];
    };
    let now = Utc::now();
    let threshold = context.config.slow_response_threshold.as_secs_f64();
    let finished = trace.ended_at.is_some();

    let mut issues = vec![];
    for operation in &trace.external_operations {
        let (confidence, description) = match operation.status {
            // In a finished trace an open span never returned
            SpanStatus::Running if finished => (0.85, "never returned".to_string()),
            SpanStatus::Running => {
                let open_for = seconds_between(operation.started_at, now);
                if open_for <= threshold {
                    continue;
                }
                (0.85, format!("still running after {open_for:.0}s"))
            }
            SpanStatus::TimedOut => (0.80, "timed out".to_string()),
            _ => continue,
        };
        issues.push(
            HangupIssue::new(
                HangupKind::ExternalOperationStuck,
                Severity::High,
                confidence,
                format!("{} call hung", operation.kind),
            )
            .describe(format!("`{}` {description}", operation.argv.join(" ")))
            .root_cause("An external subsystem the run depends on stopped answering")
            .evidence("argv", operation.argv.clone())
            .evidence("started_at", operation.started_at.to_rfc3339())
            .evidence("status", json!(operation.status))
            .recommend(["Check the health of the container runtime"]),
        );
    }
    issues
}

pub fn detect_process_stall(context: &DiagnosisContext) -> Vec<HangupIssue> {
    let Some(trace) = context.trace else {
        return vec![];
    };
    let indicators = trace
        .metadata
        .get(DEADLOCK_INDICATORS_KEY)
        .and_then(|value| value.as_array())
        .filter(|indicators| !indicators.is_empty());

    if let Some(indicators) = indicators {
        let kinds = indicators
            .iter()
            .filter_map(|indicator| indicator.get("kind").and_then(|kind| kind.as_str()))
            .collect::<Vec<_>>();
        return vec![
            HangupIssue::new(
                HangupKind::ProcessStall,
                Severity::High,
                0.90,
                "Workload deadlocked",
            )
            .describe(format!("Deadlock indicators: {}", kinds.join(", ")))
            .root_cause("The workload or one of its streams stopped while the process stayed alive")
            .evidence("indicators", serde_json::Value::Array(indicators.clone()))
            .recommend([
                "Look for steps waiting on stdin, a lock or a network resource",
                "Lower the activity timeout to catch the stall earlier",
            ]),
        ];
    }

    if trace.current_stage == Stage::TimedOut {
        return vec![
            HangupIssue::new(
                HangupKind::ProcessStall,
                Severity::High,
                0.75,
                "Workload hit its final timeout",
            )
            .describe("The run was still going when the final timeout expired")
            .root_cause("The workload is either stuck or much slower than the configured timeouts")
            .evidence("stages", json!(trace.stages))
            .recommend(["Compare the run duration with previous successful runs"]),
        ];
    }
    vec![]
}

pub fn detect_resource_exhaustion(context: &DiagnosisContext) -> Vec<HangupIssue> {
    let mut issues = vec![];
    if let Some(system) = context.system() {
        if system.memory_percent > MEMORY_EXHAUSTION_PERCENT {
            issues.push(
                HangupIssue::new(
                    HangupKind::ResourceExhaustion,
                    Severity::Critical,
                    0.85,
                    "System memory is exhausted",
                )
                .describe(format!(
                    "{:.1}% of memory in use, {} MB available",
                    system.memory_percent, system.available_memory_mb
                ))
                .root_cause("Processes are swapping or waiting on the OOM killer")
                .evidence("memory_percent", system.memory_percent)
                .evidence("available_memory_mb", system.available_memory_mb)
                .recommend(["Stop unused containers", "Run on a machine with more memory"])
                .fix(["docker stats --no-stream"]),
            );
        }
        if let Some(available) = system.root_disk_available_mb {
            if available < LOW_DISK_MB {
                issues.push(
                    HangupIssue::new(
                        HangupKind::ResourceExhaustion,
                        Severity::High,
                        0.80,
                        "Root filesystem is almost full",
                    )
                    .describe(format!("{available} MB left on /"))
                    .root_cause("Image pulls and container writes block on a full disk")
                    .evidence("root_disk_available_mb", available)
                    .recommend(["Remove unused images and volumes"])
                    .fix(["docker system prune --all --force", "df -h /"]),
                );
            }
        }
    }

    if issues.is_empty() {
        let sample = context
            .trace
            .and_then(|trace| trace.latest_resource_usage())
            .filter(|usage| usage.memory_percent > MEMORY_EXHAUSTION_PERCENT);
        if let Some(usage) = sample {
            issues.push(
                HangupIssue::new(
                    HangupKind::ResourceExhaustion,
                    Severity::High,
                    0.80,
                    "Workload uses most of the system memory",
                )
                .describe(format!(
                    "Process {} used {:.1}% of memory ({:.0} MB)",
                    usage.pid, usage.memory_percent, usage.memory_mb
                ))
                .root_cause("The workload itself is running out of memory")
                .evidence("sample", json!(usage))
                .recommend(["Profile the memory usage of the failing step"]),
            );
        }
    }
    issues
}

pub fn detect_orphaned_containers(context: &DiagnosisContext) -> Vec<HangupIssue> {
    // Listing a dead daemon would only wait for another timeout
    if !context.ping().success() || context.container_filter.is_empty() {
        return vec![];
    }
    let listing = context.runtime.list_containers(context.config.probe_timeout);
    if !listing.success() {
        return vec![];
    }
    let leftovers = listing
        .stdout
        .lines()
        .filter(|line| line.contains(context.container_filter))
        .map(str::to_string)
        .collect::<Vec<_>>();
    if leftovers.is_empty() {
        return vec![];
    }
    vec![
        HangupIssue::new(
            HangupKind::OrphanedContainers,
            Severity::Medium,
            0.70,
            format!("{} leftover workload containers", leftovers.len()),
        )
        .describe(format!(
            "Containers matching `{}` from previous runs are still present",
            context.container_filter
        ))
        .root_cause("Stale containers hold names, ports or volumes a new run needs")
        .evidence("containers", leftovers)
        .recommend(["Remove the leftover containers before re-running"])
        .fix([
            format!(
                "docker ps -aq --filter name={} | xargs -r docker rm -f",
                context.container_filter
            ),
            "docker container prune --force".to_string(),
        ]),
    ]
}

/// Failed pre-flight checks that no dedicated detector covers.
pub fn detect_failed_environment_checks(context: &DiagnosisContext) -> Vec<HangupIssue> {
    const COVERED: &[&str] = &[
        RUNTIME_REACHABLE_CHECK,
        BINARIES_PRESENT_CHECK,
        SOCKET_PERMISSIONS_CHECK,
    ];
    context
        .probes
        .iter()
        .filter(|probe| !COVERED.contains(&probe.name.as_str()))
        .filter_map(|probe| {
            let (severity, confidence) = match probe.status {
                ProbeStatus::Ok => return None,
                ProbeStatus::Warning => (Severity::Low, 0.55),
                ProbeStatus::Error => (Severity::High, 0.75),
            };
            Some(
                HangupIssue::new(
                    HangupKind::EnvironmentCheckFailed,
                    severity,
                    confidence,
                    format!("Check `{}` reported {}", probe.name, probe.status),
                )
                .describe(probe.message.clone())
                .root_cause("The environment does not meet the workload requirements")
                .evidence("probe", json!(probe))
                .recommend(probe.recommendations.clone()),
            )
        })
        .collect()
}
