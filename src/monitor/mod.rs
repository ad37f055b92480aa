//! Staged-timeout supervision of one workload process.
//!
//! The watch loop polls the process on a fixed tick and moves through
//! `Running -> WarningIssued -> EscalationIssued` as wall-clock time crosses the configured
//! thresholds, until the process exits, the final timeout is hit or a deadlock indicator shows up.
//! Readers, the deadlock watch and the tracer sampler run on their own threads and are all
//! joined, with a bound, before [`ProcessMonitor::supervise`] returns.

mod deadlock;
mod process;
mod stream;

pub use deadlock::{
    DeadlockIndicator, IndicatorKind, MEMORY_EXHAUSTION_PERCENT, WatchContext,
    detect_deadlock_conditions,
};
pub use process::{MonitoredProcess, ReleasedProcess};
pub use stream::{ProcessActivity, StreamKind, StreamStats};

use crate::command::CommandBuilder;
use crate::config::MonitorConfig;
use crate::prelude::*;
use crate::process::{ExitInfo, TerminationReport};
use crate::resources::{ChildProcessInfo, ResourceSampler, ResourceUsage};
use crate::tracer::{ExecutionTracer, ProcessUpdate, SpanStatus, Stage};
use chrono::{DateTime, Utc};
use deadlock::DeadlockWatch;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::ExitStatus;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Indicators attached to an escalation diagnostic.
const RECENT_INDICATORS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MonitorState {
    Running,
    WarningIssued,
    EscalationIssued,
    Completed,
    TerminatedByTimeout,
    DeadlockConfirmed,
    /// The process could not be waited on anymore.
    WaitFailed,
}

impl MonitorState {
    pub fn is_final(self) -> bool {
        !matches!(
            self,
            MonitorState::Running | MonitorState::WarningIssued | MonitorState::EscalationIssued
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DiagnosticStage {
    Warning,
    Escalation,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub reader_alive: bool,
    pub bytes: u64,
    pub lines: u64,
}

impl StreamSnapshot {
    fn of(stats: &StreamStats) -> Self {
        Self {
            reader_alive: stats.reader_alive(),
            bytes: stats.bytes(),
            lines: stats.lines(),
        }
    }
}

/// Snapshot emitted when the run crosses a staged threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDiagnostic {
    pub stage: DiagnosticStage,
    pub emitted_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub message: String,
    pub stdout: StreamSnapshot,
    pub stderr: StreamSnapshot,
    pub silence_secs: f64,
    pub resource_usage: Option<ResourceUsage>,
    pub child_processes: Vec<ChildProcessInfo>,
    pub recent_indicators: Vec<DeadlockIndicator>,
}

/// Everything [`ProcessMonitor::supervise`] observed about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorOutcome {
    pub command: Vec<String>,
    pub pid: u32,
    pub state: MonitorState,
    pub exit: Option<ExitInfo>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub warning_issued: bool,
    pub escalation_issued: bool,
    pub force_killed: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub indicators: Vec<DeadlockIndicator>,
    pub diagnostics: Vec<StageDiagnostic>,
    pub termination: Option<TerminationReport>,
    pub error: Option<String>,
}

impl MonitorOutcome {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn possible_zombie(&self) -> bool {
        self.termination
            .as_ref()
            .is_some_and(TerminationReport::possible_zombie)
    }
}

struct WatchResult {
    state: MonitorState,
    exit: Option<ExitStatus>,
    warning_issued: bool,
    escalation_issued: bool,
    error: Option<String>,
}

pub struct ProcessMonitor {
    config: MonitorConfig,
    sampler: Arc<dyn ResourceSampler>,
    tracer: Option<Arc<ExecutionTracer>>,
}

impl ProcessMonitor {
    /// Fails on an invalid configuration, nothing else can fail later on.
    pub fn new(config: MonitorConfig, sampler: Arc<dyn ResourceSampler>) -> Result<Self> {
        config.validate().context("Invalid monitor configuration")?;
        Ok(Self {
            config,
            sampler,
            tracer: None,
        })
    }

    /// Record stages, the process span and the reader threads in `tracer`'s active trace.
    pub fn with_tracer(mut self, tracer: Arc<ExecutionTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    fn set_stage(&self, stage: Stage, metadata: Option<BTreeMap<String, serde_json::Value>>) {
        if let Some(tracer) = &self.tracer {
            tracer.set_stage(stage, metadata);
        }
    }

    /// Spawn `builder` and watch it until it exits, times out or deadlocks.
    ///
    /// Only a failure to spawn is an error; timeouts, deadlocks and termination problems are
    /// reported in the outcome.
    pub fn supervise(&self, builder: &CommandBuilder) -> Result<MonitorOutcome> {
        let argv = builder.argv();
        self.set_stage(
            Stage::ProcessCreation,
            Some(BTreeMap::from([(
                "command".to_string(),
                builder.as_command_line().into(),
            )])),
        );

        let mut process = match MonitoredProcess::spawn(
            builder,
            self.config.final_timeout,
            self.config.echo_output,
            self.tracer.clone(),
        ) {
            Ok(process) => process,
            Err(e) => {
                self.set_stage(Stage::Failed, None);
                return Err(e);
            }
        };
        let pid = process.pid();
        let span = self
            .tracer
            .as_ref()
            .and_then(|tracer| tracer.trace_process(&argv, Some(pid)));
        self.set_stage(
            Stage::OutputStreaming,
            Some(BTreeMap::from([("pid".to_string(), pid.into())])),
        );

        let watch = DeadlockWatch::spawn(
            WatchContext {
                pid,
                activity: Arc::clone(process.activity()),
                activity_timeout: self.config.activity_timeout,
                sampler: Arc::clone(&self.sampler),
                tracer: self.tracer.clone(),
            },
            self.config.deadlock_check_interval,
        )
        .inspect_err(|e| warn!("Deadlock detection disabled: {e:#}"))
        .ok();

        self.set_stage(Stage::ProcessMonitoring, None);
        let mut diagnostics = vec![];
        let result = self.watch_loop(&mut process, watch.as_ref(), &mut diagnostics);

        // Late indicators are kept as evidence but no longer change the outcome
        if let Some(watch) = watch {
            for indicator in watch.stop() {
                process.record_indicator(indicator);
            }
        }

        let mut termination = None;
        let mut exit = result.exit.map(ExitInfo::from);
        if result.exit.is_none() {
            let report = process.force_terminate(&self.config.termination);
            if report.possible_zombie() {
                diagnostics.push(self.diagnostic(
                    DiagnosticStage::Fatal,
                    &process,
                    format!(
                        "Process {pid} survived SIGKILL, possible zombie: {}",
                        report.steps.join(", ")
                    ),
                    false,
                ));
            }
            exit = report.exit;
            termination = Some(report);
        }

        self.set_stage(Stage::Cleanup, None);
        let duration = process.elapsed();
        let released = process.release(self.config.reader_join_timeout);

        let timed_out = matches!(
            result.state,
            MonitorState::TerminatedByTimeout | MonitorState::DeadlockConfirmed
        );
        let exit_code = exit.and_then(|exit| exit.code);
        let outcome = MonitorOutcome {
            command: argv,
            pid,
            state: result.state,
            exit,
            exit_code,
            timed_out,
            warning_issued: result.warning_issued,
            escalation_issued: result.escalation_issued,
            force_killed: released.force_killed,
            stdout: released.stdout,
            stderr: released.stderr,
            duration,
            indicators: released.indicators,
            diagnostics,
            termination,
            error: result.error,
        };

        if let (Some(tracer), Some(span)) = (&self.tracer, span) {
            let status = if outcome.timed_out {
                SpanStatus::TimedOut
            } else if outcome.success() {
                SpanStatus::Succeeded
            } else if outcome.force_killed {
                SpanStatus::Terminated
            } else {
                SpanStatus::Failed
            };
            tracer.update_process_trace(
                span,
                ProcessUpdate {
                    pid: None,
                    status: Some(status),
                    exit_code: outcome.exit_code,
                    error: outcome.error.clone(),
                },
            );
        }
        // A non-zero exit is a normal result, it only shows in the exit code
        self.set_stage(
            match outcome.state {
                _ if outcome.timed_out => Stage::TimedOut,
                MonitorState::Completed => Stage::Completed,
                _ => Stage::Failed,
            },
            None,
        );

        match outcome.state {
            MonitorState::Completed => info!(
                "Workload exited with {} after {:.1}s",
                outcome
                    .exit_code
                    .map_or("a signal".to_string(), |code| format!("code {code}")),
                duration.as_secs_f64()
            ),
            state => warn!(
                "Workload stopped in state {state:?} after {:.1}s",
                duration.as_secs_f64()
            ),
        }
        Ok(outcome)
    }

    fn watch_loop(
        &self,
        process: &mut MonitoredProcess,
        watch: Option<&DeadlockWatch>,
        diagnostics: &mut Vec<StageDiagnostic>,
    ) -> WatchResult {
        let config = &self.config;
        let mut result = WatchResult {
            state: MonitorState::Running,
            exit: None,
            warning_issued: false,
            escalation_issued: false,
            error: None,
        };
        let mut last_heartbeat = Instant::now();
        let mut heartbeat_bytes = 0;
        let mut last_resource_check = Instant::now();

        loop {
            // Exit wins over any pending indicator
            match process.try_wait() {
                Ok(Some(status)) => {
                    result.state = MonitorState::Completed;
                    result.exit = Some(status);
                    return result;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to wait for process {}: {e}", process.pid());
                    result.state = MonitorState::WaitFailed;
                    result.error = Some(format!("failed to wait for the process: {e}"));
                    return result;
                }
            }

            let new_indicators = watch
                .map(|watch| watch.drain())
                .unwrap_or_default()
                .into_iter()
                .filter(|indicator| process.record_indicator(indicator.clone()))
                .collect::<Vec<_>>();
            if let Some(indicator) = new_indicators.first() {
                error!(
                    "Deadlock confirmed for process {}: {} ({})",
                    process.pid(),
                    indicator.kind,
                    indicator.details
                );
                result.state = MonitorState::DeadlockConfirmed;
                return result;
            }

            let elapsed = process.elapsed();
            if elapsed >= config.final_timeout {
                error!(
                    "Workload exceeded the final timeout of {}, terminating it",
                    humantime::format_duration(config.final_timeout)
                );
                result.state = MonitorState::TerminatedByTimeout;
                return result;
            }

            if elapsed >= config.warning_timeout && !result.warning_issued {
                let diagnostic = self.diagnostic(
                    DiagnosticStage::Warning,
                    process,
                    format!(
                        "Workload still running after {}",
                        humantime::format_duration(config.warning_timeout)
                    ),
                    false,
                );
                warn!(
                    "{}: stdout reader alive={}, {} lines; stderr reader alive={}, {} lines; last output {:.0}s ago",
                    diagnostic.message,
                    diagnostic.stdout.reader_alive,
                    diagnostic.stdout.lines,
                    diagnostic.stderr.reader_alive,
                    diagnostic.stderr.lines,
                    diagnostic.silence_secs
                );
                diagnostics.push(diagnostic);
                result.warning_issued = true;
                result.state = MonitorState::WarningIssued;
            }

            if elapsed >= config.escalation_timeout && !result.escalation_issued {
                let diagnostic = self.diagnostic(
                    DiagnosticStage::Escalation,
                    process,
                    format!(
                        "Workload still running after {}, termination at {}",
                        humantime::format_duration(config.escalation_timeout),
                        humantime::format_duration(config.final_timeout)
                    ),
                    true,
                );
                error!(
                    "{}: {} child processes, memory {}",
                    diagnostic.message,
                    diagnostic.child_processes.len(),
                    diagnostic
                        .resource_usage
                        .as_ref()
                        .map_or("unknown".to_string(), |usage| format!(
                            "{:.1} MB",
                            usage.memory_mb
                        ))
                );
                diagnostics.push(diagnostic);
                result.escalation_issued = true;
                result.state = MonitorState::EscalationIssued;
            }

            if last_heartbeat.elapsed() >= config.heartbeat_interval {
                last_heartbeat = Instant::now();
                let bytes = process.activity().total_bytes();
                if bytes != heartbeat_bytes {
                    heartbeat_bytes = bytes;
                    self.heartbeat(process);
                }
            }

            if last_resource_check.elapsed() >= config.resource_check_interval {
                last_resource_check = Instant::now();
                if let Some(usage) = self.sampler.sample_process(process.pid()) {
                    trace!(
                        "Process {}: cpu {:.1}%, memory {:.1} MB",
                        usage.pid, usage.cpu_percent, usage.memory_mb
                    );
                }
            }

            let until_final = config.final_timeout.saturating_sub(process.elapsed());
            thread::sleep(config.poll_interval.min(until_final).max(Duration::from_millis(1)));
        }
    }

    fn heartbeat(&self, process: &MonitoredProcess) {
        let activity = process.activity();
        debug!(
            "Heartbeat: {} bytes of output after {:.0}s",
            activity.total_bytes(),
            process.elapsed().as_secs_f64()
        );
        if let Some(tracer) = &self.tracer {
            tracer.heartbeat(
                Some(&format!("{} bytes of output", activity.total_bytes())),
                Some(BTreeMap::from([
                    ("stdout_lines".to_string(), activity.stdout.lines().into()),
                    ("stderr_lines".to_string(), activity.stderr.lines().into()),
                ])),
            );
        }
    }

    fn diagnostic(
        &self,
        stage: DiagnosticStage,
        process: &MonitoredProcess,
        message: String,
        with_resources: bool,
    ) -> StageDiagnostic {
        let activity = process.activity();
        let (resource_usage, child_processes) = if with_resources {
            (
                self.sampler.sample_process(process.pid()),
                self.sampler.child_processes(process.pid()),
            )
        } else {
            (None, vec![])
        };
        let indicators = process.indicators();
        StageDiagnostic {
            stage,
            emitted_at: Utc::now(),
            elapsed_secs: process.elapsed().as_secs_f64(),
            message,
            stdout: StreamSnapshot::of(&activity.stdout),
            stderr: StreamSnapshot::of(&activity.stderr),
            silence_secs: activity.silence().as_secs_f64(),
            resource_usage,
            child_processes,
            recent_indicators: indicators[indicators.len().saturating_sub(RECENT_INDICATORS)..]
                .to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TerminationConfig, TracerConfig};
    use crate::resources::UnavailableSampler;

    fn sh(script: &str) -> CommandBuilder {
        let mut builder = CommandBuilder::new("sh");
        builder.arg("-c").arg(script);
        builder
    }

    fn fast_config(warning_ms: u64, escalation_ms: u64, final_ms: u64) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(20),
            heartbeat_interval: Duration::from_millis(50),
            echo_output: false,
            termination: TerminationConfig {
                graceful_wait: Duration::from_millis(500),
                group_wait: Duration::from_millis(300),
                kill_wait: Duration::from_millis(500),
            },
            ..MonitorConfig::with_timeouts(
                Duration::from_millis(warning_ms),
                Duration::from_millis(escalation_ms),
                Duration::from_millis(final_ms),
            )
        }
    }

    fn monitor(config: MonitorConfig) -> ProcessMonitor {
        ProcessMonitor::new(config, Arc::new(UnavailableSampler)).unwrap()
    }

    #[test]
    fn test_invalid_config_fails_at_construction() {
        let config = MonitorConfig::with_timeouts(
            Duration::from_secs(10),
            Duration::from_secs(5),
            Duration::from_secs(20),
        );
        assert!(ProcessMonitor::new(config, Arc::new(UnavailableSampler)).is_err());
    }

    #[test_log::test]
    fn test_quick_exit_fires_no_diagnostic() {
        let outcome = monitor(fast_config(2_000, 3_000, 4_000))
            .supervise(&sh("echo hello; exit 7"))
            .unwrap();
        assert_eq!(outcome.state, MonitorState::Completed);
        assert_eq!(outcome.exit_code, Some(7));
        assert!(!outcome.timed_out);
        assert!(!outcome.force_killed);
        assert!(!outcome.warning_issued);
        assert!(!outcome.escalation_issued);
        assert!(outcome.diagnostics.is_empty());
        assert_eq!(outcome.stdout, "hello\n");
        assert!(!outcome.success());
    }

    #[test_log::test]
    fn test_never_exiting_process_is_terminated() {
        let config = fast_config(200, 400, 700);
        let grace = config.termination.grace_period();
        let started = Instant::now();
        let outcome = monitor(config).supervise(&sh("exec sleep 30")).unwrap();

        assert!(started.elapsed() < Duration::from_millis(700) + grace + Duration::from_secs(1));
        assert_eq!(outcome.state, MonitorState::TerminatedByTimeout);
        assert!(outcome.timed_out);
        assert!(outcome.warning_issued);
        assert!(outcome.escalation_issued);
        assert!(outcome.force_killed);
        let stages = outcome
            .diagnostics
            .iter()
            .map(|d| d.stage)
            .collect::<Vec<_>>();
        assert_eq!(
            stages,
            vec![DiagnosticStage::Warning, DiagnosticStage::Escalation]
        );
        assert!(!outcome.possible_zombie());
    }

    #[test_log::test]
    fn test_silent_process_is_flagged_as_stalled() {
        let config = MonitorConfig {
            activity_timeout: Duration::from_millis(100),
            deadlock_check_interval: Duration::from_millis(50),
            ..fast_config(5_000, 6_000, 7_000)
        };
        let started = Instant::now();
        let outcome = monitor(config).supervise(&sh("exec sleep 30")).unwrap();

        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(outcome.state, MonitorState::DeadlockConfirmed);
        assert!(outcome.timed_out);
        assert!(outcome.force_killed);
        assert!(
            outcome
                .indicators
                .iter()
                .any(|i| i.kind == IndicatorKind::ProcessWaitStalled)
        );
    }

    #[test]
    fn test_closed_stdout_is_flagged() {
        let config = MonitorConfig {
            deadlock_check_interval: Duration::from_millis(100),
            ..fast_config(5_000, 6_000, 7_000)
        };
        let outcome = monitor(config)
            .supervise(&sh("exec >&- 2>&-; sleep 30"))
            .unwrap();
        assert_eq!(outcome.state, MonitorState::DeadlockConfirmed);
        assert!(
            outcome
                .indicators
                .iter()
                .any(|i| i.kind == IndicatorKind::StdoutStreamStalled)
        );
    }

    #[test]
    fn test_trace_follows_the_run() {
        let tracer = Arc::new(
            ExecutionTracer::new(TracerConfig::default(), Arc::new(UnavailableSampler)).unwrap(),
        );
        tracer.start_trace(None).unwrap();
        let outcome = monitor(fast_config(2_000, 3_000, 4_000))
            .with_tracer(Arc::clone(&tracer))
            .supervise(&sh("for i in 1 2 3; do echo $i; sleep 0.1; done"))
            .unwrap();
        assert!(outcome.success());

        let trace = tracer.end_trace().unwrap();
        assert_eq!(trace.current_stage, Stage::Completed);
        for stage in [
            Stage::ProcessCreation,
            Stage::OutputStreaming,
            Stage::ProcessMonitoring,
            Stage::Cleanup,
        ] {
            assert!(trace.stages.contains(&stage), "missing {stage}");
        }
        assert_eq!(trace.processes.len(), 1);
        assert_eq!(trace.processes[0].status, SpanStatus::Succeeded);
        assert_eq!(trace.processes[0].exit_code, Some(0));
        assert!(trace.last_heartbeat.is_some());
        assert_eq!(trace.threads.len(), 2);
    }

    #[test]
    fn test_spawn_failure_is_an_error() {
        let result = monitor(fast_config(2_000, 3_000, 4_000))
            .supervise(&CommandBuilder::new("/definitely/not/a/binary"));
        assert!(result.is_err());
    }
}
