use super::stream::{ProcessActivity, StreamKind};
use crate::diagnosis::Severity;
use crate::prelude::*;
use crate::process::join_bounded;
use crate::resources::ResourceSampler;
use crate::tracer::ExecutionTracer;
use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// System memory usage above which the run is considered starved.
pub const MEMORY_EXHAUSTION_PERCENT: f32 = 90.0;
/// A reader must have been stopped this long before its stream counts as stalled, so that a
/// process closing its streams on the way out is not flagged.
const READER_EXIT_GRACE: Duration = Duration::from_secs(1);
const WATCH_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndicatorKind {
    StdoutStreamStalled,
    StderrStreamStalled,
    ProcessWaitStalled,
    ExternalOpUnresponsive,
    ResourceExhausted,
}

impl Display for IndicatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IndicatorKind::StdoutStreamStalled => "stdout-stream-stalled",
            IndicatorKind::StderrStreamStalled => "stderr-stream-stalled",
            IndicatorKind::ProcessWaitStalled => "process-wait-stalled",
            IndicatorKind::ExternalOpUnresponsive => "external-op-unresponsive",
            IndicatorKind::ResourceExhausted => "resource-exhausted",
        };
        f.write_str(name)
    }
}

/// Evidence that a part of the run is stuck rather than slow. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadlockIndicator {
    pub kind: IndicatorKind,
    pub detected_at: DateTime<Utc>,
    pub severity: Severity,
    pub pid: Option<u32>,
    pub thread: Option<String>,
    pub details: String,
    pub recommendations: Vec<String>,
}

impl DeadlockIndicator {
    fn new(kind: IndicatorKind, severity: Severity, pid: u32, details: String) -> Self {
        Self {
            kind,
            detected_at: Utc::now(),
            severity,
            pid: Some(pid),
            thread: None,
            details,
            recommendations: vec![],
        }
    }

    fn on_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = Some(thread.into());
        self
    }

    fn recommend(mut self, recommendations: &[&str]) -> Self {
        self.recommendations = recommendations.iter().map(|r| r.to_string()).collect();
        self
    }
}

/// What the deadlock checks look at.
#[derive(Clone)]
pub struct WatchContext {
    pub pid: u32,
    pub activity: Arc<ProcessActivity>,
    pub activity_timeout: Duration,
    pub sampler: Arc<dyn ResourceSampler>,
    pub tracer: Option<Arc<ExecutionTracer>>,
}

fn process_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// One pass of deadlock detection. Kinds listed in `known` are not reported again.
pub fn detect_deadlock_conditions(
    context: &WatchContext,
    known: &HashSet<IndicatorKind>,
) -> Vec<DeadlockIndicator> {
    let mut indicators = Vec::new();
    let pid = context.pid;
    let alive = process_alive(pid);

    for (stream, kind) in [
        (StreamKind::Stdout, IndicatorKind::StdoutStreamStalled),
        (StreamKind::Stderr, IndicatorKind::StderrStreamStalled),
    ] {
        if known.contains(&kind) || !alive {
            continue;
        }
        let Some(stopped) = context.activity.reader_stopped_for(stream) else {
            continue;
        };
        if stopped >= READER_EXIT_GRACE {
            indicators.push(
                DeadlockIndicator::new(
                    kind,
                    Severity::High,
                    pid,
                    format!(
                        "{stream} reader stopped {:.1}s ago while process {pid} is still alive",
                        stopped.as_secs_f64()
                    ),
                )
                .on_thread(format!("{stream}-reader"))
                .recommend(&[
                    "The workload closed its output stream without exiting",
                    "Check for a child process stuck on a full pipe or a closed terminal",
                ]),
            );
        }
    }

    let silence = context.activity.silence();
    if !known.contains(&IndicatorKind::ProcessWaitStalled) && silence > context.activity_timeout {
        indicators.push(
            DeadlockIndicator::new(
                IndicatorKind::ProcessWaitStalled,
                Severity::High,
                pid,
                format!(
                    "no output for {} (activity timeout {})",
                    humantime::format_duration(Duration::from_secs(silence.as_secs())),
                    humantime::format_duration(context.activity_timeout)
                ),
            )
            .recommend(&[
                "Check whether the workload waits for input or a network resource",
                "Increase the activity timeout if long silent phases are expected",
            ]),
        );
    }

    let stuck = if known.contains(&IndicatorKind::ExternalOpUnresponsive) {
        None
    } else {
        context.tracer.as_ref().and_then(|tracer| {
            tracer
                .open_external_operations_older_than(context.activity_timeout)
                .into_iter()
                .next()
        })
    };
    if let Some(operation) = stuck {
        indicators.push(
            DeadlockIndicator::new(
                IndicatorKind::ExternalOpUnresponsive,
                Severity::High,
                pid,
                format!(
                    "{} call `{}` has not returned since {}",
                    operation.kind,
                    operation.argv.join(" "),
                    operation.started_at.to_rfc3339()
                ),
            )
            .recommend(&["Check that the container runtime daemon is responsive"]),
        );
    }

    // Absence of metrics is neutral
    let system = if known.contains(&IndicatorKind::ResourceExhausted) {
        None
    } else {
        context.sampler.system_snapshot()
    };
    if let Some(system) = system.filter(|s| s.memory_percent > MEMORY_EXHAUSTION_PERCENT) {
        indicators.push(
            DeadlockIndicator::new(
                IndicatorKind::ResourceExhausted,
                Severity::Critical,
                pid,
                format!(
                    "system memory usage at {:.1}% ({} MB available)",
                    system.memory_percent, system.available_memory_mb
                ),
            )
            .recommend(&[
                "Free memory or stop other containers",
                "Run the workload on a larger machine",
            ]),
        );
    }

    indicators
}

/// Background thread running [`detect_deadlock_conditions`] every interval.
pub(crate) struct DeadlockWatch {
    stop: Sender<()>,
    indicators: Receiver<DeadlockIndicator>,
    handle: JoinHandle<()>,
}

impl DeadlockWatch {
    pub fn spawn(context: WatchContext, interval: Duration) -> Result<Self> {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let (sender, indicators) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("deadlock-watch".into())
            .spawn(move || {
                let mut known = HashSet::new();
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                    for indicator in detect_deadlock_conditions(&context, &known) {
                        warn!("Deadlock indicator {}: {}", indicator.kind, indicator.details);
                        known.insert(indicator.kind);
                        if sender.send(indicator).is_err() {
                            return;
                        }
                    }
                }
            })
            .context("Failed to spawn the deadlock watch")?;
        Ok(Self {
            stop,
            indicators,
            handle,
        })
    }

    /// Indicators detected since the previous call.
    pub fn drain(&self) -> Vec<DeadlockIndicator> {
        self.indicators.try_iter().collect()
    }

    /// Stop the thread and return whatever it detected last.
    pub fn stop(self) -> Vec<DeadlockIndicator> {
        let _ = self.stop.send(());
        join_bounded(self.handle, WATCH_JOIN_TIMEOUT);
        self.indicators.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{SystemResources, UnavailableSampler};
    use std::time::Instant;

    struct StarvedSampler;

    impl ResourceSampler for StarvedSampler {
        fn sample_process(&self, _pid: u32) -> Option<crate::resources::ResourceUsage> {
            None
        }

        fn system_snapshot(&self) -> Option<SystemResources> {
            Some(SystemResources {
                timestamp: Utc::now(),
                cpu_percent: 10.0,
                memory_percent: 97.5,
                total_memory_mb: 1024,
                available_memory_mb: 25,
                load_average: [0.0; 3],
                root_disk_available_mb: None,
            })
        }

        fn child_processes(&self, _pid: u32) -> Vec<crate::resources::ChildProcessInfo> {
            vec![]
        }
    }

    fn context(activity_timeout: Duration, sampler: Arc<dyn ResourceSampler>) -> WatchContext {
        WatchContext {
            // Our own process is always alive
            pid: std::process::id(),
            activity: Arc::new(ProcessActivity::new(Instant::now())),
            activity_timeout,
            sampler,
            tracer: None,
        }
    }

    #[test]
    fn test_stalled_streams_and_silence() {
        let context = context(Duration::from_millis(100), Arc::new(UnavailableSampler));
        // No reader was ever started for either stream
        thread::sleep(READER_EXIT_GRACE + Duration::from_millis(50));

        let indicators = detect_deadlock_conditions(&context, &HashSet::new());
        let kinds = indicators.iter().map(|i| i.kind).collect::<Vec<_>>();
        assert_eq!(
            kinds,
            vec![
                IndicatorKind::StdoutStreamStalled,
                IndicatorKind::StderrStreamStalled,
                IndicatorKind::ProcessWaitStalled
            ]
        );
        assert_eq!(indicators[0].thread.as_deref(), Some("stdout-reader"));

        let known = kinds.into_iter().collect();
        assert!(detect_deadlock_conditions(&context, &known).is_empty());
    }

    #[test]
    fn test_dead_process_streams_are_not_flagged() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        child.wait().unwrap();
        let mut context = context(Duration::from_secs(60), Arc::new(UnavailableSampler));
        context.pid = child.id();
        thread::sleep(READER_EXIT_GRACE);
        assert!(detect_deadlock_conditions(&context, &HashSet::new()).is_empty());
    }

    #[test]
    fn test_memory_exhaustion() {
        let context = context(Duration::from_secs(60), Arc::new(StarvedSampler));
        let known = HashSet::from([
            IndicatorKind::StdoutStreamStalled,
            IndicatorKind::StderrStreamStalled,
        ]);
        let indicators = detect_deadlock_conditions(&context, &known);
        assert_eq!(indicators.len(), 1);
        assert_eq!(indicators[0].kind, IndicatorKind::ResourceExhausted);
        assert_eq!(indicators[0].severity, Severity::Critical);
        assert!(indicators[0].details.contains("97.5%"));
    }

    #[test]
    fn test_watch_reports_through_channel() {
        let context = context(Duration::from_millis(10), Arc::new(UnavailableSampler));
        let watch = DeadlockWatch::spawn(context, Duration::from_millis(20)).unwrap();
        thread::sleep(Duration::from_millis(200));
        let mut indicators = watch.drain();
        indicators.extend(watch.stop());
        assert!(
            indicators
                .iter()
                .any(|i| i.kind == IndicatorKind::ProcessWaitStalled)
        );
        // Each kind is reported once
        let kinds = indicators.iter().map(|i| i.kind).collect::<HashSet<_>>();
        assert_eq!(kinds.len(), indicators.len());
    }
}
