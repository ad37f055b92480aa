//! Execution tracer: the single record of what a supervised run did.
//!
//! One trace is active at a time. It lives behind one mutex shared with the background resource
//! sampler, and every critical section is a short in-memory update.

mod trace;

pub use trace::*;

use crate::config::TracerConfig;
use crate::prelude::*;
use crate::process::join_bounded;
use crate::resources::ResourceSampler;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const SAMPLER_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
/// Captured output kept on an external-operation span.
const MAX_OPERATION_OUTPUT: usize = 4096;

/// Description of a hang returned by [`ExecutionTracer::detect_hang`].
#[derive(Debug, Clone, PartialEq)]
pub struct HangDescription {
    pub trace_id: String,
    pub stage: Stage,
    pub silence: Duration,
    pub timeout: Duration,
    /// False when the trace never received a heartbeat and the silence is measured from its start.
    pub since_heartbeat: bool,
    pub message: String,
}

/// Fields of a [`ProcessTrace`] that change after it was opened.
#[derive(Debug, Clone, Default)]
pub struct ProcessUpdate {
    pub pid: Option<u32>,
    pub status: Option<SpanStatus>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

struct SamplerHandle {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct ExecutionTracer {
    config: TracerConfig,
    sampler: Arc<dyn ResourceSampler>,
    active: Arc<Mutex<Option<ExecutionTrace>>>,
    /// Pid sampled by the background thread, 0 meaning our own process.
    sampled_pid: Arc<AtomicU32>,
    sampler_thread: Mutex<Option<SamplerHandle>>,
}

impl ExecutionTracer {
    pub fn new(config: TracerConfig, sampler: Arc<dyn ResourceSampler>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            sampler,
            active: Arc::new(Mutex::new(None)),
            sampled_pid: Arc::new(AtomicU32::new(0)),
            sampler_thread: Mutex::new(None),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<ExecutionTrace>> {
        // A panicking writer leaves the trace in a consistent state, every update is a single field
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Run `f` against the active trace, if any.
    fn with_trace<T>(&self, f: impl FnOnce(&mut ExecutionTrace) -> T) -> Option<T> {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(trace) => Some(f(trace)),
            None => {
                trace!("No active trace, ignoring tracer call");
                None
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Install a new active trace and start sampling resources.
    ///
    /// Fails if a trace is already active.
    pub fn start_trace(&self, trace_id: Option<String>) -> Result<ExecutionTrace> {
        let trace = {
            let mut guard = self.lock();
            if let Some(active) = guard.as_ref() {
                bail!("Trace {} is already active", active.trace_id);
            }
            let trace_id = trace_id.unwrap_or_else(|| format!("trace-{}", uuid::Uuid::new_v4()));
            let trace = ExecutionTrace::new(trace_id);
            *guard = Some(trace.clone());
            trace
        };
        self.sampled_pid.store(0, Ordering::Relaxed);
        self.start_sampler();
        debug!("Started trace {}", trace.trace_id);
        Ok(trace)
    }

    fn start_sampler(&self) {
        let (stop, stop_rx) = mpsc::channel::<()>();
        let active = Arc::clone(&self.active);
        let sampler = Arc::clone(&self.sampler);
        let sampled_pid = Arc::clone(&self.sampled_pid);
        let interval = self.config.resource_monitoring_interval;
        let capacity = self.config.max_resource_samples;

        let spawned = thread::Builder::new()
            .name("resource-sampler".into())
            .spawn(move || {
                loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {}
                        // Stop requested or the tracer is gone
                        _ => break,
                    }
                    let pid = match sampled_pid.load(Ordering::Relaxed) {
                        0 => std::process::id(),
                        pid => pid,
                    };
                    // Sampling happens outside the lock, only the append is guarded
                    let Some(sample) = sampler.sample_process(pid) else {
                        continue;
                    };
                    let mut guard = active.lock().unwrap_or_else(|p| p.into_inner());
                    let Some(trace) = guard.as_mut() else {
                        break;
                    };
                    trace.resource_usage.push_back(sample);
                    while trace.resource_usage.len() > capacity {
                        trace.resource_usage.pop_front();
                    }
                }
            });

        match spawned {
            Ok(handle) => {
                let mut slot = self
                    .sampler_thread
                    .lock()
                    .unwrap_or_else(|p| p.into_inner());
                *slot = Some(SamplerHandle { stop, handle });
            }
            Err(e) => warn!("Failed to start the resource sampler: {e}"),
        }
    }

    fn stop_sampler(&self) {
        let handle = self
            .sampler_thread
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(SamplerHandle { stop, handle }) = handle {
            let _ = stop.send(());
            join_bounded(handle, SAMPLER_JOIN_TIMEOUT);
        }
    }

    /// Move the trace to `stage`, merging `metadata` into the trace metadata.
    ///
    /// Setting the current stage again is a no-op on the visited list. Once a terminal stage is
    /// reached the stage no longer changes, only the metadata is merged.
    pub fn set_stage(&self, stage: Stage, metadata: Option<BTreeMap<String, serde_json::Value>>) {
        self.with_trace(|trace| {
            if let Some(metadata) = metadata {
                trace.metadata.extend(metadata);
            }
            if trace.current_stage.is_terminal() && trace.current_stage != stage {
                debug!(
                    "Trace {} already reached {}, ignoring stage {stage}",
                    trace.trace_id, trace.current_stage
                );
                return;
            }
            if !trace.stages.contains(&stage) {
                trace.stages.push(stage);
            }
            if trace.current_stage != stage {
                trace!("Trace {}: {} -> {stage}", trace.trace_id, trace.current_stage);
            }
            trace.current_stage = stage;
        });
    }

    pub fn insert_metadata(&self, key: impl Into<String>, value: serde_json::Value) {
        self.with_trace(|trace| {
            trace.metadata.insert(key.into(), value);
        });
    }

    /// Open a process span. The pid, when known, also becomes the target of resource sampling.
    pub fn trace_process(&self, command: &[String], pid: Option<u32>) -> Option<SpanId> {
        let id = self.with_trace(|trace| {
            let id = trace.allocate_span_id();
            trace.processes.push(ProcessTrace {
                id,
                pid,
                command: command.to_vec(),
                started_at: Utc::now(),
                ended_at: None,
                duration_secs: None,
                status: SpanStatus::Running,
                exit_code: None,
                error: None,
                heartbeats: vec![],
            });
            id
        })?;
        if let Some(pid) = pid {
            self.sampled_pid.store(pid, Ordering::Relaxed);
        }
        Some(id)
    }

    pub fn update_process_trace(&self, id: SpanId, update: ProcessUpdate) {
        if let Some(pid) = update.pid {
            self.sampled_pid.store(pid, Ordering::Relaxed);
        }
        self.with_trace(|trace| {
            let Some(process) = trace.processes.iter_mut().find(|p| p.id == id) else {
                debug!("Unknown process span {id}");
                return;
            };
            if update.pid.is_some() {
                process.pid = update.pid;
            }
            if update.exit_code.is_some() {
                process.exit_code = update.exit_code;
            }
            if update.error.is_some() {
                process.error = update.error;
            }
            if let Some(status) = update.status {
                process.status = status;
                if !status.is_open() {
                    let now = Utc::now();
                    process.ended_at = Some(now);
                    process.duration_secs = Some(seconds_between(process.started_at, now));
                }
            }
        });
    }

    /// Open a span around a call to an external subsystem.
    pub fn trace_external_operation(&self, kind: &str, argv: &[String]) -> Option<SpanId> {
        self.with_trace(|trace| {
            let id = trace.allocate_span_id();
            trace.external_operations.push(ExternalOperation {
                id,
                kind: kind.to_string(),
                argv: argv.to_vec(),
                started_at: Utc::now(),
                ended_at: None,
                duration_secs: None,
                status: SpanStatus::Running,
                exit_code: None,
                output: String::new(),
                error: None,
            });
            id
        })
    }

    /// Close an external-operation span.
    pub fn update_external_operation(
        &self,
        id: SpanId,
        status: SpanStatus,
        exit_code: Option<i32>,
        output: &str,
        error: Option<String>,
    ) {
        self.with_trace(|trace| {
            let Some(operation) = trace.external_operations.iter_mut().find(|op| op.id == id)
            else {
                debug!("Unknown external operation span {id}");
                return;
            };
            let now = Utc::now();
            operation.status = status;
            operation.exit_code = exit_code;
            operation.output = truncate_output(output);
            operation.error = error;
            operation.ended_at = Some(now);
            operation.duration_secs = Some(seconds_between(operation.started_at, now));
        });
    }

    pub fn track_thread(&self, name: &str, target: &str) -> Option<SpanId> {
        self.with_trace(|trace| {
            let id = trace.allocate_span_id();
            trace.threads.push(ThreadTrace {
                id,
                name: name.to_string(),
                target: target.to_string(),
                started_at: Utc::now(),
                ended_at: None,
                duration_secs: None,
                state: ThreadState::Created,
                error: None,
            });
            id
        })
    }

    pub fn update_thread_state(&self, id: SpanId, state: ThreadState, error: Option<String>) {
        self.with_trace(|trace| {
            let Some(thread) = trace.threads.iter_mut().find(|t| t.id == id) else {
                debug!("Unknown thread span {id}");
                return;
            };
            thread.state = state;
            if error.is_some() {
                thread.error = error;
            }
            if state.is_finished() && thread.ended_at.is_none() {
                let now = Utc::now();
                thread.ended_at = Some(now);
                thread.duration_secs = Some(seconds_between(thread.started_at, now));
            }
        });
    }

    /// Record a liveness timestamp, appending `message` to every still-open process span.
    pub fn heartbeat(
        &self,
        message: Option<&str>,
        info: Option<BTreeMap<String, serde_json::Value>>,
    ) {
        self.with_trace(|trace| {
            let now = Utc::now();
            trace.last_heartbeat = Some(now);
            let message = message.unwrap_or("heartbeat");
            for process in trace.processes.iter_mut().filter(|p| p.status.is_open()) {
                process.heartbeats.push(HeartbeatEntry {
                    at: now,
                    message: message.to_string(),
                });
            }
            if let Some(info) = info {
                trace.metadata.insert(
                    "last_heartbeat_info".into(),
                    serde_json::Value::Object(info.into_iter().collect()),
                );
            }
        });
    }

    /// Whether the active trace has been silent for longer than `timeout`.
    ///
    /// Silence is measured from the last heartbeat, or from the trace start when there was none.
    /// A detected hang is also recorded as the trace hang point.
    pub fn detect_hang(&self, timeout: Duration) -> Option<HangDescription> {
        self.with_trace(|trace| {
            let now = Utc::now();
            let (reference, since_heartbeat) = match trace.last_heartbeat {
                Some(heartbeat) => (heartbeat, true),
                None => (trace.started_at, false),
            };
            let silence_secs = seconds_between(reference, now);
            if silence_secs <= timeout.as_secs_f64() {
                return None;
            }

            let message = if since_heartbeat {
                format!(
                    "No heartbeat for {silence_secs:.1}s (timeout {:.1}s) during stage {}",
                    timeout.as_secs_f64(),
                    trace.current_stage
                )
            } else {
                format!(
                    "No heartbeat since the trace started {silence_secs:.1}s ago (timeout {:.1}s) during stage {}",
                    timeout.as_secs_f64(),
                    trace.current_stage
                )
            };
            trace.hang_point = Some(HangPoint {
                detected_at: now,
                stage: trace.current_stage,
                silence_secs,
                timeout_secs: timeout.as_secs_f64(),
                since_heartbeat,
            });
            Some(HangDescription {
                trace_id: trace.trace_id.clone(),
                stage: trace.current_stage,
                silence: Duration::from_secs_f64(silence_secs),
                timeout,
                since_heartbeat,
                message,
            })
        })
        .flatten()
    }

    /// External operations still running after `threshold`.
    pub fn open_external_operations_older_than(
        &self,
        threshold: Duration,
    ) -> Vec<ExternalOperation> {
        let now = Utc::now();
        self.with_trace(|trace| {
            trace
                .open_external_operations()
                .filter(|operation| {
                    seconds_between(operation.started_at, now) > threshold.as_secs_f64()
                })
                .cloned()
                .collect()
        })
        .unwrap_or_default()
    }

    /// Copy of the active trace, for diagnosing a run that is still in progress.
    pub fn snapshot(&self) -> Option<ExecutionTrace> {
        self.lock().clone()
    }

    /// Stop sampling, freeze the active trace and return it.
    pub fn end_trace(&self) -> Option<ExecutionTrace> {
        self.stop_sampler();
        let mut trace = self.lock().take()?;

        let now = Utc::now();
        if !trace.current_stage.is_terminal() {
            if !trace.stages.contains(&Stage::Completed) {
                trace.stages.push(Stage::Completed);
            }
            trace.current_stage = Stage::Completed;
        }
        trace.ended_at = Some(now);
        trace.duration_secs = Some(seconds_between(trace.started_at, now));
        debug!(
            "Ended trace {} in stage {} after {:.1}s",
            trace.trace_id,
            trace.current_stage,
            trace.duration_secs.unwrap_or_default()
        );
        Some(trace)
    }
}

impl Drop for ExecutionTracer {
    fn drop(&mut self) {
        self.stop_sampler();
    }
}

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OPERATION_OUTPUT {
        return output.to_string();
    }
    let mut end = MAX_OPERATION_OUTPUT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &output[..end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{ResourceUsage, UnavailableSampler};

    struct FixedSampler;

    impl ResourceSampler for FixedSampler {
        fn sample_process(&self, pid: u32) -> Option<ResourceUsage> {
            Some(ResourceUsage {
                timestamp: Utc::now(),
                pid,
                cpu_percent: 1.0,
                memory_mb: 10.0,
                memory_percent: 0.5,
                disk_read_bytes: 0,
                disk_written_bytes: 0,
                network_received_bytes: 0,
                network_transmitted_bytes: 0,
                open_handles: None,
                thread_count: None,
            })
        }

        fn system_snapshot(&self) -> Option<crate::resources::SystemResources> {
            None
        }

        fn child_processes(&self, _pid: u32) -> Vec<crate::resources::ChildProcessInfo> {
            vec![]
        }
    }

    fn tracer() -> ExecutionTracer {
        ExecutionTracer::new(TracerConfig::default(), Arc::new(UnavailableSampler)).unwrap()
    }

    #[test]
    fn test_only_one_trace_at_a_time() {
        let tracer = tracer();
        tracer.start_trace(Some("first".into())).unwrap();
        let err = tracer.start_trace(None).unwrap_err();
        assert!(err.to_string().contains("first"));

        tracer.end_trace().unwrap();
        assert!(!tracer.is_active());
        tracer.start_trace(None).unwrap();
    }

    #[test]
    fn test_set_stage_is_idempotent() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        tracer.set_stage(Stage::ProcessCreation, None);
        tracer.set_stage(Stage::ProcessCreation, None);
        tracer.set_stage(Stage::OutputStreaming, None);
        tracer.set_stage(Stage::ProcessCreation, None);

        let trace = tracer.end_trace().unwrap();
        assert_eq!(
            trace.stages,
            vec![
                Stage::Initialization,
                Stage::ProcessCreation,
                Stage::OutputStreaming,
                Stage::Completed
            ]
        );
    }

    #[test]
    fn test_end_trace_forces_completed() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        tracer.set_stage(Stage::ProcessMonitoring, None);
        let trace = tracer.end_trace().unwrap();
        assert_eq!(trace.current_stage, Stage::Completed);
        assert!(trace.ended_at.is_some());
        assert!(trace.duration_secs.is_some());
    }

    #[test]
    fn test_terminal_stage_is_kept() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        tracer.set_stage(Stage::TimedOut, None);
        tracer.set_stage(Stage::Cleanup, None);
        let trace = tracer.end_trace().unwrap();
        assert_eq!(trace.current_stage, Stage::TimedOut);
        assert!(!trace.stages.contains(&Stage::Completed));
    }

    #[test]
    fn test_stage_metadata_is_merged() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        tracer.set_stage(
            Stage::ProcessCreation,
            Some(BTreeMap::from([("command".into(), "sleep 1".into())])),
        );
        tracer.set_stage(
            Stage::OutputStreaming,
            Some(BTreeMap::from([("pid".into(), 42.into())])),
        );
        let trace = tracer.end_trace().unwrap();
        assert_eq!(trace.metadata_str("command"), Some("sleep 1"));
        assert_eq!(trace.metadata["pid"], 42);
    }

    #[test]
    fn test_detect_hang_after_heartbeat_silence() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        tracer.heartbeat(Some("alive"), None);
        assert!(tracer.detect_hang(Duration::from_secs(1)).is_none());

        thread::sleep(Duration::from_millis(1100));
        let hang = tracer.detect_hang(Duration::from_secs(1)).unwrap();
        assert!(hang.since_heartbeat);
        assert!(hang.silence >= Duration::from_secs(1));
        assert!(hang.message.contains(&format!("{:.1}s", hang.silence.as_secs_f64())));

        let trace = tracer.end_trace().unwrap();
        let hang_point = trace.hang_point.unwrap();
        assert!(hang_point.silence_secs > 1.0);
    }

    #[test]
    fn test_detect_hang_without_any_heartbeat() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        thread::sleep(Duration::from_millis(150));
        let hang = tracer.detect_hang(Duration::from_millis(100)).unwrap();
        assert!(!hang.since_heartbeat);
        assert!(tracer.detect_hang(Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_heartbeat_reaches_open_processes_only() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        let done = tracer.trace_process(&["true".into()], Some(1)).unwrap();
        let running = tracer.trace_process(&["sleep".into()], None).unwrap();
        tracer.update_process_trace(
            done,
            ProcessUpdate {
                status: Some(SpanStatus::Succeeded),
                exit_code: Some(0),
                ..Default::default()
            },
        );
        tracer.heartbeat(Some("tick"), Some(BTreeMap::from([("lines".into(), 3.into())])));

        let trace = tracer.end_trace().unwrap();
        let done = trace.processes.iter().find(|p| p.id == done).unwrap();
        let running = trace.processes.iter().find(|p| p.id == running).unwrap();
        assert!(done.heartbeats.is_empty());
        assert!(done.duration_secs.is_some());
        assert_eq!(running.heartbeats.len(), 1);
        assert_eq!(running.heartbeats[0].message, "tick");
        assert_eq!(trace.metadata["last_heartbeat_info"]["lines"], 3);
    }

    #[test]
    fn test_external_operation_span() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        let id = tracer
            .trace_external_operation("docker", &["docker".into(), "info".into()])
            .unwrap();
        assert_eq!(tracer.snapshot().unwrap().open_external_operations().count(), 1);

        tracer.update_external_operation(id, SpanStatus::Failed, Some(1), "boom", None);
        let trace = tracer.end_trace().unwrap();
        let operation = &trace.external_operations[0];
        assert_eq!(operation.succeeded(), Some(false));
        assert_eq!(operation.output, "boom");
        assert!(operation.ended_at.is_some());
    }

    #[test]
    fn test_thread_states() {
        let tracer = tracer();
        tracer.start_trace(None).unwrap();
        let id = tracer.track_thread("stdout-reader", "pid 1 stdout").unwrap();
        tracer.update_thread_state(id, ThreadState::Running, None);
        tracer.update_thread_state(id, ThreadState::Error, Some("broken pipe".into()));
        let trace = tracer.end_trace().unwrap();
        assert_eq!(trace.threads[0].state, ThreadState::Error);
        assert_eq!(trace.threads[0].error.as_deref(), Some("broken pipe"));
        assert!(trace.threads[0].ended_at.is_some());
    }

    #[test]
    fn test_calls_without_active_trace_are_ignored() {
        let tracer = tracer();
        tracer.set_stage(Stage::Cleanup, None);
        tracer.heartbeat(None, None);
        assert!(tracer.trace_process(&[], None).is_none());
        assert!(tracer.detect_hang(Duration::ZERO).is_none());
        assert!(tracer.end_trace().is_none());
    }

    #[test]
    fn test_resource_samples_are_capped() {
        let config = TracerConfig {
            resource_monitoring_interval: Duration::from_millis(10),
            max_resource_samples: 3,
        };
        let tracer = ExecutionTracer::new(config, Arc::new(FixedSampler)).unwrap();
        tracer.start_trace(None).unwrap();
        thread::sleep(Duration::from_millis(200));
        let trace = tracer.end_trace().unwrap();
        assert_eq!(trace.resource_usage.len(), 3);
        assert_eq!(trace.latest_resource_usage().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_truncate_output() {
        let long = "é".repeat(MAX_OPERATION_OUTPUT);
        let truncated = truncate_output(&long);
        assert!(truncated.ends_with("[truncated]"));
        assert!(truncated.len() < long.len());
    }
}
