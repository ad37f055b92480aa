use crate::resources::ResourceUsage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt::Display;

/// Identifier of a process, thread or external-operation span inside one trace.
pub type SpanId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initialization,
    ProcessCreation,
    ExternalCommunication,
    OutputStreaming,
    ProcessMonitoring,
    Cleanup,
    Completed,
    Failed,
    TimedOut,
}

impl Stage {
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::TimedOut)
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Initialization => "initialization",
            Stage::ProcessCreation => "process_creation",
            Stage::ExternalCommunication => "external_communication",
            Stage::OutputStreaming => "output_streaming",
            Stage::ProcessMonitoring => "process_monitoring",
            Stage::Cleanup => "cleanup",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::TimedOut => "timed_out",
        };
        f.write_str(name)
    }
}

/// Terminal status of a traced process or external operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Terminated,
}

impl SpanStatus {
    pub fn is_open(self) -> bool {
        self == SpanStatus::Running
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadState {
    Created,
    Running,
    Waiting,
    Blocked,
    Terminated,
    Error,
}

impl ThreadState {
    pub fn is_finished(self) -> bool {
        matches!(self, ThreadState::Terminated | ThreadState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessTrace {
    pub id: SpanId,
    pub pid: Option<u32>,
    pub command: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub status: SpanStatus,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub heartbeats: Vec<HeartbeatEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadTrace {
    pub id: SpanId,
    pub name: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub state: ThreadState,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalOperation {
    pub id: SpanId,
    pub kind: String,
    pub argv: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub status: SpanStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
}

impl ExternalOperation {
    pub fn succeeded(&self) -> Option<bool> {
        match self.status {
            SpanStatus::Running => None,
            SpanStatus::Succeeded => Some(true),
            _ => Some(false),
        }
    }
}

/// Where a hang was observed, recorded by `ExecutionTracer::detect_hang`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangPoint {
    pub detected_at: DateTime<Utc>,
    pub stage: Stage,
    pub silence_secs: f64,
    pub timeout_secs: f64,
    pub since_heartbeat: bool,
}

/// Everything recorded about one supervised run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub trace_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    /// Visited stages, in first-visit order, without duplicates.
    pub stages: Vec<Stage>,
    pub current_stage: Stage,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub resource_usage: VecDeque<ResourceUsage>,
    pub processes: Vec<ProcessTrace>,
    pub threads: Vec<ThreadTrace>,
    pub external_operations: Vec<ExternalOperation>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub hang_point: Option<HangPoint>,
    #[serde(skip)]
    pub(super) next_span_id: SpanId,
}

impl ExecutionTrace {
    pub(crate) fn new(trace_id: String) -> Self {
        Self {
            trace_id,
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: None,
            stages: vec![Stage::Initialization],
            current_stage: Stage::Initialization,
            last_heartbeat: None,
            resource_usage: VecDeque::new(),
            processes: vec![],
            threads: vec![],
            external_operations: vec![],
            metadata: BTreeMap::new(),
            hang_point: None,
            next_span_id: 1,
        }
    }

    pub(super) fn allocate_span_id(&mut self) -> SpanId {
        let id = self.next_span_id;
        self.next_span_id += 1;
        id
    }

    pub fn latest_resource_usage(&self) -> Option<&ResourceUsage> {
        self.resource_usage.back()
    }

    pub fn open_processes(&self) -> impl Iterator<Item = &ProcessTrace> {
        self.processes.iter().filter(|p| p.status.is_open())
    }

    pub fn open_external_operations(&self) -> impl Iterator<Item = &ExternalOperation> {
        self.external_operations
            .iter()
            .filter(|op| op.status.is_open())
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|value| value.as_str())
    }
}

/// Seconds elapsed between `from` and `to`, never negative.
pub(crate) fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    ((to - from).num_milliseconds().max(0) as f64) / 1000.0
}
