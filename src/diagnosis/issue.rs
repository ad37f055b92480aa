use crate::preflight::ProbeResult;
use crate::resources::SystemResources;
use crate::tracer::Stage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HangupKind {
    RuntimeUnavailable,
    RuntimeUnresponsive,
    PermissionDenied,
    MissingDependency,
    StaleHeartbeat,
    ExternalOperationStuck,
    ProcessStall,
    ResourceExhaustion,
    OrphanedContainers,
    EnvironmentCheckFailed,
}

impl Display for HangupKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HangupKind::RuntimeUnavailable => "runtime-unavailable",
            HangupKind::RuntimeUnresponsive => "runtime-unresponsive",
            HangupKind::PermissionDenied => "permission-denied",
            HangupKind::MissingDependency => "missing-dependency",
            HangupKind::StaleHeartbeat => "stale-heartbeat",
            HangupKind::ExternalOperationStuck => "external-operation-stuck",
            HangupKind::ProcessStall => "process-stall",
            HangupKind::ResourceExhaustion => "resource-exhaustion",
            HangupKind::OrphanedContainers => "orphaned-containers",
            HangupKind::EnvironmentCheckFailed => "environment-check-failed",
        };
        f.write_str(name)
    }
}

/// One classified cause of a hang. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangupIssue {
    pub kind: HangupKind,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub evidence: BTreeMap<String, serde_json::Value>,
    pub root_cause: String,
    pub recommendations: Vec<String>,
    pub fix_commands: Vec<String>,
    /// How directly the evidence implicates this cause, within [0, 1].
    pub confidence: f64,
}

impl HangupIssue {
    pub fn new(
        kind: HangupKind,
        severity: Severity,
        confidence: f64,
        title: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            severity,
            title: title.into(),
            description: String::new(),
            evidence: BTreeMap::new(),
            root_cause: String::new(),
            recommendations: vec![],
            fix_commands: vec![],
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn root_cause(mut self, root_cause: impl Into<String>) -> Self {
        self.root_cause = root_cause.into();
        self
    }

    pub fn evidence(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.evidence.insert(key.to_string(), value.into());
        self
    }

    pub fn recommend<I, S>(mut self, recommendations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recommendations
            .extend(recommendations.into_iter().map(Into::into));
        self
    }

    pub fn fix<I, S>(mut self, commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fix_commands.extend(commands.into_iter().map(Into::into));
        self
    }
}

/// Environment state captured while analyzing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemState {
    pub resources: Option<SystemResources>,
    pub runtime_reachable: Option<bool>,
    pub runtime_response_secs: Option<f64>,
    pub probes: Vec<ProbeResult>,
    pub trace_id: Option<String>,
    pub trace_stage: Option<Stage>,
    pub open_external_operations: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HangupAnalysis {
    pub analysis_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_secs: f64,
    /// Issues at or above the confidence threshold, most severe first.
    pub issues: Vec<HangupIssue>,
    pub primary_cause: Option<HangupIssue>,
    pub system_state: SystemState,
    pub recovery_suggestions: Vec<String>,
    pub prevention_measures: Vec<String>,
}

impl HangupAnalysis {
    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty()
    }
}
