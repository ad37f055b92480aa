use crate::tracer::seconds_between;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RecoveryKind {
    BufferClear,
    ProcessRestart,
    ExternalChannelReconnect,
    SandboxReset,
    FallbackExecution,
}

impl Display for RecoveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecoveryKind::BufferClear => "buffer-clear",
            RecoveryKind::ProcessRestart => "process-restart",
            RecoveryKind::ExternalChannelReconnect => "external-channel-reconnect",
            RecoveryKind::SandboxReset => "sandbox-reset",
            RecoveryKind::FallbackExecution => "fallback-execution",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AttemptStatus {
    Success,
    Failed,
    Partial,
    Skipped,
    InProgress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryAttempt {
    pub kind: RecoveryKind,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub message: String,
    pub success_indicators: Vec<String>,
    pub failure_reasons: Vec<String>,
    pub error: Option<String>,
}

impl RecoveryAttempt {
    pub fn begin(kind: RecoveryKind) -> Self {
        Self {
            kind,
            status: AttemptStatus::InProgress,
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: None,
            message: String::new(),
            success_indicators: vec![],
            failure_reasons: vec![],
            error: None,
        }
    }

    pub fn succeeded(&mut self, indicator: impl Into<String>) {
        self.success_indicators.push(indicator.into());
    }

    pub fn failed(&mut self, reason: impl Into<String>) {
        self.failure_reasons.push(reason.into());
    }

    /// Close the attempt. The status follows from the recorded indicators unless `status` is
    /// given explicitly.
    pub fn finish(mut self, status: Option<AttemptStatus>, message: impl Into<String>) -> Self {
        let ended_at = Utc::now();
        self.status = status.unwrap_or_else(|| {
            match (
                self.success_indicators.is_empty(),
                self.failure_reasons.is_empty(),
            ) {
                (_, true) => AttemptStatus::Success,
                (true, false) => AttemptStatus::Failed,
                (false, false) => AttemptStatus::Partial,
            }
        });
        if self.status == AttemptStatus::Failed && self.error.is_none() {
            self.error = self.failure_reasons.last().cloned();
        }
        self.message = message.into();
        self.duration_secs = Some(seconds_between(self.started_at, ended_at));
        self.ended_at = Some(ended_at);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }
}

/// Outcome of a degraded execution path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackExecutionResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_secs: f64,
    /// Strategy that produced the result, `all-failed` when none did.
    pub method: String,
    /// What this result does not prove, so callers can tell a real run from an approximation.
    pub limitations: Vec<String>,
    pub warnings: Vec<String>,
}

pub const ALL_FAILED_METHOD: &str = "all-failed";

impl FallbackExecutionResult {
    pub fn failure(method: &str, reason: impl Into<String>) -> Self {
        Self {
            success: false,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_secs: 0.0,
            method: method.to_string(),
            limitations: vec![],
            warnings: vec![reason.into()],
        }
    }

    pub fn all_failed(warnings: Vec<String>, duration_secs: f64) -> Self {
        Self {
            warnings,
            duration_secs,
            ..Self::failure(ALL_FAILED_METHOD, String::new())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoverySession {
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<f64>,
    pub attempts: Vec<RecoveryAttempt>,
    pub overall_success: bool,
    pub fallback_activated: bool,
    pub fallback_result: Option<FallbackExecutionResult>,
    pub context: BTreeMap<String, serde_json::Value>,
}

impl RecoverySession {
    pub fn new() -> Self {
        Self {
            session_id: format!("recovery-{}", uuid::Uuid::new_v4()),
            started_at: Utc::now(),
            ended_at: None,
            duration_secs: None,
            attempts: vec![],
            overall_success: false,
            fallback_activated: false,
            fallback_result: None,
            context: BTreeMap::new(),
        }
    }

    pub fn successful_attempts(&self) -> usize {
        self.attempts.iter().filter(|a| a.is_success()).count()
    }

    pub fn finish(&mut self, success_ratio: f64) {
        let ended_at = Utc::now();
        self.overall_success =
            compute_overall_success(self.successful_attempts(), self.attempts.len(), success_ratio);
        self.duration_secs = Some(seconds_between(self.started_at, ended_at));
        self.ended_at = Some(ended_at);
    }
}

impl Default for RecoverySession {
    fn default() -> Self {
        Self::new()
    }
}

/// A session succeeds when at least `ratio` of its attempts did. An empty session never does.
pub fn compute_overall_success(successful: usize, total: usize, ratio: f64) -> bool {
    if total == 0 {
        return false;
    }
    // Tolerance keeps exact ratios such as 3/5 against 0.6 on the right side of the comparison
    successful as f64 / total as f64 + 1e-9 >= ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(3, 5, true)]
    #[case(2, 5, false)]
    #[case(5, 5, true)]
    #[case(0, 5, false)]
    #[case(3, 4, true)]
    #[case(1, 2, false)]
    #[case(0, 0, false)]
    fn test_overall_success_ratio(
        #[case] successful: usize,
        #[case] total: usize,
        #[case] expected: bool,
    ) {
        assert_eq!(compute_overall_success(successful, total, 0.6), expected);
    }

    #[test]
    fn test_attempt_status_follows_evidence() {
        let attempt = RecoveryAttempt::begin(RecoveryKind::SandboxReset).finish(None, "nothing");
        assert_eq!(attempt.status, AttemptStatus::Success);

        let mut attempt = RecoveryAttempt::begin(RecoveryKind::SandboxReset);
        attempt.succeeded("stopped containers");
        attempt.failed("prune failed");
        let attempt = attempt.finish(None, "partly");
        assert_eq!(attempt.status, AttemptStatus::Partial);
        assert!(attempt.error.is_none());

        let mut attempt = RecoveryAttempt::begin(RecoveryKind::ExternalChannelReconnect);
        attempt.failed("daemon down");
        let attempt = attempt.finish(None, "failed");
        assert_eq!(attempt.status, AttemptStatus::Failed);
        assert_eq!(attempt.error.as_deref(), Some("daemon down"));
        assert!(attempt.ended_at.is_some());
        assert!(attempt.duration_secs.unwrap() >= 0.0);
    }

    #[test]
    fn test_session_success_counts_only_full_successes() {
        let mut session = RecoverySession::new();
        for status in [
            AttemptStatus::Success,
            AttemptStatus::Success,
            AttemptStatus::Partial,
            AttemptStatus::Success,
            AttemptStatus::Skipped,
        ] {
            session.attempts.push(
                RecoveryAttempt::begin(RecoveryKind::BufferClear).finish(Some(status), ""),
            );
        }
        session.finish(0.6);
        assert_eq!(session.successful_attempts(), 3);
        assert!(session.overall_success);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(
            serde_json::to_value(RecoveryKind::ExternalChannelReconnect).unwrap(),
            "external-channel-reconnect"
        );
        assert_eq!(RecoveryKind::FallbackExecution.to_string(), "fallback-execution");
    }
}
