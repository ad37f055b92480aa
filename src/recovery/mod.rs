//! Automated recovery after a failed or hung run.
//!
//! A [`RecoverySession`] runs a fixed battery of idempotent steps, each recorded as one
//! [`RecoveryAttempt`], and falls back to degraded execution when the battery did not fully
//! succeed. Sessions are serialized and kept in a bounded history for statistics.

mod fallback;
mod session;
mod steps;

pub use fallback::{
    DIRECT_CONTAINER_METHOD, DRY_RUN_METHOD, DirectContainerStrategy, DryRunStrategy,
    FallbackStrategy, LOCAL_PARSE_METHOD, LocalParseStrategy, default_strategies,
    execute_fallback_mode,
};
pub use session::*;
pub use steps::FailedProcess;

use crate::config::{RecoveryConfig, TerminationConfig};
use crate::prelude::*;
use crate::runtime::ContainerRuntime;
use crate::workload::Workload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use steps::StepContext;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KindStatistics {
    pub attempts: usize,
    pub successes: usize,
    pub success_rate: f64,
}

/// Aggregates over the session history. Serializes to the plain statistics map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryStatistics {
    pub total_sessions: usize,
    pub successful_sessions: usize,
    pub success_rate: f64,
    pub recovery_type_statistics: BTreeMap<RecoveryKind, KindStatistics>,
    pub current_session_active: bool,
    pub last_session_time: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct RecoveryState {
    current: Option<RecoverySession>,
    history: VecDeque<RecoverySession>,
}

pub struct AutoRecovery {
    config: RecoveryConfig,
    termination: TerminationConfig,
    runtime: Arc<dyn ContainerRuntime>,
    strategies: Vec<Box<dyn FallbackStrategy>>,
    /// Held for a whole session, so sessions never interleave.
    session_guard: Mutex<()>,
    /// Held briefly to append attempts or read statistics.
    state: Mutex<RecoveryState>,
}

impl AutoRecovery {
    pub fn new(
        config: RecoveryConfig,
        termination: TerminationConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        config.validate()?;
        let strategies = default_strategies(Arc::clone(&runtime), &config);
        Ok(Self {
            config,
            termination,
            runtime,
            strategies,
            session_guard: Mutex::new(()),
            state: Mutex::new(RecoveryState::default()),
        })
    }

    pub fn with_strategies(mut self, strategies: Vec<Box<dyn FallbackStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    fn state(&self) -> MutexGuard<'_, RecoveryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, attempt: RecoveryAttempt) {
        match attempt.status {
            AttemptStatus::Success => info!("Recovery step {}: {}", attempt.kind, attempt.message),
            AttemptStatus::Skipped => debug!("Recovery step {} skipped", attempt.kind),
            _ => warn!(
                "Recovery step {} {:?}: {}",
                attempt.kind,
                attempt.status,
                attempt.failure_reasons.join("; ")
            ),
        }
        if let Some(session) = self.state().current.as_mut() {
            session.attempts.push(attempt);
        }
    }

    fn current_attempts(&self) -> Vec<RecoveryAttempt> {
        self.state()
            .current
            .as_ref()
            .map(|session| session.attempts.clone())
            .unwrap_or_default()
    }

    /// Run the whole recovery battery. Step failures are recorded, never raised.
    ///
    /// Order: clear buffers, stop the failed process, reconnect the runtime, reset the sandbox.
    /// When those did not all succeed and a workload and its command are given, the fallback
    /// strategies run too.
    pub fn run_comprehensive_recovery(
        &self,
        failed_process: Option<&FailedProcess>,
        workload: Option<&Workload>,
        original_command: Option<&[String]>,
    ) -> RecoverySession {
        let _session = self
            .session_guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut session = RecoverySession::new();
        if let Some(failed) = failed_process {
            session
                .context
                .insert("failed_command".into(), failed.command.join(" ").into());
            session
                .context
                .insert("failed_pid".into(), failed.pid.into());
        }
        if let Some(workload) = workload {
            session
                .context
                .insert("workload".into(), workload.name.clone().into());
        }
        start_group!(format!("Running recovery session {}", session.session_id));
        self.state().current = Some(session);

        let context = StepContext {
            runtime: self.runtime.as_ref(),
            config: &self.config,
            termination: &self.termination,
        };
        self.record(steps::clear_buffers(&context));
        if let Some(failed) = failed_process {
            self.record(steps::restart_process(&context, failed));
        }
        self.record(steps::reconnect_runtime(&context));
        self.record(steps::reset_sandbox(&context));

        let primary_succeeded = self.current_attempts().iter().all(|a| a.is_success());
        let mut fallback_result = None;
        match (primary_succeeded, workload, original_command) {
            (true, _, _) => debug!("Every recovery step succeeded, no fallback needed"),
            (false, Some(workload), Some(command)) if self.config.fallback_enabled => {
                let mut attempt = RecoveryAttempt::begin(RecoveryKind::FallbackExecution);
                let result = self.execute_fallback_mode(workload, command);
                if result.success {
                    attempt.succeeded(format!("{} succeeded", result.method));
                } else {
                    attempt.failed(result.warnings.join("; "));
                }
                self.record(attempt.finish(None, format!("Fallback method {}", result.method)));
                fallback_result = Some(result);
            }
            (false, _, _) => debug!("Fallback not attempted"),
        }

        let mut state = self.state();
        let mut session = state.current.take().unwrap_or_default();
        session.fallback_activated = fallback_result.is_some();
        session.fallback_result = fallback_result;
        session.finish(self.config.success_ratio);
        state.history.push_back(session.clone());
        while state.history.len() > self.config.history_limit {
            state.history.pop_front();
        }
        drop(state);

        let successful = session.successful_attempts();
        let total = session.attempts.len();
        if session.overall_success {
            info!("Recovery succeeded ({successful}/{total} steps)");
        } else {
            error!("Recovery failed ({successful}/{total} steps)");
        }
        end_group!();
        session
    }

    /// Try the degraded strategies in order, stopping at the first success.
    pub fn execute_fallback_mode(
        &self,
        workload: &Workload,
        original_command: &[String],
    ) -> FallbackExecutionResult {
        execute_fallback_mode(&self.strategies, workload, original_command)
    }

    pub fn get_recovery_statistics(&self) -> RecoveryStatistics {
        let state = self.state();
        let total_sessions = state.history.len();
        let successful_sessions = state.history.iter().filter(|s| s.overall_success).count();

        let mut recovery_type_statistics = BTreeMap::<RecoveryKind, KindStatistics>::new();
        for attempt in state.history.iter().flat_map(|s| s.attempts.iter()) {
            let stats = recovery_type_statistics.entry(attempt.kind).or_default();
            stats.attempts += 1;
            if attempt.is_success() {
                stats.successes += 1;
            }
        }
        for stats in recovery_type_statistics.values_mut() {
            stats.success_rate = stats.successes as f64 / stats.attempts as f64;
        }

        RecoveryStatistics {
            total_sessions,
            successful_sessions,
            success_rate: if total_sessions == 0 {
                0.0
            } else {
                successful_sessions as f64 / total_sessions as f64
            },
            recovery_type_statistics,
            current_session_active: state.current.is_some(),
            last_session_time: state.history.back().and_then(|s| s.ended_at),
        }
    }

    /// Completed sessions, oldest first.
    pub fn history(&self) -> Vec<RecoverySession> {
        self.state().history.iter().cloned().collect()
    }
}
