//! Classify why a run hung.
//!
//! [`HangupDetector::analyze_hangup_conditions`] runs every detector against a trace and the live
//! environment, keeps the issues confident enough to act on and ranks them. The result can be
//! packaged into an [`ErrorReport`] and a [`DebugBundle`] for offline troubleshooting.

mod bundle;
mod detectors;
mod issue;
mod report;

pub use bundle::{
    BundleMetadata, BundleOptions, DOCKER_INFO_FILE, DebugBundle, ERROR_REPORT_FILE, LOGS_FILE,
    METADATA_FILE, SYSTEM_INFO_FILE, create_debug_bundle,
};
pub use detectors::{DEADLOCK_INDICATORS_KEY, DiagnosisContext};
pub use issue::*;
pub use report::{EnvironmentSnapshot, ErrorReport, RuntimeStatus, ToolStatus, TroubleshootingSection};

use crate::config::DiagnosisConfig;
use crate::prelude::*;
use crate::preflight::ProbeResult;
use crate::resources::ResourceSampler;
use crate::runtime::ContainerRuntime;
use crate::tracer::{ExecutionTrace, seconds_between};
use chrono::Utc;
use std::cmp::Ordering;
use std::sync::Arc;

const GENERIC_RECOVERY_SUGGESTIONS: &[&str] = &[
    "Re-run the workload with `--auto-recovery`",
    "Attach the debug bundle (`--bundle-dir`) when reporting the problem",
];

fn prevention_measure(kind: HangupKind) -> &'static str {
    match kind {
        HangupKind::RuntimeUnavailable => "Enable the container runtime at boot (`systemctl enable docker`)",
        HangupKind::RuntimeUnresponsive => "Prune runtime state regularly and cap concurrent containers",
        HangupKind::PermissionDenied => "Run workloads as a user of the docker group",
        HangupKind::MissingDependency => "Pre-install and pin the required tools in the runner image",
        HangupKind::StaleHeartbeat => "Make long steps print progress at least every minute",
        HangupKind::ExternalOperationStuck => "Give every runtime call made by the workload an explicit timeout",
        HangupKind::ProcessStall => "Keep steps non-interactive, never read from stdin",
        HangupKind::ResourceExhaustion => "Set container memory limits and schedule disk cleanup",
        HangupKind::OrphanedContainers => "Remove workload containers at the end of every run",
        HangupKind::EnvironmentCheckFailed => "Run `hangwatch diagnose` before scheduling workloads",
    }
}

/// Most severe first, then most confident.
fn rank(a: &HangupIssue, b: &HangupIssue) -> Ordering {
    b.severity
        .cmp(&a.severity)
        .then_with(|| b.confidence.total_cmp(&a.confidence))
}

/// Keep the issues whose confidence reaches `threshold`, ranked.
pub fn rank_issues(mut issues: Vec<HangupIssue>, threshold: f64) -> Vec<HangupIssue> {
    issues.retain(|issue| issue.confidence >= threshold);
    issues.sort_by(rank);
    issues
}

pub struct HangupDetector {
    config: DiagnosisConfig,
    runtime: Arc<dyn ContainerRuntime>,
    sampler: Arc<dyn ResourceSampler>,
    container_filter: String,
}

impl HangupDetector {
    pub fn new(
        config: DiagnosisConfig,
        runtime: Arc<dyn ContainerRuntime>,
        sampler: Arc<dyn ResourceSampler>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            runtime,
            sampler,
            container_filter: String::new(),
        })
    }

    /// Containers whose name contains `filter` are reported when left behind.
    pub fn with_container_filter(mut self, filter: impl Into<String>) -> Self {
        self.container_filter = filter.into();
        self
    }

    pub fn config(&self) -> &DiagnosisConfig {
        &self.config
    }

    /// Run every detector and rank what they found.
    ///
    /// `probes` are pre-flight results gathered by the caller, they are used as evidence only.
    pub fn analyze_hangup_conditions(
        &self,
        trace: Option<&ExecutionTrace>,
        probes: &[ProbeResult],
    ) -> HangupAnalysis {
        let started_at = Utc::now();
        start_group!("Analyzing hang conditions");

        let context = DiagnosisContext::new(
            &self.config,
            self.runtime.as_ref(),
            self.sampler.as_ref(),
            trace,
            probes,
            &self.container_filter,
        );
        let mut found = vec![];
        for (kind, detect) in detectors::DETECTORS {
            let issues = detect(&context);
            debug!("{kind}: {} issue(s)", issues.len());
            found.extend(issues);
        }

        for issue in &mut found {
            if let Some(confidence) = self.config.confidence_overrides.get(&issue.kind) {
                issue.confidence = *confidence;
            }
        }

        let total = found.len();
        let issues = rank_issues(found, self.config.confidence_threshold);
        if issues.len() < total {
            debug!(
                "Dropped {} issue(s) below confidence {}",
                total - issues.len(),
                self.config.confidence_threshold
            );
        }
        let primary_cause = issues.first().cloned();
        match &primary_cause {
            Some(primary) => warn!(
                "Probable cause: {} ({}, confidence {:.2})",
                primary.title, primary.severity, primary.confidence
            ),
            None => info!("No probable cause found"),
        }

        let ping = context.ping();
        let system_state = SystemState {
            resources: context.system().cloned(),
            runtime_reachable: Some(ping.success()),
            runtime_response_secs: (!ping.timed_out && ping.error.is_none())
                .then(|| ping.elapsed.as_secs_f64()),
            probes: probes.to_vec(),
            trace_id: trace.map(|trace| trace.trace_id.clone()),
            trace_stage: trace.map(|trace| trace.current_stage),
            open_external_operations: trace
                .map(|trace| trace.open_external_operations().count())
                .unwrap_or_default(),
        };
        let recovery_suggestions = recovery_suggestions(primary_cause.as_ref());
        let prevention_measures = issues
            .iter()
            .map(|issue| prevention_measure(issue.kind).to_string())
            .unique()
            .collect();
        end_group!();

        let ended_at = Utc::now();
        HangupAnalysis {
            analysis_id: format!("analysis-{}", uuid::Uuid::new_v4()),
            started_at,
            ended_at,
            duration_secs: seconds_between(started_at, ended_at),
            issues,
            primary_cause,
            system_state,
            recovery_suggestions,
            prevention_measures,
        }
    }

    /// Aggregate an analysis with environment and runtime snapshots. Every field is best effort.
    pub fn generate_detailed_error_report(
        &self,
        analysis: Option<HangupAnalysis>,
        trace: Option<ExecutionTrace>,
    ) -> ErrorReport {
        let next_steps = report::next_steps(analysis.as_ref());
        ErrorReport {
            report_id: format!("report-{}", uuid::Uuid::new_v4()),
            generated_at: Utc::now(),
            hangwatch_version: crate::VERSION.to_string(),
            analysis,
            environment: EnvironmentSnapshot::collect(),
            runtime_status: RuntimeStatus::collect(self.runtime.as_ref(), self.config.probe_timeout),
            tools: report::tool_statuses(&self.config.required_binaries),
            troubleshooting: report::troubleshooting_outline(),
            next_steps,
            trace,
        }
    }
}

fn recovery_suggestions(primary: Option<&HangupIssue>) -> Vec<String> {
    primary
        .into_iter()
        .flat_map(|issue| issue.recommendations.iter().cloned())
        .chain(GENERIC_RECOVERY_SUGGESTIONS.iter().map(|s| s.to_string()))
        .unique()
        .collect()
}
