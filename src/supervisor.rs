//! Public entry point composing tracer, monitor, detector and recovery into supervised runs.
//!
//! Runtime problems never surface as errors here: [`Supervisor::run_with_diagnostics`] and
//! [`Supervisor::run_with_auto_recovery`] always return a complete [`SupervisedRun`]. Only an
//! invalid configuration fails, when building the supervisor.

use crate::command::{ActCommandFactory, CommandFactory};
use crate::config::SupervisorConfig;
use crate::diagnosis::{
    BundleOptions, DEADLOCK_INDICATORS_KEY, DebugBundle, HangupAnalysis, HangupDetector,
    create_debug_bundle,
};
use crate::monitor::{DeadlockIndicator, MonitorOutcome, ProcessMonitor};
use crate::prelude::*;
use crate::preflight::{PreflightCheck, PreflightReport, ProbeResult, default_checks};
use crate::recovery::{
    AutoRecovery, FailedProcess, FallbackExecutionResult, FallbackStrategy, RecoverySession,
    RecoveryStatistics,
};
use crate::resources::{ResourceSampler, SysinfoSampler};
use crate::runtime::{ContainerRuntime, DockerCli};
use crate::tracer::{ExecutionTrace, ExecutionTracer, Stage};
use crate::workload::Workload;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Appended to the command built for the workload.
    pub extra_args: Vec<String>,
    pub skip_preflight: bool,
    /// Write a debug bundle there when the run fails.
    pub bundle_dir: Option<PathBuf>,
    pub trace_id: Option<String>,
    /// Shipped as `logs.txt` in debug bundles.
    pub log_file: Option<PathBuf>,
}

/// Result of a supervised run, possibly re-run after recovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisedRun {
    pub workload: String,
    pub command: Vec<String>,
    pub success: bool,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub duration_secs: f64,
    pub preflight: Option<PreflightReport>,
    pub aborted_by_preflight: bool,
    pub outcome: Option<MonitorOutcome>,
    /// Heartbeat silence found in the trace after a failed run.
    pub hang: Option<String>,
    pub trace: Option<ExecutionTrace>,
    pub analysis: Option<HangupAnalysis>,
    pub bundle: Option<DebugBundle>,
    pub recovery_sessions: Vec<RecoverySession>,
    /// Number of supervised executions, re-runs included.
    pub runs: usize,
    pub error: Option<String>,
}

impl SupervisedRun {
    fn new(workload: &Workload, command: Vec<String>) -> Self {
        Self {
            workload: workload.name.clone(),
            command,
            success: false,
            exit_code: None,
            timed_out: false,
            duration_secs: 0.0,
            preflight: None,
            aborted_by_preflight: false,
            outcome: None,
            hang: None,
            trace: None,
            analysis: None,
            bundle: None,
            recovery_sessions: vec![],
            runs: 1,
            error: None,
        }
    }

    /// The pid is only handed over while the process may still be alive. Once it was reaped
    /// the kernel is free to reuse it.
    pub fn failed_process(&self) -> FailedProcess {
        FailedProcess {
            pid: self
                .outcome
                .as_ref()
                .filter(|outcome| outcome.possible_zombie())
                .map(|outcome| outcome.pid),
            command: self.command.clone(),
        }
    }

    pub fn stdout(&self) -> &str {
        self.outcome
            .as_ref()
            .map_or("", |outcome| outcome.stdout.as_str())
    }

    pub fn stderr(&self) -> &str {
        self.outcome
            .as_ref()
            .map_or("", |outcome| outcome.stderr.as_str())
    }

    pub fn indicators(&self) -> &[DeadlockIndicator] {
        self.outcome
            .as_ref()
            .map(|outcome| outcome.indicators.as_slice())
            .unwrap_or_default()
    }

    /// Result of the last fallback execution, if recovery had to fall back.
    pub fn fallback_result(&self) -> Option<&FallbackExecutionResult> {
        self.recovery_sessions
            .iter()
            .rev()
            .find_map(|session| session.fallback_result.as_ref())
    }
}

/// Environment-only diagnosis, without running a workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentDiagnosis {
    pub preflight: PreflightReport,
    pub analysis: HangupAnalysis,
    pub bundle: Option<DebugBundle>,
}

pub struct SupervisorBuilder {
    config: SupervisorConfig,
    sampler: Option<Arc<dyn ResourceSampler>>,
    runtime: Option<Arc<dyn ContainerRuntime>>,
    factory: Option<Box<dyn CommandFactory>>,
    checks: Option<Vec<Box<dyn PreflightCheck>>>,
    strategies: Option<Vec<Box<dyn FallbackStrategy>>>,
}

impl SupervisorBuilder {
    pub fn sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn command_factory(mut self, factory: impl CommandFactory + 'static) -> Self {
        self.factory = Some(Box::new(factory));
        self
    }

    pub fn preflight_checks(mut self, checks: Vec<Box<dyn PreflightCheck>>) -> Self {
        self.checks = Some(checks);
        self
    }

    pub fn fallback_strategies(mut self, strategies: Vec<Box<dyn FallbackStrategy>>) -> Self {
        self.strategies = Some(strategies);
        self
    }

    /// Validate the configuration and wire the components together. Collaborators that were not
    /// provided default to the sysinfo sampler, the docker CLI and the `act` command factory.
    pub fn build(self) -> Result<Supervisor> {
        let config = self.config;
        config.validate().context("Invalid supervisor configuration")?;

        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SysinfoSampler::new()));
        let tracer = Arc::new(ExecutionTracer::new(
            config.tracer.clone(),
            Arc::clone(&sampler),
        )?);
        let runtime = self.runtime.unwrap_or_else(|| {
            Arc::new(
                DockerCli::new(config.diagnosis.runtime_socket.clone())
                    .with_tracer(Arc::clone(&tracer)),
            )
        });
        let checks = self
            .checks
            .unwrap_or_else(|| default_checks(&config.diagnosis, Arc::clone(&runtime)));

        let monitor = Arc::new(
            ProcessMonitor::new(config.monitor.clone(), Arc::clone(&sampler))?
                .with_tracer(Arc::clone(&tracer)),
        );
        let detector = HangupDetector::new(
            config.diagnosis.clone(),
            Arc::clone(&runtime),
            Arc::clone(&sampler),
        )?
        .with_container_filter(config.recovery.container_name_filter.clone());
        let mut recovery = AutoRecovery::new(
            config.recovery.clone(),
            config.monitor.termination.clone(),
            Arc::clone(&runtime),
        )?;
        if let Some(strategies) = self.strategies {
            recovery = recovery.with_strategies(strategies);
        }

        Ok(Supervisor {
            config,
            factory: self
                .factory
                .unwrap_or_else(|| Box::new(ActCommandFactory::default())),
            checks,
            tracer,
            monitor,
            detector,
            recovery,
        })
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    factory: Box<dyn CommandFactory>,
    checks: Vec<Box<dyn PreflightCheck>>,
    tracer: Arc<ExecutionTracer>,
    monitor: Arc<ProcessMonitor>,
    detector: HangupDetector,
    recovery: AutoRecovery,
}

impl Supervisor {
    pub fn builder(config: SupervisorConfig) -> SupervisorBuilder {
        SupervisorBuilder {
            config,
            sampler: None,
            runtime: None,
            factory: None,
            checks: None,
            strategies: None,
        }
    }

    /// Supervisor with the default collaborators.
    pub fn new(config: SupervisorConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn tracer(&self) -> &Arc<ExecutionTracer> {
        &self.tracer
    }

    /// Pre-flight checks, then one supervised, traced execution of `workload`. A failed run is
    /// analyzed, and packaged into a debug bundle when `options.bundle_dir` is set.
    ///
    /// Monitoring runs on the blocking pool, the runtime stays free meanwhile.
    pub async fn run_with_diagnostics(
        &self,
        workload: &Workload,
        options: &RunOptions,
    ) -> SupervisedRun {
        let started = Instant::now();
        let builder = self.factory.build(workload, &options.extra_args);
        let mut run = SupervisedRun::new(workload, builder.argv());
        start_opened_group!(format!("Supervising {}", workload.name));

        if !options.skip_preflight {
            let report = PreflightReport::run(&self.checks);
            if report.has_errors() {
                let failed = report.errors().map(|probe| probe.name.as_str()).join(", ");
                error!("Pre-flight checks failed ({failed}), not starting the workload");
                run.error = Some(format!("pre-flight checks failed: {failed}"));
                run.aborted_by_preflight = true;
                run.analysis = Some(
                    self.detector
                        .analyze_hangup_conditions(None, &report.results),
                );
                run.preflight = Some(report);
                self.write_bundle(&mut run, options).await;
                run.duration_secs = started.elapsed().as_secs_f64();
                end_group!();
                return run;
            }
            run.preflight = Some(report);
        }

        let traced = match self.tracer.start_trace(options.trace_id.clone()) {
            Ok(_) => true,
            Err(e) => {
                warn!("Running without a trace: {e:#}");
                false
            }
        };
        self.tracer.set_stage(
            Stage::Initialization,
            Some(BTreeMap::from([
                ("workload".to_string(), workload.name.clone().into()),
                ("command".to_string(), builder.as_command_line().into()),
            ])),
        );

        let monitor = Arc::clone(&self.monitor);
        let command = builder.clone();
        let supervised = tokio::task::spawn_blocking(move || monitor.supervise(&command))
            .await
            .context("Failed to join the monitoring task")
            .and_then(|result| result);
        match supervised {
            Ok(outcome) => {
                if !outcome.indicators.is_empty() {
                    match serde_json::to_value(&outcome.indicators) {
                        Ok(value) => self.tracer.insert_metadata(DEADLOCK_INDICATORS_KEY, value),
                        Err(e) => warn!("Failed to record deadlock indicators: {e}"),
                    }
                }
                run.success = outcome.success();
                run.exit_code = outcome.exit_code;
                run.timed_out = outcome.timed_out;
                run.error = outcome.error.clone();
                run.outcome = Some(outcome);
            }
            Err(e) => {
                error!("Failed to start the workload: {e:#}");
                run.error = Some(format!("{e:#}"));
            }
        }

        if traced && !run.success {
            if let Some(hang) = self.tracer.detect_hang(self.config.monitor.activity_timeout) {
                warn!("{}", hang.message);
                run.hang = Some(hang.message);
            }
        }
        run.trace = if traced { self.tracer.end_trace() } else { None };

        if !run.success {
            let probes = run
                .preflight
                .as_ref()
                .map(|report| report.results.as_slice())
                .unwrap_or_default();
            run.analysis = Some(
                self.detector
                    .analyze_hangup_conditions(run.trace.as_ref(), probes),
            );
            self.write_bundle(&mut run, options).await;
        }

        run.duration_secs = started.elapsed().as_secs_f64();
        end_group!();
        run
    }

    /// [`Self::run_with_diagnostics`], followed on failure by recovery sessions. The workload is
    /// re-run after each successful session, up to `recovery.max-recovery-attempts` times.
    pub async fn run_with_auto_recovery(
        &self,
        workload: &Workload,
        options: &RunOptions,
    ) -> SupervisedRun {
        let max_attempts = self.config.recovery.max_recovery_attempts;
        let mut run = self.run_with_diagnostics(workload, options).await;
        let mut sessions = vec![];
        let mut runs = 1;

        for attempt in 1..=max_attempts {
            if run.success {
                break;
            }
            info!("Recovery attempt {attempt}/{max_attempts}");
            let session = self.recovery.run_comprehensive_recovery(
                Some(&run.failed_process()),
                Some(workload),
                Some(&run.command),
            );
            let recovered = session.overall_success;
            sessions.push(session);
            if !recovered {
                warn!("Recovery did not succeed, not re-running the workload");
                break;
            }

            info!("Re-running {} after recovery", workload.name);
            run = self.run_with_diagnostics(workload, options).await;
            runs += 1;
        }

        run.recovery_sessions = sessions;
        run.runs = runs;
        run
    }

    /// Analyze the environment alone, optionally packaged into a debug bundle.
    pub async fn diagnose(
        &self,
        bundle_dir: Option<&Path>,
        log_file: Option<PathBuf>,
    ) -> EnvironmentDiagnosis {
        let preflight = PreflightReport::run(&self.checks);
        let analysis = self
            .detector
            .analyze_hangup_conditions(None, &preflight.results);
        let bundle = match bundle_dir {
            Some(dir) => {
                let report = self
                    .detector
                    .generate_detailed_error_report(Some(analysis.clone()), None);
                Some(create_debug_bundle(&report, dir, &BundleOptions::full(log_file)).await)
            }
            None => None,
        };
        EnvironmentDiagnosis {
            preflight,
            analysis,
            bundle,
        }
    }

    /// Run the degraded strategies directly, skipping normal execution.
    pub fn fallback(&self, workload: &Workload, extra_args: &[String]) -> FallbackExecutionResult {
        let command = self.factory.build(workload, extra_args).argv();
        self.recovery.execute_fallback_mode(workload, &command)
    }

    pub fn recovery_statistics(&self) -> RecoveryStatistics {
        self.recovery.get_recovery_statistics()
    }

    pub fn preflight(&self) -> Vec<ProbeResult> {
        PreflightReport::run(&self.checks).results
    }

    async fn write_bundle(&self, run: &mut SupervisedRun, options: &RunOptions) {
        let Some(dir) = &options.bundle_dir else {
            return;
        };
        let report = self
            .detector
            .generate_detailed_error_report(run.analysis.clone(), run.trace.clone());
        let bundle =
            create_debug_bundle(&report, dir, &BundleOptions::full(options.log_file.clone())).await;
        match &bundle.path {
            Some(path) => info!("Debug bundle written to {}", path.display()),
            None => warn!(
                "Debug bundle could not be written: {}",
                bundle.metadata.error.as_deref().unwrap_or("unknown error")
            ),
        }
        run.bundle = Some(bundle);
    }
}
