//! Degraded execution paths, tried in order when normal execution and recovery both failed.

use super::session::FallbackExecutionResult;
use crate::command::CommandBuilder;
use crate::config::RecoveryConfig;
use crate::prelude::*;
use crate::process::{CommandOutput, run_bounded};
use crate::runtime::ContainerRuntime;
use crate::workload::{WorkflowDefinition, Workload};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DIRECT_CONTAINER_METHOD: &str = "direct-container";
pub const DRY_RUN_METHOD: &str = "dry-run";
pub const LOCAL_PARSE_METHOD: &str = "local-parse";

pub trait FallbackStrategy: Send + Sync {
    fn method(&self) -> &str;

    fn execute(&self, workload: &Workload, original_command: &[String]) -> FallbackExecutionResult;
}

fn from_output(
    method: &str,
    output: CommandOutput,
    limitations: Vec<String>,
) -> FallbackExecutionResult {
    let mut warnings = vec![];
    if !output.success() {
        warnings.push(output.summary());
    }
    FallbackExecutionResult {
        success: output.success(),
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
        duration_secs: output.elapsed.as_secs_f64(),
        method: method.to_string(),
        limitations,
        warnings,
    }
}

/// Run the `run:` scripts of the workload in a throwaway container, bypassing the job runner.
pub struct DirectContainerStrategy {
    runtime: Arc<dyn ContainerRuntime>,
    image: String,
    timeout: Duration,
}

impl DirectContainerStrategy {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, image: impl Into<String>, timeout: Duration) -> Self {
        Self {
            runtime,
            image: image.into(),
            timeout,
        }
    }
}

impl FallbackStrategy for DirectContainerStrategy {
    fn method(&self) -> &str {
        DIRECT_CONTAINER_METHOD
    }

    fn execute(&self, workload: &Workload, _original_command: &[String]) -> FallbackExecutionResult {
        let definition = match WorkflowDefinition::load(&workload.definition_path()) {
            Ok(definition) => definition,
            Err(e) => return FallbackExecutionResult::failure(self.method(), format!("{e:#}")),
        };
        let Some(script) = definition.run_script(workload.job.as_deref()) else {
            return FallbackExecutionResult::failure(
                self.method(),
                "The selected jobs have no `run:` steps",
            );
        };

        let output = self
            .runtime
            .run_script(&self.image, &workload.working_dir, &script, self.timeout);
        from_output(
            self.method(),
            output,
            vec![
                "Only `run:` steps were executed, `uses:` actions were skipped".into(),
                "Services, matrices and job dependencies were ignored".into(),
                format!("Every job ran in one {} container", self.image),
            ],
        )
    }
}

/// Ask the job runner to plan the workload without executing it.
pub struct DryRunStrategy {
    flag: String,
    timeout: Duration,
}

impl DryRunStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            flag: "--dryrun".into(),
            timeout,
        }
    }
}

impl FallbackStrategy for DryRunStrategy {
    fn method(&self) -> &str {
        DRY_RUN_METHOD
    }

    fn execute(&self, workload: &Workload, original_command: &[String]) -> FallbackExecutionResult {
        let Some(mut builder) = CommandBuilder::from_argv(original_command) else {
            return FallbackExecutionResult::failure(self.method(), "No original command to dry-run");
        };
        builder.arg(&self.flag);
        builder.current_dir(&workload.working_dir);
        for (key, value) in &workload.env {
            builder.env(key, value);
        }
        from_output(
            self.method(),
            run_bounded(&builder, self.timeout),
            vec!["Steps were planned, not executed".into()],
        )
    }
}

/// Parse the workflow and describe it. Never touches the runtime.
pub struct LocalParseStrategy;

impl FallbackStrategy for LocalParseStrategy {
    fn method(&self) -> &str {
        LOCAL_PARSE_METHOD
    }

    fn execute(&self, workload: &Workload, _original_command: &[String]) -> FallbackExecutionResult {
        let started = Instant::now();
        let definition = match WorkflowDefinition::load(&workload.definition_path()) {
            Ok(definition) => definition,
            Err(e) => return FallbackExecutionResult::failure(self.method(), format!("{e:#}")),
        };

        let mut stdout = String::new();
        let mut jobs = 0;
        for (id, job) in definition.selected_jobs(workload.job.as_deref()) {
            jobs += 1;
            let _ = writeln!(stdout, "job {id}: {}", job.name.as_deref().unwrap_or(id));
            for step in &job.steps {
                let _ = writeln!(stdout, "  - {}", step.label());
            }
        }
        if jobs == 0 {
            return FallbackExecutionResult::failure(
                self.method(),
                format!(
                    "Job `{}` is not defined in {}",
                    workload.job.as_deref().unwrap_or_default(),
                    workload.definition.display()
                ),
            );
        }

        FallbackExecutionResult {
            success: true,
            exit_code: None,
            stdout,
            stderr: String::new(),
            duration_secs: started.elapsed().as_secs_f64(),
            method: self.method().to_string(),
            limitations: vec![
                "Nothing was executed, the workflow was only parsed".into(),
                "Expressions and `uses:` actions were not resolved".into(),
            ],
            warnings: vec!["This result does not prove the workload succeeds".into()],
        }
    }
}

pub fn default_strategies(
    runtime: Arc<dyn ContainerRuntime>,
    config: &RecoveryConfig,
) -> Vec<Box<dyn FallbackStrategy>> {
    vec![
        Box::new(DirectContainerStrategy::new(
            runtime,
            config.fallback_image.clone(),
            config.step_timeout,
        )),
        Box::new(DryRunStrategy::new(config.step_timeout)),
        Box::new(LocalParseStrategy),
    ]
}

/// Try `strategies` in order and return the first success, or an `all-failed` result carrying
/// every strategy's warnings.
pub fn execute_fallback_mode(
    strategies: &[Box<dyn FallbackStrategy>],
    workload: &Workload,
    original_command: &[String],
) -> FallbackExecutionResult {
    let started = Instant::now();
    let mut warnings = vec![];
    for strategy in strategies {
        info!("Trying fallback strategy {}", strategy.method());
        let result = strategy.execute(workload, original_command);
        if result.success {
            info!("Fallback strategy {} succeeded", strategy.method());
            for limitation in &result.limitations {
                warn!("Fallback limitation: {limitation}");
            }
            return result;
        }
        warn!("Fallback strategy {} failed", strategy.method());
        warnings.extend(
            result
                .warnings
                .into_iter()
                .filter(|warning| !warning.is_empty())
                .map(|warning| format!("{}: {warning}", strategy.method())),
        );
    }
    error!("Every fallback strategy failed");
    FallbackExecutionResult::all_failed(warnings, started.elapsed().as_secs_f64())
}
