use super::{MessageFormat, TimeoutArgs, WorkloadArgs, print_json, show_banner};
use crate::config::SupervisorConfig;
use crate::prelude::*;
use crate::run_logger::RunLogger;
use crate::supervisor::{RunOptions, SupervisedRun, Supervisor};
use clap::Args;
use console::style;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub workload: WorkloadArgs,

    #[command(flatten)]
    pub timeouts: TimeoutArgs,

    /// Run recovery steps when the workload fails or hangs, then run it again
    #[arg(long, default_value = "false")]
    pub auto_recovery: bool,

    /// Write a debug bundle to this directory when the workload fails
    #[arg(long, env = "HANGWATCH_BUNDLE_DIR")]
    pub bundle_dir: Option<PathBuf>,

    /// Skip the environment checks run before the workload
    #[arg(long, default_value = "false")]
    pub skip_preflight: bool,

    /// Print the result as JSON on stdout
    #[arg(long)]
    pub message_format: Option<MessageFormat>,

    /// Extra arguments passed to the job runner, after `--`
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

pub async fn run(args: RunArgs, mut config: SupervisorConfig, logger: &RunLogger) -> Result<()> {
    let output_json = args.message_format == Some(MessageFormat::Json);
    if !output_json {
        show_banner();
    }

    args.timeouts.apply_to(&mut config.monitor);
    let supervisor = Supervisor::new(config)?;
    let workload = args.workload.workload()?;
    let options = RunOptions {
        extra_args: args.extra_args,
        skip_preflight: args.skip_preflight,
        bundle_dir: args.bundle_dir,
        trace_id: None,
        log_file: Some(logger.log_file_path().to_path_buf()),
    };

    let bundle_dir = options.bundle_dir.clone();
    let run = if args.auto_recovery {
        supervisor.run_with_auto_recovery(&workload, &options).await
    } else {
        supervisor.run_with_diagnostics(&workload, &options).await
    };

    if output_json {
        print_json(&run)?;
    } else {
        display_summary(&run);
    }

    if !run.success {
        // Keep the full log, summary included, next to the bundles
        if let Some(dir) = bundle_dir.filter(|dir| dir.is_dir()) {
            match logger.persist_to(&dir) {
                Ok(path) => info!("Full log written to {}", path.display()),
                Err(e) => warn!("Could not keep the run log: {e:#}"),
            }
        }
        bail!(
            "{} failed{}",
            workload.name,
            run.error
                .as_deref()
                .map(|error| format!(": {error}"))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn display_summary(run: &SupervisedRun) {
    start_opened_group!("Summary");
    let verdict = if run.success {
        style("succeeded").green().bold()
    } else if run.timed_out {
        style("hung").red().bold()
    } else {
        style("failed").red().bold()
    };
    info!(
        "{} {verdict} after {:.1}s ({} run{})",
        run.workload,
        run.duration_secs,
        run.runs,
        if run.runs > 1 { "s" } else { "" }
    );
    if let Some(code) = run.exit_code {
        info!("Exit code: {code}");
    }
    for indicator in run.indicators() {
        warn!("Deadlock indicator: {} ({})", indicator.kind, indicator.details);
    }
    if let Some(hang) = &run.hang {
        warn!("{hang}");
    }

    if let Some(analysis) = &run.analysis {
        for issue in &analysis.issues {
            info!(
                "{} [{}] {} (confidence {:.2})",
                style("-").dim(),
                issue.severity,
                issue.title,
                issue.confidence
            );
        }
        if let Some(primary) = &analysis.primary_cause {
            info!("Probable cause: {}", style(&primary.title).bold());
            for command in &primary.fix_commands {
                info!("  try: {}", style(command).cyan());
            }
        }
    }

    for session in &run.recovery_sessions {
        info!(
            "Recovery {}: {}/{} steps succeeded",
            session.session_id,
            session.successful_attempts(),
            session.attempts.len()
        );
    }
    if let Some(fallback) = run.fallback_result() {
        info!(
            "Fallback {} {}",
            fallback.method,
            if fallback.success { "succeeded" } else { "failed" }
        );
        for limitation in &fallback.limitations {
            warn!("  {limitation}");
        }
    }

    if let Some(bundle) = &run.bundle {
        match &bundle.path {
            Some(path) => info!("Debug bundle: {}", path.display()),
            None => warn!(
                "Debug bundle not written: {}",
                bundle.metadata.error.as_deref().unwrap_or("unknown error")
            ),
        }
    }
    end_group!();
}
