use super::{MessageFormat, print_json};
use crate::config::SupervisorConfig;
use crate::preflight::ProbeStatus;
use crate::prelude::*;
use crate::run_logger::RunLogger;
use crate::supervisor::Supervisor;
use clap::Args;
use console::style;
use std::path::PathBuf;

#[derive(Args, Debug)]
pub struct DiagnoseArgs {
    /// Package the analysis into a debug bundle in this directory
    #[arg(long, env = "HANGWATCH_BUNDLE_DIR")]
    pub bundle_dir: Option<PathBuf>,

    /// Print the result as JSON on stdout
    #[arg(long)]
    pub message_format: Option<MessageFormat>,
}

pub async fn run(args: DiagnoseArgs, config: SupervisorConfig, logger: &RunLogger) -> Result<()> {
    let supervisor = Supervisor::new(config)?;
    let diagnosis = supervisor
        .diagnose(
            args.bundle_dir.as_deref(),
            Some(logger.log_file_path().to_path_buf()),
        )
        .await;

    if args.message_format == Some(MessageFormat::Json) {
        print_json(&diagnosis)?;
    } else {
        for probe in &diagnosis.preflight.results {
            let status = match probe.status {
                ProbeStatus::Ok => style("ok").green(),
                ProbeStatus::Warning => style("warning").yellow(),
                ProbeStatus::Error => style("error").red(),
            };
            info!("{}: {status} {}", probe.name, probe.message);
        }
        for issue in &diagnosis.analysis.issues {
            info!(
                "[{}] {} (confidence {:.2})",
                issue.severity, issue.title, issue.confidence
            );
            for recommendation in &issue.recommendations {
                info!("  {recommendation}");
            }
        }
        if let Some(path) = diagnosis.bundle.as_ref().and_then(|b| b.path.as_ref()) {
            info!("Debug bundle: {}", path.display());
        }
    }

    if diagnosis.analysis.has_issues() {
        bail!(
            "Found {} issue(s) in the environment",
            diagnosis.analysis.issues.len()
        );
    }
    info!("{}", style("No issue found").green().bold());
    Ok(())
}
