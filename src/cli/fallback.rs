use super::{MessageFormat, WorkloadArgs, print_json};
use crate::config::SupervisorConfig;
use crate::prelude::*;
use crate::supervisor::Supervisor;
use clap::Args;

#[derive(Args, Debug)]
pub struct FallbackArgs {
    #[command(flatten)]
    pub workload: WorkloadArgs,

    /// Print the result as JSON on stdout
    #[arg(long)]
    pub message_format: Option<MessageFormat>,

    /// Extra arguments passed to the job runner, after `--`
    #[arg(last = true)]
    pub extra_args: Vec<String>,
}

pub fn run(args: FallbackArgs, config: SupervisorConfig) -> Result<()> {
    let supervisor = Supervisor::new(config)?;
    let workload = args.workload.workload()?;
    let result = supervisor.fallback(&workload, &args.extra_args);

    if args.message_format == Some(MessageFormat::Json) {
        print_json(&result)?;
    } else {
        if !result.stdout.is_empty() {
            println!("{}", result.stdout.trim_end());
        }
        for limitation in &result.limitations {
            warn!("Limitation: {limitation}");
        }
        for warning in &result.warnings {
            warn!("{warning}");
        }
    }

    ensure!(
        result.success,
        "Every fallback strategy failed for {}",
        workload.name
    );
    info!(
        "Fallback {} succeeded in {:.1}s",
        result.method, result.duration_secs
    );
    Ok(())
}
