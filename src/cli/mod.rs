mod diagnose;
mod fallback;
mod run;
mod shared;

pub(crate) use shared::*;

use crate::config::SupervisorConfig;
use crate::local_logger::HANGWATCH_U8_COLOR_CODE;
use crate::prelude::*;
use crate::run_logger::RunLogger;
use clap::{
    Parser, Subcommand,
    builder::{Styles, styling},
};
use std::path::PathBuf;

fn create_styles() -> Styles {
    styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(
            styling::Ansi256Color(HANGWATCH_U8_COLOR_CODE).on_default() | styling::Effects::BOLD,
        )
        .placeholder(styling::AnsiColor::Cyan.on_default())
}

#[derive(Parser, Debug)]
#[command(
    version,
    about = "Supervise CI workloads, diagnose hangs and recover from them",
    styles = create_styles()
)]
pub struct Cli {
    /// Path to the configuration file (hangwatch.yaml)
    /// If provided, loads config from this path. Otherwise, searches for config files
    /// in the current directory.
    #[arg(long, env = "HANGWATCH_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a workflow under supervision, diagnosing hangs and failures
    #[command(alias = "r")]
    Run(Box<run::RunArgs>),
    /// Check the environment for conditions known to make workloads hang
    Diagnose(diagnose::DiagnoseArgs),
    /// Run a workflow through the degraded fallback strategies only
    Fallback(fallback::FallbackArgs),
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let logger = RunLogger::init()?;
    let config = SupervisorConfig::discover_and_load(cli.config.as_deref(), &std::env::current_dir()?)?;

    match cli.command {
        Commands::Run(args) => run::run(*args, config, &logger).await?,
        Commands::Diagnose(args) => diagnose::run(args, config, &logger).await?,
        Commands::Fallback(args) => fallback::run(args, config)?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_parse_run() {
        let cli = Cli::try_parse_from([
            "hangwatch",
            "run",
            "-W",
            ".github/workflows/ci.yml",
            "-j",
            "build",
            "--final-timeout",
            "20m",
            "--auto-recovery",
            "--",
            "--container-architecture",
            "linux/amd64",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected the run command");
        };
        assert_eq!(args.workload.job.as_deref(), Some("build"));
        assert_eq!(args.timeouts.final_timeout, Some(Duration::from_secs(1200)));
        assert!(args.auto_recovery);
        assert!(!args.skip_preflight);
        assert_eq!(
            args.extra_args,
            vec!["--container-architecture", "linux/amd64"]
        );
    }

    #[test]
    fn test_parse_rejects_bad_duration() {
        let result = Cli::try_parse_from([
            "hangwatch",
            "run",
            "-W",
            "ci.yml",
            "--warning-timeout",
            "soon",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_diagnose_json() {
        let cli = Cli::try_parse_from([
            "hangwatch",
            "--config",
            "custom.yaml",
            "diagnose",
            "--message-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("custom.yaml")));
        let Commands::Diagnose(args) = cli.command else {
            panic!("expected the diagnose command");
        };
        assert_eq!(args.message_format, Some(MessageFormat::Json));
        assert!(args.bundle_dir.is_none());
    }

    #[test]
    fn test_workflow_is_required() {
        assert!(Cli::try_parse_from(["hangwatch", "fallback"]).is_err());
    }
}
