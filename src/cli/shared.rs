use crate::VERSION;
use crate::config::{MonitorConfig, parse_duration};
use crate::local_logger::HANGWATCH_U8_COLOR_CODE;
use crate::prelude::*;
use crate::workload::Workload;
use clap::{Args, ValueEnum};
use console::style;
use std::path::PathBuf;
use std::time::Duration;

pub(crate) fn show_banner() {
    let banner = style(format!("hangwatch v{VERSION}"))
        .color256(HANGWATCH_U8_COLOR_CODE)
        .bold();
    println!("\n{banner}  process supervision and hang diagnosis\n");
    debug!("hangwatch v{VERSION}");
}

fn parse_duration_arg(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| format!("{e:#}"))
}

/// Which workflow to run
#[derive(Args, Debug, Clone)]
pub struct WorkloadArgs {
    /// Path to the workflow definition, relative to the working directory
    #[arg(short = 'W', long)]
    pub workflow: PathBuf,

    /// Only run this job of the workflow
    #[arg(short, long)]
    pub job: Option<String>,

    /// The directory where the workload will be executed.
    #[arg(long)]
    pub working_directory: Option<PathBuf>,
}

impl WorkloadArgs {
    pub fn workload(&self) -> Result<Workload> {
        let mut workload = Workload::new(&self.workflow);
        if let Some(dir) = &self.working_directory {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("Working directory {} not found", dir.display()))?;
            workload = workload.with_working_dir(dir);
        }
        if let Some(job) = &self.job {
            workload = workload.with_job(job);
        }
        Ok(workload)
    }
}

/// Overrides of the staged timeouts from the configuration file
#[derive(Args, Debug, Clone, Default)]
pub struct TimeoutArgs {
    /// Emit a warning diagnostic once the workload runs this long (e.g. `5m`, `90s`)
    #[arg(long, env = "HANGWATCH_WARNING_TIMEOUT", value_parser = parse_duration_arg)]
    pub warning_timeout: Option<Duration>,

    /// Emit an escalation diagnostic once the workload runs this long
    #[arg(long, env = "HANGWATCH_ESCALATION_TIMEOUT", value_parser = parse_duration_arg)]
    pub escalation_timeout: Option<Duration>,

    /// Terminate the workload once it runs this long
    #[arg(long, env = "HANGWATCH_FINAL_TIMEOUT", value_parser = parse_duration_arg)]
    pub final_timeout: Option<Duration>,

    /// Flag the workload as stalled after this long without any output
    #[arg(long, value_parser = parse_duration_arg)]
    pub activity_timeout: Option<Duration>,
}

impl TimeoutArgs {
    /// CLI values take precedence over the configuration file.
    pub fn apply_to(&self, config: &mut MonitorConfig) {
        if let Some(timeout) = self.warning_timeout {
            config.warning_timeout = timeout;
        }
        if let Some(timeout) = self.escalation_timeout {
            config.escalation_timeout = timeout;
        }
        if let Some(timeout) = self.final_timeout {
            config.final_timeout = timeout;
        }
        if let Some(timeout) = self.activity_timeout {
            config.activity_timeout = timeout;
        }
    }
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
pub enum MessageFormat {
    Json,
}

/// Print `value` as pretty JSON on stdout.
pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize the result")?;
    println!("{json}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_overrides() {
        let mut config = MonitorConfig::default();
        let args = TimeoutArgs {
            final_timeout: Some(Duration::from_secs(42)),
            ..Default::default()
        };
        args.apply_to(&mut config);
        assert_eq!(config.final_timeout, Duration::from_secs(42));
        assert_eq!(
            config.warning_timeout,
            MonitorConfig::default().warning_timeout
        );
    }

    #[test]
    fn test_working_directory_must_exist() {
        let args = WorkloadArgs {
            workflow: "ci.yml".into(),
            job: Some("build".into()),
            working_directory: Some("/definitely/not/here".into()),
        };
        assert!(args.workload().is_err());

        let dir = tempfile::tempdir().unwrap();
        let args = WorkloadArgs {
            working_directory: Some(dir.path().to_path_buf()),
            ..args
        };
        let workload = args.workload().unwrap();
        assert_eq!(workload.job.as_deref(), Some("build"));
        assert_eq!(workload.working_dir, dir.path().canonicalize().unwrap());
    }
}
