use crate::diagnosis::HangupKind;
use crate::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file names in priority order
const CONFIG_FILENAMES: &[&str] = &[
    "hangwatch.yaml",
    "hangwatch.yml",
    ".hangwatch.yaml",
    ".hangwatch.yml",
];

/// Parse a duration string.
/// Supports humantime format: "1s", "500ms", "1.5s", "2m", "1h", etc.
/// Also supports pure numbers interpreted as seconds (e.g., "2" = 2s, "1.5" = 1.5s)
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();

    if let Ok(seconds) = s.parse::<f64>() {
        ensure!(
            seconds.is_finite() && seconds >= 0.0,
            "Invalid duration: '{s}' must be a positive number of seconds"
        );
        return Ok(Duration::from_secs_f64(seconds));
    }

    humantime::parse_duration(s).with_context(|| {
        format!("Invalid duration format: '{s}'. Expected format like '1s', '500ms', '2m', '1h' or a number in seconds")
    })
}

mod duration_format {
    use serde::{Deserialize, Deserializer, Serializer, de};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDuration {
        Seconds(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        match RawDuration::deserialize(deserializer)? {
            RawDuration::Seconds(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                Ok(Duration::from_secs_f64(seconds))
            }
            RawDuration::Seconds(seconds) => Err(de::Error::custom(format!(
                "invalid duration: {seconds}"
            ))),
            RawDuration::Text(text) => {
                super::parse_duration(&text).map_err(|e| de::Error::custom(format!("{e:#}")))
            }
        }
    }
}

/// Wait budgets of the staged termination contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TerminationConfig {
    #[serde(with = "duration_format")]
    pub graceful_wait: Duration,
    #[serde(with = "duration_format")]
    pub group_wait: Duration,
    #[serde(with = "duration_format")]
    pub kill_wait: Duration,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            graceful_wait: Duration::from_secs(5),
            group_wait: Duration::from_secs(2),
            kill_wait: Duration::from_secs(3),
        }
    }
}

impl TerminationConfig {
    /// Upper bound of time spent inside the staged termination.
    pub fn grace_period(&self) -> Duration {
        self.graceful_wait + self.group_wait + self.kill_wait
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MonitorConfig {
    #[serde(with = "duration_format")]
    pub warning_timeout: Duration,
    #[serde(with = "duration_format")]
    pub escalation_timeout: Duration,
    #[serde(with = "duration_format")]
    pub final_timeout: Duration,
    #[serde(with = "duration_format")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_format")]
    pub resource_check_interval: Duration,
    #[serde(with = "duration_format")]
    pub deadlock_check_interval: Duration,
    /// Maximum silence on both output streams before the run is flagged as stalled.
    #[serde(with = "duration_format")]
    pub activity_timeout: Duration,
    /// Tick of the watch loop.
    #[serde(with = "duration_format")]
    pub poll_interval: Duration,
    #[serde(with = "duration_format")]
    pub reader_join_timeout: Duration,
    /// Copy the workload output to our own stdout and stderr.
    pub echo_output: bool,
    pub termination: TerminationConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            warning_timeout: Duration::from_secs(5 * 60),
            escalation_timeout: Duration::from_secs(10 * 60),
            final_timeout: Duration::from_secs(15 * 60),
            heartbeat_interval: Duration::from_secs(30),
            resource_check_interval: Duration::from_secs(10),
            deadlock_check_interval: Duration::from_secs(15),
            activity_timeout: Duration::from_secs(3 * 60),
            poll_interval: Duration::from_secs(1),
            reader_join_timeout: Duration::from_secs(2),
            echo_output: true,
            termination: TerminationConfig::default(),
        }
    }
}

impl MonitorConfig {
    /// Shorthand used by callers that only care about the three staged thresholds.
    pub fn with_timeouts(warning: Duration, escalation: Duration, final_timeout: Duration) -> Self {
        Self {
            warning_timeout: warning,
            escalation_timeout: escalation,
            final_timeout,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("warning-timeout", self.warning_timeout),
            ("escalation-timeout", self.escalation_timeout),
            ("final-timeout", self.final_timeout),
            ("heartbeat-interval", self.heartbeat_interval),
            ("resource-check-interval", self.resource_check_interval),
            ("deadlock-check-interval", self.deadlock_check_interval),
            ("activity-timeout", self.activity_timeout),
            ("poll-interval", self.poll_interval),
        ] {
            ensure!(!value.is_zero(), "monitor.{name} must be greater than zero");
        }
        ensure!(
            self.warning_timeout < self.escalation_timeout,
            "monitor.warning-timeout ({:?}) must be lower than monitor.escalation-timeout ({:?})",
            self.warning_timeout,
            self.escalation_timeout
        );
        ensure!(
            self.escalation_timeout < self.final_timeout,
            "monitor.escalation-timeout ({:?}) must be lower than monitor.final-timeout ({:?})",
            self.escalation_timeout,
            self.final_timeout
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TracerConfig {
    #[serde(with = "duration_format")]
    pub resource_monitoring_interval: Duration,
    /// Capacity of the resource sample ring buffer.
    pub max_resource_samples: usize,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            resource_monitoring_interval: Duration::from_secs(5),
            max_resource_samples: 720,
        }
    }
}

impl TracerConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.resource_monitoring_interval.is_zero(),
            "tracer.resource-monitoring-interval must be greater than zero"
        );
        ensure!(
            self.max_resource_samples > 0,
            "tracer.max-resource-samples must be greater than zero"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DiagnosisConfig {
    /// Issues below this confidence are dropped from an analysis.
    pub confidence_threshold: f64,
    #[serde(with = "duration_format")]
    pub probe_timeout: Duration,
    /// A runtime answering slower than this is reported as degraded.
    #[serde(with = "duration_format")]
    pub slow_response_threshold: Duration,
    #[serde(with = "duration_format")]
    pub stale_heartbeat_threshold: Duration,
    pub required_binaries: Vec<String>,
    pub runtime_socket: Option<PathBuf>,
    /// Replaces the built-in confidence of every issue of a kind.
    pub confidence_overrides: BTreeMap<HangupKind, f64>,
}

impl Default for DiagnosisConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            probe_timeout: Duration::from_secs(10),
            slow_response_threshold: Duration::from_secs(5),
            stale_heartbeat_threshold: Duration::from_secs(2 * 60),
            required_binaries: vec!["act".into(), "docker".into()],
            runtime_socket: Some(PathBuf::from("/var/run/docker.sock")),
            confidence_overrides: BTreeMap::new(),
        }
    }
}

impl DiagnosisConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.confidence_threshold),
            "diagnosis.confidence-threshold must be within [0, 1], got {}",
            self.confidence_threshold
        );
        ensure!(
            !self.probe_timeout.is_zero(),
            "diagnosis.probe-timeout must be greater than zero"
        );
        for (kind, confidence) in &self.confidence_overrides {
            ensure!(
                (0.0..=1.0).contains(confidence),
                "diagnosis.confidence-overrides.{kind} must be within [0, 1], got {confidence}"
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RecoveryConfig {
    /// How many times a failed run is retried after a successful recovery session.
    pub max_recovery_attempts: u32,
    pub fallback_enabled: bool,
    /// Share of successful attempts needed for a session to count as successful.
    pub success_ratio: f64,
    pub history_limit: usize,
    #[serde(with = "duration_format")]
    pub step_timeout: Duration,
    /// Containers whose name contains this string belong to the workload.
    pub container_name_filter: String,
    pub fallback_image: String,
    /// Scratch files and directories wiped by the buffer-clear step.
    pub scratch_paths: Vec<PathBuf>,
    /// Pause between restarting the runtime and probing it again.
    #[serde(with = "duration_format")]
    pub reconnect_settle: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_recovery_attempts: 1,
            fallback_enabled: true,
            success_ratio: 0.6,
            history_limit: 50,
            step_timeout: Duration::from_secs(60),
            container_name_filter: "act-".into(),
            fallback_image: "catthehacker/ubuntu:act-latest".into(),
            scratch_paths: vec![],
            reconnect_settle: Duration::from_secs(3),
        }
    }
}

impl RecoveryConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.success_ratio > 0.0 && self.success_ratio <= 1.0,
            "recovery.success-ratio must be within (0, 1], got {}",
            self.success_ratio
        );
        ensure!(
            self.history_limit > 0,
            "recovery.history-limit must be greater than zero"
        );
        ensure!(
            !self.step_timeout.is_zero(),
            "recovery.step-timeout must be greater than zero"
        );
        Ok(())
    }
}

/// Complete configuration of a supervisor.
///
/// Loaded from `hangwatch.yaml` (see [`SupervisorConfig::discover_and_load`]) and then
/// overridden by command-line flags. Every field has a default, so an empty file is valid.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SupervisorConfig {
    pub monitor: MonitorConfig,
    pub tracer: TracerConfig,
    pub diagnosis: DiagnosisConfig,
    pub recovery: RecoveryConfig,
}

impl SupervisorConfig {
    pub fn validate(&self) -> Result<()> {
        self.monitor.validate()?;
        self.tracer.validate()?;
        self.diagnosis.validate()?;
        self.recovery.validate()?;
        Ok(())
    }

    /// Load the configuration file
    ///
    /// # Search Strategy
    /// 1. If `config_path_override` is provided, load from that path only (error if not found)
    /// 2. Otherwise, try the known file names in `current_dir`, in priority order
    /// 3. If nothing is found, return the default configuration
    pub fn discover_and_load(config_path_override: Option<&Path>, current_dir: &Path) -> Result<Self> {
        if let Some(config_path) = config_path_override {
            return Self::load_from_path(config_path)
                .with_context(|| format!("Failed to load config from {}", config_path.display()));
        }

        for filename in CONFIG_FILENAMES {
            let candidate_path = current_dir.join(filename);
            if candidate_path.exists() {
                debug!("Found config file at {}", candidate_path.display());
                return Self::load_from_path(&candidate_path);
            }
        }

        debug!("No config file found in {}", current_dir.display());
        Ok(Self::default())
    }

    /// Load and parse config from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let config_content = fs::read(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;

        // An empty document deserializes to unit, not to a map
        if config_content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }

        let config: Self = serde_yaml::from_slice(&config_content)
            .with_context(|| format!("Failed to parse hangwatch config at {}", path.display()))?;
        config.validate()?;

        Ok(config)
    }
}
