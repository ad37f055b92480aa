use super::report::ErrorReport;
use crate::prelude::*;
use async_compression::tokio::write::GzipEncoder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_tar::{Builder, Header};

pub const ERROR_REPORT_FILE: &str = "error_report.json";
pub const METADATA_FILE: &str = "metadata.json";
pub const SYSTEM_INFO_FILE: &str = "system_info.json";
pub const DOCKER_INFO_FILE: &str = "docker_info.json";
pub const LOGS_FILE: &str = "logs.txt";

#[derive(Debug, Clone, Default)]
pub struct BundleOptions {
    /// Run log copied into the bundle as `logs.txt`.
    pub log_file: Option<PathBuf>,
    pub include_system_info: bool,
    pub include_runtime_info: bool,
}

impl BundleOptions {
    pub fn full(log_file: Option<PathBuf>) -> Self {
        Self {
            log_file,
            include_system_info: true,
            include_runtime_info: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleMetadata {
    pub bundle_id: String,
    pub created_at: DateTime<Utc>,
    pub hangwatch_version: String,
    pub report_id: String,
    pub analysis_id: Option<String>,
    pub primary_cause: Option<String>,
    pub files: Vec<String>,
    /// Set when the archive could not be written.
    pub error: Option<String>,
}

/// A `.tar.gz` archive rooted at `{bundle_id}/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugBundle {
    pub bundle_id: String,
    /// None when creating the archive failed, see `metadata.error`.
    pub path: Option<PathBuf>,
    pub created_at: DateTime<Utc>,
    pub metadata: BundleMetadata,
}

impl DebugBundle {
    pub fn is_written(&self) -> bool {
        self.path.is_some()
    }
}

/// Package `report` into `{out_dir}/{bundle_id}.tar.gz`.
///
/// Never fails: a write or serialization error leaves `path` empty and is recorded in the
/// bundle metadata.
pub async fn create_debug_bundle(
    report: &ErrorReport,
    out_dir: &Path,
    options: &BundleOptions,
) -> DebugBundle {
    let created_at = Utc::now();
    let bundle_id = format!(
        "hangwatch-debug-{}-{}",
        created_at.format("%Y%m%d-%H%M%S"),
        &uuid::Uuid::new_v4().simple().to_string()[..8]
    );
    let mut bundle = DebugBundle {
        bundle_id: bundle_id.clone(),
        path: None,
        created_at,
        metadata: BundleMetadata {
            bundle_id,
            created_at,
            hangwatch_version: crate::VERSION.to_string(),
            report_id: report.report_id.clone(),
            analysis_id: report.analysis_id().map(str::to_string),
            primary_cause: report.primary_cause_title().map(str::to_string),
            files: vec![],
            error: None,
        },
    };

    let archive_path = out_dir.join(format!("{}.tar.gz", bundle.bundle_id));
    match write_bundle(report, &archive_path, options, &mut bundle).await {
        Ok(()) => {
            info!("Debug bundle written to {}", archive_path.display());
            bundle.path = Some(archive_path);
        }
        Err(e) => {
            warn!("Failed to create the debug bundle: {e:#}");
            bundle.metadata.error = Some(format!("{e:#}"));
            let _ = tokio::fs::remove_file(&archive_path).await;
        }
    }
    bundle
}

async fn collect_entries(
    report: &ErrorReport,
    options: &BundleOptions,
) -> Result<Vec<(&'static str, Vec<u8>)>> {
    let mut entries = vec![(
        ERROR_REPORT_FILE,
        serde_json::to_vec_pretty(report).context("Failed to serialize the error report")?,
    )];
    if options.include_system_info {
        entries.push((
            SYSTEM_INFO_FILE,
            serde_json::to_vec_pretty(&report.environment)?,
        ));
    }
    if options.include_runtime_info {
        entries.push((
            DOCKER_INFO_FILE,
            serde_json::to_vec_pretty(&report.runtime_status)?,
        ));
    }
    if let Some(log_file) = &options.log_file {
        // A missing run log only shrinks the bundle
        match tokio::fs::read(log_file).await {
            Ok(logs) => entries.push((LOGS_FILE, logs)),
            Err(e) => warn!("Skipping logs, cannot read {}: {e}", log_file.display()),
        }
    }
    Ok(entries)
}

async fn write_bundle(
    report: &ErrorReport,
    archive_path: &Path,
    options: &BundleOptions,
    bundle: &mut DebugBundle,
) -> Result<()> {
    let mut entries = collect_entries(report, options).await?;
    bundle.metadata.files = entries
        .iter()
        .map(|(name, _)| name.to_string())
        .chain(std::iter::once(METADATA_FILE.to_string()))
        .collect();
    entries.push((METADATA_FILE, serde_json::to_vec_pretty(&bundle.metadata)?));

    if let Some(parent) = archive_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = File::create(archive_path)
        .await
        .with_context(|| format!("Failed to create {}", archive_path.display()))?;

    let mut tar = Builder::new(GzipEncoder::new(file));
    let mtime = bundle.created_at.timestamp().max(0) as u64;
    for (name, data) in &entries {
        let mut header = Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        tar.append_data(
            &mut header,
            format!("{}/{name}", bundle.bundle_id),
            data.as_slice(),
        )
        .await
        .with_context(|| format!("Failed to add {name} to the bundle"))?;
    }
    let mut gzip_encoder = tar.into_inner().await?;
    gzip_encoder.shutdown().await?;
    gzip_encoder.into_inner().sync_all().await?;

    debug!(
        "Bundle {} contains {}",
        bundle.bundle_id,
        bundle.metadata.files.join(", ")
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnosis::issue::{HangupAnalysis, HangupIssue, HangupKind, Severity, SystemState};
    use crate::diagnosis::report::{EnvironmentSnapshot, RuntimeStatus};
    use crate::preflight::SystemInfo;
    use async_compression::tokio::bufread::GzipDecoder;
    use futures::StreamExt;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, BufReader};

    fn report() -> ErrorReport {
        let issue = HangupIssue::new(
            HangupKind::RuntimeUnresponsive,
            Severity::Critical,
            0.9,
            "docker daemon does not answer",
        );
        let now = Utc::now();
        ErrorReport {
            report_id: "report-1".into(),
            generated_at: now,
            hangwatch_version: "0.0.0".into(),
            analysis: Some(HangupAnalysis {
                analysis_id: "analysis-42".into(),
                started_at: now,
                ended_at: now,
                duration_secs: 0.1,
                issues: vec![issue.clone()],
                primary_cause: Some(issue),
                system_state: SystemState::default(),
                recovery_suggestions: vec![],
                prevention_measures: vec![],
            }),
            environment: EnvironmentSnapshot {
                system: SystemInfo {
                    os: "ubuntu".into(),
                    os_version: Some("24.04".into()),
                    kernel_version: None,
                    arch: "x86_64".into(),
                    host: None,
                    user: None,
                    cpu_brand: None,
                    cpu_cores: Some(4),
                    total_memory_gb: 16,
                    is_root: false,
                },
                env_vars: BTreeMap::new(),
                working_dir: None,
            },
            runtime_status: RuntimeStatus {
                name: "docker".into(),
                ..Default::default()
            },
            tools: vec![],
            troubleshooting: vec![],
            next_steps: vec![],
            trace: None,
        }
    }

    async fn read_archive(path: &Path) -> BTreeMap<String, String> {
        let file = File::open(path).await.unwrap();
        let mut archive = tokio_tar::Archive::new(GzipDecoder::new(BufReader::new(file)));
        let mut entries = archive.entries().unwrap();
        let mut files = BTreeMap::new();
        while let Some(entry) = entries.next().await {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let mut content = String::new();
            entry.read_to_string(&mut content).await.unwrap();
            files.insert(name, content);
        }
        files
    }

    #[tokio::test]
    async fn test_bundle_keeps_analysis_identity() {
        let out_dir = tempfile::tempdir().unwrap();
        let log_file = out_dir.path().join("run.log");
        std::fs::write(&log_file, "line 1\nline 2\n").unwrap();

        let bundle = create_debug_bundle(
            &report(),
            out_dir.path(),
            &BundleOptions::full(Some(log_file)),
        )
        .await;
        let path = bundle.path.clone().expect("bundle should be written");
        assert!(bundle.metadata.error.is_none());

        let files = read_archive(&path).await;
        let id = &bundle.bundle_id;
        let expected = [
            ERROR_REPORT_FILE,
            SYSTEM_INFO_FILE,
            DOCKER_INFO_FILE,
            LOGS_FILE,
            METADATA_FILE,
        ]
        .map(|name| format!("{id}/{name}"));
        assert_eq!(files.len(), expected.len());
        for name in &expected {
            assert!(files.contains_key(name), "missing {name}");
        }

        let archived: ErrorReport =
            serde_json::from_str(&files[&format!("{id}/{ERROR_REPORT_FILE}")]).unwrap();
        assert_eq!(archived.analysis_id(), Some("analysis-42"));
        assert_eq!(
            archived.primary_cause_title(),
            Some("docker daemon does not answer")
        );
        assert_eq!(files[&format!("{id}/{LOGS_FILE}")], "line 1\nline 2\n");

        let metadata: BundleMetadata =
            serde_json::from_str(&files[&format!("{id}/{METADATA_FILE}")]).unwrap();
        assert_eq!(metadata.analysis_id.as_deref(), Some("analysis-42"));
        assert_eq!(metadata.files.len(), 5);
    }

    #[tokio::test]
    async fn test_minimal_bundle() {
        let out_dir = tempfile::tempdir().unwrap();
        let bundle = create_debug_bundle(&report(), out_dir.path(), &BundleOptions::default()).await;
        let files = read_archive(bundle.path.as_ref().unwrap()).await;
        assert_eq!(files.len(), 2);
        assert!(files.contains_key(&format!("{}/{ERROR_REPORT_FILE}", bundle.bundle_id)));
        assert!(files.contains_key(&format!("{}/{METADATA_FILE}", bundle.bundle_id)));
    }

    #[tokio::test]
    async fn test_missing_log_file_is_skipped() {
        let out_dir = tempfile::tempdir().unwrap();
        let options = BundleOptions {
            log_file: Some(out_dir.path().join("missing.log")),
            ..Default::default()
        };
        let bundle = create_debug_bundle(&report(), out_dir.path(), &options).await;
        assert!(bundle.is_written());
        assert!(!bundle.metadata.files.contains(&LOGS_FILE.to_string()));
    }

    #[tokio::test]
    async fn test_write_failure_is_recorded_not_raised() {
        let blocker = tempfile::NamedTempFile::new().unwrap();
        // A regular file cannot hold the bundle directory
        let out_dir = blocker.path().join("bundles");
        let bundle = create_debug_bundle(&report(), &out_dir, &BundleOptions::default()).await;
        assert!(bundle.path.is_none());
        assert!(bundle.metadata.error.is_some());
        assert_eq!(bundle.metadata.analysis_id.as_deref(), Some("analysis-42"));
    }
}
