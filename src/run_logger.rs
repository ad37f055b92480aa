use crate::local_logger::get_local_logger;
use crate::logger::{GROUP_TARGET, OPENED_GROUP_TARGET};
use crate::prelude::*;
use log::LevelFilter;
use simplelog::{CombinedLogger, WriteLogger};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

/// Installs the global logger: the terminal logger plus a trace-level file log of the whole
/// invocation. The file is what debug bundles ship as `logs.txt`.
pub struct RunLogger {
    log_file_path: PathBuf,
}

impl RunLogger {
    pub fn init() -> Result<Self> {
        let log_file = NamedTempFile::with_prefix("hangwatch-run-")
            .context("Failed to create log file")?;
        let log_file_path = log_file.path().to_path_buf();
        let file_logger_config = simplelog::ConfigBuilder::new()
            // Groups are not logged to the file
            .add_filter_ignore_str(GROUP_TARGET)
            .add_filter_ignore_str(OPENED_GROUP_TARGET)
            .build();
        let file_logger = WriteLogger::new(LevelFilter::Trace, file_logger_config, log_file);
        CombinedLogger::init(vec![get_local_logger(), file_logger])
            .context("Failed to init logger")?;
        Ok(Self { log_file_path })
    }

    pub fn log_file_path(&self) -> &Path {
        &self.log_file_path
    }

    /// Copy the current log to `dest_dir/hangwatch.log`.
    pub fn persist_to(&self, dest_dir: &Path) -> Result<PathBuf> {
        let dest = dest_dir.join("hangwatch.log");
        debug!("Persisting log file to {}", dest.display());
        log::logger().flush();
        std::fs::copy(&self.log_file_path, &dest).context("Failed to copy log file")?;
        Ok(dest)
    }
}
