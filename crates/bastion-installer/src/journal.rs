use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::fs_utils::{remove_file_if_exists, with_suffix};
use crate::redact::redact_secrets;

pub const DEFAULT_MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
pub const DEFAULT_MAX_LOG_FILES: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    /// Already redacted.
    pub message: String,
}

pub fn rotated_log_path(log_path: &Path, index: u32) -> PathBuf {
    with_suffix(log_path, &format!(".{index}"))
}

/// Append-only transaction log with size-based rotation.
#[derive(Debug)]
pub struct TransactionLog {
    path: PathBuf,
    max_bytes: u64,
    max_files: u32,
    entries: Vec<LogEntry>,
}

impl TransactionLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64, max_files: u32) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            max_files,
            entries: Vec::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Redacts `message`, rotates the file if it has reached its size limit,
    /// and appends one line. Write and rotation failures are reported through
    /// tracing and never propagate.
    pub fn append(&mut self, level: LogLevel, message: &str) {
        let message = redact_secrets(message);
        let timestamp = Utc::now();

        match self.rotate_if_needed() {
            Ok(true) => {
                let notice = format_line(timestamp, LogLevel::Info, "log file rotated");
                if let Err(err) = self.write_line(&notice) {
                    tracing::warn!(log = %self.path.display(), error = %err, "failed to write transaction log");
                }
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(log = %self.path.display(), error = %err, "transaction log rotation failed");
            }
        }

        let line = format_line(timestamp, level, &message);
        if let Err(err) = self.write_line(&line) {
            tracing::warn!(log = %self.path.display(), error = %err, "failed to write transaction log");
        }

        match level {
            LogLevel::Debug => tracing::debug!("{message}"),
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warn => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }

        self.entries.push(LogEntry {
            timestamp,
            level,
            message,
        });
    }

    fn write_line(&self, line: &str) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.flush()
    }

    fn rotate_if_needed(&self) -> io::Result<bool> {
        let size = match fs::metadata(&self.path) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err),
        };
        if size < self.max_bytes {
            return Ok(false);
        }

        if self.max_files == 0 {
            fs::remove_file(&self.path)?;
            return Ok(true);
        }

        remove_file_if_exists(&rotated_log_path(&self.path, self.max_files))?;
        for index in (1..self.max_files).rev() {
            let from = rotated_log_path(&self.path, index);
            if from.exists() {
                fs::rename(&from, rotated_log_path(&self.path, index + 1))?;
            }
        }
        fs::rename(&self.path, rotated_log_path(&self.path, 1))?;
        Ok(true)
    }
}

fn format_line(timestamp: DateTime<Utc>, level: LogLevel, message: &str) -> String {
    format!(
        "[{}] [{}] {}\n",
        timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
        level,
        message
    )
}
