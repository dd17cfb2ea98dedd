use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::journal::rotated_log_path;

pub const BACKUP_DIR_NAME: &str = ".install-backup";
pub const LOG_FILE_NAME: &str = ".install.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLayout {
    target: PathBuf,
}

impl TargetLayout {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        Self {
            target: target.into(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn backup_root(&self) -> PathBuf {
        self.target.join(BACKUP_DIR_NAME)
    }

    pub fn backup_dir(&self, stamp: &str) -> PathBuf {
        self.backup_root().join(stamp)
    }

    pub fn log_path(&self) -> PathBuf {
        self.target.join(LOG_FILE_NAME)
    }

    pub fn rotated_log_path(&self, index: u32) -> PathBuf {
        rotated_log_path(&self.log_path(), index)
    }

    pub fn manifest_path(&self, name: &str) -> PathBuf {
        self.target.join(name)
    }

    /// Absolute form of `path`, with relative paths anchored at the target.
    /// Symlinks are deliberately left unresolved.
    pub fn resolve(&self, path: &Path) -> io::Result<PathBuf> {
        if path.is_absolute() {
            std::path::absolute(path)
        } else {
            std::path::absolute(self.target.join(path))
        }
    }
}

/// Timestamp usable as a directory name on every platform, e.g.
/// `2025-01-23_14-30-45-123Z`.
pub fn backup_stamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d_%H-%M-%S-%3fZ").to_string()
}
