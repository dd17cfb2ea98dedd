use std::error::Error;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use bastion_security::{digests_match, hash_file, hash_file_as, is_binary_path, sha256_hex, HashError};
use chrono::Utc;

use crate::errors::{self, ErrorClass};
use crate::fs_utils::{
    copy_dir_recursive, copy_path, remove_path_if_exists, set_owner_only_permissions, with_suffix,
};
use crate::journal::{LogEntry, LogLevel, TransactionLog, DEFAULT_MAX_LOG_BYTES, DEFAULT_MAX_LOG_FILES};
use crate::layout::{backup_stamp, TargetLayout};

const RESTORE_TEMP_SUFFIX: &str = ".restore-temp";

#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("symlink detected in backup path, refusing to back up {}", .0.display())]
    SecurityViolation(PathBuf),
    #[error(
        "refusing to back up {}: it contains this transaction's backup directory or log",
        .0.display()
    )]
    ContainsTransactionState(PathBuf),
    #[error("path is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("path is a directory, use backup_directory: {}", .0.display())]
    IsADirectory(PathBuf),
    #[error("transaction already committed")]
    AlreadyCommitted,
    #[error("transaction already rolled back")]
    AlreadyRolledBack,
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to compute backup digest")]
    Hash(#[from] HashError),
}

impl TransactionError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupRecord {
    pub original: PathBuf,
    pub backup: PathBuf,
    /// Pre-modification digest. Directories carry none and are checked by
    /// existence only.
    pub digest: Option<String>,
    pub is_directory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackOutcome {
    pub success: bool,
    /// Paths that need manual recovery.
    pub failed_paths: Vec<PathBuf>,
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOptions {
    pub backup_dir: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub max_log_bytes: u64,
    pub max_log_files: u32,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            backup_dir: None,
            log_path: None,
            max_log_bytes: DEFAULT_MAX_LOG_BYTES,
            max_log_files: DEFAULT_MAX_LOG_FILES,
        }
    }
}

impl TransactionOptions {
    pub fn with_backup_dir(mut self, backup_dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = Some(backup_dir.into());
        self
    }

    pub fn with_log_path(mut self, log_path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(log_path.into());
        self
    }

    pub fn with_log_rotation(mut self, max_bytes: u64, max_files: u32) -> Self {
        self.max_log_bytes = max_bytes;
        self.max_log_files = max_files;
        self
    }
}

/// One install or upgrade attempt against a target directory.
///
/// Backups are restored in reverse order of creation on rollback. The caller
/// must not run two transactions against the same target concurrently.
#[derive(Debug)]
pub struct InstallTransaction {
    layout: TargetLayout,
    backup_dir: PathBuf,
    records: Vec<BackupRecord>,
    log: TransactionLog,
    state: TransactionState,
}

impl InstallTransaction {
    pub fn open(layout: &TargetLayout, options: TransactionOptions) -> Self {
        let backup_dir = options
            .backup_dir
            .unwrap_or_else(|| unique_backup_dir(layout));
        let log_path = options.log_path.unwrap_or_else(|| layout.log_path());
        let mut transaction = Self {
            layout: layout.clone(),
            backup_dir,
            records: Vec::new(),
            log: TransactionLog::new(log_path, options.max_log_bytes, options.max_log_files),
            state: TransactionState::Open,
        };
        let message = format!(
            "transaction opened for {} (backups in {})",
            layout.target().display(),
            transaction.backup_dir.display()
        );
        transaction.log(LogLevel::Info, &message);
        transaction
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn log_path(&self) -> &Path {
        self.log.path()
    }

    pub fn records(&self) -> &[BackupRecord] {
        &self.records
    }

    pub fn log_entries(&self) -> &[LogEntry] {
        self.log.entries()
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn is_committed(&self) -> bool {
        self.state == TransactionState::Committed
    }

    pub fn is_rolled_back(&self) -> bool {
        self.state == TransactionState::RolledBack
    }

    pub fn log(&mut self, level: LogLevel, message: &str) {
        self.log.append(level, message);
    }

    pub fn classify_error(&self, error: &(dyn Error + 'static)) -> ErrorClass {
        errors::classify_error(error)
    }

    pub fn is_critical(&self, error: &(dyn Error + 'static)) -> bool {
        errors::is_critical(error)
    }

    /// Saves a copy of one file before it is modified. Missing files are
    /// skipped, as are files already backed up by this transaction.
    pub fn backup(&mut self, path: impl AsRef<Path>) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let path = path.as_ref();
        let Some(original) = self.inspect_backup_source(path, false)? else {
            return Ok(());
        };

        let backup = self.backup_dir.join(format!(
            "{}.{}.backup",
            file_label(&original),
            path_hash(&original)
        ));
        self.prepare_backup_dir()?;

        if let Err(source) = fs::copy(&original, &backup) {
            self.discard_partial_backup(&backup);
            return Err(TransactionError::io(
                format!(
                    "failed to back up {} to {}",
                    original.display(),
                    backup.display()
                ),
                source,
            ));
        }
        let digest = match hash_file(&original) {
            Ok(digest) => digest,
            Err(err) => {
                self.discard_partial_backup(&backup);
                return Err(err.into());
            }
        };

        self.records.push(BackupRecord {
            original,
            backup,
            digest: Some(digest),
            is_directory: false,
        });
        self.log(LogLevel::Info, &format!("backed up: {}", path.display()));
        Ok(())
    }

    /// Saves a recursive copy of a directory tree. The copy is verified by
    /// existence only when rolling back.
    pub fn backup_directory(&mut self, path: impl AsRef<Path>) -> Result<(), TransactionError> {
        self.ensure_open()?;
        let path = path.as_ref();
        let Some(original) = self.inspect_backup_source(path, true)? else {
            return Ok(());
        };

        let backup = self
            .backup_dir
            .join(format!("{}.{}", file_label(&original), path_hash(&original)));
        self.prepare_backup_dir()?;

        if let Err(source) = copy_dir_recursive(&original, &backup) {
            self.discard_partial_backup(&backup);
            return Err(TransactionError::io(
                format!(
                    "failed to back up directory {} to {}",
                    original.display(),
                    backup.display()
                ),
                source,
            ));
        }

        self.records.push(BackupRecord {
            original,
            backup,
            digest: None,
            is_directory: true,
        });
        self.log(
            LogLevel::Info,
            &format!("backed up directory: {}", path.display()),
        );
        Ok(())
    }

    /// Restores every backup, newest first, then removes the backup
    /// directory. A corrupt or unrestorable backup is recorded in
    /// `failed_paths` and does not stop the remaining restores.
    pub fn rollback(&mut self) -> Result<RollbackOutcome, TransactionError> {
        match self.state {
            TransactionState::Committed => {
                self.log(
                    LogLevel::Error,
                    "cannot rollback: transaction already committed",
                );
                return Err(TransactionError::AlreadyCommitted);
            }
            TransactionState::RolledBack => {
                self.log(LogLevel::Warn, "transaction already rolled back");
                return Ok(RollbackOutcome {
                    success: true,
                    failed_paths: Vec::new(),
                    backup_dir: self.backup_dir.clone(),
                });
            }
            TransactionState::Open => {}
        }

        self.log(
            LogLevel::Error,
            &format!(
                "installation failed, rolling back {} backup(s)",
                self.records.len()
            ),
        );

        let mut failed_paths = Vec::new();
        let records: Vec<BackupRecord> = self.records.iter().rev().cloned().collect();
        for record in records {
            if !backup_is_intact(&record) {
                self.log(
                    LogLevel::Error,
                    &format!("backup verification failed for {}", record.original.display()),
                );
                failed_paths.push(record.original);
                continue;
            }

            match restore_record(&record) {
                Ok(()) => {
                    self.log(
                        LogLevel::Info,
                        &format!("restored: {}", record.original.display()),
                    );
                }
                Err(err) => {
                    self.log(
                        LogLevel::Error,
                        &format!("failed to restore {}: {err}", record.original.display()),
                    );
                    failed_paths.push(record.original);
                }
            }
        }

        match remove_path_if_exists(&self.backup_dir) {
            Ok(()) => self.log(LogLevel::Info, "backup directory cleaned up"),
            Err(err) => self.log(
                LogLevel::Warn,
                &format!(
                    "failed to clean up backup directory {}: {err}",
                    self.backup_dir.display()
                ),
            ),
        }
        self.state = TransactionState::RolledBack;

        if failed_paths.is_empty() {
            self.log(LogLevel::Info, "rollback completed successfully");
        } else {
            let joined = failed_paths
                .iter()
                .map(|path| path.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            self.log(
                LogLevel::Error,
                &format!("rollback completed with errors, failed to restore: {joined}"),
            );
        }

        Ok(RollbackOutcome {
            success: failed_paths.is_empty(),
            failed_paths,
            backup_dir: self.backup_dir.clone(),
        })
    }

    /// Marks the installation successful and discards the backups. Failing
    /// to delete the backups does not fail the commit.
    pub fn commit(&mut self) -> Result<(), TransactionError> {
        match self.state {
            TransactionState::RolledBack => {
                self.log(
                    LogLevel::Error,
                    "cannot commit: transaction already rolled back",
                );
                return Err(TransactionError::AlreadyRolledBack);
            }
            TransactionState::Committed => {
                self.log(LogLevel::Warn, "transaction already committed");
                return Ok(());
            }
            TransactionState::Open => {}
        }

        self.log(
            LogLevel::Info,
            "installation successful, cleaning up backups",
        );
        match remove_path_if_exists(&self.backup_dir) {
            Ok(()) => self.log(LogLevel::Info, "backups cleaned up successfully"),
            Err(err) => self.log(
                LogLevel::Warn,
                &format!(
                    "failed to clean up backups in {}: {err}",
                    self.backup_dir.display()
                ),
            ),
        }
        self.state = TransactionState::Committed;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), TransactionError> {
        match self.state {
            TransactionState::Open => Ok(()),
            TransactionState::Committed => Err(TransactionError::AlreadyCommitted),
            TransactionState::RolledBack => Err(TransactionError::AlreadyRolledBack),
        }
    }

    /// Resolves `path` and applies the pre-backup checks. `None` means the
    /// backup should be skipped.
    fn inspect_backup_source(
        &mut self,
        path: &Path,
        expect_directory: bool,
    ) -> Result<Option<PathBuf>, TransactionError> {
        let original = self.layout.resolve(path).map_err(|source| {
            TransactionError::io(format!("failed to resolve {}", path.display()), source)
        })?;
        let kind = if expect_directory { "directory" } else { "file" };
        self.reject_symlinked_ancestors(path, &original)?;

        let metadata = match fs::symlink_metadata(&original) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.log(
                    LogLevel::Warn,
                    &format!("{kind} not found for backup: {}", path.display()),
                );
                return Ok(None);
            }
            Err(source) => {
                return Err(TransactionError::io(
                    format!("failed to inspect {}", original.display()),
                    source,
                ));
            }
        };

        if metadata.file_type().is_symlink() {
            self.log(
                LogLevel::Error,
                &format!("symlink detected in backup path: {}", path.display()),
            );
            return Err(TransactionError::SecurityViolation(original));
        }
        if expect_directory && !metadata.is_dir() {
            return Err(TransactionError::NotADirectory(original));
        }
        if !expect_directory && metadata.is_dir() {
            return Err(TransactionError::IsADirectory(original));
        }
        if expect_directory && self.holds_transaction_state(&original) {
            self.log(
                LogLevel::Error,
                &format!(
                    "refusing to back up {}: it contains the backup directory or log",
                    path.display()
                ),
            );
            return Err(TransactionError::ContainsTransactionState(original));
        }

        if self.records.iter().any(|record| record.original == original) {
            self.log(
                LogLevel::Debug,
                &format!("{kind} already backed up: {}", path.display()),
            );
            return Ok(None);
        }

        Ok(Some(original))
    }

    /// Every existing component between the target and `original` must be a
    /// real directory. The final component is checked by the caller.
    fn reject_symlinked_ancestors(
        &mut self,
        path: &Path,
        original: &Path,
    ) -> Result<(), TransactionError> {
        let target = std::path::absolute(self.layout.target()).map_err(|source| {
            TransactionError::io(
                format!("failed to resolve {}", self.layout.target().display()),
                source,
            )
        })?;
        let Some(parent) = original.parent() else {
            return Ok(());
        };
        let Ok(relative) = parent.strip_prefix(&target) else {
            return Ok(());
        };

        let mut current = target;
        for component in relative.components() {
            current.push(component);
            match fs::symlink_metadata(&current) {
                Ok(metadata) if metadata.file_type().is_symlink() => {
                    self.log(
                        LogLevel::Error,
                        &format!(
                            "symlink detected in backup path: {} (via {})",
                            path.display(),
                            current.display()
                        ),
                    );
                    return Err(TransactionError::SecurityViolation(
                        original.to_path_buf(),
                    ));
                }
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(source) => {
                    return Err(TransactionError::io(
                        format!("failed to inspect {}", current.display()),
                        source,
                    ));
                }
            }
        }
        Ok(())
    }

    /// True when `directory` encloses the backup directory or the log, so a
    /// recursive copy or restore would touch the transaction's own state.
    fn holds_transaction_state(&self, directory: &Path) -> bool {
        [self.backup_dir.as_path(), self.log.path()]
            .into_iter()
            .any(|state| {
                std::path::absolute(state)
                    .map(|state| state.starts_with(directory))
                    .unwrap_or(true)
            })
    }

    fn prepare_backup_dir(&mut self) -> Result<(), TransactionError> {
        fs::create_dir_all(&self.backup_dir).map_err(|source| {
            TransactionError::io(
                format!(
                    "failed to create backup directory {}",
                    self.backup_dir.display()
                ),
                source,
            )
        })?;

        if let Err(err) = set_owner_only_permissions(&self.backup_dir) {
            self.log(
                LogLevel::Debug,
                &format!("could not set backup directory permissions: {err}"),
            );
        }
        Ok(())
    }

    fn discard_partial_backup(&mut self, backup: &Path) {
        if let Err(err) = remove_path_if_exists(backup) {
            self.log(
                LogLevel::Warn,
                &format!(
                    "failed to remove partial backup {}: {err}",
                    backup.display()
                ),
            );
        }
    }
}

impl Drop for InstallTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Open && !self.records.is_empty() {
            tracing::warn!(
                backup_dir = %self.backup_dir.display(),
                backups = self.records.len(),
                "install transaction dropped without commit or rollback"
            );
        }
    }
}

fn unique_backup_dir(layout: &TargetLayout) -> PathBuf {
    let stamp = backup_stamp(Utc::now());
    let candidate = layout.backup_dir(&stamp);
    if !candidate.exists() {
        return candidate;
    }
    (1u32..)
        .map(|attempt| layout.backup_dir(&format!("{stamp}-{attempt}")))
        .find(|path| !path.exists())
        .unwrap_or(candidate)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

/// First eight hex characters of SHA-256 over the absolute path, so equally
/// named files from different directories never share a backup slot.
fn path_hash(path: &Path) -> String {
    sha256_hex(path.to_string_lossy().as_bytes())[..8].to_string()
}

fn backup_is_intact(record: &BackupRecord) -> bool {
    if record.is_directory {
        return record.backup.is_dir();
    }
    let Some(expected) = &record.digest else {
        return false;
    };
    match hash_file_as(&record.backup, is_binary_path(&record.original)) {
        Ok(actual) => digests_match(expected, &actual),
        Err(_) => false,
    }
}

/// Copies the backup to a sibling temp path, removes what is at the original
/// path, and renames the temp path into place. The temp path never outlives
/// this call.
fn restore_record(record: &BackupRecord) -> io::Result<()> {
    let temp = with_suffix(&record.original, RESTORE_TEMP_SUFFIX);
    let restored = stage_and_swap(record, &temp);
    let cleanup = remove_path_if_exists(&temp);
    restored?;
    cleanup
}

fn stage_and_swap(record: &BackupRecord, temp: &Path) -> io::Result<()> {
    remove_path_if_exists(temp)?;
    copy_path(&record.backup, temp, record.is_directory)?;
    remove_path_if_exists(&record.original)?;
    fs::rename(temp, &record.original)
}
