mod errors;
mod fs_utils;
mod journal;
mod layout;
mod redact;
mod transaction;

pub use errors::{classify_error, error_code, is_critical, ErrorClass, ErrorCode};
pub use journal::{
    rotated_log_path, LogEntry, LogLevel, TransactionLog, DEFAULT_MAX_LOG_BYTES,
    DEFAULT_MAX_LOG_FILES,
};
pub use layout::{backup_stamp, TargetLayout, BACKUP_DIR_NAME, LOG_FILE_NAME};
pub use redact::{redact_secrets, REDACTED};
pub use transaction::{
    BackupRecord, InstallTransaction, RollbackOutcome, TransactionError, TransactionOptions,
    TransactionState,
};
