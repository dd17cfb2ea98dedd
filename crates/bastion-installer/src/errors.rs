use std::error::Error;
use std::io;

/// How a failure must be handled by the install driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Roll back immediately; never retried automatically.
    Critical,
    /// Surface with recovery steps; rollback only if the caller's policy says so.
    Recoverable,
    /// Logged, never propagated as a failure.
    Warning,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Critical => "CRITICAL",
            Self::Recoverable => "RECOVERABLE",
            Self::Warning => "WARNING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    PermissionDenied,
    DiskFull,
    ReadOnlyFilesystem,
    NotADirectory,
    IsADirectory,
    NetworkTimeout,
    NetworkError,
    DependencyFailed,
    PackageCorruption,
    ConfigParseError,
    ConfigWriteError,
    GitCorruption,
    GitConflict,
    Unknown,
}

impl ErrorCode {
    pub fn from_io_kind(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::StorageFull => Self::DiskFull,
            io::ErrorKind::ReadOnlyFilesystem => Self::ReadOnlyFilesystem,
            io::ErrorKind::NotADirectory => Self::NotADirectory,
            io::ErrorKind::IsADirectory => Self::IsADirectory,
            io::ErrorKind::TimedOut => Self::NetworkTimeout,
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable => Self::NetworkError,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "EACCES",
            Self::DiskFull => "ENOSPC",
            Self::ReadOnlyFilesystem => "EROFS",
            Self::NotADirectory => "ENOTDIR",
            Self::IsADirectory => "EISDIR",
            Self::NetworkTimeout => "NETWORK_TIMEOUT",
            Self::NetworkError => "NETWORK_ERROR",
            Self::DependencyFailed => "DEPENDENCY_FAILED",
            Self::PackageCorruption => "PACKAGE_CORRUPTION",
            Self::ConfigParseError => "CONFIG_PARSE_ERROR",
            Self::ConfigWriteError => "CONFIG_WRITE_ERROR",
            Self::GitCorruption => "GIT_CORRUPTION",
            Self::GitConflict => "GIT_CONFLICT",
            Self::Unknown => "UNKNOWN_ERROR",
        }
    }

    /// OS-level conditions that leave the target unusable mid-install.
    pub fn is_os_critical(self) -> bool {
        matches!(
            self,
            Self::PermissionDenied
                | Self::DiskFull
                | Self::ReadOnlyFilesystem
                | Self::NotADirectory
                | Self::IsADirectory
        )
    }

    /// Class used when presenting this code to a user. Broader than
    /// [`classify_error`], which only ever escalates OS-level conditions.
    pub fn presentation_class(self) -> ErrorClass {
        if self.is_os_critical() || self == Self::GitCorruption {
            return ErrorClass::Critical;
        }
        match self {
            Self::NetworkTimeout | Self::NetworkError | Self::DependencyFailed => {
                ErrorClass::Recoverable
            }
            _ => ErrorClass::Warning,
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::PermissionDenied => "Permission Denied",
            Self::DiskFull => "Disk Space Exhausted",
            Self::ReadOnlyFilesystem => "Read-Only File System",
            Self::NotADirectory => "Invalid Directory",
            Self::IsADirectory => "Unexpected Directory",
            Self::NetworkTimeout => "Network Timeout",
            Self::NetworkError => "Network Error",
            Self::DependencyFailed => "Dependency Installation Failed",
            Self::PackageCorruption => "Package Corruption",
            Self::ConfigParseError => "Configuration Parse Error",
            Self::ConfigWriteError => "Configuration Write Failed",
            Self::GitCorruption => "Git Repository Corruption",
            Self::GitConflict => "Git Conflict Detected",
            Self::Unknown => "Unknown Installation Error",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::PermissionDenied => {
                "Installation failed due to insufficient file system permissions."
            }
            Self::DiskFull => "Installation failed because the disk is full.",
            Self::ReadOnlyFilesystem => {
                "Installation failed because the file system is read-only."
            }
            Self::NotADirectory => "Installation failed because the path is not a directory.",
            Self::IsADirectory => {
                "Installation failed because a directory exists where a file was expected."
            }
            Self::NetworkTimeout => "Installation failed due to network connection timeout.",
            Self::NetworkError => "Installation failed due to network connectivity issues.",
            Self::DependencyFailed => "One or more dependencies failed to install.",
            Self::PackageCorruption => "Installation failed due to corrupted package files.",
            Self::ConfigParseError => {
                "Installation failed due to invalid configuration file syntax."
            }
            Self::ConfigWriteError => "Installation failed while writing configuration files.",
            Self::GitCorruption => "Installation detected git repository corruption.",
            Self::GitConflict => "Installation failed due to uncommitted changes or conflicts.",
            Self::Unknown => "Installation failed due to an unexpected error.",
        }
    }

    pub fn recovery_steps(self) -> &'static [&'static str] {
        match self {
            Self::PermissionDenied => &[
                "Run the installer with administrator/sudo privileges",
                "Check file permissions for the installation directory",
                "Ensure you have write access to the project folder",
            ],
            Self::DiskFull => &[
                "Free up disk space (at least 500MB recommended)",
                "Delete unnecessary files or move data to another drive",
                "Run the installer again after freeing space",
            ],
            Self::ReadOnlyFilesystem => &[
                "Ensure you are not installing to a read-only volume",
                "Check file system mount options",
                "Choose a different installation directory with write access",
            ],
            Self::NotADirectory => &[
                "Verify the installation path is a valid directory",
                "Remove any files with conflicting names",
                "Create the target directory manually before running the installer",
            ],
            Self::IsADirectory => &[
                "Remove or rename the directory occupying the file path",
                "Run the installer again",
            ],
            Self::NetworkTimeout => &[
                "Check your internet connection",
                "Try again in a few moments",
                "Use a wired connection if possible",
            ],
            Self::NetworkError => &[
                "Verify internet connection is active",
                "Check firewall/proxy settings",
                "Try using a different network",
            ],
            Self::DependencyFailed => &[
                "Clear the dependency cache",
                "Remove partially installed dependencies",
                "Install the failing dependency manually",
            ],
            Self::PackageCorruption => &[
                "Clear the package cache",
                "Re-download the release archive",
                "Verify the release signature before retrying",
            ],
            Self::ConfigParseError => &[
                "Check syntax in configuration files",
                "Validate config files with a linter",
                "Restore default configuration and retry",
            ],
            Self::ConfigWriteError => &[
                "Check write permissions for config directories",
                "Ensure config directory exists",
                "Check disk space availability",
            ],
            Self::GitCorruption => &[
                "Run: git fsck to check repository integrity",
                "Restore from backup if available",
            ],
            Self::GitConflict => &[
                "Commit or stash your changes: git stash",
                "Resolve any merge conflicts",
                "Run installer in a clean git state",
            ],
            Self::Unknown => &[
                "Check the installation log: .install.log",
                "Review error details in the log file",
                "Report the issue if problem persists",
            ],
        }
    }
}

/// Finds the first `io::Error` in the source chain and maps its kind.
pub fn error_code(error: &(dyn Error + 'static)) -> ErrorCode {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            return ErrorCode::from_io_kind(io_err.kind());
        }
        current = err.source();
    }
    ErrorCode::Unknown
}

pub fn classify_error(error: &(dyn Error + 'static)) -> ErrorClass {
    if error_code(error).is_os_critical() {
        ErrorClass::Critical
    } else {
        ErrorClass::Recoverable
    }
}

pub fn is_critical(error: &(dyn Error + 'static)) -> bool {
    classify_error(error) == ErrorClass::Critical
}
