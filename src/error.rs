//! Failure taxonomy for deployment operations
//!
//! Every engine operation returns a [`DeployError`]. The CLI prints
//! `error[<KIND>]: <message>` and exits with [`ErrorKind::exit_code`].

use serde::Serialize;
use thiserror::Error;

/// Error kinds surfaced to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Unknown application
    NotFound,
    /// An application with this name already exists
    NameConflict,
    /// Name is not a valid DNS label
    InvalidName,
    /// A declared port is already claimed by another application
    PortConflict,
    /// No free port could be found in the administrative range
    PortExhausted,
    /// No entry-point convention matched the source tree
    UnrecognizedApplication,
    /// Clone, fetch or checkout failed
    SourceFetchFailed,
    /// The application's install/build step exited non-zero
    InstallStepFailed,
    /// Writing unit or route files failed
    ConfigWriteFailed,
    /// The supervisor refused to start a process
    ProcessStartFailed,
    /// The `.env` file could not be parsed unambiguously
    InvalidEnvFile,
    /// Another operation holds the application's lock
    Busy,
    /// A half-completed prior run needs an operator decision
    NeedsRepair,
    /// The requested backup does not exist
    BackupNotFound,
    /// An operation failed and restoring the previous state failed too
    RollbackIncomplete,
    /// Store or filesystem fault
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::NameConflict => "NAME_CONFLICT",
            ErrorKind::InvalidName => "INVALID_NAME",
            ErrorKind::PortConflict => "PORT_CONFLICT",
            ErrorKind::PortExhausted => "PORT_EXHAUSTED",
            ErrorKind::UnrecognizedApplication => "UNRECOGNIZED_APPLICATION",
            ErrorKind::SourceFetchFailed => "SOURCE_FETCH_FAILED",
            ErrorKind::InstallStepFailed => "INSTALL_STEP_FAILED",
            ErrorKind::ConfigWriteFailed => "CONFIG_WRITE_FAILED",
            ErrorKind::ProcessStartFailed => "PROCESS_START_FAILED",
            ErrorKind::InvalidEnvFile => "INVALID_ENV_FILE",
            ErrorKind::Busy => "BUSY",
            ErrorKind::NeedsRepair => "NEEDS_REPAIR",
            ErrorKind::BackupNotFound => "BACKUP_NOT_FOUND",
            ErrorKind::RollbackIncomplete => "ROLLBACK_INCOMPLETE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Process exit code for the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::NotFound => 10,
            ErrorKind::NameConflict => 11,
            ErrorKind::InvalidName => 12,
            ErrorKind::InvalidEnvFile => 13,
            ErrorKind::PortConflict => 20,
            ErrorKind::PortExhausted => 21,
            ErrorKind::Busy => 22,
            ErrorKind::UnrecognizedApplication => 30,
            ErrorKind::SourceFetchFailed => 31,
            ErrorKind::InstallStepFailed => 32,
            ErrorKind::ConfigWriteFailed => 33,
            ErrorKind::ProcessStartFailed => 34,
            ErrorKind::NeedsRepair => 40,
            ErrorKind::BackupNotFound => 41,
            ErrorKind::RollbackIncomplete => 42,
            ErrorKind::Internal => 1,
        }
    }

    /// Input and contention errors are rejected before any side effect
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ErrorKind::NotFound
                | ErrorKind::NameConflict
                | ErrorKind::InvalidName
                | ErrorKind::Busy
                | ErrorKind::NeedsRepair
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("application not found: {0}")]
    NotFound(String),

    #[error("application already exists: {0}")]
    NameConflict(String),

    #[error("invalid application name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("port {port} is already claimed by application '{owner}'")]
    PortConflict { port: u16, owner: String },

    #[error("no free port in {min}-{max} after {attempts} attempts")]
    PortExhausted { min: u16, max: u16, attempts: u32 },

    #[error("unrecognized application: {0}")]
    UnrecognizedApplication(String),

    #[error("source fetch failed: {0}")]
    SourceFetchFailed(String),

    #[error("install step failed: {0}")]
    InstallStepFailed(String),

    #[error("config write failed: {0}")]
    ConfigWriteFailed(String),

    #[error("process start failed: {0}")]
    ProcessStartFailed(String),

    #[error("invalid .env file at line {line}: {reason}")]
    InvalidEnvFile { line: usize, reason: String },

    #[error("application '{0}' is locked by another operation")]
    Busy(String),

    #[error("application '{name}' needs repair: {reason}")]
    NeedsRepair { name: String, reason: String },

    #[error("backup not found: {0}")]
    BackupNotFound(String),

    #[error("{original}; rollback also failed: {rollback}")]
    RollbackIncomplete {
        original: Box<DeployError>,
        rollback: String,
    },

    #[error("{0:#}")]
    Internal(#[from] anyhow::Error),
}

impl DeployError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::NotFound(_) => ErrorKind::NotFound,
            DeployError::NameConflict(_) => ErrorKind::NameConflict,
            DeployError::InvalidName { .. } => ErrorKind::InvalidName,
            DeployError::PortConflict { .. } => ErrorKind::PortConflict,
            DeployError::PortExhausted { .. } => ErrorKind::PortExhausted,
            DeployError::UnrecognizedApplication(_) => ErrorKind::UnrecognizedApplication,
            DeployError::SourceFetchFailed(_) => ErrorKind::SourceFetchFailed,
            DeployError::InstallStepFailed(_) => ErrorKind::InstallStepFailed,
            DeployError::ConfigWriteFailed(_) => ErrorKind::ConfigWriteFailed,
            DeployError::ProcessStartFailed(_) => ErrorKind::ProcessStartFailed,
            DeployError::InvalidEnvFile { .. } => ErrorKind::InvalidEnvFile,
            DeployError::Busy(_) => ErrorKind::Busy,
            DeployError::NeedsRepair { .. } => ErrorKind::NeedsRepair,
            DeployError::BackupNotFound(_) => ErrorKind::BackupNotFound,
            DeployError::RollbackIncomplete { .. } => ErrorKind::RollbackIncomplete,
            DeployError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<rusqlite::Error> for DeployError {
    fn from(e: rusqlite::Error) -> Self {
        DeployError::Internal(e.into())
    }
}

impl From<std::io::Error> for DeployError {
    fn from(e: std::io::Error) -> Self {
        DeployError::Internal(e.into())
    }
}

pub type Result<T, E = DeployError> = std::result::Result<T, E>;
