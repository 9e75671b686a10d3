use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::StepId;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("permission denied reading {}: {source}", path.display())]
    Probe {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("step '{step}' requires '{requires}' to complete first")]
    DependencyMissing { step: StepId, requires: StepId },

    #[error("{context}: {detail}")]
    CommandFailed { context: String, detail: String },

    #[error("failed to back up {}: {detail}", path.display())]
    BackupFailed { path: PathBuf, detail: String },

    #[error("no backup found for {}", path.display())]
    NoBackupFound { path: PathBuf },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("daemon unhealthy after {attempts} checks (last status: '{last_status}')")]
    DaemonUnhealthy { attempts: u32, last_status: String },

    #[error("step '{0}' applied but its state check still reports unsatisfied")]
    NotConverged(StepId),

    #[error("{0} requires root privileges")]
    PermissionDenied(String),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Probe,
    DependencyMissing,
    CommandFailed,
    BackupFailed,
    NoBackupFound,
    InvalidInput,
    DaemonUnhealthy,
    NotConverged,
    PermissionDenied,
    Io,
    Config,
}

impl EngineError {
    pub fn command(context: impl Into<String>, err: &anyhow::Error) -> Self {
        Self::CommandFailed {
            context: context.into(),
            detail: format!("{err:#}"),
        }
    }

    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Local file write failure; keeps the underlying io kind when the
    /// chain carries one.
    pub fn write_failed(path: &Path, err: &anyhow::Error) -> Self {
        let kind = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<io::Error>())
            .map(io::Error::kind)
            .unwrap_or(io::ErrorKind::Other);
        Self::Io {
            context: format!("failed to write {}", path.display()),
            source: io::Error::new(kind, format!("{err:#}")),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Probe { .. } => ErrorKind::Probe,
            Self::DependencyMissing { .. } => ErrorKind::DependencyMissing,
            Self::CommandFailed { .. } => ErrorKind::CommandFailed,
            Self::BackupFailed { .. } => ErrorKind::BackupFailed,
            Self::NoBackupFound { .. } => ErrorKind::NoBackupFound,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::DaemonUnhealthy { .. } => ErrorKind::DaemonUnhealthy,
            Self::NotConverged(_) => ErrorKind::NotConverged,
            Self::PermissionDenied(_) => ErrorKind::PermissionDenied,
            Self::Io { .. } => ErrorKind::Io,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Fatal errors halt an ordered run. `NoBackupFound` is the only kind a
    /// caller may treat as informational.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NoBackupFound { .. })
    }
}
