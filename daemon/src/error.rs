//! Error taxonomy shared by the collector, executor and monitor

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process {0} not found")]
    NotFound(u32),

    #[error("access denied for process {0} - may require elevated privileges")]
    AccessDenied(u32),

    #[error("process {0} is already tracked")]
    AlreadyTracked(u32),

    #[error("failed to read process {pid}: {source}")]
    Io {
        pid: u32,
        #[source]
        source: io::Error,
    },

    #[error("OS error {errno} for process {pid}")]
    Os { pid: u32, errno: i32 },

    #[error("background task failed: {0}")]
    Task(String),
}

/// Coarse classification surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    InvariantViolation,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::Other => "other",
        }
    }
}

impl ProcessError {
    pub fn from_io(pid: u32, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => ProcessError::NotFound(pid),
            io::ErrorKind::PermissionDenied => ProcessError::AccessDenied(pid),
            _ => match source.raw_os_error() {
                Some(libc::ESRCH) => ProcessError::NotFound(pid),
                _ => ProcessError::Io { pid, source },
            },
        }
    }

    pub fn from_errno(pid: u32, errno: i32) -> Self {
        match errno {
            libc::ESRCH => ProcessError::NotFound(pid),
            libc::EPERM | libc::EACCES => ProcessError::AccessDenied(pid),
            _ => ProcessError::Os { pid, errno },
        }
    }

    /// Builds an error from the calling thread's last OS error.
    pub fn last_os_error(pid: u32) -> Self {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
        Self::from_errno(pid, errno)
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcessError::NotFound(_) => ErrorKind::NotFound,
            ProcessError::AccessDenied(_) => ErrorKind::AccessDenied,
            ProcessError::AlreadyTracked(_) => ErrorKind::InvariantViolation,
            ProcessError::Io { .. } | ProcessError::Os { .. } | ProcessError::Task(_) => {
                ErrorKind::Other
            }
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<tokio::task::JoinError> for ProcessError {
    fn from(err: tokio::task::JoinError) -> Self {
        ProcessError::Task(err.to_string())
    }
}
