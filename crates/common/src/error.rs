//! Error types for Specgrid

use thiserror::Error;

/// Result type alias using Specgrid Error
pub type Result<T> = std::result::Result<T, Error>;

/// Specgrid error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("Build failed: {0}")]
    BuildFailed(String),

    #[error("Command `{command}` failed with exit code {}: {stderr_tail}", .exit_code.map(|c| c.to_string()).unwrap_or_else(|| "none".into()))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr_tail: String,
    },

    #[error("Command `{command}` timed out after {seconds}s")]
    CommandTimeout { command: String, seconds: u64 },

    #[error("No {framework} configuration file found in {dir}")]
    ConfigNotFound { framework: String, dir: String },

    #[error("Cache read error: {0}")]
    CacheRead(String),

    #[error("Run failed: {0}")]
    RunFailed(String),

    #[error("Control plane returned {status} for {endpoint}: {message}")]
    ControlPlane {
        endpoint: String,
        status: u16,
        message: String,
    },

    #[error("Blob store returned {status} for {name}")]
    BlobStore { name: String, status: u16 },

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// How a failure is handled by whoever catches it.
///
/// A spec timeout is not represented here: it is a normal outcome, carried
/// as a result value by the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The build cannot produce a usable artifact. Report it and exit non-zero.
    FatalBuild,
    /// The dependency archive is unusable. Rebuild instead.
    CacheRead,
    /// This spec iteration failed. Return the spec and stop the worker.
    RecoverablePerSpec,
    /// The run or the process was cancelled.
    Cancelled,
    /// Anything unrecognised. Treated as a sign of an unhealthy worker.
    Unexpected,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BuildFailed(_)
            | Error::ConfigNotFound { .. }
            | Error::CommandFailed { .. }
            | Error::CommandTimeout { .. } => ErrorKind::FatalBuild,
            Error::CacheRead(_) => ErrorKind::CacheRead,
            Error::RunFailed(_) => ErrorKind::RecoverablePerSpec,
            Error::Cancelled(_) => ErrorKind::Cancelled,
            _ => ErrorKind::Unexpected,
        }
    }

    /// Exit code carried by the error, if a subprocess produced it.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Error::CommandFailed { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    /// Whether a failed HTTP exchange is worth repeating.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            Error::ControlPlane { status, .. } | Error::BlobStore { status, .. } => {
                *status >= 500
            }
            _ => false,
        }
    }
}
