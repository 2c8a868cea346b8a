use std::fmt;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),
    #[error("Config error: {0}")]
    Config(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Verification(#[from] VerificationError),
    #[error("operation cancelled")]
    Cancelled,
    #[error("no data received for {0}s")]
    Stalled(u64),
    #[error("resume rejected: {0}")]
    ResumeRejected(String),
    #[error("incomplete download: expected {expected} bytes, got {received}")]
    IncompleteDownload { expected: u64, received: u64 },
    #[error("download failed after {attempts} attempts: {source}")]
    DownloadExhausted {
        attempts: u32,
        #[source]
        source: Box<LauncherError>,
    },
    #[error("patch {from}->{to} failed (exit code {exit_code:?}): {stderr}")]
    PatchApply {
        from: u32,
        to: u32,
        exit_code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("patch {from}->{to} timed out after {timeout_secs}s")]
    PatchTimeout { from: u32, to: u32, timeout_secs: u64 },
    #[error("patch {from}->{to}: {source}")]
    PatchStep {
        from: u32,
        to: u32,
        #[source]
        source: Box<LauncherError>,
    },
    #[error("update failed ({original}) and full reinstall failed ({retry})")]
    ReinstallFailed {
        original: Box<LauncherError>,
        retry: Box<LauncherError>,
    },
    #[error("checksum mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Domain patch error: {0}")]
    DomainPatch(String),
    #[error("{0}")]
    Shared(Arc<LauncherError>),
}

pub type Result<T> = std::result::Result<T, LauncherError>;

impl From<toml::de::Error> for LauncherError {
    fn from(err: toml::de::Error) -> Self {
        LauncherError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for LauncherError {
    fn from(err: toml::ser::Error) -> Self {
        LauncherError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for LauncherError {
    fn from(err: tokio::task::JoinError) -> Self {
        LauncherError::Config(format!("task join error: {err}"))
    }
}

impl LauncherError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        LauncherError::Http {
            status,
            message: message.into(),
        }
    }

    /// Whether another attempt at the same operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            LauncherError::Cancelled => false,
            LauncherError::Stalled(_)
            | LauncherError::ResumeRejected(_)
            | LauncherError::IncompleteDownload { .. } => true,
            LauncherError::Http { status, .. } => {
                *status == 522 || *status == 408 || *status == 429 || *status >= 500
            }
            LauncherError::Network(err) => {
                if err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() {
                    return true;
                }
                if let Some(status) = err.status() {
                    return status.as_u16() == 522 || status.is_server_error();
                }
                message_is_transient(&err.to_string())
            }
            LauncherError::Io(err) => match err.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
                | io::ErrorKind::UnexpectedEof
                | io::ErrorKind::Interrupted => true,
                _ => message_is_transient(&err.to_string()),
            },
            LauncherError::Shared(inner) => inner.is_retryable(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self {
            LauncherError::Cancelled => true,
            LauncherError::Shared(inner) => inner.is_cancelled(),
            LauncherError::DownloadExhausted { source, .. }
            | LauncherError::PatchStep { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

fn message_is_transient(message: &str) -> bool {
    const MARKERS: [&str; 8] = [
        "unexpected eof",
        "timeout",
        "timed out",
        "connection reset",
        "broken pipe",
        "tls handshake",
        "522",
        "connection closed",
    ];
    let lowered = message.to_ascii_lowercase();
    MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Error raised by the integrity verifier before any file is examined.
#[derive(Debug, Clone)]
pub struct VerificationError {
    pub op: String,
    pub path: Option<PathBuf>,
    pub message: String,
}

impl VerificationError {
    pub fn new(op: &str, path: Option<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            op: op.to_string(),
            path,
            message: message.into(),
        }
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(path) => write!(f, "verify {} {}: {}", self.op, path.display(), self.message),
            None => write!(f, "verify {}: {}", self.op, self.message),
        }
    }
}

impl std::error::Error for VerificationError {}
