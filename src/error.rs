use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Service error codes AWS returns with a 4xx status that clear on retry.
const RETRYABLE_CODES: &[&str] = &[
    "ThrottlingException",
    "LimitExceededException",
    "ServiceUnavailableException",
];

pub type Result<T, E = PerftestError> = std::result::Result<T, E>;

/// Every failure the build, test and analyze stages can surface.
#[derive(Debug, Error)]
pub enum PerftestError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid build identity: {0}")]
    InvalidIdentity(String),

    #[error("authentication against {remote} failed: {message}")]
    Auth { remote: String, message: String },

    #[error("commit '{commit}' not found on branch '{branch}': {message}")]
    CommitNotFound {
        branch: String,
        commit: String,
        message: String,
    },

    #[error("git {operation} failed: {message}")]
    Git { operation: String, message: String },

    #[error("{tool} exited with {status}; last output:\n{tail}")]
    BuildTool {
        tool: String,
        status: String,
        tail: String,
    },

    #[error("{role} APK not found under {}", .searched.display())]
    ArtifactMissing { role: String, searched: PathBuf },

    #[error("invalid APK {}: {reason}", .path.display())]
    InvalidApk { path: PathBuf, reason: String },

    #[error("upload of '{name}' failed: {message}")]
    Upload { name: String, message: String },

    #[error("test '{name}' not in the benchmark catalog; available tests: {available}")]
    TestNotFound { name: String, available: String },

    #[error("device pool '{name}' not found; available pools: {available}")]
    PoolNotFound { name: String, available: String },

    #[error(
        "timed out after {}s waiting for {resource} (last status: {last_status}); it keeps running remotely",
        .waited.as_secs()
    )]
    Timeout {
        resource: String,
        waited: Duration,
        last_status: String,
    },

    #[error("device farm {operation} failed{}: {message}", HttpStatus(.status))]
    Remote {
        operation: String,
        status: Option<u16>,
        code: Option<String>,
        message: String,
    },

    #[error("cannot read archive {}: {message}", .path.display())]
    Archive { path: PathBuf, message: String },

    #[error("no trace files found in {}", .0.display())]
    TraceFileNotFound(PathBuf),

    #[error("query '{name}' not found (searched built-ins and {searched})")]
    QueryNotFound { name: String, searched: String },

    #[error("query '{query}' failed on {}: {message}", .trace.display())]
    Analysis {
        query: String,
        trace: PathBuf,
        message: String,
    },

    #[error("cannot render report: {0}")]
    Report(String),

    #[error("artifacts for {0} not found in cache; run `perftest build` first or drop --skip-build")]
    ArtifactsNotFound(String),

    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PerftestError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        Self::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Shorthand for `map_err` on filesystem calls.
    pub fn at(path: impl AsRef<Path>) -> impl FnOnce(io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        move |source| Self::Io { path, source }
    }

    pub fn remote(operation: &str, message: impl Into<String>) -> Self {
        Self::Remote {
            operation: operation.to_string(),
            status: None,
            code: None,
            message: message.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Errors worth another poll attempt rather than aborting the wait.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Remote { status, code, .. } => {
                code.as_deref().is_some_and(|code| RETRYABLE_CODES.contains(&code))
                    || !matches!(status, Some(400..=499))
            }
            _ => false,
        }
    }
}

struct HttpStatus<'a>(&'a Option<u16>);

impl fmt::Display for HttpStatus<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, " (HTTP {code})"),
            None => Ok(()),
        }
    }
}
