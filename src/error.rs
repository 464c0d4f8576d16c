//! Error types for the watcher crate.

use thiserror::Error;

/// Result type alias for watcher operations.
pub type Result<T> = std::result::Result<T, WatchError>;

/// Errors that can occur while configuring or running a watcher.
#[derive(Error, Debug)]
pub enum WatchError {
    /// No backend is registered under the requested name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// Missing or invalid fields in the configuration map.
    #[error("invalid configuration: {0}")]
    BadConfig(String),

    /// `start` was called before `set_config`.
    #[error("watcher not configured")]
    NotConfigured,

    /// A resource required at startup is absent (directory, bucket).
    #[error("not found: {0}")]
    NotFound(String),

    /// `start` was called on a watcher that is already running.
    #[error("watcher already started")]
    AlreadyStarted,

    /// Transient backend failure during a tick.
    #[error("backend error: {0}")]
    Backend(String),

    /// The backend returned a response shape we did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A per-record field could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),

    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Filesystem notification error.
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Git repository error.
    #[error("git error: {0}")]
    Git(#[from] git2::Error),

    /// HTTP transport error.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}
