//! Error taxonomy for the session controller.
//!
//! Transport implementations report `anyhow::Error` with context; every
//! component converts those into one of these kinds at its boundary so that
//! no remote failure escapes as an uncaught fault.

use thiserror::Error;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    /// A workspace file push failed. Recovered by the next edit's push.
    #[error("file sync failed: {0}")]
    SyncFailure(String),

    /// The execute request failed (network, timeout, non-2xx, bad payload).
    #[error("execution failed: {0}")]
    Execution(String),

    /// A run is already in flight for this session.
    #[error("a run is already in progress for this session")]
    Busy,

    /// The terminal connection was lost or is not currently open.
    #[error("terminal channel dropped: {0}")]
    ChannelDropped(String),

    /// The backend could not be reached (terminal connect, health check, listing).
    #[error("backend unreachable: {0}")]
    ChannelUnreachable(String),

    /// No artifact of the last run, or no workspace file, has this name.
    #[error("file not found: {0}")]
    ArtifactNotFound(String),

    #[error("artifact {name} could not be decoded: {reason}")]
    ArtifactDecode { name: String, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SessionError {
    /// Whether the failure is expected to heal on its own (next edit, next
    /// reconnect attempt) without user action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::SyncFailure(_)
                | SessionError::ChannelDropped(_)
                | SessionError::ChannelUnreachable(_)
                | SessionError::Busy
        )
    }
}

/// Render an `anyhow` chain on one line (`outer: inner: root`).
pub(crate) fn describe(err: &anyhow::Error) -> String {
    format!("{:#}", err)
}
