use std::time::Duration;

use quern_protocol::EngineFailure;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SessionError>;

/// Manager-side error taxonomy.
///
/// `Engine` is recoverable: the session stays usable after a failed command.
/// `Transport` is fatal to the session: the channel broke, every pending
/// call is rejected and the session must be recreated.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("engine command failed: {0}")]
    Engine(EngineFailure),
    #[error("session transport failed: {detail}")]
    Transport { detail: String },
    #[error("session {id:?} not found")]
    NotFound { id: String },
    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },
    #[error("call cancelled")]
    Cancelled,
    #[error("failed to spawn worker process: {source}")]
    Spawn {
        #[source]
        source: std::io::Error,
    },
}

impl SessionError {
    pub(crate) fn transport(detail: impl Into<String>) -> Self {
        Self::Transport {
            detail: detail.into(),
        }
    }

    pub(crate) fn timeout(what: &'static str, after: Duration) -> Self {
        Self::Timeout { what, after }
    }

    /// True when the command was stopped by a break-in rather than failing
    /// on its own.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Engine(failure) if failure.interrupted)
    }
}
