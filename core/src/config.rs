use std::path::PathBuf;
use std::time::Duration;

use crate::error::SessionError;

/// Environment variable naming the worker executable when
/// [`ManagerConfig::worker_exe`] is unset.
pub const WORKER_EXE_ENV: &str = "QUERN_WORKER_EXE";

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BREAK_ACK_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_BREAK_POLL_INTERVAL: Duration = Duration::from_millis(50);

const DEFAULT_MAX_TOTAL_CHARS: usize = 2_000_000;
const DEFAULT_TAIL_CHARS: usize = 8_000;
const DEFAULT_MAX_FRAGMENT_CHARS: usize = 4_000;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(200);

/// Manager-side tunables. One instance is shared by every session a
/// [`crate::session::SessionManager`] creates.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Worker executable to spawn per session. When `None`, resolution
    /// falls back to the `QUERN_WORKER_EXE` environment variable.
    pub worker_exe: Option<PathBuf>,
    /// Bound on the readiness handshake after spawning a worker.
    pub ready_timeout: Duration,
    /// Grace period for `stop()` before escalating to a kill.
    pub stop_timeout: Duration,
    /// Bound on waiting for a break-in to be acknowledged by the worker.
    pub break_ack_timeout: Duration,
    /// Poll cadence while waiting for break acknowledgement.
    pub break_poll_interval: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_exe: None,
            ready_timeout: DEFAULT_READY_TIMEOUT,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            break_ack_timeout: DEFAULT_BREAK_ACK_TIMEOUT,
            break_poll_interval: DEFAULT_BREAK_POLL_INTERVAL,
        }
    }
}

impl ManagerConfig {
    pub fn with_worker_exe(path: impl Into<PathBuf>) -> Self {
        Self {
            worker_exe: Some(path.into()),
            ..Self::default()
        }
    }

    pub(crate) fn resolve_worker_exe(&self) -> Result<PathBuf, SessionError> {
        if let Some(path) = &self.worker_exe {
            return Ok(path.clone());
        }
        match std::env::var_os(WORKER_EXE_ENV) {
            Some(path) if !path.is_empty() => Ok(PathBuf::from(path)),
            _ => Err(SessionError::Spawn {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no worker executable configured and {WORKER_EXE_ENV} is unset"),
                ),
            }),
        }
    }
}

/// Output-pipeline tunables, applied per command on the worker side.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Character budget for the complete output buffer.
    pub max_total_chars: usize,
    /// Capacity of the rolling tail window kept for error context.
    pub tail_chars: usize,
    /// Upper bound on a single queued fragment / delivered notification.
    pub max_fragment_chars: usize,
    /// Minimum interval between log notifications while output keeps
    /// arriving; smaller bursts are coalesced.
    pub flush_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_total_chars: DEFAULT_MAX_TOTAL_CHARS,
            tail_chars: DEFAULT_TAIL_CHARS,
            max_fragment_chars: DEFAULT_MAX_FRAGMENT_CHARS,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn explicit_worker_exe_wins() {
        let config = ManagerConfig::with_worker_exe("/opt/quern/worker");
        let resolved = config.resolve_worker_exe().expect("resolve");
        assert_eq!(resolved, PathBuf::from("/opt/quern/worker"));
    }

    #[test]
    fn missing_worker_exe_is_a_spawn_error() {
        let config = ManagerConfig {
            worker_exe: None,
            ..ManagerConfig::default()
        };
        // The env fallback may be set in the environment running this test;
        // only assert the error shape when it is absent.
        if std::env::var_os(WORKER_EXE_ENV).is_none() {
            match config.resolve_worker_exe() {
                Err(SessionError::Spawn { .. }) => {}
                other => panic!("expected spawn error, got {other:?}"),
            }
        }
    }
}
