//! The engine boundary.
//!
//! A worker process owns exactly one [`Engine`] and is the only component
//! allowed to call it. `execute` is blocking and single-threaded by
//! contract; cross-thread interaction goes through [`EngineControl`], whose
//! `interrupt` must be safe to call while `execute` is running on another
//! thread.

mod calc;

use std::sync::Arc;

use quern_protocol::RunOptions;
use thiserror::Error;

pub use calc::CalcEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{message}")]
    Command { message: String, rc: i64 },
    #[error("command interrupted by break-in")]
    Interrupted,
    #[error("engine i/o failure: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn command(message: impl Into<String>, rc: i64) -> Self {
        Self::Command {
            message: message.into(),
            rc,
        }
    }
}

/// Receives a command's streamed output while it executes.
///
/// `progress` reports are a separate side channel from text output; the
/// default implementation drops them for engines that have nothing to say.
pub trait OutputSink {
    fn write(&mut self, text: &str);

    fn progress(&mut self, _progress: f64, _total: Option<f64>, _message: Option<&str>) {}
}

/// Cross-thread control surface of an engine.
pub trait EngineControl: Send + Sync {
    /// Ask the in-flight command to stop at its next check point. Harmless
    /// when the engine is idle.
    fn interrupt(&self);

    fn is_busy(&self) -> bool;
}

pub trait Engine: Send {
    /// Execute a block of command text, writing output to `sink` as it is
    /// produced. Returns the engine return code (`0` on success); failures
    /// that leave the engine usable are reported as [`EngineError`].
    fn execute(
        &mut self,
        code: &str,
        options: &RunOptions,
        sink: &mut dyn OutputSink,
    ) -> Result<i64, EngineError>;

    /// Shared handle for break-in and busy queries, callable from any
    /// thread.
    fn control(&self) -> Arc<dyn EngineControl>;
}
