//! Session/worker execution runtime.
//!
//! The manager side ([`session::SessionManager`], [`session::Session`]) runs
//! inside the control-plane process and owns one worker child process per
//! named session. Each worker ([`worker::WorkerRuntime`]) exclusively owns a
//! single [`engine::Engine`] instance and serves a correlated
//! request/response protocol with streamed log/progress side-channels and an
//! out-of-band break-in signal.

pub mod config;
pub mod engine;
pub mod error;
pub mod session;
pub mod streaming;
pub mod worker;

pub use config::ManagerConfig;
pub use config::StreamConfig;
pub use error::SessionError;
pub use session::CallHooks;
pub use session::DEFAULT_SESSION_ID;
pub use session::Session;
pub use session::SessionInfo;
pub use session::SessionManager;
pub use session::SessionStatus;
