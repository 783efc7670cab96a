//! Wire-level types shared between the manager side and worker processes.
//!
//! Messages travel as newline-delimited JSON over the worker's stdio pipes.
//! Both directions are closed tagged unions so that adding an operation or
//! event is a compile-checked change rather than a string match.

mod protocol;
mod wire;

pub use protocol::CommandOutcome;
pub use protocol::CorrelationId;
pub use protocol::EngineFailure;
pub use protocol::EngineOp;
pub use protocol::Reply;
pub use protocol::RunOptions;
pub use protocol::SessionMsg;
pub use protocol::WorkerMsg;
pub use protocol::WorkerStatus;
pub use wire::WireError;
pub use wire::read_msg;
pub use wire::write_msg;
