use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

/// Ties a request to its side-channel (`log`/`progress`) and terminal
/// (`response`/`error`) messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub Uuid);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Per-call execution options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    /// Echo each command line into the output stream before executing it.
    #[serde(default)]
    pub echo: bool,
    /// Working directory for the duration of this call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Per-call override of the complete-buffer character budget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_chars: Option<usize>,
}

/// Operations a worker knows how to execute. Dispatch on this enum is
/// exhaustive; new operations are added here, not by string matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum EngineOp {
    /// Execute a block of command text against the engine.
    Run {
        code: String,
        #[serde(default)]
        options: RunOptions,
    },
    /// Read a script file and execute its contents.
    RunScript {
        path: PathBuf,
        #[serde(default)]
        options: RunOptions,
    },
    /// Report the worker's status snapshot.
    Status,
}

impl EngineOp {
    /// Short human label used in logs.
    pub fn label(&self) -> &'static str {
        match self {
            EngineOp::Run { .. } => "run",
            EngineOp::RunScript { .. } => "run_script",
            EngineOp::Status => "status",
        }
    }
}

/// Manager → worker messages. `Break` and `Stop` are session-scoped and
/// carry no correlation ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SessionMsg {
    Request { id: CorrelationId, op: EngineOp },
    Break,
    Stop,
}

/// Worker → manager messages. Every `Request` produces exactly one
/// `Response` or `Error` with the same ID, preceded by any number of
/// `Log`/`Progress` messages with that ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMsg {
    Ready {
        pid: u32,
    },
    Log {
        id: CorrelationId,
        text: String,
    },
    Progress {
        id: CorrelationId,
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Response {
        id: CorrelationId,
        reply: Reply,
    },
    /// `id: None` marks a worker-level fault outside any request.
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<CorrelationId>,
        failure: EngineFailure,
    },
}

/// Successful results, one variant per `EngineOp` family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Command(CommandOutcome),
    Status(WorkerStatus),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// The command text as submitted.
    pub command: String,
    /// Engine return code; 0 on success.
    pub rc: i64,
    /// Complete captured output, bounded by the configured budget.
    pub output: String,
    /// True when `output` hit the budget and ends with the truncation marker.
    pub truncated: bool,
    pub wall_time_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkerStatus {
    pub pid: u32,
    pub busy: bool,
    pub commands_run: u64,
}

/// Structured failure detail attached to `error` messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineFailure {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rc: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Most recent output preceding the failure, kept even when the
    /// complete buffer was truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tail: Option<String>,
    /// True when the command was stopped by a break-in rather than failing
    /// on its own.
    #[serde(default)]
    pub interrupted: bool,
}

impl EngineFailure {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            rc: None,
            command: None,
            output_tail: None,
            interrupted: false,
        }
    }
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.rc {
            Some(rc) => write!(f, "{} (rc {rc})", self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use serde_json::json;

    use super::*;

    #[test]
    fn break_and_stop_carry_no_correlation_id() {
        let brk = serde_json::to_value(SessionMsg::Break).expect("serialize");
        assert_eq!(brk, json!({"kind": "break"}));
        let stop = serde_json::to_value(SessionMsg::Stop).expect("serialize");
        assert_eq!(stop, json!({"kind": "stop"}));
    }

    #[test]
    fn request_nests_the_op_under_its_own_tag() {
        let id = CorrelationId::new();
        let msg = SessionMsg::Request {
            id,
            op: EngineOp::Run {
                code: "display 1".to_string(),
                options: RunOptions::default(),
            },
        };
        let value = serde_json::to_value(&msg).expect("serialize");
        assert_eq!(value["kind"], "request");
        assert_eq!(value["op"]["method"], "run");
        assert_eq!(value["op"]["code"], "display 1");

        let round: SessionMsg = serde_json::from_value(value).expect("deserialize");
        assert_eq!(round, msg);
    }

    #[test]
    fn worker_error_id_is_optional() {
        let value = json!({
            "kind": "error",
            "failure": {"message": "engine failed to start"},
        });
        let msg: WorkerMsg = serde_json::from_value(value).expect("deserialize");
        match msg {
            WorkerMsg::Error { id, failure } => {
                assert_eq!(id, None);
                assert_eq!(failure.message, "engine failed to start");
                assert!(!failure.interrupted);
            }
            other => panic!("expected error message, got {other:?}"),
        }
    }

    #[test]
    fn every_op_survives_the_wire() {
        let ops = vec![
            EngineOp::Run {
                code: "scalar x = 1".to_string(),
                options: RunOptions {
                    echo: true,
                    cwd: None,
                    max_output_chars: Some(512),
                },
            },
            EngineOp::RunScript {
                path: PathBuf::from("model.do"),
                options: RunOptions::default(),
            },
            EngineOp::Status,
        ];
        for op in ops {
            let value = serde_json::to_value(&op).expect("serialize");
            assert!(value.get("method").is_some_and(Value::is_string));
            let round: EngineOp = serde_json::from_value(value).expect("deserialize");
            assert_eq!(round, op);
        }
    }
}
