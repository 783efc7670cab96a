//! Manager-side session handles.
//!
//! A [`Session`] owns one worker child process and the only channel to it.
//! Calls are correlated: each request registers a pending oneshot plus any
//! side-channel callbacks under a fresh correlation ID, and a single
//! background listener task demultiplexes everything the worker sends back.
//! A broken channel rejects every pending call, not just the newest one.

mod exit_guard;
mod manager;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use quern_protocol::CommandOutcome;
use quern_protocol::CorrelationId;
use quern_protocol::EngineOp;
use quern_protocol::Reply;
use quern_protocol::RunOptions;
use quern_protocol::SessionMsg;
use quern_protocol::WorkerMsg;
use quern_protocol::WorkerStatus;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::ChildStdin;
use tokio::process::ChildStdout;
use tokio::process::Command;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

pub use manager::DEFAULT_SESSION_ID;
pub use manager::SessionManager;

use crate::config::ManagerConfig;
use crate::error::SessionError;
use crate::worker::PARENT_PID_ENV;
use crate::worker::SESSION_ID_ENV;

const LIVENESS_POLL_INTERVAL: Duration = Duration::from_millis(100);

pub type LogCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(f64, Option<f64>, Option<&str>) + Send + Sync>;

/// Side-channel subscriptions for one call. Callbacks run on the session's
/// listener task and must be cheap; hand the payload to a channel when real
/// work is needed.
#[derive(Clone, Default)]
pub struct CallHooks {
    log: Option<LogCallback>,
    progress: Option<ProgressCallback>,
}

impl CallHooks {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn on_log(mut self, callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.log = Some(Arc::new(callback));
        self
    }

    pub fn on_progress(
        mut self,
        callback: impl Fn(f64, Option<f64>, Option<&str>) + Send + Sync + 'static,
    ) -> Self {
        self.progress = Some(Arc::new(callback));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Starting,
    Running,
    Stopped,
    Error,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub status: SessionStatus,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
}

struct Pending {
    tx: oneshot::Sender<Result<Reply, SessionError>>,
    log: Vec<LogCallback>,
    progress: Vec<ProgressCallback>,
}

struct SessionState {
    session_id: String,
    status_tx: watch::Sender<SessionStatus>,
    /// Worker pid as reported by `ready`; 0 until then.
    pid: AtomicU32,
    stop_requested: AtomicBool,
    pending: StdMutex<HashMap<CorrelationId, Pending>>,
}

impl SessionState {
    fn pending_lock(&self) -> MutexGuard<'_, HashMap<CorrelationId, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, next: SessionStatus) {
        self.status_tx.send_if_modified(|current| {
            let allowed = matches!(
                (*current, next),
                (
                    SessionStatus::Starting,
                    SessionStatus::Running | SessionStatus::Error | SessionStatus::Stopped,
                ) | (
                    SessionStatus::Running,
                    SessionStatus::Stopped | SessionStatus::Error,
                )
            );
            if allowed {
                *current = next;
            }
            allowed
        });
    }

    /// Reject every pending call. Used when the channel breaks and when a
    /// stop abandons in-flight work.
    fn fail_all(&self, detail: &str) {
        let drained: Vec<Pending> = {
            let mut pending = self.pending_lock();
            pending.drain().map(|(_, entry)| entry).collect()
        };
        for entry in drained {
            let _ = entry.tx.send(Err(SessionError::transport(detail)));
        }
    }

    fn dispatch(&self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Ready { pid } => {
                self.pid.store(pid, Ordering::SeqCst);
                self.transition(SessionStatus::Running);
                info!(session = %self.session_id, pid, "session running");
            }
            WorkerMsg::Log { id, text } => {
                // Clone the callback list out of the lock; user code never
                // runs while the map is held.
                let callbacks: Vec<LogCallback> = self
                    .pending_lock()
                    .get(&id)
                    .map(|entry| entry.log.clone())
                    .unwrap_or_default();
                for callback in callbacks {
                    callback(&text);
                }
            }
            WorkerMsg::Progress {
                id,
                progress,
                total,
                message,
            } => {
                let callbacks: Vec<ProgressCallback> = self
                    .pending_lock()
                    .get(&id)
                    .map(|entry| entry.progress.clone())
                    .unwrap_or_default();
                for callback in callbacks {
                    callback(progress, total, message.as_deref());
                }
            }
            WorkerMsg::Response { id, reply } => {
                if let Some(entry) = self.pending_lock().remove(&id) {
                    let _ = entry.tx.send(Ok(reply));
                } else {
                    debug!(session = %self.session_id, %id, "response for unknown correlation id");
                }
            }
            WorkerMsg::Error {
                id: Some(id),
                failure,
            } => {
                if let Some(entry) = self.pending_lock().remove(&id) {
                    let _ = entry.tx.send(Err(SessionError::Engine(failure)));
                } else {
                    debug!(session = %self.session_id, %id, "error for unknown correlation id");
                }
            }
            WorkerMsg::Error { id: None, failure } => {
                error!(session = %self.session_id, "worker-level fault: {failure}");
                self.fail_all(&format!("worker-level fault: {failure}"));
                self.transition(SessionStatus::Error);
            }
        }
    }

    fn on_disconnect(&self, detail: &str) {
        self.fail_all(detail);
        if self.stop_requested.load(Ordering::SeqCst) {
            self.transition(SessionStatus::Stopped);
            debug!(session = %self.session_id, "worker channel closed after stop");
        } else {
            self.transition(SessionStatus::Error);
            warn!(session = %self.session_id, detail, "worker channel closed unexpectedly");
        }
    }
}

async fn listen(state: Arc<SessionState>, stdout: ChildStdout) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerMsg>(trimmed) {
                    Ok(msg) => state.dispatch(msg),
                    Err(err) => {
                        warn!(session = %state.session_id, "ignoring malformed worker message: {err}");
                    }
                }
            }
            Ok(None) => {
                state.on_disconnect("worker closed its output channel");
                break;
            }
            Err(err) => {
                state.on_disconnect(&format!("worker channel read failed: {err}"));
                break;
            }
        }
    }
}

/// A named, stateful handle to one isolated engine instance, reachable
/// through its worker process.
pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    config: ManagerConfig,
    state: Arc<SessionState>,
    child: TokioMutex<Option<Child>>,
    child_pid: Option<u32>,
    stdin: TokioMutex<Option<ChildStdin>>,
    listener: JoinHandle<()>,
}

impl Session {
    /// Spawn the worker process and attach the listener. Must run inside a
    /// tokio runtime; readiness is awaited separately (`wait_ready`).
    pub(crate) fn spawn(id: String, config: ManagerConfig) -> Result<Self, SessionError> {
        let exe = config.resolve_worker_exe()?;
        let mut command = Command::new(&exe);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker diagnostics interleave with ours on stderr; stdout is
            // reserved for the message channel.
            .stderr(Stdio::inherit())
            .env(SESSION_ID_ENV, &id)
            .env(PARENT_PID_ENV, std::process::id().to_string())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|source| SessionError::Spawn { source })?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SessionError::transport("worker stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SessionError::transport("worker stdout unavailable"))?;
        let child_pid = child.id();
        if let Some(pid) = child_pid {
            exit_guard::register(pid);
        }
        debug!(session = %id, exe = %exe.display(), pid = ?child_pid, "spawned worker");

        let (status_tx, _) = watch::channel(SessionStatus::Starting);
        let state = Arc::new(SessionState {
            session_id: id.clone(),
            status_tx,
            pid: AtomicU32::new(0),
            stop_requested: AtomicBool::new(false),
            pending: StdMutex::new(HashMap::new()),
        });
        let listener = tokio::spawn(listen(Arc::clone(&state), stdout));

        Ok(Self {
            id,
            created_at: Utc::now(),
            config,
            state,
            child: TokioMutex::new(Some(child)),
            child_pid,
            stdin: TokioMutex::new(Some(stdin)),
            listener,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> SessionStatus {
        *self.state.status_tx.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        match self.state.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            status: self.status(),
            pid: self.pid(),
            created_at: self.created_at,
        }
    }

    /// Issue one operation and await its terminal message. Unbounded by
    /// design; long-running engine calls are legitimate. Callers that need
    /// cancellation use [`Session::call_with_cancel`].
    pub async fn call(&self, op: EngineOp, hooks: CallHooks) -> Result<Reply, SessionError> {
        let (_id, rx) = self.submit(op, hooks).await?;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::transport("pending call dropped by listener")),
        }
    }

    /// Like [`Session::call`], but observes `cancel`. On cancellation the
    /// session sends a break-in first, then waits (bounded) for the worker
    /// to acknowledge by terminating the in-flight command, and only then
    /// surfaces [`SessionError::Cancelled`] — so the next call finds the
    /// engine idle with all previously defined state intact.
    pub async fn call_with_cancel(
        &self,
        op: EngineOp,
        hooks: CallHooks,
        cancel: &CancellationToken,
    ) -> Result<Reply, SessionError> {
        let (id, mut rx) = self.submit(op, hooks).await?;
        tokio::select! {
            result = &mut rx => match result {
                Ok(result) => result,
                Err(_) => Err(SessionError::transport("pending call dropped by listener")),
            },
            _ = cancel.cancelled() => {
                if let Err(err) = self.break_in().await {
                    warn!(session = %self.id, "failed to send break-in: {err}");
                }
                self.wait_break_ack(id).await;
                Err(SessionError::Cancelled)
            }
        }
    }

    pub async fn run(
        &self,
        code: impl Into<String>,
        options: RunOptions,
        hooks: CallHooks,
    ) -> Result<CommandOutcome, SessionError> {
        let op = EngineOp::Run {
            code: code.into(),
            options,
        };
        expect_command(self.call(op, hooks).await?)
    }

    pub async fn run_script(
        &self,
        path: impl Into<PathBuf>,
        options: RunOptions,
        hooks: CallHooks,
    ) -> Result<CommandOutcome, SessionError> {
        let op = EngineOp::RunScript {
            path: path.into(),
            options,
        };
        expect_command(self.call(op, hooks).await?)
    }

    pub async fn worker_status(&self) -> Result<WorkerStatus, SessionError> {
        match self.call(EngineOp::Status, CallHooks::none()).await? {
            Reply::Status(status) => Ok(status),
            Reply::Command(_) => Err(SessionError::transport("worker returned mismatched reply")),
        }
    }

    /// Session-scoped, out-of-band interrupt. Returns once the signal is on
    /// the wire; it does not wait for the in-flight command to end. A break
    /// sent to an idle session is a harmless no-op.
    pub async fn break_in(&self) -> Result<(), SessionError> {
        self.send_msg(&SessionMsg::Break).await
    }

    /// Graceful shutdown, escalating to a kill after `timeout`. Idempotent.
    /// Stop wins over pending commands: their futures are rejected with a
    /// transport error.
    pub async fn stop(&self, timeout: Duration) -> Result<(), SessionError> {
        if self.status() == SessionStatus::Stopped {
            return Ok(());
        }
        self.state.stop_requested.store(true, Ordering::SeqCst);
        if let Err(err) = self.send_msg(&SessionMsg::Stop).await {
            debug!(session = %self.id, "stop message not delivered: {err}");
        }
        // Closing stdin gives the worker listener an EOF even when the stop
        // line was lost.
        *self.stdin.lock().await = None;

        let mut child_guard = self.child.lock().await;
        if let Some(child) = child_guard.as_mut() {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => debug!(session = %self.id, %status, "worker exited"),
                Ok(Err(err)) => warn!(session = %self.id, "failed waiting for worker exit: {err}"),
                Err(_) => {
                    warn!(session = %self.id, ?timeout, "worker did not exit in time; killing");
                    if let Err(err) = child.kill().await {
                        warn!(session = %self.id, "failed to kill worker: {err}");
                    }
                }
            }
        }
        *child_guard = None;
        drop(child_guard);
        if let Some(pid) = self.child_pid {
            exit_guard::unregister(pid);
        }
        self.state.fail_all("session stopped");
        self.state.transition(SessionStatus::Stopped);
        Ok(())
    }

    /// Block until the worker reports `ready`, failing fast when the child
    /// exits first rather than sleeping out the full timeout.
    pub(crate) async fn wait_ready(&self, timeout: Duration) -> Result<(), SessionError> {
        let mut status_rx = self.state.status_tx.subscribe();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match *status_rx.borrow_and_update() {
                SessionStatus::Running => return Ok(()),
                SessionStatus::Error => {
                    return Err(SessionError::transport("worker failed before becoming ready"));
                }
                SessionStatus::Stopped => {
                    return Err(SessionError::transport("session stopped before becoming ready"));
                }
                SessionStatus::Starting => {}
            }
            if let Some(exit) = self.try_wait_child().await {
                self.state
                    .fail_all(&format!("worker exited before ready: {exit}"));
                self.state.transition(SessionStatus::Error);
                return Err(SessionError::transport(format!(
                    "worker exited before signalling ready: {exit}"
                )));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SessionError::timeout("worker readiness", timeout));
            }
            tokio::select! {
                changed = status_rx.changed() => {
                    if changed.is_err() {
                        return Err(SessionError::transport("session state dropped"));
                    }
                }
                _ = tokio::time::sleep(LIVENESS_POLL_INTERVAL) => {}
            }
        }
    }

    async fn try_wait_child(&self) -> Option<std::process::ExitStatus> {
        let mut guard = self.child.lock().await;
        guard.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }

    async fn submit(
        &self,
        op: EngineOp,
        hooks: CallHooks,
    ) -> Result<
        (
            CorrelationId,
            oneshot::Receiver<Result<Reply, SessionError>>,
        ),
        SessionError,
    > {
        match self.status() {
            SessionStatus::Stopped | SessionStatus::Error => {
                return Err(SessionError::transport(format!(
                    "session {:?} is {}",
                    self.id,
                    self.status()
                )));
            }
            SessionStatus::Starting | SessionStatus::Running => {}
        }

        let id = CorrelationId::new();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.state.pending_lock();
            pending.insert(id, Pending {
                tx,
                log: hooks.log.into_iter().collect(),
                progress: hooks.progress.into_iter().collect(),
            });
        }
        if let Err(err) = self.send_msg(&SessionMsg::Request { id, op }).await {
            self.state.pending_lock().remove(&id);
            return Err(err);
        }
        Ok((id, rx))
    }

    /// Bounded wait for the worker to acknowledge a break-in by delivering
    /// the interrupted call's terminal message. Polls rather than blocks so
    /// the bound holds even if the worker never answers.
    async fn wait_break_ack(&self, id: CorrelationId) {
        let deadline = tokio::time::Instant::now() + self.config.break_ack_timeout;
        loop {
            if !self.state.pending_lock().contains_key(&id) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    session = %self.id,
                    %id,
                    timeout = ?self.config.break_ack_timeout,
                    "break-in not acknowledged within bound; propagating cancellation anyway"
                );
                return;
            }
            tokio::time::sleep(self.config.break_poll_interval).await;
        }
    }

    async fn send_msg(&self, msg: &SessionMsg) -> Result<(), SessionError> {
        let mut line = serde_json::to_string(msg)
            .map_err(|err| SessionError::transport(format!("failed to encode message: {err}")))?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let Some(stdin) = guard.as_mut() else {
            return Err(SessionError::transport("worker stdin is closed"));
        };
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|err| SessionError::transport(format!("failed to write to worker: {err}")))?;
        stdin
            .flush()
            .await
            .map_err(|err| SessionError::transport(format!("failed to flush worker channel: {err}")))?;
        Ok(())
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // kill_on_drop handles the child; the pid must leave the exit
        // guard's kill list so a reused pid is never signalled.
        self.listener.abort();
        if let Some(pid) = self.child_pid {
            exit_guard::unregister(pid);
        }
    }
}

fn expect_command(reply: Reply) -> Result<CommandOutcome, SessionError> {
    match reply {
        Reply::Command(outcome) => Ok(outcome),
        Reply::Status(_) => Err(SessionError::transport("worker returned mismatched reply")),
    }
}
