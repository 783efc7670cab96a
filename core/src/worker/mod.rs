//! Worker-process runtime.
//!
//! Two loops share one queue. The listener thread blocks on the inbound
//! channel and handles `break` out-of-band — it never enters the queue, so
//! an interrupt reaches the engine while the execution loop is still inside
//! a blocking call. The execution loop owns the engine and serves one
//! request at a time; concurrency across sessions comes from running more
//! worker processes, never from parallel commands inside one.

use std::io::BufRead;
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use std::time::Instant;

use quern_protocol::CommandOutcome;
use quern_protocol::CorrelationId;
use quern_protocol::EngineFailure;
use quern_protocol::EngineOp;
use quern_protocol::Reply;
use quern_protocol::RunOptions;
use quern_protocol::SessionMsg;
use quern_protocol::WireError;
use quern_protocol::WorkerMsg;
use quern_protocol::WorkerStatus;
use quern_protocol::read_msg;
use quern_protocol::write_msg;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::StreamConfig;
use crate::engine::Engine;
use crate::engine::EngineControl;
use crate::engine::EngineError;
use crate::engine::OutputSink;
use crate::streaming::CapturedOutput;
use crate::streaming::OutputTee;
use crate::streaming::drain_chunks;

/// Set on spawned workers so diagnostics can name their session.
pub const SESSION_ID_ENV: &str = "QUERN_SESSION_ID";
/// Control-plane pid, used to close the fork/exec orphan window when arming
/// the parent-death signal.
pub const PARENT_PID_ENV: &str = "QUERN_PARENT_PID";

const QUEUE_POLL_INTERVAL: Duration = Duration::from_millis(100);

const INTERRUPTED_RC: i64 = 1;

enum QueueItem {
    Request { id: CorrelationId, op: EngineOp },
    Stop,
}

type SharedWriter<W> = Arc<Mutex<W>>;

pub struct WorkerRuntime<E> {
    engine: E,
    stream: StreamConfig,
    commands_run: u64,
}

impl<E: Engine> WorkerRuntime<E> {
    pub fn new(engine: E, stream: StreamConfig) -> Self {
        Self {
            engine,
            stream,
            commands_run: 0,
        }
    }

    /// Drive the runtime over the given channel until a stop request or
    /// channel closure. Consumes the runtime; the engine dies with it.
    pub fn run<R, W>(mut self, reader: R, writer: W) -> Result<(), WireError>
    where
        R: BufRead + Send + 'static,
        W: Write + Send + 'static,
    {
        let writer: SharedWriter<W> = Arc::new(Mutex::new(writer));
        let running = Arc::new(AtomicBool::new(true));
        let control = self.engine.control();
        // Break stays session-scoped, but the in-flight ID lets the
        // listener attribute an interrupt in the logs.
        let in_flight: Arc<Mutex<Option<CorrelationId>>> = Arc::new(Mutex::new(None));
        let (queue_tx, queue_rx) = mpsc::channel::<QueueItem>();

        send(&writer, &WorkerMsg::Ready {
            pid: std::process::id(),
        });
        info!(pid = std::process::id(), "worker ready");

        let listener = {
            let running = Arc::clone(&running);
            let in_flight = Arc::clone(&in_flight);
            thread::Builder::new()
                .name("quern-listener".to_string())
                .spawn(move || listener_loop(reader, queue_tx, running, control, in_flight))
                .map_err(WireError::Io)?
        };

        while running.load(Ordering::SeqCst) {
            match queue_rx.recv_timeout(QUEUE_POLL_INTERVAL) {
                Ok(QueueItem::Request { id, op }) => {
                    set_in_flight(&in_flight, Some(id));
                    self.handle_request(id, op, &writer);
                    set_in_flight(&in_flight, None);
                }
                Ok(QueueItem::Stop) => break,
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }

        info!("worker execution loop exiting");
        // Dropping the last writer handle closes the outbound channel; the
        // listener thread ends on its own once the inbound channel closes.
        drop(writer);
        drop(listener);
        Ok(())
    }

    fn handle_request<W>(&mut self, id: CorrelationId, op: EngineOp, writer: &SharedWriter<W>)
    where
        W: Write + Send + 'static,
    {
        debug!(%id, op = op.label(), "dispatching request");
        match op {
            EngineOp::Run { code, options } => {
                self.commands_run += 1;
                self.run_command(id, code.clone(), &code, &options, writer);
            }
            EngineOp::RunScript { path, options } => {
                self.commands_run += 1;
                match std::fs::read_to_string(&path) {
                    Ok(code) => {
                        self.run_command(id, path.display().to_string(), &code, &options, writer);
                    }
                    Err(err) => send(writer, &WorkerMsg::Error {
                        id: Some(id),
                        failure: EngineFailure {
                            message: format!("failed to read script {}: {err}", path.display()),
                            rc: None,
                            command: Some(path.display().to_string()),
                            output_tail: None,
                            interrupted: false,
                        },
                    }),
                }
            }
            EngineOp::Status => {
                let reply = Reply::Status(WorkerStatus {
                    pid: std::process::id(),
                    busy: self.engine.control().is_busy(),
                    commands_run: self.commands_run,
                });
                send(writer, &WorkerMsg::Response { id, reply });
            }
        }
    }

    fn run_command<W>(
        &mut self,
        id: CorrelationId,
        command: String,
        code: &str,
        options: &RunOptions,
        writer: &SharedWriter<W>,
    ) where
        W: Write + Send + 'static,
    {
        let (fragment_tx, fragment_rx) = mpsc::channel();
        let mut tee = OutputTee::new(&self.stream, options.max_output_chars, fragment_tx);

        let drain_writer = Arc::clone(writer);
        let flush_interval = self.stream.flush_interval;
        let max_fragment_chars = self.stream.max_fragment_chars;
        let drain = thread::spawn(move || {
            drain_chunks(fragment_rx, flush_interval, max_fragment_chars, |text| {
                send(&drain_writer, &WorkerMsg::Log { id, text });
            });
        });

        let started = Instant::now();
        let result = {
            let mut sink = CommandSink {
                tee: &mut tee,
                writer,
                id,
            };
            std::panic::catch_unwind(AssertUnwindSafe(|| {
                self.engine.execute(code, options, &mut sink)
            }))
        };
        tee.close();
        // Joining before the terminal message keeps the per-ID ordering
        // guarantee: every log fragment is on the wire first.
        if drain.join().is_err() {
            warn!(%id, "log drain thread panicked");
        }

        let captured = tee.finish();
        let wall_time_ms = started.elapsed().as_millis() as u64;

        let msg = match result {
            Ok(Ok(rc)) => WorkerMsg::Response {
                id,
                reply: Reply::Command(CommandOutcome {
                    command,
                    rc,
                    output: captured.output,
                    truncated: captured.truncated,
                    wall_time_ms,
                }),
            },
            Ok(Err(err)) => WorkerMsg::Error {
                id: Some(id),
                failure: failure_for(err, command, &captured),
            },
            Err(_) => WorkerMsg::Error {
                id: Some(id),
                failure: EngineFailure {
                    message: "engine panicked while executing command".to_string(),
                    rc: None,
                    command: Some(command),
                    output_tail: tail_of(&captured),
                    interrupted: false,
                },
            },
        };
        send(writer, &msg);
    }
}

fn listener_loop<R: BufRead>(
    mut reader: R,
    queue: mpsc::Sender<QueueItem>,
    running: Arc<AtomicBool>,
    control: Arc<dyn EngineControl>,
    in_flight: Arc<Mutex<Option<CorrelationId>>>,
) {
    loop {
        match read_msg::<_, SessionMsg>(&mut reader) {
            Ok(SessionMsg::Break) => {
                match *in_flight.lock().unwrap_or_else(PoisonError::into_inner) {
                    Some(id) => debug!(%id, "break-in received; interrupting engine"),
                    None => debug!("break-in received while idle"),
                }
                control.interrupt();
            }
            Ok(SessionMsg::Stop) => {
                running.store(false, Ordering::SeqCst);
                let _ = queue.send(QueueItem::Stop);
                break;
            }
            Ok(SessionMsg::Request { id, op }) => {
                if queue.send(QueueItem::Request { id, op }).is_err() {
                    break;
                }
            }
            Err(WireError::Malformed(err)) => {
                warn!("ignoring malformed message: {err}");
            }
            Err(_) => {
                // Closed or broken inbound channel: same as an orderly stop.
                running.store(false, Ordering::SeqCst);
                let _ = queue.send(QueueItem::Stop);
                break;
            }
        }
    }
}

fn failure_for(err: EngineError, command: String, captured: &CapturedOutput) -> EngineFailure {
    match err {
        EngineError::Interrupted => EngineFailure {
            message: "command interrupted by break-in".to_string(),
            rc: Some(INTERRUPTED_RC),
            command: Some(command),
            output_tail: tail_of(captured),
            interrupted: true,
        },
        EngineError::Command { message, rc } => EngineFailure {
            message,
            rc: Some(rc),
            command: Some(command),
            output_tail: tail_of(captured),
            interrupted: false,
        },
        EngineError::Io(err) => EngineFailure {
            message: err.to_string(),
            rc: None,
            command: Some(command),
            output_tail: tail_of(captured),
            interrupted: false,
        },
    }
}

fn tail_of(captured: &CapturedOutput) -> Option<String> {
    if captured.tail.is_empty() {
        None
    } else {
        Some(captured.tail.clone())
    }
}

fn set_in_flight(slot: &Arc<Mutex<Option<CorrelationId>>>, id: Option<CorrelationId>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = id;
}

fn send<W: Write>(writer: &SharedWriter<W>, msg: &WorkerMsg) {
    let mut guard = writer.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = write_msg(&mut *guard, msg) {
        warn!("failed to send message to manager: {err}");
    }
}

struct CommandSink<'a, W: Write> {
    tee: &'a mut OutputTee,
    writer: &'a SharedWriter<W>,
    id: CorrelationId,
}

impl<W: Write> OutputSink for CommandSink<'_, W> {
    fn write(&mut self, text: &str) {
        self.tee.write(text);
    }

    fn progress(&mut self, progress: f64, total: Option<f64>, message: Option<&str>) {
        send(self.writer, &WorkerMsg::Progress {
            id: self.id,
            progress,
            total,
            message: message.map(str::to_string),
        });
    }
}

/// Arm the parent-death signal so an orphaned worker exits with its control
/// plane. `expected_parent` closes the window where the parent died between
/// spawn and this call.
#[cfg(target_os = "linux")]
pub fn arm_parent_death(expected_parent: Option<u32>) {
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
        if let Some(parent) = expected_parent
            && libc::getppid() != parent as libc::pid_t
        {
            libc::kill(libc::getpid(), libc::SIGTERM);
        }
    }
}

/// No-op outside Linux; `kill_on_drop` on the manager side still applies.
#[cfg(not(target_os = "linux"))]
pub fn arm_parent_death(_expected_parent: Option<u32>) {}
