//! End-to-end tests against the real worker binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use pretty_assertions::assert_eq;
use quern_core::CallHooks;
use quern_core::ManagerConfig;
use quern_core::SessionError;
use quern_core::SessionManager;
use quern_core::SessionStatus;
use quern_protocol::EngineOp;
use quern_protocol::RunOptions;
use tokio_util::sync::CancellationToken;

fn test_manager() -> SessionManager {
    SessionManager::new(ManagerConfig::with_worker_exe(env!(
        "CARGO_BIN_EXE_quern-worker"
    )))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn default_session_runs_commands_and_keeps_state() {
    let manager = test_manager();
    let session = manager.start().await.expect("start default session");
    assert_eq!(session.status(), SessionStatus::Running);
    assert!(session.pid().is_some());

    let outcome = session
        .run(
            "scalar x = 41\nscalar x = x + 1\ndisplay x",
            RunOptions::default(),
            CallHooks::none(),
        )
        .await
        .expect("run");
    assert_eq!(outcome.rc, 0);
    assert_eq!(outcome.output, "42\n");
    assert!(!outcome.truncated);

    let infos = manager.list_sessions();
    assert_eq!(infos.len(), 1);
    assert_eq!(infos[0].id, "default");
    assert_eq!(infos[0].status, SessionStatus::Running);
    assert_eq!(infos[0].pid, session.pid());

    manager.stop_all().await;
    assert_eq!(session.status(), SessionStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn responses_arrive_in_request_order() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    let slow = tokio::spawn({
        let session = Arc::clone(&session);
        let order = Arc::clone(&order);
        async move {
            session
                .run("sleep 400\ndisplay 1", RunOptions::default(), CallHooks::none())
                .await
                .expect("slow call");
            order.lock().unwrap().push("slow");
        }
    });
    // Issue the fast call well after the slow one is on the wire; FIFO
    // dispatch means it still finishes second.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let fast = tokio::spawn({
        let session = Arc::clone(&session);
        let order = Arc::clone(&order);
        async move {
            session
                .run(
                    "sleep 200\ndisplay 2",
                    RunOptions::default(),
                    CallHooks::none(),
                )
                .await
                .expect("fast call");
            order.lock().unwrap().push("fast");
        }
    });

    slow.await.expect("join slow");
    fast.await.expect("join fast");
    assert_eq!(*order.lock().unwrap(), vec!["slow", "fast"]);

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sessions_are_isolated_from_each_other() {
    let manager = test_manager();
    let s1 = manager.get_or_create("s1").await.expect("create s1");
    let s2 = manager.get_or_create("s2").await.expect("create s2");
    assert_ne!(s1.pid(), s2.pid());

    s1.run("scalar x = 10", RunOptions::default(), CallHooks::none())
        .await
        .expect("set x on s1");
    s2.run("scalar x = 20", RunOptions::default(), CallHooks::none())
        .await
        .expect("set x on s2");

    let on_s1 = s1
        .run("display x", RunOptions::default(), CallHooks::none())
        .await
        .expect("read x on s1");
    let on_s2 = s2
        .run("display x", RunOptions::default(), CallHooks::none())
        .await
        .expect("read x on s2");
    assert_eq!(on_s1.output, "10\n");
    assert_eq!(on_s2.output, "20\n");

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelling_a_long_command_preserves_session_state() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");
    session
        .run("scalar x = 42", RunOptions::default(), CallHooks::none())
        .await
        .expect("seed state");

    let cancel = CancellationToken::new();
    let in_flight = tokio::spawn({
        let session = Arc::clone(&session);
        let cancel = cancel.clone();
        async move {
            session
                .call_with_cancel(
                    EngineOp::Run {
                        code: "count 1000000 5".to_string(),
                        options: RunOptions::default(),
                    },
                    CallHooks::none(),
                    &cancel,
                )
                .await
        }
    });

    tokio::time::sleep(Duration::from_millis(400)).await;
    let cancelled_at = Instant::now();
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), in_flight)
        .await
        .expect("cancellation observed within the bounded wait")
        .expect("join");
    assert!(matches!(result, Err(SessionError::Cancelled)));
    assert!(
        cancelled_at.elapsed()
            < manager.config().break_ack_timeout + Duration::from_secs(1)
    );

    // The interrupt killed only the in-flight command: prior state is
    // intact and the session is immediately usable.
    let outcome = session
        .run("display x", RunOptions::default(), CallHooks::none())
        .await
        .expect("session usable after cancel");
    assert_eq!(outcome.output, "42\n");

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn break_in_on_an_idle_session_is_a_noop() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");

    session.break_in().await.expect("break on idle");
    tokio::time::sleep(Duration::from_millis(100)).await;

    let outcome = session
        .run("display 7", RunOptions::default(), CallHooks::none())
        .await
        .expect("command after idle break");
    assert_eq!(outcome.rc, 0);
    assert_eq!(outcome.output, "7\n");

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_that_dies_before_ready_fails_fast() {
    // `false` exits immediately without ever speaking the protocol.
    let manager = SessionManager::new(ManagerConfig::with_worker_exe("false"));
    let started = Instant::now();
    let err = manager
        .get_or_create("doomed")
        .await
        .expect_err("readiness must fail");
    assert!(
        started.elapsed() < Duration::from_secs(10),
        "dead worker should fail fast, took {:?}",
        started.elapsed()
    );
    assert!(matches!(err, SessionError::Transport { .. }));
    assert!(manager.list_sessions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_worker_executable_is_a_spawn_error() {
    let manager =
        SessionManager::new(ManagerConfig::with_worker_exe("/nonexistent/quern-worker"));
    match manager.get_or_create("ghost").await {
        Err(SessionError::Spawn { .. }) => {}
        other => panic!("expected spawn error, got {other:?}"),
    }
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn killed_worker_rejects_pending_calls_with_transport_error() {
    let manager = test_manager();
    let session = manager.get_or_create("victim").await.expect("create");
    let pid = session.pid().expect("pid");

    let in_flight = tokio::spawn({
        let session = Arc::clone(&session);
        async move {
            session
                .run("sleep 30000", RunOptions::default(), CallHooks::none())
                .await
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let killed = std::process::Command::new("kill")
        .args(["-9", &pid.to_string()])
        .status()
        .expect("send SIGKILL");
    assert!(killed.success());

    let result = tokio::time::timeout(Duration::from_secs(5), in_flight)
        .await
        .expect("pending call must not hang")
        .expect("join");
    assert!(matches!(result, Err(SessionError::Transport { .. })));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(session.status(), SessionStatus::Error);

    // The session is dead for good; later calls are refused outright.
    let refused = session
        .run("display 1", RunOptions::default(), CallHooks::none())
        .await;
    assert!(matches!(refused, Err(SessionError::Transport { .. })));

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn log_streaming_coalesces_without_losing_content() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");

    let chunks: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let progress: Arc<Mutex<Vec<(f64, Option<f64>)>>> = Arc::new(Mutex::new(Vec::new()));
    let hooks = CallHooks::none()
        .on_log({
            let chunks = Arc::clone(&chunks);
            move |text| chunks.lock().unwrap().push(text.to_string())
        })
        .on_progress({
            let progress = Arc::clone(&progress);
            move |done, total, _message| progress.lock().unwrap().push((done, total))
        });

    let line_count = 200;
    let outcome = session
        .run(format!("count {line_count}"), RunOptions::default(), hooks)
        .await
        .expect("run");

    let expected: String = (1..=line_count).map(|i| format!("{i}\n")).collect();
    assert_eq!(outcome.output, expected);

    let chunks = chunks.lock().unwrap();
    assert_eq!(chunks.concat(), expected, "log stream must equal the captured output");
    assert!(
        chunks.len() < line_count,
        "a fast burst of {line_count} lines should coalesce, got {} notifications",
        chunks.len()
    );
    assert_eq!(
        progress.lock().unwrap().last(),
        Some(&(line_count as f64, Some(line_count as f64)))
    );

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn per_call_output_budget_truncates_with_marker() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");

    let options = RunOptions {
        max_output_chars: Some(40),
        ..RunOptions::default()
    };
    let outcome = session
        .run("count 100", options, CallHooks::none())
        .await
        .expect("run");
    assert!(outcome.truncated);
    assert!(outcome.output.ends_with("(output truncated)\n"));
    assert_eq!(outcome.output.matches("truncated").count(), 1);
    assert!(outcome.output.chars().count() < 40 + 32);

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn engine_failures_keep_the_session_usable() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");

    let err = session
        .run("display ghost", RunOptions::default(), CallHooks::none())
        .await
        .expect_err("undefined scalar must fail");
    match &err {
        SessionError::Engine(failure) => {
            assert_eq!(failure.rc, Some(111));
            assert!(failure.message.contains("ghost"));
            assert!(!failure.interrupted);
        }
        other => panic!("expected engine failure, got {other:?}"),
    }

    let outcome = session
        .run("display 5", RunOptions::default(), CallHooks::none())
        .await
        .expect("session survives engine failure");
    assert_eq!(outcome.output, "5\n");

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_script_executes_a_file_and_reports_missing_ones() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");
    let dir = tempfile::tempdir().expect("tempdir");

    let script = dir.path().join("model.qn");
    std::fs::write(&script, "scalar s = 5\ndisplay s * 2\n").expect("write script");
    let outcome = session
        .run_script(&script, RunOptions::default(), CallHooks::none())
        .await
        .expect("run script");
    assert_eq!(outcome.output, "10\n");
    assert_eq!(outcome.command, script.display().to_string());

    let missing: PathBuf = dir.path().join("missing.qn");
    let err = session
        .run_script(&missing, RunOptions::default(), CallHooks::none())
        .await
        .expect_err("missing script must fail");
    match err {
        SessionError::Engine(failure) => {
            assert!(failure.message.contains("failed to read script"));
        }
        other => panic!("expected engine failure, got {other:?}"),
    }

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_status_reports_commands_served() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");

    session
        .run("scalar a = 1", RunOptions::default(), CallHooks::none())
        .await
        .expect("run");
    let status = session.worker_status().await.expect("status");
    assert_eq!(Some(status.pid), session.pid());
    assert_eq!(status.commands_run, 1);
    assert!(!status.busy);

    manager.stop_all().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_idempotent_and_removes_the_session() {
    let manager = test_manager();
    let session = manager.start().await.expect("start");

    manager.stop_session("default").await.expect("stop");
    assert_eq!(session.status(), SessionStatus::Stopped);
    assert!(manager.list_sessions().is_empty());

    // Stopping an already-stopped handle is a no-op; stopping an unknown
    // id is NotFound.
    session.stop(Duration::from_secs(1)).await.expect("idempotent stop");
    match manager.stop_session("default").await {
        Err(SessionError::NotFound { .. }) => {}
        other => panic!("expected not found, got {other:?}"),
    }
}
