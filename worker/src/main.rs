//! Worker executable: one engine instance behind a stdio message channel.
//!
//! The manager spawns one of these per session. Stdout is reserved for the
//! message protocol; all diagnostics go to stderr so they interleave with
//! the control plane's own logging.

use std::io::BufReader;

use anyhow::Context;
use quern_core::StreamConfig;
use quern_core::engine::CalcEngine;
use quern_core::worker::PARENT_PID_ENV;
use quern_core::worker::SESSION_ID_ENV;
use quern_core::worker::WorkerRuntime;
use quern_core::worker::arm_parent_death;
use tracing::info;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "QUERN_WORKER_LOG";

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let expected_parent = std::env::var(PARENT_PID_ENV)
        .ok()
        .and_then(|raw| raw.parse().ok());
    arm_parent_death(expected_parent);

    let session = std::env::var(SESSION_ID_ENV).unwrap_or_else(|_| "unnamed".to_string());
    info!(session = %session, pid = std::process::id(), "worker starting");

    let runtime = WorkerRuntime::new(CalcEngine::new(), StreamConfig::default());
    let reader = BufReader::new(std::io::stdin());
    runtime
        .run(reader, std::io::stdout())
        .context("worker runtime failed")?;

    info!(session = %session, "worker exiting");
    Ok(())
}
