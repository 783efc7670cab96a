use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;

use futures::future::join_all;
use tracing::info;
use tracing::warn;

use super::Session;
use super::SessionInfo;
use crate::config::ManagerConfig;
use crate::error::SessionError;

/// Session created by [`SessionManager::start`].
pub const DEFAULT_SESSION_ID: &str = "default";

/// Registry of live sessions; the single source of truth for which sessions
/// exist. The registry lock is held only around insert/remove/lookup, never
/// across in-flight call execution.
pub struct SessionManager {
    config: ManagerConfig,
    sessions: StdMutex<HashMap<String, Arc<Session>>>,
}

impl SessionManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self {
            config,
            sessions: StdMutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    fn sessions_lock(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ensure the default session exists and is running.
    pub async fn start(&self) -> Result<Arc<Session>, SessionError> {
        self.get_or_create(DEFAULT_SESSION_ID).await
    }

    /// Idempotent create-or-lookup. A fresh session is spawned on miss and
    /// awaited up to the configured readiness timeout; on readiness failure
    /// the session is retired and the error surfaced, so a later retry can
    /// start clean.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(existing) = self.sessions_lock().get(id).cloned() {
            return Ok(existing);
        }

        info!(session = id, "creating session");
        let session = Arc::new(Session::spawn(id.to_string(), self.config.clone())?);
        let session = {
            let mut sessions = self.sessions_lock();
            match sessions.get(id) {
                // Lost a race with a concurrent create: keep the winner and
                // retire the duplicate worker.
                Some(existing) => {
                    let existing = Arc::clone(existing);
                    let duplicate = session;
                    let stop_timeout = self.config.stop_timeout;
                    tokio::spawn(async move {
                        let _ = duplicate.stop(stop_timeout).await;
                    });
                    existing
                }
                None => {
                    sessions.insert(id.to_string(), Arc::clone(&session));
                    session
                }
            }
        };

        if let Err(err) = session.wait_ready(self.config.ready_timeout).await {
            warn!(session = id, "session failed to become ready: {err}");
            self.sessions_lock().remove(id);
            let stop_timeout = self.config.stop_timeout;
            let failed = Arc::clone(&session);
            tokio::spawn(async move {
                let _ = failed.stop(stop_timeout).await;
            });
            return Err(err);
        }
        Ok(session)
    }

    /// Strict lookup; callers that want auto-create use
    /// [`SessionManager::get_or_create`].
    pub fn get(&self, id: &str) -> Result<Arc<Session>, SessionError> {
        self.sessions_lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound { id: id.to_string() })
    }

    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<SessionInfo> = self
            .sessions_lock()
            .values()
            .map(|session| session.info())
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub async fn stop_session(&self, id: &str) -> Result<(), SessionError> {
        let session = self.get(id)?;
        let result = session.stop(self.config.stop_timeout).await;
        self.sessions_lock().remove(id);
        result
    }

    /// Stop every session concurrently. Individual failures are logged,
    /// never raised.
    pub async fn stop_all(&self) {
        let sessions: Vec<(String, Arc<Session>)> = self.sessions_lock().drain().collect();
        let stop_timeout = self.config.stop_timeout;
        let stops = sessions.iter().map(|(id, session)| {
            let session = Arc::clone(session);
            let id = id.clone();
            async move { (id, session.stop(stop_timeout).await) }
        });
        for (id, result) in join_all(stops).await {
            if let Err(err) = result {
                warn!(session = %id, "failed to stop session: {err}");
            }
        }
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}
