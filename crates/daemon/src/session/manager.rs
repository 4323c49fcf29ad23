//! Session manager: creation, lookup, reuse policy, and teardown.
//!
//! The manager owns every live [`Session`], keyed by id. Construction is
//! driven by [`SessionManager::get_or_create`], whose behavior depends on
//! the configured [`ReusePolicy`]; destruction happens through the manager
//! event loop (sessions report themselves idle or exited) and through
//! [`SessionManager::shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;

use super::pty::{SessionError, SessionId, SpawnSpec};
use super::session::Session;

/// Session reuse policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReusePolicy {
    /// One session shared by every client. Created lazily on first request,
    /// torn down only at shutdown; if its process exits, the next request
    /// respawns it.
    #[default]
    Shared,
    /// A fresh session per client, torn down when its last bridge detaches.
    /// A request hinting at a live session joins it instead (reconnect
    /// routing while it still has viewers).
    PerClient,
}

/// Notifications from sessions to the manager's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagerEvent {
    /// The session's last bridge detached (destroy-when-empty sessions only).
    SessionIdle(SessionId),
    /// The session's process exited or it was closed.
    SessionExited(SessionId),
}

/// Metadata snapshot of a live session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Process ID of the child.
    pub pid: Option<u32>,
    /// Current terminal rows.
    pub rows: u16,
    /// Current terminal columns.
    pub cols: u16,
    /// Number of attached bridges.
    pub attached: usize,
}

/// Creates, looks up, and destroys sessions.
pub struct SessionManager {
    /// Map of session id to session. Exclusive owner of all sessions.
    sessions: DashMap<SessionId, Arc<Session>>,

    /// Command line and environment for new sessions.
    spec: SpawnSpec,

    /// Configured reuse policy.
    policy: ReusePolicy,

    /// Initial terminal size for new sessions.
    initial_rows: u16,
    initial_cols: u16,

    /// History retained per session, in bytes.
    history_bytes: usize,

    /// Cap on concurrent sessions.
    max_sessions: usize,

    /// Shared-mode slot. Also serializes creation so the shared session is
    /// spawned at most once per generation.
    shared_slot: Mutex<Option<SessionId>>,

    /// Set once shutdown begins; get_or_create fails fast afterwards.
    shutting_down: AtomicBool,

    /// Sender handed to every session for idle/exited notifications.
    events_tx: mpsc::UnboundedSender<ManagerEvent>,

    /// Receiver side, taken by the event loop on start.
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ManagerEvent>>>,

    /// Cancelled at shutdown; stops the event loop.
    cancel: CancellationToken,
}

impl SessionManager {
    /// Creates a manager from the daemon configuration and starts its
    /// event loop.
    pub fn new(config: &Config) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = Arc::new(Self {
            sessions: DashMap::new(),
            spec: SpawnSpec::from(&config.session),
            policy: config.session.mode,
            initial_rows: config.session.rows,
            initial_cols: config.session.cols,
            history_bytes: config.session.history_bytes,
            max_sessions: config.session.max_sessions,
            shared_slot: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
            events_tx,
            events_rx: std::sync::Mutex::new(Some(events_rx)),
            cancel: CancellationToken::new(),
        });

        manager.start_event_loop();
        manager
    }

    /// Returns the configured reuse policy.
    pub fn policy(&self) -> ReusePolicy {
        self.policy
    }

    /// Returns whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Token observers can use to notice manager shutdown.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Resolves or creates the session for a new client connection.
    ///
    /// Policy behavior:
    /// - [`ReusePolicy::Shared`]: the hint is ignored; the single shared
    ///   session is created on first call and returned thereafter. A dead
    ///   shared session is replaced.
    /// - [`ReusePolicy::PerClient`]: a hint naming a live session returns
    ///   it; otherwise a new session with a fresh id is spawned.
    pub async fn get_or_create(
        &self,
        hint: Option<&SessionId>,
    ) -> Result<Arc<Session>, SessionError> {
        if self.is_shutting_down() {
            return Err(SessionError::ShutdownInProgress);
        }

        match self.policy {
            ReusePolicy::Shared => {
                let mut slot = self.shared_slot.lock().await;

                if let Some(id) = slot.as_ref() {
                    if let Some(entry) = self.sessions.get(id) {
                        if !entry.value().is_ended() {
                            return Ok(Arc::clone(entry.value()));
                        }
                    }
                    // Previous shared session died; drop the stale entry
                    // and fall through to respawn.
                    let stale = id.clone();
                    self.sessions.remove(&stale);
                    tracing::info!(session_id = %stale, "Respawning shared session");
                }

                let session = self.spawn_session(false)?;
                *slot = Some(session.id().clone());
                Ok(session)
            }
            ReusePolicy::PerClient => {
                if let Some(hint) = hint {
                    if let Some(entry) = self.sessions.get(hint) {
                        if !entry.value().is_ended() {
                            return Ok(Arc::clone(entry.value()));
                        }
                    }
                }
                self.spawn_session(true)
            }
        }
    }

    /// Looks up a live session by id.
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Returns metadata for every live session.
    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                let (rows, cols) = session.size();
                SessionInfo {
                    id: entry.key().clone(),
                    pid: session.pid(),
                    rows,
                    cols,
                    attached: session.attached_count(),
                }
            })
            .collect()
    }

    /// Returns the number of live sessions.
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Terminates every live session and clears the map.
    ///
    /// Safe to call any number of times and with any number of live
    /// sessions; each spawned process is terminated exactly once (session
    /// close is idempotent).
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(sessions = self.sessions.len(), "Session manager shutting down");

        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.close().await;
            }
        }

        self.shared_slot.lock().await.take();
        self.cancel.cancel();

        tracing::info!("Session manager shut down");
    }

    fn spawn_session(&self, destroy_when_empty: bool) -> Result<Arc<Session>, SessionError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let id = Uuid::new_v4().to_string();
        let session = Session::spawn(
            id.clone(),
            &self.spec,
            self.initial_rows,
            self.initial_cols,
            self.history_bytes,
            destroy_when_empty,
            self.events_tx.clone(),
        )?;

        self.sessions.insert(id.clone(), Arc::clone(&session));

        tracing::info!(
            session_id = %id,
            pid = ?session.pid(),
            policy = ?self.policy,
            "Created session"
        );

        Ok(session)
    }

    /// Consumes idle/exited notifications from sessions.
    fn start_event_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut events_rx = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("event loop started twice");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = manager.cancel.cancelled() => break,
                    event = events_rx.recv() => {
                        let Some(event) = event else { break };
                        manager.handle_event(event).await;
                    }
                }
            }
        });
    }

    async fn handle_event(&self, event: ManagerEvent) {
        match event {
            ManagerEvent::SessionIdle(id) => {
                if self.is_shutting_down() {
                    return;
                }
                if let Some((_, session)) = self.sessions.remove(&id) {
                    // A bridge may have joined between the notification and
                    // now; if so the session is not idle after all.
                    if session.attached_count() > 0 {
                        self.sessions.insert(id, session);
                        return;
                    }
                    tracing::info!(session_id = %session.id(), "Tearing down idle session");
                    session.close().await;
                }
            }
            ManagerEvent::SessionExited(id) => {
                if self.sessions.remove(&id).is_some() {
                    tracing::debug!(session_id = %id, "Reaped exited session");
                }
            }
        }
    }
}
