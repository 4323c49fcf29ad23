//! A live terminal session: one PTY process, its output history, and the
//! set of attached client bridges.
//!
//! Each session runs one output pump task that reads the PTY and fans
//! chunks out to every attached bridge over bounded per-bridge queues.
//! The pump is the only reader, so every bridge observes output in the
//! exact order the PTY produced it.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::history::HistoryBuffer;
use super::manager::ManagerEvent;
use super::pty::{PtyProcess, SessionError, SessionId, SpawnSpec};

/// Unique identifier for an attached bridge.
pub type BridgeId = String;

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Default outbound queue capacity per bridge.
pub const DEFAULT_BRIDGE_QUEUE: usize = 256;

/// Events pushed from a session to each attached bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of PTY output, in production order.
    Output(Vec<u8>),
    /// The session's process exited; no further output will follow.
    Ended {
        /// Exit code if the process was reaped with one.
        exit_code: Option<i32>,
    },
}

/// History plus the bridge sinks, guarded together so attach snapshots and
/// output fan-out are linearized: a joining bridge sees every byte exactly
/// once, either in the replay or in the stream.
struct SessionState {
    history: HistoryBuffer,
    bridges: HashMap<BridgeId, mpsc::Sender<SessionEvent>>,
}

/// One live terminal session.
pub struct Session {
    /// Unique session identifier.
    id: SessionId,

    /// The PTY and child process, exclusively owned.
    pty: PtyProcess,

    /// History and attached bridges. Never held across I/O.
    state: Mutex<SessionState>,

    /// Count of attached bridges, readable without the state lock.
    attached: AtomicUsize,

    /// Set once the process has exited or the session was closed.
    ended: AtomicBool,

    /// Whether an empty bridge set should trigger teardown.
    destroy_when_empty: bool,

    /// Notifications to the manager's event loop.
    manager_tx: mpsc::UnboundedSender<ManagerEvent>,

    /// Cancelled when the session ends.
    cancel: CancellationToken,
}

impl Session {
    /// Spawns the session's process and starts its output pump.
    pub fn spawn(
        id: SessionId,
        spec: &SpawnSpec,
        rows: u16,
        cols: u16,
        history_bytes: usize,
        destroy_when_empty: bool,
        manager_tx: mpsc::UnboundedSender<ManagerEvent>,
    ) -> Result<Arc<Self>, SessionError> {
        let (pty, reader) = PtyProcess::spawn(id.clone(), spec, rows, cols)?;

        let session = Arc::new(Session {
            id,
            pty,
            state: Mutex::new(SessionState {
                history: HistoryBuffer::new(history_bytes),
                bridges: HashMap::new(),
            }),
            attached: AtomicUsize::new(0),
            ended: AtomicBool::new(false),
            destroy_when_empty,
            manager_tx,
            cancel: CancellationToken::new(),
        });

        session.start_output_pump(reader);

        Ok(session)
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the process ID of the child, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    /// Returns the current terminal size as (rows, cols).
    pub fn size(&self) -> (u16, u16) {
        self.pty.size()
    }

    /// Returns whether the session has ended.
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Returns the recorded exit code, if the process has been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        self.pty.exit_code()
    }

    /// Returns the number of currently attached bridges.
    pub fn attached_count(&self) -> usize {
        self.attached.load(Ordering::SeqCst)
    }

    /// Token observers can use to notice session teardown.
    pub fn cancelled(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Registers a bridge as a viewer of this session.
    ///
    /// Returns the output history so far (for replay) and the receiver the
    /// session will push [`SessionEvent`]s into. Fails once the session has
    /// ended.
    pub async fn attach(
        &self,
        bridge_id: BridgeId,
        queue_capacity: usize,
    ) -> Result<(Vec<u8>, mpsc::Receiver<SessionEvent>), SessionError> {
        let mut state = self.state.lock().await;

        // Checked under the lock so we can't race the ended fan-out
        if self.is_ended() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }

        let (tx, rx) = mpsc::channel(queue_capacity);
        state.bridges.insert(bridge_id.clone(), tx);
        self.attached.store(state.bridges.len(), Ordering::SeqCst);
        let history = state.history.snapshot();

        tracing::debug!(
            session_id = %self.id,
            bridge_id = %bridge_id,
            attached = state.bridges.len(),
            replay_bytes = history.len(),
            "Bridge attached"
        );

        Ok((history, rx))
    }

    /// Removes a bridge from the viewer set.
    ///
    /// When the last bridge leaves a destroy-when-empty session, the
    /// manager is notified asynchronously to begin teardown.
    pub async fn detach(&self, bridge_id: &BridgeId) {
        let mut state = self.state.lock().await;
        if state.bridges.remove(bridge_id).is_none() {
            return;
        }
        self.attached.store(state.bridges.len(), Ordering::SeqCst);

        tracing::debug!(
            session_id = %self.id,
            bridge_id = %bridge_id,
            attached = state.bridges.len(),
            "Bridge detached"
        );

        if state.bridges.is_empty() && self.destroy_when_empty && !self.is_ended() {
            let _ = self
                .manager_tx
                .send(ManagerEvent::SessionIdle(self.id.clone()));
        }
    }

    /// Forwards client input to the PTY.
    ///
    /// Input from a single bridge arrives in order; interleaving across
    /// bridges of a shared session is arbitrary.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        self.pty.write(data).await
    }

    /// Forwards a client resize to the PTY.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.pty.resize(rows, cols).await
    }

    /// Terminates the session's process and notifies every attached bridge.
    /// Idempotent.
    pub async fn close(&self) {
        self.finish().await;
    }

    /// Appends a chunk to history and fans it out to every attached bridge.
    ///
    /// Delivery uses `try_send`: a bridge with a full queue loses this
    /// chunk (and is flagged), a bridge whose receiver is gone is pruned.
    /// Neither slows the others down.
    async fn broadcast_output(&self, data: Vec<u8>) {
        let mut state = self.state.lock().await;
        state.history.append(&data);

        let mut closed = Vec::new();
        for (bridge_id, tx) in state.bridges.iter() {
            match tx.try_send(SessionEvent::Output(data.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        session_id = %self.id,
                        bridge_id = %bridge_id,
                        "Bridge queue full, dropping output chunk"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    closed.push(bridge_id.clone());
                }
            }
        }

        for bridge_id in closed {
            state.bridges.remove(&bridge_id);
            tracing::debug!(
                session_id = %self.id,
                bridge_id = %bridge_id,
                "Pruned disconnected bridge"
            );
        }
        self.attached.store(state.bridges.len(), Ordering::SeqCst);

        if state.bridges.is_empty() && self.destroy_when_empty && !self.is_ended() {
            let _ = self
                .manager_tx
                .send(ManagerEvent::SessionIdle(self.id.clone()));
        }
    }

    /// Ends the session: reaps the process, tells every bridge, tells the
    /// manager. Safe to call from the pump and from close() concurrently.
    async fn finish(&self) {
        if self.ended.swap(true, Ordering::SeqCst) {
            return;
        }

        // Reap (terminate is a no-op past the first call and cheap on an
        // already-exited child), then collect the code for the bridges.
        let _ = self.pty.terminate().await;
        let exit_code = self.pty.exit_code();

        let mut state = self.state.lock().await;
        for (bridge_id, tx) in state.bridges.drain() {
            if tx.try_send(SessionEvent::Ended { exit_code }).is_err() {
                // Queue full or receiver gone: dropping the senders below
                // closes the channel, which bridges treat as ended too.
                tracing::trace!(
                    session_id = %self.id,
                    bridge_id = %bridge_id,
                    "Ended event not enqueued; bridge will observe closed channel"
                );
            }
        }
        self.attached.store(0, Ordering::SeqCst);
        drop(state);

        self.cancel.cancel();
        let _ = self
            .manager_tx
            .send(ManagerEvent::SessionExited(self.id.clone()));

        tracing::info!(
            session_id = %self.id,
            exit_code = ?exit_code,
            "Session ended"
        );
    }

    /// Starts the output pump: blocking PTY reads on a worker thread,
    /// fan-out on the runtime. EOF or a read error ends the session.
    fn start_output_pump(self: &Arc<Self>, reader: Box<dyn Read + Send>) {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            let reader = Arc::new(std::sync::Mutex::new(reader));

            loop {
                if session.cancel.is_cancelled() {
                    break;
                }

                let reader_clone = Arc::clone(&reader);
                let result = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                    let mut reader = reader_clone.lock().unwrap();
                    match reader.read(&mut buffer) {
                        Ok(0) => Ok(None), // EOF
                        Ok(n) => {
                            buffer.truncate(n);
                            Ok(Some(buffer))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await;

                match result {
                    Ok(Ok(Some(data))) => {
                        session.broadcast_output(data).await;
                    }
                    Ok(Ok(None)) => {
                        tracing::info!(session_id = %session.id, "PTY EOF, process exited");
                        session.finish().await;
                        break;
                    }
                    Ok(Err(e)) => {
                        if !session.is_ended() {
                            tracing::error!(
                                session_id = %session.id,
                                error = %e,
                                "PTY read failed, ending session"
                            );
                        }
                        session.finish().await;
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            session_id = %session.id,
                            error = %e,
                            "PTY read task panicked"
                        );
                        session.finish().await;
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh_spec() -> SpawnSpec {
        SpawnSpec {
            command: "/bin/sh".to_string(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    fn spawn_session(
        destroy_when_empty: bool,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<ManagerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::spawn(
            "test-session".to_string(),
            &sh_spec(),
            24,
            80,
            64 * 1024,
            destroy_when_empty,
            tx,
        )
        .unwrap();
        (session, rx)
    }

    /// Drains events until a predicate matches or the timeout hits.
    async fn wait_for_output(
        rx: &mut mpsc::Receiver<SessionEvent>,
        needle: &str,
    ) -> bool {
        let mut collected = Vec::new();
        for _ in 0..100 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(SessionEvent::Output(data))) => {
                    collected.extend_from_slice(&data);
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        return true;
                    }
                }
                Ok(Some(SessionEvent::Ended { .. })) | Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[tokio::test]
    async fn test_attach_write_receive() {
        let (session, _mgr_rx) = spawn_session(false);

        let (history, mut rx) = session
            .attach("bridge-1".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();
        assert!(history.is_empty());
        assert_eq!(session.attached_count(), 1);

        session.write(b"echo session_marker\n").await.unwrap();
        assert!(wait_for_output(&mut rx, "session_marker").await);

        session.close().await;
    }

    #[tokio::test]
    async fn test_history_replay_for_late_joiner() {
        let (session, _mgr_rx) = spawn_session(false);

        // First viewer drives some output
        let (_, mut rx1) = session
            .attach("bridge-1".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();
        session.write(b"echo replay_marker\n").await.unwrap();
        assert!(wait_for_output(&mut rx1, "replay_marker").await);

        // Late joiner gets the same bytes via history replay
        let (history, _rx2) = session
            .attach("bridge-2".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();
        assert!(
            String::from_utf8_lossy(&history).contains("replay_marker"),
            "history replay missing earlier output"
        );

        session.close().await;
    }

    #[tokio::test]
    async fn test_output_ordering_preserved_per_bridge() {
        let (session, _mgr_rx) = spawn_session(false);

        let (_, mut rx) = session
            .attach("bridge-1".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();

        // Emit several ordered markers in one shell command
        session
            .write(b"for i in 1 2 3 4 5; do echo ord_$i; done\n")
            .await
            .unwrap();

        let mut collected = Vec::new();
        for _ in 0..100 {
            match timeout(Duration::from_millis(100), rx.recv()).await {
                Ok(Some(SessionEvent::Output(data))) => {
                    collected.extend_from_slice(&data);
                    let text = String::from_utf8_lossy(&collected).to_string();
                    if text.contains("ord_5") {
                        let positions: Vec<_> = (1..=5)
                            .map(|i| text.find(&format!("ord_{}", i)).unwrap())
                            .collect();
                        // Positions of the echoed lines must be increasing.
                        // (The command echo itself contains "ord_$i" only.)
                        assert!(
                            positions.windows(2).all(|w| w[0] < w[1]),
                            "output observed out of order: {:?}",
                            positions
                        );
                        session.close().await;
                        return;
                    }
                }
                Ok(_) => break,
                Err(_) => {}
            }
        }
        panic!("did not observe all ordered markers");
    }

    #[tokio::test]
    async fn test_bridge_isolation_dropped_receiver() {
        let (session, _mgr_rx) = spawn_session(false);

        let (_, rx_dead) = session
            .attach("dead".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();
        let (_, mut rx_live) = session
            .attach("live".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();

        // One viewer goes away without detaching
        drop(rx_dead);

        session.write(b"echo isolation_marker\n").await.unwrap();
        assert!(
            wait_for_output(&mut rx_live, "isolation_marker").await,
            "surviving bridge stopped receiving output"
        );

        // The dead bridge gets pruned during fan-out
        assert_eq!(session.attached_count(), 1);

        session.close().await;
    }

    #[tokio::test]
    async fn test_bridge_isolation_full_queue() {
        let (session, _mgr_rx) = spawn_session(false);

        // Tiny queue that will overflow immediately
        let (_, _rx_slow) = session.attach("slow".to_string(), 1).await.unwrap();
        let (_, mut rx_fast) = session
            .attach("fast".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();

        session
            .write(b"for i in 1 2 3 4 5 6 7 8; do echo full_$i; done\n")
            .await
            .unwrap();

        assert!(
            wait_for_output(&mut rx_fast, "full_8").await,
            "fast bridge blocked behind slow bridge"
        );

        session.close().await;
    }

    #[tokio::test]
    async fn test_process_exit_notifies_all_bridges() {
        let (session, _mgr_rx) = spawn_session(false);

        let (_, mut rx1) = session
            .attach("bridge-1".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();
        let (_, mut rx2) = session
            .attach("bridge-2".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();

        session.write(b"exit 3\n").await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            let mut ended = false;
            for _ in 0..100 {
                match timeout(Duration::from_millis(100), rx.recv()).await {
                    Ok(Some(SessionEvent::Ended { exit_code })) => {
                        assert_eq!(exit_code, Some(3));
                        ended = true;
                        break;
                    }
                    Ok(Some(SessionEvent::Output(_))) => {}
                    Ok(None) => {
                        // Channel closed also signals the end
                        ended = true;
                        break;
                    }
                    Err(_) => {}
                }
            }
            assert!(ended, "bridge did not observe session end");
        }

        assert!(session.is_ended());
    }

    #[tokio::test]
    async fn test_attach_after_end_fails() {
        let (session, _mgr_rx) = spawn_session(false);

        session.close().await;

        let result = session
            .attach("late".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await;
        assert!(matches!(result, Err(SessionError::AlreadyTerminated(_))));
    }

    #[tokio::test]
    async fn test_last_detach_notifies_manager_when_destroy_when_empty() {
        let (session, mut mgr_rx) = spawn_session(true);

        let (_, _rx) = session
            .attach("bridge-1".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();
        session.detach(&"bridge-1".to_string()).await;

        let event = timeout(Duration::from_millis(500), mgr_rx.recv())
            .await
            .expect("no manager event")
            .expect("manager channel closed");
        assert!(matches!(event, ManagerEvent::SessionIdle(ref id) if id == session.id()));

        session.close().await;
    }

    #[tokio::test]
    async fn test_detach_does_not_notify_in_shared_mode() {
        let (session, mut mgr_rx) = spawn_session(false);

        let (_, _rx) = session
            .attach("bridge-1".to_string(), DEFAULT_BRIDGE_QUEUE)
            .await
            .unwrap();
        session.detach(&"bridge-1".to_string()).await;

        let result = timeout(Duration::from_millis(200), mgr_rx.recv()).await;
        assert!(result.is_err(), "shared session notified idle unexpectedly");

        session.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (session, _mgr_rx) = spawn_session(false);

        session.close().await;
        session.close().await;
        assert!(session.is_ended());
    }
}
