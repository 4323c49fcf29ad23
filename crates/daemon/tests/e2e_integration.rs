//! End-to-end integration tests for Webterm.
//!
//! These tests verify complete flows work correctly:
//! - Echo roundtrip through a real PTY, session, and bridge
//! - Reuse policy behavior (shared vs. per-client)
//! - History replay to late-joining clients
//! - Manager shutdown with live sessions

use std::sync::Arc;
use std::time::Duration;

use daemon::bridge::{Bridge, BridgeExit, FrameReader, FrameWriter};
use daemon::config::Config;
use daemon::session::{ReusePolicy, SessionManager, DEFAULT_BRIDGE_QUEUE};
use protocol::{ClientFrame, ServerFrame};
use tokio::io::{ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Create a test configuration running /bin/sh in the given mode.
fn test_config(mode: ReusePolicy) -> Config {
    let mut config = Config::default();
    config.session.shell = "/bin/sh".to_string();
    config.session.args = Vec::new();
    config.session.mode = mode;
    config
}

/// A connected test client: the far end of one bridge.
struct TestClient {
    frames_in: FrameReader<ReadHalf<tokio::io::DuplexStream>>,
    frames_out: FrameWriter<WriteHalf<tokio::io::DuplexStream>>,
    bridge: JoinHandle<Result<BridgeExit, daemon::SessionError>>,
}

impl TestClient {
    /// Connects a new client to the manager's session, running a bridge
    /// over an in-memory duplex stream.
    async fn connect(manager: &Arc<SessionManager>) -> Self {
        let session = manager.get_or_create(None).await.unwrap();
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let bridge = tokio::spawn(async move { Bridge::new(session).run(server_io).await });

        let (read_half, write_half) = tokio::io::split(client_io);
        Self {
            frames_in: FrameReader::new(read_half),
            frames_out: FrameWriter::new(write_half),
            bridge,
        }
    }

    async fn send(&mut self, frame: ClientFrame) {
        self.frames_out
            .send_payload(&frame.to_msgpack().unwrap())
            .await
            .unwrap();
    }

    /// Reads frames until stdout contains `needle`, failing on Ended or
    /// stream close. Returns everything received so far.
    async fn expect_stdout(&mut self, needle: &str) -> Vec<u8> {
        let mut collected = Vec::new();
        for _ in 0..200 {
            let payload =
                match timeout(Duration::from_millis(200), self.frames_in.next_payload()).await {
                    Ok(Ok(Some(p))) => p,
                    Ok(_) => panic!("stream closed while waiting for {:?}", needle),
                    Err(_) => continue,
                };
            match ServerFrame::from_msgpack(&payload).unwrap() {
                ServerFrame::Stdout(d) => {
                    collected.extend_from_slice(&d.data);
                    if String::from_utf8_lossy(&collected).contains(needle) {
                        return collected;
                    }
                }
                ServerFrame::Ended(e) => {
                    panic!("session ended ({:?}) while waiting for {:?}", e, needle)
                }
            }
        }
        panic!("never observed {:?} in output", needle);
    }

    /// Reads frames until an Ended frame arrives.
    async fn expect_ended(&mut self) -> Option<i32> {
        for _ in 0..200 {
            let payload =
                match timeout(Duration::from_millis(200), self.frames_in.next_payload()).await {
                    Ok(Ok(Some(p))) => p,
                    Ok(_) => panic!("stream closed before Ended frame"),
                    Err(_) => continue,
                };
            if let ServerFrame::Ended(e) = ServerFrame::from_msgpack(&payload).unwrap() {
                return e.exit_code;
            }
        }
        panic!("never observed Ended frame");
    }

    async fn disconnect(mut self) -> BridgeExit {
        self.send(ClientFrame::Disconnect).await;
        self.bridge.await.unwrap().unwrap()
    }
}

// =============================================================================
// Echo Roundtrip
// =============================================================================

#[tokio::test]
async fn test_echo_roundtrip_through_bridge() {
    let manager = SessionManager::new(&test_config(ReusePolicy::Shared));

    let mut client = TestClient::connect(&manager).await;
    client.send(ClientFrame::stdin(b"echo hi\n".to_vec())).await;

    // The shell's own echo plus the command output both contain "hi"
    client.expect_stdout("hi").await;

    let exit = client.disconnect().await;
    assert_eq!(exit, BridgeExit::ClientDisconnect);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_process_exit_ends_every_client() {
    let manager = SessionManager::new(&test_config(ReusePolicy::Shared));

    let mut a = TestClient::connect(&manager).await;
    let mut b = TestClient::connect(&manager).await;

    a.send(ClientFrame::stdin(b"exit 5\n".to_vec())).await;

    // Both viewers see the session end; nobody hangs
    assert_eq!(a.expect_ended().await, Some(5));
    assert_eq!(b.expect_ended().await, Some(5));

    manager.shutdown().await;
}

// =============================================================================
// Reuse Policy
// =============================================================================

#[tokio::test]
async fn test_shared_mode_one_process_for_all_clients() {
    let manager = SessionManager::new(&test_config(ReusePolicy::Shared));

    let s1 = manager.get_or_create(None).await.unwrap();
    let pid = s1.pid();

    // Attach/detach churn must not respawn or kill the shared process
    for i in 0..5 {
        let bridge_id = format!("churn-{}", i);
        let (_, _rx) = s1.attach(bridge_id.clone(), DEFAULT_BRIDGE_QUEUE).await.unwrap();
        s1.detach(&bridge_id).await;
    }

    let s2 = manager.get_or_create(None).await.unwrap();
    assert_eq!(s1.id(), s2.id());
    assert_eq!(s2.pid(), pid);
    assert_eq!(manager.count(), 1);
    assert!(!s2.is_ended());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_per_client_mode_distinct_sessions_and_processes() {
    let manager = SessionManager::new(&test_config(ReusePolicy::PerClient));

    let s1 = manager.get_or_create(None).await.unwrap();
    let s2 = manager.get_or_create(None).await.unwrap();

    assert_ne!(s1.id(), s2.id());
    assert_ne!(s1.pid(), s2.pid());
    assert_eq!(manager.count(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_shared_fanout_delivers_to_all_viewers() {
    let manager = SessionManager::new(&test_config(ReusePolicy::Shared));

    let mut a = TestClient::connect(&manager).await;
    let mut b = TestClient::connect(&manager).await;

    // Let both bridges attach before producing output
    tokio::time::sleep(Duration::from_millis(200)).await;

    a.send(ClientFrame::stdin(b"echo fanout_marker\n".to_vec()))
        .await;

    a.expect_stdout("fanout_marker").await;
    b.expect_stdout("fanout_marker").await;

    a.disconnect().await;
    b.disconnect().await;

    manager.shutdown().await;
}

// =============================================================================
// History Replay
// =============================================================================

#[tokio::test]
async fn test_late_joiner_receives_history() {
    let manager = SessionManager::new(&test_config(ReusePolicy::Shared));

    let mut early = TestClient::connect(&manager).await;
    early
        .send(ClientFrame::stdin(b"echo history_marker\n".to_vec()))
        .await;
    early.expect_stdout("history_marker").await;

    // A client connecting after the fact replays the same bytes
    let mut late = TestClient::connect(&manager).await;
    late.expect_stdout("history_marker").await;

    early.disconnect().await;
    late.disconnect().await;

    manager.shutdown().await;
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test]
async fn test_shutdown_with_three_live_sessions() {
    let manager = SessionManager::new(&test_config(ReusePolicy::PerClient));

    let mut clients = Vec::new();
    for _ in 0..3 {
        clients.push(TestClient::connect(&manager).await);
    }

    // Bridges attach asynchronously; wait until all three are up
    let mut attached = 0;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        attached = manager.list().iter().map(|s| s.attached).sum();
        if attached == 3 {
            break;
        }
    }
    assert_eq!(attached, 3, "bridges did not all attach");
    assert_eq!(manager.count(), 3);

    let sessions: Vec<_> = manager
        .list()
        .iter()
        .map(|info| manager.get(&info.id).unwrap())
        .collect();

    manager.shutdown().await;

    // Exactly three terminations, zero remaining entries
    assert_eq!(manager.count(), 0);
    for session in &sessions {
        assert!(session.is_ended());
    }

    // Every client is told the session ended rather than left hanging
    for mut client in clients {
        client.expect_ended().await;
    }
}

#[tokio::test]
async fn test_connect_after_shutdown_fails_fast() {
    let manager = SessionManager::new(&test_config(ReusePolicy::Shared));
    manager.shutdown().await;

    let result = manager.get_or_create(None).await;
    assert!(matches!(
        result,
        Err(daemon::SessionError::ShutdownInProgress)
    ));
}
