//! Session management module.
//!
//! This module provides PTY spawning, per-session output fan-out with
//! history replay, and session lifecycle management under a configurable
//! reuse policy.

pub mod history;
pub mod manager;
pub mod pty;
pub mod session;

pub use history::HistoryBuffer;
pub use manager::{ManagerEvent, ReusePolicy, SessionInfo, SessionManager};
pub use pty::{PtyProcess, SessionError, SessionId, SpawnSpec};
pub use session::{BridgeId, Session, SessionEvent, DEFAULT_BRIDGE_QUEUE};
