//! # Webterm Daemon Library
//!
//! This crate provides the daemon (server) side of Webterm: PTY-backed
//! shell sessions exposed to remote terminal clients over persistent
//! duplex connections.
//!
//! ## Overview
//!
//! - **PTY Session Management**: spawn shells on pseudo-terminals, resize
//!   them, and tear them down cleanly
//! - **Output Fan-out**: one session can have many concurrent viewers, each
//!   receiving output in production order plus a history replay on join
//! - **Reuse Policy**: one shared session for all clients, or one session
//!   per client
//! - **Connection Bridging**: per-client frame pumps between the network
//!   stream and the session
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Session Manager                      │
//! │                                                          │
//! │   ┌───────────┐    ┌───────────┐    ┌───────────┐       │
//! │   │  Session  │    │  Session  │    │  Session  │  ...  │
//! │   │ PTY+shell │    │ PTY+shell │    │ PTY+shell │       │
//! │   └─────┬─────┘    └─────┬─────┘    └───────────┘       │
//! └─────────┼────────────────┼───────────────────────────────┘
//!           │ fan-out        │
//!     ┌─────┴─────┐    ┌─────┴─────┐
//!     │  Bridge   │    │  Bridge   │   one per client
//!     └─────┬─────┘    └─────┬─────┘
//!           │ frames         │
//!        client           client
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::bridge::Bridge;
//! use daemon::config::Config;
//! use daemon::session::SessionManager;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     config.validate()?;
//!
//!     let manager = SessionManager::new(&config);
//!
//!     let listener = tokio::net::TcpListener::bind(&config.network.listen_addr).await?;
//!     loop {
//!         let (stream, _addr) = listener.accept().await?;
//!         let session = manager.get_or_create(None).await?;
//!         tokio::spawn(async move {
//!             let _ = Bridge::new(session).run(stream).await;
//!         });
//!     }
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: configuration loading, validation, and defaults
//! - [`session`]: PTY processes, sessions, history, and the manager
//! - [`bridge`]: per-client connection bridging and frame transport

pub mod bridge;
pub mod config;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    BridgeId, HistoryBuffer, ManagerEvent, PtyProcess, ReusePolicy, Session, SessionError,
    SessionEvent, SessionId, SessionInfo, SessionManager, SpawnSpec,
};

// Re-export bridge types for convenience
pub use bridge::{Bridge, BridgeExit, FrameReader, FrameWriter};
