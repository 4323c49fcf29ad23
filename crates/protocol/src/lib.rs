//! # Webterm Protocol Library
//!
//! This crate provides the wire protocol shared by the Webterm daemon and
//! its terminal clients.
//!
//! ## Overview
//!
//! The protocol crate is the foundation of Webterm's communication layer,
//! providing:
//!
//! - **Frame Definitions**: closed tagged-variant frames for each direction,
//!   client to daemon ([`ClientFrame`]: stdin, resize, disconnect) and daemon
//!   to client ([`ServerFrame`]: stdout, ended)
//! - **Frame Codec**: length-prefixed framing for raw byte transports
//! - **Encodings**: MessagePack for binary transports, JSON for text ones
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        ClientFrame / ServerFrame        │  MessagePack- or JSON-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Magic + length prefix
//! ├─────────────────────────────────────────┤
//! │       Transport (TCP/WebSocket)         │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientFrame, FrameCodec};
//!
//! // Encode a keystroke for the wire
//! let frame = ClientFrame::stdin(b"ls\n".to_vec());
//! let payload = frame.to_msgpack().unwrap();
//!
//! let codec = FrameCodec::new();
//! let bytes = codec.encode(&payload).unwrap();
//!
//! // ...and back
//! let (payload, _consumed) = codec.decode(&bytes).unwrap();
//! let decoded = ClientFrame::from_msgpack(&payload).unwrap();
//! assert_eq!(decoded, frame);
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: frame definitions and encodings
//! - [`framing`]: length-prefixed frame codec
//! - [`error`]: error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{FrameCodec, FRAME_HEADER_SIZE, FRAME_MAGIC, MAX_FRAME_SIZE};
pub use messages::{
    ClientFrame, ResizeRequest, ServerFrame, SessionEnded, StdinData, StdoutData,
    PROTOCOL_VERSION,
};
