//! Protocol frame definitions for Webterm.
//!
//! This module defines the closed sets of frames exchanged between a
//! terminal client and the daemon. Client-originated and server-originated
//! frames are separate enums so each side decodes exactly once, at the
//! protocol boundary, into a type that cannot express unknown shapes.
//!
//! Frames are serialized as MessagePack on binary transports and as JSON on
//! text transports; both use the same tagged representation.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Frames sent from a client to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ClientFrame {
    /// Keyboard input destined for the terminal's stdin.
    Stdin(StdinData),
    /// Terminal dimension change.
    Resize(ResizeRequest),
    /// Orderly disconnect; the client will send nothing further.
    Disconnect,
}

/// Frames sent from the daemon to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ServerFrame {
    /// Terminal output bytes.
    Stdout(StdoutData),
    /// The session's process has exited; no further output will follow.
    Ended(SessionEnded),
}

/// Raw input bytes for the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdinData {
    /// The input bytes, passed through to the PTY unmodified.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Terminal resize notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizeRequest {
    /// New terminal rows.
    pub rows: u16,
    /// New terminal columns.
    pub cols: u16,
}

/// Raw output bytes from the terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdoutData {
    /// The output bytes, exactly as produced by the PTY.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

/// Notification that the session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionEnded {
    /// Exit code if the process exited normally.
    pub exit_code: Option<i32>,
}

impl ClientFrame {
    /// Shorthand for a stdin frame.
    pub fn stdin(data: impl Into<Vec<u8>>) -> Self {
        ClientFrame::Stdin(StdinData { data: data.into() })
    }

    /// Shorthand for a resize frame.
    pub fn resize(rows: u16, cols: u16) -> Self {
        ClientFrame::Resize(ResizeRequest { rows, cols })
    }

    /// Serialize to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

impl ServerFrame {
    /// Shorthand for a stdout frame.
    pub fn stdout(data: impl Into<Vec<u8>>) -> Self {
        ServerFrame::Stdout(StdoutData { data: data.into() })
    }

    /// Shorthand for an ended frame.
    pub fn ended(exit_code: Option<i32>) -> Self {
        ServerFrame::Ended(SessionEnded { exit_code })
    }

    /// Serialize to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        Ok(rmp_serde::from_slice(bytes)?)
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Deserialize from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
