//! Client connection bridge.
//!
//! One bridge runs per connected client. It pumps bytes in both directions
//! between the client's duplex stream and the attached [`Session`]:
//! inbound frames are decoded once at this boundary and dispatched to the
//! session (stdin, resize, disconnect); outbound session events are encoded
//! and written back (stdout, ended). Either side ending tears the bridge
//! down, and the bridge always detaches from its session on the way out.

use bytes::{Buf, BytesMut};
use protocol::{ClientFrame, FrameCodec, ProtocolError, ServerFrame};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::session::{BridgeId, Session, SessionError, SessionEvent, DEFAULT_BRIDGE_QUEUE};

/// Why a bridge stopped pumping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeExit {
    /// The client sent an orderly disconnect frame.
    ClientDisconnect,
    /// The client's stream closed or failed.
    StreamClosed,
    /// The session ended; the client was told so.
    SessionEnded,
    /// The client sent a malformed frame. Bridge-local: the session and
    /// every other bridge are unaffected.
    Protocol,
}

/// Reads length-prefixed frame payloads from a byte stream.
///
/// Accumulates transport bytes and yields one payload at a time; the
/// caller decodes the payload into whichever frame type it expects.
pub struct FrameReader<R> {
    inner: R,
    buf: BytesMut,
    codec: FrameCodec,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wraps a readable stream half.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(8 * 1024),
            codec: FrameCodec::new(),
        }
    }

    /// Returns the next frame payload, or `None` on clean end-of-stream.
    ///
    /// Cancel-safe: bytes read so far stay buffered across a cancelled
    /// call, so this can sit in a `select!` arm.
    pub async fn next_payload(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            if let Some((payload, consumed)) = self.codec.try_decode(&self.buf)? {
                self.buf.advance(consumed);
                return Ok(Some(payload));
            }

            let n = self.inner.read_buf(&mut self.buf).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProtocolError::ConnectionClosed(
                    "stream ended mid-frame".to_string(),
                ));
            }
        }
    }
}

/// Writes length-prefixed frame payloads to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
    codec: FrameCodec,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wraps a writable stream half.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            codec: FrameCodec::new(),
        }
    }

    /// Frames and writes one payload.
    pub async fn send_payload(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        let bytes = self.codec.encode(payload)?;
        self.inner.write_all(&bytes).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Encodes and writes one server frame.
    pub async fn send(&mut self, frame: &ServerFrame) -> Result<(), ProtocolError> {
        let payload = frame.to_msgpack()?;
        self.send_payload(&payload).await
    }
}

/// Pumps one client connection against one session.
pub struct Bridge {
    id: BridgeId,
    session: Arc<Session>,
}

impl Bridge {
    /// Creates a bridge for the given session.
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            session,
        }
    }

    /// Returns the bridge ID.
    pub fn id(&self) -> &BridgeId {
        &self.id
    }

    /// Attaches to the session and pumps until either side ends.
    ///
    /// The history snapshot goes out first so a late-joining client sees
    /// recent output. Fails only if the session cannot be attached to;
    /// everything after that resolves into a [`BridgeExit`].
    pub async fn run<S>(self, stream: S) -> Result<BridgeExit, SessionError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (history, mut events) = self
            .session
            .attach(self.id.clone(), DEFAULT_BRIDGE_QUEUE)
            .await?;

        let (read_half, write_half) = tokio::io::split(stream);
        let mut frames_in = FrameReader::new(read_half);
        let mut frames_out = FrameWriter::new(write_half);

        tracing::debug!(
            bridge_id = %self.id,
            session_id = %self.session.id(),
            "Bridge running"
        );

        let mut exit = BridgeExit::StreamClosed;

        if !history.is_empty()
            && frames_out
                .send(&ServerFrame::stdout(history))
                .await
                .is_err()
        {
            self.session.detach(&self.id).await;
            return Ok(exit);
        }

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Output(data)) => {
                        if frames_out.send(&ServerFrame::stdout(data)).await.is_err() {
                            exit = BridgeExit::StreamClosed;
                            break;
                        }
                    }
                    Some(SessionEvent::Ended { exit_code }) => {
                        let _ = frames_out.send(&ServerFrame::ended(exit_code)).await;
                        exit = BridgeExit::SessionEnded;
                        break;
                    }
                    None => {
                        // Sender dropped: the session finished without an
                        // Ended event reaching our queue.
                        let _ = frames_out
                            .send(&ServerFrame::ended(self.session.exit_code()))
                            .await;
                        exit = BridgeExit::SessionEnded;
                        break;
                    }
                },
                payload = frames_in.next_payload() => match payload {
                    Ok(Some(payload)) => match ClientFrame::from_msgpack(&payload) {
                        Ok(ClientFrame::Stdin(input)) => {
                            if let Err(e) = self.session.write(&input.data).await {
                                // Session-fatal errors surface as an Ended
                                // event on our queue; just note it here.
                                tracing::warn!(
                                    bridge_id = %self.id,
                                    error = %e,
                                    "Dropping input, session not writable"
                                );
                            }
                        }
                        Ok(ClientFrame::Resize(resize)) => {
                            if let Err(e) =
                                self.session.resize(resize.rows, resize.cols).await
                            {
                                tracing::warn!(
                                    bridge_id = %self.id,
                                    error = %e,
                                    "Resize failed"
                                );
                            }
                        }
                        Ok(ClientFrame::Disconnect) => {
                            exit = BridgeExit::ClientDisconnect;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(
                                bridge_id = %self.id,
                                error = %e,
                                "Malformed client frame, closing bridge"
                            );
                            exit = BridgeExit::Protocol;
                            break;
                        }
                    },
                    Ok(None) => {
                        exit = BridgeExit::StreamClosed;
                        break;
                    }
                    Err(ProtocolError::ConnectionClosed(_)) => {
                        exit = BridgeExit::StreamClosed;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            bridge_id = %self.id,
                            error = %e,
                            "Frame decode failed, closing bridge"
                        );
                        exit = BridgeExit::Protocol;
                        break;
                    }
                },
            }
        }

        self.session.detach(&self.id).await;

        tracing::debug!(
            bridge_id = %self.id,
            session_id = %self.session.id(),
            exit = ?exit,
            "Bridge stopped"
        );

        Ok(exit)
    }
}
