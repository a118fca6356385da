//! Frame transport over an upgraded socket.
//!
//! A session socket either carries WebSocket binary messages (one CBOR frame
//! each) or, when the client asked to skip WebSocket framing, raw
//! length-prefixed CBOR frames.

use crate::codec::{cbor_decode, cbor_encode, frame_encode, FrameDecoder};
use crate::error::{FxError, FxResult};
use crate::messages::Frame;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

/// Anything that can stand in for a TCP stream.
pub trait Socket: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Socket for T {}

pub type BoxedSocket = Box<dyn Socket>;

const READ_CHUNK: usize = 64 * 1024;

/// A framed, bidirectional session socket.
pub enum Transport {
    WebSocket(Box<WebSocketStream<BoxedSocket>>),
    Raw {
        socket: BoxedSocket,
        decoder: FrameDecoder,
    },
}

impl Transport {
    /// Wrap a socket whose HTTP upgrade has already been answered.
    pub async fn websocket(socket: BoxedSocket, role: Role) -> Self {
        let ws = WebSocketStream::from_raw_socket(socket, role, None).await;
        Transport::WebSocket(Box::new(ws))
    }

    /// Wrap a socket that carries length-prefixed frames directly.
    pub fn raw(socket: BoxedSocket) -> Self {
        Transport::Raw {
            socket,
            decoder: FrameDecoder::new(),
        }
    }

    /// Send one frame.
    pub async fn send(&mut self, frame: &Frame) -> FxResult<()> {
        match self {
            Transport::WebSocket(ws) => {
                let payload = cbor_encode(frame)?;
                ws.send(Message::Binary(payload.into()))
                    .await
                    .map_err(|e| FxError::Transport(format!("WS send failed: {e}")))
            }
            Transport::Raw { socket, .. } => {
                let bytes = frame_encode(frame)?;
                socket
                    .write_all(&bytes)
                    .await
                    .map_err(|e| FxError::Transport(format!("socket write failed: {e}")))?;
                socket
                    .flush()
                    .await
                    .map_err(|e| FxError::Transport(format!("socket flush failed: {e}")))
            }
        }
    }

    /// Receive the next frame. Returns `None` once the peer has closed.
    ///
    /// Cancel-safe: partially read raw frames stay in the decoder.
    pub async fn recv(&mut self) -> FxResult<Option<Frame>> {
        match self {
            Transport::WebSocket(ws) => loop {
                match ws.next().await {
                    Some(Ok(Message::Binary(data))) => return cbor_decode(&data).map(Some),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        return Err(FxError::Transport(format!("WS recv failed: {e}")));
                    }
                    None => return Ok(None),
                }
            },
            Transport::Raw { socket, decoder } => {
                let mut chunk = vec![0u8; READ_CHUNK];
                loop {
                    if let Some(payload) = decoder.next_frame()? {
                        return cbor_decode(&payload).map(Some);
                    }
                    let n = socket
                        .read(&mut chunk)
                        .await
                        .map_err(|e| FxError::Transport(format!("socket read failed: {e}")))?;
                    if n == 0 {
                        if decoder.pending() > 0 {
                            debug!(pending = decoder.pending(), "socket closed mid-frame");
                        }
                        return Ok(None);
                    }
                    decoder.extend(&chunk[..n]);
                }
            }
        }
    }

    /// Close the socket. Errors are ignored; the peer may already be gone.
    pub async fn close(&mut self) {
        match self {
            Transport::WebSocket(ws) => {
                let _ = WebSocketStream::close(ws, None).await;
            }
            Transport::Raw { socket, .. } => {
                let _ = socket.shutdown().await;
            }
        }
    }

    /// Send an error frame and close; used to reject a connection explicitly.
    pub async fn reject(&mut self, error: &FxError) {
        let _ = self.send(&Frame::Error(error.into())).await;
        self.close().await;
    }
}
