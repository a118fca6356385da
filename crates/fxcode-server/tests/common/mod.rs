//! In-memory client for driving a real `SessionServer`.

#![allow(dead_code)]

use fxcode_core::{
    BoxedSocket, ChannelRequest, ChannelResponse, ConnectionType, ErrorPayload, Frame,
    HandshakeRequest, Payload, Transport,
};
use fxcode_server::config::{CliOverrides, ConfigFile};
use fxcode_server::{ServerConfig, SessionServer};
use serde_json::Value;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

pub const AUTHORITY: &str = "localhost:35419";

/// Server config with every path under `root`.
pub fn config(root: &Path) -> ServerConfig {
    let mut config = ServerConfig::from_file(ConfigFile::default(), CliOverrides::default());
    config.remote_authority = AUTHORITY.into();
    config.handshake_timeout = Duration::from_secs(5);
    let paths = &mut config.paths;
    paths.app_root = root.join("app");
    paths.home_dir = root.join("home");
    paths.content_root = root.join("content");
    paths.user_data_dir = root.join("user");
    paths.extensions_dir = root.join("installed");
    paths.builtin_extensions_dir = root.join("builtin");
    paths.extra_builtin_extensions_dirs = Vec::new();
    paths.extra_extensions_dirs = Vec::new();
    paths.logs_dir = root.join("logs");
    config
}

pub fn write_extension(root: &Path, dir: &str, manifest: Value) {
    let dir = root.join(dir);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("package.json"), manifest.to_string()).unwrap();
}

/// Open an in-memory socket to `server` and perform the HTTP upgrade.
/// Returns the client transport and the task serving the server side.
pub async fn connect(
    server: &Arc<SessionServer>,
    query: &str,
    raw: bool,
) -> (Transport, JoinHandle<fxcode_core::FxResult<()>>) {
    let (client, server_end) = duplex(256 * 1024);
    let server = server.clone();
    let serving = tokio::spawn(async move { server.accept_socket(Box::new(server_end)).await });
    let client: BoxedSocket = Box::new(client);

    let transport = if raw {
        let mut client = client;
        let response = upgrade_raw(&mut client, &format!("{query}&skipWebSocketFrames=true")).await;
        assert!(response.starts_with("HTTP/1.1 101"), "unexpected response: {response}");
        Transport::raw(client)
    } else {
        let url = format!("ws://localhost/?{query}");
        let (ws, _) = tokio_tungstenite::client_async(url.as_str(), client)
            .await
            .expect("websocket upgrade");
        Transport::WebSocket(Box::new(ws))
    };
    (transport, serving)
}

/// Send a hand-written upgrade request and return the response head.
pub async fn upgrade_raw(socket: &mut BoxedSocket, query: &str) -> String {
    let request = format!(
        "GET /?{query} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    );
    socket.write_all(request.as_bytes()).await.unwrap();

    // Byte at a time so nothing past the head is consumed.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if socket.read(&mut byte).await.unwrap() == 0 {
            break;
        }
        head.push(byte[0]);
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Minimal client side of the sequenced protocol.
pub struct Client {
    pub transport: Transport,
    seq: u64,
    last_received: u64,
    next_id: u32,
    events: VecDeque<(u32, Value)>,
}

impl Client {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            seq: 0,
            last_received: 0,
            next_id: 0,
            events: VecDeque::new(),
        }
    }

    /// Swap in a fresh transport, keeping sequence state.
    pub fn attach(&mut self, transport: Transport) {
        self.transport = transport;
    }

    /// Send the handshake and return the server's reply frame.
    pub async fn handshake(&mut self, kind: ConnectionType, args: Value) -> Frame {
        self.transport
            .send(&Frame::Handshake(HandshakeRequest {
                desired_connection_type: kind,
                commit: None,
                args,
            }))
            .await
            .unwrap();
        self.next_control().await
    }

    /// Next frame that is not a keep-alive or an ack.
    pub async fn next_control(&mut self) -> Frame {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(10), self.transport.recv())
                .await
                .expect("timed out waiting for a frame")
                .unwrap()
                .expect("transport closed");
            match frame {
                Frame::KeepAlive | Frame::Ack { .. } => continue,
                other => return other,
            }
        }
    }

    pub async fn send_payload(&mut self, payload: Payload) {
        self.seq += 1;
        let frame = Frame::Regular {
            seq: self.seq,
            ack: self.last_received,
            payload,
        };
        self.transport.send(&frame).await.unwrap();
    }

    /// Next payload not seen before.
    pub async fn next_payload(&mut self) -> Payload {
        loop {
            match self.next_control().await {
                Frame::Regular { seq, payload, .. } => {
                    if seq <= self.last_received {
                        continue;
                    }
                    self.last_received = seq;
                    return payload;
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }
    }

    pub async fn call(&mut self, channel: &str, command: &str, args: Value) -> Result<Value, ErrorPayload> {
        self.next_id += 1;
        let id = self.next_id;
        self.send_payload(Payload::Request(ChannelRequest::Call {
            id,
            channel: channel.into(),
            command: command.into(),
            args,
        }))
        .await;
        loop {
            match self.next_payload().await {
                Payload::Response(ChannelResponse::Ok { id: r, result }) if r == id => return Ok(result),
                Payload::Response(ChannelResponse::Err { id: r, error }) if r == id => return Err(error),
                Payload::Response(ChannelResponse::Event { id, payload }) => {
                    self.events.push_back((id, payload))
                }
                _ => {}
            }
        }
    }

    pub async fn listen(&mut self, channel: &str, event: &str, args: Value) -> u32 {
        self.next_id += 1;
        let id = self.next_id;
        self.send_payload(Payload::Request(ChannelRequest::Listen {
            id,
            channel: channel.into(),
            event: event.into(),
            args,
        }))
        .await;
        id
    }

    pub async fn dispose(&mut self, id: u32) {
        self.send_payload(Payload::Request(ChannelRequest::Dispose { id }))
            .await;
    }

    pub async fn next_event(&mut self, id: u32) -> Value {
        if let Some(pos) = self.events.iter().position(|(e, _)| *e == id) {
            if let Some((_, payload)) = self.events.remove(pos) {
                return payload;
            }
        }
        loop {
            match self.next_payload().await {
                Payload::Response(ChannelResponse::Event { id: e, payload }) if e == id => return payload,
                Payload::Response(ChannelResponse::Event { id, payload }) => {
                    self.events.push_back((id, payload))
                }
                _ => {}
            }
        }
    }
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
