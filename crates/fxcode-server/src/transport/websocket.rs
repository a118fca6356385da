//! TCP listener and HTTP upgrade handling.
//!
//! The request head is parsed with `httparse` and validated by tungstenite's
//! server handshake; the query string decides between WebSocket framing and
//! raw frames once the `101` has been written.

use super::ConnectionQuery;
use fxcode_core::{BoxedSocket, FxError, FxResult, Transport};
use std::net::SocketAddr;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{create_response, ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{self, header, HeaderValue, StatusCode, Version};
use tokio_tungstenite::tungstenite::protocol::Role;
use tracing::{debug, error, info, warn};

/// Upper bound on the HTTP request head.
const MAX_HEAD_SIZE: u64 = 16 * 1024;
const MAX_HEADERS: usize = 64;

/// An upgraded socket ready for the handshake.
pub struct UpgradedConnection {
    pub query: ConnectionQuery,
    pub transport: Transport,
    pub remote_addr: Option<SocketAddr>,
}

/// Bind `bind_addr` and upgrade every accepted socket in its own task.
///
/// Returns a receiver that yields upgraded connections.
pub async fn start_listener(bind_addr: SocketAddr) -> FxResult<mpsc::Receiver<UpgradedConnection>> {
    let tcp_listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|e| FxError::Transport(format!("bind {bind_addr} failed: {e}")))?;
    info!(addr = %bind_addr, "listening");

    let (tx, rx) = mpsc::channel::<UpgradedConnection>(64);

    tokio::spawn(async move {
        loop {
            match tcp_listener.accept().await {
                Ok((stream, addr)) => {
                    let _ = stream.set_nodelay(true);
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        match accept_upgrade(Box::new(stream)).await {
                            Ok((query, transport)) => {
                                debug!(remote = %addr, token = %query.reconnection_token, "socket upgraded");
                                let conn = UpgradedConnection {
                                    query,
                                    transport,
                                    remote_addr: Some(addr),
                                };
                                if tx.send(conn).await.is_err() {
                                    warn!("connection channel closed");
                                }
                            }
                            Err(e) => warn!(remote = %addr, error = %e, "upgrade failed"),
                        }
                    });
                }
                Err(e) => error!(error = %e, "TCP accept failed"),
            }
        }
    });

    Ok(rx)
}

/// Read the request head line by line so nothing past it is consumed.
async fn read_request(reader: &mut BufReader<BoxedSocket>) -> FxResult<Request> {
    let mut head = Vec::new();
    loop {
        let budget = MAX_HEAD_SIZE.saturating_sub(head.len() as u64);
        let n = (&mut *reader).take(budget).read_until(b'\n', &mut head).await?;
        if n == 0 {
            let reason = if budget == 0 {
                "request head too large"
            } else {
                "request head truncated"
            };
            return Err(FxError::Upgrade(reason.into()));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);
        match parsed.parse(&head) {
            Ok(httparse::Status::Complete(_)) => return to_http(&parsed),
            Ok(httparse::Status::Partial) => {}
            Err(e) => return Err(FxError::Upgrade(format!("malformed request: {e}"))),
        }
    }
}

fn to_http(parsed: &httparse::Request<'_, '_>) -> FxResult<Request> {
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = http::Request::builder()
        .method(parsed.method.unwrap_or_default())
        .uri(parsed.path.unwrap_or("/"))
        .version(version);
    for h in parsed.headers.iter().filter(|h| !h.name.is_empty()) {
        builder = builder.header(h.name, h.value);
    }
    builder
        .body(())
        .map_err(|e| FxError::Upgrade(format!("malformed request: {e}")))
}

/// Validate the WebSocket upgrade and the connection query.
fn check_upgrade(request: &Request) -> FxResult<(ConnectionQuery, http::Response<()>)> {
    let response = create_response(request).map_err(|e| FxError::Upgrade(e.to_string()))?;
    let query = ConnectionQuery::parse(request.uri().query().unwrap_or_default())?;
    Ok((query, response))
}

fn refusal(reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(reason.len()));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

fn encode_response<T>(response: &http::Response<T>, body: &[u8]) -> Vec<u8> {
    let status = response.status();
    let mut out = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or_default()
    );
    for (name, value) in response.headers() {
        out.push_str(name.as_str());
        out.push_str(": ");
        out.push_str(&String::from_utf8_lossy(value.as_bytes()));
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    let mut bytes = out.into_bytes();
    bytes.extend_from_slice(body);
    bytes
}

/// Answer the HTTP upgrade on `socket` and wrap it in the framing the
/// client asked for. Refused upgrades get a `400` with the reason.
pub async fn accept_upgrade(socket: BoxedSocket) -> FxResult<(ConnectionQuery, Transport)> {
    let mut reader = BufReader::new(socket);
    let checked = match read_request(&mut reader).await {
        Ok(request) => check_upgrade(&request),
        Err(e) => Err(e),
    };

    let (query, response) = match checked {
        Ok(ok) => ok,
        Err(e) => {
            let reason = e.to_string();
            let bytes = encode_response(&refusal(&reason), reason.as_bytes());
            let socket = reader.get_mut();
            let _ = socket.write_all(&bytes).await;
            let _ = socket.shutdown().await;
            return Err(e);
        }
    };

    let socket = reader.get_mut();
    socket.write_all(&encode_response(&response, &[])).await?;
    socket.flush().await?;

    // Bytes the client sent right after the head stay buffered in `reader`.
    let socket: BoxedSocket = Box::new(reader);
    let transport = if query.skip_websocket_frames {
        Transport::raw(socket)
    } else {
        Transport::websocket(socket, Role::Server).await
    };
    Ok((query, transport))
}
