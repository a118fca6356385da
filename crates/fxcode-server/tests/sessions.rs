mod common;

use common::{config, connect, eventually, upgrade_raw, Client};
use fxcode_core::{BoxedSocket, ConnectionType, Frame, HandshakeOk, Payload};
use fxcode_server::SessionServer;
use serde_json::json;
use std::sync::Arc;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn server(root: &std::path::Path) -> Arc<SessionServer> {
    Arc::new(SessionServer::with_default_channels(config(root)))
}

async fn open(server: &Arc<SessionServer>, query: &str, raw: bool, kind: ConnectionType) -> (Client, Frame) {
    let (transport, _) = connect(server, query, raw).await;
    let mut client = Client::new(transport);
    let reply = client.handshake(kind, json!({})).await;
    (client, reply)
}

#[tokio::test]
async fn reconnection_resumes_the_same_session() {
    let tmp = tempfile::tempdir().unwrap();
    let server = server(tmp.path());
    let mut connected = server.subscribe();

    let (mut client, reply) = open(&server, "reconnectionToken=T&reconnection=false", false, ConnectionType::Management).await;
    assert_eq!(reply, Frame::Ok(HandshakeOk { reconnection: false }));
    let level = client.call("telemetry", "getTelemetryLevel", json!([])).await.unwrap();
    assert_eq!(level, 3);

    let first = connected.recv().await.unwrap();
    assert_eq!(first.token, "T");
    let session = server
        .connections()
        .get(ConnectionType::Management, "T")
        .unwrap();
    assert!(Arc::ptr_eq(&first.session, &session));

    // Lose the socket without saying goodbye.
    let (placeholder, _) = duplex(64);
    let dropped = std::mem::replace(&mut client.transport, fxcode_core::Transport::raw(Box::new(placeholder)));
    drop(dropped);
    assert!(eventually(|| session.is_offline()).await);

    let (transport, _) = connect(&server, "reconnectionToken=T&reconnection=true", false).await;
    client.attach(transport);
    let reply = client.handshake(ConnectionType::Management, json!({})).await;
    assert_eq!(reply, Frame::Ok(HandshakeOk { reconnection: true }));
    assert!(!session.is_offline());

    let level = client.call("telemetry", "getTelemetryLevel", json!([])).await.unwrap();
    assert_eq!(level, 3);
    let resumed = server
        .connections()
        .get(ConnectionType::Management, "T")
        .unwrap();
    assert!(Arc::ptr_eq(&resumed, &session));
    assert!(connected.try_recv().is_err());
}

#[tokio::test]
async fn fresh_connection_with_live_token_collides() {
    let tmp = tempfile::tempdir().unwrap();
    let server = server(tmp.path());
    let (_live, reply) = open(&server, "reconnectionToken=T", true, ConnectionType::Management).await;
    assert!(matches!(reply, Frame::Ok(_)));

    let (_other, reply) = open(&server, "reconnectionToken=T&reconnection=false", true, ConnectionType::Management).await;
    match reply {
        Frame::Error(error) => {
            assert_eq!(error.code, "TokenInUse");
            assert_eq!(error.message, "Unable to connect; token is already in use");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(server.connections().len(ConnectionType::Management), 1);
}

#[tokio::test]
async fn reconnecting_to_unknown_token_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let server = server(tmp.path());
    let (_client, reply) = open(&server, "reconnectionToken=ghost&reconnection=true", false, ConnectionType::Management).await;
    match reply {
        Frame::Error(error) => {
            assert_eq!(error.code, "SessionNotFound");
            assert!(error.message.contains("session no longer exists"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(server.connections().is_empty(ConnectionType::Management));
}

#[tokio::test]
async fn missing_token_is_refused_at_upgrade() {
    let tmp = tempfile::tempdir().unwrap();
    let server = server(tmp.path());
    let (client, server_end) = duplex(16 * 1024);
    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.accept_socket(Box::new(server_end)).await })
    };
    let mut client: BoxedSocket = Box::new(client);
    let response = upgrade_raw(&mut client, "reconnection=false").await;
    assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    assert!(serving.await.unwrap().is_err());
}

#[tokio::test]
async fn extension_host_is_refused_without_a_command() {
    let tmp = tempfile::tempdir().unwrap();
    let server = server(tmp.path());
    let (_client, reply) = open(&server, "reconnectionToken=eh", true, ConnectionType::ExtensionHost).await;
    match reply {
        Frame::Error(error) => assert_eq!(error.code, "Handshake"),
        other => panic!("unexpected {other:?}"),
    }
    assert!(server.connections().is_empty(ConnectionType::ExtensionHost));
}

#[tokio::test]
async fn offline_sessions_beyond_the_limit_are_disposed() {
    let tmp = tempfile::tempdir().unwrap();
    let server = server(tmp.path());

    let (first, _) = open(&server, "reconnectionToken=one", true, ConnectionType::Management).await;
    let session = server.connections().get(ConnectionType::Management, "one").unwrap();
    drop(first);
    assert!(eventually(|| session.is_offline()).await);

    // A new connection sweeps offline sessions; the default keeps none.
    let (_second, _) = open(&server, "reconnectionToken=two", true, ConnectionType::Management).await;
    assert!(eventually(|| session.is_disposed()).await);
    assert!(server.connections().get(ConnectionType::Management, "one").is_none());
    assert!(server.connections().get(ConnectionType::Management, "two").is_some());
}

#[tokio::test]
async fn tunnel_pipes_bytes_to_a_local_port() {
    let tmp = tempfile::tempdir().unwrap();
    let server = server(tmp.path());

    let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = echo.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut stream, _) = echo.accept().await.unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).await.unwrap();
        stream.write_all(&buf[..n]).await.unwrap();
    });

    let (transport, _) = connect(&server, "reconnectionToken=tun", true).await;
    let mut client = Client::new(transport);
    let reply = client.handshake(ConnectionType::Tunnel, json!({ "port": port })).await;
    assert_eq!(reply, Frame::Ok(HandshakeOk { reconnection: false }));

    client.send_payload(Payload::Data(b"hello".to_vec())).await;
    assert_eq!(client.next_payload().await, Payload::Data(b"hello".to_vec()));
    assert!(server.connections().is_empty(ConnectionType::Tunnel));
}

#[tokio::test]
async fn shutdown_closes_every_session() {
    let tmp = tempfile::tempdir().unwrap();
    let server = server(tmp.path());
    let (mut first, _) = open(&server, "reconnectionToken=one", true, ConnectionType::Management).await;
    let (_second, _) = open(&server, "reconnectionToken=two", false, ConnectionType::Management).await;
    let session = server.connections().get(ConnectionType::Management, "one").unwrap();

    assert_eq!(server.shutdown(std::time::Duration::from_secs(5)).await, 2);
    assert!(session.is_disposed());
    assert!(server.connections().is_empty(ConnectionType::Management));
    assert!(matches!(first.next_control().await, Frame::Disconnect { .. }));

    // The server keeps accepting new sessions afterwards.
    let (_third, reply) = open(&server, "reconnectionToken=one", true, ConnectionType::Management).await;
    assert_eq!(reply, Frame::Ok(HandshakeOk { reconnection: false }));
}
