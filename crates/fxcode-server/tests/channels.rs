mod common;

use common::{config, connect, eventually, write_extension, Client, AUTHORITY};
use fxcode_core::{ConnectionType, Frame};
use fxcode_server::channel::file::FileChannel;
use fxcode_server::channel::{ChannelRegistry, FILE_CHANNEL, LOGGER_CHANNEL};
use fxcode_server::services::{DiskFileSystemProvider, Environment};
use fxcode_server::SessionServer;
use serde_json::{json, Value};
use std::sync::Arc;

async fn management(server: &Arc<SessionServer>, token: &str, raw: bool) -> Client {
    let (transport, _) = connect(server, &format!("reconnectionToken={token}"), raw).await;
    let mut client = Client::new(transport);
    let reply = client.handshake(ConnectionType::Management, json!({})).await;
    assert!(matches!(reply, Frame::Ok(_)), "{reply:?}");
    client
}

fn remote(path: &std::path::Path) -> Value {
    json!({
        "$mid": 1,
        "scheme": "vscode-remote",
        "authority": AUTHORITY,
        "path": path.to_string_lossy(),
    })
}

#[tokio::test]
async fn webview_resource_stats_the_embedded_path() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("foo.txt");
    std::fs::write(&target, b"twelve bytes").unwrap();
    let server = Arc::new(SessionServer::with_default_channels(config(tmp.path())));

    for raw in [false, true] {
        let mut client = management(&server, if raw { "raw" } else { "ws" }, raw).await;
        let webview = json!({
            "$mid": 1,
            "scheme": "vscode-remote",
            "authority": AUTHORITY,
            "path": "/vscode-resource",
            "query": json!({ "requestResourcePath": target.to_string_lossy() }).to_string(),
        });
        let stat = client.call(FILE_CHANNEL, "stat", json!([webview])).await.unwrap();
        assert_eq!(stat["type"], 1);
        assert_eq!(stat["size"], 12);
    }
}

#[tokio::test]
async fn file_round_trip_through_the_channel() {
    let tmp = tempfile::tempdir().unwrap();
    let server = Arc::new(SessionServer::with_default_channels(config(tmp.path())));
    let mut client = management(&server, "files", true).await;

    let dir = tmp.path().join("work");
    client.call(FILE_CHANNEL, "mkdir", json!([remote(&dir)])).await.unwrap();
    let file = dir.join("a.lua");
    client
        .call(
            FILE_CHANNEL,
            "writeFile",
            json!([remote(&file), "cHJpbnQoMSk=", { "create": true, "overwrite": true }]),
        )
        .await
        .unwrap();
    assert_eq!(std::fs::read(&file).unwrap(), b"print(1)");

    let entries = client.call(FILE_CHANNEL, "readdir", json!([remote(&dir)])).await.unwrap();
    assert_eq!(entries, json!([["a.lua", 1]]));

    let missing = client
        .call(FILE_CHANNEL, "stat", json!([remote(&dir.join("nope"))]))
        .await
        .unwrap_err();
    assert_eq!(missing.code, "FileNotFound");

    let unknown = client.call(FILE_CHANNEL, "chmod", json!([])).await.unwrap_err();
    assert_eq!(unknown.code, "InvalidCall");
    let channel = client.call("nope", "x", json!([])).await.unwrap_err();
    assert_eq!(channel.code, "UnknownChannel");
}

#[tokio::test]
async fn oversized_read_is_answered_with_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let file = tmp.path().join("three.txt");
    std::fs::write(&file, b"abc").unwrap();
    let server = Arc::new(SessionServer::with_default_channels(config(tmp.path())));
    let mut client = management(&server, "reads", true).await;

    let fd = client.call(FILE_CHANNEL, "open", json!([remote(&file), {}])).await.unwrap();
    let err = client
        .call(FILE_CHANNEL, "read", json!([fd, 0, u64::MAX / 2]))
        .await
        .unwrap_err();
    assert_eq!(err.code, "InvalidMessage");

    // The session is still serving.
    let read = client.call(FILE_CHANNEL, "read", json!([fd, 0, 1024])).await.unwrap();
    assert_eq!(read[0], 3);
    client.call(FILE_CHANNEL, "close", json!([fd])).await.unwrap();
}

#[tokio::test]
async fn watch_requests_share_a_session() {
    let tmp = tempfile::tempdir().unwrap();
    let cfg = config(tmp.path());
    let environment = Arc::new(Environment::from_config(&cfg.paths));
    let files = Arc::new(FileChannel::new(Arc::new(DiskFileSystemProvider::new())));
    let mut registry = ChannelRegistry::new();
    registry.register(FILE_CHANNEL, files.clone());
    let server = Arc::new(SessionServer::new(cfg, environment, registry));
    let mut client = management(&server, "watcher", false).await;

    let listen = client.listen(FILE_CHANNEL, "fileChange", json!(["s1"])).await;
    assert!(eventually(|| files.watch_count("s1") == Some(0)).await);

    let watched = remote(tmp.path());
    client
        .call(FILE_CHANNEL, "watch", json!(["s1", 1, watched, { "recursive": false, "excludes": [] }]))
        .await
        .unwrap();
    client
        .call(FILE_CHANNEL, "watch", json!(["s1", 2, watched, { "recursive": true, "excludes": [] }]))
        .await
        .unwrap();
    assert_eq!(files.watch_count("s1"), Some(2));

    client.call(FILE_CHANNEL, "unwatch", json!(["s1", 1])).await.unwrap();
    assert_eq!(files.watch_count("s1"), Some(1));

    client.dispose(listen).await;
    assert!(eventually(|| files.watch_count("s1").is_none()).await);

    let err = client
        .call(FILE_CHANNEL, "watch", json!(["s1", 3, watched, {}]))
        .await
        .unwrap_err();
    assert!(!err.message.is_empty());
}

#[tokio::test]
async fn extension_scan_prefers_builtin_copy() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path();
    write_extension(
        &root.join("builtin"),
        "lua",
        json!({ "publisher": "cfx", "name": "lua", "version": "1.0.0" }),
    );
    write_extension(
        &root.join("installed"),
        "cfx.lua-2.0.0",
        json!({ "publisher": "CFX", "name": "Lua", "version": "2.0.0" }),
    );
    write_extension(
        &root.join("installed"),
        "natives",
        json!({ "publisher": "cfx", "name": "natives", "version": "0.1.0" }),
    );
    let server = Arc::new(SessionServer::with_default_channels(config(root)));
    let mut client = management(&server, "ext", true).await;

    let found = client
        .call("remoteextensionsenvironment", "scanExtensions", json!([{ "language": "en" }]))
        .await
        .unwrap();
    let found = found.as_array().unwrap();
    assert_eq!(found.len(), 2);
    let lua = found
        .iter()
        .find(|e| e["identifier"]["value"].as_str().unwrap().eq_ignore_ascii_case("cfx.lua"))
        .unwrap();
    assert_eq!(lua["isBuiltin"], true);
    assert_eq!(lua["extensionLocation"]["scheme"], "vscode-remote");
    assert_eq!(lua["extensionLocation"]["authority"], AUTHORITY);

    let env = client
        .call("remoteextensionsenvironment", "getEnvironmentData", json!([]))
        .await
        .unwrap();
    assert_eq!(env["connectionToken"], "ext");
}

#[tokio::test]
async fn log_level_is_adjustable_over_the_logger_channel() {
    let tmp = tempfile::tempdir().unwrap();
    let server = Arc::new(SessionServer::with_default_channels(config(tmp.path())));
    let mut client = management(&server, "logger", true).await;

    let changes = client.listen(LOGGER_CHANNEL, "onDidChangeLogLevel", json!([])).await;
    assert_eq!(client.call(LOGGER_CHANNEL, "getLevel", json!([])).await.unwrap(), 2);

    client.call(LOGGER_CHANNEL, "setLevel", json!([4])).await.unwrap();
    assert_eq!(client.next_event(changes).await, 4);
    assert_eq!(client.call(LOGGER_CHANNEL, "getLevel", json!([])).await.unwrap(), 4);

    let err = client.call(LOGGER_CHANNEL, "setLevel", json!(["verbose"])).await.unwrap_err();
    assert_eq!(err.code, "InvalidMessage");
}
