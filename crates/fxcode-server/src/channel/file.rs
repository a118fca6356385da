//! `remotefilesystem` channel: disk access for the workbench.
//!
//! Resources arrive as serialized URIs and are resolved to local paths
//! before reaching the [`FileSystemProvider`]. Watches are grouped into
//! client-chosen watch sessions; a session exists while its `fileChange`
//! subscription has listeners and owns every watch registered under it.

use crate::channel::{arg, arg_as, arg_or_default, ChannelContext, EventStream, ServerChannel};
use crate::services::disk::{
    ChangeSink, DeleteOptions, FileChange, FileSystemProvider, OpenOptions, OverwriteOptions,
    ReadStreamEvent, ReadStreamOptions, WatchHandle, WatchOptions, WriteOptions,
};
use async_trait::async_trait;
use fxcode_core::{
    Buffer, Emitter, FxError, FxResult, ResourceTransformer, UriComponents, WeakEmitter,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Editor configuration files whose failures are not reported to the
/// client.
const QUIET_CONFIG_FILES: [&str; 3] = ["launch.json", "settings.json", "tasks.json"];

struct WatchSession {
    events: WeakEmitter<Value>,
    transformer: Arc<ResourceTransformer>,
    watches: HashMap<u64, WatchHandle>,
}

type WatchSessions = Arc<Mutex<HashMap<String, WatchSession>>>;

pub struct FileChannel {
    provider: Arc<dyn FileSystemProvider>,
    sessions: WatchSessions,
}

impl FileChannel {
    pub fn new(provider: Arc<dyn FileSystemProvider>) -> Self {
        Self {
            provider,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Watches currently registered under `session`, or `None` if the
    /// session has no listener.
    pub fn watch_count(&self, session: &str) -> Option<usize> {
        self.sessions
            .lock()
            .ok()?
            .get(session)
            .map(|s| s.watches.len())
    }

    async fn dispatch(&self, t: &ResourceTransformer, command: &str, args: &Value) -> FxResult<Value> {
        let provider = &self.provider;
        match command {
            "stat" => {
                let stat = provider.stat(&resource(t, args, 0, "resource")?).await?;
                Ok(serde_json::to_value(stat)?)
            }
            "open" => {
                let opts: OpenOptions = arg_or_default(args, 1, "opts")?;
                let fd = provider.open(&resource(t, args, 0, "resource")?, opts).await?;
                Ok(json!(fd))
            }
            "close" => {
                provider.close(arg_as(args, 0, "fd")?).await?;
                Ok(Value::Null)
            }
            "read" => {
                let fd = arg_as(args, 0, "fd")?;
                let pos = arg_as(args, 1, "pos")?;
                let length = arg_as(args, 2, "length")?;
                let data = provider.read(fd, pos, length).await?;
                Ok(json!([data.len(), Buffer(data)]))
            }
            "readFile" => {
                let data = provider.read_file(&resource(t, args, 0, "resource")?).await?;
                Ok(json!(Buffer(data)))
            }
            "write" => {
                let fd = arg_as(args, 0, "fd")?;
                let pos = arg_as(args, 1, "pos")?;
                let Buffer(data) = arg_as(args, 2, "data")?;
                let offset: usize = arg_or_default(args, 3, "offset")?;
                let length: usize = match arg(args, 4, "length") {
                    Some(Value::Null) | None => data.len().saturating_sub(offset),
                    Some(_) => arg_as(args, 4, "length")?,
                };
                let start = offset.min(data.len());
                let end = start.saturating_add(length).min(data.len());
                let written = provider.write(fd, pos, &data[start..end]).await?;
                Ok(json!(written))
            }
            "writeFile" => {
                let path = resource(t, args, 0, "resource")?;
                let Buffer(data) = arg_as(args, 1, "content")?;
                let opts: WriteOptions = arg_or_default(args, 2, "opts")?;
                provider.write_file(&path, &data, opts).await?;
                Ok(Value::Null)
            }
            "delete" => {
                let opts: DeleteOptions = arg_or_default(args, 1, "opts")?;
                provider.delete(&resource(t, args, 0, "resource")?, opts).await?;
                Ok(Value::Null)
            }
            "mkdir" => {
                provider.mkdir(&resource(t, args, 0, "resource")?).await?;
                Ok(Value::Null)
            }
            "readdir" => {
                let entries = provider.readdir(&resource(t, args, 0, "resource")?).await?;
                Ok(json!(entries))
            }
            "rename" | "copy" => {
                let from = resource(t, args, 0, "resource")?;
                let to = resource(t, args, 1, "target")?;
                let opts: OverwriteOptions = arg_or_default(args, 2, "opts")?;
                if command == "rename" {
                    provider.rename(&from, &to, opts).await?;
                } else {
                    provider.copy(&from, &to, opts).await?;
                }
                Ok(Value::Null)
            }
            "watch" => {
                let session: String = arg_as(args, 0, "session")?;
                let req: u64 = arg_as(args, 1, "req")?;
                let addressed = uri_arg(args, 2, "resource")?;
                let opts: WatchOptions = arg_or_default(args, 3, "opts")?;
                self.watch(&session, req, addressed, opts)?;
                Ok(Value::Null)
            }
            "unwatch" => {
                let session: String = arg_as(args, 0, "session")?;
                let req: u64 = arg_as(args, 1, "req")?;
                self.unwatch(&session, req);
                Ok(Value::Null)
            }
            other => Err(FxError::InvalidCall(other.to_string())),
        }
    }

    /// Changes under a watch are reported in the address space the client
    /// used for `addressed`.
    fn watch(&self, session: &str, req: u64, addressed: UriComponents, opts: WatchOptions) -> FxResult<()> {
        let (events, transformer) = self
            .sessions
            .lock()
            .map_err(|_| FxError::Other("watch sessions poisoned".into()))?
            .get(session)
            .map(|s| (s.events.clone(), s.transformer.clone()))
            .ok_or_else(|| FxError::Channel(format!("no watch session '{session}'")))?;

        let path = transformer.resolve(&addressed).fs_path();
        let sink: ChangeSink = Arc::new(move |changes: Vec<FileChange>| {
            events.fire(change_payload(&transformer, &addressed, changes));
        });

        // The provider may block briefly; do not hold the session lock.
        let handle = self.provider.watch(&path, opts, sink)?;
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| FxError::Other("watch sessions poisoned".into()))?;
        match sessions.get_mut(session) {
            Some(s) => {
                debug!(session, req, path = %path.display(), "watch added");
                s.watches.insert(req, handle);
                Ok(())
            }
            None => Err(FxError::Channel(format!("no watch session '{session}'"))),
        }
    }

    fn unwatch(&self, session: &str, req: u64) {
        let removed = self
            .sessions
            .lock()
            .ok()
            .and_then(|mut s| s.get_mut(session).and_then(|s| s.watches.remove(&req)));
        if removed.is_some() {
            debug!(session, req, "watch removed");
        }
    }

    fn file_change(&self, ctx: &ChannelContext, session: String) -> EventStream {
        let emitter = Emitter::<Value>::new();
        let events = emitter.downgrade();
        let transformer = ctx.transformer.clone();
        let on_first = {
            let sessions = self.sessions.clone();
            let session = session.clone();
            move || {
                if let Ok(mut sessions) = sessions.lock() {
                    debug!(session = %session, "watch session opened");
                    sessions.insert(
                        session.clone(),
                        WatchSession {
                            events: events.clone(),
                            transformer: transformer.clone(),
                            watches: HashMap::new(),
                        },
                    );
                }
            }
        };
        let on_last = {
            let sessions = self.sessions.clone();
            move || {
                let closed = sessions.lock().ok().and_then(|mut s| s.remove(&session));
                if let Some(closed) = closed {
                    debug!(session = %session, watches = closed.watches.len(), "watch session closed");
                }
            }
        };
        let emitter = emitter.on_first_listener(on_first).on_last_listener(on_last);
        Box::pin(emitter.subscribe())
    }

    fn read_file_stream(&self, path: &Path, opts: ReadStreamOptions) -> EventStream {
        let cancel = CancellationToken::new();
        let mut rx = self.provider.read_file_stream(path, opts, cancel.clone());
        let emitter = Emitter::<Value>::new().on_last_listener(move || cancel.cancel());
        let listener = emitter.subscribe();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    ReadStreamEvent::Data(data) => {
                        emitter.fire(json!({ "type": "data", "data": Buffer(data) }))
                    }
                    ReadStreamEvent::Error(message) => {
                        emitter.fire(json!({ "type": "error", "message": message }))
                    }
                    ReadStreamEvent::End => {
                        emitter.fire(json!("end"));
                        break;
                    }
                }
            }
            emitter.dispose();
        });
        Box::pin(listener)
    }
}

#[async_trait]
impl ServerChannel for FileChannel {
    async fn call(&self, ctx: &ChannelContext, command: &str, args: Value) -> FxResult<Value> {
        match self.dispatch(&ctx.transformer, command, &args).await {
            Err(e) if touches_quiet_config(&ctx.transformer, &args) => {
                warn!(command, error = %e, "ignoring failure on editor config file");
                Ok(Value::Null)
            }
            result => result,
        }
    }

    fn listen(&self, ctx: &ChannelContext, event: &str, args: Value) -> FxResult<EventStream> {
        match event {
            "fileChange" => {
                let session: String = arg_as(&args, 0, "session")?;
                Ok(self.file_change(ctx, session))
            }
            "readFileStream" => {
                let path = resource(&ctx.transformer, &args, 0, "resource")?;
                let opts: ReadStreamOptions = arg_or_default(&args, 1, "opts")?;
                Ok(self.read_file_stream(&path, opts))
            }
            other => Err(FxError::InvalidListen(other.to_string())),
        }
    }
}

fn uri_arg(args: &Value, index: usize, name: &str) -> FxResult<UriComponents> {
    let value = arg(args, index, name)
        .ok_or_else(|| FxError::InvalidMessage(format!("missing argument '{name}'")))?;
    UriComponents::from_value(value)
}

/// Local path for the URI argument at `index`.
fn resource(t: &ResourceTransformer, args: &Value, index: usize, name: &str) -> FxResult<PathBuf> {
    Ok(t.resolve(&uri_arg(args, index, name)?).fs_path())
}

fn change_payload(
    t: &ResourceTransformer,
    addressed: &UriComponents,
    changes: Vec<FileChange>,
) -> Value {
    Value::Array(
        changes
            .into_iter()
            .map(|change| {
                let uri = t.restore(&UriComponents::file(&change.path), addressed);
                json!({ "resource": uri, "type": change.kind })
            })
            .collect(),
    )
}

/// Whether any URI argument resolves to `.vscode/{launch,settings,tasks}.json`.
fn touches_quiet_config(t: &ResourceTransformer, args: &Value) -> bool {
    let values: Vec<&Value> = match args {
        Value::Array(items) => items.iter().collect(),
        Value::Object(map) => map.values().collect(),
        other => vec![other],
    };
    values
        .into_iter()
        .filter_map(|v| UriComponents::from_value(v).ok())
        .map(|uri| t.resolve(&uri).fs_path())
        .any(|path| is_quiet_config(&path))
}

fn is_quiet_config(path: &Path) -> bool {
    let parent_is_vscode = path
        .parent()
        .and_then(Path::file_name)
        .is_some_and(|n| n == ".vscode");
    let name_matches = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| QUIET_CONFIG_FILES.contains(&n));
    parent_is_vscode && name_matches
}
