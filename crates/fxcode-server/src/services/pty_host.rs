//! Terminal-process collaborator behind the terminal channel.

use crate::services::pty::{PtyHandle, PtyLaunch};
use async_trait::async_trait;
use fxcode_core::{Emitter, FxError, FxResult, Listener};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

const READ_CHUNK: usize = 8192;

/// Launch arguments: one command line or an argument vector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShellArgs {
    Line(String),
    List(Vec<String>),
}

impl ShellArgs {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            ShellArgs::Line(line) if line.is_empty() => Vec::new(),
            ShellArgs::Line(line) => vec![line.clone()],
            ShellArgs::List(list) => list.clone(),
        }
    }
}

/// Shell launch configuration as sent by the client. `cwd` is a string or
/// a serialized URI; environment values of `null` delete the variable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellLaunchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<ShellArgs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub strict_env: bool,
}

/// A fully resolved process request.
#[derive(Debug, Clone, Default)]
pub struct CreateProcessRequest {
    pub shell_launch_config: ShellLaunchConfig,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub unicode_version: String,
    pub env: HashMap<String, String>,
    pub should_persist: bool,
    pub workspace_id: String,
    pub workspace_name: String,
}

/// Event streams a pty host publishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PtyEvent {
    ProcessData,
    ProcessReady,
    ProcessExit,
}

#[async_trait]
pub trait PtyHost: Send + Sync {
    /// Register a process; it runs once [`start`](Self::start) is called.
    async fn create_process(&self, request: CreateProcessRequest) -> FxResult<u32>;
    /// Returns a launch error description, or `null` on success.
    async fn start(&self, id: u32) -> FxResult<Value>;
    async fn input(&self, id: u32, data: String) -> FxResult<()>;
    async fn process_binary(&self, id: u32, data: String) -> FxResult<()>;
    async fn resize(&self, id: u32, cols: u16, rows: u16) -> FxResult<()>;
    async fn shutdown(&self, id: u32, immediate: bool) -> FxResult<()>;
    async fn acknowledge_data_event(&self, id: u32, char_count: u64) -> FxResult<()>;
    async fn get_initial_cwd(&self, id: u32) -> FxResult<String>;
    async fn get_cwd(&self, id: u32) -> FxResult<String>;
    async fn list_processes(&self) -> FxResult<Value>;
    async fn get_default_system_shell(&self) -> FxResult<String>;
    async fn get_environment(&self) -> FxResult<HashMap<String, String>>;
    /// Payloads are `{id, event}` objects.
    fn subscribe(&self, event: PtyEvent) -> Listener<Value>;
}

struct PtyProcess {
    request: CreateProcessRequest,
    handle: Mutex<Option<Arc<PtyHandle>>>,
}

impl PtyProcess {
    fn handle(&self, id: u32) -> FxResult<Arc<PtyHandle>> {
        self.handle
            .lock()
            .ok()
            .and_then(|h| h.clone())
            .ok_or_else(|| FxError::Channel(format!("terminal {id} has not been started")))
    }
}

/// Runs terminals as local PTY children.
pub struct LocalPtyHost {
    processes: Arc<Mutex<HashMap<u32, Arc<PtyProcess>>>>,
    next_id: AtomicU32,
    on_data: Emitter<Value>,
    on_ready: Emitter<Value>,
    on_exit: Emitter<Value>,
}

impl Default for LocalPtyHost {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalPtyHost {
    pub fn new() -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU32::new(1),
            on_data: Emitter::new(),
            on_ready: Emitter::new(),
            on_exit: Emitter::new(),
        }
    }

    fn process(&self, id: u32) -> FxResult<Arc<PtyProcess>> {
        self.processes
            .lock()
            .map_err(|_| FxError::Other("process table poisoned".into()))?
            .get(&id)
            .cloned()
            .ok_or_else(|| FxError::Channel(format!("no terminal process with id {id}")))
    }

    async fn write(&self, id: u32, data: Vec<u8>) -> FxResult<()> {
        let handle = self.process(id)?.handle(id)?;
        tokio::task::spawn_blocking(move || handle.write_blocking(&data))
            .await
            .map_err(|e| FxError::Other(format!("join error: {e}")))?
    }

    /// Pump PTY output into data events until EOF, then report the exit.
    fn spawn_reader(&self, id: u32, handle: Arc<PtyHandle>) {
        let data = self.on_data.clone();
        let exit = self.on_exit.clone();
        let processes = self.processes.clone();
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_CHUNK];
            let mut pending = Vec::new();
            loop {
                match handle.read_blocking(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        let text = take_utf8(&mut pending);
                        if !text.is_empty() {
                            data.fire(json!({ "id": id, "event": text }));
                        }
                    }
                    Err(e) => {
                        debug!(id, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
            let code = handle.wait_blocking().ok();
            if let Ok(mut table) = processes.lock() {
                table.remove(&id);
            }
            exit.fire(json!({ "id": id, "event": code }));
        });
    }
}

#[async_trait]
impl PtyHost for LocalPtyHost {
    async fn create_process(&self, request: CreateProcessRequest) -> FxResult<u32> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(id, cwd = %request.cwd, "terminal process registered");
        let process = Arc::new(PtyProcess {
            request,
            handle: Mutex::new(None),
        });
        self.processes
            .lock()
            .map_err(|_| FxError::Other("process table poisoned".into()))?
            .insert(id, process);
        Ok(id)
    }

    async fn start(&self, id: u32) -> FxResult<Value> {
        let process = self.process(id)?;
        let request = &process.request;
        let executable = match &request.shell_launch_config.executable {
            Some(exe) if !exe.is_empty() => exe.clone(),
            _ => self.get_default_system_shell().await?,
        };
        let launch = PtyLaunch {
            executable,
            args: request
                .shell_launch_config
                .args
                .as_ref()
                .map(ShellArgs::to_vec)
                .unwrap_or_default(),
            cwd: request.cwd.clone(),
            env: request.env.clone(),
            cols: request.cols,
            rows: request.rows,
        };
        let handle = match tokio::task::spawn_blocking(move || PtyHandle::spawn(&launch))
            .await
            .map_err(|e| FxError::Other(format!("join error: {e}")))?
        {
            Ok(handle) => Arc::new(handle),
            Err(e) => {
                warn!(id, error = %e, "terminal launch failed");
                return Ok(json!({ "message": e.to_string() }));
            }
        };
        if let Ok(mut slot) = process.handle.lock() {
            *slot = Some(handle.clone());
        }
        self.on_ready.fire(json!({
            "id": id,
            "event": { "pid": handle.pid(), "cwd": request.cwd },
        }));
        self.spawn_reader(id, handle);
        Ok(Value::Null)
    }

    async fn input(&self, id: u32, data: String) -> FxResult<()> {
        self.write(id, data.into_bytes()).await
    }

    async fn process_binary(&self, id: u32, data: String) -> FxResult<()> {
        // Binary input arrives as a latin-1 string, one char per byte.
        let bytes = data.chars().map(|c| c as u32 as u8).collect();
        self.write(id, bytes).await
    }

    async fn resize(&self, id: u32, cols: u16, rows: u16) -> FxResult<()> {
        self.process(id)?.handle(id)?.resize(cols, rows)
    }

    async fn shutdown(&self, id: u32, immediate: bool) -> FxResult<()> {
        let process = self.process(id)?;
        debug!(id, immediate, "terminal shutdown");
        if let Ok(handle) = process.handle(id) {
            handle.kill()?;
        } else if let Ok(mut table) = self.processes.lock() {
            // Never started; nothing will report an exit.
            table.remove(&id);
        }
        Ok(())
    }

    async fn acknowledge_data_event(&self, id: u32, char_count: u64) -> FxResult<()> {
        debug!(id, char_count, "data acknowledged");
        Ok(())
    }

    async fn get_initial_cwd(&self, id: u32) -> FxResult<String> {
        Ok(self.process(id)?.request.cwd.clone())
    }

    async fn get_cwd(&self, id: u32) -> FxResult<String> {
        let process = self.process(id)?;
        let live = process
            .handle(id)
            .ok()
            .and_then(|h| h.pid())
            .and_then(|pid| std::fs::read_link(format!("/proc/{pid}/cwd")).ok());
        Ok(live
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| process.request.cwd.clone()))
    }

    async fn list_processes(&self) -> FxResult<Value> {
        let table = self
            .processes
            .lock()
            .map_err(|_| FxError::Other("process table poisoned".into()))?;
        let mut list: Vec<Value> = table
            .iter()
            .filter(|(_, p)| p.request.should_persist)
            .map(|(id, p)| {
                json!({
                    "id": id,
                    "pid": p.handle(*id).ok().and_then(|h| h.pid()),
                    "title": p.request.shell_launch_config.name.clone().unwrap_or_default(),
                    "cwd": p.request.cwd,
                    "workspaceId": p.request.workspace_id,
                    "workspaceName": p.request.workspace_name,
                    "isOrphan": false,
                })
            })
            .collect();
        list.sort_by_key(|v| v["id"].as_u64());
        Ok(Value::Array(list))
    }

    async fn get_default_system_shell(&self) -> FxResult<String> {
        Ok(default_shell())
    }

    async fn get_environment(&self) -> FxResult<HashMap<String, String>> {
        Ok(std::env::vars().collect())
    }

    fn subscribe(&self, event: PtyEvent) -> Listener<Value> {
        match event {
            PtyEvent::ProcessData => self.on_data.subscribe(),
            PtyEvent::ProcessReady => self.on_ready.subscribe(),
            PtyEvent::ProcessExit => self.on_exit.subscribe(),
        }
    }
}

fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

/// Drain the longest valid UTF-8 prefix of `pending`, keeping an incomplete
/// trailing sequence for the next read. Invalid bytes are replaced.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let text = s.to_string();
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
