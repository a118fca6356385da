//! Extension-host sessions: a child process whose stdio is bridged to the
//! session's data payloads.

use crate::config::ExtensionHostConfig;
use crate::session::SessionRuntime;
use async_trait::async_trait;
use fxcode_core::{FxError, FxResult, Payload};
use serde_json::{Map, Value};
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Environment variable carrying the handshake arguments to the child.
pub const EXTHOST_ARGS_ENV: &str = "FXCODE_EXTHOST_ARGS";

const READ_CHUNK: usize = 64 * 1024;

/// Input bytes allowed to wait for the child's stdin before the host is
/// considered stalled and stopped.
pub const MAX_QUEUED_INPUT: usize = 64 * 1024 * 1024;

pub struct ExtensionHostRuntime {
    child: Child,
    input: Option<mpsc::UnboundedSender<Vec<u8>>>,
    queued: Arc<AtomicUsize>,
    output: mpsc::Receiver<Vec<u8>>,
}

impl ExtensionHostRuntime {
    /// Spawn the configured extension host. `args` are the handshake
    /// arguments; `language` is added to them before they are passed on.
    pub fn spawn(config: &ExtensionHostConfig, language: &str, args: &Value) -> FxResult<Self> {
        if config.command.is_empty() {
            return Err(FxError::Handshake(
                "extension host connections are not enabled".into(),
            ));
        }

        let mut forwarded = match args {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        forwarded.insert("language".into(), Value::String(language.to_string()));

        let mut child = Command::new(&config.command)
            .args(&config.args)
            .arg("--language")
            .arg(language)
            .env(EXTHOST_ARGS_ENV, Value::Object(forwarded).to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        info!(command = %config.command, pid = ?child.id(), "extension host started");

        let queued = Arc::new(AtomicUsize::new(0));
        let input = child.stdin.take().map(|stdin| spawn_writer(stdin, queued.clone()));
        let (tx, output) = mpsc::channel(64);

        if let Some(mut stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut buf = vec![0u8; READ_CHUNK];
                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "extension host stdout read failed");
                            break;
                        }
                    }
                }
                debug!("extension host stdout closed");
            });
        }

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "exthost", "{line}");
                }
            });
        }

        Ok(Self {
            child,
            input,
            queued,
            output,
        })
    }
}

/// Feed the child's stdin from a queue so a child that stops reading never
/// blocks the session.
fn spawn_writer(mut stdin: ChildStdin, queued: Arc<AtomicUsize>) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(bytes) = rx.recv().await {
            let written = match stdin.write_all(&bytes).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            };
            queued.fetch_sub(bytes.len(), Ordering::SeqCst);
            if let Err(e) = written {
                warn!(error = %e, "extension host stdin write failed");
                break;
            }
        }
        debug!("extension host stdin closed");
    });
    tx
}

#[async_trait]
impl SessionRuntime for ExtensionHostRuntime {
    async fn deliver(&mut self, payload: Payload) {
        let Payload::Data(bytes) = payload else {
            debug!("ignoring non-data payload on extension host session");
            return;
        };
        let Some(input) = self.input.as_ref() else {
            return;
        };
        let queued = self.queued.fetch_add(bytes.len(), Ordering::SeqCst) + bytes.len();
        if queued > MAX_QUEUED_INPUT {
            warn!(queued, "extension host is not reading its input, stopping it");
            self.input = None;
            if let Err(e) = self.child.start_kill() {
                debug!(error = %e, "extension host already exited");
            }
            return;
        }
        if input.send(bytes).is_err() {
            self.input = None;
        }
    }

    async fn next_outgoing(&mut self) -> Option<Payload> {
        self.output.recv().await.map(Payload::Data)
    }

    async fn shutdown(&mut self) {
        self.input = None;
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "extension host already exited");
        }
        match self.child.wait().await {
            Ok(status) => info!(%status, "extension host exited"),
            Err(e) => warn!(error = %e, "failed to reap extension host"),
        }
    }
}
