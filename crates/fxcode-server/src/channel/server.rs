//! Per-session request multiplexer.
//!
//! Each call runs in its own task so a slow call never blocks the session;
//! each listen gets a forwarding task that relays stream items as events.
//! Both are tracked by request id so `Dispose` (or the session ending) can
//! abort them, which drops the underlying stream and releases whatever the
//! channel tied to its last listener.

use crate::channel::{ChannelContext, ChannelRegistry};
use fxcode_core::{ChannelRequest, ChannelResponse, ErrorPayload};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

type ActiveRequests = Arc<Mutex<HashMap<u32, AbortHandle>>>;

pub struct ChannelServer {
    registry: Arc<ChannelRegistry>,
    ctx: ChannelContext,
    outgoing: mpsc::UnboundedSender<ChannelResponse>,
    active: ActiveRequests,
}

impl ChannelServer {
    /// Returns the server and the stream of responses it produces.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        ctx: ChannelContext,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelResponse>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        let server = Self {
            registry,
            ctx,
            outgoing,
            active: Arc::new(Mutex::new(HashMap::new())),
        };
        (server, rx)
    }

    pub fn context(&self) -> &ChannelContext {
        &self.ctx
    }

    pub fn handle(&self, request: ChannelRequest) {
        match request {
            ChannelRequest::Call {
                id,
                channel,
                command,
                args,
            } => self.call(id, channel, command, args),
            ChannelRequest::Listen {
                id,
                channel,
                event,
                args,
            } => self.listen(id, channel, event, args),
            ChannelRequest::Dispose { id } => {
                let handle = self.active.lock().ok().and_then(|mut a| a.remove(&id));
                if let Some(handle) = handle {
                    debug!(id, "request disposed");
                    handle.abort();
                }
            }
        }
    }

    fn call(&self, id: u32, channel: String, command: String, args: serde_json::Value) {
        trace!(id, %channel, %command, "call");
        let registry = self.registry.clone();
        let ctx = self.ctx.clone();
        let outgoing = self.outgoing.clone();
        let active = self.active.clone();

        // Registration happens under the lock so the task's own removal
        // cannot run first.
        let Ok(mut guard) = self.active.lock() else {
            return;
        };
        let task = tokio::spawn(async move {
            let result = match registry.get(&channel) {
                Ok(handler) => handler.call(&ctx, &command, args).await,
                Err(e) => Err(e),
            };
            let response = match result {
                Ok(result) => ChannelResponse::Ok { id, result },
                Err(e) => {
                    debug!(id, %channel, %command, error = %e, "call failed");
                    ChannelResponse::Err {
                        id,
                        error: ErrorPayload::from(&e),
                    }
                }
            };
            if let Ok(mut a) = active.lock() {
                a.remove(&id);
            }
            let _ = outgoing.send(response);
        });
        guard.insert(id, task.abort_handle());
    }

    fn listen(&self, id: u32, channel: String, event: String, args: serde_json::Value) {
        trace!(id, %channel, %event, "listen");
        let stream = self
            .registry
            .get(&channel)
            .and_then(|handler| handler.listen(&self.ctx, &event, args));
        let mut stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                debug!(id, %channel, %event, error = %e, "listen failed");
                let _ = self.outgoing.send(ChannelResponse::Err {
                    id,
                    error: ErrorPayload::from(&e),
                });
                return;
            }
        };

        let outgoing = self.outgoing.clone();
        let active = self.active.clone();
        let Ok(mut guard) = self.active.lock() else {
            return;
        };
        let task = tokio::spawn(async move {
            while let Some(payload) = stream.next().await {
                if outgoing.send(ChannelResponse::Event { id, payload }).is_err() {
                    break;
                }
            }
            if let Ok(mut a) = active.lock() {
                a.remove(&id);
            }
        });
        guard.insert(id, task.abort_handle());
    }

    pub fn active_requests(&self) -> usize {
        self.active.lock().map(|a| a.len()).unwrap_or(0)
    }

    /// Abort every outstanding call and listener.
    pub fn dispose(&self) {
        let handles: Vec<AbortHandle> = match self.active.lock() {
            Ok(mut a) => a.drain().map(|(_, h)| h).collect(),
            Err(_) => return,
        };
        for handle in handles {
            handle.abort();
        }
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.dispose();
    }
}
