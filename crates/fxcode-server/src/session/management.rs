//! Management sessions carry channel requests and responses.

use crate::channel::ChannelServer;
use crate::session::SessionRuntime;
use async_trait::async_trait;
use fxcode_core::{ChannelResponse, Payload};
use tokio::sync::mpsc;
use tracing::debug;

pub struct ManagementRuntime {
    server: ChannelServer,
    responses: mpsc::UnboundedReceiver<ChannelResponse>,
}

impl ManagementRuntime {
    pub fn new(server: ChannelServer, responses: mpsc::UnboundedReceiver<ChannelResponse>) -> Self {
        Self { server, responses }
    }
}

#[async_trait]
impl SessionRuntime for ManagementRuntime {
    async fn deliver(&mut self, payload: Payload) {
        match payload {
            Payload::Request(request) => self.server.handle(request),
            other => debug!(payload = ?other, "ignoring non-request payload on management session"),
        }
    }

    async fn next_outgoing(&mut self) -> Option<Payload> {
        self.responses.recv().await.map(Payload::Response)
    }

    async fn shutdown(&mut self) {
        self.server.dispose();
    }
}
