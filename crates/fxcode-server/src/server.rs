//! Core server: accepts upgraded sockets, runs the handshake and routes
//! each connection to a session, an extension host or a tunnel.

use crate::channel::extensions::ExtensionEnvironmentChannel;
use crate::channel::file::FileChannel;
use crate::channel::logger::LoggerChannel;
use crate::channel::telemetry::TelemetryChannel;
use crate::channel::terminal::{TerminalChannel, TerminalSettings};
use crate::channel::{
    ChannelContext, ChannelRegistry, ChannelServer, EXTENSIONS_CHANNEL, FILE_CHANNEL,
    LOGGER_CHANNEL, TELEMETRY_CHANNEL, TERMINAL_CHANNEL,
};
use crate::config::ServerConfig;
use crate::services::{
    DiskFileSystemProvider, Environment, LocalPtyHost, LogLevelService, ManifestScanner,
    TelemetrySink, TracingTelemetry,
};
use crate::session::{
    Admitted, ConnectionSession, ConnectionTable, ExtensionHostRuntime, ManagementRuntime,
    Rejected,
};
use crate::transport::{self, ConnectionQuery};
use fxcode_core::{
    BoxedSocket, ConnectionType, FxError, FxResult, Frame, HandshakeOk, HandshakeRequest, Payload,
    PersistentProtocol, ResourceTransformer, Transport,
};
use futures_util::future::join_all;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

const TUNNEL_READ_CHUNK: usize = 64 * 1024;

/// Fired once for every new management session.
#[derive(Clone)]
pub struct ClientConnected {
    pub token: String,
    pub session: Arc<ConnectionSession>,
}

impl std::fmt::Debug for ClientConnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnected").field("token", &self.token).finish_non_exhaustive()
    }
}

pub struct SessionServer {
    config: ServerConfig,
    environment: Arc<Environment>,
    registry: Arc<ChannelRegistry>,
    connections: Arc<ConnectionTable>,
    connected_tx: broadcast::Sender<ClientConnected>,
}

impl SessionServer {
    pub fn new(config: ServerConfig, environment: Arc<Environment>, registry: ChannelRegistry) -> Self {
        let (connected_tx, _) = broadcast::channel(16);
        Self {
            config,
            environment,
            registry: Arc::new(registry),
            connections: Arc::new(ConnectionTable::new()),
            connected_tx,
        }
    }

    /// Server with the file, terminal, extension-environment, telemetry and
    /// logger channels backed by the local machine.
    pub fn with_default_channels(config: ServerConfig) -> Self {
        Self::with_log_level(config, Arc::new(LogLevelService::default()))
    }

    /// Like [`with_default_channels`](Self::with_default_channels), with the
    /// `logger` channel driving `log_level`.
    pub fn with_log_level(config: ServerConfig, log_level: Arc<LogLevelService>) -> Self {
        let environment = Arc::new(Environment::from_config(&config.paths));
        let telemetry: Arc<dyn TelemetrySink> = Arc::new(TracingTelemetry::default());
        let language = config.extension_host.language.clone();

        let mut registry = ChannelRegistry::new();
        registry.register(
            FILE_CHANNEL,
            Arc::new(FileChannel::new(Arc::new(DiskFileSystemProvider::new()))),
        );
        registry.register(
            TERMINAL_CHANNEL,
            Arc::new(TerminalChannel::new(
                Arc::new(LocalPtyHost::new()),
                TerminalSettings {
                    locale: language.clone(),
                    ..TerminalSettings::default()
                },
            )),
        );
        registry.register(
            EXTENSIONS_CHANNEL,
            Arc::new(ExtensionEnvironmentChannel::new(
                environment.clone(),
                Arc::new(ManifestScanner::new()),
                telemetry.clone(),
                language,
            )),
        );
        registry.register(TELEMETRY_CHANNEL, Arc::new(TelemetryChannel::new(telemetry)));
        registry.register(LOGGER_CHANNEL, Arc::new(LoggerChannel::new(log_level)));

        Self::new(config, environment, registry)
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.environment
    }

    pub fn connections(&self) -> &Arc<ConnectionTable> {
        &self.connections
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientConnected> {
        self.connected_tx.subscribe()
    }

    /// Listen on the configured address until the listener fails.
    pub async fn run(self: Arc<Self>) -> FxResult<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .map_err(|e| FxError::Other(format!("invalid listen address: {e}")))?;
        let mut incoming = transport::start_listener(addr).await?;
        info!(
            addr = %addr,
            authority = %self.config.remote_authority,
            channels = ?self.registry.names().collect::<Vec<_>>(),
            "server ready"
        );

        let announcer = tokio::spawn(announce_clients(self.subscribe(), self.connections.clone()));

        while let Some(conn) = incoming.recv().await {
            let server = self.clone();
            tokio::spawn(async move {
                server.accept_connection(conn.transport, conn.query).await;
            });
        }
        announcer.abort();
        Ok(())
    }

    /// Dispose every session and wait up to `timeout` for them to finish
    /// tearing down. Returns how many sessions were closed.
    pub async fn shutdown(&self, timeout: Duration) -> usize {
        let sessions = self.connections.drain();
        for session in &sessions {
            session.dispose();
        }
        if tokio::time::timeout(timeout, join_all(sessions.iter().map(|s| s.closed())))
            .await
            .is_err()
        {
            warn!(sessions = sessions.len(), "sessions still closing at shutdown");
        }
        sessions.len()
    }

    /// Upgrade a raw socket and serve it.
    pub async fn accept_socket(self: &Arc<Self>, socket: BoxedSocket) -> FxResult<()> {
        let (query, transport) = transport::accept_upgrade(socket).await?;
        self.accept_connection(transport, query).await;
        Ok(())
    }

    /// Run the handshake on an upgraded transport and route it. Failures
    /// are reported to the client before the transport is closed.
    pub async fn accept_connection(&self, mut transport: Transport, query: ConnectionQuery) {
        let token = query.reconnection_token.clone();
        let handshake = match tokio::time::timeout(self.config.handshake_timeout, transport.recv()).await {
            Ok(Ok(Some(Frame::Handshake(request)))) => request,
            Ok(Ok(Some(other))) => {
                let error = FxError::Handshake(format!("expected handshake, got {other:?}"));
                warn!(token = %token, error = %error, "handshake failed");
                transport.reject(&error).await;
                return;
            }
            Ok(Ok(None)) => {
                debug!(token = %token, "socket closed before handshake");
                return;
            }
            Ok(Err(e)) => {
                warn!(token = %token, error = %e, "handshake failed");
                transport.reject(&e).await;
                return;
            }
            Err(_) => {
                warn!(token = %token, "handshake timed out");
                transport.reject(&FxError::Timeout).await;
                return;
            }
        };

        if let Some(commit) = handshake.commit.as_deref() {
            if !self.config.commit.is_empty() && commit != self.config.commit {
                warn!(client = commit, server = %self.config.commit, "Version mismatch");
            }
        }

        let kind = handshake.desired_connection_type;
        debug!(
            token = %token,
            kind = %kind,
            reconnection = query.reconnection,
            path = ?query.path,
            "handshake received"
        );

        let admitted = match kind {
            ConnectionType::Management => self.admit_management(&handshake, &query, transport),
            ConnectionType::ExtensionHost => self.admit_extension_host(&handshake, &query, transport),
            ConnectionType::Tunnel => {
                run_tunnel(transport, &handshake.args).await;
                return;
            }
        };

        match admitted {
            Ok(Admitted::Created(session)) => {
                info!(token = %token, kind = %kind, "session created");
                self.track(session.clone());
                if kind == ConnectionType::Management {
                    let _ = self.connected_tx.send(ClientConnected {
                        token: token.clone(),
                        session,
                    });
                }
            }
            Ok(Admitted::Resumed(_)) => {
                info!(token = %token, kind = %kind, "session reconnected");
            }
            Err(Rejected { error, mut transport }) => {
                warn!(token = %token, kind = %kind, error = %error, "connection rejected");
                transport.reject(&error).await;
                return;
            }
        }

        let swept = self
            .connections
            .sweep_offline(kind, self.config.max_extra_offline_connections);
        if swept > 0 {
            debug!(kind = %kind, swept, "older offline sessions disposed");
        }
    }

    fn remote_authority(&self, handshake: &HandshakeRequest) -> String {
        handshake
            .args
            .get("remoteAuthority")
            .and_then(Value::as_str)
            .filter(|a| !a.is_empty())
            .map_or_else(|| self.config.remote_authority.clone(), str::to_string)
    }

    fn admit_management(
        &self,
        handshake: &HandshakeRequest,
        query: &ConnectionQuery,
        transport: Transport,
    ) -> Result<Admitted, Rejected> {
        let authority = self.remote_authority(handshake);
        let token = query.reconnection_token.clone();
        let registry = self.registry.clone();
        let roots = self.environment.resource_roots();
        let grace = self.config.reconnection_grace;

        self.connections.admit(
            ConnectionType::Management,
            &query.reconnection_token,
            query.reconnection,
            transport,
            move |transport| {
                let ctx = ChannelContext {
                    transformer: Arc::new(ResourceTransformer::new(&authority, roots)),
                    remote_authority: authority,
                    token: token.clone(),
                };
                let (server, responses) = ChannelServer::new(registry, ctx);
                Ok(ConnectionSession::start(
                    token,
                    ConnectionType::Management,
                    transport,
                    Box::new(ManagementRuntime::new(server, responses)),
                    grace,
                ))
            },
        )
    }

    fn admit_extension_host(
        &self,
        handshake: &HandshakeRequest,
        query: &ConnectionQuery,
        transport: Transport,
    ) -> Result<Admitted, Rejected> {
        let config = &self.config.extension_host;
        let language = handshake
            .args
            .get("language")
            .and_then(Value::as_str)
            .unwrap_or(&config.language)
            .to_string();
        let token = query.reconnection_token.clone();
        let grace = self.config.reconnection_grace;

        self.connections.admit(
            ConnectionType::ExtensionHost,
            &query.reconnection_token,
            query.reconnection,
            transport,
            |transport| match ExtensionHostRuntime::spawn(config, &language, &handshake.args) {
                Ok(runtime) => Ok(ConnectionSession::start(
                    token,
                    ConnectionType::ExtensionHost,
                    transport,
                    Box::new(runtime),
                    grace,
                )),
                Err(error) => Err(Rejected { error, transport }),
            },
        )
    }

    /// Drop the table entry once the session is gone for good.
    fn track(&self, session: Arc<ConnectionSession>) {
        let connections = self.connections.clone();
        tokio::spawn(async move {
            session.closed().await;
            connections.remove(&session);
        });
    }
}

/// Log every new management client with the number now connected.
async fn announce_clients(mut connected: broadcast::Receiver<ClientConnected>, connections: Arc<ConnectionTable>) {
    loop {
        match connected.recv().await {
            Ok(client) => {
                let active = connections.len(ConnectionType::Management);
                info!(token = %client.token, active, "client connected");
            }
            Err(RecvError::Lagged(missed)) => debug!(missed, "client announcements skipped"),
            Err(RecvError::Closed) => break,
        }
    }
}

/// Pipe `Data` payloads between the client and a local TCP endpoint named
/// by the handshake arguments (`{host?, port}`).
async fn run_tunnel(mut transport: Transport, args: &Value) {
    let host = args
        .get("host")
        .and_then(Value::as_str)
        .unwrap_or("127.0.0.1")
        .to_string();
    let Some(port) = args
        .get("port")
        .and_then(Value::as_u64)
        .and_then(|p| u16::try_from(p).ok())
    else {
        transport
            .reject(&FxError::Handshake("tunnel requires a port".into()))
            .await;
        return;
    };

    let stream = match TcpStream::connect((host.as_str(), port)).await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(host = %host, port, error = %e, "tunnel connect failed");
            transport.reject(&FxError::Io(e)).await;
            return;
        }
    };
    if transport
        .send(&Frame::Ok(HandshakeOk { reconnection: false }))
        .await
        .is_err()
    {
        return;
    }
    info!(host = %host, port, "tunnel opened");

    let (mut rd, mut wr) = stream.into_split();
    let mut protocol = PersistentProtocol::new();
    let mut buf = vec![0u8; TUNNEL_READ_CHUNK];

    loop {
        tokio::select! {
            frame = transport.recv() => match frame {
                Ok(Some(Frame::Regular { seq, ack, payload })) => {
                    if let Some(Payload::Data(bytes)) = protocol.accept(seq, ack, payload) {
                        if wr.write_all(&bytes).await.is_err() {
                            break;
                        }
                    }
                    if transport.send(&protocol.ack_frame()).await.is_err() {
                        break;
                    }
                }
                Ok(Some(Frame::Ack { ack })) => protocol.acknowledge(ack),
                Ok(Some(Frame::KeepAlive)) => {}
                Ok(Some(Frame::Disconnect { .. })) | Ok(None) => break,
                Ok(Some(other)) => debug!(frame = ?other, "ignoring frame on tunnel"),
                Err(e) => {
                    debug!(error = %e, "tunnel transport error");
                    break;
                }
            },
            read = rd.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let frame = protocol.enqueue(Payload::Data(buf[..n].to_vec()));
                    if transport.send(&frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "tunnel endpoint read failed");
                    break;
                }
            },
        }
    }

    let _ = transport.send(&Frame::Disconnect { reason: None }).await;
    transport.close().await;
    info!(host = %host, port, "tunnel closed");
}
