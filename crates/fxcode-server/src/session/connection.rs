//! One logical client connection that survives socket churn.
//!
//! A session task owns the current transport, the sequenced protocol state
//! and the [`SessionRuntime`]. When the socket drops the session goes
//! offline and keeps collecting outgoing payloads until a new transport is
//! attached through [`ConnectionSession::reconnect`], the reconnection grace
//! period runs out, or the session is disposed.

use crate::session::SessionRuntime;
use fxcode_core::{ConnectionType, FxError, Frame, HandshakeOk, PersistentProtocol, Transport};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Interval between keep-alive frames on an idle socket.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(5);

/// A transport refused by a session or the connection table, handed back so
/// the caller can send the error to the client.
pub struct Rejected {
    pub error: FxError,
    pub transport: Transport,
}

impl std::fmt::Debug for Rejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rejected").field("error", &self.error).finish()
    }
}

#[derive(Debug, Default)]
struct SessionState {
    /// When the transport was lost; `None` while online.
    offline_since: Option<Instant>,
    /// Set once the session has been torn down.
    disposed: bool,
    /// Transports handed to [`ConnectionSession::reconnect`] that the
    /// session task has not adopted yet.
    pending_attaches: usize,
}

pub struct ConnectionSession {
    token: String,
    kind: ConnectionType,
    state: Mutex<SessionState>,
    attach_tx: mpsc::UnboundedSender<Transport>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

enum PumpExit {
    /// A newer transport took over.
    Replaced(Transport),
    /// The socket dropped without a goodbye.
    Offline,
    /// The client said goodbye.
    Closed,
    Shutdown,
    RuntimeEnded,
}

impl ConnectionSession {
    /// Create a session on `transport` and spawn the task that drives it.
    pub fn start(
        token: impl Into<String>,
        kind: ConnectionType,
        transport: Transport,
        runtime: Box<dyn SessionRuntime>,
        grace: Duration,
    ) -> Arc<Self> {
        let (attach_tx, attach_rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            token: token.into(),
            kind,
            state: Mutex::new(SessionState::default()),
            attach_tx,
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
        });
        let task = session.clone();
        tokio::spawn(async move { task.run(transport, attach_rx, runtime, grace).await });
        session
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn kind(&self) -> ConnectionType {
        self.kind
    }

    pub fn offline_since(&self) -> Option<Instant> {
        self.state.lock().ok().and_then(|s| s.offline_since)
    }

    pub fn is_offline(&self) -> bool {
        self.offline_since().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().map(|s| s.disposed).unwrap_or(true)
    }

    /// Attach a new transport. The session is marked online immediately so
    /// an offline sweep running concurrently leaves it alone. An online
    /// session drops its current socket in favour of the new one.
    pub fn reconnect(&self, transport: Transport) -> Result<(), Rejected> {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => {
                return Err(Rejected {
                    error: FxError::Other("session state poisoned".into()),
                    transport,
                })
            }
        };
        if state.disposed {
            return Err(Rejected {
                error: FxError::SessionDisposed(self.token.clone()),
                transport,
            });
        }
        state.offline_since = None;
        state.pending_attaches += 1;
        self.attach_tx.send(transport).map_err(|e| {
            state.pending_attaches -= 1;
            Rejected {
                error: FxError::SessionDisposed(self.token.clone()),
                transport: e.0,
            }
        })
    }

    /// Tear the session down permanently.
    pub fn dispose(&self) {
        self.shutdown.cancel();
    }

    /// Resolves once, when the session has been torn down. Transport loss
    /// alone does not close a session.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    /// Losing a socket while a newer transport is queued leaves the session
    /// online.
    fn set_offline(&self) {
        if let Ok(mut state) = self.state.lock() {
            if !state.disposed && state.pending_attaches == 0 && state.offline_since.is_none() {
                state.offline_since = Some(Instant::now());
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        transport: Transport,
        mut attach_rx: mpsc::UnboundedReceiver<Transport>,
        mut runtime: Box<dyn SessionRuntime>,
        grace: Duration,
    ) {
        let mut protocol = PersistentProtocol::new();
        let mut current = Some(transport);
        let mut reconnection = false;

        loop {
            if let Some(mut transport) = current.take() {
                let exit = match self.adopt(&mut transport, reconnection, &protocol).await {
                    Ok(()) => {
                        self.pump(&mut transport, &mut protocol, runtime.as_mut(), &mut attach_rx)
                            .await
                    }
                    Err(e) => {
                        debug!(token = %self.token, error = %e, "transport lost during attach");
                        PumpExit::Offline
                    }
                };
                match exit {
                    PumpExit::Replaced(next) => {
                        debug!(token = %self.token, "transport replaced");
                        transport.close().await;
                        current = Some(next);
                        reconnection = true;
                        continue;
                    }
                    PumpExit::Offline => {
                        info!(token = %self.token, kind = %self.kind, "session offline");
                        self.set_offline();
                    }
                    PumpExit::Closed | PumpExit::Shutdown | PumpExit::RuntimeEnded => {
                        let _ = transport
                            .send(&Frame::Disconnect { reason: None })
                            .await;
                        transport.close().await;
                        break;
                    }
                }
            }

            match self
                .wait_offline(&mut protocol, runtime.as_mut(), &mut attach_rx, grace)
                .await
            {
                Some(next) => {
                    current = Some(next);
                    reconnection = true;
                }
                None => break,
            }
        }

        self.teardown(runtime, attach_rx).await;
    }

    /// Confirm the handshake on a fresh transport and replay everything the
    /// client has not acknowledged.
    async fn adopt(
        &self,
        transport: &mut Transport,
        reconnection: bool,
        protocol: &PersistentProtocol,
    ) -> Result<(), FxError> {
        if let Ok(mut state) = self.state.lock() {
            state.offline_since = None;
            if reconnection {
                state.pending_attaches = state.pending_attaches.saturating_sub(1);
            }
        }
        transport
            .send(&Frame::Ok(HandshakeOk { reconnection }))
            .await?;
        let replay = protocol.replay();
        if reconnection {
            info!(token = %self.token, kind = %self.kind, replayed = replay.len(), "session resumed");
        }
        for frame in &replay {
            transport.send(frame).await?;
        }
        Ok(())
    }

    async fn pump(
        &self,
        transport: &mut Transport,
        protocol: &mut PersistentProtocol,
        runtime: &mut dyn SessionRuntime,
        attach_rx: &mut mpsc::UnboundedReceiver<Transport>,
    ) -> PumpExit {
        let mut keepalive =
            tokio::time::interval_at(tokio::time::Instant::now() + KEEPALIVE_PERIOD, KEEPALIVE_PERIOD);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return PumpExit::Shutdown,

                next = attach_rx.recv() => {
                    return match next {
                        Some(next) => PumpExit::Replaced(next),
                        None => PumpExit::Shutdown,
                    };
                }

                frame = transport.recv() => match frame {
                    Ok(Some(Frame::Regular { seq, ack, payload })) => {
                        if let Some(payload) = protocol.accept(seq, ack, payload) {
                            runtime.deliver(payload).await;
                        }
                        if transport.send(&protocol.ack_frame()).await.is_err() {
                            return PumpExit::Offline;
                        }
                    }
                    Ok(Some(Frame::Ack { ack })) => protocol.acknowledge(ack),
                    Ok(Some(Frame::KeepAlive)) => {}
                    Ok(Some(Frame::Disconnect { reason })) => {
                        info!(token = %self.token, reason = ?reason, "client disconnected");
                        return PumpExit::Closed;
                    }
                    Ok(Some(other)) => {
                        warn!(token = %self.token, frame = ?other, "unexpected frame");
                    }
                    Ok(None) => return PumpExit::Offline,
                    Err(e) => {
                        debug!(token = %self.token, error = %e, "transport error");
                        return PumpExit::Offline;
                    }
                },

                outgoing = runtime.next_outgoing() => match outgoing {
                    Some(payload) => {
                        let frame = protocol.enqueue(payload);
                        if transport.send(&frame).await.is_err() {
                            return PumpExit::Offline;
                        }
                    }
                    None => return PumpExit::RuntimeEnded,
                },

                _ = keepalive.tick() => {
                    if transport.send(&Frame::KeepAlive).await.is_err() {
                        return PumpExit::Offline;
                    }
                }
            }
        }
    }

    /// Wait for a new transport while buffering outgoing payloads. Returns
    /// `None` when the session should be torn down.
    async fn wait_offline(
        &self,
        protocol: &mut PersistentProtocol,
        runtime: &mut dyn SessionRuntime,
        attach_rx: &mut mpsc::UnboundedReceiver<Transport>,
        grace: Duration,
    ) -> Option<Transport> {
        let deadline = tokio::time::sleep(grace);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                next = attach_rx.recv() => return next,
                _ = &mut deadline => {
                    info!(token = %self.token, grace_secs = grace.as_secs(), "reconnection grace expired");
                    return None;
                }
                outgoing = runtime.next_outgoing() => match outgoing {
                    Some(payload) => {
                        protocol.enqueue(payload);
                    }
                    None => return None,
                },
            }
        }
    }

    async fn teardown(
        &self,
        mut runtime: Box<dyn SessionRuntime>,
        mut attach_rx: mpsc::UnboundedReceiver<Transport>,
    ) {
        if let Ok(mut state) = self.state.lock() {
            state.disposed = true;
            state.offline_since = None;
        }
        runtime.shutdown().await;

        attach_rx.close();
        while let Ok(mut late) = attach_rx.try_recv() {
            late.reject(&FxError::SessionDisposed(self.token.clone()))
                .await;
        }
        info!(token = %self.token, kind = %self.kind, "session closed");
        self.closed.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionTable;
    use async_trait::async_trait;
    use fxcode_core::Payload;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    /// Echoes data payloads back; `outgoing` lets tests inject payloads.
    struct Echo {
        tx: UnboundedSender<Payload>,
        rx: UnboundedReceiver<Payload>,
        shut: Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl SessionRuntime for Echo {
        async fn deliver(&mut self, payload: Payload) {
            let _ = self.tx.send(payload);
        }
        async fn next_outgoing(&mut self) -> Option<Payload> {
            self.rx.recv().await
        }
        async fn shutdown(&mut self) {
            self.shut.store(true, std::sync::atomic::Ordering::SeqCst);
        }
    }

    fn echo() -> (Box<dyn SessionRuntime>, UnboundedSender<Payload>, Arc<std::sync::atomic::AtomicBool>) {
        let (tx, rx) = unbounded_channel();
        let shut = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let runtime = Echo {
            tx: tx.clone(),
            rx,
            shut: shut.clone(),
        };
        (Box::new(runtime), tx, shut)
    }

    fn pipe() -> (Transport, Transport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (Transport::raw(Box::new(a)), Transport::raw(Box::new(b)))
    }

    /// Next frame that is not a keep-alive or ack.
    async fn next_frame(t: &mut Transport) -> Option<Frame> {
        loop {
            match t.recv().await.unwrap() {
                Some(Frame::KeepAlive) | Some(Frame::Ack { .. }) => continue,
                other => return other,
            }
        }
    }

    fn regular(seq: u64, payload: &[u8]) -> Frame {
        Frame::Regular {
            seq,
            ack: 0,
            payload: Payload::Data(payload.to_vec()),
        }
    }

    #[tokio::test]
    async fn echoes_and_confirms_handshake() {
        let (server, mut client) = pipe();
        let (runtime, _, _) = echo();
        let _session = ConnectionSession::start("t", ConnectionType::Management, server, runtime, Duration::from_secs(60));

        assert_eq!(
            next_frame(&mut client).await,
            Some(Frame::Ok(HandshakeOk { reconnection: false }))
        );
        client.send(&regular(1, b"hi")).await.unwrap();
        match next_frame(&mut client).await {
            Some(Frame::Regular { seq: 1, payload, .. }) => assert_eq!(payload, Payload::Data(b"hi".to_vec())),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn offline_output_is_replayed_on_reconnect() {
        let (server, mut client) = pipe();
        let (runtime, inject, _) = echo();
        let session = ConnectionSession::start("t", ConnectionType::Management, server, runtime, Duration::from_secs(60));
        next_frame(&mut client).await;

        drop(client);
        for _ in 0..100 {
            if session.is_offline() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(session.is_offline());
        inject.send(Payload::Data(b"while away".to_vec())).unwrap();

        let (server, mut client) = pipe();
        session.reconnect(server).unwrap();
        assert!(!session.is_offline());
        assert_eq!(
            next_frame(&mut client).await,
            Some(Frame::Ok(HandshakeOk { reconnection: true }))
        );
        match next_frame(&mut client).await {
            Some(Frame::Regular { payload, .. }) => assert_eq!(payload, Payload::Data(b"while away".to_vec())),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn late_socket_loss_leaves_a_resuming_session_alone() {
        let table = ConnectionTable::new();
        let kind = ConnectionType::Management;
        let (server, mut client) = pipe();
        let (runtime, _, _) = echo();
        let admitted = table
            .admit(kind, "t", false, server, |transport| {
                Ok(ConnectionSession::start("t", kind, transport, runtime, Duration::from_secs(60)))
            })
            .unwrap();
        next_frame(&mut client).await;
        let session = admitted.session().clone();

        let (server, mut resumed) = pipe();
        table
            .admit(kind, "t", true, server, |_| unreachable!("token is live"))
            .unwrap();
        // The old socket's loss surfaces only after the new one was queued.
        session.set_offline();
        drop(client);

        assert!(!session.is_offline());
        assert_eq!(table.sweep_offline(kind, 0), 0);
        assert_eq!(
            next_frame(&mut resumed).await,
            Some(Frame::Ok(HandshakeOk { reconnection: true }))
        );
        assert!(!session.is_disposed());
        assert!(table.get(kind, "t").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_closes_the_session() {
        let (server, client) = pipe();
        let (runtime, _, shut) = echo();
        let session = ConnectionSession::start("t", ConnectionType::Management, server, runtime, Duration::from_secs(30));
        drop(client);

        tokio::time::timeout(Duration::from_secs(120), session.closed())
            .await
            .expect("session should close after the grace period");
        assert!(session.is_disposed());
        assert!(shut.load(std::sync::atomic::Ordering::SeqCst));

        let (server, _client) = pipe();
        let rejected = session.reconnect(server).unwrap_err();
        assert_eq!(rejected.error.code(), "SessionDisposed");
    }

    #[tokio::test]
    async fn disconnect_frame_closes_permanently() {
        let (server, mut client) = pipe();
        let (runtime, _, _) = echo();
        let session = ConnectionSession::start("t", ConnectionType::Management, server, runtime, Duration::from_secs(60));
        next_frame(&mut client).await;
        client.send(&Frame::Disconnect { reason: Some("bye".into()) }).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.closed()).await.unwrap();
        assert!(session.is_disposed());
    }
}
