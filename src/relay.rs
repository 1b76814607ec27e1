//! Relay engine
//!
//! One [`RelayEngine::serve`] call drives one client connection from accept to
//! teardown. It is transport-agnostic: inbound envelopes arrive already decoded
//! on a `Stream`, outbound messages leave through a `Sink`. The transport
//! listener plugs a WebSocket into both ends; tests plug in plain channels.
//!
//! Per-client lifecycle: `Connected(Unassigned) -> Connected(Sender|Receiver)
//! -> Disconnected`. The first `RoleDeclare` is consumed here, everything else
//! is routed through the [`SessionRegistry`] to the paired peer.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::model::client::{ClientHandle, ClientId};
use crate::model::envelope::{DecodeError, Envelope, Role};
use crate::model::propagated::{CloseReason, Propagated};
use crate::registry::{Forwarded, NotPaired, SessionRegistry};

/// Per-connection engine settings.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Capacity of each client's outbound queue.
    pub outbound_capacity: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
        }
    }
}

/// Upper bound on flushing queued messages and the close notice to a client
/// that is going away.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// How a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disconnect {
    /// The client closed the stream.
    Closed,
    /// Another connection took this client's role.
    Superseded,
    /// The client did not keep up with its outbound queue.
    Lagging,
    /// The client sent something undecodable.
    ProtocolError(DecodeError),
    /// Writing to the client failed.
    SendFailed(String),
}

impl Disconnect {
    fn evicted(reason: CloseReason) -> Disconnect {
        match reason {
            CloseReason::SlowConsumer => Disconnect::Lagging,
            CloseReason::RoleSuperseded | CloseReason::ProtocolError => Disconnect::Superseded,
        }
    }

    fn close_reason(&self) -> Option<CloseReason> {
        match self {
            Disconnect::Superseded => Some(CloseReason::RoleSuperseded),
            Disconnect::Lagging => Some(CloseReason::SlowConsumer),
            Disconnect::ProtocolError(_) => Some(CloseReason::ProtocolError),
            Disconnect::Closed | Disconnect::SendFailed(_) => None,
        }
    }
}

impl fmt::Display for Disconnect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disconnect::Closed => f.write_str("closed by client"),
            Disconnect::Superseded => f.write_str("role superseded"),
            Disconnect::Lagging => f.write_str("outbound queue overflowed"),
            Disconnect::ProtocolError(e) => write!(f, "protocol error: {e}"),
            Disconnect::SendFailed(e) => write!(f, "send failed: {e}"),
        }
    }
}

/// Connection-local state, owned by the serving task.
struct Connection {
    id: ClientId,
    role: Option<Role>,
}

#[derive(Debug, Clone)]
pub struct RelayEngine {
    registry: Arc<SessionRegistry>,
    options: EngineOptions,
}

impl RelayEngine {
    pub fn new(registry: Arc<SessionRegistry>, options: EngineOptions) -> RelayEngine {
        RelayEngine { registry, options }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Serve one client until it disconnects, is superseded, or misbehaves.
    ///
    /// The client is registered on entry and removed on every exit path.
    pub async fn serve<St, Si>(&self, mut inbound: St, mut outbound: Si) -> Disconnect
    where
        St: Stream<Item = Result<Envelope, DecodeError>> + Unpin,
        Si: Sink<Propagated> + Unpin,
        Si::Error: fmt::Display,
    {
        let (tx, mut rx) = mpsc::channel(self.options.outbound_capacity.max(1));
        let id = ClientId::next();
        let handle = ClientHandle::new(id, tx);
        self.registry.register(handle.clone());
        handle.deliver(Propagated::Welcome(id));
        info!("Client({}) connected", id);

        let mut conn = Connection { id, role: None };

        let reason = loop {
            tokio::select! {
                biased;

                reason = handle.evicted() => break Disconnect::evicted(reason),

                Some(msg) = rx.recv() => {
                    // A stalled socket must not keep an eviction from landing.
                    let sent = tokio::select! {
                        biased;
                        reason = handle.evicted() => Err(Disconnect::evicted(reason)),
                        res = outbound.send(msg) => {
                            res.map_err(|e| Disconnect::SendFailed(e.to_string()))
                        }
                    };
                    if let Err(reason) = sent {
                        break reason;
                    }
                }

                frame = inbound.next() => match frame {
                    Some(Ok(envelope)) => self.handle_envelope(&mut conn, &handle, envelope),
                    Some(Err(e)) => break Disconnect::ProtocolError(e),
                    None => break Disconnect::Closed,
                },
            }
        };

        if let Some(peer) = self.registry.remove(id) {
            debug!("Client({}) left, Client({}) is unpaired", id, peer);
        }

        let teardown = async {
            // Anything queued before removal still goes out, unless the
            // client is the reason the queue filled up.
            if !matches!(reason, Disconnect::SendFailed(_) | Disconnect::Lagging) {
                while let Ok(msg) = rx.try_recv() {
                    if outbound.send(msg).await.is_err() {
                        break;
                    }
                }
            }
            if !matches!(reason, Disconnect::SendFailed(_)) {
                if let Some(close) = reason.close_reason() {
                    let _ = outbound.send(Propagated::Close(close)).await;
                }
            }
            let _ = outbound.close().await;
        };
        if tokio::time::timeout(TEARDOWN_TIMEOUT, teardown).await.is_err() {
            debug!("Client({}) did not take its close in time", id);
        }

        let lifetime = chrono::Utc::now() - handle.connected_at;
        info!(
            "Client({}) disconnected after {}s: {}",
            id,
            lifetime.num_seconds(),
            reason
        );
        reason
    }

    fn handle_envelope(&self, conn: &mut Connection, handle: &ClientHandle, envelope: Envelope) {
        match envelope {
            Envelope::RoleDeclare(role) => self.declare(conn, handle, role),
            routed => self.route(conn, routed),
        }
    }

    fn declare(&self, conn: &mut Connection, handle: &ClientHandle, role: Role) {
        match self.registry.declare_role(conn.id, role) {
            Ok(assignment) => {
                conn.role = Some(role);
                info!("Client({}) declared {}", conn.id, role);

                if let Some(previous) = assignment.superseded {
                    info!(
                        "Client({}) superseded as {} by Client({})",
                        previous.id, role, conn.id
                    );
                    previous.evict(CloseReason::RoleSuperseded);
                }
                if let Some(peer) = assignment.peer {
                    info!("🔗 Session paired: {} Client({}) <-> Client({})", role, conn.id, peer);
                }
                if assignment.replayed_offer {
                    debug!("Client({}) got the buffered offer", conn.id);
                }
            }
            Err(rejected) => {
                warn!(
                    "Client({}) role declaration as {} rejected: {}",
                    conn.id, role, rejected
                );
                handle.deliver(Propagated::Rejected(rejected.as_str().to_string()));
            }
        }
    }

    fn route(&self, conn: &Connection, envelope: Envelope) {
        let kind = envelope.kind();

        if conn.role.is_none() {
            warn!(
                "ProtocolViolation: Client({}) sent {} before declaring a role, dropped",
                conn.id, kind
            );
            return;
        }

        match self.registry.forward(conn.id, envelope) {
            Ok(Forwarded::Delivered(peer)) => {
                debug!("{} Client({}) -> Client({})", kind, conn.id, peer);
            }
            Ok(Forwarded::Dropped(peer)) => {
                debug!("{} Client({}) -> Client({}) dropped", kind, conn.id, peer);
            }
            Ok(Forwarded::Buffered) => {
                debug!("{} from Client({}) buffered until a receiver joins", kind, conn.id);
            }
            Err(NotPaired) => {
                debug!("{} from Client({}) dropped, not paired", kind, conn.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryOptions;
    use futures::channel::mpsc as chan;
    use serde_json::json;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    /// An in-memory client: push envelopes in, read propagated messages out.
    struct TestClient {
        id: ClientId,
        tx: chan::UnboundedSender<Result<Envelope, DecodeError>>,
        rx: chan::UnboundedReceiver<Propagated>,
        task: JoinHandle<Disconnect>,
    }

    impl TestClient {
        async fn connect(engine: &RelayEngine) -> TestClient {
            let (tx, inbound) = chan::unbounded();
            let (outbound, mut rx) = chan::unbounded();
            let engine = engine.clone();
            let task = tokio::spawn(async move { engine.serve(inbound, outbound).await });

            let id = match next(&mut rx).await {
                Some(Propagated::Welcome(id)) => id,
                other => panic!("expected Welcome, got {other:?}"),
            };
            TestClient { id, tx, rx, task }
        }

        fn send(&self, envelope: Envelope) {
            self.tx.unbounded_send(Ok(envelope)).unwrap();
        }

        async fn recv(&mut self) -> Option<Propagated> {
            next(&mut self.rx).await
        }

        /// Nothing arrives within a short window.
        async fn assert_quiet(&mut self) {
            let got = timeout(Duration::from_millis(50), self.rx.next()).await;
            assert!(got.is_err(), "unexpected message: {got:?}");
        }

        async fn declare(&self, engine: &RelayEngine, role: Role) {
            self.send(Envelope::RoleDeclare(role));
            wait_for(|| engine.registry().state_of(self.id).and_then(|s| s.role()) == Some(role))
                .await;
        }
    }

    async fn next(rx: &mut chan::UnboundedReceiver<Propagated>) -> Option<Propagated> {
        timeout(Duration::from_secs(2), rx.next())
            .await
            .expect("timed out waiting for a message")
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition never became true");
    }

    fn engine() -> RelayEngine {
        let registry = Arc::new(SessionRegistry::new(RegistryOptions::default()));
        RelayEngine::new(registry, EngineOptions::default())
    }

    #[tokio::test]
    async fn offer_reaches_the_receiver_verbatim() {
        let engine = engine();
        let x = TestClient::connect(&engine).await;
        let mut y = TestClient::connect(&engine).await;

        x.declare(&engine, Role::Sender).await;
        y.declare(&engine, Role::Receiver).await;

        x.send(Envelope::Offer(json!("sdp1")));
        assert_eq!(
            y.recv().await,
            Some(Propagated::Relay(Envelope::Offer(json!("sdp1"))))
        );
    }

    #[tokio::test]
    async fn superseded_sender_is_closed() {
        let engine = engine();
        let mut x = TestClient::connect(&engine).await;
        let z = TestClient::connect(&engine).await;

        x.declare(&engine, Role::Sender).await;
        z.declare(&engine, Role::Sender).await;

        assert_eq!(
            x.recv().await,
            Some(Propagated::Close(CloseReason::RoleSuperseded))
        );
        assert_eq!(x.recv().await, None);
        assert_eq!(x.task.await.unwrap(), Disconnect::Superseded);
        assert_eq!(engine.registry().snapshot().sender, Some(z.id));
    }

    #[tokio::test]
    async fn unpaired_offer_goes_nowhere() {
        let registry = Arc::new(SessionRegistry::new(RegistryOptions {
            replay_offer: false,
            ..RegistryOptions::default()
        }));
        let engine = RelayEngine::new(registry, EngineOptions::default());
        let mut x = TestClient::connect(&engine).await;
        let mut w = TestClient::connect(&engine).await;

        x.declare(&engine, Role::Sender).await;
        x.send(Envelope::Offer(json!("sdp1")));

        x.assert_quiet().await;
        w.assert_quiet().await;
        assert_eq!(engine.registry().snapshot().sender, Some(x.id));
    }

    #[tokio::test]
    async fn peer_left_then_candidates_are_dropped() {
        let engine = engine();
        let mut x = TestClient::connect(&engine).await;
        let y = TestClient::connect(&engine).await;

        x.declare(&engine, Role::Sender).await;
        y.declare(&engine, Role::Receiver).await;

        drop(y.tx);
        assert_eq!(y.task.await.unwrap(), Disconnect::Closed);
        assert_eq!(x.recv().await, Some(Propagated::PeerLeft));

        x.send(Envelope::IceCandidate(json!({"candidate": "c1"})));
        x.assert_quiet().await;
        assert_eq!(engine.registry().peer_of(x.id), Err(NotPaired));
    }

    #[tokio::test]
    async fn envelopes_before_role_are_ignored() {
        let engine = engine();
        let x = TestClient::connect(&engine).await;
        let mut y = TestClient::connect(&engine).await;
        y.declare(&engine, Role::Receiver).await;

        x.send(Envelope::Offer(json!("too early")));
        x.declare(&engine, Role::Sender).await;
        x.send(Envelope::Offer(json!("sdp2")));

        assert_eq!(
            y.recv().await,
            Some(Propagated::Relay(Envelope::Offer(json!("sdp2"))))
        );
    }

    #[tokio::test]
    async fn second_declaration_gets_a_rejection_notice() {
        let engine = engine();
        let mut x = TestClient::connect(&engine).await;

        x.declare(&engine, Role::Sender).await;
        x.send(Envelope::RoleDeclare(Role::Receiver));

        assert_eq!(
            x.recv().await,
            Some(Propagated::Rejected("AlreadyDeclared".into()))
        );
        assert_eq!(engine.registry().snapshot().sender, Some(x.id));
        assert_eq!(engine.registry().snapshot().receiver, None);
    }

    #[tokio::test]
    async fn decode_error_closes_only_that_connection() {
        let engine = engine();
        let mut bad = TestClient::connect(&engine).await;
        let x = TestClient::connect(&engine).await;
        let mut y = TestClient::connect(&engine).await;
        x.declare(&engine, Role::Sender).await;
        y.declare(&engine, Role::Receiver).await;

        bad.tx
            .unbounded_send(Err(DecodeError::UnknownType("createOffer".into())))
            .unwrap();
        assert_eq!(
            bad.recv().await,
            Some(Propagated::Close(CloseReason::ProtocolError))
        );
        assert!(matches!(
            bad.task.await.unwrap(),
            Disconnect::ProtocolError(DecodeError::UnknownType(_))
        ));

        x.send(Envelope::Answer(json!("still works")));
        assert_eq!(
            y.recv().await,
            Some(Propagated::Relay(Envelope::Answer(json!("still works"))))
        );
    }

    #[tokio::test]
    async fn order_is_preserved_end_to_end() {
        let engine = engine();
        let x = TestClient::connect(&engine).await;
        let mut y = TestClient::connect(&engine).await;
        x.declare(&engine, Role::Sender).await;
        y.declare(&engine, Role::Receiver).await;

        for n in 0..50 {
            x.send(Envelope::IceCandidate(json!(n)));
        }
        for n in 0..50 {
            assert_eq!(
                y.recv().await,
                Some(Propagated::Relay(Envelope::IceCandidate(json!(n))))
            );
        }
    }

    #[tokio::test]
    async fn late_receiver_gets_the_buffered_offer_first() {
        let engine = engine();
        let x = TestClient::connect(&engine).await;
        let mut y = TestClient::connect(&engine).await;

        x.declare(&engine, Role::Sender).await;
        x.send(Envelope::Offer(json!("sdp1")));
        wait_for(|| engine.registry().snapshot().pending_offer).await;

        y.declare(&engine, Role::Receiver).await;
        x.send(Envelope::IceCandidate(json!("c1")));

        assert_eq!(
            y.recv().await,
            Some(Propagated::Relay(Envelope::Offer(json!("sdp1"))))
        );
        assert_eq!(
            y.recv().await,
            Some(Propagated::Relay(Envelope::IceCandidate(json!("c1"))))
        );
    }

    #[tokio::test]
    async fn stalled_receiver_is_evicted_and_the_sender_told() {
        let registry = Arc::new(SessionRegistry::new(RegistryOptions::default()));
        let engine = RelayEngine::new(registry, EngineOptions { outbound_capacity: 1 });
        let mut x = TestClient::connect(&engine).await;

        // A receiver whose socket stops draining after the greeting.
        let (stalled_tx, inbound) = chan::unbounded();
        let (outbound, mut stalled_rx) = chan::channel::<Propagated>(0);
        let task = tokio::spawn({
            let engine = engine.clone();
            async move { engine.serve(inbound, outbound).await }
        });
        let Some(Propagated::Welcome(stalled)) = stalled_rx.next().await else {
            panic!("expected Welcome");
        };
        stalled_tx
            .unbounded_send(Ok(Envelope::RoleDeclare(Role::Receiver)))
            .unwrap();
        wait_for(|| {
            engine.registry().state_of(stalled).and_then(|s| s.role()) == Some(Role::Receiver)
        })
        .await;

        x.declare(&engine, Role::Sender).await;
        for n in 0..10 {
            x.send(Envelope::IceCandidate(json!(n)));
        }

        assert_eq!(x.recv().await, Some(Propagated::PeerLeft));
        drop(stalled_rx);
        let reason = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(reason, Disconnect::Lagging);
        assert_eq!(engine.registry().snapshot().receiver, None);
    }
}
