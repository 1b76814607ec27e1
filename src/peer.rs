//! Headless WebRTC peer
//!
//! Connects to the signaling relay, declares a role and negotiates a
//! connection with whoever holds the other role. The sender offers a data
//! channel plus a send-only video section and streams heartbeats once the
//! channel opens; the receiver answers and logs each heartbeat's latency.

pub mod negotiation;

use std::time::Duration;

use anyhow::{bail, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::PeerArgs;
use crate::model::client::ClientId;
use crate::model::envelope::{Envelope, Role};
use crate::model::payload::Payload;
use crate::model::propagated::{decode_server_frame, Propagated};

use self::negotiation::{NegotiationEngine, PeerEvent, Str0mEngine};

/// A relay connection with a declared role.
pub struct SignalingClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    id: ClientId,
}

impl SignalingClient {
    /// Connect, wait for the relay's greeting, then declare `role`.
    pub async fn connect(url: &str, role: Role) -> Result<SignalingClient> {
        let (ws, _) = tokio_tungstenite::connect_async(url).await?;
        let mut client = SignalingClient {
            ws,
            id: ClientId::from(0),
        };

        match client.recv().await? {
            Some(Propagated::Welcome(id)) => client.id = id,
            other => bail!("expected a Welcome from the relay, got {other:?}"),
        }

        client.send(&Envelope::RoleDeclare(role)).await?;
        info!(
            "✅ Connected to relay as Client({}), declared {}",
            client.id, role
        );
        Ok(client)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<()> {
        self.ws.send(Message::Text(envelope.encode())).await?;
        Ok(())
    }

    pub async fn send_all(&mut self, envelopes: Vec<Envelope>) -> Result<()> {
        for envelope in &envelopes {
            self.send(envelope).await?;
        }
        Ok(())
    }

    /// Next message from the relay, `None` once the connection is closed.
    pub async fn recv(&mut self) -> Result<Option<Propagated>> {
        while let Some(frame) = self.ws.next().await {
            let bytes = match frame? {
                Message::Text(text) => text.into_bytes(),
                Message::Binary(data) => data,
                Message::Close(_) => return Ok(None),
                _ => continue,
            };
            return Ok(Some(decode_server_frame(&bytes)?));
        }
        Ok(None)
    }
}

/// The offer followed by one `IceCandidate` per local candidate.
pub fn offer_envelopes<E: NegotiationEngine>(engine: &mut E) -> Result<Vec<Envelope>> {
    let mut out = vec![Envelope::Offer(engine.create_offer()?)];
    out.extend(engine.local_candidates().into_iter().map(Envelope::IceCandidate));
    Ok(out)
}

/// The answer to `offer` followed by the local candidates.
pub fn answer_envelopes<E: NegotiationEngine>(engine: &mut E, offer: Value) -> Result<Vec<Envelope>> {
    let mut out = vec![Envelope::Answer(engine.create_answer(offer)?)];
    out.extend(engine.local_candidates().into_iter().map(Envelope::IceCandidate));
    Ok(out)
}

/// Apply an answer or a remote candidate. A candidate that fails to parse is
/// skipped, a rejected answer is an error.
pub fn apply_remote<E: NegotiationEngine>(engine: &mut E, envelope: Envelope) -> Result<()> {
    match envelope {
        Envelope::Answer(answer) => {
            engine.set_remote_answer(answer)?;
            info!("📥 Answer accepted, waiting for ICE connection and channel to open...");
        }
        Envelope::IceCandidate(candidate) => {
            if let Err(e) = engine.add_candidate(candidate) {
                warn!("Ignoring remote candidate: {}", e);
            }
        }
        other => debug!("Ignoring {} from the remote peer", other.kind()),
    }
    Ok(())
}

async fn start_offer(signaling: &mut SignalingClient) -> Result<Str0mEngine> {
    let mut engine = Str0mEngine::bind().await?;
    let envelopes = offer_envelopes(&mut engine)?;
    signaling.send_all(envelopes).await?;
    info!("📤 Offer sent");
    Ok(engine)
}

async fn next_event(engine: &mut Option<Str0mEngine>) -> Result<PeerEvent> {
    match engine {
        Some(engine) => engine.next_event().await,
        None => std::future::pending().await,
    }
}

/// Run a peer until the relay closes the connection.
pub async fn run(args: PeerArgs) -> Result<()> {
    let role = Role::from(args.role);
    let mut signaling = SignalingClient::connect(&args.relay, role).await?;

    let mut engine = match role {
        Role::Sender => Some(start_offer(&mut signaling).await?),
        Role::Receiver => None,
    };
    let mut channel_open = false;
    let mut seq = 0u64;
    let mut heartbeat = tokio::time::interval(Duration::from_millis(args.heartbeat_ms.max(1)));

    loop {
        tokio::select! {
            msg = signaling.recv() => match msg? {
                None => {
                    info!("Relay closed the connection");
                    return Ok(());
                }
                Some(Propagated::Relay(Envelope::Offer(offer))) if role == Role::Receiver => {
                    info!("📥 Offer received, answering");
                    let mut fresh = Str0mEngine::bind().await?;
                    let envelopes = answer_envelopes(&mut fresh, offer)?;
                    signaling.send_all(envelopes).await?;
                    engine = Some(fresh);
                    channel_open = false;
                }
                Some(Propagated::Relay(envelope)) => match engine.as_mut() {
                    Some(engine) => apply_remote(engine, envelope)?,
                    None => debug!("{} before negotiation started, ignored", envelope.kind()),
                },
                Some(Propagated::PeerLeft) => {
                    info!("👋 Peer left");
                    engine = None;
                    channel_open = false;
                    if role == Role::Sender {
                        engine = Some(start_offer(&mut signaling).await?);
                    }
                }
                Some(Propagated::Rejected(reason)) => warn!("Relay rejected a message: {}", reason),
                Some(Propagated::Close(reason)) => bail!("relay closed the session: {reason}"),
                Some(Propagated::Welcome(id)) => debug!("Unexpected second Welcome ({})", id),
            },

            event = next_event(&mut engine) => match event? {
                PeerEvent::Connected => info!("   → ✅ ICE Connected!"),
                PeerEvent::ChannelOpen(_) => channel_open = true,
                PeerEvent::ChannelData(data) => match Payload::deserialize(&data) {
                    Ok(p) => info!(
                        "💓 Heartbeat #{} '{}' sent at {}, latency {}",
                        p.seq,
                        p.data(),
                        p.timestamp(),
                        p.latency()
                    ),
                    Err(e) => warn!("Unreadable data on channel: {}", e),
                },
                PeerEvent::Disconnected => {
                    info!("⚠️ ICE disconnected, waiting for renegotiation");
                    engine = None;
                    channel_open = false;
                }
            },

            _ = heartbeat.tick(), if channel_open && role == Role::Sender => {
                if let Some(engine) = engine.as_mut() {
                    let payload = Payload::new(seq, b"rover heartbeat");
                    if engine.send_data(&payload.serialize()?)? {
                        seq += 1;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    #[derive(Default)]
    struct FakeEngine {
        answers: Vec<Value>,
        candidates: Vec<Value>,
    }

    impl NegotiationEngine for FakeEngine {
        fn create_offer(&mut self) -> Result<Value> {
            Ok(json!({ "type": "offer", "sdp": "v=0" }))
        }

        fn create_answer(&mut self, offer: Value) -> Result<Value> {
            Ok(json!({ "type": "answer", "sdp": offer["sdp"] }))
        }

        fn set_remote_answer(&mut self, answer: Value) -> Result<()> {
            if answer["type"] != "answer" {
                return Err(anyhow!("not an answer"));
            }
            self.answers.push(answer);
            Ok(())
        }

        fn local_candidates(&self) -> Vec<Value> {
            vec![json!({ "candidate": "c1" }), json!({ "candidate": "c2" })]
        }

        fn add_candidate(&mut self, candidate: Value) -> Result<()> {
            if candidate.get("candidate").is_none() {
                return Err(anyhow!("bad candidate"));
            }
            self.candidates.push(candidate);
            Ok(())
        }
    }

    #[test]
    fn offer_precedes_its_candidates() {
        let envelopes = offer_envelopes(&mut FakeEngine::default()).unwrap();
        assert_eq!(
            envelopes,
            vec![
                Envelope::Offer(json!({ "type": "offer", "sdp": "v=0" })),
                Envelope::IceCandidate(json!({ "candidate": "c1" })),
                Envelope::IceCandidate(json!({ "candidate": "c2" })),
            ]
        );
    }

    #[test]
    fn answer_echoes_the_offered_session() {
        let envelopes =
            answer_envelopes(&mut FakeEngine::default(), json!({ "type": "offer", "sdp": "x" }))
                .unwrap();
        assert_eq!(
            envelopes[0],
            Envelope::Answer(json!({ "type": "answer", "sdp": "x" }))
        );
        assert_eq!(envelopes.len(), 3);
    }

    #[test]
    fn bad_candidates_are_skipped_but_bad_answers_fail() {
        let mut engine = FakeEngine::default();
        apply_remote(&mut engine, Envelope::IceCandidate(json!(42))).unwrap();
        apply_remote(&mut engine, Envelope::IceCandidate(json!({ "candidate": "c9" }))).unwrap();
        assert_eq!(engine.candidates, vec![json!({ "candidate": "c9" })]);

        assert!(apply_remote(&mut engine, Envelope::Answer(json!({ "type": "offer" }))).is_err());
        assert!(engine.answers.is_empty());
    }
}
