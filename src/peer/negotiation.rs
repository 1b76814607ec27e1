//! WebRTC negotiation behind a small trait, so the peer's signaling logic does
//! not care which engine produces the SDP and candidates.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::channel::ChannelId;
use str0m::media::{Direction, MediaKind};
use str0m::net::{Protocol, Receive};
use str0m::{Candidate, Event, IceConnectionState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::util::select_host_address;

const DATA_CHANNEL: &str = "rover";
const STREAM_ID: &str = "rover-camera";

/// Negotiation operations the signaling flow relies on. Payloads are opaque
/// JSON values carried verbatim in envelopes.
pub trait NegotiationEngine {
    fn create_offer(&mut self) -> Result<Value>;
    fn create_answer(&mut self, offer: Value) -> Result<Value>;
    fn set_remote_answer(&mut self, answer: Value) -> Result<()>;
    /// Candidates to trickle to the remote side.
    fn local_candidates(&self) -> Vec<Value>;
    fn add_candidate(&mut self, candidate: Value) -> Result<()>;
}

/// Something the engine reports back to the peer loop.
#[derive(Debug, PartialEq)]
pub enum PeerEvent {
    Connected,
    ChannelOpen(ChannelId),
    ChannelData(Vec<u8>),
    Disconnected,
}

/// [`NegotiationEngine`] over a `str0m::Rtc` and a UDP socket bound to a
/// routable host address.
pub struct Str0mEngine {
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    candidates: Vec<Candidate>,
    pending: Option<SdpPendingOffer>,
    channel: Option<ChannelId>,
    buf: Vec<u8>,
}

impl Str0mEngine {
    pub async fn bind() -> Result<Str0mEngine> {
        let host = select_host_address().unwrap_or_else(|| {
            warn!("Found no usable network interface, using loopback");
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });

        let socket = UdpSocket::bind(SocketAddr::new(host, 0)).await?;
        let local_addr = socket.local_addr()?;
        info!("Bound UDP port: {}", local_addr);

        let candidate = Candidate::host(local_addr, "udp")?;
        let mut rtc = Rtc::new();
        rtc.add_local_candidate(candidate.clone());

        Ok(Str0mEngine {
            rtc,
            socket,
            local_addr,
            candidates: vec![candidate],
            pending: None,
            channel: None,
            buf: vec![0; 2000],
        })
    }

    /// Write on the data channel. Returns `false` when no channel is open yet.
    pub fn send_data(&mut self, data: &[u8]) -> Result<bool> {
        let Some(mut channel) = self.channel.and_then(|id| self.rtc.channel(id)) else {
            return Ok(false);
        };
        channel.write(true, data)?;
        Ok(true)
    }

    /// Drive the engine until it has something to report.
    ///
    /// Cancel safe: all progress lives in the `Rtc`, so dropping the future
    /// between polls loses at most an outgoing UDP datagram.
    pub async fn next_event(&mut self) -> Result<PeerEvent> {
        loop {
            if !self.rtc.is_alive() {
                return Ok(PeerEvent::Disconnected);
            }

            let timeout = match self.rtc.poll_output()? {
                Output::Timeout(t) => t,
                Output::Transmit(transmit) => {
                    self.socket
                        .send_to(&transmit.contents, transmit.destination)
                        .await?;
                    continue;
                }
                Output::Event(event) => {
                    if let Some(ev) = self.on_event(event) {
                        return Ok(ev);
                    }
                    continue;
                }
            };

            let now = Instant::now();
            if timeout <= now {
                self.rtc.handle_input(Input::Timeout(now))?;
                continue;
            }

            self.buf.resize(2000, 0);
            let received = tokio::select! {
                res = self.socket.recv_from(&mut self.buf) => Some(res?),
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(timeout)) => None,
            };

            match received {
                Some((n, source)) => {
                    self.buf.truncate(n);
                    let Ok(contents) = self.buf.as_slice().try_into() else {
                        debug!("Dropping unparseable datagram from {}", source);
                        continue;
                    };
                    self.rtc.handle_input(Input::Receive(
                        Instant::now(),
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination: self.local_addr,
                            contents,
                        },
                    ))?;
                }
                None => self.rtc.handle_input(Input::Timeout(Instant::now()))?,
            }
        }
    }

    fn on_event(&mut self, event: Event) -> Option<PeerEvent> {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("🔌 ICE Connection State: {:?}", state);
                match state {
                    IceConnectionState::Connected => Some(PeerEvent::Connected),
                    IceConnectionState::Disconnected => Some(PeerEvent::Disconnected),
                    _ => None,
                }
            }
            Event::ChannelOpen(cid, name) => {
                info!("🎉 Channel opened - Name: '{}', ID: {:?}", name, cid);
                self.channel = Some(cid);
                Some(PeerEvent::ChannelOpen(cid))
            }
            Event::ChannelData(data) => Some(PeerEvent::ChannelData(data.data)),
            Event::MediaAdded(media) => {
                info!("📹 Media added: {:?} {:?}", media.mid, media.kind);
                None
            }
            other => {
                debug!("Event (other): {:?}", other);
                None
            }
        }
    }
}

impl NegotiationEngine for Str0mEngine {
    fn create_offer(&mut self) -> Result<Value> {
        let mut change = self.rtc.sdp_api();
        let cid = change.add_channel(DATA_CHANNEL.to_string());
        change.add_media(
            MediaKind::Video,
            Direction::SendOnly,
            Some(STREAM_ID.to_string()),
            None,
            None,
        );

        let Some((offer, pending)) = change.apply() else {
            bail!("no changes to offer");
        };

        info!("📝 Requested data channel '{}' with ID: {:?}", DATA_CHANNEL, cid);
        self.pending = Some(pending);
        Ok(serde_json::to_value(&offer)?)
    }

    fn create_answer(&mut self, offer: Value) -> Result<Value> {
        let offer: SdpOffer = serde_json::from_value(offer)?;
        let answer = self.rtc.sdp_api().accept_offer(offer)?;
        Ok(serde_json::to_value(&answer)?)
    }

    fn set_remote_answer(&mut self, answer: Value) -> Result<()> {
        let answer: SdpAnswer = serde_json::from_value(answer)?;
        let Some(pending) = self.pending.take() else {
            bail!("answer received without a pending offer");
        };
        self.rtc.sdp_api().accept_answer(pending, answer)?;
        Ok(())
    }

    fn local_candidates(&self) -> Vec<Value> {
        self.candidates.iter().map(candidate_to_value).collect()
    }

    fn add_candidate(&mut self, candidate: Value) -> Result<()> {
        let candidate = candidate_from_value(&candidate)?;
        self.rtc.add_remote_candidate(candidate);
        Ok(())
    }
}

/// Browser-shaped `RTCIceCandidateInit`.
fn candidate_to_value(candidate: &Candidate) -> Value {
    json!({
        "candidate": candidate.to_sdp_string(),
        "sdpMid": Value::Null,
        "sdpMLineIndex": 0,
    })
}

/// Accepts either the browser object or a bare candidate line.
fn candidate_from_value(value: &Value) -> Result<Candidate> {
    let line = match value {
        Value::String(s) => s.as_str(),
        other => other
            .get("candidate")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("candidate without a `candidate` line"))?,
    };
    Ok(Candidate::from_sdp_string(line)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_keeps_its_address_through_json() {
        let addr = SocketAddr::from(([192, 168, 1, 20], 40000));
        let candidate = Candidate::host(addr, "udp").unwrap();

        let value = candidate_to_value(&candidate);
        assert!(value["candidate"].as_str().unwrap().contains("192.168.1.20"));

        let parsed = candidate_from_value(&value).unwrap();
        assert_eq!(parsed.addr(), addr);
    }

    #[test]
    fn candidate_without_a_line_is_an_error() {
        assert!(candidate_from_value(&json!({ "sdpMid": "0" })).is_err());
        assert!(candidate_from_value(&json!("not a candidate")).is_err());
    }
}
