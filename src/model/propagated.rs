//! Messages propagated from the relay to a client
//!
//! Everything a client's connection task writes to its socket flows through
//! [`Propagated`]: envelopes relayed from the paired peer, plus the relay's own
//! notices (greeting, peer departure, rejections and close reasons).

use std::fmt;

use serde_json::{json, Value};

use crate::model::client::ClientId;
use crate::model::envelope::{DecodeError, Envelope};

/// Why the relay is terminating a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Another connection claimed this client's role.
    RoleSuperseded,
    /// The client sent data that could not be decoded.
    ProtocolError,
    /// The client's outbound queue overflowed.
    SlowConsumer,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::RoleSuperseded => "RoleSuperseded",
            CloseReason::ProtocolError => "ProtocolError",
            CloseReason::SlowConsumer => "SlowConsumer",
        }
    }

    fn parse(s: &str) -> Option<CloseReason> {
        match s {
            "RoleSuperseded" => Some(CloseReason::RoleSuperseded),
            "ProtocolError" => Some(CloseReason::ProtocolError),
            "SlowConsumer" => Some(CloseReason::SlowConsumer),
            _ => None,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events pushed onto a client's outbound queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Propagated {
    /// Greeting sent right after the connection is accepted.
    Welcome(ClientId),
    /// An envelope from the paired peer, unmodified.
    Relay(Envelope),
    /// The paired peer disconnected.
    PeerLeft,
    /// A message from this client was refused; the connection stays open.
    Rejected(String),
    /// The relay is closing this connection.
    Close(CloseReason),
}

impl Propagated {
    pub fn to_value(&self) -> Value {
        match self {
            Propagated::Welcome(id) => json!({ "type": "Welcome", "clientId": **id }),
            Propagated::Relay(envelope) => envelope.to_value(),
            Propagated::PeerLeft => json!({ "type": "PeerLeft" }),
            Propagated::Rejected(reason) => json!({ "type": "Rejected", "reason": reason }),
            Propagated::Close(reason) => json!({ "type": "Close", "reason": reason.as_str() }),
        }
    }

    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    pub fn is_close(&self) -> bool {
        matches!(self, Propagated::Close(_))
    }
}

/// Client-side decoding of a frame received from the relay.
pub fn decode_server_frame(bytes: &[u8]) -> Result<Propagated, DecodeError> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::Malformed("missing `type`".into()))?;

    match kind {
        "Welcome" => value
            .get("clientId")
            .and_then(Value::as_u64)
            .map(|id| Propagated::Welcome(ClientId::from(id)))
            .ok_or_else(|| DecodeError::Malformed("Welcome without clientId".into())),
        "PeerLeft" => Ok(Propagated::PeerLeft),
        "Rejected" => Ok(Propagated::Rejected(
            value
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        )),
        "Close" => value
            .get("reason")
            .and_then(Value::as_str)
            .and_then(CloseReason::parse)
            .map(Propagated::Close)
            .ok_or_else(|| DecodeError::Malformed("Close without a known reason".into())),
        _ => Envelope::from_value(value).map(Propagated::Relay),
    }
}
