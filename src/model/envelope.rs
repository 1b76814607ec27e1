//! Signaling envelope codec
//!
//! Defines the message unit exchanged between a peer and the relay, and the
//! JSON encoding used on the wire. Negotiation payloads (offers, answers and
//! candidates) are carried as opaque JSON values and never interpreted.

use std::fmt;

use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;

/// Role a client claims for the lifetime of its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Produces media and initiates negotiation offers.
    Sender,
    /// Consumes media and answers offers.
    Receiver,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }

    pub fn parse(s: &str) -> Option<Role> {
        match s {
            "sender" => Some(Role::Sender),
            "receiver" => Some(Role::Receiver),
            _ => None,
        }
    }

    /// The role that pairs with this one in a session.
    pub fn counterpart(&self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The four envelope types a client may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeType {
    RoleDeclare,
    Offer,
    Answer,
    IceCandidate,
}

impl EnvelopeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::RoleDeclare => "RoleDeclare",
            EnvelopeType::Offer => "Offer",
            EnvelopeType::Answer => "Answer",
            EnvelopeType::IceCandidate => "IceCandidate",
        }
    }

    fn parse(s: &str) -> Option<EnvelopeType> {
        match s {
            "RoleDeclare" => Some(EnvelopeType::RoleDeclare),
            "Offer" => Some(EnvelopeType::Offer),
            "Answer" => Some(EnvelopeType::Answer),
            "IceCandidate" => Some(EnvelopeType::IceCandidate),
            _ => None,
        }
    }
}

impl fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A signaling message from a client.
///
/// `Offer`, `Answer` and `IceCandidate` carry the negotiation engine's data
/// untouched. The relay only routes them.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    RoleDeclare(Role),
    Offer(Value),
    Answer(Value),
    IceCandidate(Value),
}

/// Why an inbound frame could not be turned into an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unknown message type `{0}`")]
    UnknownType(String),
    #[error("{0} message is missing its payload")]
    MissingPayload(EnvelopeType),
}

/// Loose shape of an envelope before validation.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: Option<Value>,
    #[serde(default)]
    role: Option<Value>,
}

impl Envelope {
    pub fn kind(&self) -> EnvelopeType {
        match self {
            Envelope::RoleDeclare(_) => EnvelopeType::RoleDeclare,
            Envelope::Offer(_) => EnvelopeType::Offer,
            Envelope::Answer(_) => EnvelopeType::Answer,
            Envelope::IceCandidate(_) => EnvelopeType::IceCandidate,
        }
    }

    /// The opaque negotiation payload, if this envelope is routable.
    pub fn payload(&self) -> Option<&Value> {
        match self {
            Envelope::RoleDeclare(_) => None,
            Envelope::Offer(p) | Envelope::Answer(p) | Envelope::IceCandidate(p) => Some(p),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Envelope::RoleDeclare(role) => json!({
                "type": EnvelopeType::RoleDeclare.as_str(),
                "role": role.as_str(),
            }),
            other => json!({
                "type": other.kind().as_str(),
                "payload": other.payload(),
            }),
        }
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> String {
        self.to_value().to_string()
    }

    /// Decode a wire frame. Pure: nothing is touched on failure.
    pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))?;
        Envelope::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Envelope, DecodeError> {
        if !value.is_object() {
            return Err(DecodeError::Malformed("expected a JSON object".into()));
        }

        let raw: RawEnvelope =
            serde_json::from_value(value).map_err(|e| DecodeError::Malformed(e.to_string()))?;

        let Some(kind) = EnvelopeType::parse(&raw.kind) else {
            return Err(DecodeError::UnknownType(raw.kind));
        };

        let payload = raw.payload.filter(|p| !p.is_null());

        match kind {
            EnvelopeType::RoleDeclare => {
                let tag = raw.role.filter(|r| !r.is_null()).or(payload);
                let Some(tag) = tag else {
                    return Err(DecodeError::MissingPayload(kind));
                };
                let role = tag
                    .as_str()
                    .and_then(Role::parse)
                    .ok_or_else(|| DecodeError::Malformed(format!("invalid role {tag}")))?;
                Ok(Envelope::RoleDeclare(role))
            }
            EnvelopeType::Offer => payload
                .map(Envelope::Offer)
                .ok_or(DecodeError::MissingPayload(kind)),
            EnvelopeType::Answer => payload
                .map(Envelope::Answer)
                .ok_or(DecodeError::MissingPayload(kind)),
            EnvelopeType::IceCandidate => payload
                .map(Envelope::IceCandidate)
                .ok_or(DecodeError::MissingPayload(kind)),
        }
    }
}
