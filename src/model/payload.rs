//! Heartbeat payload sent over the peers' data channel once negotiation has
//! succeeded. Timestamps let the receiver report one-way latency.

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use bincode::config::{self, Configuration};
use bincode::error::{DecodeError, EncodeError};

const BINCODE_CONFIG: Configuration = config::standard();

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Payload {
    pub seq: u64,
    pub data: Vec<u8>,
    pub timestamp: i64,
}

impl Payload {
    pub fn new(seq: u64, data: &[u8]) -> Payload {
        Self {
            seq,
            data: data.to_vec(),
            timestamp: Utc::now().timestamp_nanos_opt().unwrap_or(0),
        }
    }

    pub fn data(&self) -> String {
        String::from_utf8_lossy(&self.data).to_string()
    }

    pub fn timestamp(&self) -> String {
        Utc.timestamp_nanos(self.timestamp).to_rfc3339()
    }

    pub fn latency(&self) -> String {
        (Utc::now() - Utc.timestamp_nanos(self.timestamp)).to_string()
    }

    pub fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        bincode::encode_to_vec(self, BINCODE_CONFIG)
    }

    /// Deserialize from received bytes
    pub fn deserialize(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (payload, _): (Payload, usize) = bincode::decode_from_slice(bytes, BINCODE_CONFIG)?;
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_survives_the_data_channel_encoding() {
        let sent = Payload::new(3, b"rover heartbeat");
        let bytes = sent.serialize().unwrap();
        let received = Payload::deserialize(&bytes).unwrap();
        assert_eq!(received, sent);
        assert_eq!(received.data(), "rover heartbeat");
    }

    #[test]
    fn truncated_bytes_fail_to_decode() {
        let bytes = Payload::new(1, b"x").serialize().unwrap();
        assert!(Payload::deserialize(&bytes[..1]).is_err());
    }
}
