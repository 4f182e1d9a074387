//! CHP (heartbeat) wire format, plus out-of-scope CDTP/CMDP header markers.
//!
//! CHP messages are published on a PUB socket; there is no request/reply
//! exchange, so a single CBOR-encoded frame is sufficient.

use serde::{Deserialize, Serialize};

use crate::ProtoError;

/// Heartbeat payload published periodically by the heartbeat sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    pub satellite_name: String,
    pub state_id: String,
    pub interval_ms: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HeartbeatMessage {
    pub fn new(satellite_name: impl Into<String>, state_id: impl Into<String>, interval_ms: u32) -> Self {
        Self {
            satellite_name: satellite_name.into(),
            state_id: state_id.into(),
            interval_ms,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        crate::encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtoError> {
        crate::decode(bytes)
    }
}

/// CDTP (data plane) header. Out of scope for this crate, which only
/// defines the header shape so downstream per-device satellites have a
/// stable type to build on; no transport is implemented here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdtpHeader {
    pub sender: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub msgtype: u8,
    pub seqno: u64,
}

/// CMDP (monitoring plane) header. Out of scope, same rationale as [`CdtpHeader`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmdpHeader {
    pub sender: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub msgtype: u8,
    pub seqno: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let msg = HeartbeatMessage::new("sat-a", "ORBIT", 1000);
        let bytes = msg.encode().unwrap();
        let decoded = HeartbeatMessage::decode(&bytes).unwrap();
        assert_eq!(msg, decoded);
    }
}
