//! CHIRP wire format: a single UDP datagram carrying a tagged, CBOR-encoded body.
//!
//! ```text
//! Frame 0: Protocol tag   b"CHIRP\x01" (7 bytes)
//! Frame 1: CBOR body      CHIRPMessage
//! ```
//!
//! The tag lets a listener reject foreign traffic on the broadcast port
//! (stray mDNS, other CHIRP-speaking groups' misconfigured peers, etc.)
//! before attempting to decode the body.

use std::collections::HashMap;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ProtoError;

/// Protocol tag prefixing every CHIRP datagram.
pub const CHIRP_TAG: &[u8] = b"CHIRP\x01";

/// Default UDP broadcast port for CHIRP discovery.
pub const CHIRP_PORT: u16 = 23870;

/// Well-known service kinds a satellite can advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ServiceIdentifier {
    Control = 0,
    Heartbeat = 1,
    Monitoring = 2,
    Data = 3,
}

impl ServiceIdentifier {
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            0 => Ok(Self::Control),
            1 => Ok(Self::Heartbeat),
            2 => Ok(Self::Monitoring),
            3 => Ok(Self::Data),
            other => Err(ProtoError::UnknownServiceId(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// CHIRP message type: `REQUEST=1, OFFER=2, DEPART=3`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    Request = 1,
    Offer = 2,
    Depart = 3,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            1 => Ok(Self::Request),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Depart),
            other => Err(ProtoError::UnknownMessageType(other)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A decoded CHIRP datagram: `(host_uuid, group, service_id, msg_type, port)`
/// plus the generic header fields every Constellation message carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChirpMessage {
    pub sender: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub group: String,
    pub host_uuid: Uuid,
    pub service_id: ServiceIdentifier,
    pub msg_type: MessageType,
    /// Zero for REQUEST; the advertised port for OFFER/DEPART.
    pub port: u16,
}

impl ChirpMessage {
    pub fn request(sender: impl Into<String>, group: impl Into<String>, host_uuid: Uuid, service_id: ServiceIdentifier) -> Self {
        Self {
            sender: sender.into(),
            timestamp: chrono::Utc::now(),
            meta: HashMap::new(),
            group: group.into(),
            host_uuid,
            service_id,
            msg_type: MessageType::Request,
            port: 0,
        }
    }

    pub fn offer(sender: impl Into<String>, group: impl Into<String>, host_uuid: Uuid, service_id: ServiceIdentifier, port: u16) -> Self {
        Self {
            sender: sender.into(),
            timestamp: chrono::Utc::now(),
            meta: HashMap::new(),
            group: group.into(),
            host_uuid,
            service_id,
            msg_type: MessageType::Offer,
            port,
        }
    }

    pub fn depart(sender: impl Into<String>, group: impl Into<String>, host_uuid: Uuid, service_id: ServiceIdentifier, port: u16) -> Self {
        Self {
            sender: sender.into(),
            timestamp: chrono::Utc::now(),
            meta: HashMap::new(),
            group: group.into(),
            host_uuid,
            service_id,
            msg_type: MessageType::Depart,
            port,
        }
    }

    /// Encode as a full UDP datagram payload (tag + CBOR body).
    pub fn encode_datagram(&self) -> Result<Vec<u8>, ProtoError> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(CHIRP_TAG);
        out.extend(crate::encode(self)?);
        Ok(out)
    }

    /// Decode a UDP datagram payload, validating the protocol tag first.
    pub fn decode_datagram(bytes: &[u8]) -> Result<Self, ProtoError> {
        if bytes.len() < CHIRP_TAG.len() {
            return Err(ProtoError::Truncated {
                expected: CHIRP_TAG.len(),
                got: bytes.len(),
            });
        }
        let (tag, body) = bytes.split_at(CHIRP_TAG.len());
        if tag != CHIRP_TAG {
            return Err(ProtoError::BadTag(tag.to_vec()));
        }
        crate::decode(body)
    }
}

/// Identity fields used for CHIRP's discovery-cache equality:
/// `(host_uuid, service_id, port)`. Address and liveness are not part of identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceKey {
    pub host_uuid: Uuid,
    pub service_id: ServiceIdentifier,
    pub port: u16,
}

impl From<&ChirpMessage> for ServiceKey {
    fn from(msg: &ChirpMessage) -> Self {
        Self {
            host_uuid: msg.host_uuid,
            service_id: msg.service_id,
            port: msg.port,
        }
    }
}

/// A discovered peer service.
#[derive(Debug, Clone)]
pub struct DiscoveredService {
    pub host_uuid: Uuid,
    pub service_id: ServiceIdentifier,
    pub address: SocketAddr,
    pub port: u16,
    pub alive: bool,
}

impl DiscoveredService {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            host_uuid: self.host_uuid,
            service_id: self.service_id,
            port: self.port,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_offer() {
        let host = Uuid::new_v4();
        let msg = ChirpMessage::offer("sat-a", "demo", host, ServiceIdentifier::Control, 23999);
        let bytes = msg.encode_datagram().unwrap();
        let decoded = ChirpMessage::decode_datagram(&bytes).unwrap();
        assert_eq!(decoded.host_uuid, host);
        assert_eq!(decoded.port, 23999);
        assert_eq!(decoded.msg_type, MessageType::Offer);
        assert_eq!(decoded.service_id, ServiceIdentifier::Control);
    }

    #[test]
    fn rejects_foreign_tag() {
        let mut bytes = b"XXXXXXX".to_vec();
        bytes.extend_from_slice(b"garbage");
        let err = ChirpMessage::decode_datagram(&bytes).unwrap_err();
        assert!(matches!(err, ProtoError::BadTag(_)));
    }

    #[test]
    fn service_key_ignores_address_and_liveness() {
        let host = Uuid::new_v4();
        let a = DiscoveredService {
            host_uuid: host,
            service_id: ServiceIdentifier::Control,
            address: "127.0.0.1:1".parse().unwrap(),
            port: 23999,
            alive: true,
        };
        let b = DiscoveredService {
            address: "10.0.0.1:2".parse().unwrap(),
            alive: false,
            ..a.clone()
        };
        assert_eq!(a.key(), b.key());
    }
}
