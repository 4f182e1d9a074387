//! CSCP wire format: a 2-3 part request/reply message.
//!
//! ```text
//! Part 0: Header   CBOR CscpHeader { sender, timestamp, meta }
//! Part 1: Body     CBOR (Verb, command_name)
//! Part 2: Payload  raw bytes (optional; only present if the command has one)
//! ```
//!
//! Each part is independently CBOR/raw so a receiver can read the verb and
//! command name without touching a potentially large payload.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ProtoError;

pub const CSCP_TAG: &str = "CSCP\x01";

/// Reply/Request verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verb {
    Request,
    Success,
    NotImplemented,
    Incomplete,
    Invalid,
    Unknown,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CscpHeader {
    pub tag: String,
    pub sender: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub meta: HashMap<String, String>,
}

impl CscpHeader {
    pub fn new(sender: impl Into<String>) -> Self {
        Self {
            tag: CSCP_TAG.to_string(),
            sender: sender.into(),
            timestamp: chrono::Utc::now(),
            meta: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Body {
    verb: Verb,
    command_name: String,
}

/// A fully decoded CSCP message.
#[derive(Debug, Clone)]
pub struct CscpMessage {
    pub from_host: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub header_meta: HashMap<String, String>,
    pub verb: Verb,
    pub command_name: String,
    pub payload: Option<Vec<u8>>,
}

impl CscpMessage {
    pub fn request(sender: impl Into<String>, command_name: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self {
            from_host: sender.into(),
            timestamp: chrono::Utc::now(),
            header_meta: HashMap::new(),
            verb: Verb::Request,
            command_name: command_name.into(),
            payload,
        }
    }

    pub fn reply(&self, sender: impl Into<String>, verb: Verb, payload: Option<Vec<u8>>) -> Self {
        Self {
            from_host: sender.into(),
            timestamp: chrono::Utc::now(),
            header_meta: HashMap::new(),
            verb,
            command_name: self.command_name.clone(),
            payload,
        }
    }

    /// Encode into a multipart ZMQ message (2 or 3 frames).
    pub fn encode_parts(&self) -> Result<Vec<Vec<u8>>, ProtoError> {
        let header = CscpHeader {
            tag: CSCP_TAG.to_string(),
            sender: self.from_host.clone(),
            timestamp: self.timestamp,
            meta: self.header_meta.clone(),
        };
        let body = Body {
            verb: self.verb,
            command_name: self.command_name.clone(),
        };

        let mut parts = vec![crate::encode(&header)?, crate::encode(&body)?];
        if let Some(payload) = &self.payload {
            parts.push(payload.clone());
        }
        Ok(parts)
    }

    /// Decode a multipart ZMQ message.
    pub fn decode_parts(parts: &[Vec<u8>]) -> Result<Self, ProtoError> {
        if parts.len() < 2 {
            return Err(ProtoError::Truncated {
                expected: 2,
                got: parts.len(),
            });
        }
        let header: CscpHeader = crate::decode(&parts[0])?;
        if header.tag != CSCP_TAG {
            return Err(ProtoError::BadTag(header.tag.into_bytes()));
        }
        let body: Body = crate::decode(&parts[1])?;
        let payload = parts.get(2).cloned();

        Ok(Self {
            from_host: header.sender,
            timestamp: header.timestamp,
            header_meta: header.meta,
            verb: body.verb,
            command_name: body.command_name,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_request_without_payload() {
        let msg = CscpMessage::request("controller-1", "get_state", None);
        let parts = msg.encode_parts().unwrap();
        assert_eq!(parts.len(), 2);
        let decoded = CscpMessage::decode_parts(&parts).unwrap();
        assert_eq!(decoded.command_name, "get_state");
        assert_eq!(decoded.verb, Verb::Request);
        assert!(decoded.payload.is_none());
    }

    #[test]
    fn roundtrip_reply_with_payload() {
        let req = CscpMessage::request("controller-1", "start", Some(b"run_42".to_vec()));
        let reply = req.reply("sat-a", Verb::Success, Some(b"ok".to_vec()));
        let parts = reply.encode_parts().unwrap();
        assert_eq!(parts.len(), 3);
        let decoded = CscpMessage::decode_parts(&parts).unwrap();
        assert_eq!(decoded.verb, Verb::Success);
        assert_eq!(decoded.payload.as_deref(), Some(b"ok".as_slice()));
    }

    #[test]
    fn rejects_too_few_parts() {
        let err = CscpMessage::decode_parts(&[vec![1, 2, 3]]).unwrap_err();
        assert!(matches!(err, ProtoError::Truncated { .. }));
    }
}
