//! constellation-proto - wire types for the Constellation CHIRP / CSCP / CHP protocols
//!
//! All three protocols wrap their payloads in a small framed header so peers
//! can reject messages from the wrong protocol or group before paying the
//! cost of a full decode. Payloads are CBOR-encoded (self-describing, compact,
//! and native for the timestamp/byte-string fields these protocols carry).

pub mod chirp;
pub mod chp;
pub mod cscp;
mod error;

pub use error::ProtoError;

/// Encode a serde value as CBOR bytes.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| ProtoError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode CBOR bytes into a serde value.
pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtoError> {
    ciborium::from_reader(bytes).map_err(|e| ProtoError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        a: u32,
        b: String,
    }

    #[test]
    fn roundtrip() {
        let value = Sample {
            a: 7,
            b: "hi".into(),
        };
        let bytes = encode(&value).unwrap();
        let back: Sample = decode(&bytes).unwrap();
        assert_eq!(value, back);
    }
}
