use thiserror::Error;

/// Errors raised while encoding or decoding Constellation wire messages.
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("message too short: expected at least {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("bad protocol tag: {0:?}")]
    BadTag(Vec<u8>),

    #[error("unknown message type code: {0}")]
    UnknownMessageType(u8),

    #[error("unknown service identifier code: {0}")]
    UnknownServiceId(u8),

    #[error("unknown verb code: {0}")]
    UnknownVerb(u8),

    #[error("failed to encode payload: {0}")]
    Encode(String),

    #[error("failed to decode payload: {0}")]
    Decode(String),
}
