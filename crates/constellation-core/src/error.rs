use thiserror::Error;

use constellation_proto::ProtoError;

/// Errors raised by the CHIRP broadcast manager.
#[derive(Debug, Error)]
pub enum ChirpError {
    #[error("failed to bind CHIRP broadcast socket on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to send CHIRP datagram: {0}")]
    Send(std::io::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Errors raised by the CSCP command receiver.
#[derive(Debug, Error)]
pub enum CscpError {
    #[error("failed to bind CSCP socket on {addr}: {source}")]
    Bind { addr: String, source: zmq::Error },

    #[error("zmq transport error: {0}")]
    Transport(#[from] zmq::Error),

    #[error(transparent)]
    Proto(#[from] ProtoError),
}

/// Errors raised while driving the lifecycle FSM.
#[derive(Debug, Error)]
pub enum FsmError {
    #[error("transition '{event}' is not allowed from state {from:?}")]
    DisallowedTransition { from: crate::fsm::State, event: String },

    #[error("user hook for transition '{event}' failed: {message}")]
    HookFailed { event: String, message: String },

    #[error("acquisition thread did not observe stop within {timeout_secs}s")]
    StopTimeout { timeout_secs: u64 },

    #[error("peer {name} reported failure")]
    PeerFailure { name: String },
}

/// Top-level error for the satellite runtime, used at the glue layer where
/// CHIRP/CSCP/FSM errors need to be handled uniformly (e.g. the main loop's
/// thread-exception hook).
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Chirp(#[from] ChirpError),

    #[error(transparent)]
    Cscp(#[from] CscpError),

    #[error(transparent)]
    Fsm(#[from] FsmError),

    #[error(transparent)]
    Config(#[from] constellation_config::ConfigError),
}
