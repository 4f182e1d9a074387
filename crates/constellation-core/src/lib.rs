//! Satellite runtime for Constellation: CHIRP discovery, CSCP command
//! dispatch, the lifecycle FSM, the task queue, and heartbeat liveness,
//! composed into a running satellite process by [`satellite::Satellite`].

pub mod chirp;
pub mod cscp;
pub mod error;
pub mod fsm;
pub mod heartbeat;
pub mod identity;
pub mod satellite;
pub mod task_queue;

pub use error::{ChirpError, CoreError, CscpError, FsmError};
pub use fsm::{ClosureBehavior, Fsm, SatelliteBehavior, State, StopToken};
pub use identity::{RunIdentifier, SatelliteIdentity};
pub use satellite::{Satellite, SatelliteEndpoints};
