//! Heartbeat publishing and peer liveness tracking.
//!
//! `HeartbeatSender` publishes this satellite's state on a PUB socket.
//! `PeerRegistry`/`HeartbeatChecker` subscribes to peers discovered through
//! CHIRP's `HEARTBEAT` service and drives the local FSM when a peer goes
//! quiet or reports trouble, the same last-seen/failure-count shape as a
//! client-liveness tracker, adapted from async client bookkeeping to a
//! synchronous peer-of-peers checker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use constellation_proto::chirp::DiscoveredService;
use constellation_proto::chp::HeartbeatMessage;

use crate::error::FsmError;
use crate::fsm::Fsm;
use crate::task_queue::{Task, TaskSender};

/// How many missed intervals before a peer is considered failed.
pub const HEARTBEAT_LIVENESS_FACTOR: u32 = 3;

/// Publishes this satellite's `(name, state, interval)` periodically on a
/// PUB socket.
pub struct HeartbeatSender {
    stop: Arc<Mutex<bool>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HeartbeatSender {
    pub fn start(endpoint: &str, satellite_name: String, interval: Duration, fsm: Arc<Fsm>) -> Result<Self, zmq::Error> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::PUB)?;
        socket.bind(endpoint)?;

        let stop = Arc::new(Mutex::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let interval_ms = interval.as_millis() as u32;

        let thread = std::thread::Builder::new()
            .name("heartbeat-sender".into())
            .spawn(move || {
                while !*stop_for_thread.lock().unwrap() {
                    let message = HeartbeatMessage::new(satellite_name.clone(), fsm.state().to_string(), interval_ms);
                    match message.encode() {
                        Ok(bytes) => {
                            if let Err(err) = socket.send(bytes, 0) {
                                warn!(%err, "failed to publish heartbeat");
                            }
                        }
                        Err(err) => warn!(%err, "failed to encode heartbeat"),
                    }
                    std::thread::sleep(interval);
                }
            })
            .expect("spawn heartbeat-sender thread");

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn shutdown(mut self) {
        *self.stop.lock().unwrap() = true;
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

struct PeerState {
    last_seen: Instant,
    remote_state: String,
    notified_failed: bool,
}

/// Tracks peers discovered via CHIRP's `HEARTBEAT` service, keyed by
/// satellite name (expected unique within a group). A single SUB socket
/// connects to every peer's heartbeat PUB endpoint.
pub struct PeerRegistry {
    socket: Mutex<zmq::Socket>,
    peers: Mutex<HashMap<String, PeerState>>,
}

impl PeerRegistry {
    pub fn new() -> Result<Self, zmq::Error> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::SUB)?;
        socket.set_subscribe(b"")?;
        socket.set_rcvtimeo(100)?;
        Ok(Self {
            socket: Mutex::new(socket),
            peers: Mutex::new(HashMap::new()),
        })
    }

    /// Connect to a newly discovered HEARTBEAT service. Called from the
    /// CHIRP callback registered for `ServiceIdentifier::Heartbeat`.
    pub fn register_peer(&self, service: &DiscoveredService) {
        let endpoint = format!("tcp://{}:{}", service.address.ip(), service.port);
        if let Err(err) = self.socket.lock().unwrap().connect(&endpoint) {
            warn!(%err, %endpoint, "failed to connect to peer heartbeat endpoint");
            return;
        }
        debug!(%endpoint, host_uuid = %service.host_uuid, "connected to peer heartbeat endpoint");
    }

    /// Drain any pending heartbeat frames and update peer state. Call this
    /// from the checker's polling loop.
    fn poll_once(&self) {
        let socket = self.socket.lock().unwrap();
        loop {
            match socket.recv_bytes(0) {
                Ok(bytes) => match HeartbeatMessage::decode(&bytes) {
                    Ok(message) => {
                        let mut peers = self.peers.lock().unwrap();
                        let entry = peers.entry(message.satellite_name.clone()).or_insert_with(|| PeerState {
                            last_seen: Instant::now(),
                            remote_state: message.state_id.clone(),
                            notified_failed: false,
                        });
                        entry.last_seen = Instant::now();
                        entry.remote_state = message.state_id;
                        entry.notified_failed = false;
                    }
                    Err(err) => warn!(%err, "malformed heartbeat frame"),
                },
                Err(zmq::Error::EAGAIN) => break,
                Err(err) => {
                    warn!(%err, "heartbeat transport error");
                    break;
                }
            }
        }
    }

    /// Peers considered failed under `k × interval`, or reporting
    /// ERROR/SAFE, that have not yet been notified on.
    fn due_for_action(&self, interval: Duration, liveness_factor: u32) -> Vec<(String, PeerAction)> {
        let threshold = interval * liveness_factor;
        let mut peers = self.peers.lock().unwrap();
        let mut due = Vec::new();
        for (name, state) in peers.iter_mut() {
            if state.notified_failed {
                continue;
            }
            let action = if state.last_seen.elapsed() > threshold {
                Some(PeerAction::Missing)
            } else if state.remote_state == "ERROR" {
                Some(PeerAction::Error)
            } else if state.remote_state == "SAFE" {
                Some(PeerAction::Safe)
            } else {
                None
            };
            if let Some(action) = action {
                state.notified_failed = true;
                due.push((name.clone(), action));
            }
        }
        due
    }
}

enum PeerAction {
    Missing,
    Error,
    Safe,
}

/// Background thread that polls `PeerRegistry` and enqueues FSM-driving
/// actions onto the task queue when a peer fails.
pub struct HeartbeatChecker {
    stop: Arc<Mutex<bool>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HeartbeatChecker {
    pub fn start(registry: Arc<PeerRegistry>, interval: Duration, liveness_factor: u32, tasks: TaskSender, fsm: Arc<Fsm>) -> Self {
        let stop = Arc::new(Mutex::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let poll_interval = interval / 2;

        let thread = std::thread::Builder::new()
            .name("heartbeat-checker".into())
            .spawn(move || {
                while !*stop_for_thread.lock().unwrap() {
                    registry.poll_once();
                    for (name, action) in registry.due_for_action(interval, liveness_factor) {
                        let fsm = Arc::clone(&fsm);
                        match action {
                            PeerAction::Missing | PeerAction::Error => {
                                warn!(peer = %name, "peer failed, driving local FSM through failure");
                                let _ = tasks.send(Task::HeartbeatAction {
                                    run: Box::new(move || {
                                        fsm.fail(FsmError::PeerFailure { name });
                                    }),
                                });
                            }
                            PeerAction::Safe => {
                                info!(peer = %name, "peer reported SAFE, driving local FSM through interrupt");
                                let _ = tasks.send(Task::HeartbeatAction {
                                    run: Box::new(move || {
                                        if let Err(err) = fsm.interrupt() {
                                            warn!(%err, peer = %name, "interrupt in response to peer SAFE was rejected");
                                        }
                                    }),
                                });
                            }
                        }
                    }
                    std::thread::sleep(poll_interval.max(Duration::from_millis(10)));
                }
            })
            .expect("spawn heartbeat-checker thread");

        Self {
            stop,
            thread: Some(thread),
        }
    }

    pub fn shutdown(mut self) {
        *self.stop.lock().unwrap() = true;
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_peer_is_reported_once() {
        let registry = PeerRegistry::new().unwrap();
        {
            let mut peers = registry.peers.lock().unwrap();
            peers.insert(
                "sat-b".to_string(),
                PeerState {
                    last_seen: Instant::now() - Duration::from_secs(10),
                    remote_state: "RUN".to_string(),
                    notified_failed: false,
                },
            );
        }
        let due = registry.due_for_action(Duration::from_millis(100), HEARTBEAT_LIVENESS_FACTOR);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, "sat-b");
        // A second call should not re-report the same peer.
        let due_again = registry.due_for_action(Duration::from_millis(100), HEARTBEAT_LIVENESS_FACTOR);
        assert!(due_again.is_empty());
    }

    #[test]
    fn fresh_peer_in_run_is_not_due() {
        let registry = PeerRegistry::new().unwrap();
        {
            let mut peers = registry.peers.lock().unwrap();
            peers.insert(
                "sat-c".to_string(),
                PeerState {
                    last_seen: Instant::now(),
                    remote_state: "RUN".to_string(),
                    notified_failed: false,
                },
            );
        }
        let due = registry.due_for_action(Duration::from_millis(1000), HEARTBEAT_LIVENESS_FACTOR);
        assert!(due.is_empty());
    }

    #[test]
    fn peer_in_safe_state_is_flagged() {
        let registry = PeerRegistry::new().unwrap();
        {
            let mut peers = registry.peers.lock().unwrap();
            peers.insert(
                "sat-d".to_string(),
                PeerState {
                    last_seen: Instant::now(),
                    remote_state: "SAFE".to_string(),
                    notified_failed: false,
                },
            );
        }
        let due = registry.due_for_action(Duration::from_millis(1000), HEARTBEAT_LIVENESS_FACTOR);
        assert_eq!(due.len(), 1);
        assert!(matches!(due[0].1, PeerAction::Safe));
    }
}
