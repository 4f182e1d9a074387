//! CHIRP: UDP-broadcast peer discovery within a named group.

use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, info, warn};
use uuid::Uuid;

use constellation_proto::chirp::{ChirpMessage, MessageType, ServiceIdentifier, ServiceKey};
pub use constellation_proto::chirp::{CHIRP_PORT, DiscoveredService};

use crate::error::ChirpError;
use crate::identity::SatelliteIdentity;
use crate::task_queue::{Task, TaskSender};

const LISTENER_IDLE_SLEEP: Duration = Duration::from_millis(100);
const DEPART_FLUSH_DELAY: Duration = Duration::from_millis(500);

/// A callback armed for a service kind via `register_request`. Invoked on
/// the task-queue thread, never from the listener thread directly.
pub type ChirpCallback = Arc<dyn Fn(DiscoveredService) + Send + Sync>;

struct Shared {
    identity: SatelliteIdentity,
    host_uuid: Uuid,
    socket: UdpSocket,
    broadcast_addr: SocketAddr,
    offers: Mutex<HashMap<u16, ServiceIdentifier>>,
    callbacks: Mutex<HashMap<ServiceIdentifier, ChirpCallback>>,
    discovered: Mutex<HashMap<ServiceKey, DiscoveredService>>,
    tasks: TaskSender,
    stop: Mutex<bool>,
}

/// The CHIRP broadcast manager: owns the UDP socket, the offer/callback
/// registries, and the discovered-service cache. Spawns its own listener
/// thread on construction.
pub struct BroadcastManager {
    shared: Arc<Shared>,
    listener: Option<std::thread::JoinHandle<()>>,
}

impl BroadcastManager {
    /// Bind the broadcast socket and start the listener thread.
    pub fn start(
        identity: SatelliteIdentity,
        host_uuid: Uuid,
        port: u16,
        tasks: TaskSender,
    ) -> Result<Self, ChirpError> {
        let bind_addr: SocketAddr = format!("0.0.0.0:{port}").parse().expect("valid socket addr");

        let socket2 = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| ChirpError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;
        socket2.set_reuse_address(true).map_err(|e| ChirpError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;
        socket2.set_broadcast(true).map_err(|e| ChirpError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;
        socket2.bind(&bind_addr.into()).map_err(|e| ChirpError::Bind {
            addr: bind_addr.to_string(),
            source: e,
        })?;
        socket2
            .set_read_timeout(Some(LISTENER_IDLE_SLEEP))
            .map_err(|e| ChirpError::Bind {
                addr: bind_addr.to_string(),
                source: e,
            })?;

        let socket: UdpSocket = socket2.into();
        let broadcast_addr: SocketAddr = format!("255.255.255.255:{port}").parse().expect("valid broadcast addr");

        let shared = Arc::new(Shared {
            identity,
            host_uuid,
            socket,
            broadcast_addr,
            offers: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            discovered: Mutex::new(HashMap::new()),
            tasks,
            stop: Mutex::new(false),
        });

        let listener_shared = Arc::clone(&shared);
        let listener = std::thread::Builder::new()
            .name("chirp-listener".into())
            .spawn(move || listen(listener_shared))
            .expect("spawn chirp listener thread");

        info!(group = %shared.identity.group, port, "CHIRP broadcast manager started");

        Ok(Self {
            shared,
            listener: Some(listener),
        })
    }

    /// A cloneable handle for issuing broadcasts from code that doesn't own
    /// the `BroadcastManager` itself (e.g. a CSCP command closure).
    pub fn handle(&self) -> ChirpHandle {
        ChirpHandle(Arc::clone(&self.shared))
    }

    pub fn get_host_uuid(&self) -> Uuid {
        self.shared.host_uuid
    }

    /// Add or replace an advertised service. Idempotent per port.
    pub fn register_offer(&self, service_id: ServiceIdentifier, port: u16) {
        let mut offers = self.shared.offers.lock().unwrap();
        if offers.insert(port, service_id).is_some() {
            debug!(port, ?service_id, "CHIRP offer replaced for port");
        }
    }

    /// Remove an advertised service without waiting for shutdown.
    pub fn unregister_offer(&self, port: u16) {
        self.shared.offers.lock().unwrap().remove(&port);
    }

    /// Arm a callback for `service_id`. If matching services are already in
    /// the discovery cache, enqueue one invocation per cached peer
    /// immediately. Re-registration replaces the previous callback and logs
    /// a warning.
    pub fn register_request(&self, service_id: ServiceIdentifier, callback: ChirpCallback) {
        let replaced = self
            .shared
            .callbacks
            .lock()
            .unwrap()
            .insert(service_id, Arc::clone(&callback))
            .is_some();
        if replaced {
            warn!(?service_id, "CHIRP callback replaced for service");
        }

        let already_discovered: Vec<DiscoveredService> = self
            .shared
            .discovered
            .lock()
            .unwrap()
            .values()
            .filter(|svc| svc.service_id == service_id)
            .cloned()
            .collect();

        for service in already_discovered {
            let _ = self.shared.tasks.send(Task::ChirpCallback {
                callback: Arc::clone(&callback),
                service,
            });
        }
    }

    /// Remove an armed callback.
    pub fn unregister_request(&self, service_id: ServiceIdentifier) {
        self.shared.callbacks.lock().unwrap().remove(&service_id);
    }

    /// Emit OFFER for one or all registered services.
    pub fn broadcast_offers(&self, service_id: Option<ServiceIdentifier>) {
        broadcast_offers(&self.shared, service_id)
    }

    /// Emit REQUEST for every armed callback's service kind.
    pub fn broadcast_requests(&self) {
        broadcast_requests(&self.shared)
    }

    /// Emit DEPART for every registered service. Called at shutdown.
    pub fn broadcast_depart(&self) {
        broadcast_depart(&self.shared)
    }

    pub fn get_discovered(&self, service_id: ServiceIdentifier) -> Vec<DiscoveredService> {
        self.shared
            .discovered
            .lock()
            .unwrap()
            .values()
            .filter(|svc| svc.service_id == service_id)
            .cloned()
            .collect()
    }

    /// Broadcast DEPART for every offered service, wait for the network to
    /// flush, then signal the listener thread to exit.
    pub fn shutdown(mut self) {
        self.broadcast_depart();
        std::thread::sleep(DEPART_FLUSH_DELAY);
        *self.shared.stop.lock().unwrap() = true;
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }
}

/// A cheap, cloneable reference to a running `BroadcastManager`'s shared
/// state. Lets CSCP command handlers re-announce services without owning
/// the manager (and its listener thread) outright.
#[derive(Clone)]
pub struct ChirpHandle(Arc<Shared>);

impl ChirpHandle {
    pub fn broadcast_offers(&self, service_id: Option<ServiceIdentifier>) {
        broadcast_offers(&self.0, service_id)
    }

    pub fn broadcast_requests(&self) {
        broadcast_requests(&self.0)
    }
}

fn send(shared: &Shared, msg: ChirpMessage) {
    match msg.encode_datagram() {
        Ok(bytes) => {
            if let Err(e) = shared.socket.send_to(&bytes, shared.broadcast_addr) {
                warn!(error = %e, "failed to send CHIRP datagram");
            }
        }
        Err(e) => warn!(error = %e, "failed to encode CHIRP datagram"),
    }
}

fn broadcast_offers(shared: &Shared, service_id: Option<ServiceIdentifier>) {
    let offers = shared.offers.lock().unwrap().clone();
    for (port, sid) in offers {
        if service_id.is_none() || service_id == Some(sid) {
            send(shared, ChirpMessage::offer(&shared.identity.name, &shared.identity.group, shared.host_uuid, sid, port));
        }
    }
}

fn broadcast_requests(shared: &Shared) {
    let service_ids: Vec<ServiceIdentifier> = shared.callbacks.lock().unwrap().keys().copied().collect();
    for sid in service_ids {
        send(shared, ChirpMessage::request(&shared.identity.name, &shared.identity.group, shared.host_uuid, sid));
    }
}

fn broadcast_depart(shared: &Shared) {
    let offers = shared.offers.lock().unwrap().clone();
    for (port, sid) in offers {
        send(shared, ChirpMessage::depart(&shared.identity.name, &shared.identity.group, shared.host_uuid, sid, port));
    }
}

fn listen(shared: Arc<Shared>) {
    let mut buf = [0u8; 4096];
    loop {
        if *shared.stop.lock().unwrap() {
            return;
        }

        let (len, from) = match shared.socket.recv_from(&mut buf) {
            Ok(result) => result,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                warn!(error = %e, "CHIRP listener recv error");
                continue;
            }
        };

        let msg = match ChirpMessage::decode_datagram(&buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!(error = %e, "dropping malformed CHIRP datagram");
                continue;
            }
        };

        if msg.group != shared.identity.group {
            continue;
        }
        if msg.host_uuid == shared.host_uuid {
            continue;
        }

        handle_message(&shared, msg, from);
    }
}

fn handle_message(shared: &Arc<Shared>, msg: ChirpMessage, from: SocketAddr) {
    match msg.msg_type {
        MessageType::Request => {
            let offers = shared.offers.lock().unwrap();
            for (&port, &sid) in offers.iter() {
                if sid == msg.service_id {
                    let reply = ChirpMessage::offer(
                        &shared.identity.name,
                        &shared.identity.group,
                        shared.host_uuid,
                        sid,
                        port,
                    );
                    if let Ok(bytes) = reply.encode_datagram() {
                        let _ = shared.socket.send_to(&bytes, from);
                    }
                }
            }
        }
        MessageType::Offer => {
            let service = DiscoveredService {
                host_uuid: msg.host_uuid,
                service_id: msg.service_id,
                address: from,
                port: msg.port,
                alive: true,
            };
            let key = service.key();

            let is_new = {
                let mut discovered = shared.discovered.lock().unwrap();
                if discovered.contains_key(&key) {
                    false
                } else {
                    discovered.insert(key, service.clone());
                    true
                }
            };

            if !is_new {
                debug!(?key, "ignoring re-OFFER for already-known service");
                return;
            }

            info!(host = %msg.host_uuid, ?msg.service_id, port = msg.port, "discovered CHIRP service");

            if let Some(callback) = shared.callbacks.lock().unwrap().get(&msg.service_id).cloned() {
                let _ = shared.tasks.send(Task::ChirpCallback { callback, service });
            }
        }
        MessageType::Depart => {
            if msg.port == 0 {
                return;
            }
            let key = ServiceKey {
                host_uuid: msg.host_uuid,
                service_id: msg.service_id,
                port: msg.port,
            };

            let removed = shared.discovered.lock().unwrap().remove(&key);
            if let Some(mut service) = removed {
                service.alive = false;
                info!(host = %msg.host_uuid, ?msg.service_id, port = msg.port, "CHIRP peer departed");
                if let Some(callback) = shared.callbacks.lock().unwrap().get(&msg.service_id).cloned() {
                    let _ = shared.tasks.send(Task::ChirpCallback { callback, service });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task_queue::TaskQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn start_manager(name: &str, group: &str, port: u16) -> (BroadcastManager, TaskQueue) {
        let queue = TaskQueue::new();
        let identity = SatelliteIdentity::new(name, group, "0.0.0.0");
        let manager = BroadcastManager::start(identity, Uuid::new_v4(), port, queue.sender()).unwrap();
        (manager, queue)
    }

    #[test]
    fn discover_then_register_fires_callback_once() {
        // Both managers bind the same CHIRP port (SO_REUSEADDR makes that
        // legal for multiple local satellites) and broadcast to it.
        let (a, _queue_a) = start_manager("sat-a", "test-group-1", 42201);
        a.register_offer(ServiceIdentifier::Control, 23999);

        let (b, queue_b) = start_manager("sat-b", "test-group-1", 42201);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        b.register_request(
            ServiceIdentifier::Control,
            Arc::new(move |_svc: DiscoveredService| {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        for _ in 0..20 {
            a.broadcast_offers(None);
            std::thread::sleep(Duration::from_millis(50));
            if let Ok(task) = queue_b.receiver().recv_timeout(Duration::from_millis(50)) {
                task.run();
                break;
            }
        }

        assert_eq!(seen.load(Ordering::SeqCst), 1);

        a.shutdown();
        b.shutdown();
    }

    #[test]
    fn service_registries_are_idempotent_per_port() {
        let (a, _queue) = start_manager("sat-c", "test-group-2", 0);
        a.register_offer(ServiceIdentifier::Control, 100);
        a.register_offer(ServiceIdentifier::Heartbeat, 100);
        assert_eq!(a.shared.offers.lock().unwrap().len(), 1);
        a.shutdown();
    }
}
