//! Composes CHIRP discovery, the CSCP command receiver, the lifecycle FSM,
//! the heartbeat sender/checker, and the task queue into a single running
//! satellite process.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{error, info};

use constellation_config::{Configuration, MergePolicy};
use constellation_proto::chirp::ServiceIdentifier;

use crate::chirp::BroadcastManager;
use crate::cscp::{CommandFailure, CommandReceiver, CommandRegistry};
use crate::error::{CoreError, FsmError};
use crate::fsm::{Fsm, SatelliteBehavior};
use crate::heartbeat::{HeartbeatChecker, HeartbeatSender, PeerRegistry};
use crate::identity::{RunIdentifier, SatelliteIdentity};
use crate::task_queue::{Task, TaskQueue};

const SHUTDOWN_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1000);

/// Network endpoints a satellite binds at construction.
#[derive(Debug, Clone)]
pub struct SatelliteEndpoints {
    pub chirp_port: u16,
    pub cscp_endpoint: String,
    pub heartbeat_endpoint: String,
}

pub struct Satellite {
    identity: SatelliteIdentity,
    fsm: Arc<Fsm>,
    chirp: BroadcastManager,
    cscp: Mutex<Option<CommandReceiver>>,
    peer_registry: Arc<PeerRegistry>,
    heartbeat_sender: Mutex<Option<HeartbeatSender>>,
    heartbeat_checker: Mutex<Option<HeartbeatChecker>>,
    heartbeat_endpoint: String,
    heartbeat_interval: Mutex<Duration>,
    heartbeat_liveness_factor: Mutex<u32>,
    tasks: TaskQueue,
    stop: Arc<Mutex<bool>>,
}

impl Satellite {
    pub fn new(identity: SatelliteIdentity, endpoints: SatelliteEndpoints, behavior: Arc<dyn SatelliteBehavior>) -> Result<Arc<Self>, CoreError> {
        let host_uuid = crate::identity::new_host_uuid();
        let tasks = TaskQueue::new();
        let fsm = Arc::new(Fsm::new(behavior));

        let chirp = BroadcastManager::start(identity.clone(), host_uuid, endpoints.chirp_port, tasks.sender())?;
        let peer_registry = Arc::new(PeerRegistry::new().map_err(crate::error::CscpError::Transport)?);

        let registry = Arc::new(CommandRegistry::new());
        let cscp = CommandReceiver::start(&endpoints.cscp_endpoint, identity.name.clone(), Arc::clone(&registry), tasks.sender())?;

        let satellite = Arc::new(Self {
            identity,
            fsm,
            chirp,
            cscp: Mutex::new(Some(cscp)),
            peer_registry: Arc::clone(&peer_registry),
            heartbeat_sender: Mutex::new(None),
            heartbeat_checker: Mutex::new(None),
            heartbeat_endpoint: endpoints.heartbeat_endpoint,
            heartbeat_interval: Mutex::new(DEFAULT_HEARTBEAT_INTERVAL),
            heartbeat_liveness_factor: Mutex::new(crate::heartbeat::HEARTBEAT_LIVENESS_FACTOR),
            tasks,
            stop: Arc::new(Mutex::new(false)),
        });

        register_standard_commands(&registry, Arc::clone(&satellite));

        let registry_peer = Arc::clone(&peer_registry);
        satellite
            .chirp
            .register_request(ServiceIdentifier::Heartbeat, Arc::new(move |service| registry_peer.register_peer(&service)));

        Ok(satellite)
    }

    pub fn fsm(&self) -> &Arc<Fsm> {
        &self.fsm
    }

    pub fn identity(&self) -> &SatelliteIdentity {
        &self.identity
    }

    /// Advertise a service over CHIRP (e.g. `CONTROL` on the CSCP port,
    /// `HEARTBEAT` on the heartbeat port). Call before `run`.
    pub fn advertise(&self, service_id: ServiceIdentifier, port: u16) {
        self.chirp.register_offer(service_id, port);
    }

    /// Arm a CHIRP discovery callback for `service_id`, invoked on the task
    /// loop for every matching peer already discovered and every future one.
    pub fn on_discover(&self, service_id: ServiceIdentifier, callback: crate::chirp::ChirpCallback) {
        self.chirp.register_request(service_id, callback);
    }

    /// Peers currently known for `service_id`.
    pub fn discovered(&self, service_id: ServiceIdentifier) -> Vec<crate::chirp::DiscoveredService> {
        self.chirp.get_discovered(service_id)
    }

    /// Apply `heartbeat.interval_ms` / `heartbeat.liveness_factor` from a
    /// just-loaded `Configuration`. Reading marks the keys used, so a
    /// satellite that sets them does not see them reported as ignored
    /// parameters. Falls back to the existing value for whichever key is
    /// absent.
    fn apply_heartbeat_config(&self, config: &Configuration) {
        if let Some(ms) = config.get_u32("heartbeat.interval_ms") {
            *self.heartbeat_interval.lock().unwrap() = Duration::from_millis(ms as u64);
        }
        if let Some(factor) = config.get_u32("heartbeat.liveness_factor") {
            *self.heartbeat_liveness_factor.lock().unwrap() = factor;
        }
    }

    /// Start the heartbeat sender and checker. Called from the `launch`
    /// command handler.
    fn start_heartbeat(&self) {
        let interval = *self.heartbeat_interval.lock().unwrap();
        let liveness_factor = *self.heartbeat_liveness_factor.lock().unwrap();
        match HeartbeatSender::start(&self.heartbeat_endpoint, self.identity.name.clone(), interval, Arc::clone(&self.fsm)) {
            Ok(sender) => *self.heartbeat_sender.lock().unwrap() = Some(sender),
            Err(err) => error!(%err, "failed to start heartbeat sender"),
        }
        let checker = HeartbeatChecker::start(Arc::clone(&self.peer_registry), interval, liveness_factor, self.tasks.sender(), Arc::clone(&self.fsm));
        *self.heartbeat_checker.lock().unwrap() = Some(checker);
    }

    /// Stop the heartbeat sender and checker. Called from `land`,
    /// `interrupt`, and on failure.
    fn stop_heartbeat(&self) {
        if let Some(sender) = self.heartbeat_sender.lock().unwrap().take() {
            sender.shutdown();
        }
        if let Some(checker) = self.heartbeat_checker.lock().unwrap().take() {
            checker.shutdown();
        }
    }

    /// Run the task loop until `shutdown` is requested. This thread is the
    /// only legitimate mutator of FSM state outside the acquisition thread.
    pub fn run(self: &Arc<Self>) {
        info!(name = %self.identity.name, group = %self.identity.group, "satellite task loop starting");
        loop {
            if *self.stop.lock().unwrap() {
                break;
            }
            match self.tasks.receiver().recv_timeout(Duration::from_millis(500)) {
                Ok(Task::DelayedExit { at, run }) => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    std::thread::sleep(remaining);
                    run_catching_panics(run);
                    break;
                }
                Ok(task) => run_catching_panics_task(task),
                Err(_timeout) => continue,
            }
        }
        self.shutdown_components();
    }

    fn shutdown_components(&self) {
        self.chirp.broadcast_depart();
        self.stop_heartbeat();
        if let Some(cscp) = self.cscp.lock().unwrap().take() {
            cscp.shutdown();
        }
        info!(name = %self.identity.name, "satellite task loop stopped");
    }

    /// Enqueue the `shutdown` command's delayed process exit, so the CSCP
    /// reply is flushed before the task loop stops.
    fn request_shutdown(self: &Arc<Self>) {
        let stop = Arc::clone(&self.stop);
        let _ = self.tasks.sender().send(Task::DelayedExit {
            at: Instant::now() + SHUTDOWN_DELAY,
            run: Box::new(move || {
                *stop.lock().unwrap() = true;
            }),
        });
    }
}

fn run_catching_panics_task(task: Task) {
    match task {
        Task::ChirpCallback { callback, service } => run_catching_panics(Box::new(move || callback(service))),
        Task::CscpDispatch { run } => run_catching_panics(run),
        Task::HeartbeatAction { run } => run_catching_panics(run),
        Task::DelayedExit { run, .. } => run_catching_panics(run),
    }
}

fn run_catching_panics(run: Box<dyn FnOnce() + Send>) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(run)) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(%message, "task panicked; task loop continues");
    }
}

fn fsm_failure_to_command(err: FsmError) -> CommandFailure {
    match err {
        FsmError::DisallowedTransition { from, event } => CommandFailure::BadTransition(format!("'{event}' is not allowed from state {from}")),
        FsmError::HookFailed { event, message } => CommandFailure::Other(format!("'{event}' hook failed: {message}")),
        FsmError::StopTimeout { timeout_secs } => CommandFailure::Other(format!("acquisition did not stop within {timeout_secs}s")),
        FsmError::PeerFailure { name } => CommandFailure::Other(format!("peer {name} failed")),
    }
}

fn register_standard_commands(registry: &Arc<CommandRegistry>, satellite: Arc<Satellite>) {
    {
        let registry_for_list = Arc::clone(registry);
        registry.register("get_commands", "list public commands", move |_payload: Option<&[u8]>| {
            Ok((Some(format_command_list(&registry_for_list.public_commands())), None))
        });
    }
    {
        let registry_for_list = Arc::clone(registry);
        registry.register("_get_commands", "list hidden commands", move |_payload: Option<&[u8]>| {
            Ok((Some(format_command_list(&registry_for_list.hidden_commands())), None))
        });
    }

    let sat = Arc::clone(&satellite);
    registry.register("get_name", "satellite name", move |_payload: Option<&[u8]>| Ok((Some(sat.identity.name.clone()), None)));

    registry.register("get_version", "crate version", |_payload: Option<&[u8]>| {
        Ok((Some(env!("CARGO_PKG_VERSION").to_string()), None))
    });

    let sat = Arc::clone(&satellite);
    registry.register("get_state", "current FSM state", move |_payload: Option<&[u8]>| Ok((Some(sat.fsm.state().to_string()), None)));

    let sat = Arc::clone(&satellite);
    registry.register("get_status", "last transition's status text", move |_payload: Option<&[u8]>| Ok((Some(sat.fsm.status()), None)));

    let sat = Arc::clone(&satellite);
    registry.register("get_run_id", "active run identifier", move |_payload: Option<&[u8]>| {
        Ok((Some(sat.fsm.run_id().map(|r| r.to_string()).unwrap_or_else(|| "none".to_string())), None))
    });

    let sat = Arc::clone(&satellite);
    registry.register("shutdown", "terminate the satellite process", move |_payload: Option<&[u8]>| {
        sat.request_shutdown();
        Ok((Some("shutting down".to_string()), None))
    });

    let sat = Arc::clone(&satellite);
    registry.register_with_predicate(
        "initialize",
        "load configuration and move to INIT",
        move |payload: Option<&[u8]>| {
            let config = decode_toml_payload(payload)?;
            sat.apply_heartbeat_config(&config);
            sat.fsm.initialize(config).map(|text| (Some(text), None)).map_err(fsm_failure_to_command)
        },
        None::<fn() -> bool>,
    );

    let sat = Arc::clone(&satellite);
    let sat_gate = Arc::clone(&satellite);
    registry.register_with_predicate(
        "launch",
        "move from INIT to ORBIT",
        move |_payload: Option<&[u8]>| {
            let result = sat.fsm.launch().map(|text| (Some(text), None)).map_err(fsm_failure_to_command);
            if result.is_ok() {
                sat.start_heartbeat();
            }
            result
        },
        Some(move || sat_gate.fsm.state() == crate::fsm::State::Init),
    );

    let sat = Arc::clone(&satellite);
    let sat_gate = Arc::clone(&satellite);
    registry.register_with_predicate(
        "start",
        "move from ORBIT to RUN with a run identifier",
        move |payload: Option<&[u8]>| {
            let run_id_text = decode_utf8_payload(payload)?;
            let run_id = RunIdentifier::new(run_id_text).ok_or_else(|| CommandFailure::WrongArgument("run id must be non-empty".to_string()))?;
            sat.fsm.start(run_id).map(|text| (Some(text), None)).map_err(fsm_failure_to_command)
        },
        Some(move || sat_gate.fsm.state() == crate::fsm::State::Orbit),
    );

    let sat = Arc::clone(&satellite);
    let sat_gate = Arc::clone(&satellite);
    registry.register_with_predicate(
        "stop",
        "move from RUN back to ORBIT",
        move |_payload: Option<&[u8]>| sat.fsm.stop().map(|text| (Some(text), None)).map_err(fsm_failure_to_command),
        Some(move || sat_gate.fsm.state() == crate::fsm::State::Run),
    );

    let sat = Arc::clone(&satellite);
    let sat_gate = Arc::clone(&satellite);
    registry.register_with_predicate(
        "land",
        "move from ORBIT back to INIT",
        move |_payload: Option<&[u8]>| {
            let result = sat.fsm.land().map(|text| (Some(text), None)).map_err(fsm_failure_to_command);
            sat.stop_heartbeat();
            result
        },
        Some(move || sat_gate.fsm.state() == crate::fsm::State::Orbit),
    );

    let sat = Arc::clone(&satellite);
    let sat_gate = Arc::clone(&satellite);
    registry.register_with_predicate(
        "interrupt",
        "move to SAFE from ORBIT or RUN",
        move |_payload: Option<&[u8]>| {
            let result = sat.fsm.interrupt().map(|text| (Some(text), None)).map_err(fsm_failure_to_command);
            sat.stop_heartbeat();
            result
        },
        Some(move || matches!(sat_gate.fsm.state(), crate::fsm::State::Orbit | crate::fsm::State::Run)),
    );

    let sat = Arc::clone(&satellite);
    let sat_gate = Arc::clone(&satellite);
    registry.register_with_predicate(
        "recover",
        "move from SAFE back to INIT",
        move |_payload: Option<&[u8]>| sat.fsm.recover().map(|text| (Some(text), None)).map_err(fsm_failure_to_command),
        Some(move || sat_gate.fsm.state() == crate::fsm::State::Safe),
    );

    let sat = Arc::clone(&satellite);
    let sat_gate = Arc::clone(&satellite);
    registry.register_with_predicate(
        "reconfigure",
        "merge configuration while in ORBIT",
        move |payload: Option<&[u8]>| {
            let overlay = decode_toml_payload(payload)?;
            sat.apply_heartbeat_config(&overlay);
            sat.fsm.reconfigure(overlay, MergePolicy::OnlyUnused).map(|text| (Some(text), None)).map_err(fsm_failure_to_command)
        },
        Some(move || sat_gate.fsm.state() == crate::fsm::State::Orbit),
    );

    let chirp_handle = satellite.chirp.handle();
    registry.register("register", "re-announce this satellite's CHIRP offers", move |_payload: Option<&[u8]>| {
        chirp_handle.broadcast_offers(None);
        chirp_handle.broadcast_requests();
        Ok((Some("re-announced".to_string()), None))
    });
}

fn format_command_list(commands: &[(String, String)]) -> String {
    let mut sorted = commands.to_vec();
    sorted.sort();
    sorted.into_iter().map(|(name, doc)| format!("{name}: {doc}")).collect::<Vec<_>>().join("\n")
}

fn decode_utf8_payload(payload: Option<&[u8]>) -> Result<String, CommandFailure> {
    let bytes = payload.ok_or_else(|| CommandFailure::WrongArgument("missing payload".to_string()))?;
    String::from_utf8(bytes.to_vec()).map_err(|err| CommandFailure::WrongArgument(format!("payload is not valid UTF-8: {err}")))
}

fn decode_toml_payload(payload: Option<&[u8]>) -> Result<Configuration, CommandFailure> {
    let text = match payload {
        Some(_) => decode_utf8_payload(payload)?,
        None => String::new(),
    };
    let table: toml::Table = text.parse().map_err(|err| CommandFailure::WrongArgument(format!("invalid configuration: {err}")))?;
    Ok(Configuration::from_table(table))
}
