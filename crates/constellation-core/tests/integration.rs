//! End-to-end scenarios spanning CHIRP discovery and CSCP command dispatch
//! across two in-process satellites, loopback only. No external services
//! are required.

use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use constellation_core::{ClosureBehavior, Satellite, SatelliteEndpoints, SatelliteIdentity};
use constellation_proto::chirp::ServiceIdentifier;
use constellation_proto::cscp::{CscpMessage, Verb};

static NEXT_PORT: AtomicU16 = AtomicU16::new(43000);

fn next_port() -> u16 {
    NEXT_PORT.fetch_add(1, Ordering::SeqCst)
}

fn start_satellite(name: &str, group: &str, chirp_port: u16) -> (Arc<Satellite>, String) {
    let cmd_port = next_port();
    let hb_port = next_port();
    let identity = SatelliteIdentity::new(name, group, "127.0.0.1");
    let endpoints = SatelliteEndpoints {
        chirp_port,
        cscp_endpoint: format!("tcp://127.0.0.1:{cmd_port}"),
        heartbeat_endpoint: format!("tcp://127.0.0.1:{hb_port}"),
    };
    let satellite = Satellite::new(identity, endpoints.clone(), Arc::new(ClosureBehavior::default())).expect("satellite should start");
    (satellite, endpoints.cscp_endpoint)
}

fn cscp_client(endpoint: &str) -> zmq::Socket {
    let ctx = zmq::Context::new();
    let socket = ctx.socket(zmq::REQ).unwrap();
    socket.set_rcvtimeo(2000).unwrap();
    socket.connect(endpoint).unwrap();
    socket
}

fn send_command(socket: &zmq::Socket, command: &str, payload: Option<Vec<u8>>) -> CscpMessage {
    let request = CscpMessage::request("test-client", command, payload);
    socket.send_multipart(request.encode_parts().unwrap(), 0).unwrap();
    let parts = socket.recv_multipart(0).unwrap();
    CscpMessage::decode_parts(&parts).unwrap()
}

/// Runs `satellite.run()` on a dedicated thread and returns its handle,
/// joined once the test shuts the satellite down via CSCP.
fn spawn_run(satellite: &Arc<Satellite>) -> std::thread::JoinHandle<()> {
    let satellite = Arc::clone(satellite);
    std::thread::spawn(move || satellite.run())
}

#[test]
fn discover_then_register() {
    let chirp_port = next_port();
    let (a, cmd_a) = start_satellite("sat-a", "it-discover-then-register", chirp_port);
    a.advertise(ServiceIdentifier::Control, 23999);
    let (b, _cmd_b) = start_satellite("sat-b", "it-discover-then-register", chirp_port);

    let a_thread = spawn_run(&a);
    let b_thread = spawn_run(&b);

    // A broadcasts its offer before B arms any callback for it.
    let cscp_a = cscp_client(&cmd_a);
    let reply = send_command(&cscp_a, "register", None);
    assert_eq!(reply.verb, Verb::Success);
    std::thread::sleep(Duration::from_millis(300));

    // register_request's already-discovered check fires the callback
    // immediately from B's cache rather than waiting on another datagram.
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_for_cb = Arc::clone(&seen);
    b.on_discover(
        ServiceIdentifier::Control,
        Arc::new(move |_svc| {
            seen_for_cb.fetch_add(1, Ordering::SeqCst);
        }),
    );
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    let discovered = b.discovered(ServiceIdentifier::Control);
    assert_eq!(discovered.len(), 1);
    assert_eq!(discovered[0].port, 23999);

    send_command(&cscp_a, "shutdown", None);
    a_thread.join().unwrap();
    b_thread.join().unwrap();
}

#[test]
fn register_then_discover() {
    let chirp_port = next_port();
    let (a, cmd_a) = start_satellite("sat-c", "it-register-then-discover", chirp_port);
    a.advertise(ServiceIdentifier::Control, 24999);
    let (b, _cmd_b) = start_satellite("sat-d", "it-register-then-discover", chirp_port);

    let a_thread = spawn_run(&a);
    let b_thread = spawn_run(&b);

    // B arms its callback first, with nothing yet in its discovery cache.
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_for_cb = Arc::clone(&seen);
    b.on_discover(
        ServiceIdentifier::Control,
        Arc::new(move |_svc| {
            seen_for_cb.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    let cscp_a = cscp_client(&cmd_a);
    send_command(&cscp_a, "register", None);
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(seen.load(Ordering::SeqCst), 1);

    send_command(&cscp_a, "shutdown", None);
    a_thread.join().unwrap();
    b_thread.join().unwrap();
}

#[test]
fn request_handling() {
    let chirp_port = next_port();
    let (a, cmd_a) = start_satellite("sat-e", "it-request-handling", chirp_port);
    a.advertise(ServiceIdentifier::Control, 25999);
    let (b, cmd_b) = start_satellite("sat-f", "it-request-handling", chirp_port);

    let a_thread = spawn_run(&a);
    let b_thread = spawn_run(&b);

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_for_cb = Arc::clone(&seen);
    b.on_discover(
        ServiceIdentifier::Control,
        Arc::new(move |_svc| {
            seen_for_cb.fetch_add(1, Ordering::SeqCst);
        }),
    );

    // B's "register" command broadcasts REQUEST for every service it has
    // an armed callback for; A answers with a unicast OFFER.
    let cscp_b = cscp_client(&cmd_b);
    send_command(&cscp_b, "register", None);
    std::thread::sleep(Duration::from_millis(300));

    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(b.discovered(ServiceIdentifier::Control).len(), 1);

    let cscp_a = cscp_client(&cmd_a);
    send_command(&cscp_a, "shutdown", None);
    send_command(&cscp_b, "shutdown", None);
    a_thread.join().unwrap();
    b_thread.join().unwrap();
}

#[test]
fn run_cycle() {
    let chirp_port = next_port();
    let (sat, cmd) = start_satellite("sat-g", "it-run-cycle", chirp_port);
    let thread = spawn_run(&sat);
    let client = cscp_client(&cmd);

    assert_eq!(send_command(&client, "initialize", None).verb, Verb::Success);
    assert_eq!(send_command(&client, "launch", None).verb, Verb::Success);
    assert_eq!(send_command(&client, "start", Some(b"run_42".to_vec())).verb, Verb::Success);
    assert_eq!(send_command(&client, "stop", None).verb, Verb::Success);

    let run_id_reply = send_command(&client, "get_run_id", None);
    assert_eq!(run_id_reply.payload.as_deref(), Some(b"run_42".as_slice()));

    let state_reply = send_command(&client, "get_state", None);
    assert_eq!(state_reply.payload.as_deref(), Some(b"Orbit".as_slice()));

    send_command(&client, "shutdown", None);
    thread.join().unwrap();
}

#[test]
fn unknown_command_is_reported() {
    let chirp_port = next_port();
    let (sat, cmd) = start_satellite("sat-h", "it-unknown-command", chirp_port);
    let thread = spawn_run(&sat);
    let client = cscp_client(&cmd);

    let reply = send_command(&client, "does_not_exist", None);
    assert_eq!(reply.verb, Verb::Unknown);
    assert_eq!(reply.payload.as_deref(), Some(b"does_not_exist".as_slice()));

    send_command(&client, "shutdown", None);
    thread.join().unwrap();
}

#[test]
#[ignore = "exercises the real 10s STOP_TIMEOUT"]
fn stop_timeout_drives_to_error() {
    use constellation_core::State;

    let chirp_port = next_port();
    let cmd_port = next_port();
    let hb_port = next_port();
    let identity = SatelliteIdentity::new("sat-i", "it-stop-timeout", "127.0.0.1");
    let endpoints = SatelliteEndpoints {
        chirp_port,
        cscp_endpoint: format!("tcp://127.0.0.1:{cmd_port}"),
        heartbeat_endpoint: format!("tcp://127.0.0.1:{hb_port}"),
    };
    let behavior = ClosureBehavior {
        run: Some(Box::new(|_stop| {
            std::thread::sleep(Duration::from_secs(60));
            Ok(None)
        })),
        ..Default::default()
    };
    let sat = Satellite::new(identity, endpoints.clone(), Arc::new(behavior)).unwrap();
    let thread = spawn_run(&sat);
    let client = cscp_client(&endpoints.cscp_endpoint);

    send_command(&client, "initialize", None);
    send_command(&client, "launch", None);
    send_command(&client, "start", Some(b"run_stuck".to_vec()));

    // `stop`'s REP socket blocks for the task-queue handler's reply, which
    // in turn blocks up to STOP_TIMEOUT (10s) on the acquisition thread.
    let stop_socket = cscp_client(&endpoints.cscp_endpoint);
    stop_socket.set_rcvtimeo(15_000).unwrap();
    send_command(&stop_socket, "stop", None);

    assert_eq!(sat.fsm().state(), State::Error);

    send_command(&client, "shutdown", None);
    thread.join().unwrap();
}
