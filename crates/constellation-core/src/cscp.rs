//! CSCP command receiver: a REQ/REP command channel that decodes framed
//! requests, routes them to registered handlers, enforces preconditions,
//! and replies with typed verbs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, error, warn};

use constellation_proto::cscp::{CscpMessage, Verb};

use crate::error::CscpError;
use crate::task_queue::{Task, TaskSender};

const RECEIVE_POLL_MS: i64 = 25;
const TRANSPORT_BACKOFF: Duration = Duration::from_millis(500);

/// Why a command handler failed to produce a reply, mapped onto CSCP verbs
/// per the receive loop's outcome table.
#[derive(Debug, Clone)]
pub enum CommandFailure {
    NotImplemented,
    BadTransition(String),
    WrongArgument(String),
    Other(String),
}

impl std::fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandFailure::NotImplemented => write!(f, "not implemented"),
            CommandFailure::BadTransition(msg) => write!(f, "{msg}"),
            CommandFailure::WrongArgument(msg) => write!(f, "{msg}"),
            CommandFailure::Other(msg) => write!(f, "{msg}"),
        }
    }
}

/// A successful handler outcome: `text = None` maps to `INCOMPLETE`,
/// `Some(text)` maps to `SUCCESS`.
pub type CommandOutcome = Result<(Option<String>, Option<Vec<u8>>), CommandFailure>;

/// A registered CSCP command handler. Implemented for any
/// `Fn(Option<&[u8]>) -> CommandOutcome` closure, so satellites register
/// handlers without defining a type per command.
pub trait CommandHandler: Send + Sync {
    fn call(&self, payload: Option<&[u8]>) -> CommandOutcome;
}

impl<F> CommandHandler for F
where
    F: Fn(Option<&[u8]>) -> CommandOutcome + Send + Sync,
{
    fn call(&self, payload: Option<&[u8]>) -> CommandOutcome {
        self(payload)
    }
}

/// A precondition gate consulted before a handler runs. `_<name>_is_allowed`
/// in the source mapping; here, an optional sibling registered alongside
/// the handler.
pub trait AllowedPredicate: Send + Sync {
    fn is_allowed(&self) -> bool;
}

impl<F> AllowedPredicate for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_allowed(&self) -> bool {
        self()
    }
}

struct CommandEntry {
    handler: Box<dyn CommandHandler>,
    is_allowed: Option<Box<dyn AllowedPredicate>>,
    doc: String,
    hidden: bool,
}

/// `command_name (lower-case) → handler`, with one-line documentation
/// captured at registration time for `get_commands`/`_get_commands`.
#[derive(Default)]
pub struct CommandRegistry {
    commands: RwLock<HashMap<String, CommandEntry>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name` (case-folded to lower-case). A name
    /// beginning with `_` is hidden from the public `get_commands` set.
    pub fn register<H>(&self, name: impl Into<String>, doc: impl Into<String>, handler: H)
    where
        H: CommandHandler + 'static,
    {
        self.register_with_predicate(name, doc, handler, None::<fn() -> bool>)
    }

    pub fn register_with_predicate<H, P>(
        &self,
        name: impl Into<String>,
        doc: impl Into<String>,
        handler: H,
        is_allowed: Option<P>,
    ) where
        H: CommandHandler + 'static,
        P: AllowedPredicate + 'static,
    {
        let name = name.into().to_lowercase();
        let hidden = name.starts_with('_');
        let entry = CommandEntry {
            handler: Box::new(handler),
            is_allowed: is_allowed.map(|p| Box::new(p) as Box<dyn AllowedPredicate>),
            doc: doc.into(),
            hidden,
        };
        self.commands.write().unwrap().insert(name, entry);
    }

    /// The public command set: name and one-line doc, excluding `_`-prefixed
    /// hidden commands.
    pub fn public_commands(&self) -> Vec<(String, String)> {
        self.commands
            .read()
            .unwrap()
            .iter()
            .filter(|(_, entry)| !entry.hidden)
            .map(|(name, entry)| (name.clone(), entry.doc.clone()))
            .collect()
    }

    /// The hidden command set: names beginning `_`.
    pub fn hidden_commands(&self) -> Vec<(String, String)> {
        self.commands
            .read()
            .unwrap()
            .iter()
            .filter(|(_, entry)| entry.hidden)
            .map(|(name, entry)| (name.clone(), entry.doc.clone()))
            .collect()
    }

    fn dispatch(&self, name: &str, payload: Option<&[u8]>) -> DispatchResult {
        let lower = name.to_lowercase();
        let commands = self.commands.read().unwrap();
        let Some(entry) = commands.get(&lower) else {
            return DispatchResult::Unknown;
        };
        if let Some(predicate) = &entry.is_allowed {
            if !predicate.is_allowed() {
                return DispatchResult::Invalid("Command not allowed (in current state)".to_string());
            }
        }
        match entry.handler.call(payload) {
            Ok((Some(text), reply_payload)) => DispatchResult::Success(text, reply_payload),
            Ok((None, _)) => DispatchResult::Incomplete("no result".to_string()),
            Err(CommandFailure::NotImplemented) => DispatchResult::NotImplemented,
            Err(CommandFailure::BadTransition(msg)) => DispatchResult::Invalid(msg),
            Err(CommandFailure::WrongArgument(msg)) => DispatchResult::Incomplete(msg),
            Err(CommandFailure::Other(msg)) => DispatchResult::Invalid(msg),
        }
    }
}

enum DispatchResult {
    Success(String, Option<Vec<u8>>),
    Incomplete(String),
    NotImplemented,
    Invalid(String),
    Unknown,
}

/// The background thread that owns the CSCP REP socket. Handler invocation
/// is deferred onto the shared task queue, since the task loop is the only
/// legitimate mutator of satellite state, so the receive thread hands off
/// a oneshot reply channel rather than calling the handler itself.
pub struct CommandReceiver {
    stop: Arc<Mutex<bool>>,
    listener: Option<std::thread::JoinHandle<()>>,
}

impl CommandReceiver {
    pub fn start(
        endpoint: &str,
        sender_identity: String,
        registry: Arc<CommandRegistry>,
        tasks: TaskSender,
    ) -> Result<Self, CscpError> {
        let ctx = zmq::Context::new();
        let socket = ctx.socket(zmq::REP).map_err(CscpError::Transport)?;
        socket.bind(endpoint).map_err(|source| CscpError::Bind {
            addr: endpoint.to_string(),
            source,
        })?;
        socket.set_rcvtimeo(RECEIVE_POLL_MS as i32).map_err(CscpError::Transport)?;

        let stop = Arc::new(Mutex::new(false));
        let stop_for_thread = Arc::clone(&stop);

        let listener = std::thread::Builder::new()
            .name("cscp-receiver".into())
            .spawn(move || receive_loop(socket, sender_identity, registry, tasks, stop_for_thread))
            .expect("spawn cscp-receiver thread");

        Ok(Self {
            stop,
            listener: Some(listener),
        })
    }

    pub fn shutdown(mut self) {
        *self.stop.lock().unwrap() = true;
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
    }
}

fn receive_loop(
    socket: zmq::Socket,
    sender_identity: String,
    registry: Arc<CommandRegistry>,
    tasks: TaskSender,
    stop: Arc<Mutex<bool>>,
) {
    loop {
        if *stop.lock().unwrap() {
            break;
        }

        let parts = match socket.recv_multipart(0) {
            Ok(parts) => parts,
            Err(zmq::Error::EAGAIN) => continue,
            Err(err) => {
                error!(%err, "CSCP transport error");
                std::thread::sleep(TRANSPORT_BACKOFF);
                continue;
            }
        };

        let request = match CscpMessage::decode_parts(&parts) {
            Ok(msg) => msg,
            Err(err) => {
                warn!(%err, "malformed CSCP request");
                let reply = malformed_reply(&sender_identity);
                send_reply(&socket, &reply);
                continue;
            }
        };

        if request.verb != Verb::Request {
            debug!(verb = ?request.verb, "rejecting non-REQUEST CSCP message");
            let reply = request.reply(sender_identity.as_str(), Verb::Invalid, Some(b"expected REQUEST verb".to_vec()));
            send_reply(&socket, &reply);
            continue;
        }

        // Run the handler on the task-queue thread and block this thread
        // on a oneshot channel for its result, so the REP socket's strict
        // request/reply lockstep is preserved while state mutation still
        // happens only from the task loop.
        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let registry = Arc::clone(&registry);
        let command_name = request.command_name.clone();
        let payload = request.payload.clone();

        let enqueued = tasks.send(Task::CscpDispatch {
            run: Box::new(move || {
                let result = registry.dispatch(&command_name, payload.as_deref());
                let _ = result_tx.send(result);
            }),
        });

        if enqueued.is_err() {
            error!("task queue closed; replying ERROR to CSCP request");
            let reply = request.reply(sender_identity.as_str(), Verb::Error, Some(b"satellite is shutting down".to_vec()));
            send_reply(&socket, &reply);
            continue;
        }

        // The task queue has a single consumer; a busy handler (e.g. a
        // slow `initialize`) simply makes this particular reply wait,
        // which is acceptable since CSCP is a request/reply protocol.
        let dispatch_result = result_rx.recv().unwrap_or(DispatchResult::Invalid("satellite is shutting down".to_string()));
        let reply = match dispatch_result {
            DispatchResult::Success(text, payload) => request.reply(sender_identity.as_str(), Verb::Success, Some(encode_reply(&text, payload))),
            DispatchResult::Incomplete(text) => request.reply(sender_identity.as_str(), Verb::Incomplete, Some(text.into_bytes())),
            DispatchResult::NotImplemented => request.reply(sender_identity.as_str(), Verb::NotImplemented, None),
            DispatchResult::Invalid(text) => request.reply(sender_identity.as_str(), Verb::Invalid, Some(text.into_bytes())),
            DispatchResult::Unknown => {
                request.reply(sender_identity.as_str(), Verb::Unknown, Some(request.command_name.clone().into_bytes()))
            }
        };
        send_reply(&socket, &reply);
    }
}

fn encode_reply(text: &str, payload: Option<Vec<u8>>) -> Vec<u8> {
    payload.unwrap_or_else(|| text.as_bytes().to_vec())
}

fn malformed_reply(sender_identity: &str) -> CscpMessage {
    CscpMessage::request(sender_identity, "unknown", None).reply(sender_identity, Verb::Invalid, Some(b"malformed request".to_vec()))
}

fn send_reply(socket: &zmq::Socket, reply: &CscpMessage) {
    match reply.encode_parts() {
        Ok(parts) => {
            if let Err(err) = socket.send_multipart(parts, 0) {
                error!(%err, "failed to send CSCP reply");
            }
        }
        Err(err) => {
            error!(%err, "failed to encode CSCP reply; sending minimal ERROR frame");
            let fallback = reply.reply("unknown", Verb::Error, Some(err.to_string().into_bytes()));
            if let Ok(parts) = fallback.encode_parts() {
                let _ = socket.send_multipart(parts, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_commands_exclude_hidden_ones() {
        let registry = CommandRegistry::new();
        registry.register("get_state", "current FSM state", |_payload: Option<&[u8]>| Ok((Some("NEW".to_string()), None)));
        registry.register("_get_commands", "hidden command list", |_payload: Option<&[u8]>| Ok((Some("".to_string()), None)));

        let public = registry.public_commands();
        assert_eq!(public.len(), 1);
        assert_eq!(public[0].0, "get_state");

        let hidden = registry.hidden_commands();
        assert_eq!(hidden.len(), 1);
        assert_eq!(hidden[0].0, "_get_commands");
    }

    #[test]
    fn dispatch_is_case_insensitive_and_reports_unknown() {
        let registry = CommandRegistry::new();
        registry.register("Get_Name", "satellite name", |_payload: Option<&[u8]>| Ok((Some("sat-a".to_string()), None)));

        match registry.dispatch("get_name", None) {
            DispatchResult::Success(text, _) => assert_eq!(text, "sat-a"),
            _ => panic!("expected Success"),
        }
        match registry.dispatch("does_not_exist", None) {
            DispatchResult::Unknown => {}
            _ => panic!("expected Unknown"),
        }
    }

    #[test]
    fn precondition_denies_with_invalid() {
        let registry = CommandRegistry::new();
        registry.register_with_predicate(
            "start",
            "begin acquisition",
            |_payload: Option<&[u8]>| Ok((Some("started".to_string()), None)),
            Some(|| false),
        );

        match registry.dispatch("start", None) {
            DispatchResult::Invalid(text) => assert!(text.contains("not allowed")),
            _ => panic!("expected Invalid"),
        }
    }

    #[test]
    fn incomplete_when_handler_returns_no_text() {
        let registry = CommandRegistry::new();
        registry.register("noop", "does nothing useful", |_payload: Option<&[u8]>| Ok((None, None)));
        match registry.dispatch("noop", None) {
            DispatchResult::Incomplete(_) => {}
            _ => panic!("expected Incomplete"),
        }
    }
}
