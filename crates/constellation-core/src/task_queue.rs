//! The single-consumer, multi-producer task queue.
//!
//! CHIRP, CSCP, and the heartbeat checker all enqueue work here; the main
//! loop (see `satellite::Satellite::run`) is the only consumer, and the
//! only legitimate mutator of satellite state outside the acquisition
//! thread.

use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::chirp::{ChirpCallback, DiscoveredService};

/// Work enqueued from one of CHIRP, CSCP, the heartbeat checker, or a
/// `shutdown` command's delayed exit. Rust has no duck-typed
/// callable-with-args convention, so each producer carries exactly the data
/// its consumer needs rather than an untyped `(callback, args)` pair.
pub enum Task {
    /// A CHIRP OFFER/DEPART callback invocation, armed via
    /// `BroadcastManager::register_request`.
    ChirpCallback {
        callback: ChirpCallback,
        service: DiscoveredService,
    },
    /// A CSCP command handler invocation, deferred off the receive thread
    /// so a slow handler never blocks replies to other peers.
    CscpDispatch { run: Box<dyn FnOnce() + Send> },
    /// An FSM action driven by the heartbeat checker (`interrupt` on a
    /// peer in SAFE, `failure` on a peer in ERROR or missing).
    HeartbeatAction { run: Box<dyn FnOnce() + Send> },
    /// The `shutdown` command's delayed process exit, so the CSCP reply is
    /// flushed before the process actually terminates.
    DelayedExit { at: Instant, run: Box<dyn FnOnce() + Send> },
}

impl Task {
    /// Run this task's payload on the calling (task-queue) thread.
    pub fn run(self) {
        match self {
            Task::ChirpCallback { callback, service } => callback(service),
            Task::CscpDispatch { run } => run(),
            Task::HeartbeatAction { run } => run(),
            Task::DelayedExit { run, .. } => run(),
        }
    }
}

pub type TaskSender = Sender<Task>;

/// The task queue itself: an unbounded MPSC channel. Unbounded because none
/// of the producers here are expected to outrun a single consumer for long
/// (CHIRP and heartbeat events are rate-limited by real-world network
/// traffic; CSCP dispatch is one request at a time per socket).
pub struct TaskQueue {
    sender: Sender<Task>,
    receiver: Receiver<Task>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// A cloneable handle producers use to enqueue work.
    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    pub fn receiver(&self) -> &Receiver<Task> {
        &self.receiver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn pop_with_timeout_runs_enqueued_work() {
        let queue = TaskQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran_clone = Arc::clone(&ran);

        queue
            .sender()
            .send(Task::CscpDispatch {
                run: Box::new(move || ran_clone.store(true, Ordering::SeqCst)),
            })
            .unwrap();

        let task = queue.receiver().recv_timeout(Duration::from_millis(500)).unwrap();
        task.run();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn empty_queue_times_out_without_blocking_forever() {
        let queue = TaskQueue::new();
        let result = queue.receiver().recv_timeout(Duration::from_millis(10));
        assert!(result.is_err());
    }
}
