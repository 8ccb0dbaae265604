//! Serialises requests from many callers onto one backend conversation.
//!
//! Callers submit from any thread and receive a [`PendingVerification`]. A
//! single worker thread owns the pending queue, the response framer, and the
//! one request allowed in flight; backend output reaches it through the same
//! channel as submissions, so frames and requests are matched in arrival
//! order without further locking.

mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::errors::{DispatchError, SupervisorError};
use crate::events::LifecycleReporter;
use crate::process::BackendEvent;
use crate::protocol::{ProtocolMarkers, encode};
use crate::request::{Operation, VerificationRequest, VerificationResult};
use crate::supervisor::Supervisor;

use worker::Worker;

/// Log target for dispatcher operations.
pub(crate) const DISPATCHER_TARGET: &str = "proofwire_host::dispatcher";

type Reply = Sender<Result<VerificationResult, DispatchError>>;

/// A request accepted by [`Dispatcher::submit`] and not yet written.
#[derive(Debug)]
pub(crate) struct QueuedRequest {
    sequence: u64,
    operation: Operation,
    line: Vec<u8>,
    enqueued_at: Instant,
    reply: Reply,
}

/// Messages consumed by the worker thread.
#[derive(Debug)]
pub(crate) enum DispatchMessage {
    Submit(QueuedRequest),
    Backend(BackendEvent),
    Shutdown,
}

/// Counters shared between the worker and observers.
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    queue_depth: AtomicUsize,
    completed: AtomicU64,
    desyncs: AtomicU64,
}

/// Snapshot of dispatcher activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherStats {
    /// Requests queued behind the in-flight one.
    pub queue_depth: usize,
    /// Requests answered from a backend frame.
    pub completed: u64,
    /// Frames that arrived with no request in flight.
    pub desyncs: u64,
}

/// Handle to one submitted request.
#[derive(Debug)]
pub struct PendingVerification {
    sequence: u64,
    receiver: Receiver<Result<VerificationResult, DispatchError>>,
}

impl PendingVerification {
    /// Sequence number assigned at submission.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Blocks until the request is answered.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotReady`] when the backend went away before
    /// the request was written, and [`DispatchError::Shutdown`] when the
    /// dispatcher stopped first.
    pub fn wait(self) -> Result<VerificationResult, DispatchError> {
        self.receiver.recv().map_err(|_| DispatchError::Shutdown)?
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`, leaving the
    /// request outstanding.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::TimedOut`] when nothing arrived in time, plus
    /// everything [`wait`](Self::wait) can return.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<VerificationResult, DispatchError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(DispatchError::TimedOut {
                sequence: self.sequence,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(DispatchError::Shutdown),
        }
    }

    fn resolved(sequence: u64, outcome: Result<VerificationResult, DispatchError>) -> Self {
        let (sender, receiver) = mpsc::channel();
        // The receiver is alive in `Self`, so the send cannot fail.
        drop(sender.send(outcome));
        Self { sequence, receiver }
    }
}

/// Accepts requests and feeds them to the backend one at a time.
pub struct Dispatcher {
    sender: Sender<DispatchMessage>,
    supervisor: Arc<Supervisor>,
    stats: Arc<StatsCounters>,
    /// Next sequence number. Held across the enqueue so sequence order is
    /// queue order.
    next_sequence: Mutex<u64>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn spawn(
        supervisor: Arc<Supervisor>,
        sender: Sender<DispatchMessage>,
        receiver: Receiver<DispatchMessage>,
        markers: ProtocolMarkers,
        reporter: Arc<dyn LifecycleReporter>,
    ) -> Result<Self, SupervisorError> {
        let stats = Arc::new(StatsCounters::default());
        let running = Arc::new(AtomicBool::new(true));
        let worker = Worker::new(
            Arc::clone(&supervisor),
            reporter,
            Arc::clone(&stats),
            markers,
        );
        let flag = Arc::clone(&running);
        let handle = thread::Builder::new()
            .name(String::from("proofwire-dispatcher"))
            .spawn(move || {
                worker.run(&receiver);
                flag.store(false, Ordering::Release);
            })
            .map_err(|error| SupervisorError::io("spawning the dispatcher", error))?;

        Ok(Self {
            sender,
            supervisor,
            stats,
            next_sequence: Mutex::new(1),
            running,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queues a request and returns a handle to its eventual result.
    ///
    /// Version probes are answered immediately from the version captured at
    /// the last handshake.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::NotReady`] unless the backend is idle or busy,
    /// [`DispatchError::Codec`] when the payload cannot be serialised, and
    /// [`DispatchError::Shutdown`] after [`shutdown`](Self::shutdown).
    pub fn submit(&self, request: &VerificationRequest) -> Result<PendingVerification, DispatchError> {
        let state = self.supervisor.state();
        if !state.accepts_work() {
            return Err(DispatchError::NotReady { state });
        }
        if !self.running.load(Ordering::Acquire) {
            return Err(DispatchError::Shutdown);
        }

        if request.operation == Operation::VersionProbe {
            let sequence = take_sequence(&mut self.lock_sequence());
            let outcome = self
                .supervisor
                .version()
                .map(|version| VerificationResult::version(sequence, version.as_str()))
                .ok_or(DispatchError::NotReady { state });
            return Ok(PendingVerification::resolved(sequence, outcome));
        }

        let line = encode(request.operation.verb(), &request.payload()?);
        let (reply, receiver) = mpsc::channel();
        let mut next_sequence = self.lock_sequence();
        let sequence = take_sequence(&mut next_sequence);
        let queued = QueuedRequest {
            sequence,
            operation: request.operation,
            line,
            enqueued_at: request.enqueued_at,
            reply,
        };
        debug!(
            target: DISPATCHER_TARGET,
            sequence,
            operation = %request.operation,
            uri = %request.document.uri,
            "request submitted"
        );
        self.sender
            .send(DispatchMessage::Submit(queued))
            .map_err(|_| DispatchError::Shutdown)?;
        drop(next_sequence);
        Ok(PendingVerification { sequence, receiver })
    }

    fn lock_sequence(&self) -> MutexGuard<'_, u64> {
        self.next_sequence
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Whether the worker is alive and the backend accepts work.
    #[must_use]
    pub fn accepts_work(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.supervisor.accepts_work()
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            queue_depth: self.stats.queue_depth.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            desyncs: self.stats.desyncs.load(Ordering::Relaxed),
        }
    }

    /// Stops the worker. Outstanding requests resolve with
    /// [`DispatchError::Shutdown`]. Idempotent.
    pub fn shutdown(&self) {
        let taken = self
            .worker
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        let Some(handle) = taken else {
            return;
        };
        if self.sender.send(DispatchMessage::Shutdown).is_err() {
            debug!(target: DISPATCHER_TARGET, "dispatcher already gone");
        }
        if handle.join().is_err() {
            warn!(target: DISPATCHER_TARGET, "dispatcher thread panicked");
        }
    }
}

const fn take_sequence(next: &mut u64) -> u64 {
    let sequence = *next;
    *next += 1;
    sequence
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Dispatcher")
            .field("stats", &self.stats())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
