//! The dispatch loop: sole owner of the read side of the conversation.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::time::Instant;

use tracing::{debug, info, warn};

use super::{DISPATCHER_TARGET, DispatchMessage, QueuedRequest, Reply, StatsCounters};
use crate::errors::{DispatchError, SupervisorError};
use crate::events::{LifecycleEvent, LifecycleReporter};
use crate::process::BackendEvent;
use crate::protocol::{Framed, ProtocolMarkers, ResponseFrame, ResponseFramer, classify};
use crate::request::{Operation, VerificationResult};
use crate::supervisor::{BackendExit, Supervisor, SupervisorState};

/// The request whose response is being awaited.
#[derive(Debug)]
struct InFlight {
    generation: u64,
    sequence: u64,
    operation: Operation,
    written_at: Instant,
    reply: Reply,
}

pub(super) struct Worker {
    supervisor: Arc<Supervisor>,
    reporter: Arc<dyn LifecycleReporter>,
    stats: Arc<StatsCounters>,
    framer: ResponseFramer,
    framer_generation: u64,
    pending: VecDeque<QueuedRequest>,
    in_flight: Option<InFlight>,
}

impl Worker {
    pub(super) fn new(
        supervisor: Arc<Supervisor>,
        reporter: Arc<dyn LifecycleReporter>,
        stats: Arc<StatsCounters>,
        markers: ProtocolMarkers,
    ) -> Self {
        Self {
            supervisor,
            reporter,
            stats,
            framer: ResponseFramer::new(markers),
            framer_generation: 0,
            pending: VecDeque::new(),
            in_flight: None,
        }
    }

    pub(super) fn run(mut self, receiver: &Receiver<DispatchMessage>) {
        while let Ok(message) = receiver.recv() {
            match message {
                DispatchMessage::Submit(request) => {
                    self.pending.push_back(request);
                    self.queue_depth_changed();
                }
                DispatchMessage::Backend(event) => self.on_backend(event),
                DispatchMessage::Shutdown => break,
            }
            self.pump();
        }
        self.abandon_all();
    }

    fn on_backend(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Output { generation, bytes } => self.on_output(generation, &bytes),
            BackendEvent::Closed { generation } | BackendEvent::Exited { generation } => {
                self.on_exit(generation);
            }
            BackendEvent::Stopped { generation } => {
                self.resolve_crashed(generation);
            }
            BackendEvent::Ready { generation } => {
                debug!(target: DISPATCHER_TARGET, generation, "backend generation ready");
                self.adopt_generation(generation);
            }
            // Nothing to resolve here; `pump` refuses the queue afterwards.
            BackendEvent::StartAborted => {
                debug!(target: DISPATCHER_TARGET, "backend start aborted");
            }
        }
    }

    fn adopt_generation(&mut self, generation: u64) {
        if self.framer_generation != generation {
            self.framer.reset();
            self.framer_generation = generation;
        }
    }

    fn on_output(&mut self, generation: u64, bytes: &[u8]) {
        if generation != self.supervisor.generation() {
            debug!(
                target: DISPATCHER_TARGET,
                generation,
                len = bytes.len(),
                "discarding output of retired backend"
            );
            return;
        }
        self.adopt_generation(generation);

        let mut framed = self.framer.feed(bytes);
        loop {
            match framed {
                Framed::NeedMore => break,
                Framed::CrashBanner(line) => warn!(
                    target: DISPATCHER_TARGET,
                    generation,
                    banner = %line,
                    "backend reported an unhandled exception"
                ),
                Framed::Complete(frame) => self.on_frame(generation, &frame),
            }
            framed = self.framer.next_frame();
        }
    }

    fn on_frame(&mut self, generation: u64, frame: &ResponseFrame) {
        let Some(in_flight) = self
            .in_flight
            .take_if(|request| request.generation == generation)
        else {
            let desyncs = self.stats.desyncs.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                target: DISPATCHER_TARGET,
                generation,
                desyncs,
                terminator = %frame.terminator_line(),
                "frame arrived with no request in flight, discarding"
            );
            return;
        };

        let result = classify(frame, in_flight.operation, in_flight.sequence);
        debug!(
            target: DISPATCHER_TARGET,
            sequence = in_flight.sequence,
            status = ?result.status,
            elapsed_ms = in_flight.written_at.elapsed().as_millis(),
            "request answered"
        );
        self.stats.completed.fetch_add(1, Ordering::Relaxed);
        self.supervisor.finish_request(generation);
        deliver(&in_flight.reply, in_flight.sequence, Ok(result));
    }

    /// Handles the exit of `generation`, however it was noticed. Repeat
    /// notices for a retired generation are no-ops.
    fn on_exit(&mut self, generation: u64) {
        let exit = self.supervisor.retire(generation);
        self.resolve_crashed(generation);
        if matches!(exit, Some(BackendExit::Crashed { .. }))
            && self.supervisor.restart_policy().auto_restart
        {
            self.restart_after_crash();
        }
    }

    fn resolve_crashed(&mut self, generation: u64) {
        if let Some(in_flight) = self
            .in_flight
            .take_if(|request| request.generation == generation)
        {
            warn!(
                target: DISPATCHER_TARGET,
                sequence = in_flight.sequence,
                generation,
                "backend went away with a request in flight"
            );
            deliver(
                &in_flight.reply,
                in_flight.sequence,
                Ok(VerificationResult::crashed(
                    in_flight.sequence,
                    in_flight.operation,
                )),
            );
        }
    }

    fn restart_after_crash(&self) {
        loop {
            match self.supervisor.restart() {
                Ok(version) => {
                    info!(target: DISPATCHER_TARGET, %version, "backend restarted after crash");
                    return;
                }
                Err(
                    SupervisorError::RetriesExhausted { .. }
                    | SupervisorError::AlreadyRunning
                    | SupervisorError::StartInterrupted,
                ) => return,
                Err(error) => {
                    warn!(target: DISPATCHER_TARGET, %error, "restart attempt failed");
                }
            }
        }
    }

    /// Writes the oldest pending request when the backend is free.
    fn pump(&mut self) {
        while self.in_flight.is_none() && !self.pending.is_empty() {
            let state = self.supervisor.state();
            match state {
                SupervisorState::Idle => {}
                SupervisorState::Stopped | SupervisorState::Crashed => {
                    self.reject_pending(state);
                    return;
                }
                SupervisorState::Starting | SupervisorState::Busy => return,
            }
            let Some(generation) = self.supervisor.begin_request() else {
                return;
            };
            let Some(request) = self.pending.pop_front() else {
                self.supervisor.finish_request(generation);
                return;
            };
            self.queue_depth_changed();
            self.adopt_generation(generation);
            self.write(generation, request);
        }
    }

    fn write(&mut self, generation: u64, request: QueuedRequest) {
        debug!(
            target: DISPATCHER_TARGET,
            sequence = request.sequence,
            generation,
            queued_ms = request.enqueued_at.elapsed().as_millis(),
            "writing request"
        );
        self.in_flight = Some(InFlight {
            generation,
            sequence: request.sequence,
            operation: request.operation,
            written_at: Instant::now(),
            reply: request.reply,
        });

        if let Err(error) = self.supervisor.write_request(generation, &request.line) {
            warn!(
                target: DISPATCHER_TARGET,
                sequence = request.sequence,
                %error,
                "failed to write request to backend"
            );
            self.on_exit(generation);
        }
    }

    fn reject_pending(&mut self, state: SupervisorState) {
        for request in self.pending.drain(..) {
            deliver(
                &request.reply,
                request.sequence,
                Err(DispatchError::NotReady { state }),
            );
        }
        self.queue_depth_changed();
    }

    fn abandon_all(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            deliver(&in_flight.reply, in_flight.sequence, Err(DispatchError::Shutdown));
        }
        for request in self.pending.drain(..) {
            deliver(&request.reply, request.sequence, Err(DispatchError::Shutdown));
        }
        self.queue_depth_changed();
    }

    fn queue_depth_changed(&self) {
        let depth = self.pending.len();
        if self.stats.queue_depth.swap(depth, Ordering::Relaxed) != depth {
            self.reporter
                .report(LifecycleEvent::QueueDepthChanged { depth });
        }
    }
}

fn deliver(reply: &Reply, sequence: u64, outcome: Result<VerificationResult, DispatchError>) {
    if reply.send(outcome).is_err() {
        debug!(target: DISPATCHER_TARGET, sequence, "caller dropped its handle");
    }
}
