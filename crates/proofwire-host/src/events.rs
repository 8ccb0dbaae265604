//! Lifecycle events and the reporters that surface them.

use std::sync::Arc;
use std::sync::mpsc::Sender;

/// Log target for lifecycle reports.
pub(crate) const LIFECYCLE_TARGET: &str = "proofwire_host::lifecycle";

/// Notable transitions of the backend and its request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A backend is being spawned.
    ServerStarting,
    /// The handshake succeeded and the backend accepts work.
    ServerUp {
        /// Version reported during the handshake.
        version: String,
    },
    /// The backend was stopped or exited cleanly.
    ServerDown,
    /// A restart attempt is beginning.
    ServerCrashedRestarting {
        /// One-based restart attempt.
        attempt: u32,
    },
    /// The backend exited unexpectedly.
    BackendCrashed {
        /// Exit code, when the OS reported one.
        exit_code: Option<i32>,
    },
    /// Starting the backend failed.
    StartFailed {
        /// Rendered error.
        message: String,
    },
    /// Requests waiting to be written changed.
    QueueDepthChanged {
        /// Requests queued behind the in-flight one.
        depth: usize,
    },
    /// Restarting was abandoned.
    MaxRetriesReached {
        /// Attempts made.
        attempts: u32,
    },
}

/// Observer for lifecycle events.
pub trait LifecycleReporter: Send + Sync {
    /// Receives one event. Must not block.
    fn report(&self, event: LifecycleEvent);
}

impl<T> LifecycleReporter for Arc<T>
where
    T: LifecycleReporter + ?Sized,
{
    fn report(&self, event: LifecycleEvent) {
        (**self).report(event);
    }
}

/// Forwards events into a channel; a disconnected receiver is ignored.
impl LifecycleReporter for Sender<LifecycleEvent> {
    fn report(&self, event: LifecycleEvent) {
        // The receiver going away only means nobody is listening any more.
        drop(self.send(event));
    }
}

/// Fans every event out to both reporters, left first.
impl<A, B> LifecycleReporter for (A, B)
where
    A: LifecycleReporter,
    B: LifecycleReporter,
{
    fn report(&self, event: LifecycleEvent) {
        self.0.report(event.clone());
        self.1.report(event);
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredLifecycleReporter;

impl StructuredLifecycleReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LifecycleReporter for StructuredLifecycleReporter {
    fn report(&self, event: LifecycleEvent) {
        match event {
            LifecycleEvent::ServerStarting => tracing::info!(
                target: LIFECYCLE_TARGET,
                event = "server_starting",
                "starting verification backend"
            ),
            LifecycleEvent::ServerUp { version } => tracing::info!(
                target: LIFECYCLE_TARGET,
                event = "server_up",
                %version,
                "verification backend ready"
            ),
            LifecycleEvent::ServerDown => tracing::info!(
                target: LIFECYCLE_TARGET,
                event = "server_down",
                "verification backend stopped"
            ),
            LifecycleEvent::ServerCrashedRestarting { attempt } => tracing::warn!(
                target: LIFECYCLE_TARGET,
                event = "server_restarting",
                attempt,
                "restarting verification backend"
            ),
            LifecycleEvent::BackendCrashed { exit_code } => tracing::error!(
                target: LIFECYCLE_TARGET,
                event = "backend_crashed",
                exit_code = ?exit_code,
                "verification backend exited unexpectedly"
            ),
            LifecycleEvent::StartFailed { message } => tracing::error!(
                target: LIFECYCLE_TARGET,
                event = "start_failed",
                %message,
                "verification backend failed to start"
            ),
            LifecycleEvent::QueueDepthChanged { depth } => tracing::debug!(
                target: LIFECYCLE_TARGET,
                event = "queue_depth",
                depth,
                "verification queue depth changed"
            ),
            LifecycleEvent::MaxRetriesReached { attempts } => tracing::error!(
                target: LIFECYCLE_TARGET,
                event = "max_retries_reached",
                attempts,
                "giving up on verification backend"
            ),
        }
    }
}
