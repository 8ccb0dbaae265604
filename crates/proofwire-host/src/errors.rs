//! Error types surfaced by the supervisor, dispatcher, and readiness gate.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::supervisor::SupervisorState;

/// Errors raised while managing the backend process.
///
/// I/O sources are shared through [`Arc`] so the error can be cloned into
/// lifecycle reports and returned to the caller.
#[derive(Debug, Clone, Error)]
pub enum SupervisorError {
    /// The backend executable does not exist.
    #[error("verification backend binary not found: {command}")]
    BinaryNotFound {
        /// Command that was not found.
        command: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The backend executable exists but could not be launched.
    #[error("failed to spawn verification backend: {message}")]
    SpawnFailed {
        /// Description of the failure.
        message: String,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },

    /// The version handshake did not produce a version.
    #[error("version handshake failed: {message}")]
    Handshake {
        /// What went wrong.
        message: String,
    },

    /// `start` was called while a backend is already live.
    #[error("verification backend is already running")]
    AlreadyRunning,

    /// `stop` was called while `start` was still running the handshake.
    #[error("start was interrupted by stop")]
    StartInterrupted,

    /// `restart` was called before any successful `start`.
    #[error("no spawn configuration has been recorded; call start first")]
    NotConfigured,

    /// Restarts exceeded the configured maximum.
    #[error("verification backend restart abandoned after {attempts} attempts")]
    RetriesExhausted {
        /// Restart attempts already made.
        attempts: u32,
    },

    /// Any other I/O failure while driving the backend.
    #[error("I/O error while {operation}: {source}")]
    Io {
        /// What the supervisor was doing.
        operation: &'static str,
        /// Underlying I/O error.
        #[source]
        source: Arc<io::Error>,
    },
}

impl SupervisorError {
    pub(crate) fn io(operation: &'static str, source: io::Error) -> Self {
        Self::Io {
            operation,
            source: Arc::new(source),
        }
    }
}

/// Errors returned to callers of the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The backend is not in a state that accepts work.
    #[error("verification backend is not ready (state: {state})")]
    NotReady {
        /// Supervisor state when the request was refused.
        state: SupervisorState,
    },

    /// The dispatcher shut down before answering.
    #[error("dispatcher shut down before the request was answered")]
    Shutdown,

    /// The request payload could not be serialised.
    #[error("failed to encode request payload: {0}")]
    Codec(#[from] serde_json::Error),

    /// `wait_timeout` elapsed; the request is still outstanding.
    #[error("request {sequence} is still pending")]
    TimedOut {
        /// Sequence number of the pending request.
        sequence: u64,
    },
}

/// Errors raised by the readiness gate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadinessError {
    /// The backend did not become ready within the polling budget.
    #[error("verification backend not ready after {attempts} checks every {poll_interval:?}")]
    Timeout {
        /// Checks performed.
        attempts: u32,
        /// Sleep between checks.
        poll_interval: Duration,
    },
}
