//! Supervisor for a long-lived verification backend process.
//!
//! The backend speaks a line-oriented text protocol over stdio: one command
//! line per request, answered by an unbounded run of text that ends with a
//! sentinel line. This crate owns everything between feature callers and that
//! process:
//!
//! - [`protocol`]: command encoding, incremental response framing, the
//!   version handshake, and classification of frames into
//!   [`VerificationResult`] values.
//! - [`Supervisor`]: spawns, stops, and restarts the backend, tracking a
//!   [`SupervisorState`] and a bounded retry counter.
//! - [`Dispatcher`]: serialises requests from many callers onto the single
//!   backend conversation and hands each frame to the oldest outstanding
//!   request.
//! - [`await_ready`]: bounded polling for callers that arrive while the
//!   backend is still starting.
//!
//! [`VerificationService`] wires these together into one explicitly
//! constructed context object.

mod config;
mod dispatcher;
mod errors;
mod events;
mod process;
pub mod protocol;
mod readiness;
mod request;
mod service;
mod supervisor;

pub use config::BackendConfig;
pub use dispatcher::{Dispatcher, DispatcherStats, PendingVerification};
pub use errors::{DispatchError, ReadinessError, SupervisorError};
pub use events::{LifecycleEvent, LifecycleReporter, StructuredLifecycleReporter};
pub use process::SpawnConfig;
pub use readiness::{ReadinessPolicy, ReadinessProbe, await_ready};
pub use request::{
    BackendDiagnostic, DiagnosticSeverity, DocumentSnapshot, Operation, OperationParseError,
    VerificationRequest, VerificationResult, VerificationStatus,
};
pub use service::{VerificationService, probe_version};
pub use supervisor::{BackendVersion, RestartPolicy, Supervisor, SupervisorState};

#[cfg(test)]
mod tests;
