//! Version handshake against a short-lived probe process.
//!
//! The probe process is asked for its version, sent `quit`, and reaped. It
//! never shares a pipe with the long-lived backend, so the trailing terminator
//! the backend prints after its version line cannot reach the dispatcher.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{BackendVersion, SUPERVISOR_TARGET};
use crate::errors::SupervisorError;
use crate::process::{BackendEvent, BackendProcess, EventSink, SpawnConfig};
use crate::protocol::{ProbeProgress, ProtocolMarkers, Verb, VersionProbe, encode};

/// Generation used for probe processes; real backends start at 1.
const PROBE_GENERATION: u64 = 0;

/// Spawns a probe process and returns the version it reports.
pub(crate) fn probe_version(
    spawn: &SpawnConfig,
    markers: &ProtocolMarkers,
    timeout: Duration,
    grace: Duration,
) -> Result<BackendVersion, SupervisorError> {
    let (sender, receiver) = mpsc::channel();
    let sink: EventSink = Arc::new(move |event| drop(sender.send(event)));
    let mut process = BackendProcess::spawn(spawn, PROBE_GENERATION, sink)?;

    if let Err(error) = process.write(&VersionProbe::request()) {
        process.reap(grace);
        return Err(handshake_error(format!("failed to send version request: {error}")));
    }

    let mut probe = VersionProbe::new(markers.clone());
    let deadline = Instant::now() + timeout;
    let outcome = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match receiver.recv_timeout(remaining) {
            Ok(BackendEvent::Output { bytes, .. }) => match probe.feed(&bytes) {
                ProbeProgress::Ready { version, quit } => {
                    if let Err(error) = process.write(&quit) {
                        debug!(target: SUPERVISOR_TARGET, %error, "probe quit not delivered");
                    }
                    break Ok(BackendVersion::new(version));
                }
                ProbeProgress::Rejected { output } => {
                    break Err(handshake_error(format!(
                        "backend answered without a version: {output}"
                    )));
                }
                ProbeProgress::Pending | ProbeProgress::Done => {}
            },
            Ok(
                BackendEvent::Closed { .. }
                | BackendEvent::Exited { .. }
                | BackendEvent::Stopped { .. },
            )
            | Err(RecvTimeoutError::Disconnected) => {
                break Err(handshake_error(String::from(
                    "backend exited before reporting a version",
                )));
            }
            Ok(BackendEvent::Ready { .. } | BackendEvent::StartAborted) => {}
            Err(RecvTimeoutError::Timeout) => {
                break Err(handshake_error(format!(
                    "no version reported within {}ms",
                    timeout.as_millis()
                )));
            }
        }
    };

    match &outcome {
        Ok(version) => {
            debug!(target: SUPERVISOR_TARGET, %version, "handshake complete");
            process.reap(grace);
        }
        Err(_) => {
            process.shutdown(&encode(Verb::Quit, ""), grace);
        }
    }
    outcome
}

const fn handshake_error(message: String) -> SupervisorError {
    SupervisorError::Handshake { message }
}
