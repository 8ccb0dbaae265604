//! Reaping of backend child processes.

use std::process::{Child, ExitStatus};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::PROCESS_TARGET;

/// How often the exit status is polled during the grace period.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Waits up to `grace` for the child to exit, then kills it.
///
/// Returns the exit status when one could be collected. A status obtained
/// after killing reports no exit code on unix.
pub(super) fn wait_or_kill(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    let pid = child.id();
    let deadline = Instant::now() + grace;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(target: PROCESS_TARGET, pid, ?status, "backend exited");
                return Some(status);
            }
            Ok(None) if Instant::now() < deadline => thread::sleep(EXIT_POLL_INTERVAL),
            Ok(None) => {
                warn!(
                    target: PROCESS_TARGET,
                    pid,
                    grace_ms = grace.as_millis(),
                    "backend did not exit within grace period, killing"
                );
                return kill(child);
            }
            Err(error) => {
                warn!(
                    target: PROCESS_TARGET,
                    pid,
                    %error,
                    "failed to check backend status, killing"
                );
                return kill(child);
            }
        }
    }
}

/// Kills the child and collects its status.
pub(super) fn kill(child: &mut Child) -> Option<ExitStatus> {
    if let Err(error) = child.kill() {
        debug!(target: PROCESS_TARGET, pid = child.id(), %error, "kill failed");
    }
    match child.wait() {
        Ok(status) => Some(status),
        Err(error) => {
            warn!(target: PROCESS_TARGET, pid = child.id(), %error, "failed to reap backend");
            None
        }
    }
}
