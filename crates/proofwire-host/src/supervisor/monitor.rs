//! Notices a backend exit that stdout has not reported.
//!
//! A backend that forks can die while a grandchild keeps the inherited
//! stdout open, so end of file never arrives. The watcher polls the OS for
//! the exit status of one generation and posts [`BackendEvent::Exited`].

use std::sync::{Mutex, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use super::{Inner, SUPERVISOR_TARGET, lock_inner};
use crate::process::{BackendEvent, EventSink};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Time the stdout reader gets to forward the last output of an exited
/// backend before the exit is posted.
const STDOUT_DRAIN: Duration = Duration::from_millis(100);

/// Starts a watcher for the process of `generation`. It ends quietly once
/// that process is retired or replaced.
pub(super) fn watch_exit(inner: Weak<Mutex<Inner>>, generation: u64, sink: EventSink) {
    let spawned = thread::Builder::new()
        .name(format!("proofwire-exit-{generation}"))
        .spawn(move || {
            if wait_for_exit(&inner, generation) {
                thread::sleep(STDOUT_DRAIN);
                debug!(target: SUPERVISOR_TARGET, generation, "backend exit observed");
                sink(BackendEvent::Exited { generation });
            }
        });
    if let Err(error) = spawned {
        warn!(
            target: SUPERVISOR_TARGET,
            generation,
            %error,
            "exit watcher unavailable, relying on stdout closing"
        );
    }
}

fn wait_for_exit(inner: &Weak<Mutex<Inner>>, generation: u64) -> bool {
    loop {
        thread::sleep(EXIT_POLL_INTERVAL);
        let Some(shared) = inner.upgrade() else {
            return false;
        };
        let mut guard = lock_inner(&shared);
        if guard.generation != generation {
            return false;
        }
        match guard.process.as_mut() {
            Some(process) => {
                if !process.is_alive() {
                    return true;
                }
            }
            None => return false,
        }
    }
}
