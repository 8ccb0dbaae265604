//! Lifecycle management for the verification backend process.
//!
//! The supervisor owns at most one live [`BackendProcess`] and the state
//! machine around it:
//!
//! ```text
//! Stopped/Crashed --start--> Starting --handshake--> Idle <--> Busy
//!        ^                                            |
//!        +------------- exit / stop ------------------+
//! ```
//!
//! Every spawned process gets a fresh generation number. Events from older
//! generations are recognised and ignored, which keeps output of a process
//! that is being torn down away from its replacement.

mod handshake;
mod monitor;

use std::fmt;
use std::io;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use proofwire_config::{Config, DEFAULT_MAX_CONNECTION_RETRIES};
use tracing::{debug, info, warn};

use crate::config::BackendConfig;
use crate::errors::SupervisorError;
use crate::events::{LifecycleEvent, LifecycleReporter};
use crate::process::{BackendEvent, BackendProcess, EventSink, SpawnConfig};
use crate::protocol::{ProtocolMarkers, Verb, encode};

pub(crate) use handshake::probe_version;

/// Log target for supervisor operations.
pub(crate) const SUPERVISOR_TARGET: &str = "proofwire_host::supervisor";

/// Supervisor state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SupervisorState {
    /// No backend process.
    #[default]
    Stopped,
    /// A backend is being spawned and handshaken.
    Starting,
    /// The backend is waiting for a request.
    Idle,
    /// A request is in flight.
    Busy,
    /// The backend exited unexpectedly.
    Crashed,
}

impl SupervisorState {
    /// Whether requests may be submitted.
    #[must_use]
    pub const fn accepts_work(self) -> bool {
        matches!(self, Self::Idle | Self::Busy)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Crashed => "crashed",
        };
        formatter.write_str(label)
    }
}

/// Version string reported by the backend during the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendVersion(String);

impl BackendVersion {
    /// Wraps a version string.
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// The version text.
    #[must_use]
    pub const fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Restart behaviour after a crash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartPolicy {
    /// Restart automatically when the backend crashes.
    pub auto_restart: bool,
    /// Restarts allowed before giving up.
    pub max_retries: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_restart: false,
            max_retries: DEFAULT_MAX_CONNECTION_RETRIES,
        }
    }
}

impl From<&Config> for RestartPolicy {
    fn from(config: &Config) -> Self {
        Self {
            auto_restart: config.auto_restart,
            max_retries: config.max_connection_retries,
        }
    }
}

/// How a retired backend ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackendExit {
    /// Exit status zero.
    Clean,
    /// Non-zero or unavailable exit status.
    Crashed { exit_code: Option<i32> },
}

impl BackendExit {
    fn from_status(status: Option<ExitStatus>) -> Self {
        match status.map(|exit| (exit.success(), exit.code())) {
            Some((true, _)) => Self::Clean,
            Some((false, exit_code)) => Self::Crashed { exit_code },
            None => Self::Crashed { exit_code: None },
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    state: SupervisorState,
    process: Option<BackendProcess>,
    spawn: Option<SpawnConfig>,
    generation: u64,
    restart_attempts: u32,
    version: Option<BackendVersion>,
}

/// Owns the backend process and its state machine.
pub struct Supervisor {
    inner: Arc<Mutex<Inner>>,
    markers: ProtocolMarkers,
    restart: RestartPolicy,
    stop_grace: Duration,
    handshake_timeout: Duration,
    reporter: Arc<dyn LifecycleReporter>,
    sink: EventSink,
}

impl Supervisor {
    pub(crate) fn new(
        config: &BackendConfig,
        reporter: Arc<dyn LifecycleReporter>,
        sink: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            markers: config.markers.clone(),
            restart: config.restart,
            stop_grace: config.stop_grace,
            handshake_timeout: config.handshake_timeout,
            reporter,
            sink,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        lock_inner(&self.inner)
    }

    /// Spawns the backend, runs the version handshake, and moves to `Idle`.
    ///
    /// Resets the restart counter.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::AlreadyRunning`] unless the supervisor is
    /// `Stopped` or `Crashed`, spawn errors when the executable cannot be
    /// launched, [`SupervisorError::Handshake`] when no version is reported,
    /// and [`SupervisorError::StartInterrupted`] when `stop` races the start.
    pub fn start(&self, spawn: SpawnConfig) -> Result<BackendVersion, SupervisorError> {
        let launch_config = spawn.clone();
        let fallback = {
            let mut inner = self.lock();
            match inner.state {
                SupervisorState::Stopped | SupervisorState::Crashed => {}
                _ => return Err(SupervisorError::AlreadyRunning),
            }
            let previous_state = inner.state;
            inner.state = SupervisorState::Starting;
            inner.spawn = Some(spawn);
            inner.restart_attempts = 0;
            previous_state
        };
        self.launch(&launch_config, fallback)
    }

    /// Replaces the backend with a fresh process using the last spawn
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::NotConfigured`] before the first `start`,
    /// [`SupervisorError::RetriesExhausted`] once the restart budget is spent,
    /// and any error [`start`](Self::start) can return.
    pub fn restart(&self) -> Result<BackendVersion, SupervisorError> {
        let (spawn, previous, attempt) = {
            let mut inner = self.lock();
            let Some(spawn) = inner.spawn.clone() else {
                return Err(SupervisorError::NotConfigured);
            };
            if inner.state == SupervisorState::Starting {
                return Err(SupervisorError::AlreadyRunning);
            }
            if inner.restart_attempts >= self.restart.max_retries {
                let attempts = inner.restart_attempts;
                drop(inner);
                warn!(target: SUPERVISOR_TARGET, attempts, "restart budget exhausted");
                self.reporter
                    .report(LifecycleEvent::MaxRetriesReached { attempts });
                return Err(SupervisorError::RetriesExhausted { attempts });
            }
            inner.restart_attempts += 1;
            inner.state = SupervisorState::Starting;
            (spawn, inner.process.take(), inner.restart_attempts)
        };

        info!(target: SUPERVISOR_TARGET, attempt, "restarting verification backend");
        self.reporter
            .report(LifecycleEvent::ServerCrashedRestarting { attempt });
        if let Some(process) = previous {
            self.retire_process(process);
        }
        self.launch(&spawn, SupervisorState::Crashed)
    }

    /// Sends `quit`, waits for the grace period, then kills the backend.
    ///
    /// A no-op when no backend is live. Interrupts a `start` that is still
    /// handshaking; requests queued behind it are then refused.
    pub fn stop(&self) {
        let (interrupted, previous) = {
            let mut inner = self.lock();
            let interrupted = inner.state == SupervisorState::Starting;
            if !interrupted && inner.process.is_none() {
                return;
            }
            inner.state = SupervisorState::Stopped;
            (interrupted, inner.process.take())
        };

        if let Some(process) = previous {
            self.retire_process(process);
        }
        if interrupted {
            info!(target: SUPERVISOR_TARGET, "stop interrupted a backend start");
            (self.sink)(BackendEvent::StartAborted);
        }
        self.reporter.report(LifecycleEvent::ServerDown);
    }

    /// Whether a backend process exists and has not exited.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock()
            .process
            .as_mut()
            .is_some_and(BackendProcess::is_alive)
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.lock().state
    }

    /// Version captured at the last successful handshake.
    #[must_use]
    pub fn version(&self) -> Option<BackendVersion> {
        self.lock().version.clone()
    }

    /// Restart policy in force.
    #[must_use]
    pub const fn restart_policy(&self) -> RestartPolicy {
        self.restart
    }

    pub(crate) fn accepts_work(&self) -> bool {
        self.state().accepts_work()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Claims the backend for one request: `Idle -> Busy`.
    pub(crate) fn begin_request(&self) -> Option<u64> {
        let mut inner = self.lock();
        if inner.state != SupervisorState::Idle || inner.process.is_none() {
            return None;
        }
        inner.state = SupervisorState::Busy;
        Some(inner.generation)
    }

    /// Writes an encoded request to the backend of `generation`.
    pub(crate) fn write_request(&self, generation: u64, bytes: &[u8]) -> io::Result<()> {
        let mut inner = self.lock();
        match inner.process.as_mut() {
            Some(process) if process.generation() == generation => process.write(bytes),
            _ => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "backend replaced before the request was written",
            )),
        }
    }

    /// Releases the backend after a response: `Busy -> Idle`.
    pub(crate) fn finish_request(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation == generation && inner.state == SupervisorState::Busy {
            inner.state = SupervisorState::Idle;
        }
    }

    /// Collects a backend of `generation` that exited, closed stdout, or
    /// failed a write, and records how it ended.
    ///
    /// Returns `None` when the process was already stopped or replaced.
    pub(crate) fn retire(&self, generation: u64) -> Option<BackendExit> {
        let process = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return None;
            }
            inner.process.take()?
        };

        let exit = BackendExit::from_status(process.reap(self.stop_grace));
        {
            let mut inner = self.lock();
            if inner.generation != generation || !inner.state.accepts_work() {
                return None;
            }
            inner.state = match exit {
                BackendExit::Clean => SupervisorState::Stopped,
                BackendExit::Crashed { .. } => SupervisorState::Crashed,
            };
        }

        match exit {
            BackendExit::Clean => {
                info!(target: SUPERVISOR_TARGET, generation, "backend exited cleanly");
                self.reporter.report(LifecycleEvent::ServerDown);
            }
            BackendExit::Crashed { exit_code } => {
                warn!(target: SUPERVISOR_TARGET, generation, ?exit_code, "backend crashed");
                self.reporter
                    .report(LifecycleEvent::BackendCrashed { exit_code });
            }
        }
        Some(exit)
    }

    fn launch(
        &self,
        spawn: &SpawnConfig,
        fallback: SupervisorState,
    ) -> Result<BackendVersion, SupervisorError> {
        self.reporter.report(LifecycleEvent::ServerStarting);
        match self.try_launch(spawn) {
            Ok(version) => {
                self.reporter.report(LifecycleEvent::ServerUp {
                    version: version.to_string(),
                });
                Ok(version)
            }
            Err(error) => {
                {
                    let mut inner = self.lock();
                    if inner.state == SupervisorState::Starting {
                        inner.state = fallback;
                    }
                }
                (self.sink)(BackendEvent::StartAborted);
                self.reporter.report(LifecycleEvent::StartFailed {
                    message: error.to_string(),
                });
                Err(error)
            }
        }
    }

    fn try_launch(&self, spawn: &SpawnConfig) -> Result<BackendVersion, SupervisorError> {
        let version = probe_version(spawn, &self.markers, self.handshake_timeout, self.stop_grace)?;

        let generation = {
            let mut inner = self.lock();
            if inner.state != SupervisorState::Starting {
                return Err(SupervisorError::StartInterrupted);
            }
            inner.generation += 1;
            inner.generation
        };
        let process = BackendProcess::spawn(spawn, generation, Arc::clone(&self.sink))?;

        let mut inner = self.lock();
        if inner.state != SupervisorState::Starting {
            drop(inner);
            self.retire_process(process);
            return Err(SupervisorError::StartInterrupted);
        }
        inner.process = Some(process);
        inner.state = SupervisorState::Idle;
        inner.version = Some(version.clone());
        drop(inner);

        debug!(target: SUPERVISOR_TARGET, generation, %version, "backend ready");
        (self.sink)(BackendEvent::Ready { generation });
        monitor::watch_exit(Arc::downgrade(&self.inner), generation, Arc::clone(&self.sink));
        Ok(version)
    }

    fn retire_process(&self, process: BackendProcess) {
        let generation = process.generation();
        let status = process.shutdown(&encode(Verb::Quit, ""), self.stop_grace);
        debug!(target: SUPERVISOR_TARGET, generation, ?status, "backend retired");
        (self.sink)(BackendEvent::Stopped { generation });
    }
}

// Recover from poisoning so stop still works after a panicking caller.
fn lock_inner(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        formatter
            .debug_struct("Supervisor")
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("restart_attempts", &inner.restart_attempts)
            .field("version", &inner.version)
            .finish_non_exhaustive()
    }
}
