//! Ownership of one backend OS process and its stdio pipes.
//!
//! Each spawned process gets a reader thread that forwards raw stdout chunks
//! to an [`EventSink`] tagged with the process generation, and a drain thread
//! that logs stderr. The reader reports [`BackendEvent::Closed`] once stdout
//! reaches end of file; interpreting that as a crash or a clean exit is left
//! to the supervisor. A backend can exit while a process it forked keeps
//! stdout open, so the supervisor also polls for exit separately.

mod lifecycle;

use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use proofwire_config::Config;
use tracing::{debug, warn};

use crate::errors::SupervisorError;

/// Log target for process handling.
pub(crate) const PROCESS_TARGET: &str = "proofwire_host::process";

const READ_CHUNK: usize = 8 * 1024;

/// How to launch the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Executable path or command name.
    pub command: PathBuf,
    /// Arguments passed to the executable.
    pub args: Vec<String>,
    /// Working directory for the process.
    pub working_dir: Option<PathBuf>,
}

impl SpawnConfig {
    /// Launches `command` with no arguments in the current directory.
    #[must_use]
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Appends arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets a working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

impl From<&Config> for SpawnConfig {
    fn from(config: &Config) -> Self {
        Self {
            command: PathBuf::from(&config.backend_command),
            args: config.backend_args.clone(),
            working_dir: config
                .working_dir
                .as_ref()
                .map(|dir| dir.as_std_path().to_path_buf()),
        }
    }
}

/// Notifications produced by backend processes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum BackendEvent {
    /// Raw stdout bytes.
    Output { generation: u64, bytes: Vec<u8> },
    /// stdout reached end of file.
    Closed { generation: u64 },
    /// The OS reported the process as exited while stdout may still be open.
    Exited { generation: u64 },
    /// The supervisor stopped or replaced the process.
    Stopped { generation: u64 },
    /// The process passed its handshake and accepts requests.
    Ready { generation: u64 },
    /// A start or restart ended without a ready process.
    StartAborted,
}

/// Receiver of [`BackendEvent`]s. Called from reader threads.
pub(crate) type EventSink = Arc<dyn Fn(BackendEvent) + Send + Sync>;

/// One live backend process.
pub(crate) struct BackendProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    generation: u64,
    started_at: Instant,
}

impl BackendProcess {
    /// Spawns the backend and its pipe threads.
    pub(crate) fn spawn(
        config: &SpawnConfig,
        generation: u64,
        sink: EventSink,
    ) -> Result<Self, SupervisorError> {
        debug!(
            target: PROCESS_TARGET,
            command = %config.command.display(),
            args = ?config.args,
            generation,
            "spawning verification backend"
        );

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|error| {
            if error.kind() == io::ErrorKind::NotFound {
                SupervisorError::BinaryNotFound {
                    command: config.command.display().to_string(),
                    source: Arc::new(error),
                }
            } else {
                SupervisorError::SpawnFailed {
                    message: format!("failed to start {}", config.command.display()),
                    source: Arc::new(error),
                }
            }
        })?;

        // From here on a failure must not leak the child.
        match Self::attach(&mut child, generation, sink) {
            Ok(stdin) => {
                debug!(target: PROCESS_TARGET, pid = child.id(), generation, "backend spawned");
                Ok(Self {
                    child,
                    stdin: Some(stdin),
                    generation,
                    started_at: Instant::now(),
                })
            }
            Err(error) => {
                lifecycle::kill(&mut child);
                Err(error)
            }
        }
    }

    fn attach(
        child: &mut Child,
        generation: u64,
        sink: EventSink,
    ) -> Result<ChildStdin, SupervisorError> {
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;
        let pid = child.id();

        thread::Builder::new()
            .name(format!("proofwire-stdout-{generation}"))
            .spawn(move || forward_stdout(stdout, generation, &sink))
            .map_err(|error| SupervisorError::io("spawning the stdout reader", error))?;
        thread::Builder::new()
            .name(format!("proofwire-stderr-{generation}"))
            .spawn(move || drain_stderr(stderr, pid))
            .map_err(|error| SupervisorError::io("spawning the stderr reader", error))?;

        Ok(stdin)
    }

    /// Generation this process was spawned for.
    pub(crate) const fn generation(&self) -> u64 {
        self.generation
    }

    /// Writes one encoded command and flushes it.
    pub(crate) fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "backend stdin closed"))?;
        stdin.write_all(bytes)?;
        stdin.flush()
    }

    /// Whether the OS still reports the process as running.
    pub(crate) fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Writes `quit`, closes stdin, and waits up to `grace` before killing.
    pub(crate) fn shutdown(mut self, quit: &[u8], grace: Duration) -> Option<ExitStatus> {
        if let Err(error) = self.write(quit) {
            debug!(
                target: PROCESS_TARGET,
                generation = self.generation,
                %error,
                "quit could not be delivered"
            );
        }
        self.reap(grace)
    }

    /// Closes stdin and collects the exit status, killing after `grace`.
    pub(crate) fn reap(mut self, grace: Duration) -> Option<ExitStatus> {
        drop(self.stdin.take());
        let status = lifecycle::wait_or_kill(&mut self.child, grace);
        debug!(
            target: PROCESS_TARGET,
            generation = self.generation,
            uptime_ms = self.started_at.elapsed().as_millis(),
            ?status,
            "backend reaped"
        );
        status
    }
}

impl Drop for BackendProcess {
    fn drop(&mut self) {
        if self.is_alive() {
            warn!(
                target: PROCESS_TARGET,
                generation = self.generation,
                "backend dropped while running, killing"
            );
            lifecycle::kill(&mut self.child);
        }
    }
}

impl std::fmt::Debug for BackendProcess {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BackendProcess")
            .field("pid", &self.child.id())
            .field("generation", &self.generation)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

fn missing_pipe(name: &'static str) -> SupervisorError {
    SupervisorError::SpawnFailed {
        message: format!("failed to capture backend {name}"),
        source: Arc::new(io::Error::other(format!("no {name}"))),
    }
}

fn forward_stdout(mut stdout: ChildStdout, generation: u64, sink: &EventSink) {
    let mut buffer = vec![0_u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buffer) {
            Ok(0) => break,
            Ok(read) => {
                let bytes = buffer.get(..read).map(<[u8]>::to_vec).unwrap_or_default();
                sink(BackendEvent::Output { generation, bytes });
            }
            Err(error) if error.kind() == io::ErrorKind::Interrupted => {}
            Err(error) => {
                debug!(target: PROCESS_TARGET, generation, %error, "stdout read failed");
                break;
            }
        }
    }
    sink(BackendEvent::Closed { generation });
}

fn drain_stderr(stderr: impl Read, pid: u32) {
    for line in BufReader::new(stderr).lines() {
        match line {
            Ok(text) => debug!(target: PROCESS_TARGET, pid, stderr = %text, "backend stderr"),
            Err(_) => break,
        }
    }
}
