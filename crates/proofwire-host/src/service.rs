//! The verification service context object.

use std::sync::Arc;
use std::sync::mpsc;

use crate::config::BackendConfig;
use crate::dispatcher::{DispatchMessage, Dispatcher, DispatcherStats, PendingVerification};
use crate::errors::{DispatchError, ReadinessError, SupervisorError};
use crate::events::LifecycleReporter;
use crate::process::EventSink;
use crate::readiness::{ReadinessPolicy, await_ready};
use crate::request::VerificationRequest;
use crate::supervisor::{self, BackendVersion, Supervisor, SupervisorState};

/// Supervisor, dispatcher, and readiness gate for one backend.
///
/// Lifecycle: [`new`](Self::new), [`start`](Self::start), submit work, then
/// [`shutdown`](Self::shutdown). Dropping the service also stops the backend.
#[derive(Debug)]
pub struct VerificationService {
    config: BackendConfig,
    supervisor: Arc<Supervisor>,
    dispatcher: Dispatcher,
}

impl VerificationService {
    /// Builds the service and its dispatcher thread. No process is spawned
    /// until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`SupervisorError::Io`] if the dispatcher thread cannot be
    /// spawned.
    pub fn new<R>(config: BackendConfig, reporter: R) -> Result<Self, SupervisorError>
    where
        R: LifecycleReporter + 'static,
    {
        let reporter: Arc<dyn LifecycleReporter> = Arc::new(reporter);
        let (sender, receiver) = mpsc::channel();
        let backend_sender = sender.clone();
        let sink: EventSink = Arc::new(move |event| {
            // Events after shutdown have nobody left to act on them.
            drop(backend_sender.send(DispatchMessage::Backend(event)));
        });

        let supervisor = Arc::new(Supervisor::new(&config, Arc::clone(&reporter), sink));
        let dispatcher = Dispatcher::spawn(
            Arc::clone(&supervisor),
            sender,
            receiver,
            config.markers.clone(),
            reporter,
        )?;

        Ok(Self {
            config,
            supervisor,
            dispatcher,
        })
    }

    /// Starts the backend with the configured spawn settings.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::start`].
    pub fn start(&self) -> Result<BackendVersion, SupervisorError> {
        self.supervisor.start(self.config.spawn.clone())
    }

    /// Replaces the backend with a fresh process.
    ///
    /// # Errors
    ///
    /// See [`Supervisor::restart`].
    pub fn restart(&self) -> Result<BackendVersion, SupervisorError> {
        self.supervisor.restart()
    }

    /// Stops the backend. Idempotent.
    pub fn stop(&self) {
        self.supervisor.stop();
    }

    /// Submits a request.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::submit`].
    pub fn submit(&self, request: &VerificationRequest) -> Result<PendingVerification, DispatchError> {
        self.dispatcher.submit(request)
    }

    /// Waits for the backend using the configured readiness policy.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::Timeout`] when the policy is exhausted.
    pub fn await_ready(&self) -> Result<(), ReadinessError> {
        self.await_ready_with(self.config.readiness)
    }

    /// Waits for the backend using an explicit readiness policy.
    ///
    /// # Errors
    ///
    /// Returns [`ReadinessError::Timeout`] when the policy is exhausted.
    pub fn await_ready_with(&self, policy: ReadinessPolicy) -> Result<(), ReadinessError> {
        await_ready(&|| self.dispatcher.accepts_work(), policy)
    }

    /// Whether a backend process is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.supervisor.is_running()
    }

    /// Supervisor state.
    #[must_use]
    pub fn state(&self) -> SupervisorState {
        self.supervisor.state()
    }

    /// Version reported at the last handshake.
    #[must_use]
    pub fn version(&self) -> Option<BackendVersion> {
        self.supervisor.version()
    }

    /// Dispatcher counters.
    #[must_use]
    pub fn stats(&self) -> DispatcherStats {
        self.dispatcher.stats()
    }

    /// The underlying supervisor.
    #[must_use]
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Stops the backend and the dispatcher thread.
    pub fn shutdown(self) {
        self.close();
    }

    fn close(&self) {
        self.supervisor.stop();
        self.dispatcher.shutdown();
    }
}

impl Drop for VerificationService {
    fn drop(&mut self) {
        self.close();
    }
}

/// Runs the version handshake against a throwaway backend process.
///
/// # Errors
///
/// Returns spawn errors when the executable cannot be launched and
/// [`SupervisorError::Handshake`] when it reports no version in time.
pub fn probe_version(config: &BackendConfig) -> Result<BackendVersion, SupervisorError> {
    supervisor::probe_version(
        &config.spawn,
        &config.markers,
        config.handshake_timeout,
        config.stop_grace,
    )
}
