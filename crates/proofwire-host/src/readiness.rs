//! Bounded polling for callers that arrive before the backend is up.

use std::thread;
use std::time::Duration;

use proofwire_config::{Config, DEFAULT_READINESS_ATTEMPTS, DEFAULT_READINESS_INTERVAL_MS};
use tracing::debug;

use crate::errors::ReadinessError;

const READINESS_TARGET: &str = "proofwire_host::readiness";

/// How long and how often to poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessPolicy {
    /// Sleep after each failed check.
    pub poll_interval: Duration,
    /// Checks before giving up.
    pub max_attempts: u32,
}

impl ReadinessPolicy {
    /// Builds a policy.
    #[must_use]
    pub const fn new(poll_interval: Duration, max_attempts: u32) -> Self {
        Self {
            poll_interval,
            max_attempts,
        }
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(DEFAULT_READINESS_INTERVAL_MS),
            DEFAULT_READINESS_ATTEMPTS,
        )
    }
}

impl From<&Config> for ReadinessPolicy {
    fn from(config: &Config) -> Self {
        Self::new(config.readiness_interval(), config.readiness_attempts)
    }
}

/// Something that can say whether the backend accepts work right now.
pub trait ReadinessProbe {
    /// Returns `true` once requests can be submitted.
    fn is_ready(&self) -> bool;
}

impl<F> ReadinessProbe for F
where
    F: Fn() -> bool,
{
    fn is_ready(&self) -> bool {
        self()
    }
}

/// Polls `probe` until it reports ready or the policy is exhausted.
///
/// The probe is checked immediately; each failed check is followed by one
/// `poll_interval` sleep, so a never-ready probe costs `max_attempts` checks
/// and sleeps.
///
/// # Errors
///
/// Returns [`ReadinessError::Timeout`] when every check failed.
pub fn await_ready<P>(probe: &P, policy: ReadinessPolicy) -> Result<(), ReadinessError>
where
    P: ReadinessProbe + ?Sized,
{
    for attempt in 1..=policy.max_attempts {
        if probe.is_ready() {
            debug!(target: READINESS_TARGET, attempt, "backend ready");
            return Ok(());
        }
        debug!(
            target: READINESS_TARGET,
            attempt,
            max_attempts = policy.max_attempts,
            "backend not ready, waiting"
        );
        thread::sleep(policy.poll_interval);
    }

    Err(ReadinessError::Timeout {
        attempts: policy.max_attempts,
        poll_interval: policy.poll_interval,
    })
}
