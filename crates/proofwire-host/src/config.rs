//! Typed settings for the verification service.

use std::time::Duration;

use proofwire_config::{Config, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_STOP_GRACE_MS};

use crate::process::SpawnConfig;
use crate::protocol::ProtocolMarkers;
use crate::readiness::ReadinessPolicy;
use crate::supervisor::RestartPolicy;

/// Everything the service needs to run one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// How to launch the backend.
    pub spawn: SpawnConfig,
    /// Sentinels recognised in backend output.
    pub markers: ProtocolMarkers,
    /// Crash handling.
    pub restart: RestartPolicy,
    /// Wait for a clean exit before killing.
    pub stop_grace: Duration,
    /// Budget for the version handshake.
    pub handshake_timeout: Duration,
    /// Default readiness polling.
    pub readiness: ReadinessPolicy,
}

impl BackendConfig {
    /// Default settings for the given spawn configuration.
    #[must_use]
    pub fn new(spawn: SpawnConfig) -> Self {
        Self {
            spawn,
            markers: ProtocolMarkers::default(),
            restart: RestartPolicy::default(),
            stop_grace: Duration::from_millis(DEFAULT_STOP_GRACE_MS),
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            readiness: ReadinessPolicy::default(),
        }
    }

    /// Replaces the restart policy.
    #[must_use]
    pub const fn with_restart(mut self, restart: RestartPolicy) -> Self {
        self.restart = restart;
        self
    }

    /// Replaces the stop grace period.
    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Replaces the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Replaces the readiness policy.
    #[must_use]
    pub const fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.readiness = readiness;
        self
    }
}

impl From<&Config> for BackendConfig {
    fn from(config: &Config) -> Self {
        Self {
            spawn: SpawnConfig::from(config),
            markers: ProtocolMarkers::from(config),
            restart: RestartPolicy::from(config),
            stop_grace: config.stop_grace(),
            handshake_timeout: config.handshake_timeout(),
            readiness: ReadinessPolicy::from(config),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use rstest::rstest;

    use super::*;

    #[rstest]
    fn converts_layered_configuration() {
        let config = Config {
            backend_command: String::from("/opt/verifier/server"),
            backend_args: vec![String::from("--quiet")],
            auto_restart: true,
            max_connection_retries: 5,
            success_marker: String::from("OK"),
            readiness_attempts: 4,
            ..Config::default()
        };

        let backend = BackendConfig::from(&config);

        assert_eq!(backend.spawn.command, PathBuf::from("/opt/verifier/server"));
        assert_eq!(backend.spawn.args, vec!["--quiet"]);
        assert_eq!(
            backend.restart,
            RestartPolicy {
                auto_restart: true,
                max_retries: 5,
            }
        );
        assert_eq!(backend.markers.success, "OK");
        assert_eq!(backend.readiness.max_attempts, 4);
        assert_eq!(backend.stop_grace, Duration::from_secs(2));
    }
}
