//! Shared configuration for the proofwire supervisor and its binary.
//!
//! [`Config`] is layered by `ortho_config`: built-in defaults, then a
//! discovered `proofwire.toml`, then `PROOFWIRE_*` environment variables, then
//! command-line flags. The host library never reads the environment itself; it
//! converts a resolved [`Config`] into its own typed settings.

mod defaults;
mod logging;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_BACKEND_COMMAND, DEFAULT_CRASH_BANNER_PREFIX, DEFAULT_FAILURE_MARKER,
    DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_LOG_FILTER, DEFAULT_MAX_CONNECTION_RETRIES,
    DEFAULT_READINESS_ATTEMPTS, DEFAULT_READINESS_INTERVAL_MS, DEFAULT_STOP_GRACE_MS,
    DEFAULT_SUCCESS_MARKER, DEFAULT_VERSION_PREFIX, default_backend_command, default_log_filter,
    default_log_filter_string, default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};

/// Resolved configuration for the verification backend supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, OrthoConfig)]
#[ortho_config(prefix = "PROOFWIRE")]
pub struct Config {
    /// Executable that runs the verification backend.
    #[ortho_config(default = default_backend_command())]
    pub backend_command: String,
    /// Arguments passed to the backend executable.
    #[ortho_config(default = Vec::new())]
    pub backend_args: Vec<String>,
    /// Working directory for the backend process.
    pub working_dir: Option<Utf8PathBuf>,
    /// `tracing` filter expression.
    #[ortho_config(default = default_log_filter_string())]
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(default = default_log_format())]
    pub log_format: LogFormat,
    /// Milliseconds `stop` waits for a clean exit before killing the backend.
    #[ortho_config(default = DEFAULT_STOP_GRACE_MS)]
    pub stop_grace_ms: u64,
    /// Milliseconds allowed for the version handshake.
    #[ortho_config(default = DEFAULT_HANDSHAKE_TIMEOUT_MS)]
    pub handshake_timeout_ms: u64,
    /// Milliseconds between readiness polls.
    #[ortho_config(default = DEFAULT_READINESS_INTERVAL_MS)]
    pub readiness_interval_ms: u64,
    /// Readiness polls before a caller gives up.
    #[ortho_config(default = DEFAULT_READINESS_ATTEMPTS)]
    pub readiness_attempts: u32,
    /// Restart attempts allowed after a crash.
    #[ortho_config(default = DEFAULT_MAX_CONNECTION_RETRIES)]
    pub max_connection_retries: u32,
    /// Restart the backend automatically after a crash.
    #[ortho_config(default = false)]
    pub auto_restart: bool,
    /// Sentinel line ending a successful response.
    #[ortho_config(default = DEFAULT_SUCCESS_MARKER.to_owned())]
    pub success_marker: String,
    /// Sentinel line ending a failed response.
    #[ortho_config(default = DEFAULT_FAILURE_MARKER.to_owned())]
    pub failure_marker: String,
    /// Prefix of the version line emitted by the backend.
    #[ortho_config(default = DEFAULT_VERSION_PREFIX.to_owned())]
    pub version_prefix: String,
    /// Prefix of the banner a crashing backend prints.
    #[ortho_config(default = DEFAULT_CRASH_BANNER_PREFIX.to_owned())]
    pub crash_banner_prefix: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_command: default_backend_command(),
            backend_args: Vec::new(),
            working_dir: None,
            log_filter: default_log_filter_string(),
            log_format: default_log_format(),
            stop_grace_ms: DEFAULT_STOP_GRACE_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            readiness_interval_ms: DEFAULT_READINESS_INTERVAL_MS,
            readiness_attempts: DEFAULT_READINESS_ATTEMPTS,
            max_connection_retries: DEFAULT_MAX_CONNECTION_RETRIES,
            auto_restart: false,
            success_marker: DEFAULT_SUCCESS_MARKER.to_owned(),
            failure_marker: DEFAULT_FAILURE_MARKER.to_owned(),
            version_prefix: DEFAULT_VERSION_PREFIX.to_owned(),
            crash_banner_prefix: DEFAULT_CRASH_BANNER_PREFIX.to_owned(),
        }
    }
}

/// Errors raised while loading or validating [`Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Layered loading failed (malformed file, bad flag, bad environment value).
    #[error("failed to load configuration: {source}")]
    Load {
        /// Aggregated loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// A value loaded successfully but cannot be used.
    #[error("invalid configuration value for '{field}': {reason}")]
    Invalid {
        /// Offending field.
        field: &'static str,
        /// Why the value was rejected.
        reason: &'static str,
    },
}

impl Config {
    /// Loads configuration from the supplied arguments plus files and
    /// environment, then validates it.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when any layer fails to parse and
    /// [`ConfigError::Invalid`] when the merged values are unusable.
    pub fn load_from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = <Self as OrthoConfig>::load_from_iter(args)
            .map_err(|source| ConfigError::Load { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the supervisor cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::Invalid { field, reason });
        if self.backend_command.trim().is_empty() {
            return invalid("backend_command", "must not be empty");
        }
        if self.success_marker.is_empty() || self.failure_marker.is_empty() {
            return invalid("success_marker", "markers must not be empty");
        }
        if self.success_marker == self.failure_marker {
            return invalid("failure_marker", "must differ from success_marker");
        }
        if self.version_prefix.is_empty() {
            return invalid("version_prefix", "must not be empty");
        }
        if self.readiness_attempts == 0 {
            return invalid("readiness_attempts", "must be at least 1");
        }
        Ok(())
    }

    /// Log filter expression.
    #[must_use]
    pub const fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Grace period granted to the backend on stop.
    #[must_use]
    pub const fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    /// Time budget for the version handshake.
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Interval between readiness polls.
    #[must_use]
    pub const fn readiness_interval(&self) -> Duration {
        Duration::from_millis(self.readiness_interval_ms)
    }
}
