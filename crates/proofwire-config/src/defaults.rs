//! Built-in defaults shared by the host library and the binary.

use crate::logging::LogFormat;

/// Executable launched when no backend command is configured.
pub const DEFAULT_BACKEND_COMMAND: &str = "verification-server";

/// Default log filter expression.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Line that terminates a successful response frame.
pub const DEFAULT_SUCCESS_MARKER: &str = "SUCCESS-MARKER";

/// Line that terminates a failed response frame.
pub const DEFAULT_FAILURE_MARKER: &str = "FAILURE-MARKER";

/// Prefix of the line carrying the backend version.
pub const DEFAULT_VERSION_PREFIX: &str = "VERSION:";

/// Prefix of the out-of-band line a backend prints when it crashes.
pub const DEFAULT_CRASH_BANNER_PREFIX: &str = "Unhandled exception";

/// How long `stop` waits for the backend to exit after `quit`.
pub const DEFAULT_STOP_GRACE_MS: u64 = 2_000;

/// How long the version handshake may take before it is abandoned.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Interval between readiness polls.
pub const DEFAULT_READINESS_INTERVAL_MS: u64 = 2_000;

/// Number of readiness polls before giving up.
pub const DEFAULT_READINESS_ATTEMPTS: u32 = 30;

/// Restart attempts allowed before manual intervention is required.
pub const DEFAULT_MAX_CONNECTION_RETRIES: u32 = 3;

/// Default backend command.
#[must_use]
pub fn default_backend_command() -> String {
    DEFAULT_BACKEND_COMMAND.to_owned()
}

/// Default log filter expression.
#[must_use]
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
#[must_use]
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format.
#[must_use]
pub fn default_log_format() -> LogFormat {
    LogFormat::Json
}
