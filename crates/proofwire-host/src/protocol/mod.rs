//! Wire protocol spoken with the verification backend.
//!
//! Requests are single lines:
//!
//! ```text
//! <verb> <argument-blob>\n
//! ```
//!
//! Responses carry no length prefix. Everything the backend prints up to a
//! sentinel line belongs to one frame:
//!
//! ```text
//! proofObligationCount=4 errorCount=0
//! SUCCESS-MARKER
//! ```
//!
//! The version probe is answered by a line starting with `VERSION:`. The
//! protocol has no request identifiers and no escaping, so frames are matched
//! to requests purely by arrival order.

mod classify;
mod command;
mod framer;
mod version;

use proofwire_config::{
    Config, DEFAULT_CRASH_BANNER_PREFIX, DEFAULT_FAILURE_MARKER, DEFAULT_SUCCESS_MARKER,
    DEFAULT_VERSION_PREFIX,
};

pub use classify::{FrameCounts, classify, parse_counts, parse_diagnostics};
pub use command::{Verb, encode};
pub use framer::{FrameMode, Framed, ResponseFrame, ResponseFramer, Terminator};
pub use version::{ProbeProgress, VersionProbe, extract_version};

/// Sentinel strings recognised in backend output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolMarkers {
    /// Line ending a successful frame.
    pub success: String,
    /// Line ending a failed frame.
    pub failure: String,
    /// Prefix of the version line.
    pub version_prefix: String,
    /// Prefix of the banner printed by a crashing backend.
    pub crash_banner_prefix: String,
}

impl Default for ProtocolMarkers {
    fn default() -> Self {
        Self {
            success: DEFAULT_SUCCESS_MARKER.to_owned(),
            failure: DEFAULT_FAILURE_MARKER.to_owned(),
            version_prefix: DEFAULT_VERSION_PREFIX.to_owned(),
            crash_banner_prefix: DEFAULT_CRASH_BANNER_PREFIX.to_owned(),
        }
    }
}

impl From<&Config> for ProtocolMarkers {
    fn from(config: &Config) -> Self {
        Self {
            success: config.success_marker.clone(),
            failure: config.failure_marker.clone(),
            version_prefix: config.version_prefix.clone(),
            crash_banner_prefix: config.crash_banner_prefix.clone(),
        }
    }
}
