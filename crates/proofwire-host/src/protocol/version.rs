//! One-shot version handshake.

use super::command::{Verb, encode};
use super::framer::{FrameMode, Framed, ResponseFramer, Terminator};
use super::ProtocolMarkers;

/// Returns the version text following `prefix` on the first line carrying it.
///
/// The value runs from just after the prefix to the next newline and is
/// trimmed. Lines without the prefix and empty values yield `None`.
#[must_use]
pub fn extract_version<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    text.lines()
        .find_map(|line| line.trim_start().strip_prefix(prefix))
        .map(str::trim)
        .filter(|version| !version.is_empty())
}

/// Progress of a [`VersionProbe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeProgress {
    /// No version line yet.
    Pending,
    /// The version was extracted. `quit` must be written to the backend; it is
    /// handed out exactly once.
    Ready {
        /// Reported version.
        version: String,
        /// Encoded quit command.
        quit: Vec<u8>,
    },
    /// The backend answered with a frame that carries no version.
    Rejected {
        /// Text of the offending frame.
        output: String,
    },
    /// The probe already finished; further output is ignored.
    Done,
}

/// Drives the version handshake against a dedicated backend process.
#[derive(Debug)]
pub struct VersionProbe {
    framer: ResponseFramer,
    prefix: String,
    finished: bool,
}

impl VersionProbe {
    /// Creates a probe for the given markers.
    #[must_use]
    pub fn new(markers: ProtocolMarkers) -> Self {
        let prefix = markers.version_prefix.clone();
        Self {
            framer: ResponseFramer::with_mode(markers, FrameMode::Version),
            prefix,
            finished: false,
        }
    }

    /// Command that asks the backend for its version.
    #[must_use]
    pub fn request() -> Vec<u8> {
        encode(Verb::Version, "")
    }

    /// Feeds backend output to the probe.
    pub fn feed(&mut self, chunk: &[u8]) -> ProbeProgress {
        if self.finished {
            return ProbeProgress::Done;
        }

        match self.framer.feed(chunk) {
            Framed::NeedMore => ProbeProgress::Pending,
            Framed::CrashBanner(line) => {
                self.finished = true;
                ProbeProgress::Rejected { output: line }
            }
            Framed::Complete(frame) => {
                self.finished = true;
                let extracted = (frame.terminator() == Terminator::Version)
                    .then(|| extract_version(frame.terminator_line(), &self.prefix))
                    .flatten();
                extracted.map_or_else(
                    || ProbeProgress::Rejected {
                        output: format!("{}{}", frame.body(), frame.terminator_line()),
                    },
                    |version| ProbeProgress::Ready {
                        version: version.to_owned(),
                        quit: encode(Verb::Quit, ""),
                    },
                )
            }
        }
    }

    /// Whether the probe has finished.
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        self.finished
    }
}
