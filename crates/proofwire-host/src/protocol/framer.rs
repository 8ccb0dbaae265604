//! Incremental response framing.
//!
//! The backend flushes its pipe at arbitrary granularity, so a sentinel may
//! arrive split across reads and one read may carry several frames. The framer
//! accumulates raw bytes and only inspects complete lines; partial lines,
//! including partial UTF-8 sequences, stay buffered until the next chunk.

use super::ProtocolMarkers;
use super::version::extract_version;

/// Which sentinel ended a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminator {
    /// The success marker.
    Success,
    /// The failure marker.
    Failure,
    /// A version line (version mode only).
    Version,
}

/// Which lines terminate a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameMode {
    /// Success and failure markers end a frame.
    #[default]
    Response,
    /// A version line also ends a frame.
    Version,
}

/// One complete unit of backend output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    body: String,
    terminator: Terminator,
    terminator_line: String,
}

impl ResponseFrame {
    /// Builds a frame from its parts.
    #[must_use]
    pub fn new(body: impl Into<String>, terminator: Terminator, terminator_line: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            terminator,
            terminator_line: terminator_line.into(),
        }
    }

    /// Text received before the terminator line.
    #[must_use]
    pub const fn body(&self) -> &str {
        self.body.as_str()
    }

    /// Sentinel that ended the frame.
    #[must_use]
    pub const fn terminator(&self) -> Terminator {
        self.terminator
    }

    /// The terminator line as received, without its newline.
    #[must_use]
    pub const fn terminator_line(&self) -> &str {
        self.terminator_line.as_str()
    }
}

/// Outcome of a framing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framed {
    /// A frame completed.
    Complete(ResponseFrame),
    /// An out-of-band crash banner line was seen. The line stays part of the
    /// frame body.
    CrashBanner(String),
    /// No complete frame is buffered.
    NeedMore,
}

/// Accumulates backend output and splits it into frames.
///
/// Not thread-safe by construction: one owner feeds it.
#[derive(Debug)]
pub struct ResponseFramer {
    markers: ProtocolMarkers,
    mode: FrameMode,
    buffer: Vec<u8>,
    scanned: usize,
}

impl ResponseFramer {
    /// Creates an empty framer in [`FrameMode::Response`].
    #[must_use]
    pub fn new(markers: ProtocolMarkers) -> Self {
        Self::with_mode(markers, FrameMode::Response)
    }

    /// Creates an empty framer in the given mode.
    #[must_use]
    pub const fn with_mode(markers: ProtocolMarkers, mode: FrameMode) -> Self {
        Self {
            markers,
            mode,
            buffer: Vec::new(),
            scanned: 0,
        }
    }

    /// Appends a chunk and returns the first frame it completes, if any.
    ///
    /// Further frames already buffered are retrieved with
    /// [`next_frame`](Self::next_frame).
    pub fn feed(&mut self, chunk: &[u8]) -> Framed {
        self.buffer.extend_from_slice(chunk);
        self.next_frame()
    }

    /// Scans buffered lines not yet inspected for a terminator.
    pub fn next_frame(&mut self) -> Framed {
        loop {
            let Some(unscanned) = self.buffer.get(self.scanned..) else {
                return Framed::NeedMore;
            };
            let Some(newline) = unscanned.iter().position(|byte| *byte == b'\n') else {
                return Framed::NeedMore;
            };

            let line_start = self.scanned;
            let line_end = line_start + newline;
            self.scanned = line_end + 1;

            let line = self.line_text(line_start, line_end);
            if let Some(terminator) = self.terminator_for(&line) {
                return Framed::Complete(self.take_frame(line_start, terminator, line));
            }
            if line.starts_with(self.markers.crash_banner_prefix.as_str()) {
                return Framed::CrashBanner(line);
            }
        }
    }

    /// Bytes buffered towards the next frame.
    #[must_use]
    pub const fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Discards buffered output, e.g. when a new backend generation starts.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
    }

    fn line_text(&self, start: usize, end: usize) -> String {
        let bytes = self.buffer.get(start..end).unwrap_or_default();
        String::from_utf8_lossy(bytes)
            .trim_end_matches('\r')
            .to_owned()
    }

    fn terminator_for(&self, line: &str) -> Option<Terminator> {
        if line == self.markers.success {
            Some(Terminator::Success)
        } else if line == self.markers.failure {
            Some(Terminator::Failure)
        } else if self.mode == FrameMode::Version
            && extract_version(line, &self.markers.version_prefix).is_some()
        {
            Some(Terminator::Version)
        } else {
            None
        }
    }

    fn take_frame(&mut self, body_end: usize, terminator: Terminator, line: String) -> ResponseFrame {
        let body = String::from_utf8_lossy(self.buffer.get(..body_end).unwrap_or_default())
            .into_owned();
        self.buffer.drain(..self.scanned);
        self.scanned = 0;
        ResponseFrame::new(body, terminator, line)
    }
}
