//! Request encoding.

use std::fmt;

/// Commands understood by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    /// Verify a document.
    Verify,
    /// Produce a counter-model for a failing document.
    CounterExample,
    /// Compile a document.
    Compile,
    /// Render the document's verification graph.
    DotGraph,
    /// Report the backend version.
    Version,
    /// Exit the backend. No response is expected.
    Quit,
}

impl Verb {
    /// The literal written to the backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::CounterExample => "counterExample",
            Self::Compile => "compile",
            Self::DotGraph => "dotgraph",
            Self::Version => "version",
            Self::Quit => "quit",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Encodes a command line for the backend's stdin.
///
/// The payload is written verbatim; the protocol has no escaping scheme, so a
/// payload containing a newline reaches the backend as several lines. An empty
/// payload produces the bare verb.
#[must_use]
pub fn encode(verb: Verb, payload: &str) -> Vec<u8> {
    let literal = verb.as_str();
    let mut line = Vec::with_capacity(literal.len() + payload.len() + 2);
    line.extend_from_slice(literal.as_bytes());
    if !payload.is_empty() {
        line.push(b' ');
        line.extend_from_slice(payload.as_bytes());
    }
    line.push(b'\n');
    line
}
