//! Request and result types exchanged with feature callers.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::protocol::Verb;

/// Operation a caller asks the backend to perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    /// Verify the document.
    Verify,
    /// Produce a counter-model for the document.
    CounterExample,
    /// Compile the document.
    Compile,
    /// Render the verification graph.
    DotGraph,
    /// Report the backend version. Answered without contacting the backend.
    VersionProbe,
}

impl Operation {
    /// Every operation, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Verify,
        Self::CounterExample,
        Self::Compile,
        Self::DotGraph,
        Self::VersionProbe,
    ];

    /// Wire verb used for this operation.
    #[must_use]
    pub const fn verb(self) -> Verb {
        match self {
            Self::Verify => Verb::Verify,
            Self::CounterExample => Verb::CounterExample,
            Self::Compile => Verb::Compile,
            Self::DotGraph => Verb::DotGraph,
            Self::VersionProbe => Verb::Version,
        }
    }

    /// Kebab-case name accepted by [`FromStr`].
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::CounterExample => "counter-example",
            Self::Compile => "compile",
            Self::DotGraph => "dot-graph",
            Self::VersionProbe => "version-probe",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown operation name.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown operation '{input}'")]
pub struct OperationParseError {
    input: String,
}

impl FromStr for Operation {
    type Err = OperationParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalised = input.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|operation| operation.as_str() == normalised)
            .ok_or_else(|| OperationParseError {
                input: input.to_owned(),
            })
    }
}

/// Snapshot of a document at the moment a request was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentSnapshot {
    /// Document identity.
    pub uri: Url,
    /// Editor version of the content.
    pub version: i32,
    /// Full document text.
    pub text: String,
}

impl DocumentSnapshot {
    /// Builds a snapshot.
    #[must_use]
    pub fn new(uri: Url, version: i32, text: impl Into<String>) -> Self {
        Self {
            uri,
            version,
            text: text.into(),
        }
    }

    /// Filename reported to the backend: the local path for `file:` URIs,
    /// otherwise the URI itself.
    #[must_use]
    pub fn filename(&self) -> String {
        self.uri
            .to_file_path()
            .ok()
            .and_then(|path| path.to_str().map(str::to_owned))
            .unwrap_or_else(|| self.uri.to_string())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DocumentPayload<'a> {
    filename: String,
    source: &'a str,
    source_is_file: bool,
    args: &'a [String],
}

/// A unit of work submitted to the dispatcher.
#[derive(Debug, Clone)]
pub struct VerificationRequest {
    /// Document to operate on.
    pub document: DocumentSnapshot,
    /// Requested operation.
    pub operation: Operation,
    /// Extra backend arguments.
    pub args: Vec<String>,
    /// When the caller created the request.
    pub enqueued_at: Instant,
}

impl VerificationRequest {
    /// Creates a request stamped with the current time.
    #[must_use]
    pub fn new(document: DocumentSnapshot, operation: Operation) -> Self {
        Self {
            document,
            operation,
            args: Vec::new(),
            enqueued_at: Instant::now(),
        }
    }

    /// Adds backend arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Serialises the single-line JSON argument blob.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialisation fails.
    pub fn payload(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&DocumentPayload {
            filename: self.document.filename(),
            source: &self.document.text,
            source_is_file: false,
            args: &self.args,
        })
    }
}

/// Outcome classification of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationStatus {
    /// Success marker with zero errors.
    Verified,
    /// Success marker with errors.
    NotVerified,
    /// Failure marker, crash, or abandoned request.
    Failed,
}

/// Severity of a backend diagnostic line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    /// Verification or resolution error.
    Error,
    /// Warning.
    Warning,
    /// Informational or related location.
    Info,
}

/// One `path(line,col): Severity: message` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDiagnostic {
    /// Path as printed by the backend.
    pub path: String,
    /// One-based line.
    pub line: u32,
    /// Column as printed by the backend.
    pub column: u32,
    /// Severity.
    pub severity: DiagnosticSeverity,
    /// Message text.
    pub message: String,
}

/// Typed answer to one [`VerificationRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    /// Dispatcher sequence number of the request.
    pub sequence: u64,
    /// Operation that produced the result.
    pub operation: Operation,
    /// Classification.
    pub status: VerificationStatus,
    /// Proof obligations reported by the backend.
    pub proof_obligations: u32,
    /// Errors reported by the backend.
    pub errors: u32,
    /// The backend died or was stopped while the request was in flight.
    pub crashed: bool,
    /// Counter-model text for counter-example requests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counter_model: Option<String>,
    /// Parsed diagnostic lines.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<BackendDiagnostic>,
    /// Raw frame body.
    pub output: String,
}

impl VerificationResult {
    /// Result delivered when the backend went away mid-request.
    #[must_use]
    pub const fn crashed(sequence: u64, operation: Operation) -> Self {
        Self {
            sequence,
            operation,
            status: VerificationStatus::Failed,
            proof_obligations: 0,
            errors: 0,
            crashed: true,
            counter_model: None,
            diagnostics: Vec::new(),
            output: String::new(),
        }
    }

    /// Answer to a version probe served from the cached handshake.
    #[must_use]
    pub fn version(sequence: u64, version: &str) -> Self {
        Self {
            sequence,
            operation: Operation::VersionProbe,
            status: VerificationStatus::Verified,
            proof_obligations: 0,
            errors: 0,
            crashed: false,
            counter_model: None,
            diagnostics: Vec::new(),
            output: version.to_owned(),
        }
    }

    /// Whether the document verified cleanly.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.status == VerificationStatus::Verified && !self.crashed
    }
}
