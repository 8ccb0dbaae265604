//! Turns response frames into typed verification results.
//!
//! Beyond the terminator the backend's output is not validated. Counters are
//! read from `proofObligationCount=<n>` / `errorCount=<n>` tokens, falling back
//! to a `finished with <v> verified, <e> errors` summary line, and diagnostics
//! from lines shaped like `path(line,col): Error: message`.

use super::framer::{ResponseFrame, Terminator};
use crate::request::{
    BackendDiagnostic, DiagnosticSeverity, Operation, VerificationResult, VerificationStatus,
};

const PROOF_OBLIGATIONS_KEY: &str = "proofObligationCount=";
const ERRORS_KEY: &str = "errorCount=";
const SUMMARY_PREFIX: &str = "finished with ";

/// Counters reported in a frame body.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameCounts {
    /// Proof obligations the backend discharged or attempted.
    pub proof_obligations: Option<u32>,
    /// Verification errors.
    pub errors: Option<u32>,
}

/// Reads proof-obligation and error counters from a frame body.
#[must_use]
pub fn parse_counts(body: &str) -> FrameCounts {
    let mut counts = FrameCounts::default();
    for token in body.split_whitespace() {
        if let Some(value) = token.strip_prefix(PROOF_OBLIGATIONS_KEY) {
            counts.proof_obligations = value.parse().ok().or(counts.proof_obligations);
        } else if let Some(value) = token.strip_prefix(ERRORS_KEY) {
            counts.errors = value.parse().ok().or(counts.errors);
        }
    }

    if counts.proof_obligations.is_none()
        && counts.errors.is_none()
        && let Some((verified, errors)) = body.lines().find_map(parse_summary)
    {
        counts.proof_obligations = Some(verified.saturating_add(errors));
        counts.errors = Some(errors);
    }
    counts
}

/// Parses `... finished with 3 verified, 1 error`.
fn parse_summary(line: &str) -> Option<(u32, u32)> {
    let (_, tail) = line.split_once(SUMMARY_PREFIX)?;
    let (verified_part, errors_part) = tail.split_once(',')?;
    let verified = verified_part
        .trim()
        .strip_suffix("verified")?
        .trim()
        .parse()
        .ok()?;
    let errors = errors_part.split_whitespace().next()?.parse().ok()?;
    Some((verified, errors))
}

/// Extracts `path(line,col): Severity: message` diagnostics.
#[must_use]
pub fn parse_diagnostics(body: &str) -> Vec<BackendDiagnostic> {
    body.lines().filter_map(parse_diagnostic_line).collect()
}

fn parse_diagnostic_line(line: &str) -> Option<BackendDiagnostic> {
    let (location, rest) = line.split_once("): ")?;
    let (path, position) = location.rsplit_once('(')?;
    let (line_number, column) = position.split_once(',')?;
    let (label, message) = rest.split_once(": ")?;
    let severity = match label.trim() {
        "Error" => DiagnosticSeverity::Error,
        "Warning" => DiagnosticSeverity::Warning,
        "Info" | "Related location" => DiagnosticSeverity::Info,
        _ => return None,
    };

    Some(BackendDiagnostic {
        path: path.trim().to_owned(),
        line: line_number.trim().parse().ok()?,
        column: column.trim().parse().ok()?,
        severity,
        message: message.trim().to_owned(),
    })
}

fn counter_model(body: &str) -> Option<String> {
    let joined = body
        .lines()
        .filter(|line| {
            !line.contains(ERRORS_KEY)
                && !line.contains(PROOF_OBLIGATIONS_KEY)
                && !line.contains(SUMMARY_PREFIX)
        })
        .collect::<Vec<_>>()
        .join("\n");
    let model = joined.trim();
    (!model.is_empty()).then(|| model.to_owned())
}

/// Classifies a completed frame as the answer to request `sequence`.
#[must_use]
pub fn classify(frame: &ResponseFrame, operation: Operation, sequence: u64) -> VerificationResult {
    let body = frame.body();
    let diagnostics = parse_diagnostics(body);

    if frame.terminator() != Terminator::Success {
        return VerificationResult {
            sequence,
            operation,
            status: VerificationStatus::Failed,
            proof_obligations: 0,
            errors: count_errors(&diagnostics).max(1),
            crashed: false,
            counter_model: None,
            diagnostics,
            output: body.trim_end().to_owned(),
        };
    }

    let counts = parse_counts(body);
    let errors = counts.errors.unwrap_or_else(|| count_errors(&diagnostics));
    let status = if errors == 0 {
        VerificationStatus::Verified
    } else {
        VerificationStatus::NotVerified
    };
    let counter_model = match operation {
        Operation::CounterExample => counter_model(body),
        _ => None,
    };

    VerificationResult {
        sequence,
        operation,
        status,
        proof_obligations: counts.proof_obligations.unwrap_or(0),
        errors,
        crashed: false,
        counter_model,
        diagnostics,
        output: body.trim_end().to_owned(),
    }
}

fn count_errors(diagnostics: &[BackendDiagnostic]) -> u32 {
    let count = diagnostics
        .iter()
        .filter(|diagnostic| diagnostic.severity == DiagnosticSeverity::Error)
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn success(body: &str) -> ResponseFrame {
        ResponseFrame::new(body, Terminator::Success, "SUCCESS-MARKER")
    }

    #[rstest]
    fn zero_errors_with_success_marker_is_verified() {
        let result = classify(&success("errorCount=0\n"), Operation::Verify, 7);

        assert_eq!(result.status, VerificationStatus::Verified);
        assert_eq!(result.errors, 0);
        assert_eq!(result.sequence, 7);
        assert!(!result.crashed);
    }

    #[rstest]
    fn reported_errors_mean_not_verified() {
        let body = "/w/a.dfy(3,4): Error: assertion might not hold\n\
                    proofObligationCount=5 errorCount=1\n";

        let result = classify(&success(body), Operation::Verify, 1);

        assert_eq!(result.status, VerificationStatus::NotVerified);
        assert_eq!(result.proof_obligations, 5);
        assert_eq!(result.errors, 1);
        assert_eq!(
            result.diagnostics,
            vec![BackendDiagnostic {
                path: String::from("/w/a.dfy"),
                line: 3,
                column: 4,
                severity: DiagnosticSeverity::Error,
                message: String::from("assertion might not hold"),
            }]
        );
    }

    #[rstest]
    fn failure_marker_is_failed_with_diagnostic_text() {
        let frame = ResponseFrame::new("parse error near 'lemma'\n", Terminator::Failure, "FAILURE-MARKER");

        let result = classify(&frame, Operation::Compile, 2);

        assert_eq!(result.status, VerificationStatus::Failed);
        assert_eq!(result.output, "parse error near 'lemma'");
        assert!(!result.crashed);
    }

    #[rstest]
    #[case("Dafny program verifier finished with 3 verified, 0 errors", Some(3), Some(0))]
    #[case("Dafny program verifier finished with 2 verified, 1 error", Some(3), Some(1))]
    #[case("proofObligationCount=4", Some(4), None)]
    #[case("nothing to see", None, None)]
    fn reads_counters(#[case] body: &str, #[case] obligations: Option<u32>, #[case] errors: Option<u32>) {
        assert_eq!(
            parse_counts(body),
            FrameCounts {
                proof_obligations: obligations,
                errors,
            }
        );
    }

    #[rstest]
    fn missing_error_counter_falls_back_to_diagnostics() {
        let body = "a.dfy(1,1): Error: postcondition might not hold\na.dfy(2,1): Warning: unused\n";

        let result = classify(&success(body), Operation::Verify, 3);

        assert_eq!(result.errors, 1);
        assert_eq!(result.diagnostics.len(), 2);
    }

    #[rstest]
    fn counter_model_is_the_body_without_counters() {
        let body = "x := 4\ny := -1\nerrorCount=1\n";

        let result = classify(&success(body), Operation::CounterExample, 4);

        assert_eq!(result.counter_model.as_deref(), Some("x := 4\ny := -1"));
        assert_eq!(classify(&success(body), Operation::Verify, 5).counter_model, None);
    }

    #[rstest]
    fn ignores_lines_that_only_resemble_diagnostics() {
        assert!(parse_diagnostics("call(a, b): Note: ignored").is_empty());
        assert!(parse_diagnostics("f(x,y): Error: bad").is_empty());
    }
}
