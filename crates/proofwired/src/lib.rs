//! Runtime for the `proofwired` binary.
//!
//! Loads [`Config`] from files and `PROOFWIRE_*` variables, installs
//! telemetry, then either probes the backend version or verifies a list of
//! files, writing one JSON result per line.

mod cli;
pub mod telemetry;

use std::ffi::OsString;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use proofwire_config::{Config, ConfigError};
use proofwire_host::{
    BackendConfig, DispatchError, DocumentSnapshot, Operation, ReadinessError,
    StructuredLifecycleReporter, SupervisorError, VerificationRequest, VerificationResult,
    VerificationService, probe_version,
};
use thiserror::Error;
use url::Url;

use cli::{Cli, Command};
use telemetry::TelemetryError;

const BINARY_TARGET: &str = "proofwired";

/// Failures that end a run.
#[derive(Debug, Error)]
pub enum RunError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Logging could not be initialised.
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),
    /// The backend could not be started or probed.
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    /// The backend never became ready.
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
    /// A request was refused or abandoned.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    /// An input file could not be read.
    #[error("failed to read {path}: {source}")]
    ReadInput {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: Arc<io::Error>,
    },
    /// An input path cannot be expressed as a `file:` URI.
    #[error("cannot build a file URI for {path}")]
    InvalidPath {
        /// Offending path.
        path: PathBuf,
    },
    /// A result could not be serialised.
    #[error("failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),
    /// Writing to stdout failed.
    #[error("failed to write output: {0}")]
    Output(#[source] Arc<io::Error>),
}

/// Parses `args`, runs the requested command and maps the outcome to an exit
/// code. Usage errors exit with status 2.
pub fn run<I, W, E>(args: I, stdout: &mut W, stderr: &mut E) -> ExitCode
where
    I: IntoIterator<Item = OsString>,
    W: Write,
    E: Write,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(usage) => {
            // Nothing useful remains if the stream itself is gone.
            if usage.use_stderr() {
                drop(write!(stderr, "{}", usage.render()));
                return ExitCode::from(2);
            }
            drop(write!(stdout, "{}", usage.render()));
            return ExitCode::SUCCESS;
        }
    };

    match load_and_execute(&cli.command, stdout) {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(error) => {
            tracing::error!(target: BINARY_TARGET, %error, "proofwired failed");
            drop(writeln!(stderr, "proofwired: {error}"));
            ExitCode::FAILURE
        }
    }
}

fn load_and_execute<W: Write>(command: &Command, stdout: &mut W) -> Result<bool, RunError> {
    let config = Config::load_from_args([OsString::from("proofwired")])?;
    telemetry::initialise(&config)?;
    execute(command, &config, stdout)
}

/// Runs `command` against the backend described by `config`. Returns whether
/// every document verified.
fn execute<W: Write>(command: &Command, config: &Config, stdout: &mut W) -> Result<bool, RunError> {
    let backend = BackendConfig::from(config);
    match command {
        Command::Version => {
            let version = probe_version(&backend)?;
            writeln!(stdout, "{version}").map_err(output_error)?;
            Ok(true)
        }
        Command::Verify { files, operation } => verify_files(backend, files, *operation, stdout),
    }
}

fn verify_files<W: Write>(
    backend: BackendConfig,
    files: &[PathBuf],
    operation: Operation,
    stdout: &mut W,
) -> Result<bool, RunError> {
    let requests = files
        .iter()
        .map(|path| load_request(path, operation))
        .collect::<Result<Vec<_>, _>>()?;

    let service = VerificationService::new(backend, StructuredLifecycleReporter::new())?;
    service.start()?;
    service.await_ready()?;

    let mut all_verified = true;
    for (path, request) in files.iter().zip(&requests) {
        let result = service.submit(request)?.wait()?;
        tracing::debug!(
            target: BINARY_TARGET,
            path = %path.display(),
            status = ?result.status,
            "document answered"
        );
        all_verified &= result.is_verified();
        write_result(stdout, &result)?;
    }
    service.shutdown();

    Ok(all_verified)
}

fn load_request(path: &Path, operation: Operation) -> Result<VerificationRequest, RunError> {
    let read_error = |source: io::Error| RunError::ReadInput {
        path: path.to_path_buf(),
        source: Arc::new(source),
    };
    let absolute = fs::canonicalize(path).map_err(read_error)?;
    let text = fs::read_to_string(&absolute).map_err(read_error)?;
    let uri = Url::from_file_path(&absolute).map_err(|()| RunError::InvalidPath {
        path: path.to_path_buf(),
    })?;
    Ok(VerificationRequest::new(
        DocumentSnapshot::new(uri, 1, text),
        operation,
    ))
}

fn write_result<W: Write>(stdout: &mut W, result: &VerificationResult) -> Result<(), RunError> {
    let line = serde_json::to_string(result)?;
    writeln!(stdout, "{line}").map_err(output_error)
}

fn output_error(source: io::Error) -> RunError {
    RunError::Output(Arc::new(source))
}
