//! Command-line argument definitions.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use proofwire_host::Operation;

/// Drives a verification backend from the command line.
#[derive(Parser, Debug)]
#[command(name = "proofwired", disable_help_subcommand = true)]
pub(crate) struct Cli {
    /// Action to perform.
    #[command(subcommand)]
    pub(crate) command: Command,
}

/// Supported actions.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    /// Prints the version reported by the backend.
    Version,
    /// Verifies each file and prints one JSON result per line.
    Verify {
        /// Documents to send to the backend.
        #[arg(value_name = "FILE", required = true)]
        files: Vec<PathBuf>,
        /// Backend operation to request for every file.
        #[arg(long, default_value_t = Operation::Verify)]
        operation: Operation,
    },
}
