//! Entry point for the `proofwired` binary; see [`proofwired::run`].

use std::io;
use std::process::ExitCode;

fn main() -> ExitCode {
    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    proofwired::run(std::env::args_os(), &mut stdout, &mut stderr)
}
