//! bbox-do - Entry Point
//!
//! Exit codes: 0 on success, 1 for invocation errors, 2 for runtime errors.
//! `run` and `login` exit with the status of the command they ran.

use std::process::ExitCode;

use clap::Parser;
use tracing::{Level, debug, error, warn};
use tracing_subscriber::{EnvFilter, fmt};

use bbox::cli::{self, Args};
use bbox::error::{EXIT_INVOCATION, Error};
use bbox::system;

fn main() -> ExitCode {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version are reported as errors by clap
            let code = if e.use_stderr() { EXIT_INVOCATION } else { 0 };
            if let Err(err) = e.print() {
                eprintln!("bbox-do: cannot print usage: {err}");
            }
            return ExitCode::from(code);
        }
    };

    // Logs go to stderr so `list` output stays clean on stdout
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    debug!("bbox-do v{}", env!("CARGO_PKG_VERSION"));

    if args.skip_checks {
        warn!("Skipping system requirements checks (--skip-checks)");
    } else {
        match system::check_all() {
            Ok(reqs) => {
                debug!(
                    euid = reqs.effective_uid,
                    ruid = reqs.real_uid,
                    setuid = reqs.is_setuid(),
                    "System requirements satisfied"
                );
                if !reqs.mountinfo_readable {
                    warn!("Mount table unreadable, falling back to device id comparison");
                }
            }
            Err(e) => {
                error!("System requirements check failed");
                return report(e);
            }
        }
    }

    match cli::execute(args.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => report(e),
    }
}

fn report(err: Error) -> ExitCode {
    let code = err.exit_code();
    eprintln!("{:?}", miette::Report::new(err));
    ExitCode::from(code)
}
