//! bbox-do - bind-mount sandboxes and privileged command execution.
//!
//! Prepares a chroot-style sandbox on a host directory by bind-mounting
//! selected host subsystems into it, runs commands or login shells inside it
//! as an unprivileged user, and tears the mounts down again.
//!
//! # Platform Requirements
//!
//! - Linux
//! - Effective uid 0 (the binary is normally installed setuid root)
//!
//! # Example
//!
//! ```no_run
//! use bbox::{cli, system};
//! use clap::Parser;
//!
//! fn main() -> miette::Result<()> {
//!     system::check_all()?;
//!
//!     let args = cli::Args::parse();
//!     let code = cli::execute(args.command)?;
//!     std::process::exit(i32::from(code));
//! }
//! ```

pub mod cli;
pub mod error;
pub mod sandbox;
pub mod system;

// Re-export commonly used types
pub use error::{Error, Result};
pub use sandbox::{
    CapturedOutput, HostMountTable, Identity, MountSet, RunRequest, SandboxConfig, Subsystem,
};
