//! Error types for bbox-do.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//! Library operations return these structured errors; only the binary turns
//! them into messages and process exit codes.

use std::path::PathBuf;

use miette::Diagnostic;
use nix::errno::Errno;
use thiserror::Error;

/// Exit code for malformed invocations (bad arguments, unknown user, missing target).
pub const EXIT_INVOCATION: u8 = 1;

/// Exit code for failures while acting on the system (mount, fork, exec, ...).
pub const EXIT_RUNTIME: u8 = 2;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Invalid sandbox configuration
    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    /// A single mount-related failure
    #[error(transparent)]
    #[diagnostic(transparent)]
    Mount(#[from] MountError),

    /// Applying mounts stopped part-way
    #[error(transparent)]
    #[diagnostic(transparent)]
    PartialMount(#[from] PartialMountError),

    /// Tearing down mounts left entries behind
    #[error(transparent)]
    #[diagnostic(transparent)]
    Unmount(#[from] UnmountError),

    /// Running a command inside the sandbox failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Run(#[from] RunError),

    /// System requirements not met
    #[error("System requirements check failed")]
    #[diagnostic(code(bbox::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Arguments that parse but do not make sense together
    #[error("Invalid invocation: {0}")]
    #[diagnostic(code(bbox::invocation))]
    Invocation(String),
}

impl Error {
    /// Maps the error onto the process exit code contract.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        let invocation = match self {
            Self::Config(_) | Self::Invocation(_) => true,
            Self::Mount(e) => e.is_invocation(),
            Self::Run(e) => e.is_invocation(),
            Self::PartialMount(_) | Self::Unmount(_) | Self::SystemRequirements(_) => false,
        };

        if invocation {
            EXIT_INVOCATION
        } else {
            EXIT_RUNTIME
        }
    }
}

/// Errors raised while building a sandbox configuration.
#[derive(Error, Debug, Diagnostic, PartialEq, Eq)]
pub enum ConfigError {
    /// A path setter received an empty path
    #[error("{field} must not be empty")]
    #[diagnostic(code(bbox::config::empty_path))]
    EmptyPath { field: &'static str },

    /// Home directory cannot be rebased under the sandbox root
    #[error("Invalid home directory {path}: {reason}")]
    #[diagnostic(
        code(bbox::config::home_dir),
        help("The home directory must be an absolute path other than / without '..' components")
    )]
    InvalidHomeDir { path: PathBuf, reason: &'static str },

    /// HOME mount requested without a home directory
    #[error("Home mount requested but no home directory is configured")]
    #[diagnostic(code(bbox::config::home_missing))]
    HomeDirRequired,

    /// Raw bitmask carries bits outside DEV|PROC|SYS|HOME
    #[error("Unknown mount flag bits: {0:#x}")]
    #[diagnostic(code(bbox::config::mount_bits))]
    UnknownMountBits(u8),
}

/// Errors related to inspecting and changing the mount table.
#[derive(Error, Debug, Diagnostic)]
pub enum MountError {
    /// No sandbox root was configured
    #[error("No target directory configured")]
    #[diagnostic(code(bbox::mount::no_target))]
    NoTargetDir,

    /// The sandbox root cannot be used
    #[error("Invalid target directory {path}: {reason}")]
    #[diagnostic(
        code(bbox::mount::target),
        help("The target must be an existing directory created by sandbox provisioning")
    )]
    InvalidTarget { path: PathBuf, reason: String },

    /// Mount destination does not exist inside the sandbox root
    #[error("Mount destination {path} does not exist")]
    #[diagnostic(
        code(bbox::mount::missing_destination),
        help("Create the directory inside the sandbox root first; it is never created automatically")
    )]
    MissingDestination { path: PathBuf },

    /// Mount destination exists but is not a directory
    #[error("Mount destination {path} is not a directory")]
    #[diagnostic(code(bbox::mount::not_a_directory))]
    NotADirectory { path: PathBuf },

    /// Mount source cannot be resolved on the host
    #[error("Mount source {path} is unavailable")]
    #[diagnostic(code(bbox::mount::source))]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A path could not be stat'd while checking its mount state
    #[error("Cannot stat {path}")]
    #[diagnostic(code(bbox::mount::stat))]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The mount table could not be read
    #[error("Cannot read mount table {path}")]
    #[diagnostic(code(bbox::mount::mountinfo))]
    MountInfo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Bind mount syscall failed
    #[error("Bind mount of {source_path} on {target} failed")]
    #[diagnostic(code(bbox::mount::bind))]
    BindMount {
        source_path: PathBuf,
        target: PathBuf,
        #[source]
        source: Errno,
    },

    /// Applying nosuid/nodev to a fresh bind mount failed
    #[error("Restricting the bind mount on {target} failed")]
    #[diagnostic(code(bbox::mount::remount))]
    Remount {
        target: PathBuf,
        #[source]
        source: Errno,
    },

    /// Unmount syscall failed
    #[error("Unmounting {target} failed")]
    #[diagnostic(
        code(bbox::mount::unmount),
        help("EBUSY means a process still uses the mount; retry later or use --lazy")
    )]
    Unmount {
        target: PathBuf,
        #[source]
        source: Errno,
    },

    /// Path policy violation (symlink escape, mounting over /, ...)
    #[error("Security violation: {0}")]
    #[diagnostic(code(bbox::mount::security))]
    SecurityViolation(String),
}

impl MountError {
    /// Whether the error stems from how the tool was invoked rather than from the system.
    #[must_use]
    pub fn is_invocation(&self) -> bool {
        matches!(self, Self::NoTargetDir | Self::InvalidTarget { .. })
    }
}

/// Mount application stopped at a failing step.
///
/// Mounts applied before the failure stay in place; `mounted` tells how many.
#[derive(Error, Debug, Diagnostic)]
#[error("Mounting stopped after {mounted} new mount(s)")]
#[diagnostic(
    code(bbox::mount::partial),
    help("Already applied mounts were left in place; fix the cause and re-run, or run umount")
)]
pub struct PartialMountError {
    /// Number of mounts created by this call before the failure.
    pub mounted: usize,
    /// The failing step.
    #[source]
    #[diagnostic_source]
    pub source: MountError,
}

/// A single entry that could not be unmounted.
#[derive(Debug)]
pub struct UnmountFailure {
    /// Destination inside the sandbox root.
    pub target: PathBuf,
    /// Why it failed.
    pub error: MountError,
}

/// Teardown finished but some entries are still mounted.
#[derive(Error, Debug, Diagnostic)]
#[error("{} mount(s) could not be removed ({unmounted} removed): {}", .failures.len(), summarize(.failures))]
#[diagnostic(code(bbox::mount::teardown))]
pub struct UnmountError {
    /// Number of entries successfully unmounted.
    pub unmounted: usize,
    /// Every failure, in the order attempted.
    pub failures: Vec<UnmountFailure>,
}

fn summarize(failures: &[UnmountFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.target.display(), source_chain(&f.error)))
        .collect::<Vec<_>>()
        .join("; ")
}

fn source_chain(error: &dyn std::error::Error) -> String {
    let mut out = error.to_string();
    let mut cause = error.source();
    while let Some(c) = cause {
        out.push_str(": ");
        out.push_str(&c.to_string());
        cause = c.source();
    }
    out
}

/// Errors related to running commands as another user.
#[derive(Error, Debug, Diagnostic)]
pub enum RunError {
    /// No passwd entry for the requested user
    #[error("Unknown user: {0}")]
    #[diagnostic(code(bbox::run::unknown_user))]
    UnknownUser(String),

    /// The passwd database could not be queried
    #[error("User lookup for {user} failed")]
    #[diagnostic(code(bbox::run::user_lookup))]
    UserLookup {
        user: String,
        #[source]
        source: Errno,
    },

    /// Command was empty
    #[error("Invalid command: {0}")]
    #[diagnostic(code(bbox::run::invalid_command))]
    InvalidCommand(String),

    /// Command could not be found under the sandbox root
    #[error("Command not found: {0}")]
    #[diagnostic(code(bbox::run::not_found))]
    CommandNotFound(String),

    /// User name cannot be passed to the group database
    #[error("Invalid user name {0:?}")]
    #[diagnostic(code(bbox::run::user_name))]
    InvalidUserName(String),

    /// The caller may not switch to the requested identity
    #[error("Not permitted to run as {user}")]
    #[diagnostic(
        code(bbox::run::forbidden_identity),
        help("Only root may run commands as a different user")
    )]
    ForbiddenIdentity { user: String },

    /// Fork, privilege drop or exec failed; the child never ran the command
    #[error("Failed to start {program} as {user}")]
    #[diagnostic(code(bbox::run::spawn))]
    Spawn {
        program: String,
        user: String,
        #[source]
        source: std::io::Error,
    },

    /// Waiting for the child failed
    #[error("Failed to wait for {program}")]
    #[diagnostic(code(bbox::run::wait))]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A helper command run on the tool's behalf exited unsuccessfully
    #[error("{program} exited with status {code}")]
    #[diagnostic(code(bbox::run::failed))]
    Failed { program: String, code: i32 },

    /// Reading captured output failed (the child was still reaped)
    #[error("Failed to read output of {program}")]
    #[diagnostic(code(bbox::run::read_output))]
    ReadOutput {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    /// Whether the error stems from how the tool was invoked rather than from the system.
    #[must_use]
    pub fn is_invocation(&self) -> bool {
        matches!(
            self,
            Self::UnknownUser(_)
                | Self::InvalidCommand(_)
                | Self::CommandNotFound(_)
                | Self::InvalidUserName(_)
                | Self::ForbiddenIdentity { .. }
        )
    }
}

/// Errors related to system requirements validation.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Not running with an effective uid of 0
    #[error("Effective uid {euid} lacks the privileges to mount, chroot and switch users")]
    #[diagnostic(
        code(bbox::system::privileges),
        help("Install bbox-do setuid root or run it via sudo")
    )]
    InsufficientPrivileges { euid: u32 },
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
