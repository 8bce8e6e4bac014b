//! Command line interface.
//!
//! Every subcommand names a sandbox as `<TARGETS>/<TARGET>`, where `TARGETS`
//! defaults to `~/.bolt/targets` of the invoking user and `TARGET` may be `.`
//! to use the directory itself.

mod commands;

use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::{Parser, Subcommand};

use crate::sandbox::{MountSet, Subsystem};

pub use commands::{Account, execute, parse_passwd, resolve_target};

/// bbox-do - run commands inside bind-mounted sandboxes.
#[derive(Parser, Debug)]
#[command(name = "bbox-do", author, version, about, long_about = None)]
pub struct Args {
    /// Skip system requirements checks
    #[arg(long, global = true, default_value = "false")]
    pub skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, global = true, default_value = "false")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// List the users that can log into a target
    List {
        #[command(flatten)]
        target: TargetArgs,
    },

    /// Start a login shell inside a target
    Login {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        mounts: MountArgs,

        /// User to log in as (name or uid); only root may pick another user
        #[arg(short, long, value_name = "USER")]
        user: Option<String>,
    },

    /// Run a command inside a target
    Run {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        mounts: MountArgs,

        /// User to run as (name or uid); only root may pick another user
        #[arg(short, long, value_name = "USER")]
        user: Option<String>,

        /// Working directory inside the target
        #[arg(short = 'C', long, value_name = "DIR")]
        workdir: Option<PathBuf>,

        /// Command and its arguments
        #[arg(
            required = true,
            trailing_var_arg = true,
            allow_hyphen_values = true,
            value_name = "COMMAND"
        )]
        command: Vec<OsString>,
    },

    /// Bind-mount host directories into a target
    Mount {
        #[command(flatten)]
        target: TargetArgs,

        #[command(flatten)]
        mounts: MountArgs,
    },

    /// Remove all bind mounts from a target
    Umount {
        #[command(flatten)]
        target: TargetArgs,

        /// Detach busy mounts instead of failing
        #[arg(long, default_value = "false")]
        lazy: bool,
    },
}

/// Where to find the sandbox.
#[derive(clap::Args, Debug, Clone, PartialEq, Eq)]
pub struct TargetArgs {
    /// Directory holding the targets [default: ~/.bolt/targets]
    #[arg(short, long, env = "BBOX_TARGETS", value_name = "DIR")]
    pub targets: Option<PathBuf>,

    /// Target name, or `.` for the targets directory itself
    #[arg(value_name = "TARGET")]
    pub name: String,
}

/// Which host directories to bind-mount.
#[derive(clap::Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct MountArgs {
    /// Comma separated list of all, none, dev, proc, sys, home, no-dev,
    /// no-proc, no-sys, no-home; applied left to right [default: all]
    #[arg(short, long = "mount", value_name = "LIST", value_delimiter = ',')]
    pub mount: Vec<MountOp>,
}

impl MountArgs {
    /// The selected mounts; everything when no `-m` was given.
    #[must_use]
    pub fn mount_set(&self) -> MountSet {
        if self.mount.is_empty() {
            return MountSet::ALL;
        }

        self.mount.iter().fold(MountSet::EMPTY, |mut set, op| {
            match *op {
                MountOp::All => set = MountSet::ALL,
                MountOp::None => set.clear(),
                MountOp::Set(subsystem) => set.insert(subsystem),
                MountOp::Unset(subsystem) => set.remove(subsystem),
            }
            set
        })
    }
}

/// One entry of a `-m` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountOp {
    All,
    None,
    Set(Subsystem),
    Unset(Subsystem),
}

impl FromStr for MountOp {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let subsystem = |name: &str| match name {
            "dev" => Some(Subsystem::Dev),
            "proc" => Some(Subsystem::Proc),
            "sys" => Some(Subsystem::Sys),
            "home" => Some(Subsystem::Home),
            _ => None,
        };

        let op = match s.trim() {
            "all" => Some(Self::All),
            "none" => Some(Self::None),
            other => match other.strip_prefix("no-") {
                Some(name) => subsystem(name).map(Self::Unset),
                None => subsystem(other).map(Self::Set),
            },
        };

        op.ok_or_else(|| format!("unknown mount selector '{s}'"))
    }
}

impl fmt::Display for MountOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::None => f.write_str("none"),
            Self::Set(subsystem) => write!(f, "{subsystem}"),
            Self::Unset(subsystem) => write!(f, "no-{subsystem}"),
        }
    }
}
