//! Chroot-style sandboxes built from bind mounts.
//!
//! A sandbox is a directory tree on the host (the *target*) into which the
//! host's `/dev`, `/proc`, `/sys` and the user's home directory can be
//! bind-mounted. Commands then run chrooted into the target as an
//! unprivileged user.
//!
//! # Example
//!
//! ```no_run
//! use std::path::Path;
//!
//! use bbox::sandbox::{
//!     HostMountTable, Identity, RunRequest, SandboxConfig, Subsystem, apply_mounts,
//! };
//!
//! let config = SandboxConfig::builder()
//!     .target_dir("/srv/box")?
//!     .set_mount(Subsystem::Dev)
//!     .set_mount(Subsystem::Proc)
//!     .build()?;
//!
//! let mounted = apply_mounts(&mut HostMountTable::new(), &config, Path::new("/"))?;
//! println!("{mounted} new mounts");
//!
//! let alice = Identity::from_name("alice")?;
//! let status = RunRequest::command(alice, "make").root("/srv/box").run()?;
//! assert!(status.success());
//! # Ok::<(), bbox::Error>(())
//! ```

mod config;
pub mod mountinfo;
mod mounts;
mod runner;
mod security;

pub use config::{MountSet, SandboxConfig, SandboxConfigBuilder, Subsystem};
pub use mountinfo::is_mounted;
pub use mounts::{
    HostMountTable, MountSpec, MountTable, apply_mounts, mount_plan, remove_mounts,
};
pub use runner::{
    CapturedOutput, Identity, RunOutcome, RunRequest, SEARCH_PATH, exit_code, run_as,
};
pub use security::{Destination, DestinationEntry, MountPolicyGuard};
