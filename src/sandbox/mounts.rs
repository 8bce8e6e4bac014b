//! Bind mount orchestration for sandbox roots.
//!
//! Turns a [`SandboxConfig`] into a list of bind mounts and applies or reverses
//! them against a [`MountTable`]:
//!
//! - Mounts are applied in the order DEV, PROC, SYS, HOME and removed in the
//!   reverse order.
//! - Destinations that are already mounted are skipped, and unmounting a path
//!   that is not mounted is a no-op, so both directions can be re-run freely.
//! - Applying stops at the first failure and reports how many mounts were
//!   created before it. Nothing is rolled back.
//! - Removing keeps going past failures and reports all of them at the end.
//!
//! # Security Considerations
//!
//! - Destination directories are never created; they must already exist
//! - Every destination is checked by [`MountPolicyGuard`] and the syscalls
//!   address the pinned descriptor, never the path string
//! - Binds are not recursive, so host submounts (e.g. `/dev/pts`) are not
//!   dragged in and each entry can be unmounted with a single `umount2`
//! - All binds are remounted `MS_NOSUID`; all but `/dev` also `MS_NODEV`.
//!   Restrictions the source mount already has are kept.

use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::statvfs::{FsFlags, statvfs};
use tracing::{debug, instrument, trace, warn};

use super::config::{SandboxConfig, Subsystem};
use super::mountinfo::{self, MOUNTINFO_PATH};
use super::security::{Destination, DestinationEntry, MountPolicyGuard, fd_link};
use crate::error::{MountError, PartialMountError, UnmountError, UnmountFailure};

/// Query and mutate access to a mount table.
///
/// [`HostMountTable`] talks to the kernel; tests substitute an in-memory table.
pub trait MountTable {
    /// Returns whether `path` is a mount point.
    ///
    /// # Errors
    ///
    /// Fails if `path` cannot be stat'd.
    fn is_mounted(&self, path: &Path) -> Result<bool, MountError>;

    /// Bind-mounts `source` on `target`, restricted by `flags`.
    ///
    /// # Errors
    ///
    /// Returns `MountError::BindMount` if the mount fails and
    /// `MountError::Remount` if the restrictions cannot be applied.
    fn bind(
        &mut self,
        source: &Path,
        target: &Destination,
        flags: MsFlags,
    ) -> Result<(), MountError>;

    /// Unmounts `target`.
    ///
    /// # Errors
    ///
    /// Returns `MountError::Unmount` if the unmount fails.
    fn unmount(&mut self, target: &DestinationEntry) -> Result<(), MountError>;
}

/// The kernel mount table of the current mount namespace.
#[derive(Debug, Clone)]
pub struct HostMountTable {
    mountinfo: PathBuf,
    lazy_unmount: bool,
}

impl HostMountTable {
    /// Creates a handle reading `/proc/self/mountinfo`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            mountinfo: PathBuf::from(MOUNTINFO_PATH),
            lazy_unmount: false,
        }
    }

    /// Detach busy mounts (`MNT_DETACH`) instead of failing with EBUSY.
    #[must_use]
    pub fn with_lazy_unmount(mut self, lazy: bool) -> Self {
        self.lazy_unmount = lazy;
        self
    }

    /// Mount points strictly below `root`.
    ///
    /// # Errors
    ///
    /// Returns `MountError::MountInfo` if the mount table cannot be read.
    pub fn mounts_below(&self, root: &Path) -> Result<Vec<PathBuf>, MountError> {
        mountinfo::mounts_below(&self.mountinfo, root)
    }
}

impl Default for HostMountTable {
    fn default() -> Self {
        Self::new()
    }
}

impl MountTable for HostMountTable {
    fn is_mounted(&self, path: &Path) -> Result<bool, MountError> {
        mountinfo::is_mounted_in(&self.mountinfo, path)
    }

    #[instrument(skip_all, fields(source = %source.display(), target = %target.path().display()))]
    fn bind(
        &mut self,
        source: &Path,
        target: &Destination,
        flags: MsFlags,
    ) -> Result<(), MountError> {
        let remount_error = |e| MountError::Remount {
            target: target.path().to_path_buf(),
            source: e,
        };
        let inherited = statvfs(source).map_err(remount_error)?.flags();

        trace!("Creating bind mount");
        mount(
            Some(source),
            &target.fd_link(),
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )
        .map_err(|e| MountError::BindMount {
            source_path: source.to_path_buf(),
            target: target.path().to_path_buf(),
            source: e,
        })?;

        // the pinned descriptor is below the new mount; the entry now leads onto it
        let mounted = target.entry().reopen()?;
        let result = mount(
            None::<&str>,
            &fd_link(&mounted),
            None::<&str>,
            remount_flags(flags, inherited),
            None::<&str>,
        );
        drop(mounted);

        if let Err(e) = result {
            warn!(error = %e, "Restricting bind mount failed, detaching it");
            if let Err(detach) = umount2(
                &target.entry().entry_link(),
                MntFlags::MNT_DETACH | MntFlags::UMOUNT_NOFOLLOW,
            ) {
                warn!(error = %detach, "Detaching unrestricted bind mount failed");
            }
            return Err(remount_error(e));
        }

        trace!("Bind mount created");
        Ok(())
    }

    #[instrument(skip_all, fields(target = %target.path().display(), lazy = self.lazy_unmount))]
    fn unmount(&mut self, target: &DestinationEntry) -> Result<(), MountError> {
        let mut flags = MntFlags::UMOUNT_NOFOLLOW;
        if self.lazy_unmount {
            flags |= MntFlags::MNT_DETACH;
        }

        umount2(&target.entry_link(), flags).map_err(|e| MountError::Unmount {
            target: target.path().to_path_buf(),
            source: e,
        })?;

        trace!("Filesystem unmounted");
        Ok(())
    }
}

/// Flags for the `MS_REMOUNT` that follows a bind.
///
/// `requested` is added to what the source mount already enforces, so a bind
/// of a `noexec` or read-only mount stays that way.
fn remount_flags(requested: MsFlags, source: FsFlags) -> MsFlags {
    let mut flags = MsFlags::MS_BIND | MsFlags::MS_REMOUNT | requested;

    for (from, to) in [
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
    ] {
        if source.contains(from) {
            flags |= to;
        }
    }

    flags
}

/// One bind mount derived from a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub subsystem: Subsystem,
    /// Host path.
    pub source: PathBuf,
    /// Path inside the sandbox root.
    pub destination: PathBuf,
}

impl MountSpec {
    /// Restrictions applied to the bind; device nodes only work under `/dev`.
    #[must_use]
    pub fn flags(&self) -> MsFlags {
        match self.subsystem {
            Subsystem::Dev => MsFlags::MS_NOSUID,
            Subsystem::Proc | Subsystem::Sys | Subsystem::Home => {
                MsFlags::MS_NOSUID | MsFlags::MS_NODEV
            }
        }
    }
}

/// Joins an absolute path under `base`, e.g. `/srv/box` + `/home/a` -> `/srv/box/home/a`.
fn rebase(base: &Path, path: &Path) -> PathBuf {
    base.join(path.strip_prefix("/").unwrap_or(path))
}

/// Computes the bind mounts selected by `config`, in mount order.
///
/// `sys_root` is the host directory the sources are taken from, normally `/`.
///
/// # Errors
///
/// Returns `MountError::NoTargetDir` if mounts are selected but no target is
/// configured.
pub fn mount_plan(config: &SandboxConfig, sys_root: &Path) -> Result<Vec<MountSpec>, MountError> {
    if !config.mount_any() {
        return Ok(Vec::new());
    }

    let target = config.target_dir().ok_or(MountError::NoTargetDir)?;

    config
        .mounts()
        .iter()
        .map(|subsystem| -> Result<MountSpec, MountError> {
            let relative = match subsystem {
                Subsystem::Dev => Path::new("/dev"),
                Subsystem::Proc => Path::new("/proc"),
                Subsystem::Sys => Path::new("/sys"),
                // config building guarantees a home dir when HOME is selected
                Subsystem::Home => config.home_dir().ok_or_else(|| {
                    MountError::SecurityViolation("home mount without home directory".to_string())
                })?,
            };

            Ok(MountSpec {
                subsystem,
                source: rebase(sys_root, relative),
                destination: rebase(target, relative),
            })
        })
        .collect()
}

/// Applies the bind mounts selected by `config`.
///
/// Returns the number of mounts created by this call; entries that were
/// already mounted are skipped and not counted.
///
/// # Errors
///
/// Returns `PartialMountError` carrying the failing step and the number of
/// mounts created before it. Those mounts are left in place.
#[instrument(skip_all, fields(target = ?config.target_dir(), mounts = %config.mounts()))]
pub fn apply_mounts<T: MountTable>(
    table: &mut T,
    config: &SandboxConfig,
    sys_root: &Path,
) -> Result<usize, PartialMountError> {
    if !config.mount_any() {
        debug!("Nothing selected, skipping mounts");
        return Ok(0);
    }

    let mut mounted = 0;
    let fail = |mounted, source| PartialMountError { mounted, source };

    let plan = mount_plan(config, sys_root).map_err(|e| fail(0, e))?;
    let target = config.target_dir().ok_or_else(|| fail(0, MountError::NoTargetDir))?;
    let guard = MountPolicyGuard::for_target(target).map_err(|e| fail(0, e))?;

    for spec in plan {
        match apply_one(table, &guard, &spec) {
            Ok(true) => mounted += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(subsystem = %spec.subsystem, error = %e, mounted, "Mount step failed");
                return Err(fail(mounted, e));
            }
        }
    }

    debug!(mounted, "Sandbox mounts applied");
    Ok(mounted)
}

/// Returns whether a new mount was created.
fn apply_one<T: MountTable>(
    table: &mut T,
    guard: &MountPolicyGuard,
    spec: &MountSpec,
) -> Result<bool, MountError> {
    let destination = guard.validate_destination(&spec.destination)?;

    if table.is_mounted(destination.path())? {
        debug!(subsystem = %spec.subsystem, "Already mounted, skipping");
        return Ok(false);
    }

    let source = guard.validate_source(&spec.source)?;
    table.bind(&source, &destination, spec.flags())?;
    debug!(subsystem = %spec.subsystem, destination = %destination.path().display(), "Mounted");
    Ok(true)
}

/// Removes the bind mounts selected by `config`, in reverse mount order.
///
/// Entries that are not mounted (or whose destination does not exist) are
/// skipped. A failing entry does not stop the remaining ones.
///
/// # Errors
///
/// Returns `UnmountError` listing every entry that could not be removed,
/// together with the number that were.
#[instrument(skip_all, fields(target = ?config.target_dir(), mounts = %config.mounts()))]
pub fn remove_mounts<T: MountTable>(
    table: &mut T,
    config: &SandboxConfig,
) -> Result<usize, UnmountError> {
    let single_failure = |target: &Path, error| UnmountError {
        unmounted: 0,
        failures: vec![UnmountFailure {
            target: target.to_path_buf(),
            error,
        }],
    };

    if !config.mount_any() {
        return Ok(0);
    }

    let target = config
        .target_dir()
        .ok_or_else(|| single_failure(Path::new(""), MountError::NoTargetDir))?;
    let plan = mount_plan(config, Path::new("/")).map_err(|e| single_failure(target, e))?;
    let guard = MountPolicyGuard::for_target(target).map_err(|e| single_failure(target, e))?;

    let mut unmounted = 0;
    let mut failures = Vec::new();

    for spec in plan.iter().rev() {
        match remove_one(table, &guard, spec) {
            Ok(true) => unmounted += 1,
            Ok(false) => {}
            Err(error) => {
                warn!(subsystem = %spec.subsystem, error = %error, "Unmount step failed");
                failures.push(UnmountFailure {
                    target: spec.destination.clone(),
                    error,
                });
            }
        }
    }

    if failures.is_empty() {
        debug!(unmounted, "Sandbox mounts removed");
        Ok(unmounted)
    } else {
        Err(UnmountError {
            unmounted,
            failures,
        })
    }
}

/// Returns whether a mount was removed.
fn remove_one<T: MountTable>(
    table: &mut T,
    guard: &MountPolicyGuard,
    spec: &MountSpec,
) -> Result<bool, MountError> {
    let destination = match guard.validate_destination(&spec.destination) {
        Ok(destination) => destination.into_entry(),
        Err(MountError::MissingDestination { .. }) => {
            trace!(subsystem = %spec.subsystem, "Destination missing, nothing to unmount");
            return Ok(false);
        }
        Err(e) => return Err(e),
    };

    if !table.is_mounted(destination.path())? {
        trace!(subsystem = %spec.subsystem, "Not mounted, skipping");
        return Ok(false);
    }

    table.unmount(&destination)?;
    debug!(subsystem = %spec.subsystem, destination = %destination.path().display(), "Unmounted");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rebase() {
        assert_eq!(
            rebase(Path::new("/srv/box"), Path::new("/home/alice")),
            PathBuf::from("/srv/box/home/alice")
        );
        assert_eq!(
            rebase(Path::new("/"), Path::new("/dev")),
            PathBuf::from("/dev")
        );
    }

    #[test]
    fn test_plan_follows_mount_order() {
        let config = SandboxConfig::builder()
            .target_dir("/srv/box")
            .and_then(|b| b.home_dir("/home/alice"))
            .map(|b| b.mount_all())
            .and_then(|b| b.build())
            .expect("valid config");

        let plan = mount_plan(&config, Path::new("/")).expect("plan");
        let destinations: Vec<_> = plan.iter().map(|s| s.destination.clone()).collect();
        assert_eq!(
            destinations,
            vec![
                PathBuf::from("/srv/box/dev"),
                PathBuf::from("/srv/box/proc"),
                PathBuf::from("/srv/box/sys"),
                PathBuf::from("/srv/box/home/alice"),
            ]
        );
        assert_eq!(plan[3].source, PathBuf::from("/home/alice"));
    }

    #[test]
    fn test_plan_uses_sys_root_for_sources() {
        let config = SandboxConfig::builder()
            .target_dir("/srv/box")
            .map(|b| b.set_mount(Subsystem::Proc))
            .and_then(|b| b.build())
            .expect("valid config");

        let plan = mount_plan(&config, Path::new("/mnt/host")).expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].source, PathBuf::from("/mnt/host/proc"));
        assert_eq!(plan[0].destination, PathBuf::from("/srv/box/proc"));
    }

    #[test]
    fn test_plan_requires_target() {
        let config = SandboxConfig::builder()
            .set_mount(Subsystem::Dev)
            .build()
            .expect("valid config");
        assert!(matches!(
            mount_plan(&config, Path::new("/")),
            Err(MountError::NoTargetDir)
        ));
    }

    #[test]
    fn test_empty_plan_without_target_is_fine() {
        let config = SandboxConfig::new();
        assert!(mount_plan(&config, Path::new("/")).expect("plan").is_empty());
    }

    #[test]
    fn test_binds_are_nosuid_and_nodev_outside_dev() {
        let config = SandboxConfig::builder()
            .target_dir("/srv/box")
            .and_then(|b| b.home_dir("/home/alice"))
            .map(|b| b.mount_all())
            .and_then(|b| b.build())
            .expect("valid config");

        for spec in mount_plan(&config, Path::new("/")).expect("plan") {
            assert!(spec.flags().contains(MsFlags::MS_NOSUID));
            assert_eq!(
                spec.flags().contains(MsFlags::MS_NODEV),
                spec.subsystem != Subsystem::Dev,
                "{}",
                spec.subsystem
            );
        }
    }

    #[test]
    fn test_remount_flags_keep_source_restrictions() {
        let flags = remount_flags(MsFlags::MS_NOSUID, FsFlags::ST_NOEXEC | FsFlags::ST_RDONLY);
        assert!(flags.contains(MsFlags::MS_BIND | MsFlags::MS_REMOUNT));
        assert!(flags.contains(MsFlags::MS_NOSUID));
        assert!(flags.contains(MsFlags::MS_NOEXEC));
        assert!(flags.contains(MsFlags::MS_RDONLY));
        assert!(!flags.contains(MsFlags::MS_NODEV));

        let flags = remount_flags(MsFlags::MS_NOSUID | MsFlags::MS_NODEV, FsFlags::empty());
        assert!(flags.contains(MsFlags::MS_NODEV));
        assert!(!flags.contains(MsFlags::MS_NOEXEC));
    }

    #[test]
    fn test_host_table_builder() {
        let table = HostMountTable::new().with_lazy_unmount(true);
        assert!(table.lazy_unmount);
        assert_eq!(table.mountinfo, PathBuf::from(MOUNTINFO_PATH));
    }

    // Real bind mounts need root and are covered by tests/mounts.rs.
}
