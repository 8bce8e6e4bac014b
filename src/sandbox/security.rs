//! Path policy for sandbox mounts.
//!
//! bbox-do usually runs setuid root while the sandbox tree belongs to the
//! invoking user. Every path it mounts on or unmounts is therefore validated
//! before the syscall happens:
//!
//! - The sandbox root must be an existing directory and must not resolve to `/`.
//! - A destination must exist, must be a directory, must not be a symlink, and
//!   must resolve to a path inside the sandbox root. Otherwise a user could
//!   point `<root>/proc` at `/etc` and have a host directory mounted over.
//! - Sources are canonicalized so that the bind uses the resolved path.
//!
//! Destinations are resolved one component at a time with `O_PATH | O_NOFOLLOW`
//! starting from a descriptor of the root. The mount syscalls then address the
//! pinned descriptor through `/proc/self/fd/N`, so swapping a directory for a
//! symlink after the check has no effect on where the mount lands.

use std::ffi::{OsStr, OsString};
use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Component, Path, PathBuf};

use nix::fcntl::OFlag;
use tracing::{debug, instrument, warn};

use crate::error::MountError;

/// Opens `path` without following a final symlink and without read access.
fn open_path(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .custom_flags((OFlag::O_PATH | OFlag::O_NOFOLLOW).bits())
        .open(path)
}

/// The `/proc/self/fd` link of an open file.
pub(super) fn fd_link(file: &File) -> PathBuf {
    PathBuf::from(format!("/proc/self/fd/{}", file.as_raw_fd()))
}

/// Opens the directory `name` inside `dir`, refusing symlinks.
///
/// `path` is only used for error reporting.
fn open_dir_at(dir: &File, name: &OsStr, path: &Path) -> Result<File, MountError> {
    let file = open_path(&fd_link(dir).join(name)).map_err(|e| match e.kind() {
        ErrorKind::NotFound => MountError::MissingDestination {
            path: path.to_path_buf(),
        },
        _ => MountError::Stat {
            path: path.to_path_buf(),
            source: e,
        },
    })?;

    let metadata = file.metadata().map_err(|e| MountError::Stat {
        path: path.to_path_buf(),
        source: e,
    })?;

    if metadata.file_type().is_symlink() {
        warn!(component = ?name, "Mount destination path contains a symlink");
        return Err(MountError::SecurityViolation(format!(
            "mount destination cannot be a symlink: {}",
            path.display()
        )));
    }

    if !metadata.is_dir() {
        return Err(MountError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    Ok(file)
}

/// A directory entry inside the sandbox root, held by its parent directory.
///
/// The entry is addressed as `/proc/self/fd/<parent>/<name>`, which resolves
/// the pinned parent and then only the final name.
#[derive(Debug)]
pub struct DestinationEntry {
    path: PathBuf,
    parent: File,
    name: OsString,
}

impl DestinationEntry {
    /// Canonical path of the entry, for mount table lookups and messages.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The entry relative to its pinned parent.
    #[must_use]
    pub fn entry_link(&self) -> PathBuf {
        fd_link(&self.parent).join(&self.name)
    }

    /// Re-opens the entry, e.g. to reach a filesystem mounted on it.
    ///
    /// # Errors
    ///
    /// Fails like [`MountPolicyGuard::validate_destination`] if the entry was
    /// replaced by something other than a directory.
    pub fn reopen(&self) -> Result<File, MountError> {
        open_dir_at(&self.parent, &self.name, &self.path)
    }
}

/// A validated mount destination, pinned by an open descriptor.
#[derive(Debug)]
pub struct Destination {
    entry: DestinationEntry,
    dir: File,
}

impl Destination {
    /// Canonical path of the destination.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.entry.path
    }

    /// The `/proc/self/fd` link of the pinned directory.
    #[must_use]
    pub fn fd_link(&self) -> PathBuf {
        fd_link(&self.dir)
    }

    /// The parent-relative entry.
    #[must_use]
    pub fn entry(&self) -> &DestinationEntry {
        &self.entry
    }

    /// Closes the directory descriptor and keeps only the entry.
    ///
    /// An open descriptor on a mount point keeps it busy, so this has to
    /// happen before unmounting.
    #[must_use]
    pub fn into_entry(self) -> DestinationEntry {
        self.entry
    }
}

/// Policy guard for validating paths before mounting.
#[derive(Debug)]
pub struct MountPolicyGuard {
    /// Target directory as configured.
    requested: PathBuf,
    /// Canonicalized sandbox root.
    root: PathBuf,
    /// The root directory, opened without following symlinks.
    root_dir: File,
}

impl MountPolicyGuard {
    /// Validates `target_dir` as a sandbox root and returns a guard for it.
    ///
    /// # Errors
    ///
    /// Returns `MountError::InvalidTarget` if the path does not exist or is not
    /// a directory, and `MountError::SecurityViolation` if it resolves to `/`.
    #[instrument(skip_all, fields(target = %target_dir.display()))]
    pub fn for_target(target_dir: &Path) -> Result<Self, MountError> {
        let invalid = |reason: String| MountError::InvalidTarget {
            path: target_dir.to_path_buf(),
            reason,
        };

        let root = fs::canonicalize(target_dir).map_err(|e| invalid(e.to_string()))?;

        if !root.is_dir() {
            return Err(invalid("not a directory".to_string()));
        }

        if root.parent().is_none() {
            return Err(MountError::SecurityViolation(format!(
                "target directory {} resolves to the host root",
                target_dir.display()
            )));
        }

        // the canonical path has no symlinks, so a walk that meets one lost a race
        let mut root_dir = open_path(Path::new("/")).map_err(|e| invalid(e.to_string()))?;
        for component in root.components() {
            if let Component::Normal(name) = component {
                root_dir = open_dir_at(&root_dir, name, &root).map_err(|e| match e {
                    MountError::SecurityViolation(_) => e,
                    other => invalid(other.to_string()),
                })?;
            }
        }

        debug!(root = %root.display(), "Canonicalized sandbox root");
        Ok(Self {
            requested: target_dir.to_path_buf(),
            root,
            root_dir,
        })
    }

    /// Canonical sandbox root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validates a mount destination and pins it.
    ///
    /// `path` must lie under the target directory, either as configured or in
    /// its canonical form.
    ///
    /// # Errors
    ///
    /// - `MountError::MissingDestination` if it does not exist
    /// - `MountError::SecurityViolation` if it or a parent is a symlink, or it
    ///   is not strictly below the root
    /// - `MountError::NotADirectory` if it is not a directory
    #[instrument(skip(self), fields(path = %path.display()))]
    pub fn validate_destination(&self, path: &Path) -> Result<Destination, MountError> {
        let escapes = || {
            warn!("Mount destination escapes sandbox root");
            MountError::SecurityViolation(format!(
                "mount destination {} is not below the sandbox root {}",
                path.display(),
                self.root.display()
            ))
        };

        let relative = path
            .strip_prefix(&self.requested)
            .or_else(|_| path.strip_prefix(&self.root))
            .map_err(|_| escapes())?;

        let mut names = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => names.push(name),
                Component::CurDir => {}
                _ => return Err(escapes()),
            }
        }
        let Some((name, parents)) = names.split_last() else {
            return Err(escapes());
        };

        let mut parent = self.root_dir.try_clone().map_err(|e| MountError::Stat {
            path: self.root.clone(),
            source: e,
        })?;
        let mut canonical = self.root.clone();
        for component in parents {
            parent = open_dir_at(&parent, component, path)?;
            canonical.push(component);
        }

        let dir = open_dir_at(&parent, name, path)?;
        canonical.push(name);

        Ok(Destination {
            entry: DestinationEntry {
                path: canonical,
                parent,
                name: name.to_os_string(),
            },
            dir,
        })
    }

    /// Resolves a mount source on the host.
    ///
    /// # Errors
    ///
    /// Returns `MountError::SourceUnavailable` if the source cannot be resolved.
    pub fn validate_source(&self, path: &Path) -> Result<PathBuf, MountError> {
        let canonical = fs::canonicalize(path).map_err(|e| MountError::SourceUnavailable {
            path: path.to_path_buf(),
            source: e,
        })?;

        if canonical.starts_with(&self.root) {
            return Err(MountError::SecurityViolation(format!(
                "mount source {} lies inside the sandbox root",
                canonical.display()
            )));
        }

        Ok(canonical)
    }
}
