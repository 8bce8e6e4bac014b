//! Configuration for sandbox roots.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::ConfigError;

/// A host subsystem that can be bind-mounted into the sandbox root.
///
/// The declaration order is the order mounts are applied in; teardown walks it
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    /// `/dev`
    Dev,
    /// `/proc`
    Proc,
    /// `/sys`
    Sys,
    /// The user's home directory.
    Home,
}

impl Subsystem {
    /// All subsystems in mount order.
    pub const ALL: [Subsystem; 4] = [Self::Dev, Self::Proc, Self::Sys, Self::Home];

    /// Bit of this subsystem in the raw mount mask.
    #[must_use]
    pub const fn bit(self) -> u8 {
        match self {
            Self::Dev => 0x01,
            Self::Proc => 0x02,
            Self::Sys => 0x04,
            Self::Home => 0x08,
        }
    }

    /// Short name used on the command line and in logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Proc => "proc",
            Self::Sys => "sys",
            Self::Home => "home",
        }
    }
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of subsystems to bind-mount.
///
/// Only the four bits of [`Subsystem`] can ever be set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MountSet(u8);

impl MountSet {
    /// No subsystem.
    pub const EMPTY: MountSet = MountSet(0);

    /// Every subsystem.
    pub const ALL: MountSet = MountSet(0x0F);

    /// Builds a set from a raw mask, rejecting unknown bits.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnknownMountBits` if bits outside `0x0F` are set.
    pub fn from_bits(bits: u8) -> Result<Self, ConfigError> {
        if bits & !Self::ALL.0 != 0 {
            return Err(ConfigError::UnknownMountBits(bits & !Self::ALL.0));
        }
        Ok(Self(bits))
    }

    /// Raw mask.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, subsystem: Subsystem) -> bool {
        self.0 & subsystem.bit() != 0
    }

    /// Returns true if any subsystem is selected.
    #[must_use]
    pub const fn any(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, subsystem: Subsystem) {
        self.0 |= subsystem.bit();
    }

    pub fn remove(&mut self, subsystem: Subsystem) {
        self.0 &= !subsystem.bit();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    /// Selected subsystems in mount order.
    pub fn iter(self) -> impl DoubleEndedIterator<Item = Subsystem> {
        Subsystem::ALL.into_iter().filter(move |s| self.contains(*s))
    }
}

impl FromIterator<Subsystem> for MountSet {
    fn from_iter<I: IntoIterator<Item = Subsystem>>(iter: I) -> Self {
        let mut set = Self::EMPTY;
        for subsystem in iter {
            set.insert(subsystem);
        }
        set
    }
}

impl fmt::Display for MountSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let names = self.iter().map(Subsystem::name).collect::<Vec<_>>();
        f.write_str(&names.join(","))
    }
}

/// Description of a sandbox root and what to mount into it.
///
/// Built once per invocation through [`SandboxConfigBuilder`] and never
/// mutated afterwards.
///
/// # Example
///
/// ```
/// use bbox::sandbox::{MountSet, SandboxConfig, Subsystem};
///
/// let config = SandboxConfig::builder()
///     .target_dir("/srv/box")?
///     .home_dir("/home/alice")?
///     .mount_all()
///     .unset_mount(Subsystem::Sys)
///     .build()?;
///
/// assert!(config.mounts().contains(Subsystem::Home));
/// assert!(!config.mounts().contains(Subsystem::Sys));
/// # Ok::<(), bbox::error::ConfigError>(())
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SandboxConfig {
    target_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    mounts: MountSet,
}

impl SandboxConfig {
    /// Creates an empty configuration: no target, no home, nothing to mount.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a builder with empty defaults.
    #[must_use]
    pub fn builder() -> SandboxConfigBuilder {
        SandboxConfigBuilder::default()
    }

    /// Sandbox root, if configured.
    #[must_use]
    pub fn target_dir(&self) -> Option<&Path> {
        self.target_dir.as_deref()
    }

    /// Home directory as seen from the host, if configured.
    #[must_use]
    pub fn home_dir(&self) -> Option<&Path> {
        self.home_dir.as_deref()
    }

    /// Subsystems to bind-mount.
    #[must_use]
    pub fn mounts(&self) -> MountSet {
        self.mounts
    }

    /// Returns true if any subsystem is selected for mounting.
    #[must_use]
    pub fn mount_any(&self) -> bool {
        self.mounts.any()
    }
}

/// Builder for [`SandboxConfig`].
///
/// Path setters validate their input and store an owned copy; mount setters
/// are plain set operations.
#[derive(Debug, Clone, Default)]
pub struct SandboxConfigBuilder {
    target_dir: Option<PathBuf>,
    home_dir: Option<PathBuf>,
    mounts: MountSet,
}

impl SandboxConfigBuilder {
    /// Sets the sandbox root.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EmptyPath` if `path` is empty.
    pub fn target_dir(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath {
                field: "target directory",
            });
        }
        self.target_dir = Some(path.to_path_buf());
        Ok(self)
    }

    /// Sets the home directory that the HOME mount binds.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::EmptyPath` for an empty path and
    /// `ConfigError::InvalidHomeDir` for anything that cannot be rebased under
    /// the sandbox root (relative, `/` itself, or containing `..`).
    pub fn home_dir(mut self, path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath {
                field: "home directory",
            });
        }
        validate_home_dir(path)?;
        self.home_dir = Some(path.to_path_buf());
        Ok(self)
    }

    /// Replaces the mount set.
    #[must_use]
    pub fn mounts(mut self, mounts: MountSet) -> Self {
        self.mounts = mounts;
        self
    }

    #[must_use]
    pub fn set_mount(mut self, subsystem: Subsystem) -> Self {
        self.mounts.insert(subsystem);
        self
    }

    #[must_use]
    pub fn unset_mount(mut self, subsystem: Subsystem) -> Self {
        self.mounts.remove(subsystem);
        self
    }

    #[must_use]
    pub fn mount_all(mut self) -> Self {
        self.mounts = MountSet::ALL;
        self
    }

    #[must_use]
    pub fn clear_mount(mut self) -> Self {
        self.mounts.clear();
        self
    }

    /// Finishes the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::HomeDirRequired` if the HOME mount is selected
    /// without a home directory.
    pub fn build(self) -> Result<SandboxConfig, ConfigError> {
        if self.mounts.contains(Subsystem::Home) && self.home_dir.is_none() {
            return Err(ConfigError::HomeDirRequired);
        }

        Ok(SandboxConfig {
            target_dir: self.target_dir,
            home_dir: self.home_dir,
            mounts: self.mounts,
        })
    }
}

fn validate_home_dir(path: &Path) -> Result<(), ConfigError> {
    let invalid = |reason| ConfigError::InvalidHomeDir {
        path: path.to_path_buf(),
        reason,
    };

    if !path.is_absolute() {
        return Err(invalid("must be absolute"));
    }
    if path.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(invalid("must not contain '..'"));
    }
    if path.components().all(|c| matches!(c, Component::RootDir | Component::CurDir)) {
        return Err(invalid("must not be the root directory"));
    }
    Ok(())
}
