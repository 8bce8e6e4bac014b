//! Host privilege and kernel facility checks.

use std::fs;
use std::path::Path;

use nix::unistd::Uid;

use crate::error::{Result, SystemRequirementsError};
use crate::sandbox::mountinfo::MOUNTINFO_PATH;

/// Results of all system requirements checks.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Effective uid of the process
    pub effective_uid: u32,
    /// Real uid, i.e. the invoking user
    pub real_uid: u32,
    /// Whether `/proc/self/mountinfo` can be read
    pub mountinfo_readable: bool,
}

impl SystemRequirements {
    /// Whether bbox-do was started by an unprivileged user through the
    /// setuid bit.
    #[must_use]
    pub fn is_setuid(&self) -> bool {
        self.effective_uid == 0 && self.real_uid != 0
    }
}

/// Check all system requirements and return detailed results.
///
/// # Errors
///
/// Returns `SystemRequirementsError::InsufficientPrivileges` if the process
/// cannot mount, chroot or switch users.
pub fn check_all() -> Result<SystemRequirements> {
    let effective_uid = check_privileges()?;
    let mountinfo_readable = check_mountinfo(Path::new(MOUNTINFO_PATH));

    Ok(SystemRequirements {
        effective_uid,
        real_uid: Uid::current().as_raw(),
        mountinfo_readable,
    })
}

/// Check the process runs with an effective uid of 0.
///
/// # Errors
///
/// Returns `SystemRequirementsError::InsufficientPrivileges` otherwise.
pub fn check_privileges() -> Result<u32> {
    let euid = Uid::effective();

    if !euid.is_root() {
        return Err(SystemRequirementsError::InsufficientPrivileges {
            euid: euid.as_raw(),
        }
        .into());
    }

    Ok(euid.as_raw())
}

/// Check the mount table at `path` can be read and parsed.
#[must_use]
pub fn check_mountinfo(path: &Path) -> bool {
    fs::read_to_string(path).is_ok_and(|content| content.lines().next().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_check_privileges_matches_euid() {
        let result = check_privileges();
        if Uid::effective().is_root() {
            assert_eq!(result.expect("running as root"), 0);
        } else {
            assert!(matches!(
                result,
                Err(Error::SystemRequirements(
                    SystemRequirementsError::InsufficientPrivileges { .. }
                ))
            ));
        }
    }

    #[test]
    fn test_check_mountinfo_real() {
        assert!(check_mountinfo(Path::new(MOUNTINFO_PATH)));
    }

    #[test]
    fn test_check_mountinfo_missing_or_empty() {
        let dir = tempfile::tempdir().expect("temp dir");
        assert!(!check_mountinfo(&dir.path().join("missing")));

        let empty = dir.path().join("empty");
        fs::write(&empty, "").expect("write");
        assert!(!check_mountinfo(&empty));
    }

    #[test]
    fn test_setuid_detection() {
        let reqs = SystemRequirements {
            effective_uid: 0,
            real_uid: 1000,
            mountinfo_readable: false,
        };
        assert!(reqs.is_setuid());

        let reqs = SystemRequirements {
            effective_uid: 0,
            real_uid: 0,
            mountinfo_readable: true,
        };
        assert!(!reqs.is_setuid());
    }

    #[test]
    fn test_check_all_real() {
        let result = check_all();
        if Uid::effective().is_root() {
            let reqs = result.expect("root passes");
            assert_eq!(reqs.effective_uid, 0);
            assert_eq!(reqs.mountinfo_readable, check_mountinfo(Path::new(MOUNTINFO_PATH)));
        } else {
            assert!(result.is_err());
        }
    }
}
