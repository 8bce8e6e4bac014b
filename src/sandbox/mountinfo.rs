//! Mount state inspection.
//!
//! Answers "is this path itself a mount point?" from the live mount table so
//! that mounting and unmounting can be repeated safely.
//!
//! # Sources
//!
//! - `/proc/self/mountinfo` is authoritative. It also catches bind mounts whose
//!   source lives on the same device as the destination, which a device-id
//!   comparison cannot see.
//! - If mountinfo cannot be read, the device id of the path is compared with
//!   that of its parent directory instead.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{instrument, trace, warn};

use crate::error::MountError;

/// Mount table of the calling process.
pub const MOUNTINFO_PATH: &str = "/proc/self/mountinfo";

/// Returns whether `path` is a mount point according to the live mount table.
///
/// # Errors
///
/// Returns `MountError::Stat` if `path` cannot be stat'd (for example because it
/// does not exist). A missing path is never reported as simply "not mounted".
pub fn is_mounted(path: &Path) -> Result<bool, MountError> {
    is_mounted_in(Path::new(MOUNTINFO_PATH), path)
}

/// Same as [`is_mounted`] but reads the mount table from `mountinfo`.
///
/// # Errors
///
/// Returns `MountError::Stat` if `path` cannot be stat'd or canonicalized.
#[instrument(skip_all, fields(path = %path.display()))]
pub fn is_mounted_in(mountinfo: &Path, path: &Path) -> Result<bool, MountError> {
    let stat_err = |source| MountError::Stat {
        path: path.to_path_buf(),
        source,
    };

    let metadata = fs::metadata(path).map_err(stat_err)?;
    let canonical = fs::canonicalize(path).map_err(stat_err)?;

    match read_mount_points(mountinfo) {
        Ok(points) => {
            let mounted = points.iter().any(|p| *p == canonical);
            trace!(mounted, "Checked mountinfo");
            Ok(mounted)
        }
        Err(e) => {
            warn!(error = %e, "Mount table unreadable, comparing device ids");
            device_boundary(&canonical, &metadata)
        }
    }
}

/// Lists every mount point strictly below `root`.
///
/// # Errors
///
/// Returns `MountError::MountInfo` if the mount table cannot be read.
pub fn mounts_below(mountinfo: &Path, root: &Path) -> Result<Vec<PathBuf>, MountError> {
    let points = read_mount_points(mountinfo)?;
    Ok(points
        .into_iter()
        .filter(|p| p != root && p.starts_with(root))
        .collect())
}

/// Reads and parses the mount points listed in a mountinfo file.
///
/// # Errors
///
/// Returns `MountError::MountInfo` if the file cannot be read.
pub fn read_mount_points(mountinfo: &Path) -> Result<Vec<PathBuf>, MountError> {
    let content = fs::read_to_string(mountinfo).map_err(|e| MountError::MountInfo {
        path: mountinfo.to_path_buf(),
        source: e,
    })?;
    Ok(parse_mount_points(&content))
}

/// Extracts mount points from mountinfo content.
///
/// mountinfo format: `id parent_id major:minor root mount_point options ...`.
/// Field 5 is the mount point with whitespace and backslashes octal-escaped.
#[must_use]
pub fn parse_mount_points(content: &str) -> Vec<PathBuf> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().nth(4))
        .map(|field| PathBuf::from(unescape(field)))
        .collect()
}

/// Decodes the `\ooo` escapes the kernel uses in mountinfo fields.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() && is_octal_escape(&bytes[i + 1..i + 4]) {
            let value = bytes[i + 1..i + 4]
                .iter()
                .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
            if let Ok(byte) = u8::try_from(value) {
                out.push(byte);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }

    String::from_utf8_lossy(&out).into_owned()
}

fn is_octal_escape(digits: &[u8]) -> bool {
    digits.len() == 3 && digits.iter().all(|b| (b'0'..=b'7').contains(b))
}

/// Fallback check: a mount point sits on a different device than its parent,
/// or is the root directory itself.
fn device_boundary(canonical: &Path, metadata: &fs::Metadata) -> Result<bool, MountError> {
    let Some(parent) = canonical.parent() else {
        return Ok(true);
    };

    let parent_meta = fs::metadata(parent).map_err(|e| MountError::Stat {
        path: parent.to_path_buf(),
        source: e,
    })?;

    Ok(parent_meta.dev() != metadata.dev())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
23 22 0:21 / /proc rw,nosuid,nodev,noexec shared:12 - proc proc rw
24 22 0:5 / /dev rw,nosuid shared:2 - devtmpfs udev rw
90 22 8:1 /dev /srv/my\\040box/dev rw,relatime shared:1 - ext4 /dev/sda1 rw
91 22 8:1 /home/alice /srv/box/home/alice rw,relatime shared:1 - ext4 /dev/sda1 rw
";

    #[test]
    fn test_parse_mount_points() {
        let points = parse_mount_points(SAMPLE);
        assert_eq!(points.len(), 5);
        assert_eq!(points[0], PathBuf::from("/"));
        assert_eq!(points[1], PathBuf::from("/proc"));
        assert_eq!(points[3], PathBuf::from("/srv/my box/dev"));
    }

    #[test]
    fn test_parse_skips_short_lines() {
        let points = parse_mount_points("garbage\n\n1 2 3\n");
        assert!(points.is_empty());
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("/a\\040b"), "/a b");
        assert_eq!(unescape("/tab\\011x"), "/tab\tx");
        assert_eq!(unescape("/back\\134slash"), "/back\\slash");
        assert_eq!(unescape("/plain"), "/plain");
        assert_eq!(unescape("/trailing\\04"), "/trailing\\04");
        assert_eq!(unescape("/not\\999octal"), "/not\\999octal");
    }

    #[test]
    fn test_mounts_below() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(SAMPLE.as_bytes()).expect("write mountinfo");

        let below = mounts_below(file.path(), Path::new("/srv/box")).expect("readable");
        assert_eq!(below, vec![PathBuf::from("/srv/box/home/alice")]);

        let below = mounts_below(file.path(), Path::new("/srv/box/home/alice")).expect("readable");
        assert!(below.is_empty());
    }

    #[test]
    fn test_is_mounted_against_sample_table() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mounted = dir.path().join("mounted");
        let plain = dir.path().join("plain");
        fs::create_dir(&mounted).expect("mkdir");
        fs::create_dir(&plain).expect("mkdir");
        let canonical = fs::canonicalize(&mounted).expect("canonicalize");

        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "100 22 8:1 /x {} rw,relatime - ext4 /dev/sda1 rw",
            canonical.display()
        )
        .expect("write mountinfo");

        assert!(is_mounted_in(file.path(), &mounted).expect("stat ok"));
        assert!(!is_mounted_in(file.path(), &plain).expect("stat ok"));
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("does-not-exist");

        let result = is_mounted(&missing);
        assert!(matches!(result, Err(MountError::Stat { .. })), "{result:?}");
    }

    #[test]
    fn test_plain_directory_not_mounted() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).expect("mkdir");

        assert!(!is_mounted(&sub).expect("stat ok"));
    }

    #[test]
    fn test_root_is_mounted() {
        assert!(is_mounted(Path::new("/")).expect("stat ok"));
    }

    #[test]
    fn test_device_fallback_when_table_unreadable() {
        let dir = tempfile::tempdir().expect("temp dir");
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).expect("mkdir");
        let unreadable = dir.path().join("no-mountinfo");

        assert!(!is_mounted_in(&unreadable, &sub).expect("stat ok"));
        assert!(is_mounted_in(&unreadable, Path::new("/")).expect("stat ok"));
    }
}
