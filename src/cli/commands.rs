//! The five subcommands.

use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};

use super::{Commands, TargetArgs};
use crate::error::{EXIT_RUNTIME, Error, MountError, Result, RunError};
use crate::sandbox::{
    HostMountTable, Identity, MountSet, RunRequest, SandboxConfig, Subsystem, apply_mounts,
    exit_code, remove_mounts,
};

/// Default location of the targets directory below the invoking user's home.
const DEFAULT_TARGETS: &str = ".bolt/targets";

/// Shells that mark an account as not able to log in.
const NOLOGIN_SHELLS: &[&str] = &["nologin", "false"];

/// Runs a parsed subcommand and returns the process exit code.
///
/// # Errors
///
/// Returns the error of whichever sandbox operation failed; use
/// [`Error::exit_code`] to map it onto the exit code contract.
pub fn execute(command: Commands) -> Result<u8> {
    let invoking = Identity::invoking()?;
    debug!(user = %invoking.name, uid = %invoking.uid, "Resolved invoking user");

    match command {
        Commands::List { target } => list(&invoking, &target),
        Commands::Login {
            target,
            mounts,
            user,
        } => {
            let identity = select_identity(&invoking, user.as_deref())?;
            let (root, _) = prepare(&invoking, &target, mounts.mount_set())?;

            let status = RunRequest::login_shell(identity).root(root).run()?;
            Ok(status_to_code(exit_code(status)))
        }
        Commands::Run {
            target,
            mounts,
            user,
            workdir,
            command,
        } => {
            let identity = select_identity(&invoking, user.as_deref())?;
            let (root, _) = prepare(&invoking, &target, mounts.mount_set())?;

            let mut argv = command.into_iter();
            let program = argv
                .next()
                .ok_or_else(|| RunError::InvalidCommand("no command given".to_string()))?;

            let mut request = RunRequest::command(identity, program).args(argv).root(root);
            if let Some(dir) = workdir {
                request = request.working_dir(dir);
            }

            let status = request.run()?;
            Ok(status_to_code(exit_code(status)))
        }
        Commands::Mount { target, mounts } => {
            let (root, mounted) = prepare(&invoking, &target, mounts.mount_set())?;
            info!(mounted, target = %root.display(), "Mounts applied");
            Ok(0)
        }
        Commands::Umount { target, lazy } => umount(&invoking, &target, lazy),
    }
}

/// A passwd entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl Account {
    /// Whether the account has a shell one can log in with.
    #[must_use]
    pub fn can_login(&self) -> bool {
        let shell = self
            .shell
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_default();
        !shell.is_empty() && !NOLOGIN_SHELLS.contains(&shell.as_ref())
    }
}

/// Parses `getent passwd` output, skipping malformed lines.
#[must_use]
pub fn parse_passwd(content: &str) -> Vec<Account> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() != 7 {
                return None;
            }
            Some(Account {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                home: PathBuf::from(fields[5]),
                shell: PathBuf::from(fields[6]),
            })
        })
        .collect()
}

/// Resolves `<targets>/<name>` to the canonical sandbox root.
///
/// Unless the caller is root, the root must belong to them.
///
/// # Errors
///
/// Returns `Error::Invocation` for malformed names or foreign targets and
/// `MountError::InvalidTarget` if the directory does not exist.
pub fn resolve_target(invoking: &Identity, target: &TargetArgs) -> Result<PathBuf> {
    let prefix = target
        .targets
        .clone()
        .unwrap_or_else(|| invoking.home.join(DEFAULT_TARGETS));

    let name = target.name.as_str();
    if name.is_empty() || name == ".." || name.contains('/') {
        return Err(Error::Invocation(format!("invalid target name '{name}'")));
    }

    let path = if name == "." { prefix } else { prefix.join(name) };
    let invalid = |reason: String| MountError::InvalidTarget {
        path: path.clone(),
        reason,
    };

    let root = fs::canonicalize(&path).map_err(|e| invalid(e.to_string()))?;
    let metadata = fs::metadata(&root).map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory".to_string()).into());
    }

    if !invoking.uid.is_root() && metadata.uid() != invoking.uid.as_raw() {
        return Err(Error::Invocation(format!(
            "target {} is not owned by {}",
            root.display(),
            invoking.name
        )));
    }

    debug!(root = %root.display(), "Resolved target");
    Ok(root)
}

/// Picks the identity to run as. Only root may choose someone else.
fn select_identity(invoking: &Identity, user: Option<&str>) -> Result<Identity> {
    let Some(user) = user else {
        return Ok(invoking.clone());
    };

    let identity = Identity::resolve(user)?;
    if identity.uid != invoking.uid && !invoking.uid.is_root() {
        return Err(RunError::ForbiddenIdentity {
            user: identity.name,
        }
        .into());
    }

    Ok(identity)
}

fn sandbox_config(root: &Path, home: &Path, mounts: MountSet) -> Result<SandboxConfig> {
    let mut builder = SandboxConfig::builder().target_dir(root)?.mounts(mounts);
    if mounts.contains(Subsystem::Home) {
        builder = builder.home_dir(home)?;
    }
    Ok(builder.build()?)
}

/// Resolves the target and applies the selected mounts. Returns the root and
/// the number of new mounts.
///
/// The home mount is always the invoking user's home, also when running as
/// someone else, so that `umount` knows what to remove.
#[instrument(skip_all, fields(mounts = %mounts))]
fn prepare(
    invoking: &Identity,
    target: &TargetArgs,
    mounts: MountSet,
) -> Result<(PathBuf, usize)> {
    let root = resolve_target(invoking, target)?;
    let config = sandbox_config(&root, &invoking.home, mounts)?;

    let mounted = apply_mounts(&mut HostMountTable::new(), &config, Path::new("/"))?;
    debug!(mounted, "Sandbox ready");
    Ok((root, mounted))
}

#[instrument(skip_all)]
fn list(invoking: &Identity, target: &TargetArgs) -> Result<u8> {
    let root = resolve_target(invoking, target)?;

    let output = RunRequest::command(invoking.clone(), "getent")
        .arg("passwd")
        .root(&root)
        .working_dir("/")
        .capture()?;

    if !output.success() {
        return Err(RunError::Failed {
            program: "getent passwd".to_string(),
            code: exit_code(output.status),
        }
        .into());
    }

    for account in parse_passwd(&output.stdout_lossy()) {
        if account.can_login() {
            println!("{} ({}) {}", account.name, account.uid, account.home.display());
        }
    }

    Ok(0)
}

#[instrument(skip_all, fields(lazy = lazy))]
fn umount(invoking: &Identity, target: &TargetArgs, lazy: bool) -> Result<u8> {
    let root = resolve_target(invoking, target)?;

    // a home that fails validation cannot have been mounted
    let mut mounts = MountSet::ALL;
    if SandboxConfig::builder().home_dir(&invoking.home).is_err() {
        mounts.remove(Subsystem::Home);
    }
    let config = sandbox_config(&root, &invoking.home, mounts)?;

    let mut table = HostMountTable::new().with_lazy_unmount(lazy);
    let result = remove_mounts(&mut table, &config);

    match table.mounts_below(&root) {
        Ok(leftover) => {
            for path in leftover {
                warn!(path = %path.display(), "Still mounted below target");
            }
        }
        Err(e) => warn!(error = %e, "Could not check for leftover mounts"),
    }

    let unmounted = result?;
    info!(unmounted, target = %root.display(), "Mounts removed");
    Ok(0)
}

fn status_to_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_RUNTIME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::{Gid, Uid};

    const PASSWD: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
sync:x:4:65534:sync:/bin:/bin/sync
alice:x:1000:1000:Alice,,,:/home/alice:/bin/zsh
ghost:x:1001:1001::/home/ghost:/bin/false
broken line
bad:x:notanumber:0::/:/bin/sh
";

    fn identity(uid: u32, home: &Path) -> Identity {
        Identity {
            uid: Uid::from_raw(uid),
            gid: Gid::from_raw(uid),
            name: format!("user{uid}"),
            home: home.to_path_buf(),
            shell: PathBuf::from("/bin/sh"),
        }
    }

    #[test]
    fn test_parse_passwd() {
        let accounts = parse_passwd(PASSWD);
        assert_eq!(accounts.len(), 5);
        assert_eq!(accounts[3].name, "alice");
        assert_eq!(accounts[3].uid, 1000);
        assert_eq!(accounts[3].home, PathBuf::from("/home/alice"));
    }

    #[test]
    fn test_login_filter() {
        let names: Vec<String> = parse_passwd(PASSWD)
            .into_iter()
            .filter(Account::can_login)
            .map(|a| a.name)
            .collect();
        assert_eq!(names, vec!["root", "sync", "alice"]);
    }

    #[test]
    fn test_resolve_target_under_prefix() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::create_dir(dir.path().join("box")).expect("mkdir");
        let me = identity(Uid::current().as_raw(), dir.path());

        let args = TargetArgs {
            targets: Some(dir.path().to_path_buf()),
            name: "box".to_string(),
        };
        let root = resolve_target(&me, &args).expect("target exists");
        assert_eq!(root, fs::canonicalize(dir.path().join("box")).expect("canonicalize"));

        let args = TargetArgs {
            targets: Some(dir.path().to_path_buf()),
            name: ".".to_string(),
        };
        let root = resolve_target(&me, &args).expect("prefix exists");
        assert_eq!(root, fs::canonicalize(dir.path()).expect("canonicalize"));
    }

    #[test]
    fn test_resolve_target_default_prefix() {
        let home = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(home.path().join(".bolt/targets/box")).expect("mkdir");
        let me = identity(Uid::current().as_raw(), home.path());

        let args = TargetArgs {
            targets: None,
            name: "box".to_string(),
        };
        assert!(resolve_target(&me, &args).is_ok());
    }

    #[test]
    fn test_resolve_target_rejects_bad_names() {
        let dir = tempfile::tempdir().expect("temp dir");
        let me = identity(Uid::current().as_raw(), dir.path());

        for name in ["", "..", "a/b", "../etc"] {
            let args = TargetArgs {
                targets: Some(dir.path().to_path_buf()),
                name: name.to_string(),
            };
            let err = resolve_target(&me, &args).expect_err("bad name");
            assert_eq!(err.exit_code(), 1, "{name}");
        }
    }

    #[test]
    fn test_resolve_target_missing_is_invocation_error() {
        let dir = tempfile::tempdir().expect("temp dir");
        let me = identity(Uid::current().as_raw(), dir.path());
        let args = TargetArgs {
            targets: Some(dir.path().to_path_buf()),
            name: "missing".to_string(),
        };

        let err = resolve_target(&me, &args).expect_err("missing target");
        assert!(matches!(err, Error::Mount(MountError::InvalidTarget { .. })));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_resolve_target_rejects_foreign_owner() {
        let dir = tempfile::tempdir().expect("temp dir");
        let someone_else = identity(Uid::current().as_raw().wrapping_add(1), dir.path());
        if someone_else.uid.is_root() {
            return;
        }

        let args = TargetArgs {
            targets: Some(dir.path().to_path_buf()),
            name: ".".to_string(),
        };
        let err = resolve_target(&someone_else, &args).expect_err("foreign target");
        assert!(matches!(err, Error::Invocation(_)));
    }

    #[test]
    fn test_select_identity_defaults_to_invoking() {
        let me = identity(1234, Path::new("/home/me"));
        assert_eq!(select_identity(&me, None).expect("self"), me);
    }

    #[test]
    fn test_select_identity_forbids_switching_for_non_root() {
        let me = identity(4_000_000_001, Path::new("/home/me"));
        let err = select_identity(&me, Some("root")).expect_err("not root");
        assert!(matches!(err, Error::Run(RunError::ForbiddenIdentity { .. })));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_select_identity_unknown_user() {
        let root = identity(0, Path::new("/root"));
        let err = select_identity(&root, Some("no-such-user-bbox")).expect_err("unknown");
        assert!(matches!(err, Error::Run(RunError::UnknownUser(_))));
    }

    #[test]
    fn test_sandbox_config_home_only_when_selected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config =
            sandbox_config(dir.path(), Path::new("/"), MountSet::EMPTY).expect("no home needed");
        assert!(config.home_dir().is_none());

        let err = sandbox_config(dir.path(), Path::new("/"), MountSet::ALL).expect_err("bad home");
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_status_to_code() {
        assert_eq!(status_to_code(0), 0);
        assert_eq!(status_to_code(130), 130);
        assert_eq!(status_to_code(-1), EXIT_RUNTIME);
    }
}
