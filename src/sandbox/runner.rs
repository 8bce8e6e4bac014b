//! Running commands inside the sandbox as an unprivileged user.
//!
//! Every command is started through [`RunRequest`]. The runner installs the
//! privilege transition itself, so a request cannot be spawned without it.
//! In the forked child, before `exec`:
//!
//! 1. set `PR_SET_NO_NEW_PRIVS`, so no setuid binary reachable from the
//!    sandbox (including `/proc/<pid>/exe` of bbox-do itself) grants root
//! 2. `chroot` into the sandbox root (if one is set) and `chdir("/")`
//! 3. `setgroups` to the user's supplementary groups from the host database
//! 4. `setgid` / `setuid` to the user's primary group and uid
//! 5. verify uid 0 cannot be regained
//! 6. `chdir` into the working directory, now with the user's permissions
//!
//! If any step fails the child exits without running the command and the
//! error is reported by `spawn()` in the parent.
//!
//! Without an effective uid of 0 no transition is possible; the only identity
//! accepted then is the current one.
//!
//! # Notes on output capture
//!
//! Captured output is stdout only; stderr stays attached to the terminal so
//! diagnostics of the child remain visible. The child is always reaped, even
//! if reading its output fails.

#![allow(unsafe_code)]

use std::borrow::Cow;
use std::ffi::{CString, OsString};
use std::io::{self, Read};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use nix::errno::Errno;
use nix::sys::prctl::set_no_new_privs;
use nix::sys::signal::{SigHandler, Signal, signal};
use nix::unistd::{Gid, Uid, User, chdir, chroot, getgrouplist, setgid, setgroups, setuid};
use tracing::{debug, instrument, trace, warn};

use crate::error::RunError;

/// Directories searched, relative to the sandbox root, for commands given
/// without a `/`.
pub const SEARCH_PATH: &[&str] = &[
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
    "/tools/bin",
];

/// `PATH` handed to the child when the caller's environment has none.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin:/tools/bin";

/// Shell used for logins when the user's shell does not exist in the root.
const FALLBACK_SHELL: &str = "/bin/sh";

/// A user account resolved from the host passwd database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uid,
    /// Primary group.
    pub gid: Gid,
    pub name: String,
    pub home: PathBuf,
    pub shell: PathBuf,
}

impl Identity {
    /// Looks up the account with the given uid.
    ///
    /// # Errors
    ///
    /// Returns `RunError::UnknownUser` if there is no such account.
    pub fn from_uid(uid: Uid) -> Result<Self, RunError> {
        User::from_uid(uid)
            .map_err(|e| RunError::UserLookup {
                user: uid.to_string(),
                source: e,
            })?
            .map(Self::from)
            .ok_or_else(|| RunError::UnknownUser(uid.to_string()))
    }

    /// Looks up the account with the given login name.
    ///
    /// # Errors
    ///
    /// Returns `RunError::UnknownUser` if there is no such account.
    pub fn from_name(name: &str) -> Result<Self, RunError> {
        User::from_name(name)
            .map_err(|e| RunError::UserLookup {
                user: name.to_string(),
                source: e,
            })?
            .map(Self::from)
            .ok_or_else(|| RunError::UnknownUser(name.to_string()))
    }

    /// Resolves a numeric uid or a login name.
    ///
    /// # Errors
    ///
    /// Returns `RunError::UnknownUser` if no account matches.
    pub fn resolve(user: &str) -> Result<Self, RunError> {
        match user.parse::<u32>() {
            Ok(uid) => Self::from_uid(Uid::from_raw(uid)),
            Err(_) => Self::from_name(user),
        }
    }

    /// The account of the real uid, i.e. whoever invoked the tool.
    ///
    /// # Errors
    ///
    /// Returns `RunError::UnknownUser` if the real uid has no passwd entry.
    pub fn invoking() -> Result<Self, RunError> {
        Self::from_uid(Uid::current())
    }

    /// Supplementary groups from the host group database.
    fn groups(&self) -> Result<Vec<Gid>, RunError> {
        let name = CString::new(self.name.as_str())
            .map_err(|_| RunError::InvalidUserName(self.name.clone()))?;
        getgrouplist(&name, self.gid).map_err(|e| RunError::UserLookup {
            user: self.name.clone(),
            source: e,
        })
    }
}

impl From<User> for Identity {
    fn from(user: User) -> Self {
        Self {
            uid: user.uid,
            gid: user.gid,
            name: user.name,
            home: user.dir,
            shell: user.shell,
        }
    }
}

/// Stdout of a finished command together with its exit status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    /// Everything the command wrote to stdout.
    pub stdout: Vec<u8>,
    pub status: ExitStatus,
}

impl CapturedOutput {
    /// Returns `true` if the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout decoded as UTF-8, replacing invalid sequences.
    #[must_use]
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }
}

/// Result of [`run_as`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Interactive run with inherited stdio.
    Exited(ExitStatus),
    /// Run with captured stdout.
    Captured(CapturedOutput),
}

impl RunOutcome {
    #[must_use]
    pub fn status(&self) -> ExitStatus {
        match self {
            Self::Exited(status) => *status,
            Self::Captured(output) => output.status,
        }
    }
}

/// Converts an exit status to a shell-style code: the exit code, or 128 + N
/// for a child killed by signal N.
#[must_use]
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[derive(Debug, Clone)]
enum Program {
    Command(OsString),
    LoginShell,
}

/// A command to run as a given user, optionally inside a sandbox root.
///
/// # Example
///
/// ```no_run
/// use bbox::sandbox::{Identity, RunRequest};
///
/// let alice = Identity::from_name("alice")?;
/// let output = RunRequest::command(alice, "id")
///     .arg("-un")
///     .root("/srv/box")
///     .capture()?;
/// assert_eq!(output.stdout_lossy().trim(), "alice");
/// # Ok::<(), bbox::error::RunError>(())
/// ```
#[derive(Debug, Clone)]
pub struct RunRequest {
    identity: Identity,
    program: Program,
    args: Vec<OsString>,
    root: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    env: Vec<(OsString, OsString)>,
}

impl RunRequest {
    /// Runs `program` as `identity`.
    ///
    /// A program without `/` is looked up in [`SEARCH_PATH`] under the root.
    #[must_use]
    pub fn command(identity: Identity, program: impl Into<OsString>) -> Self {
        Self::new(identity, Program::Command(program.into()))
    }

    /// Starts the login shell of `identity`.
    #[must_use]
    pub fn login_shell(identity: Identity) -> Self {
        Self::new(identity, Program::LoginShell)
    }

    fn new(identity: Identity, program: Program) -> Self {
        Self {
            identity,
            program,
            args: Vec::new(),
            root: None,
            working_dir: None,
            env: Vec::new(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Chroot into `root` before dropping privileges.
    #[must_use]
    pub fn root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = Some(root.into());
        self
    }

    /// Working directory, as seen from inside the root.
    ///
    /// Defaults to the user's home if it exists inside the root, else `/`.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable on top of the inherited environment.
    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Runs the command with inherited stdio and waits for it.
    ///
    /// SIGINT and SIGQUIT are ignored by the parent while the child runs so
    /// that Ctrl-C reaches only the child.
    ///
    /// # Errors
    ///
    /// - `RunError::InvalidCommand` / `RunError::CommandNotFound` before forking
    /// - `RunError::Spawn` if fork, the privilege transition or exec failed
    /// - `RunError::Wait` if the child could not be waited for
    #[instrument(skip_all, fields(user = %self.identity.name, root = ?self.root))]
    pub fn run(self) -> Result<ExitStatus, RunError> {
        let prepared = self.prepare()?;
        let mut cmd = prepared.command;

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(&prepared.label, e))?;
        let _interrupts = InterruptGuard::ignore();

        let status = child.wait().map_err(|e| RunError::Wait {
            program: prepared.label.clone(),
            source: e,
        })?;

        debug!(program = %prepared.label, ?status, "Command completed");
        Ok(status)
    }

    /// Runs the command with stdout redirected into a pipe and returns
    /// everything it wrote once it exits.
    ///
    /// # Errors
    ///
    /// Same as [`RunRequest::run`], plus `RunError::ReadOutput` if the pipe
    /// could not be drained. The child is reaped in every case.
    #[instrument(skip_all, fields(user = %self.identity.name, root = ?self.root))]
    pub fn capture(self) -> Result<CapturedOutput, RunError> {
        let prepared = self.prepare()?;
        let mut cmd = prepared.command;
        cmd.stdin(Stdio::null()).stdout(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| self.spawn_error(&prepared.label, e))?;

        let mut stdout = Vec::new();
        let read = match child.stdout.take() {
            Some(mut pipe) => pipe.read_to_end(&mut stdout).map(|_| ()),
            None => Ok(()),
        };

        let status = child.wait().map_err(|e| RunError::Wait {
            program: prepared.label.clone(),
            source: e,
        })?;

        read.map_err(|e| RunError::ReadOutput {
            program: prepared.label.clone(),
            source: e,
        })?;

        debug!(program = %prepared.label, ?status, bytes = stdout.len(), "Command completed");
        Ok(CapturedOutput { stdout, status })
    }

    fn spawn_error(&self, label: &str, source: io::Error) -> RunError {
        warn!(program = %label, error = %source, "Failed to start command");
        RunError::Spawn {
            program: label.to_string(),
            user: self.identity.name.clone(),
            source,
        }
    }

    /// Resolves everything in the parent and builds the command with the
    /// privilege transition attached.
    fn prepare(&self) -> Result<Prepared, RunError> {
        let base = self.root.as_deref().unwrap_or(Path::new("/"));

        let (program, arg0) = match &self.program {
            Program::Command(name) => {
                let name = name.to_string_lossy();
                if name.trim().is_empty() {
                    return Err(RunError::InvalidCommand(
                        "command cannot be empty".to_string(),
                    ));
                }
                let path = resolve_command(base, &name)
                    .ok_or_else(|| RunError::CommandNotFound(name.to_string()))?;
                (path, None)
            }
            Program::LoginShell => {
                let shell = login_shell(base, &self.identity.shell);
                let arg0 = format!(
                    "-{}",
                    shell.file_name().unwrap_or_default().to_string_lossy()
                );
                (shell, Some(arg0))
            }
        };
        debug!(resolved = %program.display(), "Resolved command path");

        let working_dir = self
            .working_dir
            .clone()
            .unwrap_or_else(|| default_working_dir(base, &self.identity.home));

        let transition = PrivilegeTransition {
            root: self.root.clone(),
            working_dir,
            uid: self.identity.uid,
            gid: self.identity.gid,
            groups: self.identity.groups()?,
        };
        trace!(?transition, "Prepared privilege transition");

        let mut cmd = Command::new(&program);
        if let Some(arg0) = arg0 {
            cmd.arg0(arg0);
        }
        cmd.args(&self.args);

        cmd.env("HOME", &self.identity.home)
            .env("USER", &self.identity.name)
            .env("LOGNAME", &self.identity.name)
            .env("SHELL", &self.identity.shell);
        if std::env::var_os("PATH").is_none() {
            cmd.env("PATH", DEFAULT_PATH);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        // SAFETY: the closure only issues syscalls (chroot, chdir, setgroups,
        // setgid, setuid) on data prepared before the fork; it does not
        // allocate or take locks.
        unsafe {
            cmd.pre_exec(move || transition.apply());
        }

        Ok(Prepared {
            command: cmd,
            label: program.display().to_string(),
        })
    }
}

struct Prepared {
    command: Command,
    label: String,
}

/// Runs `command` as the account with `uid`, either interactively or with
/// stdout captured.
///
/// # Errors
///
/// Returns `RunError::UnknownUser` before anything is forked if `uid` has no
/// passwd entry, and the errors of [`RunRequest::run`] / [`RunRequest::capture`]
/// otherwise.
pub fn run_as<I, S>(
    uid: Uid,
    command: impl Into<OsString>,
    argv: I,
    capture: bool,
) -> Result<RunOutcome, RunError>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    let identity = Identity::from_uid(uid)?;
    let request = RunRequest::command(identity, command).args(argv);

    if capture {
        request.capture().map(RunOutcome::Captured)
    } else {
        request.run().map(RunOutcome::Exited)
    }
}

/// Post-fork, pre-exec switch from root to the target user.
#[derive(Debug)]
struct PrivilegeTransition {
    root: Option<PathBuf>,
    working_dir: PathBuf,
    uid: Uid,
    gid: Gid,
    groups: Vec<Gid>,
}

impl PrivilegeTransition {
    fn apply(&self) -> io::Result<()> {
        set_no_new_privs()?;

        if let Some(root) = &self.root {
            chroot(root.as_path())?;
            chdir("/")?;
        }

        if Uid::effective().is_root() {
            setgroups(&self.groups)?;
            setgid(self.gid)?;
            setuid(self.uid)?;

            let regained = setuid(Uid::from_raw(0)).is_ok() || Uid::effective().is_root();
            if !self.uid.is_root() && regained {
                return Err(Errno::EPERM.into());
            }
        } else if Uid::effective() != self.uid {
            return Err(Errno::EPERM.into());
        }

        chdir(self.working_dir.as_path())?;
        Ok(())
    }
}

/// Ignores SIGINT and SIGQUIT until dropped.
struct InterruptGuard {
    previous: Vec<(Signal, SigHandler)>,
}

impl InterruptGuard {
    fn ignore() -> Self {
        let mut previous = Vec::new();
        for sig in [Signal::SIGINT, Signal::SIGQUIT] {
            // SAFETY: SigIgn installs no Rust handler.
            match unsafe { signal(sig, SigHandler::SigIgn) } {
                Ok(handler) => previous.push((sig, handler)),
                Err(e) => warn!(signal = ?sig, error = %e, "Failed to ignore signal"),
            }
        }
        Self { previous }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        for (sig, handler) in self.previous.drain(..) {
            // SAFETY: restores the disposition that was in place before.
            if let Err(e) = unsafe { signal(sig, handler) } {
                warn!(signal = ?sig, error = %e, "Failed to restore signal handler");
            }
        }
    }
}

/// Resolves a command name to a path inside `root`.
///
/// A name containing `/` is returned as-is. Otherwise the first entry of
/// [`SEARCH_PATH`] holding the command is used; the host `$PATH` is not consulted.
fn resolve_command(root: &Path, command: &str) -> Option<PathBuf> {
    if command.contains('/') {
        return Some(PathBuf::from(command));
    }

    SEARCH_PATH
        .iter()
        .map(|dir| Path::new(dir).join(command))
        .find(|candidate| in_root(root, candidate).exists())
}

fn login_shell(root: &Path, shell: &Path) -> PathBuf {
    if !shell.as_os_str().is_empty() && in_root(root, shell).is_file() {
        shell.to_path_buf()
    } else {
        PathBuf::from(FALLBACK_SHELL)
    }
}

fn default_working_dir(root: &Path, home: &Path) -> PathBuf {
    if home.is_absolute() && in_root(root, home).is_dir() {
        home.to_path_buf()
    } else {
        PathBuf::from("/")
    }
}

/// Host-side path of `path` as seen from inside `root`.
fn in_root(root: &Path, path: &Path) -> PathBuf {
    root.join(path.strip_prefix("/").unwrap_or(path))
}
