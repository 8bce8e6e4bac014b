//! Integration tests for command line parsing.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::Parser;
use clap::error::ErrorKind;

use bbox::cli::{Args, Commands, MountOp};
use bbox::sandbox::{MountSet, Subsystem};

fn parse(args: &[&str]) -> Result<Args, clap::Error> {
    Args::try_parse_from(std::iter::once("bbox-do").chain(args.iter().copied()))
}

#[test]
fn test_mount_with_selectors() {
    let args = parse(&["mount", "-m", "all,no-home", "-t", "/srv/targets", "box"])
        .expect("valid invocation");

    let Commands::Mount { target, mounts } = args.command else {
        panic!("expected mount, got {:?}", args.command);
    };
    assert_eq!(target.targets, Some(PathBuf::from("/srv/targets")));
    assert_eq!(target.name, "box");
    assert_eq!(
        mounts.mount,
        vec![MountOp::All, MountOp::Unset(Subsystem::Home)]
    );

    let set = mounts.mount_set();
    assert!(!set.contains(Subsystem::Home));
    assert!(set.contains(Subsystem::Dev));
}

#[test]
fn test_repeated_mount_flags_accumulate() {
    let args = parse(&["mount", "-m", "dev", "--mount", "proc,sys", "."]).expect("valid");
    let Commands::Mount { mounts, .. } = args.command else {
        panic!("expected mount");
    };

    let set = mounts.mount_set();
    assert_eq!(
        set.iter().collect::<Vec<_>>(),
        vec![Subsystem::Dev, Subsystem::Proc, Subsystem::Sys]
    );
}

#[test]
fn test_mount_defaults_to_all() {
    let args = parse(&["login", "box"]).expect("valid");
    let Commands::Login { mounts, user, .. } = args.command else {
        panic!("expected login");
    };
    assert_eq!(mounts.mount_set(), MountSet::ALL);
    assert_eq!(user, None);
}

#[test]
fn test_unknown_mount_selector_is_rejected() {
    let err = parse(&["mount", "-m", "tmp", "box"]).expect_err("invalid selector");
    assert_eq!(err.kind(), ErrorKind::ValueValidation);
}

#[test]
fn test_run_keeps_command_arguments_verbatim() {
    let args = parse(&[
        "run", "-u", "alice", "-C", "/work", "box", "make", "-j4", "--keep-going",
    ])
    .expect("valid");

    let Commands::Run {
        target,
        user,
        workdir,
        command,
        ..
    } = args.command
    else {
        panic!("expected run");
    };
    assert_eq!(target.name, "box");
    assert_eq!(user.as_deref(), Some("alice"));
    assert_eq!(workdir, Some(PathBuf::from("/work")));
    assert_eq!(
        command,
        vec![
            OsString::from("make"),
            OsString::from("-j4"),
            OsString::from("--keep-going"),
        ]
    );
}

#[test]
fn test_run_requires_a_command() {
    let err = parse(&["run", "box"]).expect_err("missing command");
    assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
}

#[test]
fn test_umount_lazy() {
    let args = parse(&["umount", "--lazy", "box"]).expect("valid");
    assert_eq!(
        args.command,
        Commands::Umount {
            target: bbox::cli::TargetArgs {
                targets: None,
                name: "box".to_string(),
            },
            lazy: true,
        }
    );
}

#[test]
fn test_global_flags() {
    let args = parse(&["list", "-v", "--skip-checks", "box"]).expect("valid");
    assert!(args.verbose);
    assert!(args.skip_checks);
}

#[test]
fn test_missing_subcommand_is_a_usage_error() {
    let err = parse(&[]).expect_err("no subcommand");
    assert!(err.use_stderr());
}

#[test]
fn test_help_and_version_are_not_errors() {
    let err = parse(&["--help"]).expect_err("help short-circuits");
    assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    assert!(!err.use_stderr());

    let err = parse(&["--version"]).expect_err("version short-circuits");
    assert_eq!(err.kind(), ErrorKind::DisplayVersion);
    assert!(err.to_string().contains("1.0.0"));
}
