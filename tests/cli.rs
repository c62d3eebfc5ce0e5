//! End-to-end checks of the `drctl` launcher surface: argument parsing and
//! the exit-code contract (0 success, 1 configuration error, 2 attach
//! failure).

use drcore::commands::rd_options::{RdOptions, RdSubCommand};
use std::process::Command;
use structopt::StructOpt;

fn parse(args: &[&str]) -> RdOptions {
    let mut full = vec!["drctl"];
    full.extend_from_slice(args);
    RdOptions::from_iter(full)
}

#[test]
fn parses_run_with_program_and_passthrough_args() {
    let opts = parse(&["run", "/bin/echo", "hi", "there"]);
    match opts.cmd {
        RdSubCommand::Run { program, args, persist_path } => {
            assert_eq!(program.to_str().unwrap(), "/bin/echo");
            assert_eq!(args, vec!["hi".to_string(), "there".to_string()]);
            assert!(persist_path.is_none());
        }
        other => panic!("expected Run, got {:?}", other),
    }
}

#[test]
fn parses_run_with_persist_path_flag() {
    let opts = parse(&["run", "/bin/echo", "--persist-path", "/tmp/cache.drcf"]);
    match opts.cmd {
        RdSubCommand::Run { persist_path, .. } => {
            assert_eq!(persist_path.unwrap().to_str().unwrap(), "/tmp/cache.drcf");
        }
        other => panic!("expected Run, got {:?}", other),
    }
}

#[test]
fn parses_attach_with_pid() {
    let opts = parse(&["attach", "1234"]);
    match opts.cmd {
        RdSubCommand::Attach { pid } => assert_eq!(pid, 1234),
        other => panic!("expected Attach, got {:?}", other),
    }
}

#[test]
fn parses_detach_with_pid() {
    let opts = parse(&["detach", "4321"]);
    match opts.cmd {
        RdSubCommand::Detach { pid } => assert_eq!(pid, 4321),
        other => panic!("expected Detach, got {:?}", other),
    }
}

#[test]
fn parses_inject_all_with_name_filter() {
    let opts = parse(&["inject-all", "nginx"]);
    match opts.cmd {
        RdSubCommand::InjectAll { name_filter } => assert_eq!(name_filter, "nginx"),
        other => panic!("expected InjectAll, got {:?}", other),
    }
}

#[test]
fn parses_uninject_all_with_no_arguments() {
    let opts = parse(&["uninject-all"]);
    assert!(matches!(opts.cmd, RdSubCommand::UninjectAll));
}

#[test]
fn rejects_missing_subcommand() {
    let mut full = vec!["drctl"];
    let result = RdOptions::from_iter_safe(&mut full);
    assert!(result.is_err());
}

/// Exercises the built binary directly: `uninject-all` has no side effects
/// and always succeeds, so its exit code is a stable process-level check of
/// the success path (exit code 0).
#[test]
#[ignore]
fn uninject_all_exits_zero() {
    let bin = env!("CARGO_BIN_EXE_drctl");
    let status = Command::new(bin)
        .arg("uninject-all")
        .status()
        .expect("failed to spawn drctl");
    assert_eq!(status.code(), Some(0));
}

/// Detaching from a pid nothing is actually attached to must fail, and
/// since it's not one of the attach-like verbs it should map to exit code 1
/// (configuration error) rather than 2 (attach failure).
#[test]
#[ignore]
fn detach_from_unattached_pid_exits_with_configuration_error() {
    let bin = env!("CARGO_BIN_EXE_drctl");
    let status = Command::new(bin)
        .arg("detach")
        .arg("1")
        .status()
        .expect("failed to spawn drctl");
    assert_eq!(status.code(), Some(1));
}

/// Attaching to a pid that doesn't exist is squarely an attach failure and
/// should map to exit code 2.
#[test]
#[ignore]
fn attach_to_nonexistent_pid_exits_with_attach_failure() {
    let bin = env!("CARGO_BIN_EXE_drctl");
    let status = Command::new(bin)
        .arg("attach")
        .arg("999999")
        .status()
        .expect("failed to spawn drctl");
    assert_eq!(status.code(), Some(2));
}
