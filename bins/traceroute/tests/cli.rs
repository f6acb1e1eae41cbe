//! CLI behavior that needs no network or privileges.

use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn test_invalid_ttl_range_exits_one() {
    Command::cargo_bin("traceroute")
        .unwrap()
        .args(["--min-ttl", "10", "--max-ttl", "5", "10.0.0.5"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("invalid argument"));
}

#[test]
fn test_malformed_destination_exits_one() {
    Command::cargo_bin("traceroute")
        .unwrap()
        .arg("not-an-ip")
        .assert()
        .code(1);
}

#[test]
fn test_missing_destination_exits_one() {
    Command::cargo_bin("traceroute").unwrap().assert().code(1);
}

#[test]
fn test_help_exits_zero() {
    Command::cargo_bin("traceroute")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Trace the path"));
}
