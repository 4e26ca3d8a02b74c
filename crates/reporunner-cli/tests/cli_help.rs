use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_every_subcommand() {
    Command::cargo_bin("reporunner")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("logs"))
        .stdout(predicate::str::contains("dlq"))
        .stdout(predicate::str::contains("doctor"));
}

#[test]
fn run_without_required_args_fails_with_usage_error() {
    Command::cargo_bin("reporunner")
        .unwrap()
        .args(["run", "--repo", "https://example.invalid/x.git"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("run-id"));
}
