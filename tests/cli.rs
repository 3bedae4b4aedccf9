use assert_cmd::Command;
use predicates::prelude::*;

fn buildbox() -> Command {
    Command::cargo_bin("buildbox").expect("binary builds")
}

#[test]
fn list_steps_names_every_step() {
    buildbox()
        .arg("--list-steps")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("pkg-cache")
                .and(predicate::str::contains("build-image"))
                .and(predicate::str::contains("image"))
                .and(predicate::str::contains("configure"))
                .and(predicate::str::contains("build"))
                .and(predicate::str::contains("tarball"))
                .and(predicate::str::contains("source-package"))
                .and(predicate::str::contains("package"))
                .and(predicate::str::contains("custom"))
                .and(predicate::str::contains("interactive")),
        );
}

#[test]
fn help_lists_the_main_flags() {
    buildbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(
            predicate::str::contains("--distro")
                .and(predicate::str::contains("--execute"))
                .and(predicate::str::contains("--dry-run"))
                .and(predicate::str::contains("--image-sources")),
        );
}

#[test]
fn unknown_step_is_rejected() {
    buildbox()
        .args(["--execute", "deploy-to-prod"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown step"));
}

#[test]
fn unknown_distro_is_rejected() {
    buildbox()
        .args(["--distro", "slackware"])
        .assert()
        .failure();
}

#[test]
fn missing_source_dir_fails_cleanly() {
    buildbox()
        .args([
            "--source-dir",
            "/nonexistent/buildbox-test",
            "--execute",
            "pkg-cache",
        ])
        .assert()
        .failure();
}

#[test]
fn pkg_cache_step_runs_against_a_scratch_tree() {
    let dir = tempfile::tempdir().unwrap();
    let cache = dir.path().join("cache");
    buildbox()
        .args(["--execute", "pkg-cache"])
        .args(["--source-dir", dir.path().to_str().unwrap()])
        .args(["--pkg-cache-dir", cache.to_str().unwrap()])
        .arg("--dry-run")
        .assert()
        .success();
    assert!(cache.join("_buildbox_centos9").join("lib").is_dir());
}
