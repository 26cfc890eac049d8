//! CLI tests for arcsync
//!
//! Argument parsing checks plus a few end-to-end runs on the local backend.

use assert_cmd::Command;
use predicates::prelude::*;

fn arcsync() -> Command {
    Command::cargo_bin("arcsync").unwrap()
}

#[test]
fn test_help_runs() {
    arcsync().arg("--help").assert().success();
}

#[test]
fn test_version_runs() {
    arcsync().arg("--version").assert().success();
}

#[test]
fn test_list_fs_needs_no_paths() {
    arcsync()
        .arg("--list-fs")
        .assert()
        .success()
        .stdout(predicate::str::contains("local"))
        .stdout(predicate::str::contains("memory"));
}

#[test]
fn test_paths_are_required() {
    arcsync().assert().failure();
    arcsync().arg("/tmp").assert().failure();
}

// ============================================================================
// Value parsing
// ============================================================================

#[test]
fn test_manifest_formats() {
    for format in ["text", "generic", "baseclear"] {
        arcsync()
            .args(["--manifest-format", format, "--help"])
            .assert()
            .success();
    }
    arcsync()
        .args(["--manifest-format", "xml", "src", "dst"])
        .assert()
        .failure();
}

#[test]
fn test_checksum_file_alias() {
    arcsync()
        .args(["--checksum-file", "*.sha256", "--help"])
        .assert()
        .success();
}

#[test]
fn test_ages_accept_seconds_and_durations() {
    arcsync()
        .args(["--min-age", "3600", "--max-age", "7days", "--flag-age", "1h 30m", "--help"])
        .assert()
        .success();
    arcsync()
        .args(["--min-age", "soon", "src", "dst"])
        .assert()
        .failure();
}

#[test]
fn test_pairs_require_equals_sign() {
    arcsync()
        .args(["-m", "source=%sp", "-T", "registered=600", "-O", "status=done", "--help"])
        .assert()
        .success();
    arcsync()
        .args(["-m", "source", "src", "dst"])
        .assert()
        .failure();
    arcsync()
        .args(["-T", "registered=later", "src", "dst"])
        .assert()
        .failure();
}

#[test]
fn test_unknown_backend_fails() {
    let tmp = tempfile::tempdir().unwrap();
    arcsync()
        .args(["--source-fs", "gopher"])
        .arg(tmp.path())
        .arg(tmp.path().join("out"))
        .assert()
        .failure();
}

#[test]
fn test_local_backend_rejects_options() {
    let tmp = tempfile::tempdir().unwrap();
    arcsync()
        .args(["--source-options", "host=example.org"])
        .arg(tmp.path())
        .arg(tmp.path().join("out"))
        .assert()
        .failure();
}

// ============================================================================
// End-to-end on the local backend
// ============================================================================

#[test]
fn test_single_folder_into_parent() {
    let tmp = tempfile::tempdir().unwrap();
    let run = tmp.path().join("data").join("run1");
    std::fs::create_dir_all(run.join("sub")).unwrap();
    std::fs::write(run.join("a.txt"), "alpha").unwrap();
    std::fs::write(run.join("sub").join("b.txt"), "beta").unwrap();
    let archive = tmp.path().join("archive");
    arcsync()
        .arg(&run)
        .arg(format!("{}/", archive.display()))
        .arg("--summary")
        .assert()
        .success()
        .stdout(predicate::str::contains("folders replicated: 1"));
    assert_eq!(
        std::fs::read_to_string(archive.join("run1").join("a.txt")).unwrap(),
        "alpha"
    );
    assert_eq!(
        std::fs::read_to_string(archive.join("run1").join("sub").join("b.txt")).unwrap(),
        "beta"
    );
}

#[test]
fn test_missing_source_folder_fails() {
    let tmp = tempfile::tempdir().unwrap();
    arcsync()
        .arg(tmp.path().join("nope"))
        .arg(tmp.path().join("out"))
        .assert()
        .failure();
}

#[test]
fn test_search_with_pattern_and_exclude() {
    let tmp = tempfile::tempdir().unwrap();
    let data = tmp.path().join("data");
    for name in ["run1", "run2", "scratch"] {
        std::fs::create_dir_all(data.join(name)).unwrap();
        std::fs::write(data.join(name).join("reads.fastq"), name).unwrap();
        std::fs::write(data.join(name).join("debug.log"), "noise").unwrap();
    }
    let archive = tmp.path().join("archive");
    arcsync()
        .args(["--search", "--folder-pattern", "run[0-9]", "-X", "debug", "--copy-procs", "2"])
        .arg(&data)
        .arg(&archive)
        .assert()
        .success();
    assert_eq!(
        std::fs::read_to_string(archive.join("run1").join("reads.fastq")).unwrap(),
        "run1"
    );
    assert!(archive.join("run2").join("reads.fastq").exists());
    assert!(!archive.join("run1").join("debug.log").exists());
    assert!(!archive.join("scratch").exists());
}

#[test]
fn test_manifest_driven_copy_verifies_checksums() {
    let tmp = tempfile::tempdir().unwrap();
    let run = tmp.path().join("run1");
    std::fs::create_dir_all(&run).unwrap();
    std::fs::write(run.join("a.txt"), "hello").unwrap();
    std::fs::write(run.join("unlisted.txt"), "ignored").unwrap();
    std::fs::write(
        run.join("run1.sha256"),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824  a.txt\n",
    )
    .unwrap();
    let dest = tmp.path().join("archive").join("run1");
    arcsync()
        .args(["--manifest", "*.sha256", "--verify-checksums"])
        .arg(&run)
        .arg(&dest)
        .assert()
        .success();
    assert_eq!(std::fs::read_to_string(dest.join("a.txt")).unwrap(), "hello");
    assert!(dest.join("run1.sha256").exists());
    assert!(!dest.join("unlisted.txt").exists());
}

#[test]
fn test_wrong_manifest_checksum_fails() {
    let tmp = tempfile::tempdir().unwrap();
    let run = tmp.path().join("run1");
    std::fs::create_dir_all(&run).unwrap();
    std::fs::write(run.join("a.txt"), "not hello").unwrap();
    std::fs::write(
        run.join("sums.txt"),
        "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824  a.txt\n",
    )
    .unwrap();
    arcsync()
        .args(["--manifest", "sums.txt", "--verify-checksums", "--summary"])
        .arg(&run)
        .arg(tmp.path().join("out"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("arcsync encountered errors"));
}

#[test]
fn test_manifest_entry_outside_folder_is_refused() {
    let tmp = tempfile::tempdir().unwrap();
    let run = tmp.path().join("in").join("run");
    std::fs::create_dir_all(&run).unwrap();
    std::fs::write(tmp.path().join("in").join("planted"), "x").unwrap();
    std::fs::write(run.join("sums.txt"), format!("{}  ../planted\n", "0".repeat(64))).unwrap();
    let archive = tmp.path().join("archive");
    arcsync()
        .args(["--manifest", "sums.txt"])
        .arg(&run)
        .arg(archive.join("run"))
        .assert()
        .failure();
    assert!(!archive.join("planted").exists());
}
