//! CLI tests for archash

use assert_cmd::Command;
use predicates::prelude::*;

const HELLO_SHA: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";
const WORLD_SHA: &str = "486ea46224d1bb4fb680f34f7c9ad96a8f24ec88be73ea8e5a6c65260e9cb8a7";

fn archash() -> Command {
    Command::cargo_bin("archash").unwrap()
}

fn fixture() -> tempfile::TempDir {
    let tmp = tempfile::tempdir().unwrap();
    let run = tmp.path().join("run7");
    std::fs::create_dir_all(run.join("sub")).unwrap();
    std::fs::write(run.join("a.txt"), "hello").unwrap();
    std::fs::write(run.join("sub").join("b.txt"), "world").unwrap();
    tmp
}

#[test]
fn test_help_runs() {
    archash().arg("--help").assert().success();
}

#[test]
fn test_version_runs() {
    archash().arg("--version").assert().success();
}

#[test]
fn test_format_values() {
    for format in ["text", "generic"] {
        archash().args(["--format", format, "--help"]).assert().success();
    }
    archash().args(["--format", "baseclear", "."]).assert().failure();
}

#[test]
fn test_text_manifest_to_stdout() {
    let tmp = fixture();
    archash()
        .arg(tmp.path().join("run7"))
        .assert()
        .success()
        .stdout(predicate::str::diff(format!(
            "{}  a.txt\n{}  sub/b.txt\n",
            HELLO_SHA, WORLD_SHA
        )));
}

#[test]
fn test_generic_manifest_defaults_collection_to_folder_name() {
    let tmp = fixture();
    archash()
        .args(["--format", "generic"])
        .arg(tmp.path().join("run7"))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"collection\": \"run7\""))
        .stdout(predicate::str::contains("\"sub/b.txt\""))
        .stdout(predicate::str::contains(WORLD_SHA));
}

#[test]
fn test_output_inside_folder_is_not_listed() {
    let tmp = fixture();
    let run = tmp.path().join("run7");
    let manifest = run.join("run7.sha256");
    std::fs::write(&manifest, "stale").unwrap();
    archash().arg(&run).arg("-o").arg(&manifest).assert().success();
    let written = std::fs::read_to_string(&manifest).unwrap();
    assert_eq!(written.lines().count(), 2);
    assert!(!written.contains("run7.sha256"));
}

#[test]
fn test_missing_folder_fails() {
    let tmp = tempfile::tempdir().unwrap();
    archash().arg(tmp.path().join("absent")).assert().failure();
}

#[test]
fn test_verbose_stdout_stays_a_manifest() {
    let tmp = fixture();
    let assert = archash()
        .arg("-v")
        .arg("--summary")
        .arg(tmp.path().join("run7"))
        .assert()
        .success()
        .stderr(predicate::str::contains("files hashed: 2"));
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    let manifest =
        common::manifest::parse(&stdout, "sums.txt", common::manifest::ManifestFormat::Text, None)
            .unwrap();
    assert_eq!(manifest.checksum("a.txt"), Some(HELLO_SHA));
    assert_eq!(manifest.checksum("sub/b.txt"), Some(WORLD_SHA));
    assert!(!stdout.contains("files hashed"));
}

#[test]
fn test_summary() {
    let tmp = fixture();
    let out = tmp.path().join("sums.txt");
    archash()
        .arg(tmp.path().join("run7"))
        .arg("-o")
        .arg(&out)
        .arg("--summary")
        .assert()
        .success()
        .stdout(predicate::str::contains("files hashed: 2"));
}
