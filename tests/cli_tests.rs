//! Command line behaviour, exercised through the real binary.

#![cfg(unix)]

use assert_cmd::Command;
use craftr::runner::NINJA_ENV;
use predicates::prelude::*;
use serial_test::serial;

fn project(script: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().expect("temp dir");
    std::fs::write(dir.path().join("build.craftr"), script).expect("write script");
    let root = dir.path().to_path_buf();
    (dir, root)
}

const HELLO: &str = concat!(
    "project: app\n",
    "targets:\n",
    "  hello:\n",
    "    type: generic.build\n",
    "    commands: [[touch, \"${@out}\"]]\n",
    "    outputs: [hello.txt]\n",
);

#[test]
fn configure_only_writes_graph_and_manifest() {
    let (_dir, root) = project(HELLO);
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(&root)
        .args(["--configure-only"])
        .assert()
        .success();
    assert!(root.join("build/.graph.json").exists());
    assert!(root.join("build/build.ninja").exists());
    assert!(root.join("build/.cache.json").exists());
}

#[test]
fn direct_backend_builds_outputs() {
    let (_dir, root) = project(HELLO);
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(&root)
        .args(["--backend", "direct"])
        .assert()
        .success();
    assert!(root.join("build/cells/app/hello.txt").exists());
}

#[test]
fn dump_graphviz_writes_dot_to_stdout() {
    let (_dir, root) = project(HELLO);
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(&root)
        .args(["--dump-graphviz"])
        .assert()
        .success()
        .stdout(predicate::str::contains("digraph craftr"))
        .stdout(predicate::str::contains("//app:hello#0"));
}

#[test]
fn missing_script_fails_with_code_one() {
    let dir = tempfile::tempdir().expect("temp dir");
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(dir.path())
        .args(["--configure-only"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn malformed_script_fails_with_code_one() {
    let (_dir, root) = project("project: [broken\n");
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(&root)
        .args(["--configure-only"])
        .assert()
        .failure()
        .code(1);
}

#[test]
fn failing_action_propagates_its_exit_code() {
    let (_dir, root) = project(concat!(
        "project: app\n",
        "targets:\n",
        "  boom:\n",
        "    type: generic.build\n",
        "    commands: [[sh, -c, \"exit 3\"]]\n",
    ));
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(&root)
        .args(["--backend", "direct"])
        .assert()
        .failure()
        .code(3);
}

#[test]
#[serial]
fn ninja_backend_invokes_the_resolved_ninja() {
    let (_dir, root) = project(HELLO);
    let (_ninja_dir, ninja_path) = test_support::fake_ninja(0);
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(&root)
        .env(NINJA_ENV, &ninja_path)
        .assert()
        .success();
    // The stub ran against the emitted manifest; configure artefacts exist.
    assert!(root.join("build/build.ninja").exists());
    assert!(root.join("build/.graph.json").exists());
}

#[test]
#[serial]
fn ninja_exit_codes_propagate_to_the_tool() {
    let (_dir, root) = project(HELLO);
    let (_ninja_dir, ninja_path) = test_support::fake_ninja(7);
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(&root)
        .env(NINJA_ENV, &ninja_path)
        .assert()
        .failure()
        .code(7);
}

#[test]
fn run_node_without_server_fails_cleanly() {
    let dir = tempfile::tempdir().expect("temp dir");
    Command::cargo_bin("craftr")
        .expect("binary")
        .current_dir(dir.path())
        .env_remove("CRAFTR_BUILD_SERVER")
        .args(["--run-node", "//app:hello#0^ffff"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("CRAFTR_BUILD_SERVER"));
}
