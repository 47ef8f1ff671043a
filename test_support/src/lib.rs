//! Test utilities shared by the integration suites.
//!
//! Provides helpers for creating fake executables and a lock serialising
//! environment mutations across tests.

pub mod env_lock;

use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tempfile::TempDir;

/// Create a fake executable shell script that exits with `exit_code`.
///
/// Returns the temporary directory and the path to the executable.
#[cfg(unix)]
pub fn fake_executable(name: &str, exit_code: i32) -> (TempDir, PathBuf) {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join(name);
    let mut file = File::create(&path).expect("script");
    writeln!(file, "#!/bin/sh\nexit {exit_code}").expect("write script");
    drop(file);
    make_executable(&path);
    (dir, path)
}

/// Create a fake Ninja executable that exits with `exit_code`.
#[cfg(unix)]
pub fn fake_ninja(exit_code: i32) -> (TempDir, PathBuf) {
    fake_executable("ninja", exit_code)
}

#[cfg(unix)]
fn make_executable(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path).expect("meta").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("perms");
}
