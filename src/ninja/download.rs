//! Ninja executable discovery and pinned-release download.

use std::io::Read;
use std::process::Command;

use camino::{Utf8Path, Utf8PathBuf};
use semver::Version;

use crate::shell::{ProgramError, find_program};

use super::NinjaError;

/// Minimum Ninja version the emitted manifests rely on.
pub const NINJA_MIN_VERSION: &str = "1.7.1";

/// Release downloaded when no usable Ninja is installed.
const NINJA_RELEASE: &str = "1.8.2";

const DOWNLOAD_LIMIT: u64 = 32 * 1024 * 1024;

fn ninja_file_name() -> &'static str {
    if cfg!(windows) { "ninja.exe" } else { "ninja" }
}

fn release_url() -> String {
    let platform = if cfg!(windows) {
        "win"
    } else if cfg!(target_os = "macos") {
        "mac"
    } else {
        "linux"
    };
    format!(
        "https://github.com/ninja-build/ninja/releases/download/v{NINJA_RELEASE}/ninja-{platform}.zip"
    )
}

/// Locate a usable Ninja executable.
///
/// Resolution order: the `CRAFTR_NINJA` environment override, a previously
/// downloaded copy in the build directory, then `PATH`. Each candidate must
/// report at least [`NINJA_MIN_VERSION`]. With `download` set, a missing or
/// outdated installation triggers a download of the pinned release into the
/// build directory.
///
/// # Errors
///
/// Fails when no candidate is usable and downloading is disabled or fails.
pub fn ensure_ninja(build_directory: &Utf8Path, download: bool) -> Result<Utf8PathBuf, NinjaError> {
    if let Ok(override_path) = std::env::var(ninja_env::NINJA_ENV) {
        return Ok(Utf8PathBuf::from(override_path));
    }

    let local = build_directory.join(ninja_file_name());
    if local.is_file() {
        return Ok(local);
    }

    match find_program("ninja") {
        Ok(path) => {
            let version = probe_version(&path)?;
            if version_ok(&version) {
                tracing::debug!(ninja = %path, version = %version, "using installed ninja");
                return Ok(path);
            }
            if !download {
                return Err(NinjaError::TooOld {
                    minimum: NINJA_MIN_VERSION,
                    found: version,
                });
            }
        }
        Err(err @ ProgramError::NotExecutable(_)) => return Err(err.into()),
        Err(ProgramError::NotFound(_)) if download => {}
        Err(err) => return Err(err.into()),
    }

    download_release(&local)?;
    Ok(local)
}

/// Run `ninja --version` and return the reported version string.
///
/// # Errors
///
/// Fails when the process can not be spawned.
pub fn probe_version(ninja: &Utf8Path) -> Result<String, NinjaError> {
    let output = Command::new(ninja)
        .arg("--version")
        .output()
        .map_err(|err| NinjaError::VersionProbe(ninja.to_path_buf(), err))?;
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

fn version_ok(version: &str) -> bool {
    // Release builds report plain versions; git builds append a suffix such
    // as "1.8.2.git". Keep the leading three numeric components.
    let numeric: String = version
        .split('.')
        .take(3)
        .filter(|part| part.chars().all(|c| c.is_ascii_digit()))
        .collect::<Vec<_>>()
        .join(".");
    let Ok(found) = Version::parse(&numeric) else {
        return false;
    };
    let Ok(minimum) = Version::parse(NINJA_MIN_VERSION) else {
        return false;
    };
    found >= minimum
}

fn download_release(destination: &Utf8Path) -> Result<(), NinjaError> {
    let url = release_url();
    tracing::info!(url = %url, "downloading ninja");
    // A failed download is retried once before giving up.
    let bytes = match fetch(&url) {
        Ok(bytes) => bytes,
        Err(first) => {
            tracing::warn!(url = %url, error = %first, "ninja download failed, retrying");
            fetch(&url).map_err(|reason| NinjaError::Download {
                url: url.clone(),
                reason,
            })?
        }
    };
    extract(&url, &bytes, destination)
}

fn fetch(url: &str) -> Result<Vec<u8>, String> {
    let parsed = url::Url::parse(url).map_err(|err| err.to_string())?;
    let response = ureq::get(parsed.as_str())
        .call()
        .map_err(|err| err.to_string())?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(DOWNLOAD_LIMIT)
        .read_to_end(&mut bytes)
        .map_err(|err| err.to_string())?;
    Ok(bytes)
}

fn extract(url: &str, bytes: &[u8], destination: &Utf8Path) -> Result<(), NinjaError> {
    let failure = |reason: String| NinjaError::Download {
        url: url.to_owned(),
        reason,
    };
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor).map_err(|err| failure(err.to_string()))?;
    let mut file = archive
        .by_name(ninja_file_name())
        .map_err(|err| failure(err.to_string()))?;
    if let Some(parent) = destination.parent() {
        std::fs::create_dir_all(parent).map_err(|err| failure(err.to_string()))?;
    }
    let mut out = std::fs::File::create(destination).map_err(|err| failure(err.to_string()))?;
    std::io::copy(&mut file, &mut out).map_err(|err| failure(err.to_string()))?;
    drop(out);
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        std::fs::set_permissions(destination, perms).map_err(|err| failure(err.to_string()))?;
    }
    Ok(())
}
