//! Path utilities used throughout the build pipeline.
//!
//! All paths are UTF-8 ([`Utf8Path`]/[`Utf8PathBuf`]) and normalisation is
//! purely lexical: symlinks are preserved so that build commands see the
//! paths the user wrote. Filesystem helpers (`makedirs`, `remove`,
//! [`glob`]) live here as well so callers do not reach for `std::fs`
//! directly.

use std::fs;
use std::io;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Errors raised by the pure path operations.
#[derive(Debug, Error)]
pub enum PathError {
    /// A file passed to [`move_files`] does not live under the old base.
    #[error("path '{path}' is not inside '{base}'")]
    NotASubpath {
        /// The offending path.
        path: Utf8PathBuf,
        /// The base it was expected to live under.
        base: Utf8PathBuf,
    },
    /// [`commonpath`] was called with an empty list.
    #[error("commonpath() requires at least one path")]
    EmptyPathList,
    /// [`commonpath`] was called with a mix of absolute and relative paths.
    #[error("commonpath() can not mix absolute and relative paths")]
    MixedPathKinds,
}

/// Errors raised by [`glob`].
#[derive(Debug, Error)]
pub enum GlobError {
    /// A pattern failed to compile.
    #[error("invalid glob pattern '{pattern}': {source}")]
    Pattern {
        /// The offending pattern.
        pattern: String,
        /// The underlying parse error.
        source: glob::PatternError,
    },
    /// Directory traversal failed.
    #[error("glob I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Lexically normalise a path, resolving `.` and `..` components without
/// touching the filesystem.
#[must_use]
pub fn norm(path: &Utf8Path) -> Utf8PathBuf {
    let mut out: Vec<Utf8Component<'_>> = Vec::new();
    for comp in path.components() {
        match comp {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => match out.last() {
                Some(Utf8Component::Normal(_)) => {
                    out.pop();
                }
                Some(Utf8Component::RootDir | Utf8Component::Prefix(_)) => {}
                _ => out.push(comp),
            },
            other => out.push(other),
        }
    }
    let joined: Utf8PathBuf = out.iter().map(Utf8Component::as_str).collect();
    if joined.as_str().is_empty() {
        Utf8PathBuf::from(".")
    } else {
        joined
    }
}

/// Make `path` absolute relative to `parent` (or the working directory) and
/// normalise it lexically. Symlinks are preserved.
#[must_use]
pub fn canonical(path: &Utf8Path, parent: Option<&Utf8Path>) -> Utf8PathBuf {
    if path.is_absolute() {
        return norm(path);
    }
    let base = parent.map_or_else(current_dir, Utf8Path::to_path_buf);
    norm(&base.join(path))
}

/// The current working directory as a UTF-8 path.
///
/// Falls back to `.` when the working directory is unreadable or not UTF-8;
/// every later filesystem access will surface the real error.
#[must_use]
pub fn current_dir() -> Utf8PathBuf {
    std::env::current_dir()
        .ok()
        .and_then(|p| Utf8PathBuf::from_path_buf(p).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("."))
}

/// Compute `path` relative to `base`.
///
/// Both paths are made absolute first. With `nopar` set, a result that
/// would escape `base` through `..` components is returned as the absolute
/// path instead.
#[must_use]
pub fn rel(path: &Utf8Path, base: &Utf8Path, nopar: bool) -> Utf8PathBuf {
    let path = canonical(path, None);
    let base = canonical(base, None);
    if let Ok(stripped) = path.strip_prefix(&base) {
        let s = stripped.as_str();
        return if s.is_empty() {
            Utf8PathBuf::from(".")
        } else {
            stripped.to_path_buf()
        };
    }
    let path_comps: Vec<&str> = path.components().map(|c| c.as_str()).collect();
    let base_comps: Vec<&str> = base.components().map(|c| c.as_str()).collect();
    let common = path_comps
        .iter()
        .zip(&base_comps)
        .take_while(|(a, b)| *a == *b)
        .count();
    if common == 0 {
        // Different roots (e.g. drive letters); no relative form exists.
        return path;
    }
    if nopar {
        return path;
    }
    let mut out = Utf8PathBuf::new();
    for _ in common..base_comps.len() {
        out.push("..");
    }
    for comp in &path_comps[common..] {
        out.push(comp);
    }
    out
}

/// Prefix the basename of `path` with `prefix`.
#[must_use]
pub fn addprefix(path: &Utf8Path, prefix: &str) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("");
    path.parent()
        .map_or_else(Utf8PathBuf::new, Utf8Path::to_path_buf)
        .join(format!("{prefix}{name}"))
}

/// Append `suffix` to the basename of `path`.
#[must_use]
pub fn addsuffix(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("");
    path.parent()
        .map_or_else(Utf8PathBuf::new, Utf8Path::to_path_buf)
        .join(format!("{name}{suffix}"))
}

/// Replace the extension of `path`'s basename with `suffix`.
///
/// The suffix may be given with or without a leading dot; an empty suffix
/// removes the extension.
#[must_use]
pub fn setsuffix(path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let stripped = rmvsuffix(path);
    if suffix.is_empty() {
        return stripped;
    }
    if suffix.starts_with('.') {
        addsuffix(&stripped, suffix)
    } else {
        addsuffix(&stripped, &format!(".{suffix}"))
    }
}

/// Remove the extension from `path`'s basename.
#[must_use]
pub fn rmvsuffix(path: &Utf8Path) -> Utf8PathBuf {
    let name = path.file_name().unwrap_or("");
    let stem = name.rfind('.').filter(|&i| i > 0).map_or(name, |i| {
        name.get(..i).unwrap_or(name)
    });
    path.parent()
        .map_or_else(Utf8PathBuf::new, Utf8Path::to_path_buf)
        .join(stem)
}

/// Relocate `files` from `oldbase` into `newbase`, keeping their relative
/// structure.
///
/// # Errors
///
/// Returns [`PathError::NotASubpath`] when any file lies outside `oldbase`.
pub fn move_files(
    files: &[Utf8PathBuf],
    oldbase: &Utf8Path,
    newbase: &Utf8Path,
) -> Result<Vec<Utf8PathBuf>, PathError> {
    files
        .iter()
        .map(|file| {
            let relative = rel(file, oldbase, false);
            if relative.starts_with("..") || relative.is_absolute() {
                return Err(PathError::NotASubpath {
                    path: file.clone(),
                    base: oldbase.to_path_buf(),
                });
            }
            Ok(newbase.join(relative))
        })
        .collect()
}

/// The longest common ancestor of `paths`.
///
/// # Errors
///
/// Returns [`PathError::EmptyPathList`] for an empty input and
/// [`PathError::MixedPathKinds`] when absolute and relative paths are mixed.
pub fn commonpath(paths: &[Utf8PathBuf]) -> Result<Utf8PathBuf, PathError> {
    let first = paths.first().ok_or(PathError::EmptyPathList)?;
    if paths.iter().any(|p| p.is_absolute() != first.is_absolute()) {
        return Err(PathError::MixedPathKinds);
    }
    let mut shared: Vec<String> = norm(first)
        .components()
        .map(|c| c.as_str().to_owned())
        .collect();
    for path in paths.get(1..).unwrap_or(&[]) {
        let comps: Vec<String> = norm(path)
            .components()
            .map(|c| c.as_str().to_owned())
            .collect();
        let keep = shared
            .iter()
            .zip(&comps)
            .take_while(|(a, b)| *a == *b)
            .count();
        shared.truncate(keep);
    }
    Ok(shared.iter().map(String::as_str).collect())
}

/// Create `path` and all missing parents. Existing directories are fine.
///
/// # Errors
///
/// Propagates the underlying I/O error.
pub fn makedirs(path: &Utf8Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

/// Remove a file or directory.
///
/// Directories require `recursive`. With `silent`, a missing path is not an
/// error.
///
/// # Errors
///
/// Propagates the underlying I/O error.
pub fn remove(path: &Utf8Path, recursive: bool, silent: bool) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => {
            if recursive {
                fs::remove_dir_all(path)
            } else {
                fs::remove_dir(path)
            }
        }
        Ok(_) => fs::remove_file(path),
        Err(err) => Err(err),
    };
    match result {
        Err(err) if silent && err.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Expand glob `patterns` relative to `parent` by walking the tree once.
///
/// Recursive `**` patterns are supported. Matches for any pattern in
/// `excludes` are dropped. Dotfiles only match a literal leading dot unless
/// `include_dotfiles` is set. The result is sorted and free of duplicates.
///
/// # Errors
///
/// Returns [`GlobError::Pattern`] for malformed patterns and
/// [`GlobError::Io`] when the walk fails.
pub fn glob(
    patterns: &[String],
    parent: &Utf8Path,
    excludes: &[String],
    include_dotfiles: bool,
) -> Result<Vec<Utf8PathBuf>, GlobError> {
    let options = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: !include_dotfiles,
    };
    let compile = |pattern: &String| {
        let anchored = if Utf8Path::new(pattern).is_absolute() {
            pattern.clone()
        } else {
            parent.join(pattern.as_str()).into_string()
        };
        glob::Pattern::new(&anchored).map_err(|source| GlobError::Pattern {
            pattern: pattern.clone(),
            source,
        })
    };
    let includes: Vec<glob::Pattern> = patterns.iter().map(compile).collect::<Result<_, _>>()?;
    let exclude_patterns: Vec<glob::Pattern> =
        excludes.iter().map(compile).collect::<Result<_, _>>()?;

    let mut results: Vec<Utf8PathBuf> = Vec::new();
    for entry in walkdir::WalkDir::new(parent).follow_links(false) {
        let entry = entry.map_err(|err| {
            GlobError::Io(
                err.into_io_error()
                    .unwrap_or_else(|| io::Error::other("directory walk failed")),
            )
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(path) = Utf8PathBuf::from_path_buf(entry.into_path()) else {
            continue;
        };
        let matched = includes
            .iter()
            .any(|p| p.matches_with(path.as_str(), options));
        let excluded = exclude_patterns
            .iter()
            .any(|p| p.matches_with(path.as_str(), options));
        if matched && !excluded {
            results.push(path);
        }
    }
    results.sort();
    results.dedup();
    Ok(results)
}

/// Create a named temporary file whose deletion is deferred until the
/// returned handle is dropped.
///
/// # Errors
///
/// Propagates the underlying I/O error.
pub fn scoped_tempfile(
    dir: Option<&Utf8Path>,
    suffix: &str,
) -> io::Result<tempfile::NamedTempFile> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("craftr-").suffix(suffix);
    match dir {
        Some(dir) => builder.tempfile_in(dir),
        None => builder.tempfile(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn p(s: &str) -> Utf8PathBuf {
        Utf8PathBuf::from(s)
    }

    #[rstest]
    #[case("/a/b/../c", "/a/c")]
    #[case("/a/./b", "/a/b")]
    #[case("a/../../b", "../b")]
    #[case("/..", "/")]
    #[case(".", ".")]
    fn norm_resolves_dots(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(norm(Utf8Path::new(input)), p(expected));
    }

    #[test]
    fn canonical_is_idempotent() {
        let once = canonical(Utf8Path::new("x/./y/../z"), Some(Utf8Path::new("/base")));
        let twice = canonical(&once, Some(Utf8Path::new("/base")));
        assert_eq!(once, twice);
        assert_eq!(once, p("/base/x/z"));
    }

    #[test]
    fn rel_inverts_join_for_inner_paths() {
        let base = p("/base/dir");
        let joined = base.join("sub/file.c");
        assert_eq!(rel(&joined, &base, false), p("sub/file.c"));
    }

    #[test]
    fn rel_escaping_with_nopar_returns_absolute() {
        let result = rel(Utf8Path::new("/other/file"), Utf8Path::new("/base"), true);
        assert_eq!(result, p("/other/file"));
    }

    #[test]
    fn rel_escaping_without_nopar_uses_parent_components() {
        let result = rel(Utf8Path::new("/other/file"), Utf8Path::new("/base"), false);
        assert_eq!(result, p("../other/file"));
    }

    #[rstest]
    #[case("dir/main.c", "dir/main.o")]
    #[case("dir/main", "dir/main.o")]
    #[case("dir/a.b.c", "dir/a.b.o")]
    fn setsuffix_replaces_extension(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(setsuffix(Utf8Path::new(input), ".o"), p(expected));
    }

    #[test]
    fn setsuffix_matches_rmvsuffix_plus_addsuffix() {
        let path = Utf8Path::new("dir/name.txt");
        let via_parts = addsuffix(&rmvsuffix(path), ".bin");
        assert_eq!(setsuffix(path, ".bin"), via_parts);
    }

    #[test]
    fn rmvsuffix_keeps_leading_dot_names() {
        assert_eq!(rmvsuffix(Utf8Path::new("dir/.hidden")), p("dir/.hidden"));
    }

    #[test]
    fn addprefix_touches_basename_only() {
        assert_eq!(addprefix(Utf8Path::new("a/b/foo"), "lib"), p("a/b/libfoo"));
    }

    #[test]
    fn move_files_relocates_under_new_base() {
        let files = vec![p("/src/a/x.c"), p("/src/y.c")];
        let moved = move_files(&files, Utf8Path::new("/src"), Utf8Path::new("/out"))
            .expect("all files inside base");
        assert_eq!(moved, vec![p("/out/a/x.c"), p("/out/y.c")]);
    }

    #[test]
    fn move_files_rejects_outside_files() {
        let files = vec![p("/elsewhere/x.c")];
        let err = move_files(&files, Utf8Path::new("/src"), Utf8Path::new("/out"))
            .expect_err("file escapes the old base");
        assert!(matches!(err, PathError::NotASubpath { .. }));
    }

    #[test]
    fn commonpath_finds_shared_ancestor() {
        let paths = vec![p("/a/b/c"), p("/a/b/d/e"), p("/a/b")];
        assert_eq!(commonpath(&paths).expect("common ancestor"), p("/a/b"));
    }

    #[test]
    fn commonpath_rejects_empty_and_mixed() {
        assert!(matches!(commonpath(&[]), Err(PathError::EmptyPathList)));
        let mixed = vec![p("/abs"), p("relative")];
        assert!(matches!(commonpath(&mixed), Err(PathError::MixedPathKinds)));
    }

    #[test]
    fn glob_expands_recursive_patterns() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 temp dir");
        makedirs(&root.join("sub/deep")).expect("mkdir");
        std::fs::write(root.join("a.c"), "").expect("write");
        std::fs::write(root.join("sub/b.c"), "").expect("write");
        std::fs::write(root.join("sub/deep/c.c"), "").expect("write");
        std::fs::write(root.join("sub/skip.h"), "").expect("write");

        let matches = glob(&["**/*.c".into()], &root, &["**/b.c".into()], false)
            .expect("valid patterns");
        let names: Vec<_> = matches
            .iter()
            .map(|m| rel(m, &root, false).into_string())
            .collect();
        assert_eq!(names, vec!["a.c", "sub/deep/c.c"]);
    }
}
