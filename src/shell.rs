//! Shell helpers: argv splitting, platform quoting, environment overrides
//! and program lookup.
//!
//! Quoting for shells and quoting for Ninja manifests are deliberately two
//! separate functions with explicit semantics. On Windows the quoting uses
//! double quotes, since single quotes confuse `CMD.EXE`.

use std::env;
use std::ffi::OsString;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use thiserror::Error;

/// Errors from [`find_program`].
#[derive(Debug, Error)]
pub enum ProgramError {
    /// No candidate with the given name exists on `PATH`.
    #[error("program '{0}' could not be found on PATH")]
    NotFound(String),
    /// A candidate exists but lacks the executable bit.
    #[error("program '{0}' exists but is not executable")]
    NotExecutable(Utf8PathBuf),
}

/// Split a command string into argv elements.
///
/// Uses POSIX shell rules everywhere except Windows, where quotes are kept
/// literal because the tokens are handed to `CMD.EXE` unchanged.
#[must_use]
pub fn split(s: &str) -> Option<Vec<String>> {
    if cfg!(windows) {
        Some(split_keep_quotes(s))
    } else {
        shlex::split(s)
    }
}

/// Whitespace tokenizer that groups on double quotes but keeps them in the
/// token.
fn split_keep_quotes(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in s.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Quote a single argument for the platform shell.
#[must_use]
pub fn quote(s: &str) -> String {
    if cfg!(windows) {
        quote_windows(s)
    } else {
        quote_sh(s)
    }
}

fn quote_sh(s: &str) -> String {
    // A leading '#' would start a comment, but mid-word it is literal.
    if !s.is_empty()
        && !s.starts_with('#')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-+=:,./@%^#".contains(c))
    {
        return s.to_owned();
    }
    use shell_quote::{QuoteRefExt, Sh};
    let bytes: Vec<u8> = s.quoted(Sh);
    String::from_utf8_lossy(&bytes).into_owned()
}

fn quote_windows(s: &str) -> String {
    let escaped = s.replace('"', "\\\"");
    if escaped.chars().any(char::is_whitespace) || escaped.contains(['<', '>', '&', '|', '^']) {
        format!("\"{escaped}\"")
    } else {
        escaped
    }
}

/// Quote an argument for embedding into a Ninja manifest command.
///
/// Like [`quote`], but single-quoted `$var` references are unwrapped again
/// so Ninja still expands them instead of passing a literal `$var` through
/// the shell.
#[must_use]
pub fn quote_for_ninja(s: &str) -> String {
    unwrap_quoted_variables(&quote(s))
}

/// Rewrite every `'$word'` occurrence to `$word`.
fn unwrap_quoted_variables(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;
    while i < chars.len() {
        if chars.get(i) == Some(&'\'') && chars.get(i + 1) == Some(&'$') {
            let mut j = i + 2;
            while matches!(chars.get(j), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
                j += 1;
            }
            if j > i + 2 && chars.get(j) == Some(&'\'') {
                out.extend(chars.get(i + 1..j).unwrap_or(&[]));
                i = j + 1;
                continue;
            }
        }
        if let Some(c) = chars.get(i) {
            out.push(*c);
        }
        i += 1;
    }
    out
}

/// Wrap an argv into an invocation of the system shell.
#[must_use]
pub fn shellify(argv: &[String]) -> Vec<String> {
    let joined = argv.iter().map(|a| quote(a)).collect::<Vec<_>>().join(" ");
    if cfg!(windows) {
        vec!["cmd".into(), "/c".into(), joined]
    } else {
        let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into());
        vec![shell, "-c".into(), joined]
    }
}

/// Scoped environment override; the previous values are restored on drop.
#[derive(Debug)]
pub struct EnvOverride {
    saved: Vec<(String, Option<OsString>)>,
}

impl EnvOverride {
    /// Apply `vars` to the process environment, remembering prior values.
    #[must_use]
    pub fn apply<'a, I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut saved = Vec::new();
        for (key, value) in vars {
            saved.push((key.to_owned(), env::var_os(key)));
            // Only used on the single-threaded configure path.
            unsafe { env::set_var(key, value) };
        }
        Self { saved }
    }
}

impl Drop for EnvOverride {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..) {
            match value {
                Some(old) => unsafe { env::set_var(&key, old) },
                None => unsafe { env::remove_var(&key) },
            }
        }
    }
}

/// Locate an executable by name.
///
/// Names containing a path separator are checked directly. Otherwise each
/// `PATH` entry is scanned; on Windows the `PATHEXT` extensions are tried
/// as well. A match that exists but is not executable yields
/// [`ProgramError::NotExecutable`] so the caller can distinguish the two
/// failure modes.
///
/// # Errors
///
/// See [`ProgramError`].
pub fn find_program(name: &str) -> Result<Utf8PathBuf, ProgramError> {
    if name.contains('/') || (cfg!(windows) && name.contains('\\')) {
        let path = Utf8PathBuf::from(name);
        return check_candidate(&path).ok_or(ProgramError::NotExecutable(path));
    }
    let search_path = env::var("PATH").unwrap_or_default();
    let mut found_non_executable = None;
    for dir in env::split_paths(&search_path) {
        let Ok(dir) = Utf8PathBuf::from_path_buf(dir) else {
            continue;
        };
        for candidate in candidate_names(name) {
            let full = dir.join(&candidate);
            if !full.is_file() {
                continue;
            }
            if let Some(hit) = check_candidate(&full) {
                return Ok(hit);
            }
            found_non_executable.get_or_insert(full);
        }
    }
    match found_non_executable {
        Some(path) => Err(ProgramError::NotExecutable(path)),
        None => Err(ProgramError::NotFound(name.to_owned())),
    }
}

fn candidate_names(name: &str) -> Vec<String> {
    if cfg!(windows) {
        let pathext = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".into());
        let mut names: Vec<String> = pathext
            .split(';')
            .filter(|ext| !ext.is_empty())
            .map(|ext| format!("{name}{}", ext.to_lowercase()))
            .collect();
        names.insert(0, name.to_owned());
        names
    } else {
        vec![name.to_owned()]
    }
}

fn check_candidate(path: &Utf8Path) -> Option<Utf8PathBuf> {
    let meta = path.metadata().ok()?;
    if !meta.is_file() {
        return None;
    }
    if is_executable(&meta) {
        Some(path.to_path_buf())
    } else {
        None
    }
}

#[cfg(unix)]
fn is_executable(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_meta: &std::fs::Metadata) -> bool {
    true
}

/// Map a spawn error to the conventional exit code.
#[must_use]
pub fn spawn_error_code(err: &io::Error) -> i32 {
    if err.kind() == io::ErrorKind::NotFound {
        127
    } else {
        1
    }
}
