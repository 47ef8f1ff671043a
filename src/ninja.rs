//! Ninja backend: executable discovery and manifest emission.
//!
//! The emitted manifest re-invokes the current tool for every node
//! (`--run-node <name>^<hash>`), so Ninja schedules work while the build
//! slave retrieves the concrete command lists from the action server. The
//! node hash is embedded into the command string, which makes Ninja rerun
//! a node whenever its definition changes and lets the slave detect stale
//! manifests.

mod download;
mod writer;

use camino::{Utf8Path, Utf8PathBuf};
use itertools::Itertools;
use thiserror::Error;

use crate::graph::{BuildGraph, BuildNode, GraphError};
use crate::shell::{ProgramError, quote_for_ninja};

pub use download::{NINJA_MIN_VERSION, ensure_ninja};
pub use writer::NinjaWriter;

/// Errors raised by the Ninja backend.
#[derive(Debug, Error)]
pub enum NinjaError {
    /// Ninja is not installed and could not be downloaded.
    #[error("ninja not found: {0}")]
    Program(#[from] ProgramError),
    /// The installed ninja is too old.
    #[error("ninja >= {minimum} required, found {found}")]
    TooOld {
        /// Required minimum.
        minimum: &'static str,
        /// Version reported by `ninja --version`.
        found: String,
    },
    /// The pinned release download failed.
    #[error("failed to download ninja from {url}: {reason}")]
    Download {
        /// Release URL.
        url: String,
        /// Human readable cause.
        reason: String,
    },
    /// Running `ninja --version` failed.
    #[error("failed to run '{0} --version': {1}")]
    VersionProbe(Utf8PathBuf, std::io::Error),
    /// Hashing a node failed.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Manifest I/O failed.
    #[error("failed to write '{path}': {source}")]
    Io {
        /// Manifest path.
        path: Utf8PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
}

/// Column width used when wrapping manifest lines.
const MANIFEST_WIDTH: usize = 4096;

/// Collapse characters that are unsafe in rule names.
#[must_use]
pub fn rule_name(node_name: &str) -> String {
    let mut out = String::with_capacity(node_name.len());
    let mut last_was_safe = true;
    for ch in node_name.chars() {
        if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '_') {
            out.push(ch);
            last_was_safe = true;
        } else if last_was_safe {
            out.push('_');
            last_was_safe = false;
        }
    }
    out
}

/// Emit the Ninja manifest for `graph`.
///
/// `exe` is the tool binary the manifest re-invokes per node and
/// `build_directory` the root passed back to it.
///
/// # Errors
///
/// Fails when a node can not be hashed.
pub fn emit(
    graph: &BuildGraph,
    build_directory: &Utf8Path,
    exe: &Utf8Path,
) -> Result<String, NinjaError> {
    let mut writer = NinjaWriter::new(MANIFEST_WIDTH);
    writer.comment("This file was automatically generated by craftr.");
    writer.comment("It is not recommended to edit this file manually.");
    writer.newline();
    writer.variable("builddir", build_directory.as_str());
    writer.variable("build_set", "0");
    writer.newline();

    let mut defaults: Vec<String> = Vec::new();
    let mut names: Vec<&String> = graph.nodes().keys().collect();
    names.sort();
    for name in names {
        let Some(node) = graph.get(name) else {
            continue;
        };
        let phony = rule_name(name);
        let rule = format!("rule_{phony}");
        if !node.explicit {
            defaults.push(phony.clone());
        }
        let hash = BuildGraph::hash(node)?;
        let run_spec = format!("{name}^{hash}");
        let command_args = [
            exe.as_str(),
            "--build-directory",
            build_directory.as_str(),
            "--run-node",
            run_spec.as_str(),
            "--build-set",
            "$build_set",
        ]
        .iter()
        .map(|arg| quote_for_ninja(arg))
        .join(" ");
        let description = describe(node);
        let pool = node.console.then_some("console");
        writer.rule(&rule, &command_args, Some(&description), pool);

        let order_only: Vec<String> = node.deps.iter().map(|dep| rule_name(dep)).collect();
        if node.foreach {
            // Ninja can not express foreach natively: one build statement
            // per (input, output) pair, all sharing the rule.
            for index in 0..node.build_sets() {
                let outputs = paths_to_strings(&node.outputs_for(index));
                let inputs = paths_to_strings(&node.inputs_for(index));
                writer.build(
                    &outputs,
                    &rule,
                    &inputs,
                    &order_only,
                    &[("build_set".to_owned(), index.to_string())],
                );
            }
        } else {
            let mut outputs = paths_to_strings(&node.output_files);
            if outputs.is_empty() {
                outputs.push(phony.clone());
            }
            let inputs = paths_to_strings(&node.input_files);
            writer.build(&outputs, &rule, &inputs, &order_only, &[]);
        }
        if !node.output_files.is_empty() {
            let outputs = paths_to_strings(&node.output_files);
            writer.build(std::slice::from_ref(&phony), "phony", &outputs, &[], &[]);
        }
        writer.newline();
    }

    if !defaults.is_empty() {
        writer.default(&defaults);
    }
    Ok(writer.into_string())
}

/// Write `content` to the manifest path inside `build_directory`.
///
/// # Errors
///
/// Propagates I/O failures.
pub fn write_manifest(build_directory: &Utf8Path, content: &str) -> Result<Utf8PathBuf, NinjaError> {
    let path = build_directory.join("build.ninja");
    std::fs::create_dir_all(build_directory).map_err(|source| NinjaError::Io {
        path: path.clone(),
        source,
    })?;
    std::fs::write(&path, content).map_err(|source| NinjaError::Io {
        path: path.clone(),
        source,
    })?;
    Ok(path)
}

fn describe(node: &BuildNode) -> String {
    node.commands
        .iter()
        .map(|cmd| cmd.iter().map(|arg| crate::shell::quote(arg)).join(" "))
        .join(" && ")
}

fn paths_to_strings(paths: &[Utf8PathBuf]) -> Vec<String> {
    paths.iter().map(|p| p.as_str().to_owned()).collect()
}
