//! The flat build graph derived from translated targets.
//!
//! Nodes are decoupled from the in-memory target objects: a [`BuildNode`]
//! is a plain record that can be persisted to `.graph.json` and served to
//! build slaves without reloading the whole session. Node hashes are
//! SHA-256 digests over a canonical JSON serialisation, so semantically
//! equal nodes hash identically regardless of map key order.

use std::fs;
use std::io;
use std::time::SystemTime;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::model::Session;

/// Errors raised while building or persisting the graph.
#[derive(Debug, Error)]
pub enum GraphError {
    /// Two actions claim the same output file.
    #[error("output '{output}' is produced by both '{first}' and '{second}'")]
    DuplicateOutput {
        /// The contested file.
        output: Utf8PathBuf,
        /// First producer.
        first: String,
        /// Second producer.
        second: String,
    },
    /// Graph file I/O failed.
    #[error("failed to access '{path}': {source}")]
    Io {
        /// The graph file.
        path: Utf8PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// The graph file is not valid JSON.
    #[error("failed to parse '{path}': {source}")]
    Json {
        /// The graph file.
        path: Utf8PathBuf,
        /// Underlying error.
        source: serde_json::Error,
    },
    /// Hashing failed to serialise a node.
    #[error("failed to serialise node '{name}' for hashing: {source}")]
    Hash {
        /// The node.
        name: String,
        /// Underlying error.
        source: serde_json::Error,
    },
}

/// One action, flattened for persistence and execution.
///
/// Unknown keys are ignored on read; the key set is stable and additive.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BuildNode {
    /// `//cell:target#action`.
    pub name: String,
    /// Long names of nodes that must run first.
    #[serde(default)]
    pub deps: Vec<String>,
    /// Commands run sequentially within one invocation.
    pub commands: Vec<Vec<String>>,
    /// Declared input files.
    #[serde(default)]
    pub input_files: Vec<Utf8PathBuf>,
    /// Declared output files.
    #[serde(default)]
    pub output_files: Vec<Utf8PathBuf>,
    /// Outputs that may be absent after a successful run.
    #[serde(default)]
    pub optional_outputs: Vec<Utf8PathBuf>,
    /// Custom tag to input-file mapping, consulted by `${<tag}`.
    #[serde(default)]
    pub input_tags: IndexMap<String, Vec<Utf8PathBuf>>,
    /// Custom tag to output-file mapping, consulted by `${@tag}`.
    #[serde(default)]
    pub output_tags: IndexMap<String, Vec<Utf8PathBuf>>,
    /// Working directory.
    #[serde(default)]
    pub cwd: Option<Utf8PathBuf>,
    /// Environment overlay.
    #[serde(default)]
    pub environ: IndexMap<String, String>,
    /// One command instance per (input, output) pair.
    #[serde(default)]
    pub foreach: bool,
    /// Excluded from the default build.
    #[serde(default)]
    pub explicit: bool,
    /// Needs the console pool.
    #[serde(default)]
    pub console: bool,
    /// Attach stdio directly.
    #[serde(default)]
    pub syncio: bool,
    /// Extra arguments appended to the final command at run time.
    #[serde(default)]
    pub additional_args: Vec<String>,
}

impl BuildNode {
    /// The number of build sets: one per pair for foreach nodes, else one.
    #[must_use]
    pub fn build_sets(&self) -> usize {
        if self.foreach {
            self.input_files.len().max(1)
        } else {
            1
        }
    }

    /// Input files of build set `index`.
    #[must_use]
    pub fn inputs_for(&self, index: usize) -> Vec<Utf8PathBuf> {
        if self.foreach {
            self.input_files.get(index).cloned().into_iter().collect()
        } else {
            self.input_files.clone()
        }
    }

    /// Required output files of build set `index`.
    #[must_use]
    pub fn outputs_for(&self, index: usize) -> Vec<Utf8PathBuf> {
        if self.foreach {
            self.output_files.get(index).cloned().into_iter().collect()
        } else {
            self.output_files.clone()
        }
    }
}

/// Fields contributing to a node's identity hash.
///
/// Bookkeeping fields (`deps`, `explicit`, `additional_args`) are excluded:
/// they affect scheduling, not what the action does.
#[derive(Serialize)]
struct HashedFields<'a> {
    commands: &'a [Vec<String>],
    input_files: &'a [Utf8PathBuf],
    output_files: &'a [Utf8PathBuf],
    optional_outputs: &'a [Utf8PathBuf],
    environ: &'a IndexMap<String, String>,
    cwd: &'a Option<Utf8PathBuf>,
    foreach: bool,
    console: bool,
}

/// The complete set of build nodes, keyed by long name.
#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: IndexMap<String, BuildNode>,
}

impl BuildGraph {
    /// Assemble the graph from a translated session.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::DuplicateOutput`] when two actions claim the
    /// same output file.
    pub fn from_session(session: &Session) -> Result<Self, GraphError> {
        let mut graph = Self::default();
        let mut producers: IndexMap<Utf8PathBuf, String> = IndexMap::new();
        for id in session.target_ids() {
            let target = session.target(id);
            let target_long = target.long_name();
            for action in target.actions().values() {
                let name = action.long_name(&target_long);
                for output in &action.outputs {
                    if let Some(first) = producers.get(&output.path) {
                        return Err(GraphError::DuplicateOutput {
                            output: output.path.clone(),
                            first: first.clone(),
                            second: name.clone(),
                        });
                    }
                    producers.insert(output.path.clone(), name.clone());
                }
                // Tag maps stay split by direction so `${<tag}` can never
                // pick up an output file and vice versa.
                let mut input_tags: IndexMap<String, Vec<Utf8PathBuf>> = IndexMap::new();
                for file in &action.inputs {
                    for tag in &file.tags {
                        input_tags
                            .entry(tag.clone())
                            .or_default()
                            .push(file.path.clone());
                    }
                }
                let mut output_tags: IndexMap<String, Vec<Utf8PathBuf>> = IndexMap::new();
                for file in &action.outputs {
                    for tag in &file.tags {
                        if tag == "optional" {
                            continue;
                        }
                        output_tags
                            .entry(tag.clone())
                            .or_default()
                            .push(file.path.clone());
                    }
                }
                let node = BuildNode {
                    name: name.clone(),
                    deps: action.deps.clone(),
                    commands: action.commands.clone(),
                    input_files: action.inputs.iter().map(|f| f.path.clone()).collect(),
                    output_files: action
                        .outputs
                        .iter()
                        .filter(|f| !f.has_tag("optional"))
                        .map(|f| f.path.clone())
                        .collect(),
                    optional_outputs: action
                        .outputs
                        .iter()
                        .filter(|f| f.has_tag("optional"))
                        .map(|f| f.path.clone())
                        .collect(),
                    input_tags,
                    output_tags,
                    cwd: action.cwd.clone(),
                    environ: action.environ.clone(),
                    foreach: action.foreach,
                    explicit: action.explicit,
                    console: action.console,
                    syncio: action.syncio,
                    additional_args: action.additional_args.clone(),
                };
                graph.nodes.insert(name, node);
            }
        }
        Ok(graph)
    }

    /// All nodes, in insertion order.
    #[must_use]
    pub fn nodes(&self) -> &IndexMap<String, BuildNode> {
        &self.nodes
    }

    /// Look up a node by long name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BuildNode> {
        self.nodes.get(name)
    }

    /// Insert a node directly (used by tests and the loader).
    pub fn insert(&mut self, node: BuildNode) {
        self.nodes.insert(node.name.clone(), node);
    }

    /// The long names of all non-explicit nodes.
    #[must_use]
    pub fn default_nodes(&self) -> Vec<&BuildNode> {
        self.nodes.values().filter(|n| !n.explicit).collect()
    }

    /// The stable content hash of `node`.
    ///
    /// # Errors
    ///
    /// Fails only when serialisation fails, which indicates a bug.
    pub fn hash(node: &BuildNode) -> Result<String, GraphError> {
        let fields = HashedFields {
            commands: &node.commands,
            input_files: &node.input_files,
            output_files: &node.output_files,
            optional_outputs: &node.optional_outputs,
            environ: &node.environ,
            cwd: &node.cwd,
            foreach: node.foreach,
            console: node.console,
        };
        let canonical =
            serde_json_canonicalizer::to_string(&fields).map_err(|source| GraphError::Hash {
                name: node.name.clone(),
                source,
            })?;
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// The most recent modification time across `scripts`, used to detect
    /// stale manifests.
    #[must_use]
    pub fn mtime(scripts: &[Utf8PathBuf]) -> Option<SystemTime> {
        scripts
            .iter()
            .filter_map(|script| fs::metadata(script).ok()?.modified().ok())
            .max()
    }

    /// Read a graph file.
    ///
    /// # Errors
    ///
    /// Fails on I/O or parse errors.
    pub fn read(path: &Utf8Path) -> Result<Self, GraphError> {
        let text = fs::read_to_string(path).map_err(|source| GraphError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let nodes: Vec<BuildNode> =
            serde_json::from_str(&text).map_err(|source| GraphError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        let mut graph = Self::default();
        for node in nodes {
            graph.nodes.insert(node.name.clone(), node);
        }
        Ok(graph)
    }

    /// Write the graph file (a JSON array of node records).
    ///
    /// # Errors
    ///
    /// Fails on I/O or serialisation errors.
    pub fn write(&self, path: &Utf8Path) -> Result<(), GraphError> {
        let io_err = |source| GraphError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let nodes: Vec<&BuildNode> = self.nodes.values().collect();
        let text = serde_json::to_string(&nodes).map_err(|source| GraphError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, text).map_err(io_err)
    }

    /// Render the graph as GraphViz DOT.
    #[must_use]
    pub fn to_graphviz(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::from("digraph craftr {\n  graph [rankdir=LR];\n");
        for node in self.nodes.values() {
            let _ = writeln!(out, "  {:?};", node.name);
            for dep in &node.deps {
                let _ = writeln!(out, "  {:?} -> {:?};", dep, node.name);
            }
        }
        out.push_str("}\n");
        out
    }
}
