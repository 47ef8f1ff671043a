//! Build script loading.
//!
//! A `build.craftr` file is a YAML document declaring one cell and its
//! targets. Imports pull in the scripts of dependency packages, each into
//! its own cell, so cross-cell references like `//lib:foo` resolve.
//!
//! Loading happens in two passes per script: all targets are created
//! first, then dependencies are wired up, which allows forward references
//! within one file.

use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use semver::Version;
use serde::Deserialize;
use thiserror::Error;

use crate::model::{
    ConfigValue, FactoryRegistry, ModelError, Session, TargetArgs, TargetId, TargetRef, declare,
};
use crate::pathutil;

/// Default build script file name.
pub const DEFAULT_SCRIPT: &str = "build.craftr";

/// Errors raised while loading build scripts.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// The script file could not be read.
    #[error("failed to read '{path}': {source}")]
    Io {
        /// Script path.
        path: Utf8PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The script is not valid YAML or violates the schema.
    #[error("failed to parse '{path}': {message}")]
    Parse {
        /// Script path.
        path: Utf8PathBuf,
        /// Parser diagnostics.
        message: String,
    },
    /// Target construction failed.
    #[error("{path}: {source}")]
    Model {
        /// Script path.
        path: Utf8PathBuf,
        /// Underlying error.
        source: ModelError,
    },
}

/// A string or a list of strings, as both are accepted in dependency and
/// file lists.
#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum StringOrList {
    /// Field was omitted.
    #[default]
    Empty,
    /// A single entry.
    String(String),
    /// Multiple entries.
    List(Vec<String>),
}

impl StringOrList {
    /// Flatten into a vector.
    #[must_use]
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::Empty => Vec::new(),
            Self::String(s) => vec![s.clone()],
            Self::List(v) => v.clone(),
        }
    }
}

/// The root document of a build script.
#[derive(Debug, Deserialize)]
pub struct BuildScript {
    /// Cell name.
    pub project: String,
    /// Cell version.
    #[serde(default = "default_version")]
    pub version: Version,
    /// Session configuration defaults.
    #[serde(default)]
    pub config: IndexMap<String, ConfigValue>,
    /// Directories (or script files) of dependency packages.
    #[serde(default)]
    pub imports: Vec<String>,
    /// Targets, keyed by name.
    #[serde(default)]
    pub targets: IndexMap<String, TargetEntry>,
}

/// One target declaration.
#[derive(Debug, Deserialize)]
pub struct TargetEntry {
    /// Factory kind, e.g. `cxx.binary`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Dependency references.
    #[serde(default)]
    pub deps: StringOrList,
    /// Skip from the default build.
    #[serde(default)]
    pub explicit: bool,
    /// Needs a TTY.
    #[serde(default)]
    pub console: bool,
    /// Optional parent target.
    #[serde(default)]
    pub parent: Option<String>,
    /// Remaining keys become trait options.
    #[serde(flatten)]
    pub options: IndexMap<String, serde_json::Value>,
}

fn default_version() -> Version {
    Version::new(1, 0, 0)
}

/// Parse a build script from text.
///
/// # Errors
///
/// Returns [`ScriptError::Parse`] with the parser diagnostics.
pub fn parse(path: &Utf8Path, text: &str) -> Result<BuildScript, ScriptError> {
    serde_saphyr::from_str(text).map_err(|err| ScriptError::Parse {
        path: path.to_path_buf(),
        message: err.to_string(),
    })
}

/// Load `path` and its imports into `session`.
///
/// Returns the name of the cell declared by the entry script.
///
/// # Errors
///
/// See [`ScriptError`].
pub fn load(
    session: &mut Session,
    registry: &FactoryRegistry,
    path: &Utf8Path,
) -> Result<String, ScriptError> {
    let mut loaded: HashMap<Utf8PathBuf, String> = HashMap::new();
    load_inner(session, registry, path, &mut loaded)
}

fn load_inner(
    session: &mut Session,
    registry: &FactoryRegistry,
    path: &Utf8Path,
    loaded: &mut HashMap<Utf8PathBuf, String>,
) -> Result<String, ScriptError> {
    let path = resolve_script_path(path);
    if let Some(cell) = loaded.get(&path) {
        return Ok(cell.clone());
    }

    let text = fs::read_to_string(&path).map_err(|source| ScriptError::Io {
        path: path.clone(),
        source,
    })?;
    let script = parse(&path, &text)?;
    let directory = path
        .parent()
        .map_or_else(pathutil::current_dir, Utf8Path::to_path_buf);
    tracing::debug!(script = %path, cell = %script.project, "loading build script");
    session.add_script(path.clone());
    loaded.insert(path.clone(), script.project.clone());

    // Imports first, so cross-cell references resolve during wiring.
    for import in &script.imports {
        let child = pathutil::canonical(Utf8Path::new(import), Some(&directory));
        load_inner(session, registry, &child, loaded)?;
    }

    for (key, value) in &script.config {
        session.default_config(key, value.clone());
    }

    let cell = script.project.clone();
    session.get_or_create_cell(&cell, script.version.clone(), directory);

    let model_err = |source| ScriptError::Model {
        path: path.clone(),
        source,
    };

    // Pass one: create every target so forward references work.
    let mut created: Vec<(TargetId, &TargetEntry)> = Vec::new();
    for (name, entry) in &script.targets {
        let factory = registry.get(&entry.kind).map_err(model_err)?;
        let args = TargetArgs {
            name: name.clone(),
            parent: entry
                .parent
                .as_deref()
                .map(str::parse)
                .transpose()
                .map_err(model_err)?,
            deps: Vec::new(),
            explicit: entry.explicit,
            console: entry.console,
            props: entry.options.clone(),
        };
        let id = declare(session, factory, &cell, args).map_err(model_err)?;
        created.push((id, entry));
    }

    // Pass two: resolve and partition dependencies.
    for (id, entry) in created {
        let factory = registry.get(&entry.kind).map_err(model_err)?;
        let mut deps = Vec::new();
        for reference in entry.deps.to_vec() {
            let parsed: TargetRef = reference.parse().map_err(model_err)?;
            deps.push(session.resolve_ref(&parsed, Some(&cell)).map_err(model_err)?);
        }
        let (internal, transitive) = factory.partition_deps(deps);
        session.set_deps(id, internal, transitive).map_err(model_err)?;
    }

    Ok(cell)
}

/// Accept either a script file or a directory containing one.
fn resolve_script_path(path: &Utf8Path) -> Utf8PathBuf {
    let absolute = pathutil::canonical(path, None);
    if absolute.is_dir() {
        absolute.join(DEFAULT_SCRIPT)
    } else {
        absolute
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang;

    fn write_script(dir: &Utf8Path, name: &str, text: &str) -> Utf8PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).expect("write script");
        path
    }

    fn fresh_session() -> (Session, FactoryRegistry) {
        let mut session = Session::new("/build");
        let mut registry = FactoryRegistry::default();
        lang::register(&mut session, &mut registry).expect("register");
        (session, registry)
    }

    #[test]
    fn loads_targets_with_forward_references() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let script = write_script(
            &root,
            DEFAULT_SCRIPT,
            concat!(
                "project: app\n",
                "targets:\n",
                "  main:\n",
                "    type: cxx.binary\n",
                "    srcs: [main.c]\n",
                "    deps: [\":helper\"]\n",
                "  helper:\n",
                "    type: cxx.library\n",
                "    srcs: [helper.c]\n",
            ),
        );
        let (mut session, registry) = fresh_session();
        let cell = load(&mut session, &registry, &script).expect("load");
        assert_eq!(cell, "app");

        let main = session
            .resolve_ref(&"//app:main".parse().expect("ref"), None)
            .expect("main target");
        assert_eq!(session.target(main).transitive_deps().len(), 1);
    }

    #[test]
    fn imports_create_their_own_cells() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        pathutil::makedirs(&root.join("lib")).expect("mkdir");
        write_script(
            &root.join("lib"),
            DEFAULT_SCRIPT,
            concat!(
                "project: lib\n",
                "targets:\n",
                "  foo:\n",
                "    type: cxx.library\n",
                "    srcs: [foo.c]\n",
            ),
        );
        let script = write_script(
            &root,
            DEFAULT_SCRIPT,
            concat!(
                "project: app\n",
                "imports: [lib]\n",
                "targets:\n",
                "  bar:\n",
                "    type: cxx.binary\n",
                "    srcs: [bar.c]\n",
                "    deps: [\"//lib:foo\"]\n",
            ),
        );
        let (mut session, registry) = fresh_session();
        load(&mut session, &registry, &script).expect("load");
        assert!(session.cell("lib").is_some());
        assert!(session.cell("app").is_some());
    }

    #[test]
    fn parse_errors_name_the_script() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let script = write_script(&root, DEFAULT_SCRIPT, "project: [not a string\n");
        let (mut session, registry) = fresh_session();
        let err = load(&mut session, &registry, &script).expect_err("parse failure");
        assert!(matches!(err, ScriptError::Parse { .. }));
    }

    #[test]
    fn unknown_kinds_are_reported() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let script = write_script(
            &root,
            DEFAULT_SCRIPT,
            "project: app\ntargets:\n  x:\n    type: mystery.kind\n",
        );
        let (mut session, registry) = fresh_session();
        let err = load(&mut session, &registry, &script).expect_err("unknown kind");
        assert!(matches!(
            err,
            ScriptError::Model {
                source: ModelError::UnknownKind(_),
                ..
            }
        ));
    }

    #[test]
    fn config_defaults_do_not_override_existing_values() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let script = write_script(
            &root,
            DEFAULT_SCRIPT,
            "project: app\nconfig:\n  build.optimize: size\n",
        );
        let (mut session, registry) = fresh_session();
        session.set_config("build.optimize", ConfigValue::String("none".into()));
        load(&mut session, &registry, &script).expect("load");
        assert_eq!(
            session.config("build.optimize").and_then(ConfigValue::as_str),
            Some("none")
        );
    }
}
