//! Build actions: hermetic command nodes with declared inputs and outputs.
//!
//! Actions are the only unit of work the backends understand. A trait emits
//! actions during translation via [`ActionBuilder`]; the owning target
//! expands dependency placeholders and assigns fallback names at
//! registration time.

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use thiserror::Error;

/// Errors raised while constructing actions.
#[derive(Debug, Error)]
pub enum ActionError {
    /// An action with the same name already exists on the target.
    #[error("action '{0}' already exists")]
    DuplicateAction(String),
    /// `foreach` requires one output per input.
    #[error("foreach action '{name}' has {inputs} inputs but {outputs} outputs")]
    ForeachMismatch {
        /// Action name.
        name: String,
        /// Number of declared inputs.
        inputs: usize,
        /// Number of declared outputs.
        outputs: usize,
    },
    /// The target has already been translated.
    #[error("can not add action '{0}' after the target was translated")]
    TargetTranslated(String),
}

/// A file with a set of tags.
///
/// Inputs implicitly carry `in`, outputs `out`. The `optional` tag marks an
/// output that may legitimately be absent after a successful run. Custom
/// tags are referenced from commands as `${@tag}` (outputs) and `${<tag}`
/// (inputs).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaggedPath {
    /// The file path.
    pub path: Utf8PathBuf,
    /// Additional tags beyond the implicit `in`/`out`.
    pub tags: Vec<String>,
}

impl TaggedPath {
    /// A path with no extra tags.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self {
            path: path.into(),
            tags: Vec::new(),
        }
    }

    /// A path with one extra tag.
    #[must_use]
    pub fn tagged(path: impl Into<Utf8PathBuf>, tag: &str) -> Self {
        Self {
            path: path.into(),
            tags: vec![tag.to_owned()],
        }
    }

    /// Whether the file carries `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// Dependency entry accepted by [`ActionBuilder::dep`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ActionDep {
    /// A concrete action, by long name (`//cell:target#action`).
    Named(String),
    /// All actions added to the same target before this one.
    Previous,
    /// All actions of the owning target's dependencies.
    TargetDeps,
}

/// A registered action. Field semantics follow the flat build-node record
/// that is persisted to the graph file.
#[derive(Clone, Debug)]
pub struct Action {
    /// Name, unique within the owning target.
    pub name: String,
    /// Commands to run sequentially within one invocation.
    pub commands: Vec<Vec<String>>,
    /// Declared input files.
    pub inputs: Vec<TaggedPath>,
    /// Declared output files.
    pub outputs: Vec<TaggedPath>,
    /// Long names of actions that must run first.
    pub deps: Vec<String>,
    /// Working directory for the commands.
    pub cwd: Option<Utf8PathBuf>,
    /// Environment overlay for the commands.
    pub environ: IndexMap<String, String>,
    /// Run the command template once per (input, output) pair.
    pub foreach: bool,
    /// Excluded from the default build.
    pub explicit: bool,
    /// Needs the console pool.
    pub console: bool,
    /// Attach stdio directly instead of capturing.
    pub syncio: bool,
    /// Extra arguments appended to the last command at run time.
    pub additional_args: Vec<String>,
}

impl Action {
    /// `<target.long_name>#<name>`.
    #[must_use]
    pub fn long_name(&self, target_long_name: &str) -> String {
        format!("{target_long_name}#{}", self.name)
    }
}

/// Builder handed to traits during translation.
#[derive(Debug)]
pub struct ActionBuilder {
    pub(crate) name: Option<String>,
    pub(crate) commands: Vec<Vec<String>>,
    pub(crate) inputs: Vec<TaggedPath>,
    pub(crate) outputs: Vec<TaggedPath>,
    pub(crate) deps: Vec<ActionDep>,
    pub(crate) cwd: Option<Utf8PathBuf>,
    pub(crate) environ: IndexMap<String, String>,
    pub(crate) foreach: bool,
    pub(crate) explicit: bool,
    pub(crate) console: bool,
    pub(crate) syncio: bool,
    pub(crate) additional_args: Vec<String>,
}

impl ActionBuilder {
    /// A builder whose action depends on the actions of the target's
    /// dependencies, which is what nearly every trait wants.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: None,
            commands: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            deps: vec![ActionDep::TargetDeps],
            cwd: None,
            environ: IndexMap::new(),
            foreach: false,
            explicit: false,
            console: false,
            syncio: false,
            additional_args: Vec::new(),
        }
    }

    /// Set the action name. Unnamed actions get their index as name.
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_owned());
        self
    }

    /// Add one command (an argv list).
    #[must_use]
    pub fn command(mut self, argv: Vec<String>) -> Self {
        self.commands.push(argv);
        self
    }

    /// Add an input file.
    #[must_use]
    pub fn input(mut self, file: TaggedPath) -> Self {
        self.inputs.push(file);
        self
    }

    /// Add several untagged input files.
    #[must_use]
    pub fn inputs<I: IntoIterator<Item = Utf8PathBuf>>(mut self, files: I) -> Self {
        self.inputs.extend(files.into_iter().map(TaggedPath::new));
        self
    }

    /// Add an output file.
    #[must_use]
    pub fn output(mut self, file: TaggedPath) -> Self {
        self.outputs.push(file);
        self
    }

    /// Add several untagged output files.
    #[must_use]
    pub fn outputs<I: IntoIterator<Item = Utf8PathBuf>>(mut self, files: I) -> Self {
        self.outputs.extend(files.into_iter().map(TaggedPath::new));
        self
    }

    /// Replace the dependency list.
    #[must_use]
    pub fn deps(mut self, deps: Vec<ActionDep>) -> Self {
        self.deps = deps;
        self
    }

    /// Add one dependency entry.
    #[must_use]
    pub fn dep(mut self, dep: ActionDep) -> Self {
        self.deps.push(dep);
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn cwd(mut self, cwd: Utf8PathBuf) -> Self {
        self.cwd = Some(cwd);
        self
    }

    /// Add an environment override.
    #[must_use]
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environ.insert(key.to_owned(), value.to_owned());
        self
    }

    /// Mark as a foreach action.
    #[must_use]
    pub fn foreach(mut self, foreach: bool) -> Self {
        self.foreach = foreach;
        self
    }

    /// Exclude from the default build.
    #[must_use]
    pub fn explicit(mut self, explicit: bool) -> Self {
        self.explicit = explicit;
        self
    }

    /// Request the console pool.
    #[must_use]
    pub fn console(mut self, console: bool) -> Self {
        self.console = console;
        self.syncio = self.syncio || console;
        self
    }

    /// Append run-time arguments to the final command.
    #[must_use]
    pub fn additional_args(mut self, args: Vec<String>) -> Self {
        self.additional_args = args;
        self
    }

    /// Validate foreach arity.
    ///
    /// # Errors
    ///
    /// Returns [`ActionError::ForeachMismatch`] when input and output counts
    /// differ.
    pub fn validate(&self, name: &str) -> Result<(), ActionError> {
        if self.foreach && self.inputs.len() != self.outputs.len() {
            return Err(ActionError::ForeachMismatch {
                name: name.to_owned(),
                inputs: self.inputs.len(),
                outputs: self.outputs.len(),
            });
        }
        Ok(())
    }
}

impl Default for ActionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
