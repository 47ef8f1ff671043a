//! The build session: cells, the target arena, configuration and cache.

use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use semver::Version;
use serde::Deserialize;

use crate::action::{Action, ActionBuilder, ActionDep, ActionError};
use crate::props::{PropValue, PropertySet, Schema};

use super::cache::Cache;
use super::target::{Target, TargetId, TargetTrait, TraitId};
use super::{ModelError, TargetRef};

/// A scalar configuration value.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ConfigValue {
    /// Boolean option.
    Bool(bool),
    /// Integer option.
    Int(i64),
    /// String option.
    String(String),
}

impl ConfigValue {
    /// Read as a string if possible.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read as a bool; the strings `true`/`false` convert.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::String(s) if s == "true" => Some(true),
            Self::String(s) if s == "false" => Some(false),
            _ => None,
        }
    }
}

/// A namespace of targets, one per build-script package.
#[derive(Debug)]
pub struct Cell {
    /// Dotted identifier, unique in the session.
    pub name: String,
    /// Package version.
    pub version: Version,
    /// Source directory the build script lives in.
    pub directory: Utf8PathBuf,
    pub(crate) targets: IndexMap<String, TargetId>,
}

impl Cell {
    /// The targets registered in this cell, in declaration order.
    #[must_use]
    pub fn targets(&self) -> &IndexMap<String, TargetId> {
        &self.targets
    }
}

/// Process-wide build state.
///
/// The session is an explicit handle threaded through all constructors;
/// there is no global instance.
#[derive(Debug)]
pub struct Session {
    build_directory: Utf8PathBuf,
    config: IndexMap<String, ConfigValue>,
    /// The global property schema.
    pub schema: Schema,
    cells: IndexMap<String, Cell>,
    targets: Vec<Target>,
    traits: Vec<Option<Box<dyn TargetTrait>>>,
    /// The JSON cache persisted across runs.
    pub cache: Cache,
    scripts: Vec<Utf8PathBuf>,
}

impl Session {
    /// Create a session rooted at `build_directory`.
    #[must_use]
    pub fn new(build_directory: impl Into<Utf8PathBuf>) -> Self {
        Self {
            build_directory: build_directory.into(),
            config: IndexMap::new(),
            schema: Schema::default(),
            cells: IndexMap::new(),
            targets: Vec::new(),
            traits: Vec::new(),
            cache: Cache::default(),
            scripts: Vec::new(),
        }
    }

    /// The root build directory.
    #[must_use]
    pub fn build_directory(&self) -> &Utf8Path {
        &self.build_directory
    }

    /// The derived build directory of `cell`.
    #[must_use]
    pub fn cell_build_directory(&self, cell: &str) -> Utf8PathBuf {
        self.build_directory.join("cells").join(cell)
    }

    /// Set a configuration option, overriding earlier values.
    pub fn set_config(&mut self, key: &str, value: ConfigValue) {
        self.config.insert(key.to_owned(), value);
    }

    /// Set a configuration option only when absent.
    pub fn default_config(&mut self, key: &str, value: ConfigValue) {
        self.config.entry(key.to_owned()).or_insert(value);
    }

    /// Look up a configuration option.
    #[must_use]
    pub fn config(&self, key: &str) -> Option<&ConfigValue> {
        self.config.get(key)
    }

    /// Record a build script contributing to the graph, for staleness
    /// checks.
    pub fn add_script(&mut self, path: Utf8PathBuf) {
        if !self.scripts.contains(&path) {
            self.scripts.push(path);
        }
    }

    /// The recorded build scripts.
    #[must_use]
    pub fn scripts(&self) -> &[Utf8PathBuf] {
        &self.scripts
    }

    /// Look up a cell.
    #[must_use]
    pub fn cell(&self, name: &str) -> Option<&Cell> {
        self.cells.get(name)
    }

    /// All cells, in creation order.
    #[must_use]
    pub fn cells(&self) -> &IndexMap<String, Cell> {
        &self.cells
    }

    /// Create `name` if missing and return it.
    pub fn get_or_create_cell(
        &mut self,
        name: &str,
        version: Version,
        directory: Utf8PathBuf,
    ) -> &mut Cell {
        self.cells.entry(name.to_owned()).or_insert_with(|| Cell {
            name: name.to_owned(),
            version,
            directory,
            targets: IndexMap::new(),
        })
    }

    /// Borrow a target.
    ///
    /// # Panics
    ///
    /// Panics on a dangling [`TargetId`], which can only be produced by a
    /// bug in this crate.
    #[must_use]
    pub fn target(&self, id: TargetId) -> &Target {
        // Ids are only ever minted by this arena.
        &self.targets[id.0]
    }

    pub(crate) fn target_mut(&mut self, id: TargetId) -> &mut Target {
        &mut self.targets[id.0]
    }

    /// All target ids, in declaration order.
    #[must_use]
    pub fn target_ids(&self) -> Vec<TargetId> {
        (0..self.targets.len()).map(TargetId).collect()
    }

    /// The default selection: every non-explicit target.
    #[must_use]
    pub fn default_selection(&self) -> Vec<TargetId> {
        self.targets
            .iter()
            .filter(|t| !t.explicit)
            .map(|t| t.id)
            .collect()
    }

    /// Resolve a reference relative to `current_cell`.
    ///
    /// # Errors
    ///
    /// Fails for unknown cells or targets, and for relative references
    /// without a current cell.
    pub fn resolve_ref(
        &self,
        reference: &TargetRef,
        current_cell: Option<&str>,
    ) -> Result<TargetId, ModelError> {
        let (cell_name, target_name) = match reference {
            TargetRef::Absolute { cell, name } => (cell.as_str(), name.as_str()),
            TargetRef::Relative(name) => {
                let cell = current_cell
                    .ok_or_else(|| ModelError::RelativeRefWithoutCell(reference.to_string()))?;
                (cell, name.as_str())
            }
        };
        let cell = self
            .cells
            .get(cell_name)
            .ok_or_else(|| ModelError::UnknownCell(cell_name.to_owned()))?;
        cell.targets
            .get(target_name)
            .copied()
            .ok_or_else(|| ModelError::UnknownTarget(reference.to_string()))
    }

    /// Register a new target in `cell`.
    ///
    /// The target starts without a main trait; [`Session::set_main_trait`]
    /// attaches one exactly once.
    ///
    /// # Errors
    ///
    /// Fails when the name is already taken.
    pub fn create_target(
        &mut self,
        cell: &str,
        name: &str,
        explicit: bool,
        console: bool,
    ) -> Result<TargetId, ModelError> {
        let cell_entry = self
            .cells
            .get_mut(cell)
            .ok_or_else(|| ModelError::UnknownCell(cell.to_owned()))?;
        if cell_entry.targets.contains_key(name) {
            return Err(ModelError::DuplicateTarget {
                cell: cell.to_owned(),
                name: name.to_owned(),
            });
        }
        let id = TargetId(self.targets.len());
        cell_entry.targets.insert(name.to_owned(), id);
        self.targets.push(Target {
            id,
            cell: cell.to_owned(),
            name: name.to_owned(),
            main_trait: None,
            subtraits: Vec::new(),
            internal_deps: Vec::new(),
            transitive_deps: Vec::new(),
            explicit,
            console,
            is_completed: false,
            is_translated: false,
            actions: IndexMap::new(),
            props: PropertySet::default(),
        });
        Ok(id)
    }

    /// Attach the main trait to `target`.
    ///
    /// # Errors
    ///
    /// Fails when a main trait is already present.
    pub fn set_main_trait(
        &mut self,
        target: TargetId,
        main_trait: Box<dyn TargetTrait>,
    ) -> Result<TraitId, ModelError> {
        if self.target(target).main_trait.is_some() {
            return Err(ModelError::TraitAlreadySet(self.target(target).long_name()));
        }
        let id = TraitId(self.traits.len());
        self.traits.push(Some(main_trait));
        self.target_mut(target).main_trait = Some(id);
        Ok(id)
    }

    /// Install a sub-trait on `target`.
    pub fn add_subtrait(&mut self, target: TargetId, subtrait: Box<dyn TargetTrait>) -> TraitId {
        let id = TraitId(self.traits.len());
        self.traits.push(Some(subtrait));
        self.target_mut(target).subtraits.push(id);
        id
    }

    /// Detach a trait for a hook invocation. Pair with
    /// [`Session::put_trait`].
    pub(crate) fn take_trait(&mut self, id: TraitId) -> Option<Box<dyn TargetTrait>> {
        self.traits.get_mut(id.0).and_then(Option::take)
    }

    pub(crate) fn put_trait(&mut self, id: TraitId, value: Box<dyn TargetTrait>) {
        if let Some(slot) = self.traits.get_mut(id.0) {
            *slot = Some(value);
        }
    }

    /// Mark `target` completed and seal its properties.
    pub fn seal_completed(&mut self, target: TargetId) {
        let entry = self.target_mut(target);
        entry.is_completed = true;
        entry.props.seal();
    }

    /// Mark `target` translated; no further actions may be added.
    pub fn seal_translated(&mut self, target: TargetId) {
        self.target_mut(target).is_translated = true;
    }

    /// Set the dependency lists of `target`.
    ///
    /// # Errors
    ///
    /// Fails once the target has completed.
    pub fn set_deps(
        &mut self,
        target: TargetId,
        internal: Vec<TargetId>,
        transitive: Vec<TargetId>,
    ) -> Result<(), ModelError> {
        if self.target(target).is_completed {
            return Err(ModelError::TargetCompleted(self.target(target).long_name()));
        }
        let entry = self.target_mut(target);
        entry.internal_deps = internal;
        entry.transitive_deps = transitive;
        Ok(())
    }

    /// The dependency closure of `target`, in dependency order: internal
    /// dependencies (plus their exported closures) first, then the exported
    /// closure of the target itself.
    #[must_use]
    pub fn dep_closure(&self, target: TargetId) -> Vec<TargetId> {
        let mut out: Vec<TargetId> = Vec::new();
        let mut push = |id: TargetId, out: &mut Vec<TargetId>| {
            if !out.contains(&id) {
                out.push(id);
            }
        };
        let entry = self.target(target);
        for &dep in &entry.internal_deps {
            push(dep, &mut out);
            self.collect_transitive(dep, &mut out);
        }
        self.collect_transitive(target, &mut out);
        out
    }

    fn collect_transitive(&self, target: TargetId, out: &mut Vec<TargetId>) {
        for &dep in &self.target(target).transitive_deps {
            if !out.contains(&dep) {
                out.push(dep);
                self.collect_transitive(dep, out);
            }
        }
    }

    /// The targets that list `target` among their dependencies.
    #[must_use]
    pub fn dependents(&self, target: TargetId) -> Vec<TargetId> {
        self.targets
            .iter()
            .filter(|t| {
                t.internal_deps.contains(&target) || t.transitive_deps.contains(&target)
            })
            .map(|t| t.id)
            .collect()
    }

    /// Resolve a property on `target` per the inheritance rules: explicit
    /// value, then accumulation over the dependency closure for inherited
    /// definitions, then the schema default.
    ///
    /// # Errors
    ///
    /// Fails for unregistered keys.
    pub fn resolve_prop(&self, target: TargetId, key: &str) -> Result<PropValue, ModelError> {
        let def = self.schema.require(key)?;
        if let Some(value) = self.target(target).props.get(key) {
            return Ok(value.clone());
        }
        if def.inherit {
            let mut collected: Option<PropValue> = None;
            for dep in self.dep_closure(target) {
                let Some(value) = self.target(dep).props.get(key) else {
                    continue;
                };
                match &mut collected {
                    Some(acc) if matches!(
                        def.kind,
                        crate::props::PropKind::StringList
                            | crate::props::PropKind::PathList
                            | crate::props::PropKind::Map
                    ) => acc.merge(value.clone()),
                    Some(_) => {} // scalar: first non-empty wins
                    None if value.is_empty() => {}
                    None => collected = Some(value.clone()),
                }
            }
            if let Some(value) = collected {
                return Ok(value);
            }
        }
        Ok(def
            .default
            .clone()
            .unwrap_or_else(|| PropValue::empty(def.kind)))
    }

    /// Set an explicit property value on `target`.
    ///
    /// # Errors
    ///
    /// Fails for type mismatches or a sealed target.
    pub fn set_prop(
        &mut self,
        target: TargetId,
        key: &str,
        value: PropValue,
    ) -> Result<(), ModelError> {
        // Split borrows: schema and the target's property set are disjoint.
        let schema = std::mem::take(&mut self.schema);
        let result = self.target_mut(target).props.set(&schema, key, value);
        self.schema = schema;
        Ok(result?)
    }

    /// Append to a list or map property on `target`.
    ///
    /// # Errors
    ///
    /// Fails for scalar kinds, type mismatches, or a sealed target.
    pub fn append_prop(
        &mut self,
        target: TargetId,
        key: &str,
        value: PropValue,
    ) -> Result<(), ModelError> {
        let schema = std::mem::take(&mut self.schema);
        let result = self.target_mut(target).props.append(&schema, key, value);
        self.schema = schema;
        Ok(result?)
    }

    /// Register an action on `target`, expanding dependency placeholders.
    ///
    /// # Errors
    ///
    /// Fails for duplicate names, arity mismatches, or a translated target.
    pub fn register_action(
        &mut self,
        target: TargetId,
        builder: ActionBuilder,
    ) -> Result<String, ModelError> {
        let entry = self.target(target);
        let target_long = entry.long_name();
        if entry.is_translated {
            return Err(ActionError::TargetTranslated(target_long).into());
        }
        let name = builder
            .name
            .clone()
            .unwrap_or_else(|| entry.actions.len().to_string());
        if entry.actions.contains_key(&name) {
            return Err(ActionError::DuplicateAction(format!("{target_long}#{name}")).into());
        }
        builder.validate(&name)?;

        let mut deps: Vec<String> = Vec::new();
        let mut push = |name: String, deps: &mut Vec<String>| {
            if !deps.contains(&name) {
                deps.push(name);
            }
        };
        for dep in &builder.deps {
            match dep {
                ActionDep::Named(reference) => {
                    let long = if reference.contains('#') {
                        reference.clone()
                    } else {
                        format!("{target_long}#{reference}")
                    };
                    push(long, &mut deps);
                }
                ActionDep::Previous => {
                    for action in self.target(target).actions.values() {
                        push(action.long_name(&target_long), &mut deps);
                    }
                }
                ActionDep::TargetDeps => {
                    for dep_id in self.dep_closure(target) {
                        let dep_target = self.target(dep_id);
                        let dep_long = dep_target.long_name();
                        for action in dep_target.actions.values() {
                            push(action.long_name(&dep_long), &mut deps);
                        }
                    }
                }
            }
        }

        let explicit = builder.explicit || self.target(target).explicit;
        let console = builder.console || self.target(target).console;
        let action = Action {
            name: name.clone(),
            commands: builder.commands,
            inputs: builder.inputs,
            outputs: builder.outputs,
            deps,
            cwd: builder.cwd,
            environ: builder.environ,
            foreach: builder.foreach,
            explicit,
            console,
            syncio: builder.syncio || console,
            additional_args: builder.additional_args,
        };
        let long = action.long_name(&target_long);
        self.target_mut(target).actions.insert(name, action);
        Ok(long)
    }
}
