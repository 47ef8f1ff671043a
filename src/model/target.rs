//! Targets and the trait protocol.

use camino::Utf8PathBuf;
use indexmap::IndexMap;

use crate::action::{Action, ActionBuilder, TaggedPath};
use crate::props::{PropValue, PropertySet};

use super::{ModelError, Session, join_ref};

/// Index of a target in the session arena.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TargetId(pub(crate) usize);

/// Index of a trait in the session arena.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct TraitId(pub(crate) usize);

/// A named unit of build intent inside a cell.
#[derive(Debug)]
pub struct Target {
    pub(crate) id: TargetId,
    pub(crate) cell: String,
    pub(crate) name: String,
    pub(crate) main_trait: Option<TraitId>,
    pub(crate) subtraits: Vec<TraitId>,
    pub(crate) internal_deps: Vec<TargetId>,
    pub(crate) transitive_deps: Vec<TargetId>,
    pub(crate) explicit: bool,
    pub(crate) console: bool,
    pub(crate) is_completed: bool,
    pub(crate) is_translated: bool,
    pub(crate) actions: IndexMap<String, Action>,
    pub(crate) props: PropertySet,
}

impl Target {
    /// This target's id.
    #[must_use]
    pub fn id(&self) -> TargetId {
        self.id
    }

    /// The owning cell's name.
    #[must_use]
    pub fn cell(&self) -> &str {
        &self.cell
    }

    /// The target name, unique within the cell.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// `//<cell>:<name>`.
    #[must_use]
    pub fn long_name(&self) -> String {
        join_ref(&self.cell, &self.name)
    }

    /// Dependencies visible only to direct dependents.
    #[must_use]
    pub fn internal_deps(&self) -> &[TargetId] {
        &self.internal_deps
    }

    /// Dependencies exported to dependents.
    #[must_use]
    pub fn transitive_deps(&self) -> &[TargetId] {
        &self.transitive_deps
    }

    /// Internal and transitive dependencies, in declaration order.
    #[must_use]
    pub fn direct_deps(&self) -> Vec<TargetId> {
        let mut deps = self.internal_deps.clone();
        for dep in &self.transitive_deps {
            if !deps.contains(dep) {
                deps.push(*dep);
            }
        }
        deps
    }

    /// Whether the target is excluded from the default build.
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        self.explicit
    }

    /// Whether the target's actions need a TTY.
    #[must_use]
    pub fn is_console(&self) -> bool {
        self.console
    }

    /// Whether `complete()` has run.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    /// Whether `translate()` has run.
    #[must_use]
    pub fn is_translated(&self) -> bool {
        self.is_translated
    }

    /// The actions emitted so far, in insertion order.
    #[must_use]
    pub fn actions(&self) -> &IndexMap<String, Action> {
        &self.actions
    }

    /// The explicit property values on this target.
    #[must_use]
    pub fn props(&self) -> &PropertySet {
        &self.props
    }

    /// Trait ids in post-order: sub-traits first, the main trait last.
    #[must_use]
    pub fn traits_post_order(&self) -> Vec<TraitId> {
        let mut order = self.subtraits.clone();
        order.extend(self.main_trait);
        order
    }
}

/// Behaviour attached to a target.
///
/// The lowering pipeline drives each trait through `complete` (finalise
/// inherited values, pick output names) and then `translate` (emit
/// actions). A trait must not mutate properties of other targets during
/// `translate`.
pub trait TargetTrait: std::fmt::Debug + Send {
    /// The factory kind that produced this trait, e.g. `cxx.library`.
    fn kind(&self) -> &'static str;

    /// First lowering phase. Sub-traits complete before the main trait.
    ///
    /// # Errors
    ///
    /// Implementations surface configuration problems here.
    fn complete(&mut self, ctx: &mut TraitCtx<'_>) -> Result<(), ModelError> {
        let _ = ctx;
        Ok(())
    }

    /// Second lowering phase: emit actions.
    ///
    /// # Errors
    ///
    /// Implementations surface translation problems here.
    fn translate(&mut self, ctx: &mut TraitCtx<'_>) -> Result<(), ModelError>;
}

/// Mutable view handed to a trait while one of its hooks runs.
///
/// The trait itself is temporarily detached from the session, so the
/// context can hand out `&mut Session` without aliasing.
pub struct TraitCtx<'a> {
    /// The session.
    pub session: &'a mut Session,
    /// The target the running trait is attached to.
    pub target: TargetId,
}

impl TraitCtx<'_> {
    /// The target under lowering.
    #[must_use]
    pub fn target(&self) -> &Target {
        self.session.target(self.target)
    }

    /// Resolve a property, honouring inheritance and schema defaults.
    ///
    /// # Errors
    ///
    /// Fails for unregistered property keys.
    pub fn prop(&self, key: &str) -> Result<PropValue, ModelError> {
        self.session.resolve_prop(self.target, key)
    }

    /// Set an explicit property value on this target.
    ///
    /// # Errors
    ///
    /// Fails for type mismatches or a sealed target.
    pub fn set_prop(&mut self, key: &str, value: PropValue) -> Result<(), ModelError> {
        self.session.set_prop(self.target, key, value)
    }

    /// Append to a list or map property on this target.
    ///
    /// # Errors
    ///
    /// Fails for scalar kinds, type mismatches, or a sealed target.
    pub fn append_prop(&mut self, key: &str, value: PropValue) -> Result<(), ModelError> {
        self.session.append_prop(self.target, key, value)
    }

    /// Install a sub-trait on this target.
    pub fn add_subtrait(&mut self, subtrait: Box<dyn TargetTrait>) -> TraitId {
        self.session.add_subtrait(self.target, subtrait)
    }

    /// Register an action; returns its long name.
    ///
    /// # Errors
    ///
    /// Fails for duplicate names, foreach arity mismatches, or a target
    /// that has already translated.
    pub fn add_action(&mut self, builder: ActionBuilder) -> Result<String, ModelError> {
        self.session.register_action(self.target, builder)
    }

    /// The full dependency closure, in dependency order.
    #[must_use]
    pub fn dep_ids(&self) -> Vec<TargetId> {
        self.session.dep_closure(self.target)
    }

    /// The source directory of the owning cell.
    #[must_use]
    pub fn source_dir(&self) -> Utf8PathBuf {
        self.session
            .cell(self.target().cell())
            .map(|c| c.directory.clone())
            .unwrap_or_default()
    }

    /// The build directory of the owning cell.
    #[must_use]
    pub fn build_dir(&self) -> Utf8PathBuf {
        self.session.cell_build_directory(self.target().cell())
    }

    /// Resolve `path` against the cell source directory.
    #[must_use]
    pub fn source_path(&self, path: &Utf8PathBuf) -> Utf8PathBuf {
        crate::pathutil::canonical(path, Some(&self.source_dir()))
    }

    /// Resolve `path` against the cell build directory.
    #[must_use]
    pub fn build_path(&self, path: &Utf8PathBuf) -> Utf8PathBuf {
        crate::pathutil::canonical(path, Some(&self.build_dir()))
    }

    /// All declared output files of the dependency closure that carry `tag`.
    #[must_use]
    pub fn dep_outputs_tagged(&self, tag: &str) -> Vec<TaggedPath> {
        let mut out = Vec::new();
        for dep in self.dep_ids() {
            for action in self.session.target(dep).actions().values() {
                out.extend(
                    action
                        .outputs
                        .iter()
                        .filter(|f| f.has_tag(tag))
                        .cloned(),
                );
            }
        }
        out
    }
}
