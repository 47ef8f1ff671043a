//! Factories construct targets bearing a particular trait.

use indexmap::IndexMap;

use crate::props::Schema;

use super::session::Session;
use super::target::{TargetId, TargetTrait};
use super::{ModelError, TargetRef};

/// The loosely-typed arguments a build script supplies for one target.
#[derive(Clone, Debug, Default)]
pub struct TargetArgs {
    /// Target name within the cell.
    pub name: String,
    /// Optional parent target; the final name becomes
    /// `<parent-name>_<name>`.
    pub parent: Option<TargetRef>,
    /// Declared dependencies.
    pub deps: Vec<TargetRef>,
    /// Skip from the default build.
    pub explicit: bool,
    /// Needs a TTY.
    pub console: bool,
    /// Trait keyword arguments, converted to typed properties by the
    /// factory.
    pub props: IndexMap<String, serde_json::Value>,
}

/// Constructs targets of one kind.
///
/// A factory registers the properties its trait consumes, may adjust
/// incoming arguments in [`Factory::preprocess`], decides how declared
/// dependencies are partitioned, and finally instantiates the trait.
pub trait Factory: Send + Sync {
    /// The kind string used in build scripts, e.g. `cxx.binary`.
    fn kind(&self) -> &'static str;

    /// Register property definitions. Called once at factory registration.
    ///
    /// # Errors
    ///
    /// Fails on conflicting property definitions.
    fn init(&self, schema: &mut Schema) -> Result<(), ModelError> {
        let _ = schema;
        Ok(())
    }

    /// Adjust arguments before the target is constructed.
    ///
    /// # Errors
    ///
    /// Implementations surface argument problems here.
    fn preprocess(&self, args: &mut TargetArgs) -> Result<(), ModelError> {
        let _ = args;
        Ok(())
    }

    /// Partition resolved dependencies into `(internal, transitive)`.
    /// The default exports everything.
    fn partition_deps(&self, deps: Vec<TargetId>) -> (Vec<TargetId>, Vec<TargetId>) {
        (Vec::new(), deps)
    }

    /// Build the trait instance for a freshly created target.
    ///
    /// # Errors
    ///
    /// Fails on invalid trait arguments.
    fn instantiate(
        &self,
        session: &mut Session,
        target: TargetId,
        args: &TargetArgs,
    ) -> Result<Box<dyn TargetTrait>, ModelError>;
}

/// Registry of factories by kind.
#[derive(Default)]
pub struct FactoryRegistry {
    factories: IndexMap<String, Box<dyn Factory>>,
}

impl std::fmt::Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactoryRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl FactoryRegistry {
    /// Register a factory and let it install its property schema.
    ///
    /// # Errors
    ///
    /// Fails on conflicting property definitions.
    pub fn register(
        &mut self,
        schema: &mut Schema,
        factory: Box<dyn Factory>,
    ) -> Result<(), ModelError> {
        factory.init(schema)?;
        self.factories.insert(factory.kind().to_owned(), factory);
        Ok(())
    }

    /// Look up a factory by kind.
    ///
    /// # Errors
    ///
    /// Fails for unknown kinds.
    pub fn get(&self, kind: &str) -> Result<&dyn Factory, ModelError> {
        self.factories
            .get(kind)
            .map(Box::as_ref)
            .ok_or_else(|| ModelError::UnknownKind(kind.to_owned()))
    }
}

/// Construct and register a target in `cell` using `factory`.
///
/// This runs the full construction protocol: preprocess, dependency
/// resolution and partitioning, target creation (with parent naming), and
/// trait instantiation.
///
/// # Errors
///
/// Fails on unresolvable references, duplicate names, or trait argument
/// problems.
pub fn declare(
    session: &mut Session,
    factory: &dyn Factory,
    cell: &str,
    mut args: TargetArgs,
) -> Result<TargetId, ModelError> {
    factory.preprocess(&mut args)?;

    let mut deps = Vec::new();
    for reference in &args.deps {
        deps.push(session.resolve_ref(reference, Some(cell))?);
    }
    let (internal, transitive) = factory.partition_deps(deps);

    let name = match &args.parent {
        Some(parent_ref) => {
            let parent = session.resolve_ref(parent_ref, Some(cell))?;
            format!("{}_{}", session.target(parent).name(), args.name)
        }
        None => args.name.clone(),
    };

    let target = session.create_target(cell, &name, args.explicit, args.console)?;
    session.set_deps(target, internal, transitive)?;
    let main_trait = factory.instantiate(session, target, &args)?;
    session.set_main_trait(target, main_trait)?;
    Ok(target)
}
