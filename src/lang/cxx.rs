//! C/C++ targets.
//!
//! Four kinds share one trait implementation: `cxx.build` (one product per
//! source when several output names are given), `cxx.library` (static or
//! shared, inferred from dependents when unset), `cxx.binary`, and
//! `cxx.run` (a console target executing the product of its dependency).
//! All compiler specifics go through the adapter contract.

mod gcc;

pub use gcc::GccAdapter;

use std::sync::Arc;

use camino::Utf8PathBuf;

use crate::action::{ActionBuilder, ActionDep, TaggedPath};
use crate::adapters::{CompileData, CompilerAdapter, Lang, LinkData, ProductKind};
use crate::model::{Factory, ModelError, Session, TargetArgs, TargetId, TargetTrait, TraitCtx};
use crate::outname::{MacroContext, Template};
use crate::pipeline::{self, Linkage, Optimize};
use crate::props::{PropDef, PropKind, PropValue};

/// Source files.
pub const SRCS: &str = "cxx.srcs";
/// Private include directories.
pub const INCLUDES: &str = "cxx.includes";
/// Include directories exported to dependents.
pub const EXPORTED_INCLUDES: &str = "cxx.exported_includes";
/// Private preprocessor definitions.
pub const DEFINES: &str = "cxx.defines";
/// Definitions exported to dependents.
pub const EXPORTED_DEFINES: &str = "cxx.exported_defines";
/// Extra compiler flags.
pub const COMPILER_FLAGS: &str = "cxx.compiler_flags";
/// Extra linker flags.
pub const LINKER_FLAGS: &str = "cxx.linker_flags";
/// Linker flags exported to dependents.
pub const EXPORTED_LINKER_FLAGS: &str = "cxx.exported_linker_flags";
/// System libraries linked by name.
pub const SYSLIBS: &str = "cxx.syslibs";
/// Preferred linkage of a library (`static` or `shared`).
pub const PREFERRED_LINKAGE: &str = "cxx.preferred_linkage";
/// Output name template(s).
pub const OUTNAME: &str = "cxx.outname";
/// Library products exported for linking, accumulated over dependencies.
pub const LINK_PRODUCTS: &str = "cxx.link_products";
/// All products, accumulated over dependencies (used by `cxx.run`).
pub const PRODUCTS: &str = "cxx.products";
/// Arguments passed by `cxx.run` targets.
pub const RUN_ARGS: &str = "cxx.run_args";

/// Register the `cxx` factories and properties.
///
/// # Errors
///
/// Fails on conflicting property definitions.
pub fn register(
    session: &mut Session,
    registry: &mut crate::model::FactoryRegistry,
) -> Result<(), ModelError> {
    let adapter: Arc<dyn CompilerAdapter> = Arc::new(GccAdapter::from_env());
    adapter.init(&mut session.schema)?;
    register_props(&mut session.schema)?;
    for role in [Role::Build, Role::Library, Role::Binary, Role::Run] {
        registry.register(
            &mut session.schema,
            Box::new(CxxFactory {
                role,
                adapter: Arc::clone(&adapter),
            }),
        )?;
    }
    Ok(())
}

fn register_props(schema: &mut crate::props::Schema) -> Result<(), ModelError> {
    schema.register(PropDef::new(SRCS, PropKind::PathList))?;
    schema.register(PropDef::new(INCLUDES, PropKind::PathList))?;
    schema.register(PropDef::new(EXPORTED_INCLUDES, PropKind::PathList).inherited())?;
    schema.register(PropDef::new(DEFINES, PropKind::StringList))?;
    schema.register(PropDef::new(EXPORTED_DEFINES, PropKind::StringList).inherited())?;
    schema.register(PropDef::new(COMPILER_FLAGS, PropKind::StringList))?;
    schema.register(PropDef::new(LINKER_FLAGS, PropKind::StringList))?;
    schema.register(PropDef::new(EXPORTED_LINKER_FLAGS, PropKind::StringList).inherited())?;
    schema.register(PropDef::new(SYSLIBS, PropKind::StringList).inherited())?;
    schema.register(PropDef::new(PREFERRED_LINKAGE, PropKind::String))?;
    schema.register(PropDef::new(OUTNAME, PropKind::StringList))?;
    schema.register(PropDef::new(LINK_PRODUCTS, PropKind::PathList).inherited())?;
    schema.register(PropDef::new(PRODUCTS, PropKind::PathList).inherited())?;
    schema.register(PropDef::new(RUN_ARGS, PropKind::StringList))?;
    Ok(())
}

/// Which `cxx` kind a target was declared as.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Role {
    Build,
    Library,
    Binary,
    Run,
}

impl Role {
    const fn kind(self) -> &'static str {
        match self {
            Self::Build => "cxx.build",
            Self::Library => "cxx.library",
            Self::Binary => "cxx.binary",
            Self::Run => "cxx.run",
        }
    }
}

struct CxxFactory {
    role: Role,
    adapter: Arc<dyn CompilerAdapter>,
}

impl Factory for CxxFactory {
    fn kind(&self) -> &'static str {
        self.role.kind()
    }

    fn preprocess(&self, args: &mut TargetArgs) -> Result<(), ModelError> {
        if self.role == Role::Run {
            // Run targets are not part of the default build and own the TTY.
            args.explicit = true;
            args.console = true;
        }
        Ok(())
    }

    fn instantiate(
        &self,
        session: &mut Session,
        target: TargetId,
        args: &TargetArgs,
    ) -> Result<Box<dyn TargetTrait>, ModelError> {
        for (key, value) in &args.props {
            let full = format!("cxx.{key}");
            let Some(kind) = session.schema.get(&full).map(|def| def.kind) else {
                tracing::warn!(key = %key, kind = self.role.kind(), "unused target option");
                continue;
            };
            let typed = PropValue::from_json(&full, kind, value)?;
            session.set_prop(target, &full, typed)?;
        }
        Ok(Box::new(CxxTrait {
            role: self.role,
            adapter: Arc::clone(&self.adapter),
            srcs: Vec::new(),
            products: Vec::new(),
            objects: Vec::new(),
            kind: ProductKind::Executable,
            lang: Lang::C,
            debug: false,
            optimize: Optimize::Speed,
        }))
    }
}

/// Trait shared by all `cxx` kinds.
#[derive(Debug)]
pub struct CxxTrait {
    role: Role,
    adapter: Arc<dyn CompilerAdapter>,
    srcs: Vec<Utf8PathBuf>,
    products: Vec<Utf8PathBuf>,
    objects: Vec<Utf8PathBuf>,
    kind: ProductKind,
    lang: Lang,
    debug: bool,
    optimize: Optimize,
}

impl CxxTrait {
    /// Whether this target builds one product per source file.
    #[must_use]
    pub fn is_foreach(&self) -> bool {
        self.products.len() > 1
    }

    fn default_outname(&self) -> &'static str {
        match self.role {
            Role::Library => "$(lib)$(name)$(ext)",
            _ => "$(name)$(ext)",
        }
    }

    fn resolve_sources(&mut self, ctx: &TraitCtx<'_>) -> Result<(), ModelError> {
        let srcs = ctx.prop(SRCS)?;
        self.srcs = srcs
            .as_path_list()
            .unwrap_or_default()
            .iter()
            .map(|p| ctx.source_path(p))
            .collect();
        self.lang = if self.srcs.iter().any(|s| Lang::from_source(s) == Lang::Cpp) {
            Lang::Cpp
        } else {
            Lang::C
        };
        Ok(())
    }

    fn absolutize_path_prop(ctx: &mut TraitCtx<'_>, key: &str) -> Result<(), ModelError> {
        let Some(value) = ctx.target().props().get(key).cloned() else {
            return Ok(());
        };
        let Some(paths) = value.as_path_list() else {
            return Ok(());
        };
        let absolute: Vec<Utf8PathBuf> = paths.iter().map(|p| ctx.source_path(p)).collect();
        ctx.set_prop(key, PropValue::PathList(absolute))
    }

    fn compute_products(&mut self, ctx: &TraitCtx<'_>) -> Result<(), ModelError> {
        let mut macros = MacroContext::new();
        self.adapter.init_macro_context(&mut macros, self.kind);
        let name = ctx.target().name().to_owned();
        macros.define_fn("name", move |_| name.clone());

        let outnames = ctx.prop(OUTNAME)?;
        let templates: Vec<String> = match outnames.as_string_list() {
            Some(list) if !list.is_empty() => list.to_vec(),
            _ => vec![self.default_outname().to_owned()],
        };
        let build_dir = ctx.build_dir();
        self.products = templates
            .iter()
            .map(|text| {
                let rendered = Template::parse(text)?.eval(&macros, &[])?;
                Ok(build_dir.join(rendered))
            })
            .collect::<Result<_, ModelError>>()?;
        Ok(())
    }

    fn compile_data(&self, ctx: &TraitCtx<'_>) -> Result<CompileData, ModelError> {
        let mut includes: Vec<Utf8PathBuf> = ctx
            .prop(INCLUDES)?
            .as_path_list()
            .unwrap_or_default()
            .to_vec();
        includes.extend(
            ctx.prop(EXPORTED_INCLUDES)?
                .as_path_list()
                .unwrap_or_default()
                .iter()
                .cloned(),
        );
        let mut defines: Vec<String> = ctx
            .prop(DEFINES)?
            .as_string_list()
            .unwrap_or_default()
            .to_vec();
        defines.extend(
            ctx.prop(EXPORTED_DEFINES)?
                .as_string_list()
                .unwrap_or_default()
                .iter()
                .cloned(),
        );
        Ok(CompileData {
            lang: self.lang,
            debug: self.debug,
            optimize: self.optimize,
            pic: self.kind == ProductKind::SharedLibrary,
            includes,
            defines,
            flags: ctx
                .prop(COMPILER_FLAGS)?
                .as_string_list()
                .unwrap_or_default()
                .to_vec(),
        })
    }

    fn link_data(&self, ctx: &TraitCtx<'_>, product: Utf8PathBuf) -> Result<LinkData, ModelError> {
        let mut flags: Vec<String> = ctx
            .prop(LINKER_FLAGS)?
            .as_string_list()
            .unwrap_or_default()
            .to_vec();
        flags.extend(
            ctx.prop(EXPORTED_LINKER_FLAGS)?
                .as_string_list()
                .unwrap_or_default()
                .iter()
                .cloned(),
        );
        Ok(LinkData {
            lang: self.lang,
            kind: self.kind,
            product,
            objects: self.objects.clone(),
            link_products: ctx
                .prop(LINK_PRODUCTS)?
                .as_path_list()
                .unwrap_or_default()
                .to_vec(),
            syslibs: ctx
                .prop(SYSLIBS)?
                .as_string_list()
                .unwrap_or_default()
                .to_vec(),
            flags,
        })
    }
}

impl TargetTrait for CxxTrait {
    fn kind(&self) -> &'static str {
        self.role.kind()
    }

    fn complete(&mut self, ctx: &mut TraitCtx<'_>) -> Result<(), ModelError> {
        if self.role == Role::Run {
            return Ok(());
        }
        self.resolve_sources(ctx)?;
        Self::absolutize_path_prop(ctx, INCLUDES)?;
        Self::absolutize_path_prop(ctx, EXPORTED_INCLUDES)?;

        self.debug = pipeline::resolve_debug(ctx.session, ctx.target, super::DEBUG_PROP);
        self.optimize =
            pipeline::resolve_optimize(ctx.session, ctx.target, super::OPTIMIZE_PROP)?;
        self.kind = match self.role {
            Role::Library => {
                match pipeline::resolve_preferred_linkage(ctx.session, ctx.target, PREFERRED_LINKAGE)? {
                    Linkage::Static => ProductKind::StaticLibrary,
                    Linkage::Shared => ProductKind::SharedLibrary,
                }
            }
            _ => ProductKind::Executable,
        };

        self.compute_products(ctx)?;
        if self.is_foreach() && self.products.len() != self.srcs.len() {
            return Err(ModelError::Config(format!(
                "{}: {} output names for {} sources",
                ctx.target().long_name(),
                self.products.len(),
                self.srcs.len()
            )));
        }
        if !self.is_foreach() {
            let objdir = ctx.build_dir().join("obj");
            self.objects = self
                .srcs
                .iter()
                .map(|src| self.adapter.add_objects_for_source(&objdir, src))
                .collect();
        }

        if self.role == Role::Library {
            ctx.append_prop(LINK_PRODUCTS, PropValue::PathList(self.products.clone()))?;
        }
        ctx.append_prop(PRODUCTS, PropValue::PathList(self.products.clone()))?;
        Ok(())
    }

    fn translate(&mut self, ctx: &mut TraitCtx<'_>) -> Result<(), ModelError> {
        if self.role == Role::Run {
            return translate_run(ctx);
        }

        let compile_name = format!("compile_{}", self.lang.ident());
        let compile = self.compile_data(ctx)?;

        if self.is_foreach() {
            // One product per source: a single foreach action compiles and
            // links each pair directly.
            let link = self.link_data(ctx, Utf8PathBuf::new())?;
            let command = self.adapter.get_build_command(&compile, &link);
            ctx.add_action(
                ActionBuilder::new()
                    .name(&compile_name)
                    .command(command)
                    .inputs(self.srcs.iter().cloned())
                    .outputs(self.products.iter().cloned())
                    .foreach(true),
            )?;
            return Ok(());
        }

        ctx.add_action(
            ActionBuilder::new()
                .name(&compile_name)
                .command(self.adapter.get_compile_command(&compile))
                .inputs(self.srcs.iter().cloned())
                .outputs(self.objects.iter().cloned())
                .foreach(true),
        )?;

        let product = self
            .products
            .first()
            .cloned()
            .unwrap_or_else(|| ctx.build_dir().join(ctx.target().name()));
        let link = self.link_data(ctx, product.clone())?;
        let mut outputs = vec![TaggedPath::new(product)];
        self.adapter.add_link_outputs(&link, &mut outputs);
        let mut builder = ActionBuilder::new()
            .command(self.adapter.get_link_command(&link))
            .inputs(self.objects.iter().cloned())
            .inputs(link.link_products.iter().cloned())
            .dep(ActionDep::Previous);
        for output in outputs {
            builder = builder.output(output);
        }
        ctx.add_action(builder)?;
        Ok(())
    }
}

fn translate_run(ctx: &mut TraitCtx<'_>) -> Result<(), ModelError> {
    let products = ctx.prop(PRODUCTS)?;
    let program = products
        .as_path_list()
        .unwrap_or_default()
        .first()
        .cloned()
        .ok_or_else(|| {
            ModelError::Config(format!(
                "{}: no dependency provides a product to run",
                ctx.target().long_name()
            ))
        })?;
    let mut argv = vec![program.into_string()];
    argv.extend(
        ctx.prop(RUN_ARGS)?
            .as_string_list()
            .unwrap_or_default()
            .iter()
            .cloned(),
    );
    ctx.add_action(
        ActionBuilder::new()
            .name("run")
            .command(argv)
            .explicit(true)
            .console(true),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FactoryRegistry, declare};
    use semver::Version;

    fn setup() -> (Session, FactoryRegistry) {
        let mut session = Session::new("/build");
        let mut registry = FactoryRegistry::default();
        super::super::register(&mut session, &mut registry).expect("register");
        session.get_or_create_cell("app", Version::new(1, 0, 0), "/src/app".into());
        session.get_or_create_cell("lib", Version::new(1, 0, 0), "/src/lib".into());
        (session, registry)
    }

    fn cxx_target(
        session: &mut Session,
        registry: &FactoryRegistry,
        cell: &str,
        name: &str,
        kind: &str,
        props: serde_json::Value,
        deps: Vec<crate::model::TargetRef>,
    ) -> TargetId {
        let props = props
            .as_object()
            .expect("object")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        declare(
            session,
            registry.get(kind).expect("factory"),
            cell,
            TargetArgs {
                name: name.into(),
                deps,
                props,
                ..TargetArgs::default()
            },
        )
        .expect("declare")
    }

    #[test]
    fn binary_translates_to_compile_and_link() {
        let (mut session, registry) = setup();
        let hello = cxx_target(
            &mut session,
            &registry,
            "app",
            "hello",
            "cxx.binary",
            serde_json::json!({ "srcs": ["hello.c"] }),
            Vec::new(),
        );
        crate::pipeline::lower(&mut session, &[hello]).expect("lower");

        let target = session.target(hello);
        assert_eq!(target.actions().len(), 2);
        let compile = target.actions().get("compile_c").expect("compile action");
        assert!(compile.foreach);
        assert_eq!(
            compile.inputs.first().map(|f| f.path.as_str()),
            Some("/src/app/hello.c")
        );
        assert_eq!(
            compile.outputs.first().map(|f| f.path.as_str()),
            Some("/build/cells/app/obj/hello.o")
        );
        let link = target.actions().get("1").expect("link action");
        assert_eq!(
            link.outputs.first().map(|f| f.path.as_str()),
            Some("/build/cells/app/hello")
        );
        assert_eq!(link.deps, vec!["//app:hello#compile_c".to_owned()]);
    }

    #[test]
    fn library_linkage_is_inferred_and_exports_propagate() {
        let (mut session, registry) = setup();
        let foo = cxx_target(
            &mut session,
            &registry,
            "lib",
            "foo",
            "cxx.library",
            serde_json::json!({ "srcs": ["foo.c"], "exported_includes": ["include"] }),
            Vec::new(),
        );
        let bar = cxx_target(
            &mut session,
            &registry,
            "app",
            "bar",
            "cxx.binary",
            serde_json::json!({ "srcs": ["bar.c"] }),
            vec!["//lib:foo".parse().expect("ref")],
        );
        crate::pipeline::lower(&mut session, &[foo, bar]).expect("lower");

        // Only dependent is a binary: the library defaults to static.
        let archive = session
            .resolve_prop(bar, LINK_PRODUCTS)
            .expect("resolve");
        assert_eq!(
            archive.as_path_list().unwrap_or_default(),
            &[Utf8PathBuf::from("/build/cells/lib/libfoo.a")]
        );

        // The binary's compile command picks up the exported include dir.
        let compile = session
            .target(bar)
            .actions()
            .get("compile_c")
            .expect("compile");
        let argv = compile.commands.first().expect("argv");
        assert!(argv.contains(&"-I/src/lib/include".to_owned()));

        // The link command consumes the archive.
        let link = session.target(bar).actions().get("1").expect("link");
        let argv = link.commands.first().expect("argv");
        assert!(argv.contains(&"/build/cells/lib/libfoo.a".to_owned()));

        // Four actions in total across the graph.
        let total: usize = [foo, bar]
            .iter()
            .map(|&id| session.target(id).actions().len())
            .sum();
        assert_eq!(total, 4);
    }

    #[test]
    fn multi_outname_build_is_foreach() {
        let (mut session, registry) = setup();
        let r#gen = cxx_target(
            &mut session,
            &registry,
            "app",
            "tools",
            "cxx.build",
            serde_json::json!({
                "srcs": ["a.c", "b.c"],
                "outname": ["a.exe", "b.exe"],
            }),
            Vec::new(),
        );
        crate::pipeline::lower(&mut session, &[r#gen]).expect("lower");

        let target = session.target(r#gen);
        assert_eq!(target.actions().len(), 1);
        let action = target.actions().get("compile_c").expect("action");
        assert!(action.foreach);
        assert_eq!(action.inputs.len(), 2);
        assert_eq!(action.outputs.len(), 2);
        assert_eq!(
            action.outputs.get(1).map(|f| f.path.as_str()),
            Some("/build/cells/app/b.exe")
        );
    }

    #[test]
    fn run_targets_execute_the_dependency_product() {
        let (mut session, registry) = setup();
        let hello = cxx_target(
            &mut session,
            &registry,
            "app",
            "hello",
            "cxx.binary",
            serde_json::json!({ "srcs": ["hello.c"] }),
            Vec::new(),
        );
        let factory = registry.get("cxx.run").expect("factory");
        let run = declare(
            &mut session,
            factory,
            "app",
            TargetArgs {
                name: "hello_run".into(),
                deps: vec!["//app:hello".parse().expect("ref")],
                props: [(
                    "run_args".to_owned(),
                    serde_json::json!(["--version"]),
                )]
                .into_iter()
                .collect(),
                ..TargetArgs::default()
            },
        )
        .expect("declare");
        crate::pipeline::lower(&mut session, &[hello, run]).expect("lower");

        let target = session.target(run);
        assert!(target.is_explicit());
        let action = target.actions().get("run").expect("run action");
        assert!(action.console);
        assert_eq!(
            action.commands.first().map(Vec::as_slice),
            Some(
                [
                    "/build/cells/app/hello".to_owned(),
                    "--version".to_owned()
                ]
                .as_slice()
            )
        );
    }
}
