//! End-to-end lowering tests: scripts in, actions out.

use camino::{Utf8Path, Utf8PathBuf};
use craftr::graph::BuildGraph;
use craftr::lang;
use craftr::model::{FactoryRegistry, Session, TargetId};
use craftr::pipeline;
use craftr::script;

fn load_project(
    files: &[(&str, &str)],
) -> (Session, Vec<TargetId>, Utf8PathBuf, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("temp dir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
    for (name, text) in files {
        let path = root.join(name);
        if let Some(parent) = path.parent() {
            craftr::pathutil::makedirs(parent).expect("mkdir");
        }
        std::fs::write(&path, text).expect("write");
    }
    let mut session = Session::new(root.join("build"));
    let mut registry = FactoryRegistry::default();
    lang::register(&mut session, &mut registry).expect("register");
    script::load(&mut session, &registry, &root.join("build.craftr")).expect("load");
    let selected = session.default_selection();
    (session, selected, root, dir)
}

#[test]
fn single_c_binary_lowering() {
    let (mut session, selected, root, _dir) = load_project(&[(
        "build.craftr",
        concat!(
            "project: app\n",
            "targets:\n",
            "  hello:\n",
            "    type: cxx.binary\n",
            "    srcs: [hello.c]\n",
        ),
    )]);
    pipeline::lower(&mut session, &selected).expect("lower");

    let hello = session
        .resolve_ref(&"//app:hello".parse().expect("ref"), None)
        .expect("target");
    let target = session.target(hello);
    assert_eq!(target.actions().len(), 2);

    let build_dir = session.build_directory().to_path_buf();
    let compile = target.actions().get("compile_c").expect("compile");
    assert_eq!(
        compile.inputs.first().map(|f| f.path.clone()),
        Some(root.join("hello.c"))
    );
    assert_eq!(
        compile.outputs.first().map(|f| f.path.clone()),
        Some(build_dir.join("cells/app/obj/hello.o"))
    );
    let link = target.actions().get("1").expect("link");
    assert_eq!(
        link.outputs.first().map(|f| f.path.clone()),
        Some(build_dir.join("cells/app/hello"))
    );
}

#[test]
fn static_library_with_dependent_binary() {
    let files = [
        (
            "lib/build.craftr",
            concat!(
                "project: lib\n",
                "targets:\n",
                "  foo:\n",
                "    type: cxx.library\n",
                "    srcs: [foo.c]\n",
                "    exported_includes: [include]\n",
            ),
        ),
        (
            "build.craftr",
            concat!(
                "project: app\n",
                "imports: [lib]\n",
                "targets:\n",
                "  bar:\n",
                "    type: cxx.binary\n",
                "    srcs: [bar.c]\n",
                "    deps: [\"//lib:foo\"]\n",
            ),
        ),
    ];
    let (mut session, selected, root, _dir) = load_project(&files);
    pipeline::lower(&mut session, &selected).expect("lower");

    let foo = session
        .resolve_ref(&"//lib:foo".parse().expect("ref"), None)
        .expect("foo");
    let bar = session
        .resolve_ref(&"//app:bar".parse().expect("ref"), None)
        .expect("bar");

    // The only dependent is a binary: static linkage is inferred and the
    // archive is exported to the dependent's link line.
    let archive = session.build_directory().join("cells/lib/libfoo.a");
    let link_products = session
        .resolve_prop(bar, craftr::lang::cxx::LINK_PRODUCTS)
        .expect("resolve");
    assert_eq!(
        link_products.as_path_list().unwrap_or_default(),
        std::slice::from_ref(&archive)
    );

    let compile = session
        .target(bar)
        .actions()
        .get("compile_c")
        .expect("compile");
    let argv = compile.commands.first().expect("argv");
    let include_flag = format!("-I{}", root.join("lib/include"));
    assert!(argv.contains(&include_flag), "argv: {argv:?}");

    let link = session.target(bar).actions().get("1").expect("link");
    let argv = link.commands.first().expect("argv");
    assert!(argv.contains(&archive.as_str().to_owned()), "argv: {argv:?}");

    let graph = BuildGraph::from_session(&session).expect("graph");
    assert_eq!(graph.nodes().len(), 4);

    // Without the dependency only the library's two actions remain.
    let (mut lean, _, _, _dir2) = load_project(&[(
        "build.craftr",
        concat!(
            "project: lib\n",
            "targets:\n",
            "  foo:\n",
            "    type: cxx.library\n",
            "    srcs: [foo.c]\n",
        ),
    )]);
    let lean_selected = lean.default_selection();
    pipeline::lower(&mut lean, &lean_selected).expect("lower");
    let lean_graph = BuildGraph::from_session(&lean).expect("graph");
    assert_eq!(lean_graph.nodes().len(), 2);
    let _ = foo;
}

#[test]
fn foreach_build_produces_one_stanza_per_pair() {
    let (mut session, selected, _root, _dir) = load_project(&[(
        "build.craftr",
        concat!(
            "project: app\n",
            "targets:\n",
            "  tools:\n",
            "    type: cxx.build\n",
            "    srcs: [a.c, b.c]\n",
            "    outname: [a.exe, b.exe]\n",
        ),
    )]);
    pipeline::lower(&mut session, &selected).expect("lower");

    let tools = session
        .resolve_ref(&"//app:tools".parse().expect("ref"), None)
        .expect("target");
    let action = session
        .target(tools)
        .actions()
        .get("compile_c")
        .expect("action");
    assert!(action.foreach);
    assert_eq!(action.inputs.len(), 2);

    let graph = BuildGraph::from_session(&session).expect("graph");
    let manifest = craftr::ninja::emit(
        &graph,
        session.build_directory(),
        Utf8Path::new("/usr/bin/craftr"),
    )
    .expect("emit");
    let stanzas = manifest
        .lines()
        .filter(|l| l.starts_with("build ") && l.contains(": rule_"))
        .count();
    assert_eq!(stanzas, 2, "one build statement per (input, output) pair");
}

#[test]
fn duplicate_outputs_name_both_producers() {
    let (mut session, selected, _root, _dir) = load_project(&[(
        "build.craftr",
        concat!(
            "project: app\n",
            "targets:\n",
            "  one:\n",
            "    type: generic.build\n",
            "    commands: [[touch, \"${@out}\"]]\n",
            "    outputs: [x.o]\n",
            "  two:\n",
            "    type: generic.build\n",
            "    commands: [[touch, \"${@out}\"]]\n",
            "    outputs: [x.o]\n",
        ),
    )]);
    pipeline::lower(&mut session, &selected).expect("lower");

    let err = BuildGraph::from_session(&session).expect_err("duplicate output");
    let message = err.to_string();
    assert!(message.contains("//app:one#0"), "message: {message}");
    assert!(message.contains("//app:two#0"), "message: {message}");
}

#[test]
fn lowering_twice_produces_the_same_actions() {
    let (mut session, selected, _root, _dir) = load_project(&[(
        "build.craftr",
        concat!(
            "project: app\n",
            "targets:\n",
            "  hello:\n",
            "    type: cxx.binary\n",
            "    srcs: [hello.c]\n",
        ),
    )]);
    pipeline::lower(&mut session, &selected).expect("first");
    let before: Vec<String> = action_names(&session);
    pipeline::lower(&mut session, &selected).expect("second");
    assert_eq!(action_names(&session), before);
}

fn action_names(session: &Session) -> Vec<String> {
    session
        .target_ids()
        .into_iter()
        .flat_map(|id| {
            let target = session.target(id);
            let long = target.long_name();
            target
                .actions()
                .values()
                .map(|a| a.long_name(&long))
                .collect::<Vec<_>>()
        })
        .collect()
}
