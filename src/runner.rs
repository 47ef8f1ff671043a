//! CLI execution and command dispatch.
//!
//! Keeps `main` minimal: this module loads the build script, runs the
//! lowering pipeline, persists the graph, emits the Ninja manifest, and
//! drives either the Ninja subprocess (with the action server exported via
//! `CRAFTR_BUILD_SERVER`) or the direct executor.

use std::io::Write as _;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, anyhow, bail};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::{debug, info};

use crate::cli::{Backend, Cli};
use crate::executor::{self, ExecOptions};
use crate::graph::BuildGraph;
use crate::model::{Cache, FactoryRegistry, Session, TargetId, TargetRef};
use crate::ninja;
use crate::pathutil;
use crate::pipeline;
use crate::server::ActionServer;
use crate::slave;
use crate::{lang, script};

pub use ninja_env::{BUILD_SERVER_ENV, NINJA_ENV, VERBOSE_ENV};

/// Graph file name inside the build directory.
pub const GRAPH_FILE: &str = ".graph.json";
/// Session cache file name inside the build directory.
pub const CACHE_FILE: &str = ".cache.json";

/// Execute the parsed command line; returns the process exit code.
///
/// # Errors
///
/// Configuration and graph errors surface here (exit code 1); action
/// failures are returned as exit codes instead.
pub fn run(cli: &Cli) -> Result<i32> {
    if let Some(spec) = &cli.run_node {
        return Ok(slave::run_node(spec, cli.build_set));
    }

    let build_directory = pathutil::canonical(&cli.build_directory, None);
    let mut session = Session::new(build_directory.clone());
    session.cache = Cache::load(&build_directory.join(CACHE_FILE));

    let mut registry = FactoryRegistry::default();
    lang::register(&mut session, &mut registry)?;
    let main_cell = script::load(&mut session, &registry, &cli.file)?;

    let selected = select_targets(&session, &main_cell, &cli.targets)?;
    pipeline::lower(&mut session, &selected)?;
    let graph = BuildGraph::from_session(&session)?;

    if cli.dump_graphviz || cli.dump_svg {
        return dump_graph(&graph, cli.dump_svg);
    }

    let graph_path = build_directory.join(GRAPH_FILE);
    graph.write(&graph_path)?;
    debug!(graph = %graph_path, nodes = graph.nodes().len(), "graph written");

    emit_manifest(&session, &graph, &build_directory)?;

    let code = if cli.configure_only {
        0
    } else {
        match cli.backend {
            Backend::Ninja => {
                build_with_ninja(&session, graph, &build_directory, &selected, cli)?
            }
            Backend::Direct => build_direct(&session, &graph, &selected, cli)?,
        }
    };

    // The cache is only persisted on a clean exit.
    if code == 0 {
        session
            .cache
            .save(&build_directory.join(CACHE_FILE))
            .context("failed to save session cache")?;
    }
    Ok(code)
}

fn select_targets(
    session: &Session,
    main_cell: &str,
    requested: &[String],
) -> Result<Vec<TargetId>> {
    if requested.is_empty() {
        return Ok(session.default_selection());
    }
    requested
        .iter()
        .map(|name| {
            let reference: TargetRef = name.parse()?;
            Ok(session.resolve_ref(&reference, Some(main_cell))?)
        })
        .collect()
}

fn emit_manifest(
    session: &Session,
    graph: &BuildGraph,
    build_directory: &Utf8Path,
) -> Result<()> {
    let manifest_path = build_directory.join("build.ninja");
    if let (Ok(meta), Some(scripts_mtime)) = (
        std::fs::metadata(&manifest_path),
        BuildGraph::mtime(session.scripts()),
    ) && meta.modified().is_ok_and(|m| m >= scripts_mtime)
    {
        debug!(manifest = %manifest_path, "manifest up to date, not rewritten");
        return Ok(());
    }
    let exe = current_exe()?;
    let content = ninja::emit(graph, build_directory, &exe)?;
    ninja::write_manifest(build_directory, &content)?;
    info!(manifest = %manifest_path, "manifest written");
    Ok(())
}

fn current_exe() -> Result<Utf8PathBuf> {
    let exe = std::env::current_exe().context("failed to locate the tool binary")?;
    Utf8PathBuf::from_path_buf(exe).map_err(|p| anyhow!("non UTF-8 executable path: {p:?}"))
}

fn selected_phonies(session: &Session, selected: &[TargetId]) -> Vec<String> {
    let mut names = Vec::new();
    for &id in selected {
        let target = session.target(id);
        let long = target.long_name();
        for action in target.actions().values() {
            names.push(ninja::rule_name(&action.long_name(&long)));
        }
    }
    names
}

fn build_with_ninja(
    session: &Session,
    graph: BuildGraph,
    build_directory: &Utf8Path,
    selected: &[TargetId],
    cli: &Cli,
) -> Result<i32> {
    let ninja_program = ninja::ensure_ninja(build_directory, true)?;
    let phonies = selected_phonies(session, selected);
    let graph_path = build_directory.join(GRAPH_FILE);
    let server = ActionServer::start(graph, Some(graph_path))
        .context("failed to start the action server")?;
    let address = server.address();
    debug!(server = %address, ninja = %ninja_program, "starting ninja");

    let mut command = Command::new(&ninja_program);
    command
        .arg("-f")
        .arg(build_directory.join("build.ninja"))
        .env(ninja_env::BUILD_SERVER_ENV, &address);
    if let Some(jobs) = cli.jobs {
        command.arg("-j").arg(jobs.to_string());
    }
    if cli.clean {
        command.arg("-t").arg("clean");
    } else {
        command.args(&phonies);
    }
    let status = command
        .status()
        .with_context(|| format!("failed to run '{ninja_program}'"))?;
    server.stop();
    Ok(status.code().unwrap_or(1))
}

fn build_direct(
    session: &Session,
    graph: &BuildGraph,
    selected: &[TargetId],
    cli: &Cli,
) -> Result<i32> {
    if cli.clean {
        bail!("--clean requires the ninja backend");
    }
    let mut selection = Vec::new();
    for &id in selected {
        let target = session.target(id);
        let long = target.long_name();
        for action in target.actions().values() {
            if !action.explicit {
                selection.push(action.long_name(&long));
            }
        }
    }
    let options = ExecOptions {
        jobs: cli.jobs.unwrap_or_else(|| ExecOptions::default().jobs),
        verbose: cli.verbose,
    };
    match executor::execute(graph, &selection, &options) {
        Ok(()) => Ok(0),
        Err(executor::ExecError::ActionFailed { node, code }) => {
            tracing::error!(node = %node, code, "action failed");
            Ok(code)
        }
        Err(err) => Err(err.into()),
    }
}

fn dump_graph(graph: &BuildGraph, as_svg: bool) -> Result<i32> {
    let dot = graph.to_graphviz();
    if !as_svg {
        std::io::stdout()
            .write_all(dot.as_bytes())
            .context("failed to write DOT output")?;
        return Ok(0);
    }
    let mut child = Command::new("dot")
        .arg("-Tsvg")
        .stdin(Stdio::piped())
        .spawn()
        .context("failed to run 'dot'; is graphviz installed?")?;
    if let Some(stdin) = child.stdin.as_mut() {
        stdin
            .write_all(dot.as_bytes())
            .context("failed to feed 'dot'")?;
    }
    let status = child.wait().context("failed to wait for 'dot'")?;
    Ok(status.code().unwrap_or(1))
}
