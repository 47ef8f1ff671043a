//! Direct in-process execution of the build graph.
//!
//! An alternative to the Ninja backend for platforms where Ninja is
//! unavailable, and the workhorse of the executor tests: the graph is
//! walked in topological order and each node's build sets are dispatched
//! to a small worker pool. Console nodes bypass the pool and run serially
//! on the scheduling thread so their output never interleaves.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::graph::{BuildGraph, BuildNode};
use crate::slave::execute_node;

/// Errors raised by the direct executor.
#[derive(Debug, Error)]
pub enum ExecError {
    /// A node failed; carries the exit code to propagate.
    #[error("action '{node}' failed with exit code {code}")]
    ActionFailed {
        /// The failing node.
        node: String,
        /// Its exit code.
        code: i32,
    },
    /// The graph contains a dependency cycle.
    #[error("dependency cycle involving: {}", nodes.join(", "))]
    Cycle {
        /// Nodes left unscheduled when the ready queue drained.
        nodes: Vec<String>,
    },
    /// A selected node does not exist.
    #[error("unknown build node '{0}'")]
    UnknownNode(String),
}

/// Executor configuration.
#[derive(Clone, Copy, Debug)]
pub struct ExecOptions {
    /// Worker pool size.
    pub jobs: usize,
    /// Print command lists before running them.
    pub verbose: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            jobs: std::thread::available_parallelism().map_or(2, |n| n.get()),
            verbose: false,
        }
    }
}

struct WorkItem {
    node: Arc<BuildNode>,
    build_set: usize,
    verbose: bool,
}

struct WorkResult {
    node: String,
    code: i32,
}

/// Execute `selection` (and everything it depends on) from `graph`.
///
/// An empty selection runs every non-explicit node. On failure no new
/// actions are scheduled, running ones complete, and the first failure is
/// reported.
///
/// # Errors
///
/// See [`ExecError`].
pub fn execute(
    graph: &BuildGraph,
    selection: &[String],
    options: &ExecOptions,
) -> Result<(), ExecError> {
    let wanted = expand_selection(graph, selection)?;
    let mut pending: HashMap<String, usize> = HashMap::new();
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    for name in &wanted {
        let node = graph.get(name).ok_or_else(|| ExecError::UnknownNode(name.clone()))?;
        let deps: Vec<&String> = node.deps.iter().filter(|d| wanted.contains(*d)).collect();
        pending.insert(name.clone(), deps.len());
        for dep in deps {
            dependents.entry(dep.clone()).or_default().push(name.clone());
        }
    }

    let mut ready: VecDeque<String> = pending
        .iter()
        .filter(|&(_, &count)| count == 0)
        .map(|(name, _)| name.clone())
        .collect();
    // Deterministic scheduling order for equal-priority nodes.
    ready.make_contiguous().sort();

    let (job_tx, job_rx) = mpsc::channel::<WorkItem>();
    let (result_tx, result_rx) = mpsc::channel::<WorkResult>();
    let job_rx = Arc::new(Mutex::new(job_rx));
    let workers: Vec<_> = (0..options.jobs.max(1))
        .map(|_| spawn_worker(&job_rx, &result_tx))
        .collect();

    let outcome = schedule(graph, &mut ready, &mut pending, &dependents, options, &job_tx, &result_rx);

    drop(job_tx);
    for worker in workers {
        let _ = worker.join();
    }
    outcome
}

fn schedule(
    graph: &BuildGraph,
    ready: &mut VecDeque<String>,
    pending: &mut HashMap<String, usize>,
    dependents: &HashMap<String, Vec<String>>,
    options: &ExecOptions,
    job_tx: &mpsc::Sender<WorkItem>,
    result_rx: &mpsc::Receiver<WorkResult>,
) -> Result<(), ExecError> {
    let total = pending.len();
    let mut completed = 0usize;
    let mut in_flight: HashMap<String, usize> = HashMap::new();
    let mut failure: Option<ExecError> = None;

    while completed < total {
        if failure.is_none() {
            while let Some(name) = ready.pop_front() {
                if failure.is_some() {
                    break;
                }
                let Some(node) = graph.get(&name) else {
                    continue;
                };
                let node = Arc::new(node.clone());
                let sets = node.build_sets();
                if node.console || node.syncio {
                    // Console pool of one: run serially, right here.
                    let mut code = 0;
                    for build_set in 0..sets {
                        code = execute_node(&node, build_set, &node.additional_args, options.verbose);
                        if code != 0 {
                            break;
                        }
                    }
                    finish(
                        &name,
                        code,
                        pending,
                        dependents,
                        ready,
                        &mut completed,
                        &mut failure,
                    );
                    continue;
                }
                in_flight.insert(name.clone(), sets);
                for build_set in 0..sets {
                    let item = WorkItem {
                        node: Arc::clone(&node),
                        build_set,
                        verbose: options.verbose,
                    };
                    if job_tx.send(item).is_err() {
                        return Err(ExecError::ActionFailed {
                            node: name.clone(),
                            code: 1,
                        });
                    }
                }
            }
        }

        if in_flight.is_empty() {
            break;
        }
        let Ok(result) = result_rx.recv() else {
            break;
        };
        let remaining = {
            let entry = in_flight.entry(result.node.clone()).or_insert(1);
            *entry -= 1;
            *entry
        };
        if result.code != 0 && failure.is_none() {
            failure = Some(ExecError::ActionFailed {
                node: result.node.clone(),
                code: result.code,
            });
        }
        if remaining == 0 {
            in_flight.remove(&result.node);
            finish(
                &result.node,
                i32::from(failure.is_some()),
                pending,
                dependents,
                ready,
                &mut completed,
                &mut failure,
            );
        }
    }

    if let Some(err) = failure {
        return Err(err);
    }
    if completed < total {
        let mut stuck: Vec<String> = pending
            .iter()
            .filter(|&(_, &count)| count > 0)
            .map(|(name, _)| name.clone())
            .collect();
        stuck.sort();
        if !stuck.is_empty() {
            return Err(ExecError::Cycle { nodes: stuck });
        }
    }
    Ok(())
}

fn finish(
    name: &str,
    code: i32,
    pending: &mut HashMap<String, usize>,
    dependents: &HashMap<String, Vec<String>>,
    ready: &mut VecDeque<String>,
    completed: &mut usize,
    failure: &mut Option<ExecError>,
) {
    *completed += 1;
    pending.remove(name);
    if code != 0 {
        if failure.is_none() {
            *failure = Some(ExecError::ActionFailed {
                node: name.to_owned(),
                code,
            });
        }
        return;
    }
    if failure.is_some() {
        return;
    }
    for dependent in dependents.get(name).map_or(&[][..], Vec::as_slice) {
        if let Some(count) = pending.get_mut(dependent) {
            *count -= 1;
            if *count == 0 {
                ready.push_back(dependent.clone());
            }
        }
    }
}

fn spawn_worker(
    jobs: &Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    results: &mpsc::Sender<WorkResult>,
) -> std::thread::JoinHandle<()> {
    let jobs = Arc::clone(jobs);
    let results = results.clone();
    std::thread::spawn(move || {
        loop {
            let item = {
                let Ok(guard) = jobs.lock() else {
                    return;
                };
                guard.recv()
            };
            let Ok(item) = item else {
                return;
            };
            let code = execute_node(
                &item.node,
                item.build_set,
                &item.node.additional_args,
                item.verbose,
            );
            if results
                .send(WorkResult {
                    node: item.node.name.clone(),
                    code,
                })
                .is_err()
            {
                return;
            }
        }
    })
}

/// Expand a selection to its dependency closure; an empty selection means
/// every non-explicit node.
fn expand_selection(graph: &BuildGraph, selection: &[String]) -> Result<HashSet<String>, ExecError> {
    let roots: Vec<String> = if selection.is_empty() {
        graph
            .default_nodes()
            .iter()
            .map(|n| n.name.clone())
            .collect()
    } else {
        selection.to_vec()
    };
    let mut wanted = HashSet::new();
    let mut queue: VecDeque<String> = roots.into_iter().collect();
    while let Some(name) = queue.pop_front() {
        let node = graph
            .get(&name)
            .ok_or_else(|| ExecError::UnknownNode(name.clone()))?;
        if !wanted.insert(name) {
            continue;
        }
        for dep in &node.deps {
            queue.push_back(dep.clone());
        }
    }
    Ok(wanted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use indexmap::IndexMap;

    fn touch_node(name: &str, output: &Utf8PathBuf, deps: &[&str]) -> BuildNode {
        BuildNode {
            name: name.to_owned(),
            deps: deps.iter().map(|d| (*d).to_owned()).collect(),
            commands: vec![vec!["touch".into(), output.as_str().into()]],
            input_files: Vec::new(),
            output_files: vec![output.clone()],
            optional_outputs: Vec::new(),
            input_tags: IndexMap::new(),
            output_tags: IndexMap::new(),
            cwd: None,
            environ: IndexMap::new(),
            foreach: false,
            explicit: false,
            console: false,
            syncio: false,
            additional_args: Vec::new(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn executes_in_dependency_order() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let first = root.join("first");
        let second = root.join("second");

        let mut graph = BuildGraph::default();
        graph.insert(touch_node("//t:a#0", &first, &[]));
        // The second node fails unless the first output already exists.
        let mut check = touch_node("//t:b#0", &second, &["//t:a#0"]);
        check.commands = vec![vec![
            "sh".into(),
            "-c".into(),
            format!("test -f {first} && touch {second}"),
        ]];
        graph.insert(check);

        execute(&graph, &[], &ExecOptions { jobs: 4, verbose: false }).expect("build");
        assert!(first.exists());
        assert!(second.exists());
    }

    #[cfg(unix)]
    #[test]
    fn failures_stop_scheduling_dependents() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let never = root.join("never");

        let mut graph = BuildGraph::default();
        let mut failing = touch_node("//t:a#0", &root.join("unused"), &[]);
        failing.commands = vec![vec!["false".into()]];
        failing.output_files = Vec::new();
        graph.insert(failing);
        graph.insert(touch_node("//t:b#0", &never, &["//t:a#0"]));

        let err = execute(&graph, &[], &ExecOptions { jobs: 2, verbose: false })
            .expect_err("failure propagates");
        assert!(matches!(err, ExecError::ActionFailed { .. }));
        assert!(!never.exists());
    }

    #[cfg(unix)]
    #[test]
    fn foreach_pairs_run_independently() {
        let dir = tempfile::tempdir().expect("temp dir");
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8");
        let a = root.join("a.out");
        let b = root.join("b.out");

        let mut node = touch_node("//t:gen#0", &a, &[]);
        node.foreach = true;
        node.input_files = vec![a.clone(), b.clone()];
        node.output_files = vec![a.clone(), b.clone()];
        node.commands = vec![vec!["touch".into(), "${@out}".into()]];
        // Inputs do not exist on disk; the command only touches outputs.
        node.input_files = vec![root.join("x"), root.join("y")];
        let mut graph = BuildGraph::default();
        graph.insert(node);

        execute(&graph, &[], &ExecOptions { jobs: 4, verbose: false }).expect("build");
        assert!(a.exists());
        assert!(b.exists());
    }

    #[test]
    fn unknown_selection_is_reported() {
        let graph = BuildGraph::default();
        let err = execute(
            &graph,
            &["//t:missing#0".into()],
            &ExecOptions { jobs: 1, verbose: false },
        )
        .expect_err("unknown node");
        assert!(matches!(err, ExecError::UnknownNode(_)));
    }
}
