//! Action-server protocol tests.

use camino::Utf8PathBuf;
use indexmap::IndexMap;
use serial_test::serial;

use craftr::graph::{BuildGraph, BuildNode};
use craftr::server::ActionServer;
use craftr::slave::BuildClient;

fn node(name: &str, command: &str) -> BuildNode {
    BuildNode {
        name: name.to_owned(),
        deps: Vec::new(),
        commands: vec![vec![command.to_owned()]],
        input_files: Vec::new(),
        output_files: Vec::new(),
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

fn three_node_graph() -> BuildGraph {
    let mut graph = BuildGraph::default();
    graph.insert(node("//a:x#0", "one"));
    graph.insert(node("//a:y#0", "two"));
    graph.insert(node("//b:z#run", "three"));
    graph
}

#[test]
fn concurrent_slaves_get_distinct_nodes() {
    let server = ActionServer::start(three_node_graph(), None).expect("start");
    let address = server.address();

    let requests = [("//a:x", "0"), ("//a:y", "0"), ("//b:z", "run")];
    let handles: Vec<_> = requests
        .into_iter()
        .map(|(target, operator)| {
            let address = address.clone();
            std::thread::spawn(move || {
                let mut client = BuildClient::connect(&address).expect("connect");
                client.fetch(target, operator, 0).expect("fetch")
            })
        })
        .collect();

    let mut names: Vec<String> = handles
        .into_iter()
        .map(|h| h.join().expect("thread").0.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["//a:x#0", "//a:y#0", "//b:z#run"]);
    server.stop();
}

#[test]
fn unknown_target_is_a_remote_error() {
    let server = ActionServer::start(three_node_graph(), None).expect("start");
    let mut client = BuildClient::connect(&server.address()).expect("connect");
    let err = client.fetch("//a:missing", "0", 0).expect_err("unknown");
    assert!(err.to_string().contains("does not exist"));
    server.stop();
}

#[test]
fn out_of_range_build_set_is_rejected() {
    let server = ActionServer::start(three_node_graph(), None).expect("start");
    let mut client = BuildClient::connect(&server.address()).expect("connect");
    let err = client.fetch("//a:x", "0", 5).expect_err("out of range");
    assert!(err.to_string().contains("out of range"));
    server.stop();
}

#[test]
fn hashes_match_the_local_graph() {
    let graph = three_node_graph();
    let expected = BuildGraph::hash(graph.get("//a:x#0").expect("node")).expect("hash");
    let server = ActionServer::start(graph, None).expect("start");
    let mut client = BuildClient::connect(&server.address()).expect("connect");
    let (_, hash, _) = client.fetch("//a:x", "0", 0).expect("fetch");
    assert_eq!(hash, expected);
    server.stop();
}

#[test]
fn reload_rereads_the_graph_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = Utf8PathBuf::from_path_buf(dir.path().join(".graph.json")).expect("utf8");
    three_node_graph().write(&path).expect("write");

    let server = ActionServer::start(BuildGraph::default(), Some(path)).expect("start");
    let mut client = BuildClient::connect(&server.address()).expect("connect");
    client.fetch("//a:x", "0", 0).expect_err("empty before reload");

    // The first connection stays usable after an error reply.
    client.reload_build_server().expect("reload");
    let (node, _, _) = client.fetch("//a:x", "0", 0).expect("after reload");
    assert_eq!(node.name, "//a:x#0");
    server.stop();
}

#[test]
#[serial]
fn slave_detects_stale_hashes() {
    let _lock = test_support::env_lock::EnvLock::acquire();
    let server = ActionServer::start(three_node_graph(), None).expect("start");
    unsafe { std::env::set_var(craftr::runner::BUILD_SERVER_ENV, server.address()) };

    let code = craftr::slave::run_node("//a:x#0^0000deadbeef", 0);
    assert_eq!(code, 1, "stale hash must fail the slave");

    unsafe { std::env::remove_var(craftr::runner::BUILD_SERVER_ENV) };
    server.stop();
}
