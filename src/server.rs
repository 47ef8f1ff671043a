//! The action server.
//!
//! While Ninja runs, the tool listens on a localhost TCP port and serves
//! node definitions to build slaves on demand, so each slave avoids
//! reloading the entire graph. Frames are `[u32 big-endian length][UTF-8
//! JSON]` in both directions. Every slave opens its own connection;
//! requests on one connection are handled serially.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;

use camino::Utf8PathBuf;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::graph::BuildGraph;

/// Errors raised while running or talking to the action server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket I/O failed.
    #[error("action server I/O error: {0}")]
    Io(#[from] io::Error),
    /// A frame did not contain valid JSON.
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    /// The peer reported an error.
    #[error("{0}")]
    Remote(String),
    /// The peer closed the connection mid-exchange.
    #[error("connection closed unexpectedly")]
    Disconnected,
}

/// Upper bound on request frames; replies carry whole nodes and may be
/// larger, but no request comes close to this.
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// Read one length-prefixed frame. `Ok(None)` signals a clean EOF.
///
/// # Errors
///
/// Propagates socket errors and rejects oversized frames.
pub fn read_frame(stream: &mut impl Read) -> Result<Option<Vec<u8>>, ServerError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(ServerError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the limit"),
        )));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload)?;
    Ok(Some(payload))
}

/// Write one length-prefixed frame.
///
/// # Errors
///
/// Propagates socket errors.
pub fn write_frame(stream: &mut impl Write, payload: &[u8]) -> Result<(), ServerError> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        ServerError::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame too large",
        ))
    })?;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(payload)?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct Request {
    #[serde(default)]
    reload_build_server: bool,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    operator: Option<String>,
    #[serde(default)]
    build_set: usize,
}

/// A running action server.
///
/// Dropping the handle without calling [`ActionServer::stop`] leaves the
/// accept thread running until process exit.
#[derive(Debug)]
pub struct ActionServer {
    address: SocketAddr,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ActionServer {
    /// Bind to `localhost:0` and start serving `graph`.
    ///
    /// `graph_path` enables the `reload_build_server` request, which
    /// re-reads the on-disk graph (used by watch workflows).
    ///
    /// # Errors
    ///
    /// Fails when the socket can not be bound.
    pub fn start(
        graph: BuildGraph,
        graph_path: Option<Utf8PathBuf>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));
        let state = Arc::new(ServerState {
            graph: RwLock::new(graph),
            graph_path,
        });

        let accept_shutdown = Arc::clone(&shutdown);
        let handle = std::thread::spawn(move || {
            accept_loop(&listener, &accept_shutdown, &state);
        });
        tracing::debug!(address = %address, "action server listening");
        Ok(Self {
            address,
            shutdown,
            handle: Some(handle),
        })
    }

    /// The `host:port` string slaves connect to.
    #[must_use]
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    /// Stop accepting connections and join the accept thread.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Unblock the accept call with a throwaway connection.
        let _ = TcpStream::connect(self.address);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct ServerState {
    graph: RwLock<BuildGraph>,
    graph_path: Option<Utf8PathBuf>,
}

fn accept_loop(listener: &TcpListener, shutdown: &Arc<AtomicBool>, state: &Arc<ServerState>) {
    loop {
        let Ok((stream, peer)) = listener.accept() else {
            if shutdown.load(Ordering::SeqCst) {
                return;
            }
            continue;
        };
        if shutdown.load(Ordering::SeqCst) {
            return;
        }
        tracing::trace!(peer = %peer, "slave connected");
        let state = Arc::clone(state);
        std::thread::spawn(move || {
            if let Err(err) = serve_connection(stream, &state) {
                tracing::debug!(error = %err, "slave connection ended with error");
            }
        });
    }
}

fn serve_connection(mut stream: TcpStream, state: &ServerState) -> Result<(), ServerError> {
    while let Some(payload) = read_frame(&mut stream)? {
        let reply = match serde_json::from_slice::<Request>(&payload) {
            Ok(request) => handle_request(&request, state),
            Err(err) => json!({ "error": format!("malformed request: {err}") }),
        };
        write_frame(&mut stream, reply.to_string().as_bytes())?;
    }
    Ok(())
}

fn handle_request(request: &Request, state: &ServerState) -> serde_json::Value {
    if request.reload_build_server {
        return reload(state);
    }
    let (Some(target), Some(operator)) = (&request.target, &request.operator) else {
        return json!({ "error": "request must name a target and an operator" });
    };
    let name = format!("{target}#{operator}");
    let graph = match state.graph.read() {
        Ok(graph) => graph,
        Err(_) => return json!({ "error": "build graph lock poisoned" }),
    };
    let Some(node) = graph.get(&name) else {
        return json!({ "error": format!("build node \"{name}\" does not exist") });
    };
    if request.build_set >= node.build_sets() {
        return json!({
            "error": format!(
                "build set {} out of range for \"{name}\" ({} sets)",
                request.build_set,
                node.build_sets()
            )
        });
    }
    match BuildGraph::hash(node) {
        Ok(hash) => json!({
            "data": {
                "target": node,
                "hash": hash,
                "additional_args": node.additional_args,
            }
        }),
        Err(err) => json!({ "error": format!("{err}") }),
    }
}

fn reload(state: &ServerState) -> serde_json::Value {
    let Some(path) = &state.graph_path else {
        return json!({ "error": "server has no graph file to reload" });
    };
    match BuildGraph::read(path) {
        Ok(fresh) => match state.graph.write() {
            Ok(mut graph) => {
                *graph = fresh;
                json!({ "data": { "reloaded": true } })
            }
            Err(_) => json!({ "error": "build graph lock poisoned" }),
        },
        Err(err) => json!({ "error": format!("{err}") }),
    }
}
