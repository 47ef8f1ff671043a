//! Build-slave mode.
//!
//! Every Ninja rule re-invokes the tool with `--run-node <name>^<hash>`.
//! The slave fetches the node definition from the action server, checks the
//! hash against the manifest, renders the command templates for its build
//! set, executes them sequentially, and verifies the declared outputs.
//! All reporting goes to stderr; stdout stays clean for downstream tools.

use std::net::TcpStream;
use std::process::Command;

use camino::Utf8PathBuf;
use serde_json::json;

use crate::graph::BuildNode;
use crate::pathutil;
use crate::server::{ServerError, read_frame, write_frame};
use crate::shell;

/// Client side of the action-server protocol.
#[derive(Debug)]
pub struct BuildClient {
    stream: TcpStream,
}

impl BuildClient {
    /// Connect to the address in `CRAFTR_BUILD_SERVER`.
    ///
    /// # Errors
    ///
    /// Fails when the variable is unset or the connection is refused.
    pub fn from_env() -> Result<Self, ServerError> {
        let address = std::env::var(ninja_env::BUILD_SERVER_ENV).map_err(|_| {
            ServerError::Remote(format!(
                "{} is not set; slave mode requires a running action server",
                ninja_env::BUILD_SERVER_ENV
            ))
        })?;
        Self::connect(&address)
    }

    /// Connect to an explicit `host:port` address.
    ///
    /// # Errors
    ///
    /// Fails when the connection is refused.
    pub fn connect(address: &str) -> Result<Self, ServerError> {
        Ok(Self {
            stream: TcpStream::connect(address)?,
        })
    }

    /// Fetch the node for `target#operator` and the given build set.
    ///
    /// # Errors
    ///
    /// Surfaces server-side errors as [`ServerError::Remote`].
    pub fn fetch(
        &mut self,
        target: &str,
        operator: &str,
        build_set: usize,
    ) -> Result<(BuildNode, String, Vec<String>), ServerError> {
        let reply = self.exchange(&json!({
            "target": target,
            "operator": operator,
            "build_set": build_set,
        }))?;
        let data = reply
            .get("data")
            .ok_or_else(|| ServerError::Remote("reply carries no data".into()))?;
        let node: BuildNode = serde_json::from_value(
            data.get("target")
                .cloned()
                .ok_or_else(|| ServerError::Remote("reply carries no target".into()))?,
        )?;
        let hash = data
            .get("hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let additional_args = data
            .get("additional_args")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        Ok((node, hash, additional_args))
    }

    /// Ask the server to re-read the on-disk graph.
    ///
    /// # Errors
    ///
    /// Surfaces server-side errors as [`ServerError::Remote`].
    pub fn reload_build_server(&mut self) -> Result<(), ServerError> {
        self.exchange(&json!({ "reload_build_server": true }))?;
        Ok(())
    }

    fn exchange(&mut self, request: &serde_json::Value) -> Result<serde_json::Value, ServerError> {
        write_frame(&mut self.stream, request.to_string().as_bytes())?;
        let payload = read_frame(&mut self.stream)?.ok_or(ServerError::Disconnected)?;
        let reply: serde_json::Value = serde_json::from_slice(&payload)?;
        if let Some(error) = reply.get("error").and_then(|v| v.as_str()) {
            return Err(ServerError::Remote(error.to_owned()));
        }
        Ok(reply)
    }
}

/// Substitute `${@tag}` / `${<tag}` tokens in the node's commands for one
/// build set.
///
/// An argument consisting of a single token splices the whole file list
/// into the argv; embedded tokens are replaced by the space-joined list.
#[must_use]
pub fn render_commands(node: &BuildNode, build_set: usize) -> Vec<Vec<String>> {
    node.commands
        .iter()
        .map(|command| {
            let mut argv = Vec::with_capacity(command.len());
            for arg in command {
                if let Some(files) = whole_token(arg).map(|t| select(node, build_set, t)) {
                    argv.extend(files.into_iter().map(Utf8PathBuf::into_string));
                } else {
                    argv.push(replace_tokens(node, build_set, arg));
                }
            }
            argv
        })
        .collect()
}

fn whole_token(arg: &str) -> Option<&str> {
    let inner = arg.strip_prefix("${")?.strip_suffix('}')?;
    (!inner.contains('}')).then_some(inner)
}

fn select(node: &BuildNode, build_set: usize, token: &str) -> Vec<Utf8PathBuf> {
    let Some(sigil) = token.chars().next() else {
        return Vec::new();
    };
    let tag = token.get(1..).unwrap_or_default();
    match (sigil, tag) {
        ('<', "in") => node.inputs_for(build_set),
        ('@', "out") => node.outputs_for(build_set),
        ('<', tag) if !tag.is_empty() => {
            node.input_tags.get(tag).cloned().unwrap_or_default()
        }
        ('@', tag) if !tag.is_empty() => {
            node.output_tags.get(tag).cloned().unwrap_or_default()
        }
        _ => Vec::new(),
    }
}

fn replace_tokens(node: &BuildNode, build_set: usize, arg: &str) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(start) = rest.find("${") {
        let Some(end) = rest[start..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let token = &rest[start + 2..start + end];
        let files = select(node, build_set, token);
        out.push_str(
            &files
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        );
        rest = &rest[start + end + 1..];
    }
    out.push_str(rest);
    out
}

/// Print the command list of a node, marking the failing command.
fn print_command_list(node: &BuildNode, commands: &[Vec<String>], current: Option<usize>) {
    if let Some(cwd) = &node.cwd {
        eprintln!("Working directory: {cwd}");
    }
    eprintln!("Command list:");
    for (index, command) in commands.iter().enumerate() {
        let marker = if current == Some(index) { ">" } else { " " };
        let rendered = command
            .iter()
            .map(|arg| shell::quote(arg))
            .collect::<Vec<_>>()
            .join(" ");
        eprintln!("{marker} $ {rendered}");
    }
}

/// Execute one build set of `node` with the slave semantics.
///
/// Returns the process exit code to propagate: the child's code on
/// failure, 127 when a program is missing, 1 when declared outputs are
/// absent despite success.
#[must_use]
pub fn execute_node(
    node: &BuildNode,
    build_set: usize,
    additional_args: &[String],
    verbose: bool,
) -> i32 {
    // Ensure the output directories exist before anything runs.
    for output in node
        .outputs_for(build_set)
        .iter()
        .chain(&node.optional_outputs)
    {
        if let Some(parent) = output.parent()
            && let Err(err) = pathutil::makedirs(parent)
        {
            eprintln!("craftr: fatal: can not create '{parent}': {err}");
            return 1;
        }
    }

    let mut commands = render_commands(node, build_set);
    if let (Some(last), false) = (commands.last_mut(), additional_args.is_empty()) {
        last.extend(additional_args.iter().cloned());
    }

    if verbose {
        print_command_list(node, &commands, None);
    }

    for (index, command) in commands.iter().enumerate() {
        let Some((program, args)) = command.split_first() else {
            continue;
        };
        let mut child = Command::new(program);
        child.args(args);
        child.envs(node.environ.iter());
        if let Some(cwd) = &node.cwd {
            child.current_dir(cwd);
        }
        let status = match child.status() {
            Ok(status) => status,
            Err(err) => {
                let code = shell::spawn_error_code(&err);
                eprintln!("craftr: error: {program}: {err}");
                report_failure(node, &commands, index, code);
                return code;
            }
        };
        if !status.success() {
            let code = status.code().unwrap_or(1);
            report_failure(node, &commands, index, code);
            return code;
        }
    }

    verify_outputs(node, build_set, &commands)
}

fn report_failure(node: &BuildNode, commands: &[Vec<String>], index: usize, code: i32) {
    eprintln!();
    eprintln!("{}", "-".repeat(60));
    eprintln!("craftr: fatal: \"{}\" exited with code {code}.", node.name);
    print_command_list(node, commands, Some(index));
    eprintln!("{}", "-".repeat(60));
    eprintln!();
}

fn verify_outputs(node: &BuildNode, build_set: usize, commands: &[Vec<String>]) -> i32 {
    let required = node.outputs_for(build_set);
    let missing: Vec<&Utf8PathBuf> = required.iter().filter(|p| !p.exists()).collect();
    if !missing.is_empty() {
        eprintln!();
        eprintln!("{}", "-".repeat(60));
        eprintln!(
            "craftr: fatal: \"{}\" produced only {} of {} listed output files.",
            node.name,
            required.len() - missing.len(),
            required.len()
        );
        eprintln!("The missing files are:");
        for path in missing {
            eprintln!("  - {path}");
        }
        print_command_list(node, commands, None);
        eprintln!("{}", "-".repeat(60));
        return 1;
    }

    let missing_optional: Vec<&Utf8PathBuf> = node
        .optional_outputs
        .iter()
        .filter(|p| !p.exists())
        .collect();
    if !missing_optional.is_empty() {
        eprintln!("craftr: warning: missing optional output files:");
        for path in missing_optional {
            eprintln!("  - {path}");
        }
    }
    0
}

/// Run the slave mode end to end for `--run-node <spec>`.
///
/// Returns the exit code for the process.
#[must_use]
pub fn run_node(spec: &str, build_set: usize) -> i32 {
    let (name, expected_hash) = match spec.split_once('^') {
        Some((name, hash)) => (name, Some(hash)),
        None => (spec, None),
    };
    let Some((target, operator)) = name.split_once('#') else {
        eprintln!("craftr: fatal: invalid node name '{name}', expected '//cell:target#action'");
        return 1;
    };

    let mut client = match BuildClient::from_env() {
        Ok(client) => client,
        Err(err) => {
            eprintln!("craftr: fatal: {err}");
            return 1;
        }
    };
    let (node, hash, additional_args) = match client.fetch(target, operator, build_set) {
        Ok(result) => result,
        Err(err) => {
            eprintln!("craftr: fatal: {err}");
            return 1;
        }
    };

    if let Some(expected) = expected_hash
        && expected != hash
    {
        eprintln!("craftr: fatal: build set hash inconsistency, try re-configuring");
        return 1;
    }

    let verbose = std::env::var(ninja_env::VERBOSE_ENV).as_deref() == Ok("true");
    execute_node(&node, build_set, &additional_args, verbose)
}
