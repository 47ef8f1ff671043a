//! Command line interface definition using clap.

use camino::Utf8PathBuf;
use clap::{Parser, ValueEnum};

/// Execution backend for the build phase.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum Backend {
    /// Emit a manifest and drive Ninja (default).
    #[default]
    Ninja,
    /// Execute the graph in-process.
    Direct,
}

/// A meta build system that lowers target graphs into Ninja manifests.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the build script (or a directory containing one).
    #[arg(short, long, value_name = "FILE", default_value = crate::script::DEFAULT_SCRIPT)]
    pub file: Utf8PathBuf,

    /// Root directory for all generated artefacts.
    #[arg(short = 'd', long, value_name = "DIR", default_value = "build")]
    pub build_directory: Utf8PathBuf,

    /// Configure and emit the manifest, but do not build.
    #[arg(long)]
    pub configure_only: bool,

    /// Set the number of parallel build jobs.
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Execution backend.
    #[arg(long, value_enum, default_value_t = Backend::Ninja)]
    pub backend: Backend,

    /// Clean build outputs instead of building.
    #[arg(long)]
    pub clean: bool,

    /// Write a GraphViz representation of the action graph to stdout.
    #[arg(long)]
    pub dump_graphviz: bool,

    /// Render an SVG of the action graph; requires the `dot` command.
    #[arg(long)]
    pub dump_svg: bool,

    /// Internal: act as a build slave for one node (`<name>^<hash>`).
    #[arg(long, value_name = "NODE", hide = true)]
    pub run_node: Option<String>,

    /// Internal: foreach index for `--run-node`.
    #[arg(long, value_name = "N", default_value_t = 0, hide = true)]
    pub build_set: usize,

    /// Enable verbose diagnostic logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Targets to build (`//cell:name` or `:name`); defaults to every
    /// non-explicit target.
    #[arg(value_name = "TARGET")]
    pub targets: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_applied() {
        let cli = Cli::parse_from(["craftr"]);
        assert_eq!(cli.file, Utf8PathBuf::from("build.craftr"));
        assert_eq!(cli.build_directory, Utf8PathBuf::from("build"));
        assert_eq!(cli.backend, Backend::Ninja);
        assert!(!cli.configure_only);
    }

    #[test]
    fn run_node_mode_parses() {
        let cli = Cli::parse_from([
            "craftr",
            "--build-directory",
            "out",
            "--run-node",
            "//app:hello#compile_c^abc",
            "--build-set",
            "2",
        ]);
        assert_eq!(cli.run_node.as_deref(), Some("//app:hello#compile_c^abc"));
        assert_eq!(cli.build_set, 2);
    }

    #[test]
    fn targets_are_positional() {
        let cli = Cli::parse_from(["craftr", "//app:hello", ":world"]);
        assert_eq!(cli.targets, vec!["//app:hello", ":world"]);
    }
}
