//! Application entry point.
//!
//! Parses command-line arguments and delegates execution to
//! [`runner::run`]. Diagnostics go to stderr so stdout stays parseable.

use clap::Parser;
use craftr::{cli::Cli, runner};
use std::process::ExitCode;
use tracing::Level;
use tracing_subscriber::fmt;

fn main() -> ExitCode {
    let cli = Cli::parse();
    let max_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };
    fmt()
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .init();
    match runner::run(&cli) {
        Ok(code) => ExitCode::from(u8::try_from(code.clamp(0, 255)).unwrap_or(1)),
        Err(err) => {
            tracing::error!(error = %err, "craftr failed");
            ExitCode::FAILURE
        }
    }
}
