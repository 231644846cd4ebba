// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::PathBuf;

/// Command line options.
#[derive(Debug, Parser)]
#[command(name = "porter", version, about = "Job-brokering service core.")]
pub struct Options {
    #[command(flatten)]
    pub global: GlobalOptions,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOptions {
    /// The configuration file.
    #[arg(
        short,
        long,
        env = "PORTER_CONFIG",
        default_value = "config.yaml",
        global = true
    )]
    pub config: PathBuf,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Validate the configuration.
    ///
    /// Parses the file, compiles every input schema, and verifies that
    /// every template substitution is shell-quoted. Exits non-zero on the
    /// first configuration error.
    Check,

    /// Run the job orchestrator until interrupted.
    Serve,
}
