// Copyright (c) 2026 The porter developers.
// Part of porter, released under the BSD 3-Clause License.

#![warn(clippy::pedantic)]

use clap::Parser;
use log::{error, info};
use std::process::ExitCode;
use std::sync::Arc;

mod cli;

use cli::{Commands, Options};
use porter::application::ApplicationRegistry;
use porter::config::Configuration;
use porter::destination::PickerRegistry;
use porter::orchestrator::Orchestrator;
use porter::store::MemoryStore;

async fn main_detail() -> Result<(), Box<dyn std::error::Error>> {
    let options = Options::parse();

    let log_level = match options.global.verbose.log_level_filter() {
        clap_verbosity_flag::LevelFilter::Off => "off",
        clap_verbosity_flag::LevelFilter::Error => "error",
        clap_verbosity_flag::LevelFilter::Warn => "warn",
        clap_verbosity_flag::LevelFilter::Info => "info",
        clap_verbosity_flag::LevelFilter::Debug => "debug",
        clap_verbosity_flag::LevelFilter::Trace => "trace",
    };

    let env = env_logger::Env::default()
        .filter_or("PORTER_LOG", log_level)
        .write_style_or("PORTER_LOG_STYLE", "auto");
    env_logger::Builder::from_env(env).init();

    let configuration = Configuration::open(&options.global.config)?;
    let registry = Arc::new(ApplicationRegistry::from_config(&configuration)?);

    match options.command {
        Commands::Check => {
            println!(
                "Configuration OK: {} application(s), {} interactive application(s), {} destination(s).",
                registry.applications().count(),
                registry.interactive_applications().count(),
                configuration.destinations.len(),
            );
            for application in registry.applications() {
                match &application.summary {
                    Some(summary) => println!("  application '{}': {summary}", application.name),
                    None => println!("  application '{}'", application.name),
                }
            }
            for interactive in registry.interactive_applications() {
                println!("  interactive application '{}'", interactive.name);
            }
            for name in configuration.destination_names() {
                println!("  destination '{name}'");
            }
        }
        Commands::Serve => {
            // The in-memory store backs single-process deployments; the
            // HTTP boundary swaps in a persistent implementation.
            let store = Arc::new(MemoryStore::new());
            let orchestrator = Orchestrator::new(
                &configuration,
                registry,
                store,
                &PickerRegistry::built_in(),
            )?;

            orchestrator.startup().await?;
            let reconcile = tokio::spawn(Arc::clone(&orchestrator).reconcile_loop());

            info!("Serving jobs from '{}'.", orchestrator.job_root().display());
            tokio::signal::ctrl_c().await?;

            orchestrator.shutdown().await;
            let _ = reconcile.await;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(error) = main_detail().await {
        error!("{error}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
