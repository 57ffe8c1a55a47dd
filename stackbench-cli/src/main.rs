// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Stackbench CLI
//!
//! Command-line interface for running storage-stack benchmarks.

use clap::{Parser, Subcommand};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

mod commands;

/// Stackbench - storage-stack benchmarks with steady-state measurement windows
#[derive(Parser)]
#[command(name = "stackbench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Set up the storage stack, run the workload, tear everything down
    Run {
        /// Path to the benchmark YAML file
        #[arg(short, long)]
        config: String,

        /// Write the run record here instead of stdout
        #[arg(short, long)]
        output: Option<String>,
    },

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        file: String,
    },

    /// Show what a configuration would set up, without touching the host
    Describe {
        /// Path to the configuration file
        file: String,
    },
}

/// Failures of the CLI itself, as opposed to the benchmark.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("Failed to install SIGINT handler: {0}")]
    SignalHandler(#[from] ctrlc::Error),

    #[error("Failed to render output: {0}")]
    Render(#[from] serde_json::Error),
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr; stdout carries run records.
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level)))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run { config, output } => commands::run::execute(&config, output.as_deref()),
        Commands::Validate { file } => commands::validate::execute(&file),
        Commands::Describe { file } => commands::describe::execute(&file),
    }
}
