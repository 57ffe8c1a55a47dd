// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stackbench run` command - Run one benchmark.

use std::sync::Arc;

use stackbench_core::{BenchSession, ConfigLoader, HostSystem, JsonSink, RunCanceller};

use crate::CliError;

pub fn execute(config_path: &str, output: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(config = %config_path, "Loading benchmark configuration");

    let config = match ConfigLoader::load_file(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    };

    // SIGINT kills the workload; the stack is still torn down in order.
    let canceller = RunCanceller::default();
    {
        let canceller = canceller.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("Interrupted, cancelling run");
            canceller.cancel();
        })
        .map_err(CliError::from)?;
    }

    let mut sink = match output {
        Some(path) => JsonSink::file(path),
        None => JsonSink::stdout(),
    };
    let session = BenchSession::new(config, Arc::new(HostSystem)).with_canceller(canceller);

    match session.execute(&mut sink) {
        Ok(run) => {
            eprintln!(
                "✓ Run {} of {} completed ({}ms steady state)",
                run.run_id,
                run.workload_identity,
                run.timing.steady_state().as_millis()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Run failed:");
            eprintln!("  {}", e);
            std::process::exit(if e.is_cancelled() { 130 } else { 1 });
        }
    }
}
