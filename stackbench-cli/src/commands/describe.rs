// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stackbench describe` command - Print what a configuration would set up.

use std::sync::Arc;

use stackbench_core::{BenchSession, ConfigLoader, HostSystem};

use crate::CliError;

pub fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    let described = ConfigLoader::load_file(file)
        .and_then(|config| BenchSession::new(config, Arc::new(HostSystem)).describe());

    match described {
        Ok(description) => {
            let text = serde_json::to_string_pretty(&description).map_err(CliError::from)?;
            println!("{}", text);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Cannot describe {}:", file);
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}
