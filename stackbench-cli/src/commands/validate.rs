// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! `stackbench validate` command - Validate configuration file.

use stackbench_core::{BackingConfig, CollectorConfig, ConfigLoader, NodeConfig, WorkloadConfig};

pub fn execute(file: &str) -> Result<(), Box<dyn std::error::Error>> {
    tracing::info!(file = %file, "Validating configuration");

    match ConfigLoader::load_file(file) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!();
            println!("Inventory:");
            for label in config.inventory.labels() {
                let devices: Vec<String> = config
                    .inventory
                    .get_all(label)
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect();
                println!("  @{:<12} {}", label, devices.join(", "));
            }
            println!();
            println!("Storage Stack:");
            print_node(&config.storage_stack, 1);
            println!();
            match &config.workload {
                WorkloadConfig::Fio(fio) => println!(
                    "Workload: fio {} bs={} numjobs={} ramp={}s runtime={}s",
                    fio.rw, fio.blocksize, fio.numjobs, fio.ramp_seconds, fio.runtime_seconds
                ),
                WorkloadConfig::Command(command) => println!(
                    "Workload: {} ({})",
                    command.identity,
                    command.program.display()
                ),
            }
            println!();
            println!("Collectors ({}):", config.collectors.len());
            for collector in &config.collectors {
                let kind = match collector {
                    CollectorConfig::CpuTime { .. } => "cpu_time".to_string(),
                    CollectorConfig::Kstat { path, .. } => format!("kstat {}", path.display()),
                    CollectorConfig::Telemetry {
                        command,
                        start_timeout_ms,
                        ..
                    } => format!("telemetry `{}` (start timeout: {}ms)", command, start_timeout_ms),
                };
                println!("  - {}: {}", collector.name(), kind);
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed:");
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }
}

fn print_node(node: &NodeConfig, depth: usize) {
    let indent = "  ".repeat(depth);
    let backings: Vec<&BackingConfig> = match node {
        NodeConfig::RawBlockDevice { device, dax } => {
            println!("{}raw_block_device {}{}", indent, device, if *dax { " (dax)" } else { "" });
            Vec::new()
        }
        NodeConfig::DevDax { device } => {
            println!("{}dev_dax {}", indent, device);
            Vec::new()
        }
        NodeConfig::DmLinear { name, size, backing } => {
            println!("{}dm_linear {} ({})", indent, name, size);
            vec![backing]
        }
        NodeConfig::DmStripe {
            name,
            chunk_sectors,
            backings,
        } => {
            println!("{}dm_stripe {} (chunk: {} sectors)", indent, name, chunk_sectors);
            backings.iter().collect()
        }
        NodeConfig::DmWritecache {
            name,
            size,
            origin,
            cache,
            ..
        } => {
            println!("{}dm_writecache {} ({})", indent, name, size);
            vec![origin, cache]
        }
        NodeConfig::ZfsPool(spec) => {
            println!(
                "{}zfs_pool {} at {} on [{}]",
                indent,
                spec.pool,
                spec.mountpoint.display(),
                spec.vdevs.join(" ")
            );
            Vec::new()
        }
        NodeConfig::Filesystem {
            fstype,
            mountpoint,
            dax,
            backing,
        } => {
            println!(
                "{}{} at {}{}",
                indent,
                fstype,
                mountpoint.display(),
                if *dax { " (dax)" } else { "" }
            );
            vec![backing]
        }
    };

    for backing in backings {
        match backing {
            BackingConfig::Device(reference) => println!("{}  {}", indent, reference),
            BackingConfig::Node(node) => print_node(node, depth + 1),
        }
    }
}
