// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Workload processes.
//!
//! A workload is an external program the runner launches once. It may have a
//! preparation phase (creating work files) that runs to completion first, and
//! it tells the runner how to recognise that it is up.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{BenchResult, ConfigValidationError};
use crate::process::CommandSpec;
use crate::storage::EnteredPaths;
use crate::types::{FormatPattern, PowerOfTwo};

/// How the runner decides the workload is ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Ready as soon as the process is running.
    Spawned,
    /// Ready once a stdout line contains the marker.
    OutputLine(String),
}

pub trait Workload: Send + Sync {
    fn identity(&self) -> String;

    fn describe(&self) -> serde_json::Value;

    /// Run to completion before the timed phase.
    fn prepare_command(&self) -> Option<CommandSpec>;

    fn run_command(&self) -> CommandSpec;

    fn readiness(&self) -> Readiness;

    /// Ramp-up the workload itself excludes from its numbers, used when the
    /// runner has no explicit ramp-up configured.
    fn ramp_up_hint(&self) -> Option<Duration> {
        None
    }
}

/// Placeholders substituted into command workload arguments.
pub const MOUNT_PATH_PLACEHOLDER: &str = "{mount_path}";
pub const BLOCK_DEVICE_PLACEHOLDER: &str = "{block_device}";

/// Arbitrary program from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandWorkloadConfig {
    pub identity: String,
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub prepare_args: Option<Vec<String>>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub ready_marker: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandWorkload {
    config: CommandWorkloadConfig,
    args: Vec<String>,
    prepare_args: Option<Vec<String>>,
}

impl CommandWorkload {
    /// Bind the configuration to the entered stack, expanding
    /// `{mount_path}` and `{block_device}` in the arguments.
    pub fn new(config: CommandWorkloadConfig, paths: &EnteredPaths) -> BenchResult<Self> {
        let expand_all = |args: &[String]| -> BenchResult<Vec<String>> {
            args.iter().map(|a| expand(a, paths)).collect()
        };
        let args = expand_all(&config.args)?;
        let prepare_args = match &config.prepare_args {
            Some(prepare) => Some(expand_all(prepare)?),
            None => None,
        };
        Ok(Self {
            config,
            args,
            prepare_args,
        })
    }

    fn command(&self, args: &[String]) -> CommandSpec {
        let mut cmd = CommandSpec::new(&self.config.program).args(args.iter().cloned());
        for (key, value) in &self.config.env {
            cmd = cmd.env(key.as_str(), value.as_str());
        }
        if let Some(cwd) = &self.config.cwd {
            cmd = cmd.cwd(cwd);
        }
        cmd
    }
}

fn expand(arg: &str, paths: &EnteredPaths) -> BenchResult<String> {
    let mut out = arg.to_string();
    for (placeholder, value) in [
        (MOUNT_PATH_PLACEHOLDER, &paths.mount_path),
        (BLOCK_DEVICE_PLACEHOLDER, &paths.block_device),
    ] {
        if !out.contains(placeholder) {
            continue;
        }
        let value = value.as_ref().ok_or_else(|| ConfigValidationError::InvalidFieldValue {
            field: "args",
            value: arg.to_string(),
            reason: format!("storage stack exposes no value for {}", placeholder),
        })?;
        out = out.replace(placeholder, &value.display().to_string());
    }
    Ok(out)
}

impl Workload for CommandWorkload {
    fn identity(&self) -> String {
        self.config.identity.clone()
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "command",
            "config": self.config,
            "args": self.args,
        })
    }

    fn prepare_command(&self) -> Option<CommandSpec> {
        self.prepare_args.as_ref().map(|args| self.command(args))
    }

    fn run_command(&self) -> CommandSpec {
        self.command(&self.args)
    }

    fn readiness(&self) -> Readiness {
        match &self.config.ready_marker {
            Some(marker) => Readiness::OutputLine(marker.clone()),
            None => Readiness::Spawned,
        }
    }
}

/// Where fio does its I/O.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FioTarget {
    /// One file per job below the stack's mount path. The pattern's
    /// placeholder receives fio's `$jobnum`.
    Fs { filename_format: FormatPattern },
    /// The stack's block device, opened `O_DIRECT`.
    Blockdev,
    /// The stack's devdax device through the `dev-dax` engine.
    Devdax,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FioConfig {
    pub fio: PathBuf,
    pub rw: String,
    pub blocksize: PowerOfTwo,
    pub size: PowerOfTwo,
    pub sync: bool,
    pub numjobs: u32,
    pub ramp_seconds: u64,
    pub runtime_seconds: u64,
    pub target: FioTarget,
}

#[derive(Debug, Clone)]
pub struct FioWorkload {
    config: FioConfig,
    ioengine: &'static str,
    direct: bool,
    target_args: Vec<String>,
}

impl FioWorkload {
    pub fn new(config: FioConfig, paths: &EnteredPaths) -> BenchResult<Self> {
        let missing = |what: &str| ConfigValidationError::InvalidFieldValue {
            field: "target",
            value: format!("{:?}", config.target),
            reason: format!("storage stack exposes no {}", what),
        };

        let (ioengine, direct, target_args) = match &config.target {
            FioTarget::Fs { filename_format } => {
                let mount = paths.mount_path.as_ref().ok_or_else(|| missing("mount path"))?;
                let pattern = mount.join(filename_format.format("$jobnum"));
                (
                    "sync",
                    false,
                    vec![format!("--filename_format={}", pattern.display())],
                )
            }
            FioTarget::Blockdev => {
                let dev = paths.block_device.as_ref().ok_or_else(|| missing("block device"))?;
                (
                    "sync",
                    true,
                    vec![
                        format!("--filename={}", dev.display()),
                        "--allow_file_create=0".to_string(),
                    ],
                )
            }
            FioTarget::Devdax => {
                let dev = paths.block_device.as_ref().ok_or_else(|| missing("devdax device"))?;
                ("dev-dax", false, vec![format!("--filename={}", dev.display())])
            }
        };

        Ok(Self {
            config,
            ioengine,
            direct,
            target_args,
        })
    }

    fn common_args(&self) -> Vec<String> {
        let c = &self.config;
        let mut args = vec![
            "--name=stackbench".to_string(),
            format!("--ioengine={}", self.ioengine),
            format!("--rw={}", c.rw),
            format!("--size={}", c.size),
            format!("--blocksize={}", c.blocksize),
            format!("--sync={}", u8::from(c.sync)),
            format!("--direct={}", u8::from(self.direct)),
            format!("--numjobs={}", c.numjobs),
            "--group_reporting=1".to_string(),
        ];
        args.extend(self.target_args.iter().cloned());
        args
    }
}

impl Workload for FioWorkload {
    fn identity(&self) -> String {
        let target = match self.config.target {
            FioTarget::Fs { .. } => "fs",
            FioTarget::Blockdev => "blockdev",
            FioTarget::Devdax => "devdax",
        };
        format!(
            "fio-{}-{}-bs{}-nj{}-sync{}",
            target,
            self.config.rw,
            self.config.blocksize,
            self.config.numjobs,
            u8::from(self.config.sync)
        )
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "fio",
            "config": self.config,
            "ioengine": self.ioengine,
            "direct": self.direct,
        })
    }

    fn prepare_command(&self) -> Option<CommandSpec> {
        match self.config.target {
            FioTarget::Fs { .. } => Some(
                CommandSpec::new(&self.config.fio)
                    .args(self.common_args())
                    .arg("--create_only=1"),
            ),
            FioTarget::Blockdev | FioTarget::Devdax => None,
        }
    }

    fn run_command(&self) -> CommandSpec {
        CommandSpec::new(&self.config.fio)
            .args(self.common_args())
            .args([
                "--end_fsync=1".to_string(),
                "--time_based=1".to_string(),
                format!("--runtime={}", self.config.runtime_seconds),
                format!("--ramp_time={}", self.config.ramp_seconds),
                "--output-format=json+".to_string(),
            ])
    }

    fn readiness(&self) -> Readiness {
        Readiness::Spawned
    }

    fn ramp_up_hint(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.config.ramp_seconds))
    }
}
