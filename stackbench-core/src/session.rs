// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! One benchmark run from validated configuration to emitted record.
//!
//! Everything acquired on the way (the storage stack, telemetry collector
//! processes) goes onto a single [`ResourceStack`] and is released in
//! reverse order whether the run succeeded or not.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use crate::config::{CollectorConfig, Config, WorkloadConfig};
use crate::cpu_stats::CpuTimeSampler;
use crate::error::{BenchError, BenchResult};
use crate::kstat::KstatSampler;
use crate::measurement::{Collector, CollectorSet, MeasurementSession};
use crate::process::SystemOps;
use crate::result::{BenchmarkRun, ResultSink};
use crate::runner::{BenchmarkRunner, RunCanceller};
use crate::stack::ResourceStack;
use crate::storage::{build_node, EnteredPaths};
use crate::telemetry::StreamingTelemetryJoin;
use crate::workload::{CommandWorkload, FioWorkload, Workload};

/// Build the workload described by `config` against an entered stack.
pub fn build_workload(config: &WorkloadConfig, paths: &EnteredPaths) -> BenchResult<Box<dyn Workload>> {
    let workload: Box<dyn Workload> = match config {
        WorkloadConfig::Fio(fio) => Box::new(FioWorkload::new(fio.clone(), paths)?),
        WorkloadConfig::Command(command) => Box::new(CommandWorkload::new(command.clone(), paths)?),
    };
    Ok(workload)
}

/// Build the collectors. Telemetry collectors are spawned here, and a stop
/// action for each one is pushed onto `stack`.
pub fn build_collectors(
    configs: &[CollectorConfig],
    stack: &mut ResourceStack,
) -> BenchResult<CollectorSet> {
    let mut collectors = CollectorSet::new();
    for config in configs {
        let collector: Arc<dyn Collector> = match config {
            CollectorConfig::CpuTime { name, path } => {
                let sampler = match path {
                    Some(path) => CpuTimeSampler::with_path(path),
                    None => CpuTimeSampler::new(),
                };
                Arc::new(MeasurementSession::new(name.clone(), sampler))
            }
            CollectorConfig::Kstat {
                name,
                path,
                separator,
            } => Arc::new(MeasurementSession::new(
                name.clone(),
                KstatSampler::new(path, separator.as_str()),
            )),
            CollectorConfig::Telemetry {
                name,
                command,
                expected_keys,
                start_timeout_ms,
            } => {
                let join = Arc::new(StreamingTelemetryJoin::spawn(
                    name.clone(),
                    command,
                    expected_keys.clone(),
                    Duration::from_millis(*start_timeout_ms),
                )?);
                let stopping = Arc::clone(&join);
                stack.push(format!("telemetry {}", name), move || {
                    stopping.stop();
                    Ok(())
                })?;
                join
            }
        };
        collectors.register(collector)?;
    }
    Ok(collectors)
}

/// Executes runs for one validated configuration.
pub struct BenchSession {
    config: Config,
    ops: Arc<dyn SystemOps>,
    canceller: RunCanceller,
}

impl BenchSession {
    pub fn new(config: Config, ops: Arc<dyn SystemOps>) -> Self {
        Self {
            config,
            ops,
            canceller: RunCanceller::default(),
        }
    }

    /// Use a canceller shared with a signal handler.
    pub fn with_canceller(mut self, canceller: RunCanceller) -> Self {
        self.canceller = canceller;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// What would be set up and run, without touching the host.
    pub fn describe(&self) -> BenchResult<serde_json::Value> {
        let node = build_node(&self.config.storage_stack, &self.config.inventory, Arc::clone(&self.ops))?;
        let workload = serde_json::to_value(&self.config.workload).map_err(|e| BenchError::Parse {
            context: "workload".to_string(),
            message: e.to_string(),
        })?;
        let collectors: Vec<String> = self.config.collectors.iter().map(|c| c.name().to_string()).collect();
        Ok(json!({
            "storage_stack": node.describe(),
            "workload": workload,
            "runner": self.config.runner,
            "collectors": collectors,
        }))
    }

    /// Set up the stack, run the workload, emit the record, tear down.
    ///
    /// A run error wins over a teardown error; teardown errors are logged.
    pub fn execute(&self, sink: &mut dyn ResultSink) -> BenchResult<BenchmarkRun> {
        let node = build_node(&self.config.storage_stack, &self.config.inventory, Arc::clone(&self.ops))?;
        let target_description = node.describe();
        let identity = node.identity();

        if self.canceller.is_cancelled() {
            return Err(BenchError::Cancelled { workload: identity });
        }

        tracing::info!(stack = %identity, "Setting up storage stack");
        let mut stack = ResourceStack::new();
        let outcome = stack
            .acquire(node)
            .and_then(|paths| self.run_entered(&paths, target_description, &mut stack, sink));

        tracing::info!(stack = %identity, resources = stack.len(), "Tearing down");
        let released = stack.release();

        match (outcome, released) {
            (Ok(run), Ok(())) => Ok(run),
            (Ok(_), Err(teardown)) => Err(teardown),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown)) => {
                tracing::error!(error = %teardown, "Teardown failed after a failed run");
                Err(e)
            }
        }
    }

    fn run_entered(
        &self,
        paths: &EnteredPaths,
        target_description: serde_json::Value,
        stack: &mut ResourceStack,
        sink: &mut dyn ResultSink,
    ) -> BenchResult<BenchmarkRun> {
        let workload = build_workload(&self.config.workload, paths)?;
        let collectors = build_collectors(&self.config.collectors, stack)?;
        let runner = BenchmarkRunner::with_canceller(
            self.config.runner.to_runner_config(),
            collectors,
            self.canceller.clone(),
        );

        let started_at = Utc::now();
        let outcome = runner.run(workload.as_ref())?;
        let run = BenchmarkRun::new(
            started_at,
            workload.identity(),
            self.config.to_json()?,
            target_description,
            outcome,
        );
        tracing::info!(
            run_id = %run.run_id,
            workload = %run.workload_identity,
            steady_state_ms = run.timing.steady_state().as_millis() as u64,
            "Run completed"
        );

        sink.emit(&run)?;
        Ok(run)
    }
}
