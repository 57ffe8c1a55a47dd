//! Benchmark run records and where they go.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{BenchError, BenchResult};
use crate::runner::{RunOutcome, RunTiming};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkloadOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Everything recorded about one completed run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub workload_identity: String,
    pub config: serde_json::Value,
    pub target_description: serde_json::Value,
    pub collector_results: BTreeMap<String, serde_json::Value>,
    pub workload_output: WorkloadOutput,
    pub timing: RunTiming,
}

impl BenchmarkRun {
    pub fn new(
        started_at: DateTime<Utc>,
        workload_identity: impl Into<String>,
        config: serde_json::Value,
        target_description: serde_json::Value,
        outcome: RunOutcome,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at,
            finished_at: Utc::now(),
            workload_identity: workload_identity.into(),
            config,
            target_description,
            collector_results: outcome.collector_results,
            workload_output: WorkloadOutput {
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            },
            timing: outcome.timing,
        }
    }

    pub fn to_json_pretty(&self) -> BenchResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| BenchError::Parse {
            context: format!("run {}", self.run_id),
            message: e.to_string(),
        })
    }
}

/// Receives finished runs. The persistence format is the sink's business.
pub trait ResultSink {
    fn emit(&mut self, run: &BenchmarkRun) -> BenchResult<()>;
}

/// Writes each run as pretty JSON to stdout, or to a file.
#[derive(Debug, Default)]
pub struct JsonSink {
    path: Option<PathBuf>,
}

impl JsonSink {
    pub fn stdout() -> Self {
        Self { path: None }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

impl ResultSink for JsonSink {
    fn emit(&mut self, run: &BenchmarkRun) -> BenchResult<()> {
        let text = run.to_json_pretty()?;
        match &self.path {
            Some(path) => {
                fs::write(path, text + "\n")
                    .map_err(BenchError::io(format!("writing {}", path.display())))?;
                tracing::info!(run_id = %run.run_id, path = %path.display(), "Run record written");
            }
            None => {
                let mut out = std::io::stdout().lock();
                writeln!(out, "{}", text).map_err(BenchError::io("writing run record"))?;
            }
        }
        Ok(())
    }
}

/// Keeps runs in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub runs: Vec<BenchmarkRun>,
}

impl ResultSink for MemorySink {
    fn emit(&mut self, run: &BenchmarkRun) -> BenchResult<()> {
        self.runs.push(run.clone());
        Ok(())
    }
}
