//! Stackbench Core Library
//!
//! Engine for benchmarking storage stacks: builds a stack of storage layers
//! (device-mapper targets, ZFS pools, Linux filesystems), runs a workload on
//! top of it and measures counters over the workload's steady-state window.
//! Everything that is set up is torn down in reverse order.

pub mod config;
pub mod counters;
pub mod cpu_stats;
pub mod error;
pub mod inventory;
pub mod kstat;
pub mod measurement;
pub mod process;
pub mod result;
pub mod runner;
pub mod session;
pub mod stack;
pub mod storage;
pub mod sync;
pub mod telemetry;
pub mod types;
pub mod workload;

// Re-export commonly used types
pub use config::{BackingConfig, CollectorConfig, Config, ConfigLoader, NodeConfig, WorkloadConfig};
pub use counters::Update;
pub use error::{
    BenchError, BenchResult, ConfigValidationError, ProtocolViolation, SchemaDrift, SubprocessError,
};
pub use inventory::Inventory;
pub use measurement::{Collector, CollectorSet, MeasurementSession, Sampler};
pub use process::{CommandSpec, HostSystem, SystemOps};
pub use result::{BenchmarkRun, JsonSink, ResultSink};
pub use runner::{BenchmarkRunner, RunCanceller, RunOutcome, RunPhase, RunnerConfig};
pub use session::BenchSession;
pub use stack::{Resource, ResourceStack};
pub use storage::{build_node, Backing, EnteredPaths, NodeHandle, StorageNode};
pub use telemetry::StreamingTelemetryJoin;
pub use types::{CollectorName, DmName, PoolName, PowerOfTwo, SectorSize};
pub use workload::{CommandWorkload, FioWorkload, Readiness, Workload};
