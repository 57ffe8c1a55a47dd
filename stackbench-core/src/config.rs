// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! YAML configuration parser with strict schema validation.
//!
//! Everything is validated before any device is touched. Any invalid field
//! results in a `ConfigValidationError` and the run never starts.
//!
//! ```yaml
//! inventory:
//!   nvme: [/dev/nvme0n1p1]
//! storage_stack:
//!   kind: filesystem
//!   fstype: ext4
//!   mountpoint: /mnt/bench
//!   backing:
//!     kind: dm_linear
//!     name: bench-linear
//!     size_gib: 8
//!     backing: "@nvme"
//! workload:
//!   kind: fio
//!   rw: randwrite
//!   blocksize: 4096
//!   size: 1073741824
//!   numjobs: 4
//!   ramp_seconds: 2
//!   runtime_seconds: 30
//!   target: { type: fs, filename_format: "job{}" }
//! collectors:
//!   - { kind: cpu_time, name: cpu }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize, Serializer};

use crate::error::{BenchError, BenchResult, ConfigValidationError};
use crate::inventory::{Inventory, LABEL_PREFIX};
use crate::kstat::ZFS_KSTAT_DIR;
use crate::process::CommandSpec;
use crate::runner::RunnerConfig;
use crate::storage::{ChildDatasets, ChildZvols, FsType, KernelModule, ZfsPoolSpec};
use crate::telemetry::DEFAULT_START_TIMEOUT;
use crate::types::{CollectorName, DmName, FormatPattern, PoolName, PowerOfTwo, SectorSize};
use crate::workload::{CommandWorkloadConfig, FioConfig, FioTarget};

const DEFAULT_WRITECACHE_BLOCKSIZE: u64 = 4096;
const DEFAULT_KSTAT_SEPARATOR: &str = "|";

fn default_start_timeout_ms() -> u64 {
    DEFAULT_START_TIMEOUT.as_millis() as u64
}

fn default_fio() -> PathBuf {
    PathBuf::from("fio")
}

fn default_zpool() -> PathBuf {
    PathBuf::from("zpool")
}

fn default_zfs() -> PathBuf {
    PathBuf::from("zfs")
}

// =============================================================================
// Raw configuration as parsed from YAML (before validation)
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBacking {
    Device(String),
    Node(Box<RawNode>),
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawNode {
    RawBlockDevice {
        device: String,
        #[serde(default)]
        dax: bool,
    },
    DevDax {
        device: String,
    },
    DmLinear {
        name: String,
        size_bytes: Option<u64>,
        size_gib: Option<u64>,
        backing: RawBacking,
    },
    DmStripe {
        name: String,
        chunk_sectors: Option<u64>,
        backings: Vec<RawBacking>,
    },
    DmWritecache {
        name: String,
        size_bytes: Option<u64>,
        size_gib: Option<u64>,
        blocksize: Option<u64>,
        origin: RawBacking,
        cache: RawBacking,
        #[serde(default)]
        options: BTreeMap<String, u64>,
    },
    ZfsPool(RawZfsPool),
    Filesystem {
        fstype: FsType,
        mountpoint: PathBuf,
        #[serde(default)]
        dax: bool,
        backing: RawBacking,
    },
}

#[derive(Debug, Deserialize)]
struct RawZfsPool {
    #[serde(default = "default_zpool")]
    zpool: PathBuf,
    #[serde(default = "default_zfs")]
    zfs: PathBuf,
    pool: String,
    mountpoint: PathBuf,
    vdevs: Vec<String>,
    #[serde(default)]
    pool_properties: BTreeMap<String, String>,
    #[serde(default)]
    filesystem_properties: BTreeMap<String, String>,
    child_datasets: Option<RawChildDatasets>,
    child_zvols: Option<RawChildZvols>,
    #[serde(default)]
    modules: Vec<RawKernelModule>,
}

#[derive(Debug, Deserialize)]
struct RawChildDatasets {
    name_format: FormatPattern,
    dirname_format: FormatPattern,
    count: u32,
}

#[derive(Debug, Deserialize)]
struct RawChildZvols {
    name_format: FormatPattern,
    count: u32,
    size: String,
    volblocksize: u64,
}

#[derive(Debug, Deserialize)]
struct RawKernelModule {
    name: String,
    path: PathBuf,
    #[serde(default)]
    params: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawWorkload {
    Fio(RawFio),
    Command(CommandWorkloadConfig),
}

#[derive(Debug, Deserialize)]
struct RawFio {
    #[serde(default = "default_fio")]
    fio: PathBuf,
    rw: Option<String>,
    blocksize: Option<u64>,
    size: Option<u64>,
    #[serde(default)]
    sync: bool,
    numjobs: Option<i64>,
    ramp_seconds: Option<i64>,
    runtime_seconds: Option<i64>,
    target: FioTarget,
}

#[derive(Debug, Default, Deserialize)]
struct RawRunner {
    ramp_up_seconds: Option<f64>,
    readiness_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RawCollector {
    CpuTime {
        name: String,
        path: Option<PathBuf>,
    },
    Kstat {
        name: String,
        path: PathBuf,
        separator: Option<String>,
    },
    Telemetry {
        name: String,
        program: PathBuf,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: BTreeMap<String, String>,
        expected_keys: Option<BTreeSet<String>>,
        #[serde(default = "default_start_timeout_ms")]
        start_timeout_ms: u64,
    },
}

/// Raw root configuration file.
#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    inventory: Inventory,
    storage_stack: RawNode,
    workload: RawWorkload,
    #[serde(default)]
    runner: RawRunner,
    #[serde(default)]
    collectors: Vec<RawCollector>,
}

// =============================================================================
// Validated configuration
// =============================================================================

/// Where a node gets its block device from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum BackingConfig {
    /// A device path or `@label` inventory reference.
    Device(String),
    Node(Box<NodeConfig>),
}

/// One layer of the storage stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeConfig {
    RawBlockDevice {
        device: String,
        dax: bool,
    },
    DevDax {
        device: String,
    },
    DmLinear {
        name: DmName,
        size: SectorSize,
        backing: BackingConfig,
    },
    DmStripe {
        name: DmName,
        chunk_sectors: PowerOfTwo,
        backings: Vec<BackingConfig>,
    },
    DmWritecache {
        name: DmName,
        size: SectorSize,
        blocksize: PowerOfTwo,
        origin: BackingConfig,
        cache: BackingConfig,
        options: BTreeMap<String, u64>,
    },
    ZfsPool(ZfsPoolSpec),
    Filesystem {
        fstype: FsType,
        mountpoint: PathBuf,
        dax: bool,
        backing: BackingConfig,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkloadConfig {
    Fio(FioConfig),
    Command(CommandWorkloadConfig),
}

/// Runner timing as configured, already converted to durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunnerSettings {
    #[serde(rename = "ramp_up_seconds", serialize_with = "serialize_seconds")]
    pub ramp_up: Option<Duration>,
    #[serde(rename = "readiness_timeout_ms", serialize_with = "serialize_millis")]
    pub readiness_timeout: Option<Duration>,
}

impl RunnerSettings {
    pub fn to_runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            ramp_up: self.ramp_up,
            readiness_timeout: self.readiness_timeout,
        }
    }
}

fn serialize_seconds<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    value.map(|d| d.as_secs_f64()).serialize(serializer)
}

fn serialize_millis<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    value.map(|d| d.as_millis() as u64).serialize(serializer)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CollectorConfig {
    CpuTime {
        name: CollectorName,
        path: Option<PathBuf>,
    },
    Kstat {
        name: CollectorName,
        path: PathBuf,
        separator: String,
    },
    Telemetry {
        name: CollectorName,
        command: CommandSpec,
        expected_keys: Option<BTreeSet<String>>,
        start_timeout_ms: u64,
    },
}

impl CollectorConfig {
    pub fn name(&self) -> &CollectorName {
        match self {
            Self::CpuTime { name, .. } | Self::Kstat { name, .. } | Self::Telemetry { name, .. } => {
                name
            }
        }
    }
}

/// Complete validated configuration.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub inventory: Inventory,
    pub storage_stack: NodeConfig,
    pub workload: WorkloadConfig,
    pub runner: RunnerSettings,
    pub collectors: Vec<CollectorConfig>,
}

impl Config {
    /// JSON form recorded alongside each run.
    pub fn to_json(&self) -> BenchResult<serde_json::Value> {
        serde_json::to_value(self).map_err(|e| BenchError::Parse {
            context: "configuration".to_string(),
            message: e.to_string(),
        })
    }
}

/// Configuration loader with strict validation.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load and validate configuration from a YAML file.
    pub fn load_file(path: impl AsRef<Path>) -> BenchResult<Config> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(BenchError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path)
            .map_err(BenchError::io(format!("reading config file {}", path.display())))?;

        Self::load_string(&content)
    }

    /// Load and validate configuration from a YAML string.
    pub fn load_string(content: &str) -> BenchResult<Config> {
        let raw: RawConfig = serde_yaml::from_str(content).map_err(|e| BenchError::ConfigParse {
            message: format!("YAML parse error: {}", e),
        })?;

        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> BenchResult<Config> {
        let storage_stack = Self::validate_node(raw.storage_stack)?;
        Self::check_references(&storage_stack, &raw.inventory, &mut BTreeSet::new())?;

        let workload = Self::validate_workload(raw.workload)?;
        let runner = Self::validate_runner(raw.runner)?;

        let mut collectors = Vec::with_capacity(raw.collectors.len());
        let mut seen = BTreeSet::new();
        for raw_collector in raw.collectors {
            let collector = Self::validate_collector(raw_collector)?;
            if !seen.insert(collector.name().to_string()) {
                return Err(ConfigValidationError::DuplicateCollector {
                    name: collector.name().to_string(),
                }
                .into());
            }
            collectors.push(collector);
        }

        Ok(Config {
            inventory: raw.inventory,
            storage_stack,
            workload,
            runner,
            collectors,
        })
    }

    fn validate_backing(raw: RawBacking) -> BenchResult<BackingConfig> {
        match raw {
            RawBacking::Device(reference) => {
                if reference.trim().is_empty() {
                    return Err(invalid("backing", reference, "Device reference cannot be empty"));
                }
                Ok(BackingConfig::Device(reference))
            }
            RawBacking::Node(node) => Ok(BackingConfig::Node(Box::new(Self::validate_node(*node)?))),
        }
    }

    fn validate_node(raw: RawNode) -> BenchResult<NodeConfig> {
        let node = match raw {
            RawNode::RawBlockDevice { device, dax } => NodeConfig::RawBlockDevice { device, dax },
            RawNode::DevDax { device } => NodeConfig::DevDax { device },
            RawNode::DmLinear {
                name,
                size_bytes,
                size_gib,
                backing,
            } => NodeConfig::DmLinear {
                name: DmName::new(name)?,
                size: validate_size(size_bytes, size_gib)?,
                backing: Self::validate_backing(backing)?,
            },
            RawNode::DmStripe {
                name,
                chunk_sectors,
                backings,
            } => {
                if backings.is_empty() {
                    return Err(ConfigValidationError::MissingRequiredField {
                        field: "backings",
                        context: format!("dm_stripe '{}'", name),
                    }
                    .into());
                }
                NodeConfig::DmStripe {
                    name: DmName::new(name)?,
                    chunk_sectors: PowerOfTwo::new(
                        chunk_sectors.unwrap_or(crate::storage::DmStripeTarget::DEFAULT_CHUNK_SECTORS),
                    )?,
                    backings: backings
                        .into_iter()
                        .map(Self::validate_backing)
                        .collect::<BenchResult<_>>()?,
                }
            }
            RawNode::DmWritecache {
                name,
                size_bytes,
                size_gib,
                blocksize,
                origin,
                cache,
                options,
            } => NodeConfig::DmWritecache {
                name: DmName::new(name)?,
                size: validate_size(size_bytes, size_gib)?,
                blocksize: PowerOfTwo::new(blocksize.unwrap_or(DEFAULT_WRITECACHE_BLOCKSIZE))?,
                origin: Self::validate_backing(origin)?,
                cache: Self::validate_backing(cache)?,
                options,
            },
            RawNode::ZfsPool(pool) => NodeConfig::ZfsPool(Self::validate_zfs_pool(pool)?),
            RawNode::Filesystem {
                fstype,
                mountpoint,
                dax,
                backing,
            } => {
                require_absolute("mountpoint", &mountpoint)?;
                NodeConfig::Filesystem {
                    fstype,
                    mountpoint,
                    dax,
                    backing: Self::validate_backing(backing)?,
                }
            }
        };
        Ok(node)
    }

    fn validate_zfs_pool(raw: RawZfsPool) -> BenchResult<ZfsPoolSpec> {
        let pool = PoolName::new(raw.pool)?;
        require_absolute("mountpoint", &raw.mountpoint)?;

        if raw.vdevs.is_empty() {
            return Err(ConfigValidationError::MissingRequiredField {
                field: "vdevs",
                context: format!("zfs_pool '{}'", pool),
            }
            .into());
        }

        // Datasets are always mounted with `-o mountpoint=legacy`.
        if raw.filesystem_properties.contains_key("mountpoint") {
            return Err(invalid(
                "filesystem_properties",
                "mountpoint",
                "The pool is mounted explicitly; remove the mountpoint property",
            ));
        }

        let child_datasets = match raw.child_datasets {
            Some(datasets) => {
                for pattern in [&datasets.name_format, &datasets.dirname_format] {
                    if pattern.as_str().contains('/') {
                        return Err(invalid(
                            "child_datasets",
                            pattern.as_str(),
                            "Format must not contain '/'",
                        ));
                    }
                }
                Some(ChildDatasets {
                    name_format: datasets.name_format,
                    dirname_format: datasets.dirname_format,
                    count: datasets.count,
                })
            }
            None => None,
        };

        let child_zvols = match raw.child_zvols {
            Some(zvols) => {
                if zvols.size.trim().is_empty() {
                    return Err(invalid("child_zvols.size", zvols.size, "Size cannot be empty"));
                }
                Some(ChildZvols {
                    name_format: zvols.name_format,
                    count: zvols.count,
                    size: zvols.size,
                    volblocksize: PowerOfTwo::new(zvols.volblocksize)?,
                })
            }
            None => None,
        };

        let modules = raw
            .modules
            .into_iter()
            .map(|m| {
                if m.name.is_empty() {
                    return Err(invalid("modules", m.path.display().to_string(), "Module name cannot be empty"));
                }
                Ok(KernelModule {
                    name: m.name,
                    path: m.path,
                    params: m.params,
                })
            })
            .collect::<BenchResult<_>>()?;

        Ok(ZfsPoolSpec {
            zpool: raw.zpool,
            zfs: raw.zfs,
            pool,
            mountpoint: raw.mountpoint,
            vdevs: raw.vdevs,
            pool_properties: raw.pool_properties,
            filesystem_properties: raw.filesystem_properties,
            child_datasets,
            child_zvols,
            modules,
        })
    }

    /// Every `@label` must resolve and dm names must be unique in the tree.
    fn check_references(
        node: &NodeConfig,
        inventory: &Inventory,
        dm_names: &mut BTreeSet<String>,
    ) -> BenchResult<()> {
        let check_backing = |backing: &BackingConfig, dm_names: &mut BTreeSet<String>| match backing {
            BackingConfig::Device(reference) => inventory.resolve_one(reference).map(|_| ()).map_err(BenchError::from),
            BackingConfig::Node(node) => Self::check_references(node, inventory, dm_names),
        };
        let claim = |name: &DmName, dm_names: &mut BTreeSet<String>| -> BenchResult<()> {
            if !dm_names.insert(name.to_string()) {
                return Err(invalid("name", name.as_str(), "Device-mapper name used twice in the stack"));
            }
            Ok(())
        };

        match node {
            NodeConfig::RawBlockDevice { device, .. } | NodeConfig::DevDax { device } => {
                inventory.resolve_one(device)?;
            }
            NodeConfig::DmLinear { name, backing, .. } => {
                claim(name, dm_names)?;
                check_backing(backing, dm_names)?;
            }
            NodeConfig::DmStripe { name, backings, .. } => {
                claim(name, dm_names)?;
                for backing in backings {
                    check_backing(backing, dm_names)?;
                }
            }
            NodeConfig::DmWritecache {
                name, origin, cache, ..
            } => {
                claim(name, dm_names)?;
                check_backing(origin, dm_names)?;
                check_backing(cache, dm_names)?;
            }
            NodeConfig::ZfsPool(spec) => {
                for vdev in &spec.vdevs {
                    let device = match vdev.split_once(':') {
                        Some((_, device)) if device.starts_with(LABEL_PREFIX) => device,
                        _ => vdev.as_str(),
                    };
                    inventory.resolve_all(device)?;
                }
            }
            NodeConfig::Filesystem { backing, .. } => check_backing(backing, dm_names)?,
        }
        Ok(())
    }

    fn validate_workload(raw: RawWorkload) -> BenchResult<WorkloadConfig> {
        match raw {
            RawWorkload::Fio(fio) => Ok(WorkloadConfig::Fio(Self::validate_fio(fio)?)),
            RawWorkload::Command(command) => {
                if command.identity.trim().is_empty() {
                    return Err(invalid("identity", command.identity, "Identity cannot be empty"));
                }
                if command.program.as_os_str().is_empty() {
                    return Err(ConfigValidationError::MissingRequiredField {
                        field: "program",
                        context: format!("command workload '{}'", command.identity),
                    }
                    .into());
                }
                if matches!(&command.ready_marker, Some(marker) if marker.is_empty()) {
                    return Err(invalid("ready_marker", "", "Ready marker cannot be empty"));
                }
                Ok(WorkloadConfig::Command(command))
            }
        }
    }

    fn validate_fio(raw: RawFio) -> BenchResult<FioConfig> {
        let context = "fio workload";
        let rw = required(raw.rw, "rw", context)?;
        if rw.trim().is_empty() {
            return Err(invalid("rw", rw, "I/O pattern cannot be empty"));
        }

        let ramp_seconds = required(raw.ramp_seconds, "ramp_seconds", context)?;
        if ramp_seconds < 0 {
            return Err(invalid("ramp_seconds", ramp_seconds, "Must be zero or greater"));
        }
        let runtime_seconds = required(raw.runtime_seconds, "runtime_seconds", context)?;
        if runtime_seconds <= 0 {
            return Err(invalid("runtime_seconds", runtime_seconds, "Must be greater than 0"));
        }
        let numjobs = required(raw.numjobs, "numjobs", context)?;
        if numjobs <= 0 || numjobs > i64::from(u32::MAX) {
            return Err(invalid("numjobs", numjobs, "Must be greater than 0"));
        }

        Ok(FioConfig {
            fio: raw.fio,
            rw,
            blocksize: PowerOfTwo::new(required(raw.blocksize, "blocksize", context)?)?,
            size: PowerOfTwo::new(required(raw.size, "size", context)?)?,
            sync: raw.sync,
            numjobs: numjobs as u32,
            ramp_seconds: ramp_seconds as u64,
            runtime_seconds: runtime_seconds as u64,
            target: raw.target,
        })
    }

    fn validate_runner(raw: RawRunner) -> BenchResult<RunnerSettings> {
        let ramp_up = match raw.ramp_up_seconds {
            Some(ramp) if ramp < 0.0 => {
                return Err(invalid("ramp_up_seconds", ramp, "Must be zero or greater"));
            }
            Some(ramp) => Some(
                Duration::try_from_secs_f64(ramp)
                    .map_err(|e| invalid("ramp_up_seconds", ramp, &e.to_string()))?,
            ),
            None => None,
        };
        if raw.readiness_timeout_ms == Some(0) {
            return Err(invalid("readiness_timeout_ms", 0, "Timeout must be greater than 0"));
        }
        Ok(RunnerSettings {
            ramp_up,
            readiness_timeout: raw.readiness_timeout_ms.map(Duration::from_millis),
        })
    }

    fn validate_collector(raw: RawCollector) -> BenchResult<CollectorConfig> {
        let collector = match raw {
            RawCollector::CpuTime { name, path } => CollectorConfig::CpuTime {
                name: CollectorName::new(name)?,
                path,
            },
            RawCollector::Kstat {
                name,
                path,
                separator,
            } => {
                let separator = separator.unwrap_or_else(|| DEFAULT_KSTAT_SEPARATOR.to_string());
                if separator.is_empty() {
                    return Err(invalid("separator", "", "Separator cannot be empty"));
                }
                // Bare names refer to the ZFS kstat directory.
                let path = if path.is_absolute() {
                    path
                } else {
                    Path::new(ZFS_KSTAT_DIR).join(path)
                };
                CollectorConfig::Kstat {
                    name: CollectorName::new(name)?,
                    path,
                    separator,
                }
            }
            RawCollector::Telemetry {
                name,
                program,
                args,
                env,
                expected_keys,
                start_timeout_ms,
            } => {
                let name = CollectorName::new(name)?;
                if start_timeout_ms == 0 {
                    return Err(invalid("start_timeout_ms", 0, "Timeout must be greater than 0"));
                }
                if matches!(&expected_keys, Some(keys) if keys.is_empty()) {
                    return Err(invalid(
                        "expected_keys",
                        "[]",
                        "Omit expected_keys to learn the schema from the first update",
                    ));
                }
                let mut command = CommandSpec::new(program).args(args);
                command.env = env;
                CollectorConfig::Telemetry {
                    name,
                    command,
                    expected_keys,
                    start_timeout_ms,
                }
            }
        };
        Ok(collector)
    }
}

fn invalid(field: &'static str, value: impl ToString, reason: &str) -> BenchError {
    ConfigValidationError::InvalidFieldValue {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

fn required<T>(value: Option<T>, field: &'static str, context: &str) -> BenchResult<T> {
    value.ok_or_else(|| {
        ConfigValidationError::MissingRequiredField {
            field,
            context: context.to_string(),
        }
        .into()
    })
}

fn require_absolute(field: &'static str, path: &Path) -> BenchResult<()> {
    if !path.is_absolute() {
        return Err(invalid(field, path.display(), "Path must be absolute"));
    }
    Ok(())
}

fn validate_size(bytes: Option<u64>, gib: Option<u64>) -> BenchResult<SectorSize> {
    match (bytes, gib) {
        (Some(bytes), None) => Ok(SectorSize::new(bytes)?),
        (None, Some(gib)) => Ok(SectorSize::from_gib(gib)?),
        (Some(_), Some(_)) => Err(invalid("size_bytes", "size_bytes and size_gib", "Give exactly one size")),
        (None, None) => Err(ConfigValidationError::MissingRequiredField {
            field: "size_bytes",
            context: "device-mapper target".to_string(),
        }
        .into()),
    }
}
