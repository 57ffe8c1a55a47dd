// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Storage stack nodes.
//!
//! Every layer of a benchmarked storage stack (a raw device, a device-mapper
//! target, a ZFS pool, a filesystem) is a [`StorageNode`]: it can describe
//! itself without side effects, and it can be entered (set up on the host)
//! and exited (torn down) exactly once per entry.
//!
//! Composite nodes name their lower layers through [`Backing`]. A lower layer
//! that is itself a node is entered through a private [`ResourceStack`] that
//! is only handed over to the composite once the composite itself has been
//! set up, so a failure half-way through unwinds exactly what was created.

mod dm;
mod filesystem;
mod raw;
mod zfs;

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::{BackingConfig, NodeConfig};
use crate::error::{BenchError, BenchResult, ProtocolViolation};
use crate::inventory::Inventory;
use crate::process::SystemOps;
use crate::stack::{Resource, ResourceStack};
use crate::sync::lock;

pub use dm::{DmLinearTarget, DmStripeTarget, DmWritecacheTarget};
pub use filesystem::{FsType, LinuxFilesystem};
pub use raw::{DevDax, RawBlockDevice};
pub use zfs::{ChildDatasets, ChildZvols, KernelModule, ZfsPool, ZfsPoolSpec};

/// How long to wait for a kernel device node to appear or disappear.
pub const DEVICE_NODE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Poll interval for device nodes.
pub const DEVICE_NODE_POLL: std::time::Duration = std::time::Duration::from_millis(100);

/// What an entered node exposes to the layers and workload above it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnteredPaths {
    pub block_device: Option<PathBuf>,
    pub mount_path: Option<PathBuf>,
}

impl EnteredPaths {
    pub fn block_device(path: impl Into<PathBuf>) -> Self {
        Self {
            block_device: Some(path.into()),
            mount_path: None,
        }
    }

    pub fn mounted(block_device: Option<PathBuf>, mount_path: impl Into<PathBuf>) -> Self {
        Self {
            block_device,
            mount_path: Some(mount_path.into()),
        }
    }
}

/// One layer of a storage stack.
pub trait StorageNode: Send {
    /// Short name identifying this configuration in results.
    fn identity(&self) -> String;

    /// Configuration of this node and everything below it. Never touches
    /// the host.
    fn describe(&self) -> serde_json::Value;

    /// Whether the exposed device supports DAX access.
    fn is_dax(&self) -> bool {
        false
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths>;

    fn exit(&mut self) -> BenchResult<()>;

    /// Paths exposed while entered.
    fn paths(&self) -> Option<&EnteredPaths>;
}

impl Resource for Box<dyn StorageNode> {
    type Entered = EnteredPaths;

    fn label(&self) -> String {
        self.identity()
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        StorageNode::enter(self.as_mut())
    }

    fn exit(&mut self) -> BenchResult<()> {
        StorageNode::exit(self.as_mut())
    }
}

/// Shared handle to a lower-layer node.
///
/// The composite keeps one handle for `describe()`, the private resource
/// stack owns another while the node is entered.
#[derive(Clone)]
pub struct NodeHandle(Arc<Mutex<Box<dyn StorageNode>>>);

impl NodeHandle {
    pub fn new(node: Box<dyn StorageNode>) -> Self {
        Self(Arc::new(Mutex::new(node)))
    }

    pub fn identity(&self) -> String {
        lock(&self.0).identity()
    }

    pub fn describe(&self) -> serde_json::Value {
        lock(&self.0).describe()
    }

    pub fn is_dax(&self) -> bool {
        lock(&self.0).is_dax()
    }
}

impl Resource for NodeHandle {
    type Entered = EnteredPaths;

    fn label(&self) -> String {
        self.identity()
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        lock(&self.0).enter()
    }

    fn exit(&mut self) -> BenchResult<()> {
        lock(&self.0).exit()
    }
}

/// A lower layer of a composite node.
pub enum Backing {
    /// An existing block device, used as is.
    Device(PathBuf),
    /// A node that is entered before the composite and exited after it.
    Node(NodeHandle),
}

impl Backing {
    pub fn node(node: Box<dyn StorageNode>) -> Self {
        Self::Node(NodeHandle::new(node))
    }

    pub fn describe(&self) -> serde_json::Value {
        match self {
            Self::Device(path) => serde_json::Value::String(path.display().to_string()),
            Self::Node(node) => node.describe(),
        }
    }

    pub fn is_dax(&self) -> bool {
        match self {
            Self::Device(_) => false,
            Self::Node(node) => node.is_dax(),
        }
    }

    /// Make the backing available and return its block device.
    ///
    /// Node backings are acquired into `stack`.
    pub(crate) fn enter(&self, stack: &mut ResourceStack) -> BenchResult<PathBuf> {
        match self {
            Self::Device(path) => Ok(path.clone()),
            Self::Node(node) => {
                let identity = node.identity();
                let paths = stack.acquire(node.clone())?;
                paths.block_device.ok_or_else(|| BenchError::ResourceConflict {
                    resource: identity,
                    diagnostic: "lower layer exposes no block device".to_string(),
                })
            }
        }
    }
}

impl std::fmt::Debug for Backing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Device(path) => f.debug_tuple("Device").field(path).finish(),
            Self::Node(node) => f.debug_tuple("Node").field(&node.identity()).finish(),
        }
    }
}

/// Enter/exit bookkeeping shared by all node kinds.
#[derive(Debug, Default)]
pub(crate) struct EnterState {
    paths: Option<EnteredPaths>,
}

impl EnterState {
    pub(crate) fn ensure_not_entered(&self, subject: &str) -> BenchResult<()> {
        if self.paths.is_some() {
            return Err(ProtocolViolation::AlreadyEntered {
                subject: subject.to_string(),
            }
            .into());
        }
        Ok(())
    }

    pub(crate) fn entered(&mut self, paths: EnteredPaths) -> EnteredPaths {
        tracing::info!(
            block_device = ?paths.block_device,
            mount_path = ?paths.mount_path,
            "Storage node entered"
        );
        self.paths = Some(paths.clone());
        paths
    }

    pub(crate) fn leave(&mut self, subject: &str) -> BenchResult<EnteredPaths> {
        self.paths.take().ok_or_else(|| {
            ProtocolViolation::NotEntered {
                subject: subject.to_string(),
            }
            .into()
        })
    }

    pub(crate) fn paths(&self) -> Option<&EnteredPaths> {
        self.paths.as_ref()
    }
}

/// Turn validated configuration into a node tree. Nothing is touched on
/// the host until the returned node is entered.
pub fn build_node(
    config: &NodeConfig,
    inventory: &Inventory,
    ops: Arc<dyn SystemOps>,
) -> BenchResult<Box<dyn StorageNode>> {
    let node: Box<dyn StorageNode> = match config {
        NodeConfig::RawBlockDevice { device, dax } => Box::new(RawBlockDevice::new(
            inventory.resolve_one(device)?,
            *dax,
            ops,
        )),
        NodeConfig::DevDax { device } => {
            Box::new(DevDax::new(inventory.resolve_one(device)?, ops))
        }
        NodeConfig::DmLinear {
            name,
            size,
            backing,
        } => Box::new(DmLinearTarget::new(
            name.clone(),
            *size,
            build_backing(backing, inventory, &ops)?,
            ops,
        )),
        NodeConfig::DmStripe {
            name,
            chunk_sectors,
            backings,
        } => {
            let backings = backings
                .iter()
                .map(|b| build_backing(b, inventory, &ops))
                .collect::<BenchResult<Vec<_>>>()?;
            Box::new(DmStripeTarget::new(name.clone(), *chunk_sectors, backings, ops))
        }
        NodeConfig::DmWritecache {
            name,
            size,
            blocksize,
            origin,
            cache,
            options,
        } => Box::new(DmWritecacheTarget::new(
            name.clone(),
            *size,
            *blocksize,
            build_backing(origin, inventory, &ops)?,
            build_backing(cache, inventory, &ops)?,
            options.clone(),
            ops,
        )),
        NodeConfig::ZfsPool(spec) => {
            let mut vdevs = Vec::new();
            for reference in &spec.vdevs {
                vdevs.extend(resolve_vdev(reference, inventory)?);
            }
            Box::new(ZfsPool::new(spec.clone(), vdevs, ops))
        }
        NodeConfig::Filesystem {
            fstype,
            mountpoint,
            dax,
            backing,
        } => Box::new(LinuxFilesystem::new(
            *fstype,
            mountpoint.clone(),
            *dax,
            build_backing(backing, inventory, &ops)?,
            ops,
        )),
    };
    Ok(node)
}

fn build_backing(
    config: &BackingConfig,
    inventory: &Inventory,
    ops: &Arc<dyn SystemOps>,
) -> BenchResult<Backing> {
    match config {
        BackingConfig::Device(reference) => Ok(Backing::Device(inventory.resolve_one(reference)?)),
        BackingConfig::Node(node) => Ok(Backing::node(build_node(node, inventory, Arc::clone(ops))?)),
    }
}

/// Vdev words may carry a `kind:` prefix (`dax:@fsdax`) in front of the
/// device reference; the prefix is kept.
fn resolve_vdev(reference: &str, inventory: &Inventory) -> BenchResult<Vec<String>> {
    match reference.split_once(':') {
        Some((prefix, device)) if device.starts_with(crate::inventory::LABEL_PREFIX) => Ok(inventory
            .resolve_all(device)?
            .into_iter()
            .map(|d| format!("{}:{}", prefix, d))
            .collect()),
        _ => Ok(inventory.resolve_all(reference)?),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A [`SystemOps`] that records commands and answers from a script.

    use std::collections::{BTreeSet, HashMap};
    use std::path::Path;
    use std::sync::Mutex;

    use crate::error::BenchResult;
    use crate::process::{CommandOutput, CommandSpec, SystemOps};

    #[derive(Default)]
    pub struct FakeOps {
        pub commands: Mutex<Vec<String>>,
        pub stdin: Mutex<Vec<String>>,
        /// Responses keyed by a prefix of the rendered command line.
        pub responses: Mutex<HashMap<String, CommandOutput>>,
        pub existing: Mutex<BTreeSet<std::path::PathBuf>>,
        pub zeroed: Mutex<Vec<std::path::PathBuf>>,
        /// `dmsetup create` makes the mapper node appear, `remove` deletes it.
        pub simulate_dm: bool,
    }

    impl FakeOps {
        pub fn new() -> Self {
            Self {
                simulate_dm: true,
                ..Self::default()
            }
        }

        pub fn respond(&self, prefix: &str, code: i32, stdout: &str) {
            self.responses.lock().unwrap().insert(
                prefix.to_string(),
                CommandOutput {
                    status_code: Some(code),
                    stdout: stdout.to_string(),
                    stderr: String::new(),
                },
            );
        }

        pub fn add_path(&self, path: impl Into<std::path::PathBuf>) {
            self.existing.lock().unwrap().insert(path.into());
        }

        pub fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl SystemOps for FakeOps {
        fn run(&self, cmd: &CommandSpec) -> BenchResult<CommandOutput> {
            let line = cmd.to_string();
            self.commands.lock().unwrap().push(line.clone());
            if let Some(input) = &cmd.stdin {
                self.stdin.lock().unwrap().push(input.clone());
            }

            let responses = self.responses.lock().unwrap();
            let scripted = responses
                .iter()
                .filter(|(prefix, _)| line.starts_with(prefix.as_str()))
                .max_by_key(|(prefix, _)| prefix.len())
                .map(|(_, out)| out.clone());
            drop(responses);

            let dmsetup = self.simulate_dm && cmd.program_name() == "dmsetup";
            if dmsetup && cmd.args.first().map(String::as_str) == Some("create") {
                if let Some(name) = cmd.args.get(1) {
                    self.add_path(Path::new("/dev/mapper").join(name));
                }
            }
            if dmsetup && cmd.args.first().map(String::as_str) == Some("remove") {
                if let Some(name) = cmd.args.last() {
                    self.existing
                        .lock()
                        .unwrap()
                        .remove(&Path::new("/dev/mapper").join(name));
                }
            }

            if let Some(out) = scripted {
                return Ok(out);
            }
            if line.starts_with("dmsetup status") {
                return Ok(CommandOutput {
                    status_code: Some(1),
                    stdout: String::new(),
                    stderr: "Device does not exist.\nCommand failed.\n".to_string(),
                });
            }
            Ok(CommandOutput {
                status_code: Some(0),
                ..CommandOutput::default()
            })
        }

        fn path_exists(&self, path: &Path) -> bool {
            self.existing.lock().unwrap().contains(path)
        }

        fn is_block_device(&self, path: &Path) -> bool {
            self.path_exists(path)
        }

        fn create_dir(&self, _path: &Path) -> BenchResult<()> {
            Ok(())
        }

        fn zero_first_sector(&self, path: &Path) -> BenchResult<()> {
            self.zeroed.lock().unwrap().push(path.to_path_buf());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeOps;
    use super::*;
    use crate::types::{DmName, SectorSize};

    #[test]
    fn test_composite_failure_releases_lower_node() {
        let ops = Arc::new(FakeOps::new());
        ops.add_path("/dev/pmem0");
        // The upper target already exists, so its enter fails after the
        // lower target was created.
        ops.respond("dmsetup status upper", 0, "0 100 linear 259:0 0");

        let lower = DmLinearTarget::new(
            DmName::new("lower").unwrap(),
            SectorSize::from_gib(1).unwrap(),
            Backing::Device("/dev/pmem0".into()),
            ops.clone(),
        );
        let mut upper: Box<dyn StorageNode> = Box::new(DmLinearTarget::new(
            DmName::new("upper").unwrap(),
            SectorSize::new(512 * 1024).unwrap(),
            Backing::node(Box::new(lower)),
            ops.clone(),
        ));

        let err = upper.enter().unwrap_err();
        assert!(matches!(err, BenchError::ResourceConflict { ref resource, .. } if resource == "upper"));
        assert!(upper.paths().is_none());

        let cmds = ops.commands();
        assert!(cmds.iter().any(|c| c.starts_with("dmsetup create lower")));
        assert!(!cmds.iter().any(|c| c.starts_with("dmsetup create upper")));
        assert_eq!(cmds.last().unwrap(), "dmsetup remove --retry lower");
    }

    #[test]
    fn test_composite_enter_and_exit_order() {
        let ops = Arc::new(FakeOps::new());
        ops.add_path("/dev/pmem0");

        let lower = DmLinearTarget::new(
            DmName::new("pmem").unwrap(),
            SectorSize::from_gib(1).unwrap(),
            Backing::Device("/dev/pmem0".into()),
            ops.clone(),
        );
        let mut upper: Box<dyn StorageNode> = Box::new(DmLinearTarget::new(
            DmName::new("outer").unwrap(),
            SectorSize::new(1 << 20).unwrap(),
            Backing::node(Box::new(lower)),
            ops.clone(),
        ));

        let paths = upper.enter().unwrap();
        assert_eq!(paths.block_device, Some(PathBuf::from("/dev/mapper/outer")));
        assert_eq!(
            ops.stdin.lock().unwrap().clone(),
            vec![
                "0 2097152 linear /dev/pmem0 0".to_string(),
                "0 2048 linear /dev/mapper/pmem 0".to_string(),
            ]
        );

        upper.exit().unwrap();
        let removes: Vec<String> = ops
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("dmsetup remove"))
            .collect();
        assert_eq!(
            removes,
            vec!["dmsetup remove --retry outer", "dmsetup remove --retry pmem"]
        );
    }

    #[test]
    fn test_double_enter_and_stray_exit() {
        let ops = Arc::new(FakeOps::new());
        ops.add_path("/dev/nvme1n1");
        let mut node: Box<dyn StorageNode> =
            Box::new(RawBlockDevice::new("/dev/nvme1n1".into(), false, ops));

        assert!(node.exit().unwrap_err().is_protocol_violation());
        node.enter().unwrap();
        assert!(node.enter().unwrap_err().is_protocol_violation());
        node.exit().unwrap();
    }

    #[test]
    fn test_describe_does_not_touch_host() {
        let ops = Arc::new(FakeOps::new());
        let node = DmLinearTarget::new(
            DmName::new("pmem").unwrap(),
            SectorSize::from_gib(10).unwrap(),
            Backing::node(Box::new(DevDax::new("/dev/dax0.0".into(), ops.clone()))),
            ops.clone(),
        );
        let description = node.describe();
        assert_eq!(description["kind"], "dm_linear");
        assert_eq!(description["backing"]["kind"], "dev_dax");
        assert!(ops.commands().is_empty());
    }

    #[test]
    fn test_resolve_vdev_keeps_prefix() {
        let mut inventory = Inventory::new();
        inventory.add("fsdax", "/dev/pmem0");
        inventory.add("nvmepart", "/dev/nvme1n1p1");
        inventory.add("nvmepart", "/dev/nvme2n1p1");

        assert_eq!(resolve_vdev("dax:@fsdax", &inventory).unwrap(), vec!["dax:/dev/pmem0"]);
        assert_eq!(
            resolve_vdev("@nvmepart", &inventory).unwrap(),
            vec!["/dev/nvme1n1p1", "/dev/nvme2n1p1"]
        );
        assert_eq!(resolve_vdev("log", &inventory).unwrap(), vec!["log"]);
        assert!(resolve_vdev("@missing", &inventory).is_err());
    }
}
