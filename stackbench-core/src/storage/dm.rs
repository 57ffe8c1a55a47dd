// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Device-mapper targets driven through `dmsetup`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::json;

use super::{Backing, EnterState, EnteredPaths, StorageNode, DEVICE_NODE_POLL, DEVICE_NODE_TIMEOUT};
use crate::error::{BenchError, BenchResult};
use crate::process::{must_run, poll_until, CommandSpec, SystemOps};
use crate::stack::ResourceStack;
use crate::types::{DmName, PowerOfTwo, SectorSize};

const MAPPER_DIR: &str = "/dev/mapper";

/// The part of every target that talks to `dmsetup`.
struct DmDevice {
    name: DmName,
    ops: Arc<dyn SystemOps>,
}

impl DmDevice {
    fn path(&self) -> PathBuf {
        Path::new(MAPPER_DIR).join(self.name.as_str())
    }

    /// Create the target with `table`, refusing to touch an existing one.
    fn create(&self, table: &str) -> BenchResult<PathBuf> {
        let status = self
            .ops
            .run(&CommandSpec::new("dmsetup").arg("status").arg(self.name.as_str()))?;
        let combined = format!("{}{}", status.stdout, status.stderr);
        if status.success() || !combined.contains("Device does not exist") {
            return Err(BenchError::ResourceConflict {
                resource: self.name.to_string(),
                diagnostic: format!("dmsetup status indicates the target exists: {}", combined.trim()),
            });
        }

        let path = self.path();
        if self.ops.path_exists(&path) {
            return Err(BenchError::ResourceConflict {
                resource: self.name.to_string(),
                diagnostic: format!("{} already exists", path.display()),
            });
        }

        tracing::info!(target_name = %self.name, table = %table, "Creating device-mapper target");
        must_run(
            &*self.ops,
            &CommandSpec::new("dmsetup")
                .arg("create")
                .arg(self.name.as_str())
                .stdin(table),
        )?;

        poll_until(
            DEVICE_NODE_POLL,
            DEVICE_NODE_TIMEOUT,
            &format!("{} to appear", path.display()),
            || self.ops.path_exists(&path),
        )?;
        Ok(path)
    }

    fn remove(&self) -> BenchResult<()> {
        tracing::info!(target_name = %self.name, "Removing device-mapper target");
        must_run(
            &*self.ops,
            &CommandSpec::new("dmsetup")
                .arg("remove")
                .arg("--retry")
                .arg(self.name.as_str()),
        )?;

        let path = self.path();
        poll_until(
            DEVICE_NODE_POLL,
            DEVICE_NODE_TIMEOUT,
            &format!("{} to disappear", path.display()),
            || !self.ops.path_exists(&path),
        )
    }
}

/// Common enter/exit for all dm targets.
///
/// `build_table` receives the entered lower devices and the private stack
/// holding them; it may run extra preparation commands.
struct DmCore {
    device: DmDevice,
    children: ResourceStack,
    state: EnterState,
}

impl DmCore {
    fn new(name: DmName, ops: Arc<dyn SystemOps>) -> Self {
        Self {
            device: DmDevice { name, ops },
            children: ResourceStack::new(),
            state: EnterState::default(),
        }
    }

    fn identity(&self, kind: &str) -> String {
        format!("{}:{}", kind, self.device.name)
    }

    fn enter<F>(&mut self, kind: &str, backings: &[&Backing], build_table: F) -> BenchResult<EnteredPaths>
    where
        F: FnOnce(&[PathBuf]) -> BenchResult<String>,
    {
        let identity = self.identity(kind);
        self.state.ensure_not_entered(&identity)?;

        let mut children = ResourceStack::new();
        let mut devices = Vec::with_capacity(backings.len());
        for backing in backings {
            devices.push(backing.enter(&mut children)?);
        }

        let table = build_table(&devices)?;
        let path = self.device.create(&table)?;

        self.children = children.detach_all();
        Ok(self.state.entered(EnteredPaths::block_device(path)))
    }

    fn exit(&mut self, kind: &str) -> BenchResult<()> {
        self.state.leave(&self.identity(kind))?;
        let removed = self.device.remove();
        let released = std::mem::take(&mut self.children).release();
        removed.and(released)
    }
}

/// `0 <sectors> linear <device> 0`
pub fn linear_table(size: SectorSize, device: &Path) -> String {
    format!("0 {} linear {} 0", size.sectors(), device.display())
}

/// Striped table across `devices` of `device_sectors` each.
///
/// Every device contributes the smallest device size, rounded down to a
/// multiple of the chunk size.
pub fn striped_table(chunk_sectors: u64, devices: &[(PathBuf, u64)]) -> BenchResult<String> {
    let min = devices.iter().map(|(_, sectors)| *sectors).min().unwrap_or(0);
    let per_device = min - min % chunk_sectors;
    if per_device == 0 {
        return Err(BenchError::ResourceConflict {
            resource: "dm-stripe".to_string(),
            diagnostic: format!(
                "smallest device ({} sectors) is smaller than one chunk ({} sectors)",
                min, chunk_sectors
            ),
        });
    }

    let mut table = format!(
        "0 {} striped {} {}",
        per_device * devices.len() as u64,
        devices.len(),
        chunk_sectors
    );
    for (dev, _) in devices {
        table.push_str(&format!(" {} 0", dev.display()));
    }
    Ok(table)
}

/// `0 <sectors> writecache p <origin> <cache> <blocksize> <2n> <k v>...`
///
/// Only options that take a value are supported.
pub fn writecache_table(
    size: SectorSize,
    origin: &Path,
    cache: &Path,
    blocksize: PowerOfTwo,
    options: &BTreeMap<String, u64>,
) -> String {
    let mut table = format!(
        "0 {} writecache p {} {} {} {}",
        size.sectors(),
        origin.display(),
        cache.display(),
        blocksize,
        2 * options.len()
    );
    for (key, value) in options {
        table.push_str(&format!(" {} {}", key, value));
    }
    table
}

/// Linear mapping of the first `size` bytes of one device.
pub struct DmLinearTarget {
    core: DmCore,
    size: SectorSize,
    backing: Backing,
}

impl DmLinearTarget {
    pub fn new(name: DmName, size: SectorSize, backing: Backing, ops: Arc<dyn SystemOps>) -> Self {
        Self {
            core: DmCore::new(name, ops),
            size,
            backing,
        }
    }
}

impl StorageNode for DmLinearTarget {
    fn identity(&self) -> String {
        self.core.identity("dm-linear")
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "dm_linear",
            "name": self.core.device.name.as_str(),
            "size": self.size.bytes(),
            "backing": self.backing.describe(),
        })
    }

    fn is_dax(&self) -> bool {
        self.backing.is_dax()
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        let size = self.size;
        self.core
            .enter("dm-linear", &[&self.backing], |devices| Ok(linear_table(size, &devices[0])))
    }

    fn exit(&mut self) -> BenchResult<()> {
        self.core.exit("dm-linear")
    }

    fn paths(&self) -> Option<&EnteredPaths> {
        self.core.state.paths()
    }
}

/// RAID-0 style striping across several devices.
pub struct DmStripeTarget {
    core: DmCore,
    chunk_sectors: PowerOfTwo,
    backings: Vec<Backing>,
}

impl DmStripeTarget {
    /// Chunk size used by the kernel documentation's example script.
    pub const DEFAULT_CHUNK_SECTORS: u64 = 256;

    pub fn new(
        name: DmName,
        chunk_sectors: PowerOfTwo,
        backings: Vec<Backing>,
        ops: Arc<dyn SystemOps>,
    ) -> Self {
        Self {
            core: DmCore::new(name, ops),
            chunk_sectors,
            backings,
        }
    }
}

fn device_sectors(ops: &dyn SystemOps, device: &Path) -> BenchResult<u64> {
    let out = must_run(
        ops,
        &CommandSpec::new("blockdev")
            .arg("--getsz")
            .arg(device.display().to_string()),
    )?;
    out.stdout.trim().parse().map_err(|_| BenchError::Parse {
        context: format!("blockdev --getsz {}", device.display()),
        message: format!("not a sector count: {:?}", out.stdout.trim()),
    })
}

impl StorageNode for DmStripeTarget {
    fn identity(&self) -> String {
        self.core.identity("dm-stripe")
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "dm_stripe",
            "name": self.core.device.name.as_str(),
            "chunk_sectors": self.chunk_sectors.value(),
            "backings": self.backings.iter().map(Backing::describe).collect::<Vec<_>>(),
        })
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        let chunk = self.chunk_sectors.value();
        let ops = Arc::clone(&self.core.device.ops);
        let backings: Vec<&Backing> = self.backings.iter().collect();
        self.core.enter("dm-stripe", &backings, |devices| {
            let mut sized = Vec::with_capacity(devices.len());
            for dev in devices {
                sized.push((dev.clone(), device_sectors(&*ops, dev)?));
            }
            striped_table(chunk, &sized)
        })
    }

    fn exit(&mut self) -> BenchResult<()> {
        self.core.exit("dm-stripe")
    }

    fn paths(&self) -> Option<&EnteredPaths> {
        self.core.state.paths()
    }
}

/// dm-writecache in persistent-memory mode.
pub struct DmWritecacheTarget {
    core: DmCore,
    size: SectorSize,
    blocksize: PowerOfTwo,
    origin: Backing,
    cache: Backing,
    options: BTreeMap<String, u64>,
}

impl DmWritecacheTarget {
    pub fn new(
        name: DmName,
        size: SectorSize,
        blocksize: PowerOfTwo,
        origin: Backing,
        cache: Backing,
        options: BTreeMap<String, u64>,
        ops: Arc<dyn SystemOps>,
    ) -> Self {
        Self {
            core: DmCore::new(name, ops),
            size,
            blocksize,
            origin,
            cache,
            options,
        }
    }
}

impl StorageNode for DmWritecacheTarget {
    fn identity(&self) -> String {
        self.core.identity("dm-writecache")
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "dm_writecache",
            "name": self.core.device.name.as_str(),
            "size": self.size.bytes(),
            "blocksize": self.blocksize.value(),
            "origin": self.origin.describe(),
            "cache": self.cache.describe(),
            "options": self.options,
        })
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        let (size, blocksize) = (self.size, self.blocksize);
        let options = self.options.clone();
        let ops = Arc::clone(&self.core.device.ops);
        self.core
            .enter("dm-writecache", &[&self.origin, &self.cache], |devices| {
                let (origin, cache) = (&devices[0], &devices[1]);
                // Stale superblocks make the target refuse to load.
                ops.zero_first_sector(origin)?;
                ops.zero_first_sector(cache)?;
                Ok(writecache_table(size, origin, cache, blocksize, &options))
            })
    }

    fn exit(&mut self) -> BenchResult<()> {
        self.core.exit("dm-writecache")
    }

    fn paths(&self) -> Option<&EnteredPaths> {
        self.core.state.paths()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeOps;
    use super::*;

    fn name(s: &str) -> DmName {
        DmName::new(s).unwrap()
    }

    #[test]
    fn test_linear_table() {
        let table = linear_table(SectorSize::from_gib(10).unwrap(), Path::new("/dev/pmem0"));
        assert_eq!(table, "0 20971520 linear /dev/pmem0 0");
    }

    #[test]
    fn test_striped_table_rounds_to_chunk() {
        let table = striped_table(
            256,
            &[
                (PathBuf::from("/dev/nvme1n1p1"), 1000),
                (PathBuf::from("/dev/nvme2n1p1"), 700),
            ],
        )
        .unwrap();
        assert_eq!(table, "0 1024 striped 2 256 /dev/nvme1n1p1 0 /dev/nvme2n1p1 0");
    }

    #[test]
    fn test_striped_table_too_small() {
        assert!(striped_table(256, &[(PathBuf::from("/dev/x"), 100)]).is_err());
    }

    #[test]
    fn test_writecache_table() {
        let mut options = BTreeMap::new();
        options.insert("high_watermark".to_string(), 0);
        options.insert("low_watermark".to_string(), 0);
        let table = writecache_table(
            SectorSize::from_gib(40).unwrap(),
            Path::new("/dev/nvme1n1p1"),
            Path::new("/dev/mapper/pmem"),
            PowerOfTwo::new(4096).unwrap(),
            &options,
        );
        assert_eq!(
            table,
            "0 83886080 writecache p /dev/nvme1n1p1 /dev/mapper/pmem 4096 4 high_watermark 0 low_watermark 0"
        );
    }

    #[test]
    fn test_existing_target_is_conflict() {
        let ops = Arc::new(FakeOps::new());
        ops.respond("dmsetup status wc", 0, "0 83886080 writecache 0 1024 1024 0");
        let mut target = DmLinearTarget::new(
            name("wc"),
            SectorSize::from_gib(1).unwrap(),
            Backing::Device("/dev/pmem0".into()),
            ops.clone(),
        );
        let err = target.enter().unwrap_err();
        match err {
            BenchError::ResourceConflict { resource, diagnostic } => {
                assert_eq!(resource, "wc");
                assert!(diagnostic.contains("writecache"));
            }
            other => panic!("unexpected error {other}"),
        }
        assert!(!ops.commands().iter().any(|c| c.starts_with("dmsetup create")));
    }

    #[test]
    fn test_stale_mapper_node_is_conflict() {
        let ops = Arc::new(FakeOps::new());
        ops.add_path("/dev/mapper/pmem");
        let mut target = DmLinearTarget::new(
            name("pmem"),
            SectorSize::from_gib(1).unwrap(),
            Backing::Device("/dev/pmem0".into()),
            ops,
        );
        assert!(matches!(
            target.enter().unwrap_err(),
            BenchError::ResourceConflict { .. }
        ));
    }

    #[test]
    fn test_create_failure_is_command_failed() {
        let ops = Arc::new(FakeOps::new());
        ops.respond("dmsetup create", 1, "");
        let mut target = DmLinearTarget::new(
            name("pmem"),
            SectorSize::from_gib(1).unwrap(),
            Backing::Device("/dev/pmem0".into()),
            ops,
        );
        assert!(matches!(
            target.enter().unwrap_err(),
            BenchError::Subprocess(crate::error::SubprocessError::CommandFailed { .. })
        ));
        assert!(target.paths().is_none());
    }

    #[test]
    fn test_stripe_queries_device_sizes() {
        let ops = Arc::new(FakeOps::new());
        ops.respond("blockdev --getsz /dev/nvme1n1p1", 0, "2048\n");
        ops.respond("blockdev --getsz /dev/nvme2n1p1", 0, "4096\n");
        let mut target = DmStripeTarget::new(
            name("stripe"),
            PowerOfTwo::new(DmStripeTarget::DEFAULT_CHUNK_SECTORS).unwrap(),
            vec![
                Backing::Device("/dev/nvme1n1p1".into()),
                Backing::Device("/dev/nvme2n1p1".into()),
            ],
            ops.clone(),
        );
        target.enter().unwrap();
        assert_eq!(
            ops.stdin.lock().unwrap().clone(),
            vec!["0 4096 striped 2 256 /dev/nvme1n1p1 0 /dev/nvme2n1p1 0".to_string()]
        );
        target.exit().unwrap();
    }

    #[test]
    fn test_writecache_zeroes_devices_before_create() {
        let ops = Arc::new(FakeOps::new());
        let mut target = DmWritecacheTarget::new(
            name("wc"),
            SectorSize::from_gib(40).unwrap(),
            PowerOfTwo::new(4096).unwrap(),
            Backing::Device("/dev/nvme1n1p1".into()),
            Backing::Device("/dev/mapper/pmem".into()),
            BTreeMap::new(),
            ops.clone(),
        );
        let paths = target.enter().unwrap();
        assert_eq!(paths.block_device, Some(PathBuf::from("/dev/mapper/wc")));
        assert_eq!(
            ops.zeroed.lock().unwrap().clone(),
            vec![PathBuf::from("/dev/nvme1n1p1"), PathBuf::from("/dev/mapper/pmem")]
        );
        target.exit().unwrap();
        assert!(target.paths().is_none());
    }
}
