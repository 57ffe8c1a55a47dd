// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! ZFS pool with optional child datasets and zvols.
//!
//! Enter, in order:
//! 1. optionally reload the kernel modules with the configured parameters
//! 2. `zpool create -f -O mountpoint=legacy ...` and record the pool guid
//! 3. mount the root dataset
//! 4. create and mount child datasets, create child zvols
//!
//! Exit destroys the pool (which unmounts everything) if and only if its
//! guid is still the one recorded at creation, then unloads the modules.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;

use super::{EnterState, EnteredPaths, StorageNode, DEVICE_NODE_POLL, DEVICE_NODE_TIMEOUT};
use crate::error::{BenchError, BenchResult};
use crate::process::{must_run, poll_until, CommandSpec, SystemOps};
use crate::stack::ResourceStack;
use crate::types::{FormatPattern, PoolName, PowerOfTwo};

const SYS_MODULE_DIR: &str = "/sys/module";

/// A kernel module to (re)load before creating the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelModule {
    pub name: String,
    pub path: PathBuf,
    pub params: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildDatasets {
    pub name_format: FormatPattern,
    /// Directory below the pool mountpoint; must not contain `/`.
    pub dirname_format: FormatPattern,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChildZvols {
    pub name_format: FormatPattern,
    pub count: u32,
    /// Passed to `zfs create -V` verbatim (`4G`).
    pub size: String,
    pub volblocksize: PowerOfTwo,
}

/// Validated pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ZfsPoolSpec {
    pub zpool: PathBuf,
    pub zfs: PathBuf,
    pub pool: PoolName,
    pub mountpoint: PathBuf,
    /// Vdev words as written in the configuration (`@nvmepart`, `log`, ...).
    pub vdevs: Vec<String>,
    pub pool_properties: BTreeMap<String, String>,
    pub filesystem_properties: BTreeMap<String, String>,
    pub child_datasets: Option<ChildDatasets>,
    pub child_zvols: Option<ChildZvols>,
    /// In load order; unloaded in reverse.
    pub modules: Vec<KernelModule>,
}

pub struct ZfsPool {
    spec: ZfsPoolSpec,
    vdevs: Vec<String>,
    ops: Arc<dyn SystemOps>,
    resources: ResourceStack,
    state: EnterState,
}

impl ZfsPool {
    /// `vdevs` are the resolved vdev words passed to `zpool create`.
    pub fn new(spec: ZfsPoolSpec, vdevs: Vec<String>, ops: Arc<dyn SystemOps>) -> Self {
        Self {
            spec,
            vdevs,
            ops,
            resources: ResourceStack::new(),
            state: EnterState::default(),
        }
    }

    fn dataset(&self, child: &str) -> String {
        format!("{}/{}", self.spec.pool, child)
    }

    fn exposed_paths(&self) -> EnteredPaths {
        let block_device = self
            .spec
            .child_zvols
            .as_ref()
            .filter(|z| z.count > 0)
            .map(|z| zvol_path(&self.dataset(&z.name_format.format(0))));
        let mount_path = match self.spec.child_datasets.as_ref().filter(|d| d.count > 0) {
            Some(datasets) => self.spec.mountpoint.join(datasets.dirname_format.format(0)),
            None => self.spec.mountpoint.clone(),
        };
        EnteredPaths::mounted(block_device, mount_path)
    }

    fn setup(&self, stack: &mut ResourceStack) -> BenchResult<()> {
        let ops = &*self.ops;

        if !self.spec.modules.is_empty() {
            unload_modules(ops, &self.spec.modules)?;
            for module in &self.spec.modules {
                let params = module.params.iter().map(|(k, v)| format!("{}={}", k, v));
                must_run(
                    ops,
                    &CommandSpec::new("insmod")
                        .arg(module.path.display().to_string())
                        .args(params),
                )?;
            }
            let (unload_ops, modules) = (Arc::clone(&self.ops), self.spec.modules.clone());
            stack.push("kernel modules", move || unload_modules(&*unload_ops, &modules))?;
        }

        let mut create = CommandSpec::new(&self.spec.zpool).arg("create").arg("-f");
        for (key, value) in &self.spec.filesystem_properties {
            create = create.arg("-O").arg(format!("{}={}", key, value));
        }
        create = create.arg("-O").arg("mountpoint=legacy");
        for (key, value) in &self.spec.pool_properties {
            create = create.arg("-o").arg(format!("{}={}", key, value));
        }
        create = create.arg(self.spec.pool.as_str()).args(self.vdevs.iter().cloned());
        must_run(ops, &create)?;

        let guid = pool_guid(ops, &self.spec.zpool, &self.spec.pool)?;
        tracing::info!(pool = %self.spec.pool, guid = %guid, "Created pool");
        {
            let (ops, zpool, pool) = (
                Arc::clone(&self.ops),
                self.spec.zpool.clone(),
                self.spec.pool.clone(),
            );
            stack.push(format!("zpool {}", self.spec.pool), move || {
                destroy_pool(&*ops, &zpool, &pool, &guid)
            })?;
        }

        ops.create_dir(&self.spec.mountpoint)?;
        mount_zfs(ops, self.spec.pool.as_str(), &self.spec.mountpoint)?;

        if let Some(datasets) = &self.spec.child_datasets {
            for i in 0..datasets.count {
                let ds = self.dataset(&datasets.name_format.format(i));
                must_run(
                    ops,
                    &CommandSpec::new(&self.spec.zfs)
                        .args(["create", "-o", "mountpoint=legacy"])
                        .arg(ds.as_str()),
                )?;
                let mountpoint = self.spec.mountpoint.join(datasets.dirname_format.format(i));
                ops.create_dir(&mountpoint)?;
                mount_zfs(ops, &ds, &mountpoint)?;
            }
        }

        if let Some(zvols) = &self.spec.child_zvols {
            let mut paths = Vec::with_capacity(zvols.count as usize);
            for i in 0..zvols.count {
                let zv = self.dataset(&zvols.name_format.format(i));
                must_run(
                    ops,
                    &CommandSpec::new(&self.spec.zfs)
                        .args(["create", "-V", zvols.size.as_str(), "-o"])
                        .arg(format!("volblocksize={}", zvols.volblocksize))
                        .arg(zv.as_str()),
                )?;
                paths.push(zvol_path(&zv));
            }
            for path in &paths {
                poll_until(
                    DEVICE_NODE_POLL,
                    DEVICE_NODE_TIMEOUT,
                    &format!("{} to appear", path.display()),
                    || ops.is_block_device(path),
                )?;
            }
        }

        Ok(())
    }
}

fn zvol_path(dataset: &str) -> PathBuf {
    Path::new("/dev/zvol").join(dataset)
}

fn mount_zfs(ops: &dyn SystemOps, dataset: &str, mountpoint: &Path) -> BenchResult<()> {
    must_run(
        ops,
        &CommandSpec::new("mount")
            .args(["-t", "zfs", dataset])
            .arg(mountpoint.display().to_string()),
    )
    .map(|_| ())
}

fn pool_guid(ops: &dyn SystemOps, zpool: &Path, pool: &PoolName) -> BenchResult<String> {
    let out = must_run(
        ops,
        &CommandSpec::new(zpool)
            .args(["get", "-H", "-p", "-o", "value", "guid"])
            .arg(pool.as_str()),
    )?;
    Ok(out.stdout.trim().to_string())
}

/// Destroy the pool, but only the one we created.
fn destroy_pool(ops: &dyn SystemOps, zpool: &Path, pool: &PoolName, guid: &str) -> BenchResult<()> {
    let current = pool_guid(ops, zpool, pool)?;
    if current != guid {
        return Err(BenchError::ResourceConflict {
            resource: pool.to_string(),
            diagnostic: format!("expected pool guid {} but found {}", guid, current),
        });
    }
    tracing::info!(pool = %pool, guid = %guid, "Destroying pool");
    must_run(ops, &CommandSpec::new(zpool).arg("destroy").arg(pool.as_str())).map(|_| ())
}

fn unload_modules(ops: &dyn SystemOps, modules: &[KernelModule]) -> BenchResult<()> {
    for module in modules.iter().rev() {
        if !ops.path_exists(&Path::new(SYS_MODULE_DIR).join(&module.name)) {
            continue;
        }
        tracing::info!(module = %module.name, "Unloading kernel module");
        must_run(ops, &CommandSpec::new("rmmod").arg(module.name.as_str()))?;
    }
    Ok(())
}

impl StorageNode for ZfsPool {
    fn identity(&self) -> String {
        format!("zfs:{}", self.spec.pool)
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "zfs_pool",
            "spec": self.spec,
            "resolved_vdevs": self.vdevs,
        })
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        self.state.ensure_not_entered(&self.identity())?;

        let mut stack = ResourceStack::new();
        self.setup(&mut stack)?;

        self.resources = stack.detach_all();
        let paths = self.exposed_paths();
        Ok(self.state.entered(paths))
    }

    fn exit(&mut self) -> BenchResult<()> {
        self.state.leave(&self.identity())?;
        std::mem::take(&mut self.resources).release()
    }

    fn paths(&self) -> Option<&EnteredPaths> {
        self.state.paths()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::FakeOps;
    use super::*;

    fn spec() -> ZfsPoolSpec {
        let mut filesystem_properties = BTreeMap::new();
        filesystem_properties.insert("recordsize".to_string(), "4k".to_string());
        ZfsPoolSpec {
            zpool: "zpool".into(),
            zfs: "zfs".into(),
            pool: PoolName::new("dut").unwrap(),
            mountpoint: "/dut".into(),
            vdevs: vec!["@nvmepart".into(), "log".into(), "dax:@fsdax".into()],
            pool_properties: BTreeMap::new(),
            filesystem_properties,
            child_datasets: Some(ChildDatasets {
                name_format: FormatPattern::new("ds{}").unwrap(),
                dirname_format: FormatPattern::new("ds{}").unwrap(),
                count: 2,
            }),
            child_zvols: Some(ChildZvols {
                name_format: FormatPattern::new("zv{}").unwrap(),
                count: 1,
                size: "4G".into(),
                volblocksize: PowerOfTwo::new(4096).unwrap(),
            }),
            modules: Vec::new(),
        }
    }

    fn vdevs() -> Vec<String> {
        vec!["/dev/nvme1n1p1".into(), "log".into(), "dax:/dev/pmem0".into()]
    }

    #[test]
    fn test_enter_creates_pool_datasets_and_zvols() {
        let ops = Arc::new(FakeOps::new());
        ops.respond("zpool get", 0, "1234567890\n");
        ops.add_path("/dev/zvol/dut/zv0");

        let mut pool = ZfsPool::new(spec(), vdevs(), ops.clone());
        let paths = pool.enter().unwrap();
        assert_eq!(paths.block_device, Some(PathBuf::from("/dev/zvol/dut/zv0")));
        assert_eq!(paths.mount_path, Some(PathBuf::from("/dut/ds0")));

        let cmds = ops.commands();
        assert_eq!(
            cmds[0],
            "zpool create -f -O recordsize=4k -O mountpoint=legacy dut /dev/nvme1n1p1 log dax:/dev/pmem0"
        );
        assert_eq!(cmds[1], "zpool get -H -p -o value guid dut");
        assert_eq!(cmds[2], "mount -t zfs dut /dut");
        assert!(cmds.contains(&"zfs create -o mountpoint=legacy dut/ds1".to_string()));
        assert!(cmds.contains(&"mount -t zfs dut/ds1 /dut/ds1".to_string()));
        assert!(cmds.contains(&"zfs create -V 4G -o volblocksize=4096 dut/zv0".to_string()));

        pool.exit().unwrap();
        assert_eq!(ops.commands().last().unwrap(), "zpool destroy dut");
    }

    #[test]
    fn test_exit_refuses_foreign_pool() {
        let ops = Arc::new(FakeOps::new());
        ops.respond("zpool get", 0, "111\n");
        ops.add_path("/dev/zvol/dut/zv0");

        let mut pool = ZfsPool::new(spec(), vdevs(), ops.clone());
        pool.enter().unwrap();

        ops.respond("zpool get", 0, "222\n");
        let err = pool.exit().unwrap_err();
        assert!(matches!(err, BenchError::ResourceConflict { .. }));
        assert!(!ops.commands().iter().any(|c| c.starts_with("zpool destroy")));
    }

    #[test]
    fn test_failed_dataset_create_destroys_pool() {
        let ops = Arc::new(FakeOps::new());
        ops.respond("zpool get", 0, "42\n");
        ops.respond("zfs create -o mountpoint=legacy dut/ds1", 1, "");

        let mut pool = ZfsPool::new(spec(), vdevs(), ops.clone());
        assert!(pool.enter().is_err());
        assert!(pool.paths().is_none());
        assert_eq!(ops.commands().last().unwrap(), "zpool destroy dut");
    }

    #[test]
    fn test_module_reload_order() {
        let ops = Arc::new(FakeOps::new());
        ops.respond("zpool get", 0, "7\n");
        ops.add_path("/sys/module/spl");
        ops.add_path("/sys/module/zfs");

        let mut spec = spec();
        spec.child_datasets = None;
        spec.child_zvols = None;
        spec.modules = vec![
            KernelModule {
                name: "spl".into(),
                path: "/build/module/spl/spl.ko".into(),
                params: BTreeMap::new(),
            },
            KernelModule {
                name: "zfs".into(),
                path: "/build/module/zfs/zfs.ko".into(),
                params: [("zil_default_kind".to_string(), "2".to_string())].into(),
            },
        ];

        let mut pool = ZfsPool::new(spec, vdevs(), ops.clone());
        let paths = pool.enter().unwrap();
        assert_eq!(paths.block_device, None);
        assert_eq!(paths.mount_path, Some(PathBuf::from("/dut")));

        let cmds = ops.commands();
        assert_eq!(
            cmds[..4],
            [
                "rmmod zfs",
                "rmmod spl",
                "insmod /build/module/spl/spl.ko",
                "insmod /build/module/zfs/zfs.ko zil_default_kind=2",
            ]
            .map(String::from)
        );

        pool.exit().unwrap();
        let tail: Vec<String> = ops.commands().into_iter().rev().take(3).collect();
        assert_eq!(tail, vec!["rmmod spl", "rmmod zfs", "zpool destroy dut"]);
    }
}
