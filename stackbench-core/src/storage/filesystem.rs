//! Linux filesystem (xfs, ext4) made fresh on a lower layer and mounted.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{Backing, EnterState, EnteredPaths, StorageNode, DEVICE_NODE_POLL, DEVICE_NODE_TIMEOUT};
use crate::error::{BenchError, BenchResult};
use crate::process::{must_run, poll_until, CommandSpec, SystemOps};
use crate::stack::ResourceStack;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    Xfs,
    Ext4,
}

impl FsType {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Xfs => "xfs",
            Self::Ext4 => "ext4",
        }
    }

    fn mkfs_args(&self) -> Vec<&'static str> {
        match self {
            Self::Xfs => Vec::new(),
            // Initialize everything up front so background init does not
            // disturb the measurement.
            Self::Ext4 => vec!["-E", "lazy_itable_init=0,lazy_journal_init=0"],
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub struct LinuxFilesystem {
    fstype: FsType,
    mountpoint: PathBuf,
    dax: bool,
    backing: Backing,
    ops: Arc<dyn SystemOps>,
    resources: ResourceStack,
    state: EnterState,
}

impl LinuxFilesystem {
    pub fn new(
        fstype: FsType,
        mountpoint: PathBuf,
        dax: bool,
        backing: Backing,
        ops: Arc<dyn SystemOps>,
    ) -> Self {
        Self {
            fstype,
            mountpoint,
            dax,
            backing,
            ops,
            resources: ResourceStack::new(),
            state: EnterState::default(),
        }
    }

    fn setup(&self, stack: &mut ResourceStack) -> BenchResult<PathBuf> {
        let ops = &*self.ops;
        let device = self.backing.enter(stack)?;

        wipefs(ops, &device)?;
        must_run(
            ops,
            &CommandSpec::new(format!("mkfs.{}", self.fstype))
                .args(self.fstype.mkfs_args())
                .arg(device.display().to_string()),
        )?;
        {
            let (ops, device) = (Arc::clone(&self.ops), device.clone());
            stack.push(format!("wipefs {}", device.display()), move || wipefs(&*ops, &device))?;
        }

        ops.create_dir(&self.mountpoint)?;
        let mut mount = CommandSpec::new("mount").arg("-t").arg(self.fstype.name());
        if self.dax {
            mount = mount.arg("-o").arg("dax");
        }
        must_run(
            ops,
            &mount
                .arg(device.display().to_string())
                .arg(self.mountpoint.display().to_string()),
        )?;
        {
            let (ops, mountpoint) = (Arc::clone(&self.ops), self.mountpoint.clone());
            stack.push(format!("umount {}", mountpoint.display()), move || {
                unmount(&*ops, &mountpoint)
            })?;
        }

        Ok(device)
    }
}

fn wipefs(ops: &dyn SystemOps, device: &Path) -> BenchResult<()> {
    must_run(
        ops,
        &CommandSpec::new("wipefs").arg("-a").arg(device.display().to_string()),
    )
    .map(|_| ())
}

/// Retry `umount` until it succeeds; a lazily closed file keeps the
/// filesystem busy for a moment after the workload exits.
fn unmount(ops: &dyn SystemOps, mountpoint: &Path) -> BenchResult<()> {
    let cmd = CommandSpec::new("umount").arg(mountpoint.display().to_string());
    let mut last_error: Option<BenchError> = None;
    let polled = poll_until(
        DEVICE_NODE_POLL,
        DEVICE_NODE_TIMEOUT,
        &format!("{} to unmount", mountpoint.display()),
        || match must_run(ops, &cmd) {
            Ok(_) => true,
            Err(e) => {
                last_error = Some(e);
                false
            }
        },
    );
    match (polled, last_error) {
        (Ok(()), _) => Ok(()),
        (Err(_), Some(e)) => Err(e),
        (Err(e), None) => Err(e),
    }
}

impl StorageNode for LinuxFilesystem {
    fn identity(&self) -> String {
        format!("{}:{}", self.fstype, self.mountpoint.display())
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "filesystem",
            "fstype": self.fstype,
            "mountpoint": self.mountpoint.display().to_string(),
            "dax": self.dax,
            "backing": self.backing.describe(),
        })
    }

    fn is_dax(&self) -> bool {
        self.dax
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        self.state.ensure_not_entered(&self.identity())?;

        let mut stack = ResourceStack::new();
        let device = self.setup(&mut stack)?;

        self.resources = stack.detach_all();
        let paths = EnteredPaths::mounted(Some(device), self.mountpoint.clone());
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

    #[test]
    fn test_ext4_lifecycle() {
        let ops = Arc::new(FakeOps::new());
        let mut fs = LinuxFilesystem::new(
            FsType::Ext4,
            "/mnt/bench".into(),
            true,
            Backing::Device("/dev/pmem1".into()),
            ops.clone(),
        );
        let paths = fs.enter().unwrap();
        assert_eq!(paths.mount_path, Some(PathBuf::from("/mnt/bench")));
        assert!(fs.is_dax());

        fs.exit().unwrap();
        assert_eq!(
            ops.commands(),
            vec![
                "wipefs -a /dev/pmem1",
                "mkfs.ext4 -E lazy_itable_init=0,lazy_journal_init=0 /dev/pmem1",
                "mount -t ext4 -o dax /dev/pmem1 /mnt/bench",
                "umount /mnt/bench",
                "wipefs -a /dev/pmem1",
            ]
        );
    }

    #[test]
    fn test_failed_mount_wipes_device() {
        let ops = Arc::new(FakeOps::new());
        ops.respond("mount", 32, "");
        let mut fs = LinuxFilesystem::new(
            FsType::Xfs,
            "/mnt/bench".into(),
            false,
            Backing::Device("/dev/nvme1n1p1".into()),
            ops.clone(),
        );
        assert!(fs.enter().is_err());
        assert_eq!(ops.commands().last().unwrap(), "wipefs -a /dev/nvme1n1p1");
        assert!(!ops.commands().iter().any(|c| c.starts_with("umount")));
    }
}
