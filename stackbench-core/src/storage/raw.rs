//! Leaf nodes: devices that already exist on the host.

use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use super::{EnterState, EnteredPaths, StorageNode};
use crate::error::{BenchError, BenchResult};
use crate::process::SystemOps;

/// A block device used as is (NVMe partition, fsdax pmem namespace).
pub struct RawBlockDevice {
    path: PathBuf,
    dax: bool,
    ops: Arc<dyn SystemOps>,
    state: EnterState,
}

impl RawBlockDevice {
    /// `dax` marks fsdax namespaces whose block device supports DAX mounts.
    pub fn new(path: PathBuf, dax: bool, ops: Arc<dyn SystemOps>) -> Self {
        Self {
            path,
            dax,
            ops,
            state: EnterState::default(),
        }
    }
}

impl StorageNode for RawBlockDevice {
    fn identity(&self) -> String {
        format!("raw:{}", self.path.display())
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "raw_block_device",
            "device": self.path.display().to_string(),
            "dax": self.dax,
        })
    }

    fn is_dax(&self) -> bool {
        self.dax
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        self.state.ensure_not_entered(&self.identity())?;
        if !self.ops.is_block_device(&self.path) {
            return Err(BenchError::ResourceConflict {
                resource: self.path.display().to_string(),
                diagnostic: "not a block device".to_string(),
            });
        }
        Ok(self.state.entered(EnteredPaths::block_device(&self.path)))
    }

    fn exit(&mut self) -> BenchResult<()> {
        self.state.leave(&self.identity()).map(|_| ())
    }

    fn paths(&self) -> Option<&EnteredPaths> {
        self.state.paths()
    }
}

/// A devdax character device (`/dev/daxX.Y`).
pub struct DevDax {
    path: PathBuf,
    ops: Arc<dyn SystemOps>,
    state: EnterState,
}

impl DevDax {
    pub fn new(path: PathBuf, ops: Arc<dyn SystemOps>) -> Self {
        Self {
            path,
            ops,
            state: EnterState::default(),
        }
    }
}

impl StorageNode for DevDax {
    fn identity(&self) -> String {
        format!("devdax:{}", self.path.display())
    }

    fn describe(&self) -> serde_json::Value {
        json!({
            "kind": "dev_dax",
            "device": self.path.display().to_string(),
        })
    }

    fn is_dax(&self) -> bool {
        true
    }

    fn enter(&mut self) -> BenchResult<EnteredPaths> {
        self.state.ensure_not_entered(&self.identity())?;
        if !self.ops.path_exists(&self.path) {
            return Err(BenchError::ResourceConflict {
                resource: self.path.display().to_string(),
                diagnostic: "devdax device does not exist".to_string(),
            });
        }
        Ok(self.state.entered(EnteredPaths::block_device(&self.path)))
    }

    fn exit(&mut self) -> BenchResult<()> {
        self.state.leave(&self.identity()).map(|_| ())
    }

    fn paths(&self) -> Option<&EnteredPaths> {
        self.state.paths()
    }
}
