// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Device inventory shared between setup phases.
//!
//! Maps labels such as `fsdax` or `nvmepart` to the device paths discovered
//! for this machine. One inventory is created per run and passed down by
//! reference.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigValidationError;

/// Prefix marking a device reference as an inventory label.
pub const LABEL_PREFIX: char = '@';

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inventory {
    entries: BTreeMap<String, Vec<PathBuf>>,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a device to a label.
    pub fn add(&mut self, label: impl Into<String>, path: impl Into<PathBuf>) {
        self.entries
            .entry(label.into())
            .or_default()
            .push(path.into());
    }

    /// All devices registered under `label`, possibly none.
    pub fn get_all(&self, label: &str) -> &[PathBuf] {
        self.entries.get(label).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The single device registered under `label`.
    pub fn get_one(&self, label: &str) -> Result<&PathBuf, ConfigValidationError> {
        match self.get_all(label) {
            [only] => Ok(only),
            other => Err(ConfigValidationError::InventoryLookup {
                label: label.to_string(),
                reason: format!("expected exactly one device, found {}", other.len()),
            }),
        }
    }

    /// The first device registered under `label`.
    pub fn get_first(&self, label: &str) -> Result<&PathBuf, ConfigValidationError> {
        self.get_all(label)
            .first()
            .ok_or_else(|| ConfigValidationError::InventoryLookup {
                label: label.to_string(),
                reason: "no devices registered".to_string(),
            })
    }

    /// Resolve a reference that names exactly one device.
    ///
    /// `@label` goes through [`Inventory::get_one`], anything else is taken
    /// as a literal path.
    pub fn resolve_one(&self, reference: &str) -> Result<PathBuf, ConfigValidationError> {
        match reference.strip_prefix(LABEL_PREFIX) {
            Some(label) => self.get_one(label).cloned(),
            None => Ok(PathBuf::from(reference)),
        }
    }

    /// Resolve a reference that may expand to several words (zpool vdev lists).
    /// An `@label` must match at least one device.
    pub fn resolve_all(&self, reference: &str) -> Result<Vec<String>, ConfigValidationError> {
        match reference.strip_prefix(LABEL_PREFIX) {
            Some(label) => {
                let all = self.get_all(label);
                if all.is_empty() {
                    return Err(ConfigValidationError::InventoryLookup {
                        label: label.to_string(),
                        reason: "no devices registered".to_string(),
                    });
                }
                Ok(all.iter().map(|p| p.display().to_string()).collect())
            }
            None => Ok(vec![reference.to_string()]),
        }
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Inventory {
        let mut inv = Inventory::new();
        inv.add("fsdax", "/dev/pmem0");
        inv.add("nvmepart", "/dev/nvme1n1p1");
        inv.add("nvmepart", "/dev/nvme2n1p1");
        inv
    }

    #[test]
    fn test_get_one() {
        let inv = sample();
        assert_eq!(inv.get_one("fsdax").unwrap(), &PathBuf::from("/dev/pmem0"));
        assert!(inv.get_one("nvmepart").is_err());
        assert!(inv.get_one("missing").is_err());
    }

    #[test]
    fn test_get_first_and_all() {
        let inv = sample();
        assert_eq!(
            inv.get_first("nvmepart").unwrap(),
            &PathBuf::from("/dev/nvme1n1p1")
        );
        assert_eq!(inv.get_all("nvmepart").len(), 2);
        assert!(inv.get_all("missing").is_empty());
        assert!(inv.get_first("missing").is_err());
    }

    #[test]
    fn test_resolve() {
        let inv = sample();
        assert_eq!(inv.resolve_one("@fsdax").unwrap(), PathBuf::from("/dev/pmem0"));
        assert_eq!(inv.resolve_one("/dev/sdb").unwrap(), PathBuf::from("/dev/sdb"));
        assert_eq!(
            inv.resolve_all("@nvmepart").unwrap(),
            vec!["/dev/nvme1n1p1".to_string(), "/dev/nvme2n1p1".to_string()]
        );
        assert_eq!(inv.resolve_all("log").unwrap(), vec!["log".to_string()]);
        assert!(inv.resolve_all("@missing").is_err());
    }
}
