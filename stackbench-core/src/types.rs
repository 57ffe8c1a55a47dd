// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Newtype wrappers for validated inputs.
//!
//! All types validate their invariants at creation time, so a value that
//! exists is a value that can be handed to the kernel tooling as-is.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::ConfigValidationError;

/// Log2 of the device-mapper sector size.
pub const SECTOR_SHIFT: u32 = 9;

/// Validated collector name.
/// Must be non-empty, alphanumeric with `-`, `_` or `.`, max 64 chars.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CollectorName(String);

impl CollectorName {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigValidationError> {
        let name = name.into();

        if name.is_empty() || name.len() > 64 {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "collector_name",
                value: name.clone(),
                reason: format!("must be 1-64 chars, got {}", name.len()),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "collector_name",
                value: name,
                reason: "only alphanumeric characters, '-', '_' and '.' are allowed".to_string(),
            });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectorName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for CollectorName {
    type Error = ConfigValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CollectorName> for String {
    fn from(name: CollectorName) -> Self {
        name.0
    }
}

/// Validated device-mapper target name (the `/dev/mapper/<name>` leaf).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DmName(String);

impl DmName {
    /// The kernel limit is DM_NAME_LEN (128) including the NUL byte.
    const MAX_LEN: usize = 127;

    pub fn new(name: impl Into<String>) -> Result<Self, ConfigValidationError> {
        let name = name.into();

        if name.is_empty() || name.len() > Self::MAX_LEN {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "dm_name",
                value: name.clone(),
                reason: format!("must be 1-{} chars", Self::MAX_LEN),
            });
        }

        if name.contains('/') || name.chars().any(char::is_whitespace) || name == "." || name == ".."
        {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "dm_name",
                value: name,
                reason: "must not contain '/' or whitespace".to_string(),
            });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DmName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DmName {
    type Error = ConfigValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DmName> for String {
    fn from(name: DmName) -> Self {
        name.0
    }
}

/// Byte size that is a non-zero multiple of the 512-byte sector size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct SectorSize(u64);

impl SectorSize {
    pub fn new(bytes: u64) -> Result<Self, ConfigValidationError> {
        if bytes == 0 || bytes % (1 << SECTOR_SHIFT) != 0 {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "size",
                value: bytes.to_string(),
                reason: "must be a non-zero multiple of 512 bytes".to_string(),
            });
        }
        Ok(Self(bytes))
    }

    pub fn from_gib(gib: u64) -> Result<Self, ConfigValidationError> {
        Self::new(gib << 30)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }

    pub fn sectors(&self) -> u64 {
        self.0 >> SECTOR_SHIFT
    }
}

impl fmt::Display for SectorSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

impl TryFrom<u64> for SectorSize {
    type Error = ConfigValidationError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SectorSize> for u64 {
    fn from(size: SectorSize) -> Self {
        size.0
    }
}

/// Power-of-two size (block sizes, fio working-set sizes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct PowerOfTwo(u64);

impl PowerOfTwo {
    pub fn new(value: u64) -> Result<Self, ConfigValidationError> {
        if !value.is_power_of_two() {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "size",
                value: value.to_string(),
                reason: "must be a power of two".to_string(),
            });
        }
        Ok(Self(value))
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PowerOfTwo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<u64> for PowerOfTwo {
    type Error = ConfigValidationError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PowerOfTwo> for u64 {
    fn from(p: PowerOfTwo) -> Self {
        p.0
    }
}

/// Validated ZFS pool name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PoolName(String);

impl PoolName {
    pub fn new(name: impl Into<String>) -> Result<Self, ConfigValidationError> {
        let name = name.into();

        let starts_with_letter = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
        if !starts_with_letter {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "pool",
                value: name,
                reason: "pool names must begin with a letter".to_string(),
            });
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
        {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "pool",
                value: name,
                reason: "only alphanumeric characters, '-', '_', '.' and ':' are allowed"
                    .to_string(),
            });
        }

        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PoolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PoolName {
    type Error = ConfigValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PoolName> for String {
    fn from(name: PoolName) -> Self {
        name.0
    }
}

/// String with exactly one `{}` placeholder and no `$`.
/// Used for dataset/zvol names and per-job file names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FormatPattern(String);

impl FormatPattern {
    pub const PLACEHOLDER: &'static str = "{}";

    pub fn new(pattern: impl Into<String>) -> Result<Self, ConfigValidationError> {
        let pattern = pattern.into();

        if pattern.matches(Self::PLACEHOLDER).count() != 1 {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "format_pattern",
                value: pattern,
                reason: "must contain exactly one '{}' placeholder".to_string(),
            });
        }

        if pattern.contains('$') {
            return Err(ConfigValidationError::InvalidFieldValue {
                field: "format_pattern",
                value: pattern,
                reason: "must not contain '$'".to_string(),
            });
        }

        Ok(Self(pattern))
    }

    /// Substitute the placeholder.
    pub fn format(&self, value: impl fmt::Display) -> String {
        self.0.replacen(Self::PLACEHOLDER, &value.to_string(), 1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FormatPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for FormatPattern {
    type Error = ConfigValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FormatPattern> for String {
    fn from(p: FormatPattern) -> Self {
        p.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_name() {
        assert!(CollectorName::new("cpu_time").is_ok());
        assert!(CollectorName::new("zfs.zil-pmem").is_ok());
        assert!(CollectorName::new("").is_err());
        assert!(CollectorName::new("a b").is_err());
        assert!(CollectorName::new("x".repeat(65)).is_err());
    }

    #[test]
    fn test_dm_name() {
        assert!(DmName::new("wc").is_ok());
        assert!(DmName::new("pmem/0").is_err());
        assert!(DmName::new("with space").is_err());
        assert!(DmName::new("..").is_err());
    }

    #[test]
    fn test_sector_size() {
        let size = SectorSize::new(10 << 30).unwrap();
        assert_eq!(size.sectors(), (10u64 << 30) / 512);
        assert_eq!(SectorSize::from_gib(1).unwrap().bytes(), 1 << 30);
        assert!(SectorSize::new(0).is_err());
        assert!(SectorSize::new(513).is_err());
    }

    #[test]
    fn test_power_of_two() {
        assert!(PowerOfTwo::new(4096).is_ok());
        assert!(PowerOfTwo::new(1).is_ok());
        assert!(PowerOfTwo::new(0).is_err());
        assert!(PowerOfTwo::new(3000).is_err());
    }

    #[test]
    fn test_pool_name() {
        assert!(PoolName::new("dut").is_ok());
        assert!(PoolName::new("1pool").is_err());
        assert!(PoolName::new("a/b").is_err());
    }

    #[test]
    fn test_format_pattern() {
        let p = FormatPattern::new("ds{}").unwrap();
        assert_eq!(p.format(3), "ds3");
        assert!(FormatPattern::new("ds").is_err());
        assert!(FormatPattern::new("{}{}").is_err());
        assert!(FormatPattern::new("ds{}$").is_err());
    }
}
