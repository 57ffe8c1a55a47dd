// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Kstat-style counter files.
//!
//! SPL exposes custom kstats as a header line of counter names followed by
//! a line of integer values, separated by a delimiter:
//!
//! ```text
//! write_upgrade | downgrade | aquisition_total | vtable | exit | total
//! 256882787 | 4468 | 384192061 | 39687812 | 641698 | 42476661
//! ```
//!
//! Raw reads may carry the kstat metadata line in front; it is skipped.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::counters::Update;
use crate::error::{BenchError, BenchResult};
use crate::measurement::Sampler;

/// Directory holding the ZFS kstats.
pub const ZFS_KSTAT_DIR: &str = "/proc/spl/kstat/zfs";

/// Samples one kstat file into an [`Update`].
#[derive(Debug, Clone)]
pub struct KstatSampler {
    path: PathBuf,
    separator: String,
}

impl KstatSampler {
    pub fn new(path: impl Into<PathBuf>, separator: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            separator: separator.into(),
        }
    }

    /// Parse the textual content of a kstat file.
    pub fn parse(&self, content: &str) -> BenchResult<Update> {
        let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
        let (header, data) = match lines.as_slice() {
            [header, data] => (*header, *data),
            [_meta, header, data] => (*header, *data),
            other => {
                return Err(self.parse_error(format!(
                    "expected 2 lines (or 3 with kstat header), got {}",
                    other.len()
                )))
            }
        };

        let fields = |line: &str| -> Vec<String> {
            line.split(self.separator.as_str())
                .map(|c| c.trim().to_string())
                .collect()
        };

        let names = fields(header);
        let values = fields(data);
        if names.len() != values.len() {
            return Err(self.parse_error(format!(
                "number of header and data columns differs: {} != {}",
                names.len(),
                values.len()
            )));
        }

        let mut counters = BTreeMap::new();
        for (name, raw) in names.into_iter().zip(values) {
            let value: i64 = raw
                .parse()
                .map_err(|_| self.parse_error(format!("column {} is not an integer: {:?}", name, raw)))?;
            if counters.insert(name.clone(), value).is_some() {
                return Err(self.parse_error(format!("duplicate column {}", name)));
            }
        }

        Ok(Update::new(counters))
    }

    fn parse_error(&self, message: String) -> BenchError {
        BenchError::Parse {
            context: self.path.display().to_string(),
            message,
        }
    }
}

impl Sampler for KstatSampler {
    type Sample = Update;
    type Output = Update;

    fn sample(&self) -> BenchResult<Update> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(BenchError::io(format!("reading kstat {}", self.path.display())))?;
        self.parse(&content)
    }

    fn diff(&self, start: &Update, end: &Update) -> BenchResult<Update> {
        Ok(end.diff(start)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measurement::MeasurementSession;
    use crate::types::CollectorName;

    const ITXG_BYPASS: &str = "write_upgrade | downgrade | aquisition_total | vtable | exit | total
256882787 | 4468 | 384192061 | 39687812 | 641698 | 42476661
";

    const ITXG_BYPASS_RAW: &str = "16 0 0x01 -1 0 244296201011881 244325769660233
write_upgrade | downgrade | aquisition_total | vtable | exit | total
256882787 | 4468 | 384192061 | 39687812 | 641698 | 42476661
";

    fn sampler() -> KstatSampler {
        KstatSampler::new("zil_itxg_bypass", "|")
    }

    #[test]
    fn test_parse_two_lines() {
        let update = sampler().parse(ITXG_BYPASS).unwrap();
        assert_eq!(update.get("vtable"), Some(39687812));
        assert_eq!(update.get("total"), Some(42476661));
        assert_eq!(update.len(), 6);
    }

    #[test]
    fn test_parse_with_metadata_line() {
        let update = sampler().parse(ITXG_BYPASS_RAW).unwrap();
        assert_eq!(update.get("downgrade"), Some(4468));
    }

    #[test]
    fn test_parse_rejects_column_mismatch() {
        let err = sampler()
            .parse("a | b\n1 | 2 | 3\n")
            .unwrap_err();
        assert!(matches!(err, BenchError::Parse { .. }));
    }

    #[test]
    fn test_parse_rejects_non_integer() {
        assert!(sampler().parse("a | b\n1 | x\n").is_err());
    }

    #[test]
    fn test_same_sample_twice_yields_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zvol_os_linux");
        std::fs::write(
            &path,
            "submit_bio__zvol_write(with_taskq_if_enabled) | zvol_write__taskq_qdelay | zvol_write__2zil_commit
2703667285 | 2430813031 | 126807724
",
        )
        .unwrap();

        let session = MeasurementSession::new(
            CollectorName::new("zvol_stats").unwrap(),
            KstatSampler::new(&path, "|"),
        );
        session.start().unwrap();
        session.end().unwrap();
        let result = session.result().unwrap();
        assert_eq!(result.get("zvol_write__2zil_commit"), Some(0));
    }

    #[test]
    fn test_window_difference() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zil_pmem");
        std::fs::write(&path, "commits | bytes\n10 | 4096\n").unwrap();

        let session = MeasurementSession::new(
            CollectorName::new("zil_pmem").unwrap(),
            KstatSampler::new(&path, "|"),
        );
        session.start().unwrap();
        std::fs::write(&path, "commits | bytes\n25 | 16384\n").unwrap();
        session.end().unwrap();

        let result = session.result().unwrap();
        assert_eq!(result, Update::from([("commits", 15), ("bytes", 12288)]));
    }
}
