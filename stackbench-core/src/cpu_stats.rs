// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! CPU time accounting from `/proc/stat`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

use crate::counters::Update;
use crate::error::{BenchError, BenchResult, SchemaDrift};
use crate::measurement::Sampler;

/// Per-CPU time fields, in `/proc/stat` column order (USER_HZ ticks).
pub const CPU_TIME_FIELDS: [&str; 10] = [
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

/// One `/proc/stat` snapshot: the aggregate line plus every `cpuN` line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuTimes {
    pub all: Update,
    pub per_cpu: BTreeMap<u32, Update>,
}

/// Parses `/proc/stat` content.
///
/// Kernels older than 2.6.33 report fewer than ten columns; missing
/// trailing columns read as zero.
pub fn parse_proc_stat(content: &str) -> BenchResult<CpuTimes> {
    let mut all = None;
    let mut per_cpu = BTreeMap::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(tag) = parts.first() else {
            continue;
        };
        let Some(suffix) = tag.strip_prefix("cpu") else {
            continue;
        };

        let mut counters = BTreeMap::new();
        for (idx, field) in CPU_TIME_FIELDS.iter().enumerate() {
            let value = match parts.get(idx + 1) {
                Some(raw) => raw.parse::<i64>().map_err(|_| BenchError::Parse {
                    context: "/proc/stat".to_string(),
                    message: format!("{} {} is not an integer: {:?}", tag, field, raw),
                })?,
                None => 0,
            };
            counters.insert(field.to_string(), value);
        }
        let update = Update::new(counters);

        if suffix.is_empty() {
            all = Some(update);
        } else {
            let id: u32 = suffix.parse().map_err(|_| BenchError::Parse {
                context: "/proc/stat".to_string(),
                message: format!("unexpected cpu line tag {:?}", tag),
            })?;
            per_cpu.insert(id, update);
        }
    }

    let all = all.ok_or_else(|| BenchError::Parse {
        context: "/proc/stat".to_string(),
        message: "no aggregate cpu line".to_string(),
    })?;

    Ok(CpuTimes { all, per_cpu })
}

/// Samples CPU time spent in each mode, overall and per CPU.
#[derive(Debug, Clone)]
pub struct CpuTimeSampler {
    path: PathBuf,
}

impl CpuTimeSampler {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Default for CpuTimeSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Sampler for CpuTimeSampler {
    type Sample = CpuTimes;
    type Output = CpuTimes;

    fn sample(&self) -> BenchResult<CpuTimes> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(BenchError::io(format!("reading {}", self.path.display())))?;
        parse_proc_stat(&content)
    }

    fn diff(&self, start: &CpuTimes, end: &CpuTimes) -> BenchResult<CpuTimes> {
        let start_cpus: Vec<&u32> = start.per_cpu.keys().collect();
        let end_cpus: Vec<&u32> = end.per_cpu.keys().collect();
        if start_cpus != end_cpus {
            let missing = start
                .per_cpu
                .keys()
                .filter(|id| !end.per_cpu.contains_key(id))
                .map(|id| format!("cpu{}", id))
                .collect();
            let unexpected = end
                .per_cpu
                .keys()
                .filter(|id| !start.per_cpu.contains_key(id))
                .map(|id| format!("cpu{}", id))
                .collect();
            return Err(SchemaDrift { missing, unexpected }.into());
        }

        let mut per_cpu = BTreeMap::new();
        for (id, end_cpu) in &end.per_cpu {
            per_cpu.insert(*id, end_cpu.diff(&start.per_cpu[id])?);
        }

        Ok(CpuTimes {
            all: end.all.diff(&start.all)?,
            per_cpu,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STAT_START: &str = "cpu  100 0 50 1000 10 0 5 0 0 0
cpu0 60 0 30 500 6 0 3 0 0 0
cpu1 40 0 20 500 4 0 2 0 0 0
intr 12345
ctxt 999
btime 1700000000
";

    const STAT_END: &str = "cpu  180 0 70 1100 10 0 7 0 0 0
cpu0 110 0 40 550 6 0 4 0 0 0
cpu1 70 0 30 550 4 0 3 0 0 0
intr 12999
ctxt 1999
btime 1700000000
";

    #[test]
    fn test_parse_proc_stat() {
        let times = parse_proc_stat(STAT_START).unwrap();
        assert_eq!(times.all.get("user"), Some(100));
        assert_eq!(times.all.get("idle"), Some(1000));
        assert_eq!(times.all.len(), CPU_TIME_FIELDS.len());
        assert_eq!(times.per_cpu.len(), 2);
        assert_eq!(times.per_cpu[&1].get("system"), Some(20));
    }

    #[test]
    fn test_short_lines_read_as_zero() {
        let times = parse_proc_stat("cpu 1 2 3 4\n").unwrap();
        assert_eq!(times.all.get("guest_nice"), Some(0));
        assert!(times.per_cpu.is_empty());
    }

    #[test]
    fn test_missing_aggregate_line() {
        assert!(parse_proc_stat("cpu0 1 2 3 4\n").is_err());
    }

    #[test]
    fn test_diff() {
        let sampler = CpuTimeSampler::new();
        let start = parse_proc_stat(STAT_START).unwrap();
        let end = parse_proc_stat(STAT_END).unwrap();
        let delta = sampler.diff(&start, &end).unwrap();
        assert_eq!(delta.all.get("user"), Some(80));
        assert_eq!(delta.all.get("idle"), Some(100));
        assert_eq!(delta.per_cpu[&0].get("user"), Some(50));
        assert_eq!(delta.per_cpu[&1].get("softirq"), Some(1));
    }

    #[test]
    fn test_cpu_hotplug_is_schema_drift() {
        let sampler = CpuTimeSampler::new();
        let start = parse_proc_stat(STAT_START).unwrap();
        let end = parse_proc_stat("cpu 1 1 1 1 1 1 1 1 1 1\ncpu0 1 1 1 1 1 1 1 1 1 1\n").unwrap();
        assert!(sampler.diff(&start, &end).unwrap_err().is_schema_drift());
    }

    #[test]
    fn test_sample_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stat");
        std::fs::write(&path, STAT_START).unwrap();
        let times = CpuTimeSampler::with_path(&path).sample().unwrap();
        assert_eq!(times.per_cpu[&0].get("iowait"), Some(6));
    }
}
