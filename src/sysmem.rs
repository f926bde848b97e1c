//! System memory probing for the import cache.
//!
//! Reads `/proc/meminfo` (MemAvailable, with a MemFree+Buffers+Cached
//! fallback) and PSI from `/proc/pressure/memory` on Linux 4.20+. The fifo
//! consults this before growing its byte budget for an oversize entry, and
//! the job logs a warning at start when the host is already under pressure.

use std::fs;

use serde::{Deserialize, Serialize};

use crate::memory::{DEFAULT_SANITY_FRACTION, Growth, MemorySize, plan_growth};

/// PSI "some" threshold (percentage) above which the host counts as under pressure.
const PSI_SOME_THRESHOLD: f64 = 25.0;

/// Available memory below which the host counts as under pressure.
const MIN_AVAILABLE: MemorySize = MemorySize::from_gib(1);

/// Memory pressure snapshot.
#[derive(Debug, Clone)]
pub struct MemoryPressure {
    pub available: MemorySize,
    pub psi_some: Option<f64>,
}

impl MemoryPressure {
    pub fn is_high(&self) -> bool {
        self.available < MIN_AVAILABLE || self.psi_some.is_some_and(|p| p > PSI_SOME_THRESHOLD)
    }
}

/// Read the current memory pressure.
pub fn memory_pressure() -> MemoryPressure {
    MemoryPressure {
        available: available_memory().unwrap_or(MemorySize::from_bytes(u64::MAX)),
        psi_some: read_psi_some(),
    }
}

/// Policy for the fifo's "may I grow the byte budget" sanity check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySanity {
    /// Share of available memory a reduced request may take.
    pub fraction: f64,
    /// Pretend this much memory is available instead of probing the host.
    pub available_override: Option<MemorySize>,
}

impl Default for MemorySanity {
    fn default() -> Self {
        Self {
            fraction: DEFAULT_SANITY_FRACTION,
            available_override: None,
        }
    }
}

impl MemorySanity {
    pub fn with_available(available: MemorySize) -> Self {
        Self {
            available_override: Some(available),
            ..Self::default()
        }
    }

    pub fn available(&self) -> MemorySize {
        self.available_override
            .or_else(available_memory)
            .unwrap_or(MemorySize::from_bytes(u64::MAX))
    }

    /// Plan the budget growth for one entry of `entry_size` bytes.
    pub fn plan(&self, entry_size: u64) -> Growth {
        let available = self.available();
        let plan = plan_growth(entry_size, available, self.fraction);
        tracing::debug!(
            entry_size,
            available_mib = available.as_mib(),
            ?plan,
            "memory sanity check"
        );
        plan
    }
}

/// Read available memory from /proc/meminfo.
#[cfg(target_os = "linux")]
pub fn available_memory() -> Option<MemorySize> {
    let contents = fs::read_to_string("/proc/meminfo").ok()?;

    for line in contents.lines() {
        if line.starts_with("MemAvailable:") {
            // Format: "MemAvailable:    12345678 kB"
            let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
            return Some(MemorySize::from_kib(kb));
        }
    }

    // Older kernels: MemFree + Buffers + Cached
    let mut total_kb = 0u64;
    for line in contents.lines() {
        let Some(value) = line.split_whitespace().nth(1) else {
            continue;
        };
        if line.starts_with("MemFree:")
            || line.starts_with("Buffers:")
            || line.starts_with("Cached:")
        {
            total_kb += value.parse::<u64>().unwrap_or(0);
        }
    }

    (total_kb > 0).then(|| MemorySize::from_kib(total_kb))
}

#[cfg(not(target_os = "linux"))]
pub fn available_memory() -> Option<MemorySize> {
    None
}

/// Read the PSI "some avg10" percentage.
#[cfg(target_os = "linux")]
fn read_psi_some() -> Option<f64> {
    let contents = fs::read_to_string("/proc/pressure/memory").ok()?;
    contents
        .lines()
        .find(|line| line.starts_with("some"))?
        .split_whitespace()
        .find_map(|part| part.strip_prefix("avg10="))
        .and_then(|v| v.parse().ok())
}

#[cfg(not(target_os = "linux"))]
fn read_psi_some() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_is_used() {
        let sanity = MemorySanity::with_available(MemorySize::from_bytes(2000));
        assert_eq!(sanity.available(), MemorySize::from_bytes(2000));
        assert_eq!(sanity.plan(1000), Growth::Reduced(MemorySize::from_bytes(1500)));
        assert_eq!(sanity.plan(1900), Growth::Refused);
    }

    #[test]
    fn test_pressure_thresholds() {
        let low = MemoryPressure {
            available: MemorySize::from_mib(100),
            psi_some: None,
        };
        assert!(low.is_high());

        let stalled = MemoryPressure {
            available: MemorySize::from_gib(64),
            psi_some: Some(40.0),
        };
        assert!(stalled.is_high());

        let fine = MemoryPressure {
            available: MemorySize::from_gib(64),
            psi_some: Some(1.0),
        };
        assert!(!fine.is_high());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_available_memory_reads_proc() {
        if std::path::Path::new("/proc/meminfo").exists() {
            assert!(available_memory().is_some());
        }
    }

    #[test]
    fn test_sanity_deserializes_with_defaults() {
        let sanity: MemorySanity = serde_json::from_str("{}").unwrap();
        assert!((sanity.fraction - 0.75).abs() < f64::EPSILON);
        assert!(sanity.available_override.is_none());
    }
}
