//! CPU sets and thread pinning for context threads.
//!
//! A [`CpuSet`] is parsed from the Linux taskset/numactl string format:
//! single IDs (`"0"`), inclusive ranges (`"0-7"`), or comma-separated
//! mixes (`"0-3,8-11"`). Pool threads are pinned round-robin through a
//! [`CpuAllocator`] when pinning is enabled.

use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use crate::error::{Result, SpindleError};

/// A sorted, deduplicated set of logical CPU IDs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CpuSet(Vec<usize>);

impl CpuSet {
    /// Every logical CPU available to this process.
    pub fn available() -> Self {
        let cpus = core_affinity::get_core_ids()
            .map(|ids| ids.into_iter().map(|id| id.id).collect())
            .unwrap_or_default();
        Self(cpus)
    }

    /// Parse a taskset-style string.
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(SpindleError::InvalidCpuSet("empty cpuset string".into()));
        }

        let mut cpus = Vec::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((start, end)) = part.split_once('-') {
                let start: usize = start.trim().parse().map_err(|_| {
                    SpindleError::InvalidCpuSet(format!("invalid range start in '{}'", part))
                })?;
                let end: usize = end.trim().parse().map_err(|_| {
                    SpindleError::InvalidCpuSet(format!("invalid range end in '{}'", part))
                })?;
                if start > end {
                    return Err(SpindleError::InvalidCpuSet(format!(
                        "range start {} > end {} in '{}'",
                        start, end, part
                    )));
                }
                cpus.extend(start..=end);
            } else {
                let cpu: usize = part.parse().map_err(|_| {
                    SpindleError::InvalidCpuSet(format!("invalid CPU ID '{}'", part))
                })?;
                cpus.push(cpu);
            }
        }

        if cpus.is_empty() {
            return Err(SpindleError::InvalidCpuSet("no valid CPU IDs found".into()));
        }
        cpus.sort_unstable();
        cpus.dedup();
        Ok(Self(cpus))
    }

    /// Check every CPU in the set against the system.
    pub fn validate(&self) -> Result<()> {
        let available = Self::available();
        for &cpu in &self.0 {
            if !available.0.contains(&cpu) {
                return Err(SpindleError::CpuNotAvailable(cpu));
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }
}

impl FromStr for CpuSet {
    type Err = SpindleError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Pin the current thread to one CPU.
pub fn pin_current(cpu: usize) -> Result<()> {
    if core_affinity::set_for_current(core_affinity::CoreId { id: cpu }) {
        debug!(cpu, "pinned thread to CPU");
        Ok(())
    } else {
        warn!(cpu, "failed to pin thread to CPU");
        Err(SpindleError::AffinityFailed(cpu))
    }
}

/// Round-robin CPU handout for pool threads. Thread-safe.
#[derive(Debug)]
pub(crate) struct CpuAllocator {
    cpus: Vec<usize>,
    next: AtomicUsize,
}

impl CpuAllocator {
    pub(crate) fn new(set: &CpuSet) -> Self {
        assert!(!set.is_empty(), "CPU allocator requires at least one CPU");
        Self {
            cpus: set.as_slice().to_vec(),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn allocate(&self) -> usize {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.cpus.len();
        self.cpus[index]
    }
}
