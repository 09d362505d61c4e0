//! Invocation context supplied by the caller
//!
//! Nesting depth, isolation boundaries and host capacity are passed in
//! explicitly rather than discovered from files on the host, so every phase
//! stays testable in isolation.

use std::fs;
use std::path::PathBuf;

use tracing::debug;

use crate::units::KIB;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompileContext {
    /// How many compiler-managed hosts sit above this invocation
    pub depth: u32,
    /// A virtual machine boundary separates this host from the physical one
    pub vm_boundary: bool,
    /// Operator accepts relaxed isolation checks
    pub policy_override: bool,
    /// Known host capacity; probed when absent
    pub host: Option<HostCapacity>,
}

impl CompileContext {
    /// Prefix for Incus-side resource names, empty at the top level
    pub fn name_prefix(&self, enabled: bool) -> String {
        if enabled && self.depth > 0 {
            format!("{:03}-", self.depth)
        } else {
            String::new()
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCapacity {
    pub cpu_cores: u64,
    pub memory_bytes: u64,
}

/// Source of host capacity when the context does not carry one
pub trait HostProbe {
    fn probe(&self) -> Option<HostCapacity>;
}

/// Reads the CPU count from the scheduler and memory from `/proc/meminfo`
#[derive(Debug, Clone)]
pub struct ProcProbe {
    meminfo: PathBuf,
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self {
            meminfo: PathBuf::from("/proc/meminfo"),
        }
    }
}

impl ProcProbe {
    pub fn with_meminfo(path: impl Into<PathBuf>) -> Self {
        Self {
            meminfo: path.into(),
        }
    }
}

impl HostProbe for ProcProbe {
    fn probe(&self) -> Option<HostCapacity> {
        let cpu_cores = std::thread::available_parallelism().ok()?.get() as u64;
        let content = fs::read_to_string(&self.meminfo)
            .map_err(|e| debug!("cannot read {}: {}", self.meminfo.display(), e))
            .ok()?;
        let memory_bytes = parse_mem_total(&content)?;
        Some(HostCapacity {
            cpu_cores,
            memory_bytes,
        })
    }
}

/// Never knows the host; used to disable allocation
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProbe;

impl HostProbe for NoProbe {
    fn probe(&self) -> Option<HostCapacity> {
        None
    }
}

fn parse_mem_total(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kib: u64 = rest.trim().trim_end_matches("kB").trim().parse().ok()?;
        Some(kib * KIB)
    })
}
