//! Resource budget distribution
//!
//! CPU is computed in millicores and memory in bytes. The budget is the host
//! capacity minus the reservation; machines carrying an explicit limit keep
//! it and are left out of the split, per resource.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;
use tracing::debug;

use crate::context::HostCapacity;
use crate::model::{
    CpuMode, DistributionMode, InfraSpec, MachineKind, Reserve, ResourcePolicy,
};
use crate::units::{parse_cpu_count, parse_percent, parse_size, MIB};

pub const CPU_KEY: &str = "limits.cpu";
pub const CPU_ALLOWANCE_KEY: &str = "limits.cpu.allowance";
pub const MEMORY_KEY: &str = "limits.memory";
pub const MEMORY_ENFORCE_KEY: &str = "limits.memory.enforce";

const MILLI: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Resource {
    Cpu,
    Memory,
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::Cpu => write!(f, "cpu"),
            Resource::Memory => write!(f, "memory"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuLimit {
    /// Whole cores, written to `limits.cpu`
    Cores(u64),
    /// Share of host CPU time, written to `limits.cpu.allowance`
    AllowancePercent(u64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Allocation {
    pub cpu: Option<CpuLimit>,
    pub memory_mib: Option<u64>,
}

/// An explicit limit that cannot be read, or that overflows once converted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{value}' is not a usable {key}")]
pub struct LimitError {
    pub key: &'static str,
    pub value: String,
}

impl LimitError {
    fn new(key: &'static str, value: &str) -> Self {
        Self {
            key,
            value: value.to_string(),
        }
    }
}

/// Something the validator has to report
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceIssue {
    ReserveExceedsCapacity {
        resource: Resource,
        reserve: u64,
        capacity: u64,
    },
    Overcommit {
        resource: Resource,
        committed: u64,
        budget: u64,
    },
}

impl fmt::Display for ResourceIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceIssue::ReserveExceedsCapacity {
                resource,
                reserve,
                capacity,
            } => write!(
                f,
                "host reserve for {} ({}) is not below host capacity ({})",
                resource,
                amount(*resource, *reserve),
                amount(*resource, *capacity)
            ),
            ResourceIssue::Overcommit {
                resource,
                committed,
                budget,
            } => write!(
                f,
                "{} commitments ({}) exceed the budget left after reservation ({})",
                resource,
                amount(*resource, *committed),
                amount(*resource, *budget)
            ),
        }
    }
}

fn amount(resource: Resource, value: u64) -> String {
    match resource {
        Resource::Cpu => format!("{}m", value),
        Resource::Memory => format!("{}MiB", value / MIB),
    }
}

/// Totals for one resource, CPU in millicores and memory in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ledger {
    pub capacity: u64,
    pub reserve: u64,
    pub budget: u64,
    pub overrides: u64,
    pub committed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourcePlan {
    pub host: HostCapacity,
    pub cpu: Ledger,
    pub memory: Ledger,
    /// Limits for machines that take part in the split
    pub allocations: BTreeMap<String, Allocation>,
    pub issues: Vec<ResourceIssue>,
}

impl ResourcePlan {
    pub fn is_overcommitted(&self) -> bool {
        self.issues
            .iter()
            .any(|i| matches!(i, ResourceIssue::Overcommit { .. }))
    }
}

struct Candidate<'a> {
    name: &'a str,
    kind: MachineKind,
    weight: u64,
    cpu_override: Option<u64>,
    memory_override: Option<u64>,
}

/// Compute limits for every machine of an enabled domain.
pub fn plan(spec: &InfraSpec, policy: &ResourcePolicy, host: HostCapacity) -> ResourcePlan {
    let cpu_capacity = host.cpu_cores.saturating_mul(MILLI);
    let mem_capacity = host.memory_bytes;

    let candidates: Vec<Candidate<'_>> = spec
        .active_machines()
        .map(|m| Candidate {
            name: m.name,
            kind: m.machine.kind,
            weight: m.machine.weight.max(1),
            // Unusable values are reported by the validator; they claim nothing here
            cpu_override: cpu_override(&m.machine.config, cpu_capacity).unwrap_or(Some(0)),
            memory_override: memory_override(&m.machine.config, mem_capacity)
                .unwrap_or(Some(0)),
        })
        .collect();

    let mut cpu = Ledger {
        capacity: cpu_capacity,
        reserve: reserve(policy.host_reserve.cpu, cpu_capacity, MILLI),
        ..Ledger::default()
    };
    let mut memory = Ledger {
        capacity: mem_capacity,
        reserve: reserve(policy.host_reserve.memory, mem_capacity, 1),
        ..Ledger::default()
    };
    cpu.budget = cpu.capacity.saturating_sub(cpu.reserve);
    memory.budget = memory.capacity.saturating_sub(memory.reserve);
    cpu.overrides = candidates
        .iter()
        .filter_map(|c| c.cpu_override)
        .fold(0, u64::saturating_add);
    memory.overrides = candidates
        .iter()
        .filter_map(|c| c.memory_override)
        .fold(0, u64::saturating_add);

    let cpu_shares = split(
        policy.mode,
        cpu.budget.saturating_sub(cpu.overrides),
        candidates
            .iter()
            .filter(|c| c.cpu_override.is_none())
            .map(|c| (c.name, c.weight)),
    );
    let mem_shares = split(
        policy.mode,
        memory.budget.saturating_sub(memory.overrides),
        candidates
            .iter()
            .filter(|c| c.memory_override.is_none())
            .map(|c| (c.name, c.weight)),
    );

    let mut allocations: BTreeMap<String, Allocation> = BTreeMap::new();
    cpu.committed = cpu.overrides;
    memory.committed = memory.overrides;

    for candidate in &candidates {
        let mut allocation = Allocation::default();
        if let Some(share) = cpu_shares.get(candidate.name) {
            let limit = cpu_limit(policy.cpu_mode, candidate.kind, *share, cpu_capacity);
            let claimed = match limit {
                CpuLimit::Cores(cores) => cores.saturating_mul(MILLI),
                CpuLimit::AllowancePercent(pct) => percent_of(cpu_capacity, pct),
            };
            cpu.committed = cpu.committed.saturating_add(claimed);
            allocation.cpu = Some(limit);
        }
        if let Some(share) = mem_shares.get(candidate.name) {
            let mib = (share / MIB).max(candidate.kind.min_memory_mib());
            memory.committed = memory.committed.saturating_add(mib.saturating_mul(MIB));
            allocation.memory_mib = Some(mib);
        }
        if allocation != Allocation::default() {
            debug!("Resources for {}: {:?}", candidate.name, allocation);
            allocations.insert(candidate.name.to_string(), allocation);
        }
    }

    let mut issues = Vec::new();
    for (resource, ledger) in [(Resource::Cpu, &cpu), (Resource::Memory, &memory)] {
        if ledger.reserve >= ledger.capacity {
            issues.push(ResourceIssue::ReserveExceedsCapacity {
                resource,
                reserve: ledger.reserve,
                capacity: ledger.capacity,
            });
        } else if ledger.committed > ledger.budget {
            issues.push(ResourceIssue::Overcommit {
                resource,
                committed: ledger.committed,
                budget: ledger.budget,
            });
        }
    }

    ResourcePlan {
        host,
        cpu,
        memory,
        allocations,
        issues,
    }
}

/// Write planned limits into machine configs. Returns the number of
/// machines touched.
pub fn apply(spec: &mut InfraSpec, plan: &ResourcePlan, policy: &ResourcePolicy) -> usize {
    let mut touched = 0;
    for domain in spec.domains.values_mut().filter(|d| d.enabled) {
        for (name, machine) in domain.machines.iter_mut() {
            let Some(allocation) = plan.allocations.get(name) else {
                continue;
            };
            match allocation.cpu {
                Some(CpuLimit::Cores(cores)) => {
                    machine.config.insert(CPU_KEY.to_string(), cores.to_string());
                }
                Some(CpuLimit::AllowancePercent(pct)) => {
                    machine
                        .config
                        .insert(CPU_ALLOWANCE_KEY.to_string(), format!("{}%", pct));
                }
                None => {}
            }
            if let Some(mib) = allocation.memory_mib {
                machine
                    .config
                    .insert(MEMORY_KEY.to_string(), format!("{}MiB", mib));
                machine.config.insert(
                    MEMORY_ENFORCE_KEY.to_string(),
                    policy.memory_enforce.as_str().to_string(),
                );
            }
            touched += 1;
        }
    }
    touched
}

fn reserve(reserve: Reserve, capacity: u64, unit: u64) -> u64 {
    match reserve {
        Reserve::Percent(pct) => percent_of(capacity, pct),
        Reserve::Absolute(amount) => amount.saturating_mul(unit),
    }
}

fn percent_of(capacity: u64, pct: u64) -> u64 {
    (capacity as u128 * pct as u128 / 100).min(u64::MAX as u128) as u64
}

/// Millicores claimed by an explicit CPU limit.
///
/// An allowance of `25ms/100ms` or `50%` is a share of host CPU time.
pub fn cpu_override(
    config: &BTreeMap<String, String>,
    capacity: u64,
) -> Result<Option<u64>, LimitError> {
    if let Some(value) = config.get(CPU_KEY) {
        return parse_cpu_count(value)
            .and_then(|cores| cores.checked_mul(MILLI))
            .map(Some)
            .ok_or_else(|| LimitError::new(CPU_KEY, value));
    }
    let Some(value) = config.get(CPU_ALLOWANCE_KEY) else {
        return Ok(None);
    };
    if let Some(pct) = parse_percent(value) {
        return match pct {
            0..=100 => Ok(Some(percent_of(capacity, pct))),
            _ => Err(LimitError::new(CPU_ALLOWANCE_KEY, value)),
        };
    }
    value
        .split_once('/')
        .and_then(|(quota, period)| {
            let quota: u64 = quota.trim().trim_end_matches("ms").parse().ok()?;
            let period: u64 = period.trim().trim_end_matches("ms").parse().ok()?;
            if period == 0 {
                return None;
            }
            quota.checked_mul(MILLI).map(|q| q / period)
        })
        .map(Some)
        .ok_or_else(|| LimitError::new(CPU_ALLOWANCE_KEY, value))
}

/// Bytes claimed by an explicit memory limit, `50%` being a share of the host.
pub fn memory_override(
    config: &BTreeMap<String, String>,
    capacity: u64,
) -> Result<Option<u64>, LimitError> {
    let Some(value) = config.get(MEMORY_KEY) else {
        return Ok(None);
    };
    let bytes = match parse_percent(value) {
        Some(pct @ 0..=100) => Some(percent_of(capacity, pct)),
        Some(_) => None,
        None => parse_size(value),
    };
    bytes
        .map(Some)
        .ok_or_else(|| LimitError::new(MEMORY_KEY, value))
}

fn split<'a>(
    mode: DistributionMode,
    remaining: u64,
    members: impl Iterator<Item = (&'a str, u64)>,
) -> BTreeMap<&'a str, u64> {
    let members: Vec<_> = members.collect();
    if members.is_empty() {
        return BTreeMap::new();
    }
    let count = members.len() as u64;
    let total_weight: u128 = members.iter().map(|(_, w)| *w as u128).sum();
    members
        .into_iter()
        .map(|(name, weight)| {
            let share = match mode {
                DistributionMode::Equal => remaining / count,
                DistributionMode::Proportional => {
                    (remaining as u128 * weight as u128 / total_weight) as u64
                }
            };
            (name, share)
        })
        .collect()
}

fn cpu_limit(mode: CpuMode, kind: MachineKind, share: u64, capacity: u64) -> CpuLimit {
    // Virtual machines need a vCPU count; allowance is container-only.
    if mode == CpuMode::Count || kind == MachineKind::VirtualMachine {
        return CpuLimit::Cores((share / MILLI).max(1));
    }
    let pct = if capacity == 0 {
        0
    } else {
        (share as u128 * 100 / capacity as u128) as u64
    };
    CpuLimit::AllowancePercent(pct.max(1))
}
