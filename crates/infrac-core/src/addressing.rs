//! Address allocation
//!
//! Every domain owns one `/24` of the form `10.<zone>.<sequence>.0/24`.
//! The zone comes from the trust level, the sequence from an explicit
//! `subnet_id` or, failing that, the lowest number nobody claimed in that
//! zone. Domains are visited in name order so the result never depends on
//! how the descriptor was split across files.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use tracing::debug;

use crate::error::AllocationError;
use crate::model::{AddressingConfig, InfraSpec, TrustLevel};

/// Host octet of every bridge gateway
pub const GATEWAY_HOST: u8 = 254;

/// Host octets handed out to machines without an explicit address
pub const STATIC_RANGE: RangeInclusive<u8> = 1..=99;

/// Highest usable sequence number within a zone
pub const MAX_SEQUENCE: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subnet {
    pub base: u8,
    pub zone: u8,
    pub sequence: u8,
}

impl Subnet {
    pub fn network(&self) -> Ipv4Addr {
        self.host(0)
    }

    pub fn gateway(&self) -> Ipv4Addr {
        self.host(GATEWAY_HOST)
    }

    pub fn host(&self, octet: u8) -> Ipv4Addr {
        Ipv4Addr::new(self.base, self.zone, self.sequence, octet)
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let [a, b, c, _] = ip.octets();
        a == self.base && b == self.zone && c == self.sequence
    }

    /// `10.120.0.0/24`
    pub fn cidr(&self) -> String {
        format!("{}/24", self.network())
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cidr())
    }
}

/// Two domains explicitly claimed the same sequence in one zone
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceConflict {
    pub zone: u8,
    pub sequence: u8,
    pub first: String,
    pub second: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubnetPlan {
    /// Resolved subnet per domain, disabled domains included
    pub subnets: BTreeMap<String, Subnet>,
    pub conflicts: Vec<SequenceConflict>,
}

impl SubnetPlan {
    pub fn get(&self, domain: &str) -> Option<&Subnet> {
        self.subnets.get(domain)
    }
}

/// Second octet for a trust level, `None` when the configuration overflows
pub fn zone_for(config: &AddressingConfig, trust: TrustLevel) -> Option<u8> {
    let zone = trust
        .offset()
        .checked_mul(config.zone_step)?
        .checked_add(config.zone_base)?;
    u8::try_from(zone).ok()
}

/// Resolve the subnet of every domain.
///
/// Domains whose zone or sequence cannot be resolved are left out of the
/// plan; the validator reports why.
pub fn plan_subnets(spec: &InfraSpec) -> SubnetPlan {
    let mut plan = SubnetPlan::default();
    let config = &spec.global.addressing;
    let Ok(base) = u8::try_from(config.base_octet) else {
        return plan;
    };

    // zone -> sequence -> owning domain
    let mut claimed: BTreeMap<u8, BTreeMap<u8, String>> = BTreeMap::new();
    let mut pending: Vec<(&str, u8)> = Vec::new();

    for (name, domain) in &spec.domains {
        let Some(zone) = zone_for(config, domain.trust_level) else {
            continue;
        };
        match domain.subnet_id {
            Some(id) => {
                let Some(sequence) = u8::try_from(id).ok().filter(|s| *s <= MAX_SEQUENCE) else {
                    continue;
                };
                let owners = claimed.entry(zone).or_default();
                if let Some(first) = owners.get(&sequence) {
                    plan.conflicts.push(SequenceConflict {
                        zone,
                        sequence,
                        first: first.clone(),
                        second: name.clone(),
                    });
                } else {
                    owners.insert(sequence, name.clone());
                }
                plan.subnets.insert(name.clone(), Subnet { base, zone, sequence });
            }
            None => pending.push((name.as_str(), zone)),
        }
    }

    for (name, zone) in pending {
        let owners = claimed.entry(zone).or_default();
        let Some(sequence) = (0..=MAX_SEQUENCE).find(|s| !owners.contains_key(s)) else {
            continue;
        };
        debug!("Domain {} gets sequence {} in zone {}", name, sequence, zone);
        owners.insert(sequence, name.to_string());
        plan.subnets
            .insert(name.to_string(), Subnet { base, zone, sequence });
    }

    plan
}

/// Give every machine without an explicit address the lowest free host
/// octet of its domain's subnet, in declaration order.
///
/// Returns the number of addresses assigned. Explicit addresses are left
/// untouched.
pub fn apply(spec: &mut InfraSpec, plan: &SubnetPlan) -> Result<usize, AllocationError> {
    let mut assigned = 0;
    for (name, domain) in spec.domains.iter_mut() {
        if domain.machines.values().all(|m| m.ip.is_some()) {
            continue;
        }
        let subnet = plan
            .get(name)
            .copied()
            .ok_or_else(|| AllocationError::UnresolvedSubnet {
                domain: name.clone(),
            })?;

        let mut used: BTreeSet<u8> = domain
            .machines
            .values()
            .filter_map(|m| m.ip)
            .filter(|ip| subnet.contains(*ip))
            .map(|ip| ip.octets()[3])
            .collect();

        for (machine_name, machine) in domain.machines.iter_mut() {
            if machine.ip.is_some() {
                continue;
            }
            let octet = STATIC_RANGE
                .clone()
                .find(|o| !used.contains(o))
                .ok_or_else(|| AllocationError::AddressSpaceExhausted {
                    domain: name.clone(),
                    machine: machine_name.clone(),
                    range: format!(
                        "{}-{}",
                        subnet.host(*STATIC_RANGE.start()),
                        subnet.host(*STATIC_RANGE.end())
                    ),
                })?;
            used.insert(octet);
            let ip = subnet.host(octet);
            debug!("Assigned {} to {}", ip, machine_name);
            machine.ip = Some(ip);
            assigned += 1;
        }
    }
    Ok(assigned)
}
