//! Synthesis of implicit resources.
//!
//! Runs between the two validation passes. Everything it adds is derived
//! from global flags, and an explicit declaration always wins, so a second
//! run over its own output is a no-op.

use std::fmt;
use std::net::Ipv4Addr;

use tracing::{debug, info};

use crate::addressing::{plan_subnets, Subnet};
use crate::error::EnrichError;
use crate::model::{
    AiAccessPolicy, FirewallMode, InfraSpec, Machine, MachineKind, NetworkPolicy, Ports,
    Protocol, AI_TOOLS_DOMAIN, FIREWALL_MACHINE, LEGACY_FIREWALL_MACHINE,
};
use crate::resources::{CPU_KEY, MEMORY_KEY};

/// Host octet reserved for the synthesized firewall, next to the gateway
pub const FIREWALL_HOST: u8 = 253;

/// Something the enricher added
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Synthesized {
    FirewallMachine { domain: String, ip: Option<Ipv4Addr> },
    AiAccessPolicy { from: String },
}

impl fmt::Display for Synthesized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Synthesized::FirewallMachine { domain, .. } => {
                write!(f, "machine {} in domain {}", FIREWALL_MACHINE, domain)
            }
            Synthesized::AiAccessPolicy { from } => {
                write!(f, "network policy {} -> {}", from, AI_TOOLS_DOMAIN)
            }
        }
    }
}

/// Fail fast on what enrichment cannot work around, even when validation
/// has already found errors and enrichment itself will not run.
pub fn preconditions(spec: &InfraSpec) -> Result<(), EnrichError> {
    let admin = &spec.global.admin_domain;
    if spec.global.firewall_mode == FirewallMode::Vm && !spec.domains.contains_key(admin) {
        return Err(EnrichError::MissingAdminDomain {
            domain: admin.clone(),
        });
    }
    Ok(())
}

pub fn enrich(spec: &mut InfraSpec) -> Result<Vec<Synthesized>, EnrichError> {
    let mut added = Vec::new();

    if let Some(item) = firewall_machine(spec)? {
        added.push(item);
    }
    if let Some(item) = ai_access_policy(spec) {
        added.push(item);
    }

    for item in &added {
        info!("Synthesized {}", item);
    }
    Ok(added)
}

fn firewall_machine(spec: &mut InfraSpec) -> Result<Option<Synthesized>, EnrichError> {
    if spec.global.firewall_mode != FirewallMode::Vm {
        return Ok(None);
    }
    let admin = spec.global.admin_domain.clone();
    // Resolved before the mutable borrow below
    let subnet: Option<Subnet> = plan_subnets(spec).get(&admin).copied();

    let domain = spec
        .domains
        .get_mut(&admin)
        .ok_or_else(|| EnrichError::MissingAdminDomain {
            domain: admin.clone(),
        })?;

    if domain.machines.contains_key(FIREWALL_MACHINE)
        || domain.machines.contains_key(LEGACY_FIREWALL_MACHINE)
    {
        debug!("Firewall machine already declared in {}", admin);
        return Ok(None);
    }

    let ip = subnet.map(|s| s.host(FIREWALL_HOST));
    let machine = Machine {
        description: "Firewall router between domains".to_string(),
        kind: MachineKind::VirtualMachine,
        ip,
        roles: vec!["base_system".to_string(), "firewall_router".to_string()],
        config: [
            (CPU_KEY.to_string(), "2".to_string()),
            (MEMORY_KEY.to_string(), "2GiB".to_string()),
        ]
        .into_iter()
        .collect(),
        ..Machine::default()
    };
    domain.machines.insert(FIREWALL_MACHINE.to_string(), machine);

    Ok(Some(Synthesized::FirewallMachine { domain: admin, ip }))
}

fn ai_access_policy(spec: &mut InfraSpec) -> Option<Synthesized> {
    if spec.global.ai_access_policy != AiAccessPolicy::Exclusive {
        return None;
    }
    let from = spec.global.ai_access_default.clone()?;
    if spec
        .network_policies
        .iter()
        .any(|p| p.to == AI_TOOLS_DOMAIN)
    {
        debug!("Access policy towards {} already declared", AI_TOOLS_DOMAIN);
        return None;
    }

    spec.network_policies.push(NetworkPolicy {
        description: format!("Exclusive access from {} to {}", from, AI_TOOLS_DOMAIN),
        from: from.clone(),
        to: AI_TOOLS_DOMAIN.to_string(),
        ports: Ports::All,
        protocol: Protocol::Tcp,
        bidirectional: true,
    });
    Some(Synthesized::AiAccessPolicy { from })
}
