use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use super::Validator;
use crate::addressing::{zone_for, GATEWAY_HOST, STATIC_RANGE};
use crate::diagnostics::{Category, Location};
use crate::model::TrustLevel;

/// First octet of the RFC 1918 `10.0.0.0/8` block
const PRIVATE_BASE: u64 = 10;

impl Validator<'_> {
    pub(super) fn check_addressing_config(&mut self) {
        let config = self.spec.global.addressing;
        let loc = Location::global("addressing");

        if config.base_octet != PRIVATE_BASE {
            self.diags.error(
                Category::Address,
                loc.clone().in_field("base_octet"),
                format!("base_octet must be {}, found {}", PRIVATE_BASE, config.base_octet),
            );
        }
        if config.zone_step < 1 {
            self.diags.error(
                Category::Address,
                loc.clone().in_field("zone_step"),
                "zone_step must be at least 1",
            );
        }
        let top = TrustLevel::Disposable.offset();
        let highest = config
            .zone_step
            .checked_mul(top)
            .and_then(|z| z.checked_add(config.zone_base));
        if highest.map_or(true, |z| z > 255) {
            self.diags.error(
                Category::Address,
                loc.in_field("zone_base"),
                format!(
                    "zone_base + {} * zone_step must not exceed 255 (zone_base {}, zone_step {})",
                    top, config.zone_base, config.zone_step
                ),
            );
        }
    }

    pub(super) fn check_addresses(&mut self) {
        let config = self.spec.global.addressing;

        for conflict in &self.subnets.conflicts {
            self.diags.error(
                Category::Address,
                Location::domain(&conflict.second).in_field("subnet_id"),
                format!(
                    "sequence {} in zone {} is already used by domain '{}'",
                    conflict.sequence, conflict.zone, conflict.first
                ),
            );
        }

        let mut taken: BTreeMap<Ipv4Addr, (&str, &str)> = BTreeMap::new();

        for (domain_name, domain) in &self.spec.domains {
            let subnet = self.subnets.get(domain_name).copied();
            if subnet.is_none()
                && domain.subnet_id.is_none()
                && zone_for(&config, domain.trust_level).is_some()
            {
                self.diags.error(
                    Category::Address,
                    Location::domain(domain_name),
                    format!(
                        "no free subnet sequence left in the {} zone",
                        domain.trust_level
                    ),
                );
            }

            let mut automatic = 0usize;
            let mut low_used = 0usize;

            for (name, machine) in &domain.machines {
                let Some(ip) = machine.ip else {
                    automatic += 1;
                    continue;
                };
                let loc = Location::machine(domain_name, name).in_field("ip");

                if let Some(subnet) = subnet {
                    if !subnet.contains(ip) {
                        self.diags.error(
                            Category::Address,
                            loc.clone(),
                            format!("{} is outside the domain subnet {}", ip, subnet),
                        );
                    } else if STATIC_RANGE.contains(&ip.octets()[3]) {
                        low_used += 1;
                    }
                }

                let host = ip.octets()[3];
                if host == 0 || host == GATEWAY_HOST || host == 255 {
                    self.diags.error(
                        Category::Address,
                        loc.clone(),
                        format!(
                            "host part .{} is reserved (network, gateway .{} or broadcast)",
                            host, GATEWAY_HOST
                        ),
                    );
                }

                match taken.get(&ip) {
                    Some((first_domain, first)) => self.diags.error(
                        Category::Address,
                        loc,
                        format!(
                            "{} is already assigned to machine '{}' in domain '{}'",
                            ip, first, first_domain
                        ),
                    ),
                    None => {
                        taken.insert(ip, (domain_name.as_str(), name.as_str()));
                    }
                }
            }

            let capacity = STATIC_RANGE.len();
            if subnet.is_some() && automatic + low_used > capacity {
                self.diags.error(
                    Category::Address,
                    Location::domain(domain_name).in_field("machines"),
                    format!(
                        "{} machine(s) need an automatic address but only {} of .{}-.{} are free",
                        automatic,
                        capacity - low_used,
                        STATIC_RANGE.start(),
                        STATIC_RANGE.end()
                    ),
                );
            }
        }
    }
}
