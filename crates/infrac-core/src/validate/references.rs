use super::Validator;
use crate::diagnostics::{Category, Location};
use crate::model::{Ports, DEFAULT_PROFILE};

const MAX_PORT: u64 = 65535;

impl Validator<'_> {
    /// Profiles are resolved inside the machine's own domain.
    pub(super) fn check_profile_references(&mut self) {
        for m in self.spec.machines() {
            for (index, profile) in m.machine.profiles.iter().enumerate() {
                if profile != DEFAULT_PROFILE && !m.domain.profiles.contains_key(profile) {
                    self.diags.error(
                        Category::Reference,
                        Location::machine(m.domain_name, m.name)
                            .in_field("profiles")
                            .at_index(index),
                        format!(
                            "profile '{}' is not declared in domain '{}'",
                            profile, m.domain_name
                        ),
                    );
                }
            }
        }
    }

    pub(super) fn check_network_policies(&mut self) {
        let spec = self.spec;
        for (index, policy) in spec.network_policies.iter().enumerate() {
            let loc = Location::policy(index);
            for (field, endpoint) in [("from", &policy.from), ("to", &policy.to)] {
                // A missing endpoint was already reported while decoding
                if endpoint.is_empty() || self.resolves(endpoint, true) {
                    continue;
                }
                self.diags.error(
                    Category::Reference,
                    loc.clone().in_field(field),
                    format!(
                        "'{}' is neither a domain, a machine nor 'host'",
                        endpoint
                    ),
                );
            }

            if let Ports::List(ports) = &policy.ports {
                for (i, port) in ports.iter().enumerate() {
                    if *port < 1 || *port > MAX_PORT {
                        self.diags.error(
                            Category::Schema,
                            loc.clone().in_field("ports").at_index(i),
                            format!("port {} is out of range 1-{}", port, MAX_PORT),
                        );
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{check, error_locations};
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unknown_profile() {
        let diags = check(
            r#"
project_name: demo
domains:
  pro:
    profiles:
      dev: {}
    machines:
      pro-dev:
        profiles: [default, dev, gpu]
  perso:
    machines:
      perso-box:
        profiles: [dev]
"#,
        );
        assert_eq!(
            error_locations(&diags, Category::Reference),
            vec![
                "domains.perso.machines.perso-box.profiles[0]",
                "domains.pro.machines.pro-dev.profiles[2]",
            ]
        );
    }

    #[test]
    fn test_policy_endpoints_and_ports() {
        let diags = check(
            r#"
project_name: demo
domains:
  pro:
    machines:
      pro-dev: {}
network_policies:
  - from: pro-dev
    to: host
    ports: [22, 70000, 0]
  - from: pro
    to: ghost
"#,
        );
        assert_eq!(
            error_locations(&diags, Category::Reference),
            vec!["network_policies[1].to"]
        );
        assert_eq!(
            error_locations(&diags, Category::Schema),
            vec!["network_policies[0].ports[1]", "network_policies[0].ports[2]"]
        );
    }
}
