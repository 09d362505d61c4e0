use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use super::{pattern, Validator};
use crate::diagnostics::{Category, Location};
use crate::model::HOST_ENDPOINT;

const NAME_PATTERN: &str = r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?$";
const MAX_NAME_LEN: usize = 63;

/// Implicit inventory group; its variables file holds the global settings
const ALL_GROUP: &str = "all";

static NAME: OnceLock<Option<Regex>> = OnceLock::new();

/// Lowercase alphanumerics and inner hyphens, at most 63 characters
pub fn is_valid_name(name: &str) -> bool {
    name.len() <= MAX_NAME_LEN && pattern(&NAME, NAME_PATTERN).is_some_and(|re| re.is_match(name))
}

impl Validator<'_> {
    pub(super) fn check_names(&mut self) {
        let spec = self.spec;
        if spec.project_name.trim().is_empty() {
            self.diags.error(
                Category::Naming,
                Location::root().in_field("project_name"),
                "project name must not be empty",
            );
        }

        for (domain_name, domain) in &spec.domains {
            self.check_name("domain", domain_name, Location::domain(domain_name));
            for profile in domain.profiles.keys() {
                let loc = Location::domain(domain_name)
                    .in_field("profiles")
                    .in_field(profile);
                self.check_name("profile", profile, loc);
            }
            for machine in domain.machines.keys() {
                self.check_name("machine", machine, Location::machine(domain_name, machine));
            }
        }

        for volume in spec.shared_volumes.keys() {
            self.check_name("shared volume", volume, Location::volume(volume));
        }
    }

    fn check_name(&mut self, kind: &str, name: &str, loc: Location) {
        if !is_valid_name(name) {
            self.diags.error(
                Category::Naming,
                loc,
                format!(
                    "{} name '{}' must match {} and be at most {} characters",
                    kind, name, NAME_PATTERN, MAX_NAME_LEN
                ),
            );
        } else if name == HOST_ENDPOINT && kind != "profile" && kind != "shared volume" {
            self.diags.error(
                Category::Naming,
                loc,
                format!("'{}' is reserved for the hypervisor policy endpoint", HOST_ENDPOINT),
            );
        } else if name == ALL_GROUP && kind == "domain" {
            self.diags.error(
                Category::Naming,
                loc,
                format!("'{}' is the implicit inventory group of every domain", ALL_GROUP),
            );
        }
    }

    /// Machine names are unique across every domain, not only within one.
    pub(super) fn check_machine_uniqueness(&mut self) {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for m in self.spec.machines() {
            match seen.get(m.name) {
                Some(first) => self.diags.error(
                    Category::Uniqueness,
                    Location::machine(m.domain_name, m.name),
                    format!(
                        "machine '{}' is declared in both domain '{}' and domain '{}'",
                        m.name, first, m.domain_name
                    ),
                ),
                None => {
                    seen.insert(m.name, m.domain_name);
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
    fn test_name_pattern() {
        assert!(is_valid_name("pro-dev"));
        assert!(is_valid_name("a"));
        assert!(is_valid_name("ai-tools"));
        assert!(!is_valid_name("Pro"));
        assert!(!is_valid_name("-pro"));
        assert!(!is_valid_name("pro-"));
        assert!(!is_valid_name("pro_dev"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name(&"a".repeat(64)));
        assert!(is_valid_name(&"a".repeat(63)));
    }

    #[test]
    fn test_machine_names_are_globally_unique() {
        let diags = check(
            r#"
project_name: demo
domains:
  pro:
    machines:
      shared-name: {}
  perso:
    machines:
      shared-name: {}
"#,
        );
        let errors: Vec<_> = diags.by_category(Category::Uniqueness).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("'perso'"));
        assert!(errors[0].message.contains("'pro'"));
    }

    #[test]
    fn test_invalid_names_are_located() {
        let diags = check(
            r#"
project_name: ""
domains:
  pro:
    profiles:
      Big_Profile: {}
    machines:
      UPPER: {}
shared_volumes:
  no_underscores: {}
"#,
        );
        assert_eq!(
            error_locations(&diags, Category::Naming),
            vec![
                "project_name",
                "domains.pro.profiles.Big_Profile",
                "domains.pro.machines.UPPER",
                "shared_volumes.no_underscores",
            ]
        );
    }

    #[test]
    fn test_host_is_reserved() {
        let diags = check(
            r#"
project_name: demo
domains:
  host: {}
  all: {}
"#,
        );
        assert_eq!(
            error_locations(&diags, Category::Naming),
            vec!["domains.all", "domains.host"]
        );
    }
}
