//! Range and format checks on individual machine and domain fields

use std::sync::OnceLock;

use regex::Regex;

use super::{pattern, Validator};
use crate::addressing::MAX_SEQUENCE;
use crate::diagnostics::{Category, Location};
use crate::units::parse_size;

const EXPIRY_PATTERN: &str = r"^\d+[mhdwy]$";
const CRON_FIELD_PATTERN: &str = r"^(\*|[0-9A-Za-z]+(-[0-9A-Za-z]+)?)(/[0-9]+)?(,(\*|[0-9A-Za-z]+(-[0-9A-Za-z]+)?)(/[0-9]+)?)*$";
const CRON_ALIASES: &[&str] = &[
    "@hourly", "@daily", "@midnight", "@weekly", "@monthly", "@annually", "@yearly",
];
const MAX_BOOT_PRIORITY: u64 = 100;

static EXPIRY: OnceLock<Option<Regex>> = OnceLock::new();
static CRON_FIELD: OnceLock<Option<Regex>> = OnceLock::new();

/// Five whitespace separated cron fields, or one of the `@` shortcuts
pub fn is_valid_schedule(schedule: &str) -> bool {
    let schedule = schedule.trim();
    if CRON_ALIASES.contains(&schedule) {
        return true;
    }
    let fields: Vec<&str> = schedule.split_whitespace().collect();
    fields.len() == 5
        && fields.iter().all(|f| {
            pattern(&CRON_FIELD, CRON_FIELD_PATTERN).is_some_and(|re| re.is_match(f))
        })
}

pub fn is_valid_expiry(expiry: &str) -> bool {
    pattern(&EXPIRY, EXPIRY_PATTERN).is_some_and(|re| re.is_match(expiry))
}

impl Validator<'_> {
    pub(super) fn check_machine_fields(&mut self) {
        for (name, domain) in &self.spec.domains {
            if let Some(id) = domain.subnet_id {
                if id > u64::from(MAX_SEQUENCE) {
                    self.diags.error(
                        Category::Address,
                        Location::domain(name).in_field("subnet_id"),
                        format!("subnet_id {} is out of range 0-{}", id, MAX_SEQUENCE),
                    );
                }
            }
        }

        for m in self.spec.machines() {
            let loc = Location::machine(m.domain_name, m.name);
            let machine = m.machine;

            if machine.weight < 1 {
                self.diags.error(
                    Category::Schema,
                    loc.clone().in_field("weight"),
                    "weight must be at least 1",
                );
            }
            if let Some(priority) = machine.boot_priority {
                if priority > MAX_BOOT_PRIORITY {
                    self.diags.error(
                        Category::Schema,
                        loc.clone().in_field("boot_priority"),
                        format!(
                            "boot_priority {} is out of range 0-{}",
                            priority, MAX_BOOT_PRIORITY
                        ),
                    );
                }
            }
            if let Some(schedule) = &machine.snapshots_schedule {
                if !is_valid_schedule(schedule) {
                    self.diags.error(
                        Category::Schedule,
                        loc.clone().in_field("snapshots_schedule"),
                        format!("'{}' is not a five-field cron expression", schedule),
                    );
                }
            }
            if let Some(expiry) = &machine.snapshots_expiry {
                if !is_valid_expiry(expiry) {
                    self.diags.error(
                        Category::Schedule,
                        loc.clone().in_field("snapshots_expiry"),
                        format!(
                            "'{}' must be a number followed by one of m, h, d, w, y",
                            expiry
                        ),
                    );
                }
            }

            for (volume_name, volume) in &machine.storage_volumes {
                let vloc = loc.clone().in_field("storage_volumes").in_field(volume_name);
                if !volume.path.starts_with('/') {
                    self.diags.error(
                        Category::Storage,
                        vloc.clone().in_field("path"),
                        format!("mount path '{}' must be absolute", volume.path),
                    );
                }
                if let Some(size) = &volume.size {
                    if parse_size(size).is_none() {
                        self.diags.error(
                            Category::Storage,
                            vloc.in_field("size"),
                            format!("'{}' is not a size such as 10GiB", size),
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
    fn test_schedules() {
        assert!(is_valid_schedule("0 3 * * *"));
        assert!(is_valid_schedule("*/15 * * * mon-fri"));
        assert!(is_valid_schedule("0 0,12 1 */2 *"));
        assert!(is_valid_schedule("@daily"));
        assert!(!is_valid_schedule("0 3 * *"));
        assert!(!is_valid_schedule("every day"));
        assert!(!is_valid_schedule("0 3 * * * *"));
    }

    #[test]
    fn test_expiry() {
        assert!(is_valid_expiry("30d"));
        assert!(is_valid_expiry("2w"));
        assert!(!is_valid_expiry("30"));
        assert!(!is_valid_expiry("d30"));
        assert!(!is_valid_expiry("30 days"));
    }

    #[test]
    fn test_field_ranges() {
        let diags = check(
            r#"
project_name: demo
domains:
  pro:
    subnet_id: 300
    machines:
      pro-dev:
        weight: 0
        boot_priority: 101
        snapshots_schedule: "daily"
        snapshots_expiry: "1 month"
        storage_volumes:
          data:
            path: srv/data
            size: lots
"#,
        );
        assert_eq!(
            error_locations(&diags, Category::Schema),
            vec![
                "domains.pro.machines.pro-dev.weight",
                "domains.pro.machines.pro-dev.boot_priority",
            ]
        );
        assert_eq!(
            error_locations(&diags, Category::Schedule).len(),
            2
        );
        assert_eq!(
            error_locations(&diags, Category::Storage),
            vec![
                "domains.pro.machines.pro-dev.storage_volumes.data.path",
                "domains.pro.machines.pro-dev.storage_volumes.data.size",
            ]
        );
        assert_eq!(
            error_locations(&diags, Category::Address),
            vec!["domains.pro.subnet_id"]
        );
    }
}
