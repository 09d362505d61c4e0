//! Global policy checks: GPU sharing, resource budget, AI access,
//! firewall placement and privileged containers.

use super::Validator;
use crate::diagnostics::{Category, Location};
use crate::model::{AiAccessPolicy, FirewallMode, GpuPolicy, MachineKind, AI_TOOLS_DOMAIN};
use crate::resources::{self, cpu_override, memory_override, ResourceIssue};

impl Validator<'_> {
    /// Only enabled domains are counted; a disabled domain starts nothing.
    pub(super) fn check_gpu_policy(&mut self) {
        let holders: Vec<String> = self
            .spec
            .active_machines()
            .filter(|m| m.exposes_gpu())
            .map(|m| m.name.to_string())
            .collect();
        if holders.len() < 2 {
            return;
        }
        let loc = Location::global("gpu_policy");
        match self.spec.global.gpu_policy {
            GpuPolicy::Exclusive => self.diags.error(
                Category::Gpu,
                loc,
                format!(
                    "{} instances expose a GPU under the exclusive policy: {}",
                    holders.len(),
                    holders.join(", ")
                ),
            ),
            GpuPolicy::Shared => self.diags.warning(
                Category::Gpu,
                loc,
                format!(
                    "GPU shared by {} instances, no VRAM isolation between them: {}",
                    holders.len(),
                    holders.join(", ")
                ),
            ),
        }
    }

    /// Explicit limits must parse whether or not a host is known.
    pub(super) fn check_explicit_limits(&mut self) {
        let host = self.ctx.host.unwrap_or_default();
        let cpu_capacity = host.cpu_cores.saturating_mul(1000);
        for m in self.spec.machines() {
            let config = &m.machine.config;
            let failures = [
                cpu_override(config, cpu_capacity).err(),
                memory_override(config, host.memory_bytes).err(),
            ];
            for err in failures.into_iter().flatten() {
                self.diags.error(
                    Category::Resource,
                    Location::machine(m.domain_name, m.name)
                        .in_field("config")
                        .in_field(err.key),
                    err.to_string(),
                );
            }
        }
    }

    /// Needs a known host; the pipeline warns when it has none.
    pub(super) fn check_resources(&mut self) {
        let (Some(policy), Some(host)) = (&self.spec.global.resource_policy, self.ctx.host) else {
            return;
        };
        let plan = resources::plan(self.spec, policy, host);
        let loc = Location::global("resource_policy");
        for issue in &plan.issues {
            match issue {
                ResourceIssue::Overcommit { .. } if policy.overcommit => {
                    self.diags
                        .warning(Category::Resource, loc.clone(), issue.to_string())
                }
                _ => self
                    .diags
                    .error(Category::Resource, loc.clone(), issue.to_string()),
            }
        }
    }

    pub(super) fn check_ai_access(&mut self) {
        let global = &self.spec.global;
        if global.ai_access_policy != AiAccessPolicy::Exclusive {
            return;
        }

        match global.ai_access_default.as_deref() {
            None => self.diags.error(
                Category::AiAccess,
                Location::global("ai_access_default"),
                "exclusive AI access requires ai_access_default",
            ),
            Some(AI_TOOLS_DOMAIN) => self.diags.error(
                Category::AiAccess,
                Location::global("ai_access_default"),
                format!("ai_access_default cannot be '{}' itself", AI_TOOLS_DOMAIN),
            ),
            Some(name) if !self.spec.domains.contains_key(name) => self.diags.error(
                Category::AiAccess,
                Location::global("ai_access_default"),
                format!("ai_access_default '{}' is not a declared domain", name),
            ),
            Some(_) => {}
        }

        if !self.spec.domains.contains_key(AI_TOOLS_DOMAIN) {
            self.diags.error(
                Category::AiAccess,
                Location::global("ai_access_policy"),
                format!(
                    "exclusive AI access requires a domain named '{}'",
                    AI_TOOLS_DOMAIN
                ),
            );
        }

        let targeting: Vec<usize> = self
            .spec
            .network_policies
            .iter()
            .enumerate()
            .filter(|(_, p)| p.to == AI_TOOLS_DOMAIN)
            .map(|(i, _)| i)
            .collect();
        if let [_, rest @ ..] = targeting.as_slice() {
            for index in rest {
                self.diags.error(
                    Category::AiAccess,
                    Location::policy(*index).in_field("to"),
                    format!(
                        "only one network policy may target '{}' under exclusive access",
                        AI_TOOLS_DOMAIN
                    ),
                );
            }
        }
    }

    pub(super) fn check_firewall(&mut self) {
        let global = &self.spec.global;
        if global.firewall_mode != FirewallMode::Vm {
            return;
        }
        if let Some(admin) = self.spec.domains.get(&global.admin_domain) {
            if !admin.enabled {
                self.diags.error(
                    Category::Firewall,
                    Location::domain(&global.admin_domain).in_field("enabled"),
                    "firewall_mode 'vm' needs the admin domain enabled to host the firewall",
                );
            }
        }
    }

    /// Privileged containers share the host kernel with root inside; they
    /// are only acceptable behind a virtual machine boundary.
    pub(super) fn check_isolation(&mut self) {
        for m in self.spec.active_machines() {
            if m.machine.kind != MachineKind::Container || !m.machine.is_privileged() {
                continue;
            }
            if self.ctx.vm_boundary {
                continue;
            }
            let loc = Location::machine(m.domain_name, m.name)
                .in_field("config")
                .in_field("security.privileged");
            if self.ctx.policy_override {
                self.diags.warning(
                    Category::Isolation,
                    loc,
                    "privileged container without a VM boundary, accepted by policy override",
                );
            } else {
                self.diags.error(
                    Category::Isolation,
                    loc,
                    "privileged container requires a VM boundary (nest inside a VM or set the policy override)",
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::{check, check_with, error_locations};
    use super::*;
    use crate::context::{CompileContext, HostCapacity};
    use crate::units::GIB;
    use pretty_assertions::assert_eq;

    const TWO_GPUS: &str = r#"
project_name: demo
global:
  gpu_policy: POLICY
domains:
  ai-tools:
    profiles:
      nvidia:
        devices:
          gpu0: { type: gpu }
    machines:
      ai-llm:
        profiles: [nvidia]
  pro:
    machines:
      pro-cad: { gpu: true }
  off:
    enabled: false
    machines:
      off-gpu: { gpu: true }
"#;

    #[test]
    fn test_exclusive_gpu_names_every_holder() {
        let diags = check(&TWO_GPUS.replace("POLICY", "exclusive"));
        let errors: Vec<_> = diags.by_category(Category::Gpu).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("ai-llm"));
        assert!(errors[0].message.contains("pro-cad"));
        assert!(!errors[0].message.contains("off-gpu"));
    }

    #[test]
    fn test_shared_gpu_is_one_warning() {
        let diags = check(&TWO_GPUS.replace("POLICY", "shared"));
        assert!(!diags.has_errors(), "{}", diags);
        assert_eq!(diags.warning_count(), 1);
        assert_eq!(diags.by_category(Category::Gpu).count(), 1);
    }

    const BUDGET: &str = r#"
project_name: demo
global:
  resource_policy:
    host_reserve: { cpu: "25%", memory: "25%" }
    cpu_mode: count
    overcommit: OVERCOMMIT
domains:
  pro:
    machines:
      pro-big:
        config:
          limits.cpu: "8"
      pro-small: {}
"#;

    fn small_host() -> CompileContext {
        CompileContext {
            host: Some(HostCapacity {
                cpu_cores: 8,
                memory_bytes: 16 * GIB,
            }),
            ..CompileContext::default()
        }
    }

    #[test]
    fn test_overcommit_is_an_error_by_default() {
        let diags = check_with(&BUDGET.replace("OVERCOMMIT", "false"), &small_host());
        assert_eq!(
            error_locations(&diags, Category::Resource),
            vec!["global.resource_policy"]
        );
    }

    #[test]
    fn test_overcommit_opt_in_is_a_warning() {
        let diags = check_with(&BUDGET.replace("OVERCOMMIT", "true"), &small_host());
        assert!(!diags.has_errors(), "{}", diags);
        assert_eq!(diags.by_category(Category::Resource).count(), 1);
    }

    #[test]
    fn test_unusable_limits_are_located_errors() {
        let yaml = r#"
project_name: demo
global:
  resource_policy:
    overcommit: true
domains:
  pro:
    machines:
      pro-a:
        config:
          limits.cpu: "0-18446744073709551615"
      pro-b:
        config:
          limits.memory: 10000000TB
      pro-c:
        config:
          limits.memory: 10000000TB
      pro-d:
        config:
          limits.memory: 99999999999TiB
"#;
        let diags = check_with(yaml, &small_host());
        assert_eq!(
            error_locations(&diags, Category::Resource),
            vec![
                "domains.pro.machines.pro-a.config.limits.cpu",
                "domains.pro.machines.pro-d.config.limits.memory",
            ]
        );
        // The two large but representable limits are an overcommit
        assert_eq!(diags.warnings().filter(|d| d.category == Category::Resource).count(), 1);

        let without_host = check(yaml);
        assert_eq!(error_locations(&without_host, Category::Resource).len(), 2);
    }

    #[test]
    fn test_unknown_host_skips_budget_check() {
        let diags = check(&BUDGET.replace("OVERCOMMIT", "false"));
        assert_eq!(diags.by_category(Category::Resource).count(), 0);
    }

    #[test]
    fn test_ai_exclusive_requirements() {
        let diags = check(
            r#"
project_name: demo
global:
  ai_access_policy: exclusive
  ai_access_default: ai-tools
domains:
  pro: {}
network_policies:
  - { from: pro, to: ai-tools }
  - { from: pro, to: ai-tools, ports: [443] }
"#,
        );
        assert_eq!(
            error_locations(&diags, Category::AiAccess),
            vec![
                "global.ai_access_default",
                "global.ai_access_policy",
                "network_policies[1].to",
            ]
        );
    }

    #[test]
    fn test_ai_default_must_exist() {
        let diags = check(
            r#"
project_name: demo
global:
  ai_access_policy: exclusive
  ai_access_default: perso
domains:
  ai-tools: {}
"#,
        );
        let errors: Vec<_> = diags.by_category(Category::AiAccess).collect();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("'perso'"));
    }

    const PRIVILEGED: &str = r#"
project_name: demo
domains:
  lab:
    machines:
      lab-docker:
        config:
          security.privileged: "true"
      lab-vm:
        type: vm
        config:
          security.privileged: "true"
"#;

    #[test]
    fn test_privileged_container_needs_boundary() {
        let diags = check(PRIVILEGED);
        assert_eq!(
            error_locations(&diags, Category::Isolation),
            vec!["domains.lab.machines.lab-docker.config.security.privileged"]
        );

        let boundary = CompileContext {
            vm_boundary: true,
            ..CompileContext::default()
        };
        assert!(check_with(PRIVILEGED, &boundary).is_empty());

        let relaxed = CompileContext {
            policy_override: true,
            ..CompileContext::default()
        };
        let diags = check_with(PRIVILEGED, &relaxed);
        assert!(!diags.has_errors());
        assert_eq!(diags.by_category(Category::Isolation).count(), 1);
    }

    #[test]
    fn test_firewall_vm_needs_enabled_admin() {
        let diags = check(
            r#"
project_name: demo
global:
  firewall_mode: vm
domains:
  admin:
    enabled: false
    trust_level: admin
"#,
        );
        assert_eq!(
            error_locations(&diags, Category::Firewall),
            vec!["domains.admin.enabled"]
        );
    }
}
