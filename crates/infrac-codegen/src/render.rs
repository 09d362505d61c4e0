//! Rendering of managed regions from a compiled model
//!
//! Each artifact is a plain serde view of the model serialized to YAML.
//! Views borrow from the compilation and never reorder declared machines.

use std::collections::BTreeMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use infrac_core::addressing::Subnet;
use infrac_core::model::{
    Access, MachineRef, Ports, Profile, SharedMount, SharedVolume, StorageVolume,
};
use infrac_core::{Compilation, Domain, InfraSpec};

use crate::error::WriteError;

pub const INVENTORY_DIR: &str = "inventory";
pub const GROUP_VARS_DIR: &str = "group_vars";
pub const HOST_VARS_DIR: &str = "host_vars";
pub const GLOBAL_STEM: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Inventory,
    GroupVars,
    HostVars,
    GlobalVars,
}

impl ArtifactKind {
    pub fn dir(self) -> &'static str {
        match self {
            ArtifactKind::Inventory => INVENTORY_DIR,
            ArtifactKind::GroupVars | ArtifactKind::GlobalVars => GROUP_VARS_DIR,
            ArtifactKind::HostVars => HOST_VARS_DIR,
        }
    }
}

/// One rendered file, relative to the output root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub stem: String,
    pub region: String,
}

impl Artifact {
    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.kind.dir()).join(format!("{}.yml", self.stem))
    }
}

/// Render every artifact of the enabled domains plus the global file.
pub fn render(compilation: &Compilation) -> Result<Vec<Artifact>, WriteError> {
    let renderer = Renderer::new(compilation);
    let spec = &compilation.spec;
    let mut artifacts = Vec::new();

    for (name, domain) in spec.enabled_domains() {
        let subnet = renderer.subnet(name)?;
        let inventory = renderer.inventory(name, domain);
        artifacts.push(renderer.emit(ArtifactKind::Inventory, name, &inventory)?);
        artifacts.push(renderer.emit(
            ArtifactKind::GroupVars,
            name,
            &renderer.domain_vars(name, domain, subnet),
        )?);
    }

    let mounts = spec.shared_mounts();
    for m in spec.active_machines() {
        let devices = mounts
            .get(m.name)
            .map(|list| renderer.devices(list))
            .unwrap_or_default();
        let vars = renderer.host_vars(&m, devices);
        artifacts.push(renderer.emit(ArtifactKind::HostVars, m.name, &vars)?);
    }

    let global = renderer.global_vars()?;
    artifacts.push(renderer.emit(ArtifactKind::GlobalVars, GLOBAL_STEM, &global)?);
    debug!("Rendered {} artifact(s)", artifacts.len());
    Ok(artifacts)
}

struct Renderer<'a> {
    compilation: &'a Compilation,
    spec: &'a InfraSpec,
    prefix: String,
}

impl<'a> Renderer<'a> {
    fn new(compilation: &'a Compilation) -> Self {
        let spec = &compilation.spec;
        Self {
            compilation,
            spec,
            prefix: compilation.context.name_prefix(spec.global.nesting_prefix),
        }
    }

    fn subnet(&self, domain: &str) -> Result<Subnet, WriteError> {
        self.compilation
            .subnets
            .get(domain)
            .copied()
            .ok_or_else(|| WriteError::MissingSubnet {
                domain: domain.to_string(),
            })
    }

    fn prefixed(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    fn bridge(&self, domain: &str) -> String {
        self.prefixed(&format!("net-{}", domain))
    }

    fn emit(
        &self,
        kind: ArtifactKind,
        stem: &str,
        view: &impl Serialize,
    ) -> Result<Artifact, WriteError> {
        let region = serde_yaml::to_string(view).map_err(|source| WriteError::Render {
            artifact: format!("{}/{}.yml", kind.dir(), stem),
            source,
        })?;
        Ok(Artifact {
            kind,
            stem: stem.to_string(),
            region,
        })
    }

    fn inventory(&self, name: &'a str, domain: &'a Domain) -> Inventory<'a> {
        let hosts = domain
            .machines
            .iter()
            .map(|(machine_name, machine)| {
                let host = InventoryHost {
                    ansible_host: machine.ip.map(|ip| ip.to_string()),
                };
                (machine_name.as_str(), host)
            })
            .collect();
        let mut children = BTreeMap::new();
        children.insert(name, InventoryGroup { hosts });
        Inventory {
            all: InventoryAll { children },
        }
    }

    fn domain_vars(&self, name: &'a str, domain: &'a Domain, subnet: Subnet) -> DomainVars<'a> {
        DomainVars {
            domain_name: name,
            domain_description: &domain.description,
            domain_ephemeral: domain.ephemeral,
            domain_trust_level: domain.trust_level.as_str(),
            incus_project: self.prefixed(name),
            incus_network: NetworkVars {
                name: self.bridge(name),
                subnet: subnet.cidr(),
                gateway: subnet.gateway().to_string(),
            },
            domain_profiles: domain
                .profiles
                .iter()
                .map(|(profile_name, profile)| (profile_name.as_str(), ProfileVars::from(profile)))
                .collect(),
            subnet_id: subnet.sequence,
        }
    }

    fn devices(&self, mounts: &[SharedMount<'_>]) -> BTreeMap<String, DiskDevice> {
        let base = &self.spec.global.shared_volumes_base;
        mounts
            .iter()
            .map(|mount| {
                let volume = mount.volume;
                let device = DiskDevice {
                    kind: "disk",
                    source: volume.source_path(base, mount.name),
                    path: volume.mount_path(mount.name),
                    readonly: mount.access == Access::ReadOnly,
                    shift: volume.shift,
                    propagation: volume.propagate.then_some("rshared"),
                };
                (SharedVolume::device_name(mount.name), device)
            })
            .collect()
    }

    fn host_vars(
        &self,
        m: &MachineRef<'a>,
        instance_devices: BTreeMap<String, DiskDevice>,
    ) -> HostVars<'a> {
        let machine = m.machine;
        HostVars {
            instance_name: self.prefixed(m.name),
            instance_type: machine.kind.incus_type(),
            instance_description: &machine.description,
            instance_domain: m.domain_name,
            instance_ephemeral: m.ephemeral(),
            instance_ip: machine.ip.map(|ip| ip.to_string()),
            instance_gpu: m.exposes_gpu(),
            instance_profiles: &machine.profiles,
            instance_config: &machine.config,
            instance_devices,
            instance_storage_volumes: machine
                .storage_volumes
                .iter()
                .map(|(name, volume)| (name.as_str(), StorageVars::from(volume)))
                .collect(),
            instance_boot_autostart: machine.boot_autostart,
            instance_boot_priority: machine.boot_priority,
            instance_snapshots_schedule: machine.snapshots_schedule.as_deref(),
            instance_snapshots_expiry: machine.snapshots_expiry.as_deref(),
            instance_roles: &machine.roles,
        }
    }

    fn global_vars(&self) -> Result<GlobalVars<'a>, WriteError> {
        let global = &self.spec.global;
        let mut infra_domains = Vec::new();
        for (name, domain) in self.spec.enabled_domains() {
            let subnet = self.subnet(name)?;
            infra_domains.push(DomainSummary {
                name,
                bridge: self.bridge(name),
                subnet: subnet.cidr(),
                gateway: subnet.gateway().to_string(),
                trust_level: domain.trust_level.as_str(),
            });
        }

        Ok(GlobalVars {
            project_name: &self.spec.project_name,
            ansible_connection: &global.default_connection,
            ansible_user: &global.default_user,
            default_os_image: global.default_os_image.as_deref(),
            nesting_depth: self.compilation.context.depth,
            infra_domains,
            network_policies: self
                .spec
                .network_policies
                .iter()
                .map(|policy| PolicyVars {
                    description: &policy.description,
                    from: &policy.from,
                    to: &policy.to,
                    ports: match &policy.ports {
                        Ports::All => PortsVars::All("all"),
                        Ports::List(ports) => PortsVars::List(ports),
                    },
                    protocol: policy.protocol.as_str(),
                    bidirectional: policy.bidirectional,
                })
                .collect(),
            gpu_policy: global.gpu_policy.as_str(),
            ai_access_policy: global.ai_access_policy.as_str(),
            ai_access_default: global.ai_access_default.as_deref(),
            ai_vram_flush: global.ai_vram_flush,
            firewall_mode: global.firewall_mode.as_str(),
        })
    }
}

#[derive(Serialize)]
struct Inventory<'a> {
    all: InventoryAll<'a>,
}

#[derive(Serialize)]
struct InventoryAll<'a> {
    children: BTreeMap<&'a str, InventoryGroup<'a>>,
}

#[derive(Serialize)]
struct InventoryGroup<'a> {
    hosts: IndexMap<&'a str, InventoryHost>,
}

#[derive(Serialize)]
struct InventoryHost {
    #[serde(skip_serializing_if = "Option::is_none")]
    ansible_host: Option<String>,
}

#[derive(Serialize)]
struct DomainVars<'a> {
    domain_name: &'a str,
    domain_description: &'a str,
    domain_ephemeral: bool,
    domain_trust_level: &'static str,
    incus_project: String,
    incus_network: NetworkVars,
    domain_profiles: BTreeMap<&'a str, ProfileVars<'a>>,
    subnet_id: u8,
}

#[derive(Serialize)]
struct NetworkVars {
    name: String,
    subnet: String,
    gateway: String,
}

#[derive(Serialize)]
struct ProfileVars<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    description: &'a str,
    config: &'a BTreeMap<String, String>,
    devices: &'a BTreeMap<String, BTreeMap<String, String>>,
}

impl<'a> From<&'a Profile> for ProfileVars<'a> {
    fn from(profile: &'a Profile) -> Self {
        Self {
            description: &profile.description,
            config: &profile.config,
            devices: &profile.devices,
        }
    }
}

#[derive(Serialize)]
struct HostVars<'a> {
    instance_name: String,
    instance_type: &'static str,
    instance_description: &'a str,
    instance_domain: &'a str,
    instance_ephemeral: bool,
    instance_ip: Option<String>,
    instance_gpu: bool,
    instance_profiles: &'a [String],
    instance_config: &'a BTreeMap<String, String>,
    instance_devices: BTreeMap<String, DiskDevice>,
    instance_storage_volumes: BTreeMap<&'a str, StorageVars<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_boot_autostart: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_boot_priority: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_snapshots_schedule: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instance_snapshots_expiry: Option<&'a str>,
    instance_roles: &'a [String],
}

#[derive(Serialize)]
struct DiskDevice {
    #[serde(rename = "type")]
    kind: &'static str,
    source: String,
    path: String,
    readonly: bool,
    shift: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    propagation: Option<&'static str>,
}

#[derive(Serialize)]
struct StorageVars<'a> {
    pool: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<&'a str>,
    path: &'a str,
}

impl<'a> From<&'a StorageVolume> for StorageVars<'a> {
    fn from(volume: &'a StorageVolume) -> Self {
        Self {
            pool: &volume.pool,
            size: volume.size.as_deref(),
            path: &volume.path,
        }
    }
}

#[derive(Serialize)]
struct GlobalVars<'a> {
    project_name: &'a str,
    ansible_connection: &'a str,
    ansible_user: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    default_os_image: Option<&'a str>,
    nesting_depth: u32,
    infra_domains: Vec<DomainSummary<'a>>,
    network_policies: Vec<PolicyVars<'a>>,
    gpu_policy: &'static str,
    ai_access_policy: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ai_access_default: Option<&'a str>,
    ai_vram_flush: bool,
    firewall_mode: &'static str,
}

#[derive(Serialize)]
struct DomainSummary<'a> {
    name: &'a str,
    bridge: String,
    subnet: String,
    gateway: String,
    trust_level: &'static str,
}

#[derive(Serialize)]
struct PolicyVars<'a> {
    #[serde(skip_serializing_if = "str::is_empty")]
    description: &'a str,
    from: &'a str,
    to: &'a str,
    ports: PortsVars<'a>,
    protocol: &'static str,
    bidirectional: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
enum PortsVars<'a> {
    All(&'static str),
    List(&'a [u64]),
}

#[cfg(test)]
mod tests {
    use super::*;
    use infrac_core::{CompileContext, NoProbe, Pipeline};
    use infrac_test_fixtures::fleet_yaml;
    use pretty_assertions::assert_eq;

    fn compile(context: CompileContext) -> Compilation {
        Pipeline::new(context)
            .with_probe(NoProbe)
            .compile_str(&fleet_yaml(), "infra.yml")
            .expect("fleet fixture compiles")
    }

    fn find<'a>(artifacts: &'a [Artifact], kind: ArtifactKind, stem: &str) -> &'a Artifact {
        artifacts
            .iter()
            .find(|a| a.kind == kind && a.stem == stem)
            .expect("artifact rendered")
    }

    fn yaml(artifact: &Artifact) -> serde_yaml::Value {
        serde_yaml::from_str(&artifact.region).expect("region is YAML")
    }

    #[test]
    fn test_disabled_domains_render_nothing() {
        let artifacts = render(&compile(CompileContext::default())).expect("renders");
        assert!(artifacts.iter().all(|a| a.stem != "old" && a.stem != "old-box"));

        // 5 enabled domains, 6 active machines, one global file
        assert_eq!(artifacts.len(), 5 * 2 + 6 + 1);
    }

    #[test]
    fn test_inventory_and_group_vars() {
        let artifacts = render(&compile(CompileContext::default())).expect("renders");

        let inventory = yaml(find(&artifacts, ArtifactKind::Inventory, "pro"));
        let hosts = &inventory["all"]["children"]["pro"]["hosts"];
        assert_eq!(hosts["pro-db"]["ansible_host"].as_str(), Some("10.110.0.20"));
        let order: Vec<_> = hosts
            .as_mapping()
            .expect("hosts mapping")
            .keys()
            .filter_map(|k| k.as_str())
            .collect();
        assert_eq!(order, vec!["pro-dev", "pro-db"]);

        let vars = yaml(find(&artifacts, ArtifactKind::GroupVars, "perso"));
        assert_eq!(vars["incus_project"].as_str(), Some("perso"));
        assert_eq!(vars["incus_network"]["name"].as_str(), Some("net-perso"));
        assert_eq!(vars["incus_network"]["subnet"].as_str(), Some("10.120.1.0/24"));
        assert_eq!(vars["incus_network"]["gateway"].as_str(), Some("10.120.1.254"));
        assert_eq!(vars["subnet_id"].as_u64(), Some(1));
    }

    #[test]
    fn test_host_vars_carry_shared_volumes() {
        let artifacts = render(&compile(CompileContext::default())).expect("renders");

        let desk = yaml(find(&artifacts, ArtifactKind::HostVars, "perso-desk"));
        let docs = &desk["instance_devices"]["sv-docs"];
        assert_eq!(docs["source"].as_str(), Some("/srv/homelab/shares/docs"));
        assert_eq!(docs["path"].as_str(), Some("/shares/docs"));
        assert_eq!(docs["readonly"].as_bool(), Some(true));
        assert_eq!(desk["instance_boot_priority"].as_u64(), Some(50));

        let db = yaml(find(&artifacts, ArtifactKind::HostVars, "pro-db"));
        assert_eq!(db["instance_type"].as_str(), Some("virtual-machine"));
        assert_eq!(db["instance_devices"]["sv-docs"]["readonly"].as_bool(), Some(false));
        assert_eq!(
            db["instance_storage_volumes"]["pgdata"]["path"].as_str(),
            Some("/var/lib/postgresql")
        );

        let llm = yaml(find(&artifacts, ArtifactKind::HostVars, "ai-llm"));
        assert_eq!(llm["instance_gpu"].as_bool(), Some(true));
        assert!(llm["instance_devices"].as_mapping().is_some_and(|m| m.is_empty()));
    }

    #[test]
    fn test_nesting_prefix_applies_to_incus_names() {
        let context = CompileContext {
            depth: 2,
            ..CompileContext::default()
        };
        let artifacts = render(&compile(context)).expect("renders");

        let vars = yaml(find(&artifacts, ArtifactKind::GroupVars, "pro"));
        assert_eq!(vars["incus_project"].as_str(), Some("002-pro"));
        assert_eq!(vars["incus_network"]["name"].as_str(), Some("002-net-pro"));
        assert_eq!(vars["domain_name"].as_str(), Some("pro"));

        let host = yaml(find(&artifacts, ArtifactKind::HostVars, "pro-dev"));
        assert_eq!(host["instance_name"].as_str(), Some("002-pro-dev"));
    }

    #[test]
    fn test_global_vars_list_domains_and_policies() {
        let artifacts = render(&compile(CompileContext::default())).expect("renders");
        let global = find(&artifacts, ArtifactKind::GlobalVars, GLOBAL_STEM);
        assert_eq!(global.relative_path(), PathBuf::from("group_vars/all.yml"));

        let vars = yaml(global);
        let names: Vec<_> = vars["infra_domains"]
            .as_sequence()
            .expect("domain list")
            .iter()
            .filter_map(|d| d["name"].as_str())
            .collect();
        assert_eq!(names, vec!["admin", "ai-tools", "lab", "perso", "pro"]);

        let policies = vars["network_policies"].as_sequence().expect("policy list");
        assert_eq!(policies.len(), 3);
        assert_eq!(policies[0]["ports"][0].as_u64(), Some(22));
        assert_eq!(policies[2]["ports"].as_str(), Some("all"));
        assert_eq!(vars["ansible_connection"].as_str(), Some("community.general.incus"));
    }
}
