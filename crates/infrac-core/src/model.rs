//! Typed descriptor model
//!
//! The [`InfraSpec`] tree is produced by the decoder and owned exclusively by
//! the pipeline. Cross-entity relations are plain names resolved during
//! validation; nothing here holds a back-reference.

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use indexmap::IndexMap;

/// Domain guarded by the exclusive AI-access policy
pub const AI_TOOLS_DOMAIN: &str = "ai-tools";

/// Policy endpoint standing for the hypervisor host itself
pub const HOST_ENDPOINT: &str = "host";

/// Profile every instance can reference without declaring it
pub const DEFAULT_PROFILE: &str = "default";

pub const FIREWALL_MACHINE: &str = "sys-firewall";
pub const LEGACY_FIREWALL_MACHINE: &str = "firewall";

pub const DEFAULT_ADMIN_DOMAIN: &str = "admin";
pub const DEFAULT_SHARED_VOLUMES_BASE: &str = "/srv/infrac/shares";
pub const DEFAULT_CONNECTION: &str = "community.general.incus";
pub const DEFAULT_USER: &str = "root";

#[derive(Debug, Clone, PartialEq)]
pub struct InfraSpec {
    pub project_name: String,
    pub global: GlobalSettings,
    pub domains: BTreeMap<String, Domain>,
    pub network_policies: Vec<NetworkPolicy>,
    pub shared_volumes: BTreeMap<String, SharedVolume>,
}

impl InfraSpec {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            global: GlobalSettings::default(),
            domains: BTreeMap::new(),
            network_policies: Vec::new(),
            shared_volumes: BTreeMap::new(),
        }
    }

    /// Every declared machine: domains by name, machines in declaration order
    pub fn machines(&self) -> impl Iterator<Item = MachineRef<'_>> {
        self.domains.iter().flat_map(|(domain_name, domain)| {
            domain.machines.iter().map(move |(name, machine)| MachineRef {
                domain_name,
                domain,
                name,
                machine,
            })
        })
    }

    /// Machines of enabled domains only
    pub fn active_machines(&self) -> impl Iterator<Item = MachineRef<'_>> {
        self.machines().filter(|m| m.domain.enabled)
    }

    pub fn enabled_domains(&self) -> impl Iterator<Item = (&String, &Domain)> {
        self.domains.iter().filter(|(_, d)| d.enabled)
    }

    pub fn find_machine(&self, name: &str) -> Option<MachineRef<'_>> {
        self.machines().find(|m| m.name == name)
    }

    pub fn has_machine(&self, name: &str) -> bool {
        self.find_machine(name).is_some()
    }

    /// Shared volumes mounted by each machine of an enabled domain.
    ///
    /// A consumer entry naming the machine overrides the one naming its
    /// domain. Volumes are listed in name order.
    pub fn shared_mounts(&self) -> BTreeMap<&str, Vec<SharedMount<'_>>> {
        let mut mounts: BTreeMap<&str, Vec<SharedMount<'_>>> = BTreeMap::new();
        for (volume_name, volume) in &self.shared_volumes {
            for m in self.active_machines() {
                let access = volume
                    .consumers
                    .get(m.name)
                    .or_else(|| volume.consumers.get(m.domain_name));
                if let Some(access) = access {
                    mounts.entry(m.name).or_default().push(SharedMount {
                        name: volume_name,
                        volume,
                        access: *access,
                    });
                }
            }
        }
        mounts
    }
}

/// One shared volume as seen by one consuming machine
#[derive(Debug, Clone, Copy)]
pub struct SharedMount<'a> {
    pub name: &'a str,
    pub volume: &'a SharedVolume,
    pub access: Access,
}

/// Borrowed view of a machine together with its owning domain
#[derive(Debug, Clone, Copy)]
pub struct MachineRef<'a> {
    pub domain_name: &'a str,
    pub domain: &'a Domain,
    pub name: &'a str,
    pub machine: &'a Machine,
}

impl MachineRef<'_> {
    pub fn ephemeral(&self) -> bool {
        self.machine.ephemeral.unwrap_or(self.domain.ephemeral)
    }

    /// Profiles resolved against the owning domain, skipping `default`
    /// and dangling references
    pub fn resolved_profiles(&self) -> impl Iterator<Item = (&str, &Profile)> {
        self.machine
            .profiles
            .iter()
            .filter_map(|name| self.domain.profiles.get(name).map(|p| (name.as_str(), p)))
    }

    pub fn exposes_gpu(&self) -> bool {
        self.machine.gpu || self.resolved_profiles().any(|(_, p)| p.exposes_gpu())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlobalSettings {
    pub addressing: AddressingConfig,
    pub resource_policy: Option<ResourcePolicy>,
    pub gpu_policy: GpuPolicy,
    pub ai_access_policy: AiAccessPolicy,
    pub ai_access_default: Option<String>,
    pub ai_vram_flush: bool,
    pub nesting_prefix: bool,
    pub shared_volumes_base: String,
    pub firewall_mode: FirewallMode,
    pub admin_domain: String,
    pub default_os_image: Option<String>,
    pub default_connection: String,
    pub default_user: String,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            addressing: AddressingConfig::default(),
            resource_policy: None,
            gpu_policy: GpuPolicy::default(),
            ai_access_policy: AiAccessPolicy::default(),
            ai_access_default: None,
            ai_vram_flush: true,
            nesting_prefix: true,
            shared_volumes_base: DEFAULT_SHARED_VOLUMES_BASE.to_string(),
            firewall_mode: FirewallMode::default(),
            admin_domain: DEFAULT_ADMIN_DOMAIN.to_string(),
            default_os_image: None,
            default_connection: DEFAULT_CONNECTION.to_string(),
            default_user: DEFAULT_USER.to_string(),
        }
    }
}

/// Second and third octet derivation parameters.
///
/// Values are kept wide so out-of-range input survives decoding and is
/// reported by the validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressingConfig {
    pub base_octet: u64,
    pub zone_base: u64,
    pub zone_step: u64,
}

impl Default for AddressingConfig {
    fn default() -> Self {
        Self {
            base_octet: 10,
            zone_base: 100,
            zone_step: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub description: String,
    pub enabled: bool,
    pub subnet_id: Option<u64>,
    pub ephemeral: bool,
    pub trust_level: TrustLevel,
    pub profiles: BTreeMap<String, Profile>,
    pub machines: IndexMap<String, Machine>,
}

impl Default for Domain {
    fn default() -> Self {
        Self {
            description: String::new(),
            enabled: true,
            subnet_id: None,
            ephemeral: false,
            trust_level: TrustLevel::default(),
            profiles: BTreeMap::new(),
            machines: IndexMap::new(),
        }
    }
}

/// Trust classification, ordered from most to least trusted
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TrustLevel {
    Admin,
    Trusted,
    #[default]
    SemiTrusted,
    Untrusted,
    Disposable,
}

impl TrustLevel {
    pub const ALL: [TrustLevel; 5] = [
        TrustLevel::Admin,
        TrustLevel::Trusted,
        TrustLevel::SemiTrusted,
        TrustLevel::Untrusted,
        TrustLevel::Disposable,
    ];

    /// Zone multiplier applied to `zone_step`. Multiplier 3 is unassigned.
    pub fn offset(self) -> u64 {
        match self {
            TrustLevel::Admin => 0,
            TrustLevel::Trusted => 1,
            TrustLevel::SemiTrusted => 2,
            TrustLevel::Untrusted => 4,
            TrustLevel::Disposable => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TrustLevel::Admin => "admin",
            TrustLevel::Trusted => "trusted",
            TrustLevel::SemiTrusted => "semi-trusted",
            TrustLevel::Untrusted => "untrusted",
            TrustLevel::Disposable => "disposable",
        }
    }
}

impl FromStr for TrustLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TrustLevel::ALL
            .into_iter()
            .find(|level| level.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Instance flavour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MachineKind {
    #[default]
    Container,
    VirtualMachine,
}

impl MachineKind {
    /// Spelling used in the descriptor
    pub fn tag(self) -> &'static str {
        match self {
            MachineKind::Container => "lxc",
            MachineKind::VirtualMachine => "vm",
        }
    }

    /// Spelling used by Incus
    pub fn incus_type(self) -> &'static str {
        match self {
            MachineKind::Container => "container",
            MachineKind::VirtualMachine => "virtual-machine",
        }
    }

    /// Smallest memory limit the resource allocator will hand out
    pub fn min_memory_mib(self) -> u64 {
        match self {
            MachineKind::Container => 64,
            MachineKind::VirtualMachine => 512,
        }
    }
}

impl FromStr for MachineKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lxc" => Ok(MachineKind::Container),
            "vm" => Ok(MachineKind::VirtualMachine),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub description: String,
    pub kind: MachineKind,
    pub ip: Option<Ipv4Addr>,
    pub ephemeral: Option<bool>,
    pub gpu: bool,
    pub profiles: Vec<String>,
    pub weight: u64,
    pub boot_autostart: Option<bool>,
    pub boot_priority: Option<u64>,
    pub snapshots_schedule: Option<String>,
    pub snapshots_expiry: Option<String>,
    pub config: BTreeMap<String, String>,
    pub storage_volumes: BTreeMap<String, StorageVolume>,
    pub roles: Vec<String>,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            description: String::new(),
            kind: MachineKind::default(),
            ip: None,
            ephemeral: None,
            gpu: false,
            profiles: Vec::new(),
            weight: 1,
            boot_autostart: None,
            boot_priority: None,
            snapshots_schedule: None,
            snapshots_expiry: None,
            config: BTreeMap::new(),
            storage_volumes: BTreeMap::new(),
            roles: Vec::new(),
        }
    }
}

impl Machine {
    /// True when the raw config asks for a privileged container
    pub fn is_privileged(&self) -> bool {
        self.config
            .get("security.privileged")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageVolume {
    pub pool: String,
    pub size: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Profile {
    pub description: String,
    pub config: BTreeMap<String, String>,
    pub devices: BTreeMap<String, BTreeMap<String, String>>,
}

impl Profile {
    pub fn exposes_gpu(&self) -> bool {
        self.devices
            .values()
            .any(|device| device.get("type").is_some_and(|t| t == "gpu"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkPolicy {
    pub description: String,
    pub from: String,
    pub to: String,
    pub ports: Ports,
    pub protocol: Protocol,
    pub bidirectional: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Ports {
    #[default]
    All,
    List(Vec<u64>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedVolume {
    pub source: Option<String>,
    pub path: Option<String>,
    pub shift: bool,
    pub propagate: bool,
    pub consumers: BTreeMap<String, Access>,
}

impl Default for SharedVolume {
    fn default() -> Self {
        Self {
            source: None,
            path: None,
            shift: true,
            propagate: false,
            consumers: BTreeMap::new(),
        }
    }
}

impl SharedVolume {
    pub fn source_path(&self, base: &str, name: &str) -> String {
        self.source
            .clone()
            .unwrap_or_else(|| format!("{}/{}", base.trim_end_matches('/'), name))
    }

    pub fn mount_path(&self, name: &str) -> String {
        self.path
            .clone()
            .unwrap_or_else(|| format!("/shares/{}", name))
    }

    /// Device name injected into each consuming instance
    pub fn device_name(name: &str) -> String {
        format!("sv-{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    ReadWrite,
}

impl Access {
    pub fn is_read_only(self) -> bool {
        self == Access::ReadOnly
    }
}

impl FromStr for Access {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ro" => Ok(Access::ReadOnly),
            "rw" => Ok(Access::ReadWrite),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GpuPolicy {
    #[default]
    Exclusive,
    Shared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AiAccessPolicy {
    #[default]
    Open,
    Exclusive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FirewallMode {
    #[default]
    Host,
    Vm,
}

macro_rules! keyword_enum {
    ($ty:ty { $($variant:path => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($variant => $text),+
                }
            }
        }

        impl FromStr for $ty {
            type Err = ();

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($variant),)+
                    _ => Err(()),
                }
            }
        }
    };
}

keyword_enum!(GpuPolicy { GpuPolicy::Exclusive => "exclusive", GpuPolicy::Shared => "shared" });
keyword_enum!(AiAccessPolicy { AiAccessPolicy::Open => "open", AiAccessPolicy::Exclusive => "exclusive" });
keyword_enum!(FirewallMode { FirewallMode::Host => "host", FirewallMode::Vm => "vm" });
keyword_enum!(DistributionMode {
    DistributionMode::Proportional => "proportional",
    DistributionMode::Equal => "equal",
});
keyword_enum!(CpuMode { CpuMode::Allowance => "allowance", CpuMode::Count => "count" });
keyword_enum!(MemoryEnforce { MemoryEnforce::Soft => "soft", MemoryEnforce::Hard => "hard" });

#[derive(Debug, Clone, PartialEq)]
pub struct ResourcePolicy {
    pub host_reserve: HostReserve,
    pub mode: DistributionMode,
    pub cpu_mode: CpuMode,
    pub memory_enforce: MemoryEnforce,
    pub overcommit: bool,
}

impl Default for ResourcePolicy {
    fn default() -> Self {
        Self {
            host_reserve: HostReserve::default(),
            mode: DistributionMode::default(),
            cpu_mode: CpuMode::default(),
            memory_enforce: MemoryEnforce::default(),
            overcommit: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostReserve {
    pub cpu: Reserve,
    pub memory: Reserve,
}

impl Default for HostReserve {
    fn default() -> Self {
        Self {
            cpu: Reserve::Percent(20),
            memory: Reserve::Percent(20),
        }
    }
}

/// Part of the host withheld from distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reserve {
    Percent(u64),
    /// Cores for CPU, bytes for memory
    Absolute(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistributionMode {
    #[default]
    Proportional,
    Equal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuMode {
    #[default]
    Allowance,
    Count,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemoryEnforce {
    #[default]
    Soft,
    Hard,
}
