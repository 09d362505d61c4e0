//! Schema decoding
//!
//! Maps the merged YAML tree onto [`InfraSpec`]. Decoding never stops at the
//! first problem: a field with the wrong type or an unknown keyword is
//! reported as a [`Category::Schema`] error and replaced by its default, so
//! the validator still sees the rest of the descriptor.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};
use tracing::debug;

use crate::diagnostics::{Category, Diagnostics, Location};
use crate::loader::{key_name, Document};
use crate::model::{
    Access, AddressingConfig, AiAccessPolicy, CpuMode, DistributionMode, Domain, FirewallMode,
    GlobalSettings, GpuPolicy, HostReserve, InfraSpec, Machine, MachineKind, MemoryEnforce,
    NetworkPolicy, Ports, Profile, Protocol, Reserve, ResourcePolicy, SharedVolume, StorageVolume,
    TrustLevel,
};
use crate::units::{parse_percent, parse_size};

const ROOT_KEYS: &[&str] = &[
    "project_name",
    "global",
    "domains",
    "network_policies",
    "shared_volumes",
];
const GLOBAL_KEYS: &[&str] = &[
    "addressing",
    "resource_policy",
    "gpu_policy",
    "ai_access_policy",
    "ai_access_default",
    "ai_vram_flush",
    "nesting_prefix",
    "shared_volumes_base",
    "firewall_mode",
    "admin_domain",
    "default_os_image",
    "default_connection",
    "default_user",
];
const ADDRESSING_KEYS: &[&str] = &["base_octet", "zone_base", "zone_step"];
const RESOURCE_KEYS: &[&str] = &[
    "host_reserve",
    "mode",
    "cpu_mode",
    "memory_enforce",
    "overcommit",
];
const RESERVE_KEYS: &[&str] = &["cpu", "memory"];
const DOMAIN_KEYS: &[&str] = &[
    "description",
    "enabled",
    "subnet_id",
    "ephemeral",
    "trust_level",
    "profiles",
    "machines",
];
const PROFILE_KEYS: &[&str] = &["description", "config", "devices"];
const MACHINE_KEYS: &[&str] = &[
    "description",
    "type",
    "ip",
    "ephemeral",
    "gpu",
    "profiles",
    "weight",
    "boot_autostart",
    "boot_priority",
    "snapshots_schedule",
    "snapshots_expiry",
    "config",
    "storage_volumes",
    "roles",
];
const STORAGE_KEYS: &[&str] = &["pool", "size", "path"];
const POLICY_KEYS: &[&str] = &[
    "description",
    "from",
    "to",
    "ports",
    "protocol",
    "bidirectional",
];
const VOLUME_KEYS: &[&str] = &["source", "path", "shift", "propagate", "consumers"];

/// Decode a merged document into the typed model.
///
/// The returned diagnostics hold schema errors (fatal) and unknown-key
/// warnings.
pub fn decode(document: &Document) -> (InfraSpec, Diagnostics) {
    let mut decoder = Decoder::default();
    let spec = decoder.spec(&document.root);
    debug!(
        "Decoded {} domain(s) with {} diagnostic(s)",
        spec.domains.len(),
        decoder.diags.entries().len()
    );
    (spec, decoder.diags)
}

/// A mapping together with its location in the descriptor
struct Fields<'a> {
    map: &'a Mapping,
    loc: Location,
}

impl<'a> Fields<'a> {
    fn new(map: &'a Mapping, loc: Location) -> Self {
        Self { map, loc }
    }

    /// Field value, with an explicit `null` treated as absent
    fn get(&self, key: &str) -> Option<&'a Value> {
        self.map.get(key).filter(|v| !v.is_null())
    }

    fn at(&self, key: &str) -> Location {
        self.loc.clone().in_field(key)
    }
}

#[derive(Default)]
struct Decoder {
    diags: Diagnostics,
}

impl Decoder {
    fn spec(&mut self, root: &Mapping) -> InfraSpec {
        let fields = Fields::new(root, Location::root());
        self.unknown_keys(&fields, ROOT_KEYS);

        let project_name = self.string(&fields, "project_name").unwrap_or_default();
        let mut spec = InfraSpec::new(project_name);

        if let Some(global) = self.mapping(&fields, "global") {
            spec.global = self.global(&Fields::new(global, Location::root().in_field("global")));
        }

        for (name, body, loc) in self.entries(&fields, "domains") {
            let domain = self.domain(body, loc);
            spec.domains.insert(name, domain);
        }

        match fields.get("network_policies") {
            None => {}
            Some(Value::Sequence(rules)) => {
                for (index, rule) in rules.iter().enumerate() {
                    let loc = Location::policy(index);
                    match rule {
                        Value::Mapping(map) => {
                            let policy = self.policy(&Fields::new(map, loc));
                            spec.network_policies.push(policy);
                        }
                        other => self.type_error(loc, "a mapping", other),
                    }
                }
            }
            Some(other) => self.type_error(fields.at("network_policies"), "a list", other),
        }

        for (name, body, loc) in self.entries(&fields, "shared_volumes") {
            let volume = self.shared_volume(body, loc);
            spec.shared_volumes.insert(name, volume);
        }

        spec
    }

    fn global(&mut self, f: &Fields<'_>) -> GlobalSettings {
        self.unknown_keys(f, GLOBAL_KEYS);
        let defaults = GlobalSettings::default();

        let addressing = match self.mapping(f, "addressing") {
            Some(map) => {
                let af = Fields::new(map, f.at("addressing"));
                self.unknown_keys(&af, ADDRESSING_KEYS);
                let base = AddressingConfig::default();
                AddressingConfig {
                    base_octet: self.integer(&af, "base_octet").unwrap_or(base.base_octet),
                    zone_base: self.integer(&af, "zone_base").unwrap_or(base.zone_base),
                    zone_step: self.integer(&af, "zone_step").unwrap_or(base.zone_step),
                }
            }
            None => AddressingConfig::default(),
        };

        let resource_policy = self
            .mapping(f, "resource_policy")
            .map(|map| self.resource_policy(&Fields::new(map, f.at("resource_policy"))));

        GlobalSettings {
            addressing,
            resource_policy,
            gpu_policy: self
                .keyword::<GpuPolicy>(f, "gpu_policy", "exclusive or shared")
                .unwrap_or_default(),
            ai_access_policy: self
                .keyword::<AiAccessPolicy>(f, "ai_access_policy", "open or exclusive")
                .unwrap_or_default(),
            ai_access_default: self.string(f, "ai_access_default"),
            ai_vram_flush: self
                .boolean(f, "ai_vram_flush")
                .unwrap_or(defaults.ai_vram_flush),
            nesting_prefix: self
                .boolean(f, "nesting_prefix")
                .unwrap_or(defaults.nesting_prefix),
            shared_volumes_base: self
                .string(f, "shared_volumes_base")
                .unwrap_or(defaults.shared_volumes_base),
            firewall_mode: self
                .keyword::<FirewallMode>(f, "firewall_mode", "host or vm")
                .unwrap_or_default(),
            admin_domain: self
                .string(f, "admin_domain")
                .unwrap_or(defaults.admin_domain),
            default_os_image: self.string(f, "default_os_image"),
            default_connection: self
                .string(f, "default_connection")
                .unwrap_or(defaults.default_connection),
            default_user: self
                .string(f, "default_user")
                .unwrap_or(defaults.default_user),
        }
    }

    fn resource_policy(&mut self, f: &Fields<'_>) -> ResourcePolicy {
        self.unknown_keys(f, RESOURCE_KEYS);
        let mut host_reserve = HostReserve::default();
        if let Some(map) = self.mapping(f, "host_reserve") {
            let rf = Fields::new(map, f.at("host_reserve"));
            self.unknown_keys(&rf, RESERVE_KEYS);
            if let Some(cpu) = self.reserve(&rf, "cpu", |text| text.trim().parse().ok()) {
                host_reserve.cpu = cpu;
            }
            if let Some(memory) = self.reserve(&rf, "memory", parse_size) {
                host_reserve.memory = memory;
            }
        }

        ResourcePolicy {
            host_reserve,
            mode: self
                .keyword::<DistributionMode>(f, "mode", "proportional or equal")
                .unwrap_or_default(),
            cpu_mode: self
                .keyword::<CpuMode>(f, "cpu_mode", "allowance or count")
                .unwrap_or_default(),
            memory_enforce: self
                .keyword::<MemoryEnforce>(f, "memory_enforce", "soft or hard")
                .unwrap_or_default(),
            overcommit: self.boolean(f, "overcommit").unwrap_or(false),
        }
    }

    /// `"20%"` is a percentage; anything else goes through `absolute`
    fn reserve(
        &mut self,
        f: &Fields<'_>,
        key: &str,
        absolute: fn(&str) -> Option<u64>,
    ) -> Option<Reserve> {
        let value = f.get(key)?;
        let parsed = match value {
            Value::Number(n) => n.as_u64().map(Reserve::Absolute),
            Value::String(s) if s.trim().ends_with('%') => parse_percent(s).map(Reserve::Percent),
            Value::String(s) => absolute(s).map(Reserve::Absolute),
            _ => None,
        };
        if parsed.is_none() {
            self.diags.error(
                Category::Schema,
                f.at(key),
                format!(
                    "expected a percentage such as \"20%\" or an absolute amount, found {}",
                    describe(value)
                ),
            );
        }
        parsed
    }

    fn domain(&mut self, body: &Value, loc: Location) -> Domain {
        let map = match body {
            Value::Mapping(map) => map,
            Value::Null => return Domain::default(),
            other => {
                self.type_error(loc, "a mapping", other);
                return Domain::default();
            }
        };
        let f = Fields::new(map, loc);
        self.unknown_keys(&f, DOMAIN_KEYS);

        let mut domain = Domain {
            description: self.string(&f, "description").unwrap_or_default(),
            enabled: self.boolean(&f, "enabled").unwrap_or(true),
            subnet_id: self.integer(&f, "subnet_id"),
            ephemeral: self.boolean(&f, "ephemeral").unwrap_or(false),
            trust_level: self
                .keyword::<TrustLevel>(
                    &f,
                    "trust_level",
                    "admin, trusted, semi-trusted, untrusted or disposable",
                )
                .unwrap_or_default(),
            ..Domain::default()
        };

        for (name, body, loc) in self.entries(&f, "profiles") {
            let profile = self.profile(body, loc);
            domain.profiles.insert(name, profile);
        }

        // Machines keep declaration order; it drives address assignment.
        let mut machines = IndexMap::new();
        for (name, body, loc) in self.ordered_entries(&f, "machines") {
            let machine = self.machine(body, loc);
            machines.insert(name, machine);
        }
        domain.machines = machines;
        domain
    }

    fn profile(&mut self, body: &Value, loc: Location) -> Profile {
        let map = match body {
            Value::Mapping(map) => map,
            Value::Null => return Profile::default(),
            other => {
                self.type_error(loc, "a mapping", other);
                return Profile::default();
            }
        };
        let f = Fields::new(map, loc);
        self.unknown_keys(&f, PROFILE_KEYS);

        let mut profile = Profile {
            description: self.string(&f, "description").unwrap_or_default(),
            config: self.scalar_map(&f, "config"),
            devices: BTreeMap::new(),
        };
        for (name, body, loc) in self.entries(&f, "devices") {
            let device = match body {
                Value::Mapping(map) => self.scalars(map, loc),
                other => {
                    self.type_error(loc, "a mapping", other);
                    BTreeMap::new()
                }
            };
            profile.devices.insert(name, device);
        }
        profile
    }

    fn machine(&mut self, body: &Value, loc: Location) -> Machine {
        let map = match body {
            Value::Mapping(map) => map,
            Value::Null => return Machine::default(),
            other => {
                self.type_error(loc, "a mapping", other);
                return Machine::default();
            }
        };
        let f = Fields::new(map, loc);
        self.unknown_keys(&f, MACHINE_KEYS);

        let ip = self.string(&f, "ip").and_then(|text| {
            match text.parse::<Ipv4Addr>() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    self.diags.error(
                        Category::Address,
                        f.at("ip"),
                        format!("'{}' is not an IPv4 address", text),
                    );
                    None
                }
            }
        });

        let mut machine = Machine {
            description: self.string(&f, "description").unwrap_or_default(),
            kind: self
                .keyword::<MachineKind>(&f, "type", "lxc or vm")
                .unwrap_or_default(),
            ip,
            ephemeral: self.boolean(&f, "ephemeral"),
            gpu: self.boolean(&f, "gpu").unwrap_or(false),
            profiles: self.string_list(&f, "profiles"),
            weight: self.integer(&f, "weight").unwrap_or(1),
            boot_autostart: self.boolean(&f, "boot_autostart"),
            boot_priority: self.integer(&f, "boot_priority"),
            snapshots_schedule: self.string(&f, "snapshots_schedule"),
            snapshots_expiry: self.string(&f, "snapshots_expiry"),
            config: self.scalar_map(&f, "config"),
            storage_volumes: BTreeMap::new(),
            roles: self.string_list(&f, "roles"),
        };

        for (name, body, loc) in self.entries(&f, "storage_volumes") {
            let map = match body {
                Value::Mapping(map) => map,
                other => {
                    self.type_error(loc, "a mapping", other);
                    continue;
                }
            };
            let sf = Fields::new(map, loc);
            self.unknown_keys(&sf, STORAGE_KEYS);
            let path = match self.string(&sf, "path") {
                Some(path) => path,
                None => {
                    self.diags.error(
                        Category::Storage,
                        sf.at("path"),
                        "storage volume requires a mount path",
                    );
                    continue;
                }
            };
            machine.storage_volumes.insert(
                name,
                StorageVolume {
                    pool: self.string(&sf, "pool").unwrap_or_else(|| "default".to_string()),
                    size: self.string(&sf, "size"),
                    path,
                },
            );
        }
        machine
    }

    fn policy(&mut self, f: &Fields<'_>) -> NetworkPolicy {
        self.unknown_keys(f, POLICY_KEYS);
        let from = self.required_string(f, "from");
        let to = self.required_string(f, "to");

        let ports = match f.get("ports") {
            None => Ports::All,
            Some(Value::String(s)) if s == "all" => Ports::All,
            Some(Value::Sequence(items)) => {
                let mut ports = Vec::new();
                for (index, item) in items.iter().enumerate() {
                    match item.as_u64() {
                        Some(port) => ports.push(port),
                        None => self.type_error(f.at("ports").at_index(index), "a port number", item),
                    }
                }
                Ports::List(ports)
            }
            Some(other) => {
                self.type_error(f.at("ports"), "a list of ports or \"all\"", other);
                Ports::All
            }
        };

        NetworkPolicy {
            description: self.string(f, "description").unwrap_or_default(),
            from,
            to,
            ports,
            protocol: self
                .keyword::<Protocol>(f, "protocol", "tcp or udp")
                .unwrap_or_default(),
            bidirectional: self.boolean(f, "bidirectional").unwrap_or(false),
        }
    }

    fn shared_volume(&mut self, body: &Value, loc: Location) -> SharedVolume {
        let map = match body {
            Value::Mapping(map) => map,
            Value::Null => return SharedVolume::default(),
            other => {
                self.type_error(loc, "a mapping", other);
                return SharedVolume::default();
            }
        };
        let f = Fields::new(map, loc);
        self.unknown_keys(&f, VOLUME_KEYS);

        let mut volume = SharedVolume {
            source: self.string(&f, "source"),
            path: self.string(&f, "path"),
            shift: self.boolean(&f, "shift").unwrap_or(true),
            propagate: self.boolean(&f, "propagate").unwrap_or(false),
            consumers: BTreeMap::new(),
        };
        for (name, body, loc) in self.entries(&f, "consumers") {
            let access = match body.as_str().map(Access::from_str) {
                Some(Ok(access)) => access,
                _ => {
                    self.diags.error(
                        Category::SharedVolume,
                        loc,
                        format!("access must be ro or rw, found {}", describe(body)),
                    );
                    continue;
                }
            };
            volume.consumers.insert(name, access);
        }
        volume
    }

    // -- field helpers -----------------------------------------------------

    fn type_error(&mut self, loc: Location, expected: &str, found: &Value) {
        self.diags.error(
            Category::Schema,
            loc,
            format!("expected {}, found {}", expected, describe(found)),
        );
    }

    fn unknown_keys(&mut self, f: &Fields<'_>, allowed: &[&str]) {
        for key in f.map.keys() {
            match key_name(key) {
                Some(name) if allowed.contains(&name.as_str()) => {}
                Some(name) => self.diags.warning(
                    Category::Schema,
                    f.at(&name),
                    "unknown field is ignored",
                ),
                None => self.type_error(f.loc.clone(), "string keys", key),
            }
        }
    }

    fn mapping<'a>(&mut self, f: &Fields<'a>, key: &str) -> Option<&'a Mapping> {
        match f.get(key)? {
            Value::Mapping(map) => Some(map),
            other => {
                self.type_error(f.at(key), "a mapping", other);
                None
            }
        }
    }

    /// Named children of a mapping field, sorted by name
    fn entries<'a>(&mut self, f: &Fields<'a>, key: &str) -> Vec<(String, &'a Value, Location)> {
        let mut entries = self.ordered_entries(f, key);
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Named children of a mapping field, in document order
    fn ordered_entries<'a>(
        &mut self,
        f: &Fields<'a>,
        key: &str,
    ) -> Vec<(String, &'a Value, Location)> {
        let Some(map) = self.mapping(f, key) else {
            return Vec::new();
        };
        let base = f.at(key);
        let mut entries = Vec::with_capacity(map.len());
        for (k, v) in map {
            match key_name(k) {
                Some(name) => {
                    let loc = base.clone().in_field(&name);
                    entries.push((name, v, loc));
                }
                None => self.type_error(base.clone(), "string keys", k),
            }
        }
        entries
    }

    fn string(&mut self, f: &Fields<'_>, key: &str) -> Option<String> {
        match f.get(key)? {
            Value::String(s) => Some(s.clone()),
            other => {
                self.type_error(f.at(key), "a string", other);
                None
            }
        }
    }

    fn required_string(&mut self, f: &Fields<'_>, key: &str) -> String {
        if f.get(key).is_none() {
            self.diags
                .error(Category::Schema, f.at(key), "required field is missing");
            return String::new();
        }
        self.string(f, key).unwrap_or_default()
    }

    fn boolean(&mut self, f: &Fields<'_>, key: &str) -> Option<bool> {
        match f.get(key)? {
            Value::Bool(b) => Some(*b),
            other => {
                self.type_error(f.at(key), "a boolean", other);
                None
            }
        }
    }

    fn integer(&mut self, f: &Fields<'_>, key: &str) -> Option<u64> {
        let value = f.get(key)?;
        match value.as_u64() {
            Some(n) => Some(n),
            None => {
                self.type_error(f.at(key), "a non-negative integer", value);
                None
            }
        }
    }

    fn keyword<T: FromStr>(&mut self, f: &Fields<'_>, key: &str, expected: &str) -> Option<T> {
        let value = f.get(key)?;
        match value.as_str().map(T::from_str) {
            Some(Ok(parsed)) => Some(parsed),
            Some(Err(_)) => {
                self.diags.error(
                    Category::Schema,
                    f.at(key),
                    format!(
                        "unknown value '{}', expected {}",
                        value.as_str().unwrap_or_default(),
                        expected
                    ),
                );
                None
            }
            None => {
                self.type_error(f.at(key), expected, value);
                None
            }
        }
    }

    fn string_list(&mut self, f: &Fields<'_>, key: &str) -> Vec<String> {
        match f.get(key) {
            None => Vec::new(),
            Some(Value::Sequence(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (index, item) in items.iter().enumerate() {
                    match item {
                        Value::String(s) => out.push(s.clone()),
                        other => self.type_error(f.at(key).at_index(index), "a string", other),
                    }
                }
                out
            }
            Some(other) => {
                self.type_error(f.at(key), "a list of strings", other);
                Vec::new()
            }
        }
    }

    fn scalar_map(&mut self, f: &Fields<'_>, key: &str) -> BTreeMap<String, String> {
        match self.mapping(f, key) {
            Some(map) => self.scalars(map, f.at(key)),
            None => BTreeMap::new(),
        }
    }

    /// Stringify a flat mapping of scalars, as Incus expects for config keys
    fn scalars(&mut self, map: &Mapping, loc: Location) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (k, v) in map {
            let Some(name) = key_name(k) else {
                self.type_error(loc.clone(), "string keys", k);
                continue;
            };
            let text = match v {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => {
                    self.type_error(loc.clone().in_field(&name), "a scalar", other);
                    continue;
                }
            };
            out.insert(name, text);
        }
        out
    }
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}
