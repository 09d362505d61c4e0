//! Test fixtures for infrac
//!
//! One representative fleet, available both as a single document and as a
//! fragment directory built from the same pieces, plus a few small
//! descriptors for targeted scenarios.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Fixture layouts
pub enum FixtureType {
    /// `infra.yml` holding the whole fleet
    FleetDocument,
    /// `base.yml`, `domains/*.yml` and `policies.yml`
    FleetDirectory,
}

/// Owns the temporary directory fixtures are written to
pub struct TestFixtures {
    temp_dir: Option<tempfile::TempDir>,
}

impl Default for TestFixtures {
    fn default() -> Self {
        Self::new()
    }
}

impl TestFixtures {
    pub fn new() -> Self {
        Self { temp_dir: None }
    }

    /// Write a fixture and return the path to hand to the loader
    pub fn setup(&mut self, fixture_type: FixtureType) -> io::Result<PathBuf> {
        let dir = tempfile::tempdir()?;
        let path = match fixture_type {
            FixtureType::FleetDocument => {
                let file = dir.path().join("infra.yml");
                fs::write(&file, fleet_yaml())?;
                file
            }
            FixtureType::FleetDirectory => {
                let root = dir.path().join("infra");
                write_fleet_dir(&root)?;
                root
            }
        };
        self.temp_dir = Some(dir);
        Ok(path)
    }

    /// Scratch output directory living as long as the fixtures
    pub fn output_dir(&mut self) -> io::Result<PathBuf> {
        if self.temp_dir.is_none() {
            self.temp_dir = Some(tempfile::tempdir()?);
        }
        let out = match &self.temp_dir {
            Some(dir) => dir.path().join("out"),
            None => return Err(io::Error::new(io::ErrorKind::Other, "no fixture directory")),
        };
        fs::create_dir_all(&out)?;
        Ok(out)
    }
}

const FLEET_BASE: &str = r#"project_name: homelab
global:
  gpu_policy: exclusive
  ai_access_policy: exclusive
  ai_access_default: pro
  shared_volumes_base: /srv/homelab/shares
  default_os_image: images:debian/13
shared_volumes:
  docs:
    consumers:
      pro: rw
      perso-desk: ro
"#;

const FLEET_DOMAINS: &[(&str, &str)] = &[
    (
        "10-admin.yml",
        r#"admin:
  description: Administration
  trust_level: admin
  machines:
    admin-ctrl:
      description: Control node
      roles: [base_system, admin_tools]
"#,
    ),
    (
        "20-pro.yml",
        r#"pro:
  description: Work
  trust_level: trusted
  profiles:
    dev:
      config:
        security.nesting: "true"
  machines:
    pro-dev:
      profiles: [default, dev]
      snapshots_schedule: "0 3 * * *"
      snapshots_expiry: 14d
      roles: [base_system, dev_tools]
    pro-db:
      type: vm
      ip: 10.110.0.20
      weight: 2
      storage_volumes:
        pgdata:
          size: 20GiB
          path: /var/lib/postgresql
"#,
    ),
    (
        "30-perso.yml",
        r#"perso:
  trust_level: semi-trusted
  machines:
    perso-desk:
      boot_autostart: true
      boot_priority: 50
"#,
    ),
    (
        "40-ai-tools.yml",
        r#"ai-tools:
  trust_level: semi-trusted
  profiles:
    nvidia:
      devices:
        gpu0:
          type: gpu
          gputype: physical
  machines:
    ai-llm:
      profiles: [default, nvidia]
      config:
        limits.memory: 8GiB
"#,
    ),
    (
        "50-lab.yml",
        r#"lab:
  trust_level: disposable
  ephemeral: true
  machines:
    lab-scratch: {}
old:
  enabled: false
  trust_level: untrusted
  machines:
    old-box: {}
"#,
    ),
];

const FLEET_POLICIES: &str = r#"network_policies:
  - description: SSH from admin
    from: admin
    to: pro
    ports: [22]
  - from: pro
    to: host
    ports: [8006]
"#;

/// The fleet as one document
pub fn fleet_yaml() -> String {
    let mut doc = String::from(FLEET_BASE);
    doc.push_str("domains:\n");
    for (_, fragment) in FLEET_DOMAINS {
        for line in fragment.lines() {
            doc.push_str("  ");
            doc.push_str(line);
            doc.push('\n');
        }
    }
    doc.push_str(FLEET_POLICIES);
    doc
}

/// The same fleet as a fragment directory under `root`
pub fn write_fleet_dir(root: &Path) -> io::Result<()> {
    let domains = root.join("domains");
    fs::create_dir_all(&domains)?;
    fs::write(root.join("base.yml"), FLEET_BASE)?;
    for (file, fragment) in FLEET_DOMAINS {
        fs::write(domains.join(file), fragment)?;
    }
    fs::write(root.join("policies.yml"), FLEET_POLICIES)?;
    Ok(())
}

/// Two GPU consumers in different domains under the given policy
pub fn two_gpu_yaml(policy: &str) -> String {
    format!(
        r#"project_name: gpus
global:
  gpu_policy: {}
domains:
  render:
    machines:
      render-a:
        gpu: true
  studio:
    machines:
      studio-b:
        gpu: true
"#,
        policy
    )
}

/// Two trusted domains without explicit subnet ids, declared out of order
pub const ALPHABETICAL_YAML: &str = r#"project_name: order
domains:
  b:
    trust_level: trusted
    machines:
      b-one: {}
  a:
    trust_level: trusted
    machines:
      a-one: {}
"#;

/// One domain per trust level
pub const ZONES_YAML: &str = r#"project_name: zones
domains:
  z-disposable: { trust_level: disposable }
  z-untrusted: { trust_level: untrusted }
  z-semi: { trust_level: semi-trusted }
  z-trusted: { trust_level: trusted }
  z-admin: { trust_level: admin }
"#;
