use std::collections::BTreeMap;

use super::Validator;
use crate::diagnostics::{Category, Location};
use crate::model::SharedVolume;

impl Validator<'_> {
    pub(super) fn check_shared_volumes(&mut self) {
        let spec = self.spec;

        if !spec.shared_volumes.is_empty() && !spec.global.shared_volumes_base.starts_with('/') {
            self.diags.error(
                Category::SharedVolume,
                Location::global("shared_volumes_base"),
                format!(
                    "'{}' must be an absolute path",
                    spec.global.shared_volumes_base
                ),
            );
        }

        for (name, volume) in &spec.shared_volumes {
            let loc = Location::volume(name);
            for (field, value) in [("source", &volume.source), ("path", &volume.path)] {
                if let Some(path) = value {
                    if !path.starts_with('/') {
                        self.diags.error(
                            Category::SharedVolume,
                            loc.clone().in_field(field),
                            format!("'{}' must be an absolute path", path),
                        );
                    }
                }
            }
            for consumer in volume.consumers.keys() {
                if !self.resolves(consumer, false) {
                    self.diags.error(
                        Category::Reference,
                        loc.clone().in_field("consumers").in_field(consumer),
                        format!("consumer '{}' is neither a domain nor a machine", consumer),
                    );
                }
            }
        }

        let mounts = spec.shared_mounts();
        for m in spec.active_machines() {
            let Some(mounted) = mounts.get(m.name) else {
                continue;
            };
            let loc = Location::machine(m.domain_name, m.name);

            let mut paths: BTreeMap<String, &str> = BTreeMap::new();
            for mount in mounted {
                let device = SharedVolume::device_name(mount.name);

                for (profile_name, profile) in m.resolved_profiles() {
                    if profile.devices.contains_key(&device) {
                        self.diags.error(
                            Category::SharedVolume,
                            loc.clone(),
                            format!(
                                "device '{}' of shared volume '{}' collides with a device of profile '{}'",
                                device, mount.name, profile_name
                            ),
                        );
                    }
                }
                if m.machine.storage_volumes.contains_key(&device) {
                    self.diags.error(
                        Category::SharedVolume,
                        loc.clone(),
                        format!(
                            "device '{}' of shared volume '{}' collides with a storage volume",
                            device, mount.name
                        ),
                    );
                }

                let path = mount.volume.mount_path(mount.name);
                match paths.get(&path) {
                    Some(other) => self.diags.error(
                        Category::SharedVolume,
                        loc.clone(),
                        format!(
                            "shared volumes '{}' and '{}' both mount at {}",
                            other, mount.name, path
                        ),
                    ),
                    None => {
                        paths.insert(path, mount.name);
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
    fn test_paths_and_consumers() {
        let diags = check(
            r#"
project_name: demo
domains:
  pro:
    machines:
      pro-dev: {}
shared_volumes:
  docs:
    source: relative/docs
    path: /shares/docs
    consumers:
      pro: rw
      pro-dev: ro
      ghost: ro
"#,
        );
        assert_eq!(
            error_locations(&diags, Category::SharedVolume),
            vec!["shared_volumes.docs.source"]
        );
        assert_eq!(
            error_locations(&diags, Category::Reference),
            vec!["shared_volumes.docs.consumers.ghost"]
        );
    }

    #[test]
    fn test_device_and_path_collisions() {
        let diags = check(
            r#"
project_name: demo
domains:
  pro:
    profiles:
      mounts:
        devices:
          sv-docs: { type: disk, source: /srv/other, path: /other }
    machines:
      pro-dev:
        profiles: [mounts]
        storage_volumes:
          sv-media: { path: /media }
      pro-ci: {}
shared_volumes:
  docs:
    consumers: { pro-dev: rw }
  media:
    path: /data
    consumers: { pro: ro }
  photos:
    path: /data
    consumers: { pro-ci: ro }
"#,
        );
        let messages: Vec<_> = diags
            .by_category(Category::SharedVolume)
            .map(|d| (d.location.to_string(), d.message.clone()))
            .collect();
        assert_eq!(messages.len(), 3, "{:#?}", messages);
        assert_eq!(messages[0].0, "domains.pro.machines.pro-dev");
        assert!(messages[0].1.contains("profile 'mounts'"));
        assert!(messages[1].1.contains("storage volume"));
        assert_eq!(messages[2].0, "domains.pro.machines.pro-ci");
        assert!(messages[2].1.contains("'media' and 'photos'"));
    }
}
