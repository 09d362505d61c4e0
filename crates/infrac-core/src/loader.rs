//! Descriptor loading
//!
//! A descriptor is either a single YAML document or a directory holding
//! `base.yml`, any number of `domains/*.yml` fragments and an optional
//! `policies.yml`. Both forms merge into the same [`Document`]; the decoder
//! sorts domains by name so the fragment order never leaks into the model.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::LoadError;

pub const BASE_FILE: &str = "base.yml";
pub const DOMAINS_DIR: &str = "domains";
pub const POLICIES_FILE: &str = "policies.yml";

/// Merged, still loosely typed descriptor
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub root: Mapping,
    /// Files read, in merge order
    pub sources: Vec<PathBuf>,
}

impl Document {
    /// Parse a single in-memory document, mostly useful for tests.
    pub fn parse_str(content: &str, origin: impl Into<PathBuf>) -> Result<Self, LoadError> {
        let origin = origin.into();
        let root = into_mapping(parse(content, &origin)?, &origin)?;
        require(&root, &origin, "project_name")?;
        require(&root, &origin, "domains")?;
        Ok(Self {
            root,
            sources: vec![origin],
        })
    }
}

/// Load a descriptor from a file or a fragment directory.
pub fn load(path: &Path) -> Result<Document, LoadError> {
    if path.is_dir() {
        load_directory(path)
    } else {
        load_single(path)
    }
}

pub fn load_single(path: &Path) -> Result<Document, LoadError> {
    let content = read(path)?;
    let document = Document::parse_str(&content, path)?;
    info!("Loaded descriptor {}", path.display());
    Ok(document)
}

pub fn load_directory(dir: &Path) -> Result<Document, LoadError> {
    let base_path = dir.join(BASE_FILE);
    if !base_path.is_file() {
        return Err(LoadError::Structure {
            path: dir.to_path_buf(),
            message: format!("directory descriptor requires {}", BASE_FILE),
        });
    }

    let mut root = read_mapping(&base_path)?;
    require(&root, &base_path, "project_name")?;
    let mut sources = vec![base_path.clone()];

    let mut domains = match root.remove("domains") {
        None | Some(Value::Null) => Mapping::new(),
        Some(Value::Mapping(m)) => m,
        Some(_) => {
            return Err(LoadError::Structure {
                path: base_path,
                message: "'domains' must be a mapping".to_string(),
            })
        }
    };

    let mut origins: HashMap<String, PathBuf> = HashMap::new();
    for key in domains.keys() {
        if let Some(name) = key_name(key) {
            origins.insert(name, base_path.clone());
        }
    }

    for fragment in domain_fragments(&dir.join(DOMAINS_DIR))? {
        debug!("Merging domain fragment {}", fragment.display());
        for (key, body) in read_mapping(&fragment)? {
            let name = key_name(&key).ok_or_else(|| LoadError::Structure {
                path: fragment.clone(),
                message: "domain names must be strings".to_string(),
            })?;
            if let Some(first) = origins.get(&name) {
                return Err(LoadError::DuplicateDomain {
                    domain: name,
                    first: first.clone(),
                    second: fragment.clone(),
                });
            }
            origins.insert(name.clone(), fragment.clone());
            domains.insert(Value::String(name), body);
        }
        sources.push(fragment);
    }
    root.insert(Value::String("domains".into()), Value::Mapping(domains));

    let policies_path = dir.join(POLICIES_FILE);
    if policies_path.is_file() {
        let mut policies = read_mapping(&policies_path)?;
        if let Some(rules) = policies.remove("network_policies") {
            if root.contains_key("network_policies") {
                return Err(LoadError::Structure {
                    path: policies_path,
                    message: format!("network_policies is also declared in {}", BASE_FILE),
                });
            }
            root.insert(Value::String("network_policies".into()), rules);
        }
        if let Some(extra) = policies.keys().next() {
            return Err(LoadError::Structure {
                path: policies_path,
                message: format!(
                    "unexpected key '{}', only network_policies is allowed",
                    key_name(extra).unwrap_or_else(|| "?".to_string())
                ),
            });
        }
        sources.push(policies_path);
    }

    info!(
        "Loaded descriptor directory {} ({} file(s))",
        dir.display(),
        sources.len()
    );
    Ok(Document { root, sources })
}

/// Domain fragments sorted by file name
fn domain_fragments(dir: &Path) -> Result<Vec<PathBuf>, LoadError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut fragments = Vec::new();
    for entry in WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| LoadError::Io {
            path: e.path().unwrap_or(dir).to_path_buf(),
            source: e.into(),
        })?;
        let path = entry.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yml" || ext == "yaml");
        if entry.file_type().is_file() && is_yaml {
            fragments.push(path.to_path_buf());
        }
    }
    Ok(fragments)
}

fn read(path: &Path) -> Result<String, LoadError> {
    fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn parse(content: &str, path: &Path) -> Result<Value, LoadError> {
    serde_yaml::from_str(content).map_err(|source| LoadError::Syntax {
        path: path.to_path_buf(),
        source,
    })
}

fn read_mapping(path: &Path) -> Result<Mapping, LoadError> {
    let content = read(path)?;
    into_mapping(parse(&content, path)?, path)
}

fn into_mapping(value: Value, path: &Path) -> Result<Mapping, LoadError> {
    match value {
        Value::Mapping(m) => Ok(m),
        Value::Null => Ok(Mapping::new()),
        _ => Err(LoadError::Structure {
            path: path.to_path_buf(),
            message: "expected a mapping at the top level".to_string(),
        }),
    }
}

fn require(root: &Mapping, path: &Path, field: &'static str) -> Result<(), LoadError> {
    match root.get(field) {
        None | Some(Value::Null) => Err(LoadError::MissingField {
            path: path.to_path_buf(),
            field,
        }),
        Some(_) => Ok(()),
    }
}

pub(crate) fn key_name(key: &Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_project_name_is_fatal() {
        let err = Document::parse_str("domains: {}\n", "infra.yml").unwrap_err();
        assert!(matches!(
            err,
            LoadError::MissingField {
                field: "project_name",
                ..
            }
        ));
        assert!(err.to_string().contains("infra.yml"));
    }

    #[test]
    fn test_malformed_yaml_names_the_file() {
        let err = Document::parse_str("project_name: [unclosed\n", "broken.yml").unwrap_err();
        assert!(matches!(err, LoadError::Syntax { .. }));
        assert!(err.to_string().starts_with("broken.yml"));
    }

    #[test]
    fn test_non_mapping_root_is_rejected() {
        let err = Document::parse_str("- a\n- b\n", "list.yml").unwrap_err();
        assert!(matches!(err, LoadError::Structure { .. }));
    }

    #[test]
    fn test_directory_requires_base() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let err = load(dir.path()).unwrap_err();
        assert!(err.to_string().contains(BASE_FILE));
        Ok(())
    }

    #[test]
    fn test_duplicate_domain_across_fragments() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(BASE_FILE), "project_name: demo\n")?;
        fs::create_dir(dir.path().join(DOMAINS_DIR))?;
        fs::write(dir.path().join("domains/a.yml"), "pro: {}\n")?;
        fs::write(dir.path().join("domains/b.yml"), "pro: {}\n")?;

        match load(dir.path()) {
            Err(LoadError::DuplicateDomain { domain, .. }) => assert_eq!(domain, "pro"),
            other => return Err(format!("expected duplicate domain, got {:?}", other).into()),
        }
        Ok(())
    }

    #[test]
    fn test_policies_declared_twice() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(
            dir.path().join(BASE_FILE),
            "project_name: demo\nnetwork_policies: []\n",
        )?;
        fs::write(dir.path().join(POLICIES_FILE), "network_policies: []\n")?;

        let err = load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("also declared"));
        Ok(())
    }

    #[test]
    fn test_fragments_are_merged_in_name_order() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join(BASE_FILE), "project_name: demo\n")?;
        fs::create_dir(dir.path().join(DOMAINS_DIR))?;
        fs::write(dir.path().join("domains/20-perso.yml"), "perso: {}\n")?;
        fs::write(dir.path().join("domains/10-pro.yml"), "pro: {}\n")?;
        fs::write(dir.path().join("domains/notes.txt"), "ignored\n")?;

        let doc = load(dir.path())?;
        let names: Vec<_> = doc.sources.iter().filter_map(|p| p.file_name()).collect();
        assert_eq!(names, vec!["base.yml", "10-pro.yml", "20-perso.yml"]);

        let domains = doc
            .root
            .get("domains")
            .and_then(Value::as_mapping)
            .ok_or("domains missing")?;
        assert_eq!(domains.len(), 2);
        Ok(())
    }
}
