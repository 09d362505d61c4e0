//! Detection of generated files whose declaration is gone

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::WriteError;
use crate::region::is_managed;
use crate::render::{GROUP_VARS_DIR, HOST_VARS_DIR, INVENTORY_DIR};

/// Managed `*.yml` files under the artifact directories of `root` that are
/// not in `expected`, as paths relative to `root`.
///
/// Files without a start marker belong to the operator and are never
/// reported.
pub fn scan(root: &Path, expected: &BTreeSet<PathBuf>) -> Result<Vec<PathBuf>, WriteError> {
    let mut orphans = Vec::new();

    for dir in [INVENTORY_DIR, GROUP_VARS_DIR, HOST_VARS_DIR] {
        let base = root.join(dir);
        if !base.is_dir() {
            continue;
        }
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.map_err(|e| WriteError::Io {
                path: base.clone(),
                source: e.into(),
            })?;
            let path = entry.path();
            let is_yaml = path.extension().and_then(|ext| ext.to_str()) == Some("yml");
            if !entry.file_type().is_file() || !is_yaml {
                continue;
            }
            let relative = PathBuf::from(dir).join(entry.file_name());
            if expected.contains(&relative) {
                continue;
            }
            let bytes = fs::read(path).map_err(WriteError::io(path))?;
            if is_managed(&String::from_utf8_lossy(&bytes)) {
                debug!("Orphaned artifact {}", relative.display());
                orphans.push(relative);
            }
        }
    }
    Ok(orphans)
}
