//! Artifact writer
//!
//! Writing happens in two steps. [`ArtifactWriter::plan`] reads the output
//! tree, merges every rendered region into its file and scans for orphans
//! without touching the disk. [`ArtifactWriter::apply`] then performs the
//! planned changes; a file whose content is unchanged is never rewritten.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::WriteError;
use crate::orphans;
use crate::region::ManagedFile;
use crate::render::Artifact;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FileAction {
    Create,
    Update,
    Unchanged,
    Delete,
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FileAction::Create => "create",
            FileAction::Update => "update",
            FileAction::Unchanged => "unchanged",
            FileAction::Delete => "delete",
        };
        f.write_str(text)
    }
}

/// One file operation, paths relative to the output root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    pub path: PathBuf,
    pub action: FileAction,
    contents: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritePlan {
    pub files: Vec<PlannedFile>,
    /// Every orphan found, whether or not it is scheduled for deletion
    pub orphans: Vec<PathBuf>,
}

impl WritePlan {
    /// Planned operations that modify the tree
    pub fn changes(&self) -> impl Iterator<Item = &PlannedFile> {
        self.files
            .iter()
            .filter(|f| f.action != FileAction::Unchanged)
    }

    pub fn count(&self, action: FileAction) -> usize {
        self.files.iter().filter(|f| f.action == action).count()
    }

    pub fn is_noop(&self) -> bool {
        self.changes().next().is_none()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    pub dry_run: bool,
    pub clean_orphans: bool,
}

pub struct ArtifactWriter {
    root: PathBuf,
    options: WriteOptions,
}

impl ArtifactWriter {
    pub fn new(root: impl Into<PathBuf>, options: WriteOptions) -> Self {
        Self {
            root: root.into(),
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Plan, then apply unless this is a dry run.
    pub fn write(&self, artifacts: &[Artifact]) -> Result<WritePlan, WriteError> {
        let plan = self.plan(artifacts)?;
        if self.options.dry_run {
            info!("Dry run: {} change(s) not written", plan.changes().count());
        } else {
            self.apply(&plan)?;
        }
        Ok(plan)
    }

    pub fn plan(&self, artifacts: &[Artifact]) -> Result<WritePlan, WriteError> {
        let mut files = Vec::with_capacity(artifacts.len());
        let mut expected = BTreeSet::new();

        for artifact in artifacts {
            let relative = artifact.relative_path();
            let target = self.root.join(&relative);
            let (action, contents) = match read_existing(&target)? {
                None => (
                    FileAction::Create,
                    ManagedFile::scaffold(artifact.region.as_str()).render(),
                ),
                Some(current) => {
                    let merged = ManagedFile::parse(&current)
                        .map_err(|source| WriteError::Region {
                            path: target.clone(),
                            source,
                        })?
                        .with_region(artifact.region.as_str())
                        .render();
                    let action = if merged == current {
                        FileAction::Unchanged
                    } else {
                        FileAction::Update
                    };
                    (action, merged)
                }
            };
            debug!("{} {}", action, relative.display());
            files.push(PlannedFile {
                path: relative.clone(),
                action,
                contents: Some(contents),
            });
            expected.insert(relative);
        }

        let orphans = orphans::scan(&self.root, &expected)?;
        for orphan in &orphans {
            if self.options.clean_orphans {
                files.push(PlannedFile {
                    path: orphan.clone(),
                    action: FileAction::Delete,
                    contents: None,
                });
            } else {
                warn!(
                    "Orphaned artifact {} (use --clean-orphans to delete)",
                    orphan.display()
                );
            }
        }

        Ok(WritePlan { files, orphans })
    }

    pub fn apply(&self, plan: &WritePlan) -> Result<(), WriteError> {
        for file in plan.changes() {
            let target = self.root.join(&file.path);
            match (&file.action, &file.contents) {
                (FileAction::Delete, _) => {
                    fs::remove_file(&target).map_err(WriteError::io(&target))?;
                }
                (_, Some(contents)) => write_atomic(&target, contents)?,
                (_, None) => {}
            }
        }
        info!(
            "Wrote {} new and {} updated file(s), deleted {}",
            plan.count(FileAction::Create),
            plan.count(FileAction::Update),
            plan.count(FileAction::Delete)
        );
        Ok(())
    }
}

fn read_existing(path: &Path) -> Result<Option<String>, WriteError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(WriteError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Replace `path` through a temporary file in the same directory. An
/// existing file keeps its permissions; a new one gets the usual `0644`.
fn write_atomic(path: &Path, contents: &str) -> Result<(), WriteError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).map_err(WriteError::io(dir))?;

    let mut tmp = NamedTempFile::new_in(dir).map_err(WriteError::io(dir))?;
    tmp.write_all(contents.as_bytes())
        .map_err(WriteError::io(tmp.path()))?;
    if let Some(permissions) = target_permissions(path)? {
        tmp.as_file()
            .set_permissions(permissions)
            .map_err(WriteError::io(tmp.path()))?;
    }
    tmp.persist(path)
        .map_err(|e| WriteError::Io {
            path: path.to_path_buf(),
            source: e.error,
        })?;
    Ok(())
}

fn target_permissions(path: &Path) -> Result<Option<fs::Permissions>, WriteError> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(meta.permissions())),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(default_permissions()),
        Err(e) => Err(WriteError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

#[cfg(unix)]
fn default_permissions() -> Option<fs::Permissions> {
    use std::os::unix::fs::PermissionsExt;
    Some(fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn default_permissions() -> Option<fs::Permissions> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::ArtifactKind;
    use pretty_assertions::assert_eq;

    fn artifact(kind: ArtifactKind, stem: &str, region: &str) -> Artifact {
        Artifact {
            kind,
            stem: stem.to_string(),
            region: region.to_string(),
        }
    }

    #[test]
    fn test_dry_run_touches_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let writer = ArtifactWriter::new(
            dir.path(),
            WriteOptions {
                dry_run: true,
                clean_orphans: false,
            },
        );
        let plan = writer.write(&[artifact(ArtifactKind::HostVars, "pro-dev", "a: 1\n")])?;

        assert_eq!(plan.count(FileAction::Create), 1);
        assert!(!dir.path().join("host_vars").exists());
        Ok(())
    }

    #[test]
    fn test_second_write_is_a_noop() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let writer = ArtifactWriter::new(dir.path(), WriteOptions::default());
        let artifacts = [
            artifact(ArtifactKind::Inventory, "pro", "all: {}\n"),
            artifact(ArtifactKind::GlobalVars, "all", "project_name: demo\n"),
        ];

        let first = writer.write(&artifacts)?;
        assert_eq!(first.count(FileAction::Create), 2);
        assert!(dir.path().join("group_vars/all.yml").is_file());

        let second = writer.write(&artifacts)?;
        assert!(second.is_noop());
        assert_eq!(second.count(FileAction::Unchanged), 2);
        Ok(())
    }

    #[test]
    fn test_ambiguous_existing_file_fails_before_any_write() -> Result<(), Box<dyn std::error::Error>>
    {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("host_vars"))?;
        fs::write(dir.path().join("host_vars/pro-db.yml"), "hand: written\n")?;

        let writer = ArtifactWriter::new(dir.path(), WriteOptions::default());
        let result = writer.write(&[
            artifact(ArtifactKind::Inventory, "pro", "all: {}\n"),
            artifact(ArtifactKind::HostVars, "pro-db", "a: 1\n"),
        ]);

        assert!(matches!(result, Err(WriteError::Region { .. })));
        assert!(!dir.path().join("inventory").exists());
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_file_modes_are_preserved() -> Result<(), Box<dyn std::error::Error>> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir()?;
        let writer = ArtifactWriter::new(dir.path(), WriteOptions::default());
        writer.write(&[artifact(ArtifactKind::HostVars, "pro-dev", "a: 1\n")])?;

        let path = dir.path().join("host_vars/pro-dev.yml");
        let mode = |p: &Path| -> io::Result<u32> { Ok(fs::metadata(p)?.permissions().mode() & 0o777) };
        assert_eq!(mode(&path)?, 0o644);

        fs::set_permissions(&path, fs::Permissions::from_mode(0o640))?;
        let plan = writer.write(&[artifact(ArtifactKind::HostVars, "pro-dev", "a: 2\n")])?;
        assert_eq!(plan.count(FileAction::Update), 1);
        assert_eq!(mode(&path)?, 0o640);
        Ok(())
    }
}
