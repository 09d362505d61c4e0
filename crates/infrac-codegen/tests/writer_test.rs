use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use infrac_codegen::region::END_MARKER;
use infrac_codegen::{generate, FileAction, WriteOptions};
use infrac_core::{Compilation, NoProbe, Pipeline};
use infrac_test_fixtures::{fleet_yaml, FixtureType, TestFixtures};
use pretty_assertions::assert_eq;
use walkdir::WalkDir;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn compile(yaml: &str) -> Result<Compilation, infrac_core::CompileError> {
    Pipeline::default()
        .with_probe(NoProbe)
        .compile_str(yaml, "infra.yml")
}

fn write(
    yaml: &str,
    out: &Path,
    clean_orphans: bool,
) -> Result<infrac_codegen::WritePlan, Box<dyn std::error::Error>> {
    let options = WriteOptions {
        dry_run: false,
        clean_orphans,
    };
    Ok(generate(&compile(yaml)?, out, options)?)
}

#[test]
fn test_recompile_writes_nothing() -> TestResult {
    let mut fixtures = TestFixtures::new();
    let out = fixtures.output_dir()?;

    let first = write(&fleet_yaml(), &out, false)?;
    assert_eq!(first.count(FileAction::Create), 17);

    let before = fs::metadata(out.join("host_vars/pro-dev.yml"))?.modified()?;
    let second = write(&fleet_yaml(), &out, false)?;
    assert!(second.is_noop(), "{:#?}", second.changes().collect::<Vec<_>>());
    assert_eq!(second.count(FileAction::Unchanged), 17);
    assert_eq!(fs::metadata(out.join("host_vars/pro-dev.yml"))?.modified()?, before);
    Ok(())
}

#[test]
fn test_operator_content_survives_regeneration() -> TestResult {
    let mut fixtures = TestFixtures::new();
    let out = fixtures.output_dir()?;
    write(&fleet_yaml(), &out, false)?;

    let path = out.join("host_vars/pro-dev.yml");
    let mut content = fs::read_to_string(&path)?;
    content.push_str("operator_note: keep me\n");
    fs::write(&path, &content)?;

    let changed = fleet_yaml().replace("roles: [base_system, dev_tools]", "roles: [base_system]");
    let plan = write(&changed, &out, false)?;
    let updated: Vec<PathBuf> = plan
        .changes()
        .map(|f| f.path.clone())
        .collect();
    assert_eq!(updated, vec![PathBuf::from("host_vars/pro-dev.yml")]);

    let regenerated = fs::read_to_string(&path)?;
    assert!(regenerated.ends_with("operator_note: keep me\n"));
    let (region, _) = regenerated
        .split_once(END_MARKER)
        .ok_or("end marker missing")?;
    assert!(!region.contains("dev_tools"));
    assert_eq!(
        regenerated.split_once(END_MARKER).map(|(_, rest)| rest),
        content.split_once(END_MARKER).map(|(_, rest)| rest)
    );
    Ok(())
}

#[test]
fn test_removed_domain_is_reported_then_cleaned() -> TestResult {
    let mut fixtures = TestFixtures::new();
    let out = fixtures.output_dir()?;
    write(&fleet_yaml(), &out, false)?;

    // Disabling a domain removes its artifacts from the expected set
    let without_lab = fleet_yaml().replace(
        "  lab:\n    trust_level: disposable\n",
        "  lab:\n    enabled: false\n    trust_level: disposable\n",
    );
    let reported = write(&without_lab, &out, false)?;
    let expected = vec![
        PathBuf::from("inventory/lab.yml"),
        PathBuf::from("group_vars/lab.yml"),
        PathBuf::from("host_vars/lab-scratch.yml"),
    ];
    assert_eq!(reported.orphans, expected);
    assert_eq!(reported.count(FileAction::Delete), 0);
    assert!(out.join("inventory/lab.yml").is_file());

    let cleaned = write(&without_lab, &out, true)?;
    assert_eq!(cleaned.count(FileAction::Delete), 3);
    for orphan in &expected {
        assert!(!out.join(orphan).exists());
    }
    Ok(())
}

/// Every file under `root`, keyed by its relative path
fn snapshot(root: &Path) -> Result<BTreeMap<PathBuf, Vec<u8>>, Box<dyn std::error::Error>> {
    let mut files = BTreeMap::new();
    for entry in WalkDir::new(root) {
        let entry = entry?;
        if entry.file_type().is_file() {
            let relative = entry.path().strip_prefix(root)?.to_path_buf();
            files.insert(relative, fs::read(entry.path())?);
        }
    }
    Ok(files)
}

#[test]
fn test_document_and_directory_forms_write_identical_trees() -> TestResult {
    let mut single = TestFixtures::new();
    let mut split = TestFixtures::new();
    let pipeline = Pipeline::default().with_probe(NoProbe);

    let mut trees = Vec::new();
    for (fixtures, kind) in [
        (&mut single, FixtureType::FleetDocument),
        (&mut split, FixtureType::FleetDirectory),
    ] {
        let input = fixtures.setup(kind)?;
        let out = fixtures.output_dir()?;
        generate(&pipeline.compile_path(&input)?, &out, WriteOptions::default())?;
        trees.push(snapshot(&out)?);
    }

    assert_eq!(trees[0].len(), 17);
    assert_eq!(trees[0], trees[1]);
    Ok(())
}

#[test]
fn test_deleted_domain_leaves_orphans() -> TestResult {
    let mut fixtures = TestFixtures::new();
    let out = fixtures.output_dir()?;
    write(&fleet_yaml(), &out, false)?;

    let lab = "  lab:\n    trust_level: disposable\n    ephemeral: true\n    machines:\n      lab-scratch: {}\n";
    assert!(fleet_yaml().contains(lab));
    let without_lab = fleet_yaml().replace(lab, "");

    let reported = write(&without_lab, &out, false)?;
    assert_eq!(
        reported.orphans,
        vec![
            PathBuf::from("inventory/lab.yml"),
            PathBuf::from("group_vars/lab.yml"),
            PathBuf::from("host_vars/lab-scratch.yml"),
        ]
    );
    assert_eq!(reported.count(FileAction::Delete), 0);

    let cleaned = write(&without_lab, &out, true)?;
    assert_eq!(cleaned.count(FileAction::Delete), 3);
    assert!(!out.join("host_vars/lab-scratch.yml").exists());
    assert!(write(&without_lab, &out, false)?.orphans.is_empty());
    Ok(())
}

#[test]
fn test_handwritten_files_are_left_alone() -> TestResult {
    let mut fixtures = TestFixtures::new();
    let out = fixtures.output_dir()?;
    fs::create_dir_all(out.join("host_vars"))?;
    fs::write(out.join("host_vars/bastion.yml"), "ansible_user: admin\n")?;

    let plan = write(&fleet_yaml(), &out, true)?;
    assert!(plan.orphans.is_empty());
    assert!(out.join("host_vars/bastion.yml").is_file());
    Ok(())
}
