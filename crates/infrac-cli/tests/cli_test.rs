use std::fs;
use std::path::Path;

use anyhow::Result;
use clap::Parser;
use infrac::{run, Cli, Outcome};
use infrac_test_fixtures::{two_gpu_yaml, FixtureType, TestFixtures};
use pretty_assertions::assert_eq;

fn invoke(args: &[&str]) -> Result<Outcome> {
    let mut argv = vec!["infrac"];
    argv.extend_from_slice(args);
    run(Cli::try_parse_from(argv)?)
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

#[test]
fn test_compile_writes_the_tree() -> Result<()> {
    let mut fixtures = TestFixtures::new();
    let input = path_arg(&fixtures.setup(FixtureType::FleetDirectory)?);
    let out = fixtures.output_dir()?;

    let outcome = invoke(&["compile", &input, "--output", &path_arg(&out)])?;
    assert_eq!(outcome, Outcome::Success);
    for file in [
        "inventory/pro.yml",
        "group_vars/pro.yml",
        "group_vars/all.yml",
        "host_vars/ai-llm.yml",
    ] {
        assert!(out.join(file).is_file(), "{} missing", file);
    }
    assert!(!out.join("inventory/old.yml").exists());
    Ok(())
}

#[test]
fn test_dry_run_leaves_output_empty() -> Result<()> {
    let mut fixtures = TestFixtures::new();
    let input = path_arg(&fixtures.setup(FixtureType::FleetDocument)?);
    let out = fixtures.output_dir()?;

    let outcome = invoke(&["compile", &input, "-o", &path_arg(&out), "--dry-run"])?;
    assert_eq!(outcome, Outcome::Success);
    assert_eq!(fs::read_dir(&out)?.count(), 0);
    Ok(())
}

#[test]
fn test_validation_errors_write_nothing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("infra.yml");
    fs::write(&input, two_gpu_yaml("exclusive"))?;
    let out = dir.path().join("out");

    let outcome = invoke(&["compile", &path_arg(&input), "-o", &path_arg(&out)])?;
    assert_eq!(outcome, Outcome::Invalid);
    assert!(!out.exists());

    let outcome = invoke(&["validate", &path_arg(&input), "--format", "json"])?;
    assert_eq!(outcome, Outcome::Invalid);
    Ok(())
}

#[test]
fn test_shared_gpu_validates_with_a_warning_only() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("infra.yml");
    fs::write(&input, two_gpu_yaml("shared"))?;

    assert_eq!(invoke(&["validate", &path_arg(&input)])?, Outcome::Success);
    Ok(())
}

#[test]
fn test_missing_descriptor_is_a_failure() {
    let result = invoke(&["validate", "/nonexistent/infra.yml"]);
    assert!(result.is_err());
}

#[test]
fn test_privileged_container_needs_a_boundary() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let input = dir.path().join("infra.yml");
    fs::write(
        &input,
        r#"project_name: nested
domains:
  lab:
    machines:
      lab-docker:
        config:
          security.privileged: "true"
"#,
    )?;
    let input = path_arg(&input);

    assert_eq!(invoke(&["validate", &input])?, Outcome::Invalid);
    assert_eq!(
        invoke(&["validate", &input, "--policy-override"])?,
        Outcome::Success
    );
    assert_eq!(
        invoke(&["validate", &input, "--vm-boundary"])?,
        Outcome::Success
    );
    Ok(())
}
