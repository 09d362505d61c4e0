//! Command line interface for the infrac compiler

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::info;

use infrac_codegen::{generate, WriteOptions};
use infrac_core::units::parse_size;
use infrac_core::{CompileContext, CompileError, Diagnostics, HostCapacity, Pipeline};

/// Exit status for load, enrichment and write failures
pub const FAILURE_EXIT: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "infrac")]
#[command(
    about = "Compile a declarative infrastructure descriptor into an Ansible artifact tree",
    long_about = None
)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug output
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate the descriptor and write the artifact tree
    Compile {
        /// Descriptor file or fragment directory
        path: PathBuf,

        /// Root of the artifact tree
        #[arg(short, long, env = "INFRAC_OUTPUT", default_value = ".")]
        output: PathBuf,

        /// Print the planned changes without touching the disk
        #[arg(long)]
        dry_run: bool,

        /// Delete generated files whose declaration is gone
        #[arg(long)]
        clean_orphans: bool,

        #[command(flatten)]
        context: ContextArgs,
    },

    /// Run every check and report findings without writing anything
    Validate {
        /// Descriptor file or fragment directory
        path: PathBuf,

        #[arg(long, value_enum, default_value_t = Format::Text)]
        format: Format,

        #[command(flatten)]
        context: ContextArgs,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Text,
    Json,
}

/// Where this invocation runs, supplied by the operator or the environment
#[derive(Args, Debug, Clone, Default)]
pub struct ContextArgs {
    /// Nesting level of this invocation
    #[arg(long, env = "INFRAC_NESTING_DEPTH", default_value_t = 0)]
    pub depth: u32,

    /// A virtual machine boundary isolates this invocation from the host
    #[arg(long, env = "INFRAC_VM_BOUNDARY")]
    pub vm_boundary: bool,

    /// Downgrade isolation errors to warnings
    #[arg(long, env = "INFRAC_POLICY_OVERRIDE")]
    pub policy_override: bool,

    /// Host CPU cores, skips probing
    #[arg(long, requires = "host_memory")]
    pub host_cpu: Option<u64>,

    /// Host memory such as 64GiB, skips probing
    #[arg(long, requires = "host_cpu")]
    pub host_memory: Option<String>,
}

impl ContextArgs {
    pub fn to_context(&self) -> Result<CompileContext> {
        let host = match (self.host_cpu, self.host_memory.as_deref()) {
            (Some(0), _) => bail!("--host-cpu must be at least 1"),
            (Some(cpu_cores), Some(memory)) => Some(HostCapacity {
                cpu_cores,
                memory_bytes: parse_size(memory)
                    .with_context(|| format!("invalid --host-memory '{}'", memory))?,
            }),
            (None, None) => None,
            _ => bail!("--host-cpu and --host-memory must be given together"),
        };
        Ok(CompileContext {
            depth: self.depth,
            vm_boundary: self.vm_boundary,
            policy_override: self.policy_override,
            host,
        })
    }
}

/// Result of a command that ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The descriptor has validation errors
    Invalid,
}

impl Outcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Outcome::Success => 0,
            Outcome::Invalid => 1,
        }
    }
}

pub fn run(cli: Cli) -> Result<Outcome> {
    match cli.command {
        Commands::Compile {
            path,
            output,
            dry_run,
            clean_orphans,
            context,
        } => handle_compile(
            &path,
            &output,
            WriteOptions {
                dry_run,
                clean_orphans,
            },
            &context,
        ),
        Commands::Validate {
            path,
            format,
            context,
        } => handle_validate(&path, format, &context),
    }
}

pub fn handle_compile(
    path: &Path,
    output: &Path,
    options: WriteOptions,
    context: &ContextArgs,
) -> Result<Outcome> {
    let pipeline = Pipeline::new(context.to_context()?);
    let compilation = match pipeline.compile_path(path) {
        Ok(compilation) => compilation,
        Err(CompileError::Invalid(diagnostics)) => {
            report(&diagnostics);
            return Ok(Outcome::Invalid);
        }
        Err(e) => return Err(e).with_context(|| format!("failed to compile {}", path.display())),
    };
    report(&compilation.warnings);

    let plan = generate(&compilation, output, options)
        .with_context(|| format!("failed to write artifacts under {}", output.display()))?;

    if options.dry_run {
        for file in plan.changes() {
            println!("{} {}", file.action, output.join(&file.path).display());
        }
    }
    if !options.clean_orphans {
        for orphan in &plan.orphans {
            eprintln!("orphan: {}", output.join(orphan).display());
        }
    }

    info!(
        "Compiled {} domain(s) into {} ({} change(s))",
        compilation.spec.enabled_domains().count(),
        output.display(),
        plan.changes().count()
    );
    Ok(Outcome::Success)
}

pub fn handle_validate(path: &Path, format: Format, context: &ContextArgs) -> Result<Outcome> {
    let pipeline = Pipeline::new(context.to_context()?);
    let diagnostics = pipeline
        .check_path(path)
        .with_context(|| format!("failed to check {}", path.display()))?;

    match format {
        Format::Text if diagnostics.is_empty() => println!("{}: valid", path.display()),
        Format::Text => report(&diagnostics),
        Format::Json => println!(
            "{}",
            serde_json::to_string_pretty(&diagnostics).context("failed to encode diagnostics")?
        ),
    }

    Ok(if diagnostics.has_errors() {
        Outcome::Invalid
    } else {
        Outcome::Success
    })
}

/// Diagnostics go to stderr, one per line
fn report(diagnostics: &Diagnostics) {
    if !diagnostics.is_empty() {
        eprintln!("{}", diagnostics.format_compact());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infrac_core::units::GIB;

    #[test]
    fn test_context_flags() -> Result<()> {
        let cli = Cli::try_parse_from([
            "infrac",
            "validate",
            "infra.yml",
            "--depth",
            "2",
            "--vm-boundary",
            "--host-cpu",
            "8",
            "--host-memory",
            "32GiB",
        ])?;
        let Commands::Validate { context, format, .. } = cli.command else {
            bail!("expected validate");
        };
        assert_eq!(format, Format::Text);

        let ctx = context.to_context()?;
        assert_eq!(ctx.depth, 2);
        assert!(ctx.vm_boundary);
        assert!(!ctx.policy_override);
        assert_eq!(
            ctx.host,
            Some(HostCapacity {
                cpu_cores: 8,
                memory_bytes: 32 * GIB
            })
        );
        Ok(())
    }

    #[test]
    fn test_host_flags_go_together() {
        assert!(Cli::try_parse_from(["infrac", "validate", "x", "--host-cpu", "4"]).is_err());

        let args = ContextArgs {
            host_cpu: Some(4),
            host_memory: Some("lots".to_string()),
            ..ContextArgs::default()
        };
        assert!(args.to_context().is_err());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(Outcome::Success.exit_code(), 0);
        assert_eq!(Outcome::Invalid.exit_code(), 1);
        assert_eq!(FAILURE_EXIT, 2);
    }
}
