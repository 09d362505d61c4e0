//! Phase orchestration
//!
//! load → decode → validate → enrich → validate → allocate. Every phase
//! completes before the next starts and nothing here touches the output
//! tree; writing belongs to the codegen crate.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::addressing::{self, SubnetPlan};
use crate::context::{CompileContext, HostProbe, ProcProbe};
use crate::decode::decode;
use crate::diagnostics::{Category, Diagnostics, Location};
use crate::enrich::{enrich, preconditions, Synthesized};
use crate::error::CompileError;
use crate::loader::{self, Document};
use crate::model::InfraSpec;
use crate::resources::{self, ResourcePlan};
use crate::units::MIB;
use crate::validate::validate;

/// Fully validated and allocated model, ready to render
#[derive(Debug, Clone)]
pub struct Compilation {
    pub spec: InfraSpec,
    pub subnets: SubnetPlan,
    pub resources: Option<ResourcePlan>,
    /// Non-blocking findings from both validation passes
    pub warnings: Diagnostics,
    pub synthesized: Vec<Synthesized>,
    /// Context the run used, host capacity included when it was probed
    pub context: CompileContext,
    pub sources: Vec<PathBuf>,
}

/// Result of the checking phases, before allocation
struct Checked {
    spec: InfraSpec,
    context: CompileContext,
    diagnostics: Diagnostics,
    synthesized: Vec<Synthesized>,
}

pub struct Pipeline {
    context: CompileContext,
    probe: Box<dyn HostProbe>,
}

impl Pipeline {
    pub fn new(context: CompileContext) -> Self {
        Self {
            context,
            probe: Box::new(ProcProbe::default()),
        }
    }

    /// Replace the host probe used when the context carries no capacity.
    pub fn with_probe(mut self, probe: impl HostProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn context(&self) -> &CompileContext {
        &self.context
    }

    pub fn compile_path(&self, path: &Path) -> Result<Compilation, CompileError> {
        let document = loader::load(path)?;
        self.compile_document(&document)
    }

    pub fn compile_str(&self, content: &str, origin: &str) -> Result<Compilation, CompileError> {
        let document = Document::parse_str(content, origin)?;
        self.compile_document(&document)
    }

    pub fn compile_document(&self, document: &Document) -> Result<Compilation, CompileError> {
        let Checked {
            mut spec,
            context,
            diagnostics,
            synthesized,
        } = self.check(document)?;
        if diagnostics.has_errors() {
            return Err(CompileError::Invalid(diagnostics));
        }

        let subnets = addressing::plan_subnets(&spec);
        let assigned = addressing::apply(&mut spec, &subnets)?;
        info!("Assigned {} address(es)", assigned);

        let resources = match (spec.global.resource_policy.clone(), context.host) {
            (Some(policy), Some(host)) => {
                let plan = resources::plan(&spec, &policy, host);
                let touched = resources::apply(&mut spec, &plan, &policy);
                info!(
                    "Distributed {} cores and {}MiB across {} machine(s)",
                    plan.cpu.budget / 1000,
                    plan.memory.budget / MIB,
                    touched
                );
                Some(plan)
            }
            _ => None,
        };

        Ok(Compilation {
            spec,
            subnets,
            resources,
            warnings: diagnostics,
            synthesized,
            context,
            sources: document.sources.clone(),
        })
    }

    /// Run every check without allocating, for the `validate` command.
    ///
    /// Validation findings are returned, not raised; only load and
    /// enrichment failures are errors.
    pub fn check_path(&self, path: &Path) -> Result<Diagnostics, CompileError> {
        let document = loader::load(path)?;
        Ok(self.check(&document)?.diagnostics)
    }

    fn check(&self, document: &Document) -> Result<Checked, CompileError> {
        let (mut spec, mut diagnostics) = decode(document);
        let context = self.resolve_context(&spec, &mut diagnostics);
        preconditions(&spec)?;

        let first = validate(&spec, &context);
        if first.has_errors() {
            info!(
                "First validation pass found {} error(s), skipping enrichment",
                first.error_count()
            );
            diagnostics.merge(first);
            return Ok(Checked {
                spec,
                context,
                diagnostics,
                synthesized: Vec::new(),
            });
        }

        let synthesized = enrich(&mut spec)?;
        // The second pass sees the final model and supersedes the first
        if synthesized.is_empty() {
            diagnostics.merge(first);
        } else {
            diagnostics.merge(validate(&spec, &context));
        }

        info!(
            "Validated {} domain(s): {} error(s), {} warning(s)",
            spec.domains.len(),
            diagnostics.error_count(),
            diagnostics.warning_count()
        );
        Ok(Checked {
            spec,
            context,
            diagnostics,
            synthesized,
        })
    }

    /// Fill in host capacity when a resource policy needs it.
    fn resolve_context(&self, spec: &InfraSpec, diagnostics: &mut Diagnostics) -> CompileContext {
        let mut context = self.context.clone();
        if spec.global.resource_policy.is_none() || context.host.is_some() {
            return context;
        }
        context.host = self.probe.probe();
        match context.host {
            Some(host) => info!(
                "Detected host capacity: {} cores, {}MiB",
                host.cpu_cores,
                host.memory_bytes / MIB
            ),
            None => {
                warn!("Host capacity unknown, resource allocation skipped");
                diagnostics.warning(
                    Category::Resource,
                    Location::global("resource_policy"),
                    "host capacity could not be determined, resource limits are not generated",
                );
            }
        }
        context
    }
}

impl Default for Pipeline {
    fn default() -> Self {
        Self::new(CompileContext::default())
    }
}
