//! Semantic validation
//!
//! [`validate`] is pure: it reads the model and the invocation context and
//! returns every violation it finds. No check short-circuits another; the
//! operator sees the whole list in one run. The pipeline calls it once
//! before enrichment and once after.

mod addresses;
mod fields;
mod naming;
mod policy;
mod references;
mod volumes;

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::addressing::{plan_subnets, SubnetPlan};
use crate::context::CompileContext;
use crate::diagnostics::Diagnostics;
use crate::model::{InfraSpec, HOST_ENDPOINT};

/// Validate a decoded descriptor.
pub fn validate(spec: &InfraSpec, ctx: &CompileContext) -> Diagnostics {
    let diags = Validator::new(spec, ctx).run();
    debug!(
        "Validation finished: {} error(s), {} warning(s)",
        diags.error_count(),
        diags.warning_count()
    );
    diags
}

struct Validator<'a> {
    spec: &'a InfraSpec,
    ctx: &'a CompileContext,
    /// Subnets as the allocator would resolve them
    subnets: SubnetPlan,
    /// Machine name to the first domain declaring it
    owners: BTreeMap<&'a str, &'a str>,
    diags: Diagnostics,
}

impl<'a> Validator<'a> {
    fn new(spec: &'a InfraSpec, ctx: &'a CompileContext) -> Self {
        let mut owners = BTreeMap::new();
        for m in spec.machines() {
            owners.entry(m.name).or_insert(m.domain_name);
        }
        Self {
            spec,
            ctx,
            subnets: plan_subnets(spec),
            owners,
            diags: Diagnostics::new(),
        }
    }

    fn run(mut self) -> Diagnostics {
        self.check_names();
        self.check_machine_uniqueness();
        self.check_machine_fields();
        self.check_addressing_config();
        self.check_profile_references();
        self.check_network_policies();
        self.check_addresses();
        self.check_gpu_policy();
        self.check_explicit_limits();
        self.check_resources();
        self.check_ai_access();
        self.check_firewall();
        self.check_isolation();
        self.check_shared_volumes();
        self.diags
    }

    /// A policy endpoint or volume consumer: domain, machine or the host
    fn resolves(&self, name: &str, allow_host: bool) -> bool {
        (allow_host && name == HOST_ENDPOINT)
            || self.spec.domains.contains_key(name)
            || self.owners.contains_key(name)
    }
}

/// Compile a constant pattern once. A broken pattern matches nothing, which
/// makes every affected check fail loudly in tests.
fn pattern(cell: &'static OnceLock<Option<Regex>>, source: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(source).ok()).as_ref()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::decode::decode;
    use crate::loader::Document;

    /// Decode and validate an inline descriptor, decoder findings included
    pub fn check_with(yaml: &str, ctx: &CompileContext) -> Diagnostics {
        let doc = match Document::parse_str(yaml, "inline.yml") {
            Ok(doc) => doc,
            Err(e) => panic!("fixture does not load: {}", e),
        };
        let (spec, mut diags) = decode(&doc);
        diags.merge(validate(&spec, ctx));
        diags
    }

    pub fn check(yaml: &str) -> Diagnostics {
        check_with(yaml, &CompileContext::default())
    }

    /// Locations of the errors in one category
    pub fn error_locations(diags: &Diagnostics, category: crate::diagnostics::Category) -> Vec<String> {
        diags
            .errors()
            .filter(|d| d.category == category)
            .map(|d| d.location.to_string())
            .collect()
    }
}
