use std::path::PathBuf;

use thiserror::Error;

use crate::diagnostics::Diagnostics;

/// Failure to read or merge the descriptor documents.
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("{}: cannot read descriptor: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: malformed YAML: {source}", path.display())]
    Syntax {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{}: {message}", path.display())]
    Structure { path: PathBuf, message: String },

    #[error("{}: missing mandatory field '{field}'", path.display())]
    MissingField { path: PathBuf, field: &'static str },

    #[error("domain '{domain}' is declared in both {} and {}", first.display(), second.display())]
    DuplicateDomain {
        domain: String,
        first: PathBuf,
        second: PathBuf,
    },
}

/// A precondition of the enrichment pass does not hold.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnrichError {
    #[error("global.firewall_mode is 'vm' but the admin domain '{domain}' does not exist")]
    MissingAdminDomain { domain: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AllocationError {
    #[error("domain '{domain}' has no free address left in {range} for machine '{machine}'")]
    AddressSpaceExhausted {
        domain: String,
        machine: String,
        range: String,
    },

    #[error("domain '{domain}' has no resolvable subnet")]
    UnresolvedSubnet { domain: String },
}

/// Error returned by the compile pipeline, one variant per phase.
#[derive(Error, Debug)]
pub enum CompileError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Enrich(#[from] EnrichError),

    #[error("validation failed with {} error(s)", .0.error_count())]
    Invalid(Diagnostics),

    #[error(transparent)]
    Allocation(#[from] AllocationError),
}
