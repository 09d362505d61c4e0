//! Descriptor model, validation and allocation for the infrac compiler

pub mod addressing;
pub mod context;
pub mod decode;
pub mod diagnostics;
pub mod enrich;
pub mod error;
pub mod loader;
pub mod model;
pub mod pipeline;
pub mod resources;
pub mod units;
pub mod validate;

pub use addressing::{Subnet, SubnetPlan};
pub use context::{CompileContext, HostCapacity, HostProbe, NoProbe, ProcProbe};
pub use diagnostics::{Category, Diagnostic, Diagnostics, Location, Severity};
pub use error::{AllocationError, CompileError, EnrichError, LoadError};
pub use model::{Domain, InfraSpec, Machine, MachineKind, TrustLevel};
pub use pipeline::{Compilation, Pipeline};
pub use validate::validate;
