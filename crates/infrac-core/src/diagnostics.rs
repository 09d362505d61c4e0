//! Diagnostics and batch reporting
//!
//! Every semantic check pushes into a [`Diagnostics`] batch instead of
//! returning early, so one run reports every violation. Each entry carries
//! a [`Location`] written as a dotted path into the descriptor
//! (`domains.pro.machines.pro-dev.ip`) so the operator can find it without
//! extra tooling.

use std::fmt;

use serde::Serialize;

/// Dotted path to the offending declaration
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Location {
    path: String,
}

impl Location {
    pub fn root() -> Self {
        Self::default()
    }

    pub fn global(field: &str) -> Self {
        Self::root().in_field("global").in_field(field)
    }

    pub fn domain(name: &str) -> Self {
        Self::root().in_field("domains").in_field(name)
    }

    pub fn machine(domain: &str, machine: &str) -> Self {
        Self::domain(domain).in_field("machines").in_field(machine)
    }

    pub fn policy(index: usize) -> Self {
        Self::root().in_field("network_policies").at_index(index)
    }

    pub fn volume(name: &str) -> Self {
        Self::root().in_field("shared_volumes").in_field(name)
    }

    pub fn in_field(mut self, field: impl AsRef<str>) -> Self {
        if !self.path.is_empty() {
            self.path.push('.');
        }
        self.path.push_str(field.as_ref());
        self
    }

    pub fn at_index(mut self, index: usize) -> Self {
        self.path.push_str(&format!("[{}]", index));
        self
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "<root>")
        } else {
            write!(f, "{}", self.path)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

/// Category of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Wrong scalar type, unknown enum variant, unknown key
    Schema,
    /// Name does not match the allowed charset
    Naming,
    /// Duplicate name
    Uniqueness,
    /// Reference to an unknown profile, domain or machine
    Reference,
    /// Out-of-subnet, duplicate or reserved address
    Address,
    Gpu,
    Resource,
    AiAccess,
    SharedVolume,
    Storage,
    Schedule,
    /// Privileged containers without an isolation boundary
    Isolation,
    Firewall,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Category::Schema => "SCHEMA",
            Category::Naming => "NAMING",
            Category::Uniqueness => "UNIQUENESS",
            Category::Reference => "REFERENCE",
            Category::Address => "ADDRESS",
            Category::Gpu => "GPU",
            Category::Resource => "RESOURCE",
            Category::AiAccess => "AI_ACCESS",
            Category::SharedVolume => "SHARED_VOLUME",
            Category::Storage => "STORAGE",
            Category::Schedule => "SCHEDULE",
            Category::Isolation => "ISOLATION",
            Category::Firewall => "FIREWALL",
        };
        write!(f, "{}", label)
    }
}

/// A single error or warning
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub category: Category,
    pub location: Location,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.category, self.location, self.message)
    }
}

/// Batch collector for errors and warnings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error(&mut self, category: Category, location: Location, message: impl Into<String>) {
        self.entries.push(Diagnostic {
            severity: Severity::Error,
            category,
            location,
            message: message.into(),
        });
    }

    pub fn warning(&mut self, category: Category, location: Location, message: impl Into<String>) {
        self.entries.push(Diagnostic {
            severity: Severity::Warning,
            category,
            location,
            message: message.into(),
        });
    }

    pub fn has_errors(&self) -> bool {
        self.entries.iter().any(|d| d.severity == Severity::Error)
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }

    pub fn warning_count(&self) -> usize {
        self.warnings().count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries
            .iter()
            .filter(|d| d.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Diagnostic> {
        self.entries
            .iter()
            .filter(|d| d.severity == Severity::Warning)
    }

    pub fn by_category(&self, category: Category) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.category == category)
    }

    /// Append another batch, dropping entries already present.
    pub fn merge(&mut self, other: Diagnostics) {
        for entry in other.entries {
            if !self.entries.contains(&entry) {
                self.entries.push(entry);
            }
        }
    }

    /// One line per entry, errors first
    pub fn format_compact(&self) -> String {
        self.errors()
            .map(|d| format!("error: {}", d))
            .chain(self.warnings().map(|d| format!("warning: {}", d)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.format_compact())
    }
}
