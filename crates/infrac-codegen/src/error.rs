//! Error types for artifact generation

use std::path::PathBuf;

use thiserror::Error;

use crate::region::RegionError;

#[derive(Error, Debug)]
pub enum WriteError {
    #[error("{}: managed region is ambiguous: {source}", path.display())]
    Region {
        path: PathBuf,
        #[source]
        source: RegionError,
    },

    #[error("cannot render {artifact}: {source}")]
    Render {
        artifact: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("domain '{domain}' has no subnet in the compiled plan")]
    MissingSubnet { domain: String },
}

impl WriteError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| WriteError::Io { path, source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_error_names_the_file() {
        let err = WriteError::Region {
            path: PathBuf::from("out/host_vars/pro-dev.yml"),
            source: RegionError::MissingEnd,
        };
        let text = err.to_string();
        assert!(text.starts_with("out/host_vars/pro-dev.yml:"));
        assert!(text.contains("END MANAGED"));
    }
}
