//! Store configuration loaded from TOML.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::format::FormatFamily;

/// Settings that shape version checks, migration and rebuilds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    /// Allow migrating to versions that are still under development.
    pub include_versions_under_development: bool,
    /// Family whose latest version is the default migration target. When
    /// unset, a store stays within the family it is already in.
    pub format_family: Option<FormatFamily>,
    /// Worker threads for record rewrites; 0 or 1 runs sequentially.
    pub rewrite_threads: usize,
    /// Upper bound on memory used while rebuilding degrees.
    pub rebuild_memory_limit_bytes: Option<u64>,
    /// Sync files and directories while staging and promoting.
    pub fsync: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            include_versions_under_development: false,
            format_family: None,
            rewrite_threads: 1,
            rebuild_memory_limit_bytes: None,
            fsync: true,
        }
    }
}

impl StoreConfig {
    /// Parses a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse { source })
    }

    /// Reads and parses the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::ParseFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Failures while loading a [`StoreConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read store config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The document is not a valid configuration.
    #[error("failed to parse store config: {source}")]
    Parse {
        /// Underlying error.
        source: toml::de::Error,
    },
    /// The file is not a valid configuration.
    #[error("failed to parse store config {path}: {source}")]
    ParseFile {
        /// File that was parsed.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
}
