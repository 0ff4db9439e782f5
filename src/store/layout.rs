//! File layout of a database directory.

use std::path::{Path, PathBuf};

use super::records::RecordKind;
use crate::format::StoreVersion;

/// Name of the staging directory created inside the database directory.
pub const MIGRATION_DIRECTORY: &str = "upgrade_working_dir";
/// Metadata file name.
pub const METADATA_FILE: &str = "metadata.db";
/// Degrees store file name.
pub const DEGREES_FILE: &str = "relationship_group_degrees.db";

/// Resolves the paths of every file belonging to one database.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatabaseLayout {
    dir: PathBuf,
}

impl DatabaseLayout {
    /// Layout rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Database directory.
    pub fn database_directory(&self) -> &Path {
        &self.dir
    }

    /// Name of the database, taken from its directory.
    pub fn database_name(&self) -> String {
        self.dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Metadata file.
    pub fn metadata_store(&self) -> PathBuf {
        self.dir.join(METADATA_FILE)
    }

    /// Record file of `kind`.
    pub fn record_file(&self, kind: RecordKind) -> PathBuf {
        self.dir.join(kind.file_name())
    }

    /// Relationship-group degrees store.
    pub fn relationship_group_degrees_store(&self) -> PathBuf {
        self.dir.join(DEGREES_FILE)
    }

    /// Directory holding the transaction logs.
    pub fn transaction_logs_directory(&self) -> &Path {
        &self.dir
    }

    /// Staging layout used while migrating this database.
    pub fn migration_layout(&self) -> DatabaseLayout {
        DatabaseLayout::new(self.dir.join(MIGRATION_DIRECTORY))
    }

    /// Files other than metadata that make up a store of `version`.
    pub fn data_files(&self, version: StoreVersion) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = RecordKind::ALL
            .iter()
            .map(|kind| self.record_file(*kind))
            .collect();
        if version.has_degrees_store() {
            files.push(self.relationship_group_degrees_store());
        }
        files
    }
}
