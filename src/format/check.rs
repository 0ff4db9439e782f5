//! Decides whether and where a store can be migrated.

use serde::Serialize;
use tracing::debug;

use super::StoreVersion;
use crate::config::StoreConfig;
use crate::store::layout::DatabaseLayout;
use crate::store::meta::MetaDataStore;
use crate::types::{Result, StoreError};

/// Verdict of a migration check.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum MigrationOutcome {
    /// A migration from the current version to the target is allowed.
    MigrationPossible,
    /// The store is already at the target version.
    NoOperationNeeded,
    /// The current marker is unknown or the transition is not allowed.
    Unsupported,
}

/// Result of [`StoreVersionCheck::check_migration_target`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MigrationCheckResult {
    /// Verdict.
    pub outcome: MigrationOutcome,
    /// Version found on disk, when recognised.
    pub version_to_migrate_from: Option<StoreVersion>,
    /// Target version, when one could be resolved.
    pub version_to_migrate_to: Option<StoreVersion>,
    /// Explanation for `Unsupported`.
    pub reason: Option<String>,
}

impl MigrationCheckResult {
    fn unsupported(
        from: Option<StoreVersion>,
        to: Option<StoreVersion>,
        reason: String,
    ) -> Self {
        Self {
            outcome: MigrationOutcome::Unsupported,
            version_to_migrate_from: from,
            version_to_migrate_to: to,
            reason: Some(reason),
        }
    }

    /// Returns `(from, to)` for a possible migration, or the matching error.
    pub fn require_possible(&self) -> Result<(StoreVersion, StoreVersion)> {
        match (
            self.outcome,
            self.version_to_migrate_from,
            self.version_to_migrate_to,
        ) {
            (MigrationOutcome::MigrationPossible, Some(from), Some(to)) => Ok((from, to)),
            (MigrationOutcome::NoOperationNeeded, _, _) => {
                Err(StoreError::Invalid("store is already at the target version"))
            }
            _ => Err(StoreError::UnsupportedFormat(
                self.reason
                    .clone()
                    .unwrap_or_else(|| "migration not possible".to_owned()),
            )),
        }
    }
}

/// Reads a store's format marker and compares it with a target version.
pub struct StoreVersionCheck<'a> {
    layout: &'a DatabaseLayout,
    config: &'a StoreConfig,
}

impl<'a> StoreVersionCheck<'a> {
    /// Check for the store in `layout`.
    pub fn new(layout: &'a DatabaseLayout, config: &'a StoreConfig) -> Self {
        Self { layout, config }
    }

    /// Version recorded in the metadata file.
    pub fn current_store_version(&self) -> Result<StoreVersion> {
        let marker = MetaDataStore::read_format_marker(&self.layout.metadata_store())?;
        StoreVersion::from_marker(&marker)
    }

    /// Whether the current version is usable as-is under this configuration.
    pub fn is_current_store_version_fully_supported(&self) -> Result<bool> {
        let current = match self.current_store_version() {
            Ok(version) => version,
            Err(StoreError::UnsupportedFormat(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        Ok(!current.is_under_development() || self.config.include_versions_under_development)
    }

    /// Compares the current version with `target`, or with the latest
    /// version of the configured family when no target is given. Without a
    /// configured family the store's own family is used, so a current store
    /// needs no operation.
    pub fn check_migration_target(
        &self,
        target: Option<StoreVersion>,
    ) -> Result<MigrationCheckResult> {
        let marker = MetaDataStore::read_format_marker(&self.layout.metadata_store())?;
        let include_dev = self.config.include_versions_under_development;
        let from = match StoreVersion::from_marker(&marker) {
            Ok(version) => version,
            Err(_) => {
                let to = target.or_else(|| {
                    self.config
                        .format_family
                        .and_then(|family| StoreVersion::latest(family, include_dev))
                });
                return Ok(MigrationCheckResult::unsupported(
                    None,
                    to,
                    format!("unrecognised store format marker {marker:?}"),
                ));
            }
        };
        let family = self.config.format_family.unwrap_or_else(|| from.family());
        let Some(to) = target.or_else(|| StoreVersion::latest(family, include_dev)) else {
            return Ok(MigrationCheckResult::unsupported(
                Some(from),
                None,
                format!("no released version in family {family}"),
            ));
        };
        let result = if from == to {
            MigrationCheckResult {
                outcome: MigrationOutcome::NoOperationNeeded,
                version_to_migrate_from: Some(from),
                version_to_migrate_to: Some(to),
                reason: None,
            }
        } else if to.is_under_development() && !include_dev {
            MigrationCheckResult::unsupported(
                Some(from),
                Some(to),
                format!("{to} is under development"),
            )
        } else if !from.can_migrate_to(to) {
            MigrationCheckResult::unsupported(
                Some(from),
                Some(to),
                format!("migration from {from} to {to} is not supported"),
            )
        } else {
            MigrationCheckResult {
                outcome: MigrationOutcome::MigrationPossible,
                version_to_migrate_from: Some(from),
                version_to_migrate_to: Some(to),
                reason: None,
            }
        };
        debug!(
            from = from.marker(),
            to = to.marker(),
            outcome = ?result.outcome,
            "version_check.checked"
        );
        Ok(result)
    }
}
