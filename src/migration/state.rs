//! Migration progress derived from what is on disk.
//!
//! Nothing about an in-flight migration is kept in memory between calls. The
//! state is recomputed from the staging directory every time, so a fresh
//! process picks up exactly where a crashed one stopped.

use std::path::Path;

use serde::Serialize;
use tracing::debug;

use crate::format::StoreVersion;
use crate::primitives::io::TEMP_SUFFIX;
use crate::store::layout::{DatabaseLayout, DEGREES_FILE, METADATA_FILE};
use crate::store::meta::MetaDataStore;
use crate::store::records::{RecordFile, RecordKind};
use crate::types::{Result, StoreError};

/// Where a migration towards some version stands.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Serialize)]
pub enum MigrationState {
    /// Nothing staged and the target is not at the new version.
    NotStarted,
    /// The staging directory exists but holds nothing yet.
    VersionChecked,
    /// Every record file is staged.
    Rewritten,
    /// Records, counts and metadata are staged; ready for promotion.
    CountsResolved,
    /// The target already carries the new version.
    Promoted,
}

/// Derives the state of a migration to `to` from `staging` and `target`.
///
/// Staging content that fits none of the known states is reported as
/// [`StoreError::PartialMigration`].
pub fn derive_state(
    staging: &DatabaseLayout,
    target: &DatabaseLayout,
    to: StoreVersion,
) -> Result<MigrationState> {
    let state = derive(staging, target, to)?;
    debug!(
        staging = %staging.database_directory().display(),
        to = to.marker(),
        state = ?state,
        "migration.state_derived"
    );
    Ok(state)
}

fn derive(
    staging: &DatabaseLayout,
    target: &DatabaseLayout,
    to: StoreVersion,
) -> Result<MigrationState> {
    // metadata is promoted last, so a target at `to` has every staged file
    if target_is_at(target, to) {
        return Ok(MigrationState::Promoted);
    }
    let dir = staging.database_directory();
    if !dir.is_dir() {
        return Ok(MigrationState::NotStarted);
    }

    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.ends_with(TEMP_SUFFIX) {
            return Err(partial(dir, format!("unfinished write {name}")));
        }
        artifacts.push(name);
    }
    if artifacts.is_empty() {
        return Ok(MigrationState::VersionChecked);
    }

    let mut staged_records = 0;
    for kind in RecordKind::ALL {
        let path = staging.record_file(kind);
        if !path.exists() {
            continue;
        }
        RecordFile::read_expecting(&path, kind, to.record_layout())
            .map_err(|err| partial(dir, format!("staged {}: {err}", kind.file_name())))?;
        staged_records += 1;
    }
    let has_degrees = artifacts.iter().any(|name| name == DEGREES_FILE);
    let has_metadata = artifacts.iter().any(|name| name == METADATA_FILE);
    let known = staged_records + usize::from(has_degrees) + usize::from(has_metadata);
    if known != artifacts.len() {
        return Err(partial(dir, format!("unexpected files in staging: {artifacts:?}")));
    }
    if staged_records != RecordKind::ALL.len() {
        return Err(partial(
            dir,
            format!(
                "{staged_records} of {} record files staged",
                RecordKind::ALL.len()
            ),
        ));
    }
    if !has_metadata {
        return Ok(MigrationState::Rewritten);
    }
    if to.has_degrees_store() && !has_degrees {
        return Err(partial(dir, "metadata staged without degrees store".to_owned()));
    }
    let staged = MetaDataStore::read(&staging.metadata_store())
        .map_err(|err| partial(dir, format!("staged metadata: {err}")))?;
    if staged.store_version != to {
        return Err(partial(
            dir,
            format!("staged metadata is {} not {to}", staged.store_version),
        ));
    }
    Ok(MigrationState::CountsResolved)
}

fn target_is_at(target: &DatabaseLayout, to: StoreVersion) -> bool {
    MetaDataStore::read_format_marker(&target.metadata_store())
        .map(|marker| marker == to.marker())
        .unwrap_or(false)
}

fn partial(dir: &Path, detail: String) -> StoreError {
    StoreError::PartialMigration(format!("{}: {detail}", dir.display()))
}
