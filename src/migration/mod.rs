//! Offline migration of a store to another format version.
//!
//! A migration stages the converted store in
//! [`MIGRATION_DIRECTORY`](crate::store::MIGRATION_DIRECTORY) inside the
//! database directory and then promotes it over the original files:
//!
//! 1. record files are rewritten (or carried over when the record layout is
//!    unchanged) into staging;
//! 2. the degrees store is copied and started against the transaction the log
//!    tail says is committed, rebuilding only when its checkpoint disagrees;
//! 3. metadata for the new version is staged last and marks the staging area
//!    complete;
//! 4. [`StoreMigrator::move_migrated_files`] copies every staged file over
//!    the target, metadata last, and removes the staging directory.
//!
//! Every entry point re-derives progress from disk (see [`state`]), so both
//! steps can be repeated or resumed by a different process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::degrees::{
    DegreesRebuilder, DegreesStoreOptions, LogReplayRebuilder, RelationshipGroupDegreesStore,
    StartOutcome,
};
use crate::format::StoreVersion;
use crate::log::tail::LogTailMetadata;
use crate::primitives::io::{copy_file_atomic, sync_dir};
use crate::primitives::memory::MemoryTracker;
use crate::store::layout::DatabaseLayout;
use crate::store::meta::{MetaData, MetaDataStore, StoreId, StoreIdentity};
use crate::types::{Result, StoreError, TxId};

pub mod progress;
pub mod rewrite;
pub mod state;
pub mod upgrader;

pub use progress::{
    LoggingListener, MigrationProgressMonitor, ProgressListener, SectionHandle, SilentListener,
};
pub use rewrite::{
    carry_over_record_files, BatchRewrite, IndexImporterHook, NoIndexImport, RecordFileRewriter,
    RewriteSummary,
};
pub use state::{derive_state, MigrationState};
pub use upgrader::{StoreUpgrader, UpgradeOutcome};

const PROMOTED_SUFFIX: &str = ".promoted";
const MIGRATION_STEPS: u64 = 3;

/// Builds the rebuilder used when the staged degrees store must be rebuilt,
/// given the source layout and the transaction the counts must reflect.
pub type RebuilderFactory =
    Arc<dyn Fn(&DatabaseLayout, TxId) -> Box<dyn DegreesRebuilder> + Send + Sync>;

/// Identity changes a migration is allowed to make.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct IdentityOverride {
    /// New database UUID.
    pub database_uuid: Option<Uuid>,
    /// Generate a fresh internal store id.
    pub reset_store_id: bool,
}

impl IdentityOverride {
    fn apply(&self, identity: StoreIdentity) -> StoreIdentity {
        StoreIdentity {
            store_id: if self.reset_store_id {
                StoreId::generate()
            } else {
                identity.store_id
            },
            database_uuid: self.database_uuid.unwrap_or(identity.database_uuid),
            external_store_id: identity.external_store_id,
        }
    }
}

/// Summary of one [`StoreMigrator::migrate`] call.
#[derive(Clone, Debug, Serialize)]
pub struct MigrationReport {
    /// Source version.
    pub from: StoreVersion,
    /// Target version.
    pub to: StoreVersion,
    /// State found on disk when the call started.
    pub resumed_from: MigrationState,
    /// Record rewrite totals; `None` when records were already staged.
    pub records: Option<RewriteSummary>,
    /// Whether record files were copied instead of rewritten.
    pub records_carried_over: bool,
    /// How the staged degrees store came up; `None` when not touched.
    pub degrees: Option<StartOutcome>,
    /// Transaction the staged store reflects.
    pub last_committed_tx: TxId,
    /// Checkpoint log version written to the staged metadata.
    pub checkpoint_log_version: u64,
    /// Identity written to the staged metadata.
    pub identity: StoreIdentity,
    /// Peak bytes charged to the rebuild memory tracker.
    pub peak_memory_bytes: u64,
    /// Wall time of the call.
    pub duration_ms: f64,
}

impl MigrationReport {
    /// Pretty JSON rendering for operators.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| StoreError::InvalidOwned(format!("report serialization: {e}")))
    }
}

/// Summary of one [`StoreMigrator::move_migrated_files`] call.
#[derive(Clone, Debug, Serialize)]
pub struct PromotionReport {
    /// Source version.
    pub from: StoreVersion,
    /// Target version.
    pub to: StoreVersion,
    /// Files copied over the target, metadata included.
    pub files_promoted: usize,
    /// Bytes copied.
    pub bytes_promoted: u64,
    /// The target was already promoted; nothing was done.
    pub already_promoted: bool,
}

/// Orchestrates staging and promotion of a store migration.
pub struct StoreMigrator {
    config: StoreConfig,
    rewriter: Arc<dyn BatchRewrite>,
    rebuilder_factory: RebuilderFactory,
    identity_override: IdentityOverride,
    memory: MemoryTracker,
}

impl StoreMigrator {
    /// Migrator using the record file rewriter and log replay for degrees.
    pub fn new(config: StoreConfig) -> Self {
        let rewriter = Arc::new(RecordFileRewriter::new(config.rewrite_threads, config.fsync));
        let memory = MemoryTracker::from_limit(config.rebuild_memory_limit_bytes);
        Self {
            config,
            rewriter,
            rebuilder_factory: Arc::new(|layout: &DatabaseLayout, tx: TxId| {
                Box::new(LogReplayRebuilder::new(layout.clone(), tx)) as Box<dyn DegreesRebuilder>
            }),
            identity_override: IdentityOverride::default(),
            memory,
        }
    }

    /// Replaces the batch rewrite collaborator.
    pub fn with_rewriter(mut self, rewriter: Arc<dyn BatchRewrite>) -> Self {
        self.rewriter = rewriter;
        self
    }

    /// Replaces how degrees rebuilders are built.
    pub fn with_rebuilder_factory(mut self, factory: RebuilderFactory) -> Self {
        self.rebuilder_factory = factory;
        self
    }

    /// Allows the given identity changes.
    pub fn with_identity_override(mut self, identity_override: IdentityOverride) -> Self {
        self.identity_override = identity_override;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// See [`state::derive_state`].
    pub fn derive_state(
        staging: &DatabaseLayout,
        target: &DatabaseLayout,
        to: StoreVersion,
    ) -> Result<MigrationState> {
        derive_state(staging, target, to)
    }

    /// Stages `source` converted to `to` in `staging`.
    ///
    /// The source is only read. Work already present in `staging` is
    /// verified and skipped; a staging area in no recognisable state fails
    /// with [`StoreError::PartialMigration`]. A log tail that still needs
    /// recovery is refused before anything is staged.
    #[allow(clippy::too_many_arguments)]
    pub fn migrate(
        &self,
        source: &DatabaseLayout,
        staging: &DatabaseLayout,
        section: &mut SectionHandle,
        from: StoreVersion,
        to: StoreVersion,
        index_importer: &dyn IndexImporterHook,
        log_tail: &LogTailMetadata,
    ) -> Result<MigrationReport> {
        let started = Instant::now();
        if from == to {
            return Err(StoreError::InvalidOwned(format!(
                "store is already at {to}; nothing to migrate"
            )));
        }
        if !from.can_migrate_to(to) {
            return Err(StoreError::UnsupportedFormat(format!(
                "migration from {from} to {to} is not supported"
            )));
        }

        let resumed_from = derive_state(staging, source, to)?;
        if resumed_from == MigrationState::Promoted {
            info!(to = to.marker(), "migration.already_promoted");
            let current = MetaDataStore::read(&source.metadata_store())?;
            return Ok(self.report(
                from,
                to,
                resumed_from,
                None,
                false,
                None,
                &current,
                started,
            ));
        }

        if log_tail.recovery_required {
            return Err(StoreError::InvalidOwned(format!(
                "transaction log of {} needs recovery before migrating to {to}",
                source.database_directory().display()
            )));
        }
        let source_meta = MetaDataStore::read(&source.metadata_store())?;
        if source_meta.store_version != from {
            return Err(StoreError::InvalidOwned(format!(
                "source store is {} but migration expects {from}",
                source_meta.store_version
            )));
        }
        info!(
            source = %source.database_directory().display(),
            from = from.marker(),
            to = to.marker(),
            state = ?resumed_from,
            "migration.started"
        );
        section.start(MIGRATION_STEPS);

        let mut state = resumed_from;
        let mut records = None;
        let carried_over = !from.requires_record_rewrite(to);
        if matches!(
            state,
            MigrationState::NotStarted | MigrationState::VersionChecked
        ) {
            std::fs::create_dir_all(staging.database_directory())?;
            section.phase("records");
            let summary = if carried_over {
                carry_over_record_files(source, staging, from, self.config.fsync)?
            } else {
                self.rewriter
                    .rewrite(source, staging, from, to, index_importer)?
            };
            debug!(
                files = summary.files,
                records = summary.records,
                carried_over,
                "migration.records_staged"
            );
            records = Some(summary);
            state = derive_state(staging, source, to)?;
            if state != MigrationState::Rewritten {
                return Err(StoreError::PartialMigration(format!(
                    "record rewrite left staging in state {state:?}"
                )));
            }
        } else {
            debug!(state = ?state, "migration.records_already_staged");
        }
        section.progress(1);

        let needed_tx = if log_tail.is_empty() {
            source_meta.last_committed_tx
        } else {
            log_tail.last_committed_tx
        };
        if state == MigrationState::CountsResolved {
            let staged = MetaDataStore::read(&staging.metadata_store())?;
            if staged.last_committed_tx == needed_tx {
                debug!(tx = needed_tx.0, "migration.staging_complete");
                section.progress(2);
                section.completed();
                return Ok(self.report(
                    from,
                    to,
                    resumed_from,
                    records,
                    carried_over,
                    None,
                    &staged,
                    started,
                ));
            }
            warn!(
                staged = staged.last_committed_tx.0,
                needed = needed_tx.0,
                "migration.staged_metadata_stale"
            );
        }

        section.phase("counts");
        let degrees = if to.has_degrees_store() {
            Some(self.stage_degrees(source, staging, from, needed_tx)?)
        } else {
            None
        };
        section.progress(1);

        section.phase("metadata");
        let staged = MetaData {
            store_version: to,
            identity: self.identity_override.apply(source_meta.identity),
            last_committed_tx: needed_tx,
            checkpoint_log_version: Some(source_meta.checkpoint_log_version.unwrap_or(0)),
        };
        MetaDataStore::write(&staging.metadata_store(), &staged, self.config.fsync)?;
        section.progress(1);
        section.completed();
        info!(
            to = to.marker(),
            last_committed = needed_tx.0,
            "migration.staged"
        );
        Ok(self.report(
            from,
            to,
            resumed_from,
            records,
            carried_over,
            degrees,
            &staged,
            started,
        ))
    }

    fn stage_degrees(
        &self,
        source: &DatabaseLayout,
        staging: &DatabaseLayout,
        from: StoreVersion,
        needed_tx: TxId,
    ) -> Result<StartOutcome> {
        let staged_path = staging.relationship_group_degrees_store();
        let source_path = source.relationship_group_degrees_store();
        if !staged_path.exists() && from.has_degrees_store() && source_path.exists() {
            copy_file_atomic(&source_path, &staged_path, self.config.fsync)?;
        }
        let store = RelationshipGroupDegreesStore::open(
            &staged_path,
            (self.rebuilder_factory)(source, needed_tx),
            DegreesStoreOptions {
                fsync: self.config.fsync,
            },
        )?;
        let outcome = store.start(&self.memory)?;
        info!(outcome = ?outcome, tx = store.tx_id().0, "migration.degrees_resolved");
        Ok(outcome)
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        from: StoreVersion,
        to: StoreVersion,
        resumed_from: MigrationState,
        records: Option<RewriteSummary>,
        records_carried_over: bool,
        degrees: Option<StartOutcome>,
        meta: &MetaData,
        started: Instant,
    ) -> MigrationReport {
        MigrationReport {
            from,
            to,
            resumed_from,
            records,
            records_carried_over,
            degrees,
            last_committed_tx: meta.last_committed_tx,
            checkpoint_log_version: meta.checkpoint_log_version.unwrap_or(0),
            identity: meta.identity,
            peak_memory_bytes: self.memory.peak(),
            duration_ms: started.elapsed().as_secs_f64() * 1_000.0,
        }
    }

    /// Copies a completely staged migration over `target` and removes the
    /// staging directory.
    ///
    /// Metadata is promoted last, so a crash leaves the target at the old
    /// version with the staging area intact and a later call completes the
    /// promotion. Calling this again after success does nothing.
    pub fn move_migrated_files(
        &self,
        staging: &DatabaseLayout,
        target: &DatabaseLayout,
        from: StoreVersion,
        to: StoreVersion,
    ) -> Result<PromotionReport> {
        let state = derive_state(staging, target, to)?;
        match state {
            MigrationState::Promoted => {
                if staging.database_directory().exists() {
                    warn!(to = to.marker(), "migration.finishing_promotion_cleanup");
                    retire_staging(staging)?;
                } else {
                    remove_leftover(&promoted_path(staging))?;
                }
                debug!(to = to.marker(), "migration.promotion_skipped");
                return Ok(PromotionReport {
                    from,
                    to,
                    files_promoted: 0,
                    bytes_promoted: 0,
                    already_promoted: true,
                });
            }
            MigrationState::CountsResolved => {}
            other => {
                return Err(StoreError::PartialMigration(format!(
                    "cannot promote staging in state {other:?}"
                )));
            }
        }

        let staged = MetaDataStore::read(&staging.metadata_store())?;
        let current = MetaDataStore::read(&target.metadata_store())?;
        if current.store_version != from && current.store_version != to {
            return Err(StoreError::InvalidOwned(format!(
                "target store is {} but promotion expects {from}",
                current.store_version
            )));
        }
        self.verify_identity(&current.identity, &staged.identity)?;

        let fsync = self.config.fsync;
        let mut files_promoted = 0;
        let mut bytes_promoted = 0;
        for (src, dst) in staging
            .data_files(to)
            .into_iter()
            .zip(target.data_files(to))
        {
            bytes_promoted += copy_file_atomic(&src, &dst, fsync)?;
            files_promoted += 1;
        }
        bytes_promoted += copy_file_atomic(&staging.metadata_store(), &target.metadata_store(), fsync)?;
        files_promoted += 1;
        if fsync {
            sync_dir(target.database_directory())?;
        }

        retire_staging(staging)?;
        if fsync {
            sync_dir(target.database_directory())?;
        }
        info!(
            target = %target.database_directory().display(),
            from = from.marker(),
            to = to.marker(),
            files = files_promoted,
            "migration.promoted"
        );
        Ok(PromotionReport {
            from,
            to,
            files_promoted,
            bytes_promoted,
            already_promoted: false,
        })
    }

    fn verify_identity(&self, before: &StoreIdentity, after: &StoreIdentity) -> Result<()> {
        if before.external_store_id != after.external_store_id {
            return Err(StoreError::IdentityMismatch {
                field: "external_store_id",
                before: before.external_store_id.to_string(),
                after: after.external_store_id.to_string(),
            });
        }
        if before.store_id != after.store_id && !self.identity_override.reset_store_id {
            return Err(StoreError::IdentityMismatch {
                field: "store_id",
                before: before.store_id.to_string(),
                after: after.store_id.to_string(),
            });
        }
        if before.database_uuid != after.database_uuid
            && self.identity_override.database_uuid != Some(after.database_uuid)
        {
            return Err(StoreError::IdentityMismatch {
                field: "database_uuid",
                before: before.database_uuid.to_string(),
                after: after.database_uuid.to_string(),
            });
        }
        Ok(())
    }
}

fn promoted_path(staging: &DatabaseLayout) -> PathBuf {
    let mut name = staging.database_directory().as_os_str().to_os_string();
    name.push(PROMOTED_SUFFIX);
    PathBuf::from(name)
}

/// Moves staging to `<staging>.promoted`, then deletes it.
fn retire_staging(staging: &DatabaseLayout) -> Result<()> {
    let retired = promoted_path(staging);
    remove_leftover(&retired)?;
    std::fs::rename(staging.database_directory(), &retired)?;
    std::fs::remove_dir_all(&retired)?;
    Ok(())
}

fn remove_leftover(path: &Path) -> Result<()> {
    if path.exists() {
        warn!(path = %path.display(), "migration.removing_leftover_staging");
        std::fs::remove_dir_all(path)?;
    }
    Ok(())
}
