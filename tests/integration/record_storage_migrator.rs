#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use recstore::config::StoreConfig;
use recstore::degrees::{
    encode_degrees_file, DegreeUpdater, DegreesRebuilder, DegreesStoreOptions,
    RelationshipGroupDegreesStore, StartOutcome,
};
use recstore::format::StoreVersion;
use recstore::log::{LogTailExtractor, LogTailMetadata};
use recstore::primitives::io::copy_file_atomic;
use recstore::migration::{
    BatchRewrite, IdentityOverride, IndexImporterHook, MigrationProgressMonitor, MigrationState,
    NoIndexImport, RebuilderFactory, RewriteSummary, StoreMigrator,
};
use recstore::primitives::memory::MemoryTracker;
use recstore::store::layout::DatabaseLayout;
use recstore::store::meta::{ExternalStoreId, MetaDataStore, StoreId, StoreIdentity};
use recstore::store::records::{RecordFile, RecordKind};
use recstore::testkit::{prepare_sample_legacy_database, SAMPLE_LAST_COMMITTED_TX};
use recstore::types::{Result, StoreError, TxId};
use tempfile::tempdir;
use uuid::Uuid;

fn quiet_config() -> StoreConfig {
    StoreConfig {
        fsync: false,
        ..StoreConfig::default()
    }
}

fn sample_identity() -> StoreIdentity {
    StoreIdentity {
        store_id: StoreId {
            creation_time: 1_600_000_000_000,
            random: 0x5EED_0000_0000_0042,
        },
        database_uuid: Uuid::from_u64_pair(1, 2),
        external_store_id: ExternalStoreId(Uuid::from_u64_pair(3, 4)),
    }
}

struct FailingRebuilder(TxId);

impl DegreesRebuilder for FailingRebuilder {
    fn last_committed_tx(&self) -> TxId {
        self.0
    }

    fn rebuild(&self, _updater: &mut dyn DegreeUpdater, _memory: &MemoryTracker) -> Result<()> {
        panic!("degrees must not be rebuilt when the checkpoint is current");
    }
}

fn no_rebuild() -> RebuilderFactory {
    Arc::new(|_layout: &DatabaseLayout, tx: TxId| {
        Box::new(FailingRebuilder(tx)) as Box<dyn DegreesRebuilder>
    })
}

struct FailingRewriter;

impl BatchRewrite for FailingRewriter {
    fn rewrite(
        &self,
        _source: &DatabaseLayout,
        _staging: &DatabaseLayout,
        _from: StoreVersion,
        _to: StoreVersion,
        _index_importer: &dyn IndexImporterHook,
    ) -> Result<RewriteSummary> {
        panic!("a complete staging area must not be rewritten again");
    }
}

fn tail_of(layout: &DatabaseLayout) -> LogTailMetadata {
    LogTailExtractor::new()
        .tail_metadata(layout, &MemoryTracker::unlimited())
        .expect("log tail")
}

fn migrate(
    migrator: &StoreMigrator,
    layout: &DatabaseLayout,
    from: StoreVersion,
    to: StoreVersion,
) -> Result<recstore::migration::MigrationReport> {
    let tail = tail_of(layout);
    let mut section = MigrationProgressMonitor::silent().start_section("migrate");
    migrator.migrate(
        layout,
        &layout.migration_layout(),
        &mut section,
        from,
        to,
        &NoIndexImport,
        &tail,
    )
}

fn store_bytes(layout: &DatabaseLayout, version: StoreVersion) -> Vec<Vec<u8>> {
    let mut files = layout.data_files(version);
    files.push(layout.metadata_store());
    files
        .iter()
        .map(|path| std::fs::read(path).expect("read store file"))
        .collect()
}

#[test]
fn legacy_store_reaches_latest_without_degrees_rebuild() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    let sample =
        prepare_sample_legacy_database(StoreVersion::StandardV4_3, &layout, sample_identity())?;
    let tail = tail_of(&layout);
    assert_eq!(tail.last_committed_tx, SAMPLE_LAST_COMMITTED_TX);

    let migrator = StoreMigrator::new(quiet_config()).with_rebuilder_factory(no_rebuild());
    let report = migrate(
        &migrator,
        &layout,
        StoreVersion::StandardV4_3,
        StoreVersion::StandardV5_20,
    )?;
    assert_eq!(report.degrees, Some(StartOutcome::Reused));
    assert_eq!(report.last_committed_tx, TxId(51));
    assert_eq!(report.checkpoint_log_version, 0);
    migrator.move_migrated_files(
        &layout.migration_layout(),
        &layout,
        StoreVersion::StandardV4_3,
        StoreVersion::StandardV5_20,
    )?;

    let meta = MetaDataStore::read(&layout.metadata_store())?;
    assert_eq!(meta.store_version, StoreVersion::StandardV5_20);
    assert_eq!(meta.checkpoint_log_version, Some(0));
    assert_eq!(meta.identity, sample_identity());
    for kind in RecordKind::ALL {
        let file = RecordFile::read(&layout.record_file(kind))?;
        assert_eq!(file.header().layout, StoreVersion::StandardV5_20.record_layout());
    }

    let degrees = RelationshipGroupDegreesStore::open(
        &layout.relationship_group_degrees_store(),
        Box::new(FailingRebuilder(SAMPLE_LAST_COMMITTED_TX)),
        DegreesStoreOptions { fsync: false },
    )?;
    assert_eq!(degrees.start(&MemoryTracker::unlimited())?, StartOutcome::Reused);
    assert_eq!(degrees.tx_id(), TxId(51));
    let expected: Vec<_> = sample.degrees.into_iter().collect();
    assert_eq!(degrees.entries(), expected);
    Ok(())
}

#[test]
fn resumed_migration_matches_uninterrupted_run() -> Result<()> {
    let (from, to) = (StoreVersion::StandardV4_3, StoreVersion::StandardV5_20);
    let straight_dir = tempdir().expect("tmpdir");
    let straight = DatabaseLayout::new(straight_dir.path());
    prepare_sample_legacy_database(from, &straight, sample_identity())?;
    let migrator = StoreMigrator::new(quiet_config());
    migrate(&migrator, &straight, from, to)?;
    migrator.move_migrated_files(&straight.migration_layout(), &straight, from, to)?;

    let resumed_dir = tempdir().expect("tmpdir");
    let resumed = DatabaseLayout::new(resumed_dir.path());
    prepare_sample_legacy_database(from, &resumed, sample_identity())?;
    migrate(&StoreMigrator::new(quiet_config()), &resumed, from, to)?;

    // a later process finds the staging area complete and only promotes
    let later = StoreMigrator::new(quiet_config()).with_rewriter(Arc::new(FailingRewriter));
    let report = migrate(&later, &resumed, from, to)?;
    assert_eq!(report.resumed_from, MigrationState::CountsResolved);
    assert!(report.records.is_none());
    let promotion = later.move_migrated_files(&resumed.migration_layout(), &resumed, from, to)?;
    assert!(!promotion.already_promoted);

    assert_eq!(store_bytes(&straight, to), store_bytes(&resumed, to));
    assert!(!resumed.migration_layout().database_directory().exists());
    Ok(())
}

#[test]
fn database_uuid_override_keeps_store_and_external_ids() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV5_12, &layout, sample_identity())?;
    let records_before: Vec<Vec<u8>> = RecordKind::ALL
        .iter()
        .map(|kind| std::fs::read(layout.record_file(*kind)).expect("record file"))
        .collect();

    let new_uuid = Uuid::from_u64_pair(9, 9);
    let migrator = StoreMigrator::new(quiet_config()).with_identity_override(IdentityOverride {
        database_uuid: Some(new_uuid),
        reset_store_id: false,
    });
    let report = migrate(
        &migrator,
        &layout,
        StoreVersion::StandardV5_12,
        StoreVersion::StandardV5_20,
    )?;
    assert!(report.records_carried_over);
    migrator.move_migrated_files(
        &layout.migration_layout(),
        &layout,
        StoreVersion::StandardV5_12,
        StoreVersion::StandardV5_20,
    )?;

    let meta = MetaDataStore::read(&layout.metadata_store())?;
    assert_eq!(meta.identity.store_id, sample_identity().store_id);
    assert_eq!(
        meta.identity.external_store_id,
        sample_identity().external_store_id
    );
    assert_eq!(meta.identity.database_uuid, new_uuid);
    let records_after: Vec<Vec<u8>> = RecordKind::ALL
        .iter()
        .map(|kind| std::fs::read(layout.record_file(*kind)).expect("record file"))
        .collect();
    assert_eq!(records_before, records_after);
    Ok(())
}

#[test]
fn minor_bump_without_override_keeps_identity() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV5_12, &layout, sample_identity())?;
    let migrator = StoreMigrator::new(quiet_config());
    migrate(
        &migrator,
        &layout,
        StoreVersion::StandardV5_12,
        StoreVersion::StandardV5_20,
    )?;
    migrator.move_migrated_files(
        &layout.migration_layout(),
        &layout,
        StoreVersion::StandardV5_12,
        StoreVersion::StandardV5_20,
    )?;
    let meta = MetaDataStore::read(&layout.metadata_store())?;
    assert_eq!(meta.identity, sample_identity());
    assert_eq!(meta.store_version, StoreVersion::StandardV5_20);
    Ok(())
}

#[test]
fn store_id_is_regenerated_only_on_request() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV4_3, &layout, sample_identity())?;
    let migrator = StoreMigrator::new(quiet_config()).with_identity_override(IdentityOverride {
        database_uuid: None,
        reset_store_id: true,
    });
    migrate(
        &migrator,
        &layout,
        StoreVersion::StandardV4_3,
        StoreVersion::StandardV5_20,
    )?;
    migrator.move_migrated_files(
        &layout.migration_layout(),
        &layout,
        StoreVersion::StandardV4_3,
        StoreVersion::StandardV5_20,
    )?;
    let meta = MetaDataStore::read(&layout.metadata_store())?;
    assert_ne!(meta.identity.store_id, sample_identity().store_id);
    assert_eq!(
        meta.identity.external_store_id,
        sample_identity().external_store_id
    );
    assert_eq!(meta.identity.database_uuid, sample_identity().database_uuid);
    Ok(())
}

#[test]
fn promotion_without_the_matching_override_is_refused() -> Result<()> {
    let (from, to) = (StoreVersion::StandardV4_3, StoreVersion::StandardV5_20);
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(from, &layout, sample_identity())?;
    let override_uuid = IdentityOverride {
        database_uuid: Some(Uuid::from_u64_pair(7, 7)),
        reset_store_id: false,
    };
    let migrator = StoreMigrator::new(quiet_config()).with_identity_override(override_uuid);
    migrate(&migrator, &layout, from, to)?;

    let err = StoreMigrator::new(quiet_config())
        .move_migrated_files(&layout.migration_layout(), &layout, from, to)
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::IdentityMismatch {
            field: "database_uuid",
            ..
        }
    ));
    assert_eq!(MetaDataStore::read(&layout.metadata_store())?.store_version, from);

    migrator.move_migrated_files(&layout.migration_layout(), &layout, from, to)?;
    assert_eq!(
        MetaDataStore::read(&layout.metadata_store())?
            .identity
            .database_uuid,
        Uuid::from_u64_pair(7, 7)
    );
    Ok(())
}

#[test]
fn promoting_twice_is_a_no_op() -> Result<()> {
    let (from, to) = (StoreVersion::StandardV4_3, StoreVersion::StandardV5_20);
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(from, &layout, sample_identity())?;
    let migrator = StoreMigrator::new(quiet_config());
    migrate(&migrator, &layout, from, to)?;
    let first = migrator.move_migrated_files(&layout.migration_layout(), &layout, from, to)?;
    let snapshot = store_bytes(&layout, to);
    let second = migrator.move_migrated_files(&layout.migration_layout(), &layout, from, to)?;
    assert!(!first.already_promoted);
    assert!(second.already_promoted);
    assert_eq!(second.files_promoted, 0);
    assert_eq!(store_bytes(&layout, to), snapshot);

    let again = migrate(&migrator, &layout, from, to)?;
    assert_eq!(again.resumed_from, MigrationState::Promoted);
    Ok(())
}

#[test]
fn crash_after_metadata_promotion_reads_as_promoted() -> Result<()> {
    let (from, to) = (StoreVersion::StandardV4_3, StoreVersion::StandardV5_20);
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(from, &layout, sample_identity())?;
    let staging = layout.migration_layout();
    let migrator = StoreMigrator::new(quiet_config());
    migrate(&migrator, &layout, from, to)?;
    // promotion copied everything, metadata last, then stopped before cleanup
    for (src, dst) in staging.data_files(to).iter().zip(layout.data_files(to)) {
        copy_file_atomic(src, &dst, false)?;
    }
    copy_file_atomic(&staging.metadata_store(), &layout.metadata_store(), false)?;
    let promoted = store_bytes(&layout, to);

    let fresh = StoreMigrator::new(quiet_config()).with_rewriter(Arc::new(FailingRewriter));
    assert_eq!(
        StoreMigrator::derive_state(&staging, &layout, to)?,
        MigrationState::Promoted
    );
    let again = migrate(&fresh, &layout, from, to)?;
    assert_eq!(again.resumed_from, MigrationState::Promoted);
    assert_eq!(again.last_committed_tx, SAMPLE_LAST_COMMITTED_TX);

    let report = fresh.move_migrated_files(&staging, &layout, from, to)?;
    assert!(report.already_promoted);
    assert!(!staging.database_directory().exists());
    assert_eq!(store_bytes(&layout, to), promoted);
    Ok(())
}

#[test]
fn log_needing_recovery_is_refused_before_staging() -> Result<()> {
    let (from, to) = (StoreVersion::StandardV4_3, StoreVersion::StandardV5_20);
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(from, &layout, sample_identity())?;
    let mut tail = tail_of(&layout);
    tail.recovery_required = true;

    let migrator = StoreMigrator::new(quiet_config()).with_rewriter(Arc::new(FailingRewriter));
    let mut section = MigrationProgressMonitor::silent().start_section("migrate");
    let err = migrator
        .migrate(
            &layout,
            &layout.migration_layout(),
            &mut section,
            from,
            to,
            &NoIndexImport,
            &tail,
        )
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidOwned(ref msg) if msg.contains("recovery")));
    assert!(!layout.migration_layout().database_directory().exists());
    assert_eq!(
        MetaDataStore::read(&layout.metadata_store())?.store_version,
        from
    );
    Ok(())
}

#[test]
fn damaged_staged_record_file_fails_loudly() -> Result<()> {
    let (from, to) = (StoreVersion::StandardV4_3, StoreVersion::StandardV5_20);
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(from, &layout, sample_identity())?;
    let staging = layout.migration_layout();
    std::fs::create_dir_all(staging.database_directory())?;
    std::fs::write(staging.record_file(RecordKind::Node), b"half a record file")?;

    let err = migrate(&StoreMigrator::new(quiet_config()), &layout, from, to).unwrap_err();
    assert!(matches!(err, StoreError::PartialMigration(_)));
    assert!(err.is_corruption());
    assert_eq!(MetaDataStore::read(&layout.metadata_store())?.store_version, from);
    assert!(staging.record_file(RecordKind::Node).exists());
    Ok(())
}

#[test]
fn lagging_degrees_checkpoint_is_rebuilt_from_the_log() -> Result<()> {
    let (from, to) = (StoreVersion::StandardV4_3, StoreVersion::AlignedV5_20);
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    let sample = prepare_sample_legacy_database(from, &layout, sample_identity())?;
    std::fs::write(
        layout.relationship_group_degrees_store(),
        encode_degrees_file(TxId(40), &BTreeMap::new()),
    )?;

    let migrator = StoreMigrator::new(StoreConfig {
        rewrite_threads: 3,
        ..quiet_config()
    });
    let report = migrate(&migrator, &layout, from, to)?;
    assert_eq!(
        report.degrees,
        Some(StartOutcome::Rebuilt {
            previous_checkpoint: Some(TxId(40))
        })
    );
    migrator.move_migrated_files(&layout.migration_layout(), &layout, from, to)?;

    let degrees = RelationshipGroupDegreesStore::open(
        &layout.relationship_group_degrees_store(),
        Box::new(FailingRebuilder(SAMPLE_LAST_COMMITTED_TX)),
        DegreesStoreOptions { fsync: false },
    )?;
    degrees.start(&MemoryTracker::unlimited())?;
    let expected: Vec<_> = sample.degrees.into_iter().collect();
    assert_eq!(degrees.entries(), expected);
    Ok(())
}

#[test]
fn invalid_version_pairs_fail_before_touching_anything() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV5_20, &layout, sample_identity())?;
    let migrator = StoreMigrator::new(quiet_config());

    let same = migrate(
        &migrator,
        &layout,
        StoreVersion::StandardV5_20,
        StoreVersion::StandardV5_20,
    )
    .unwrap_err();
    assert!(matches!(same, StoreError::InvalidOwned(_)));

    let downgrade = migrate(
        &migrator,
        &layout,
        StoreVersion::StandardV5_20,
        StoreVersion::StandardV5_12,
    )
    .unwrap_err();
    assert!(matches!(downgrade, StoreError::UnsupportedFormat(_)));
    assert!(!layout.migration_layout().database_directory().exists());
    Ok(())
}
