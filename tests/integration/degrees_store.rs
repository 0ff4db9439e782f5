#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use recstore::degrees::{
    encode_degrees_file, DegreeKey, DegreeUpdater, DegreesRebuilder, DegreesStoreOptions,
    LogReplayRebuilder, RelationshipGroupDegreesStore, StartOutcome,
};
use recstore::format::StoreVersion;
use recstore::log::LogTailExtractor;
use recstore::primitives::memory::MemoryTracker;
use recstore::store::layout::DatabaseLayout;
use recstore::store::meta::StoreIdentity;
use recstore::testkit::prepare_sample_legacy_database;
use recstore::types::{Direction, GroupId, RelTypeId, Result, StoreError, TxId};
use tempfile::tempdir;

struct FixedRebuilder {
    last_committed: TxId,
    deltas: Vec<(DegreeKey, i64)>,
}

impl DegreesRebuilder for FixedRebuilder {
    fn last_committed_tx(&self) -> TxId {
        self.last_committed
    }

    fn rebuild(&self, updater: &mut dyn DegreeUpdater, _memory: &MemoryTracker) -> Result<()> {
        for (key, delta) in &self.deltas {
            updater.increment(*key, *delta)?;
        }
        Ok(())
    }
}

struct FailingRebuilder(TxId);

impl DegreesRebuilder for FailingRebuilder {
    fn last_committed_tx(&self) -> TxId {
        self.0
    }

    fn rebuild(&self, _updater: &mut dyn DegreeUpdater, _memory: &MemoryTracker) -> Result<()> {
        panic!("rebuild must not run");
    }
}

fn key(group: u64, direction: Direction) -> DegreeKey {
    DegreeKey::new(GroupId(group), RelTypeId(2), direction)
}

fn open(path: &Path, rebuilder: Box<dyn DegreesRebuilder>) -> Result<RelationshipGroupDegreesStore> {
    RelationshipGroupDegreesStore::open(path, rebuilder, DegreesStoreOptions { fsync: false })
}

#[test]
fn matching_checkpoint_never_rebuilds() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("degrees.db");
    let mut counts = BTreeMap::new();
    counts.insert(key(1, Direction::Outgoing), 4);
    std::fs::write(&path, encode_degrees_file(TxId(51), &counts))?;

    let store = open(&path, Box::new(FailingRebuilder(TxId(51))))?;
    assert_eq!(store.start(&MemoryTracker::unlimited())?, StartOutcome::Reused);
    assert_eq!(store.tx_id(), TxId(51));
    assert_eq!(store.degree(GroupId(1), RelTypeId(2), Direction::Outgoing), 4);
    Ok(())
}

#[test]
fn checkpointed_state_survives_restart() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("degrees.db");
    {
        let store = open(
            &path,
            Box::new(FixedRebuilder {
                last_committed: TxId(5),
                deltas: vec![(key(1, Direction::Incoming), 3)],
            }),
        )?;
        assert_eq!(
            store.start(&MemoryTracker::unlimited())?,
            StartOutcome::Rebuilt {
                previous_checkpoint: None
            }
        );
        for tx in 6..=7 {
            let mut batch = store.apply(TxId(tx))?.expect("new transaction");
            batch.increment(key(1, Direction::Incoming), 1)?;
            batch.increment(key(2, Direction::Loop), 2)?;
            batch.commit()?;
        }
        assert_eq!(store.checkpoint()?, TxId(7));
    }

    let store = open(&path, Box::new(FailingRebuilder(TxId(7))))?;
    assert_eq!(store.start(&MemoryTracker::unlimited())?, StartOutcome::Reused);
    assert_eq!(store.tx_id(), TxId(7));
    assert_eq!(store.degree(GroupId(1), RelTypeId(2), Direction::Incoming), 5);
    assert_eq!(store.degree(GroupId(2), RelTypeId(2), Direction::Loop), 4);
    assert!(store.apply(TxId(7))?.is_none());
    Ok(())
}

#[test]
fn applied_but_uncheckpointed_work_is_rebuilt_after_restart() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("degrees.db");
    let k = key(9, Direction::Outgoing);
    {
        let store = open(
            &path,
            Box::new(FixedRebuilder {
                last_committed: TxId(3),
                deltas: vec![(k, 1)],
            }),
        )?;
        store.start(&MemoryTracker::unlimited())?;
        let mut batch = store.apply(TxId(4))?.expect("new transaction");
        batch.increment(k, 1)?;
        batch.commit()?;
        assert_eq!(store.tx_id(), TxId(4));
        assert_eq!(store.checkpointed_tx_id(), Some(TxId(3)));
    }

    let store = open(
        &path,
        Box::new(FixedRebuilder {
            last_committed: TxId(4),
            deltas: vec![(k, 1), (k, 1)],
        }),
    )?;
    assert_eq!(
        store.start(&MemoryTracker::unlimited())?,
        StartOutcome::Rebuilt {
            previous_checkpoint: Some(TxId(3))
        }
    );
    assert_eq!(store.tx_id(), TxId(4));
    assert_eq!(store.degree(GroupId(9), RelTypeId(2), Direction::Outgoing), 2);
    Ok(())
}

#[test]
fn dropped_batch_changes_nothing() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let store = open(
        &dir.path().join("degrees.db"),
        Box::new(FixedRebuilder {
            last_committed: TxId::BASE,
            deltas: Vec::new(),
        }),
    )?;
    store.start(&MemoryTracker::unlimited())?;
    {
        let mut batch = store.apply(TxId(2))?.expect("new transaction");
        batch.increment(key(1, Direction::Outgoing), 10)?;
    }
    assert_eq!(store.tx_id(), TxId::BASE);
    assert!(store.entries().is_empty());

    let mut batch = store.apply(TxId(2))?.expect("still not applied");
    batch.increment(key(1, Direction::Outgoing), 10)?;
    batch.commit()?;
    assert_eq!(store.degree(GroupId(1), RelTypeId(2), Direction::Outgoing), 10);
    Ok(())
}

#[test]
fn readers_never_observe_half_a_batch() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let store = open(
        &dir.path().join("degrees.db"),
        Box::new(FixedRebuilder {
            last_committed: TxId::BASE,
            deltas: Vec::new(),
        }),
    )?;
    store.start(&MemoryTracker::unlimited())?;
    let done = AtomicBool::new(false);
    std::thread::scope(|scope| {
        for _ in 0..3 {
            scope.spawn(|| {
                while !done.load(Ordering::Acquire) {
                    let out = store.degree(GroupId(1), RelTypeId(2), Direction::Outgoing);
                    let back = store.degree(GroupId(1), RelTypeId(2), Direction::Incoming);
                    assert!(out <= back, "out {out} back {back}");
                }
            });
        }
        for tx in 2..200 {
            let mut batch = store.apply(TxId(tx)).unwrap().unwrap();
            batch.increment(key(1, Direction::Outgoing), 1).unwrap();
            batch.increment(key(1, Direction::Incoming), 1).unwrap();
            batch.commit().unwrap();
        }
        done.store(true, Ordering::Release);
    });
    assert_eq!(store.tx_id(), TxId(199));
    assert_eq!(store.degree(GroupId(1), RelTypeId(2), Direction::Incoming), 198);
    Ok(())
}

#[test]
fn rebuild_respects_the_memory_limit() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let path = dir.path().join("degrees.db");
    let store = open(
        &path,
        Box::new(FixedRebuilder {
            last_committed: TxId(9),
            deltas: (0..32).map(|g| (key(g, Direction::Loop), 1)).collect(),
        }),
    )?;
    let tracker = MemoryTracker::with_limit(256);
    let err = store.start(&tracker).unwrap_err();
    assert!(matches!(err, StoreError::MemoryLimitExceeded { .. }));
    assert_eq!(tracker.allocated(), 0);
    assert!(!path.exists());
    assert!(store.apply(TxId(10)).is_err());
    Ok(())
}

#[test]
fn log_replay_rebuild_matches_the_sample_history() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    let sample =
        prepare_sample_legacy_database(StoreVersion::StandardV5_20, &layout, StoreIdentity::generate())?;
    std::fs::remove_file(layout.relationship_group_degrees_store())?;
    let tail = LogTailExtractor::new().tail_metadata(&layout, &MemoryTracker::unlimited())?;

    let store = open(
        &layout.relationship_group_degrees_store(),
        Box::new(LogReplayRebuilder::from_tail(layout.clone(), &tail)),
    )?;
    store.start(&MemoryTracker::unlimited())?;
    assert_eq!(store.tx_id(), sample.last_committed_tx);
    let expected: Vec<_> = sample.degrees.into_iter().collect();
    assert_eq!(store.entries(), expected);
    assert_eq!(store.checkpointed_tx_id(), Some(sample.last_committed_tx));
    Ok(())
}
