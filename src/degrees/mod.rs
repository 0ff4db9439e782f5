//! Relationship-group degrees store.
//!
//! Keeps one signed counter per `(group, relationship type, direction)` for
//! dense nodes. The in-memory map is authoritative while the store is running and
//! is checkpointed to `relationship_group_degrees.db` together with the last
//! transaction it reflects. On start the checkpointed transaction is compared
//! with the last committed one and the map is rebuilt only when they differ.
//!
//! File layout (big-endian):
//!
//! ```text
//! 0..4    magic "RSGD"
//! 4..6    layout
//! 6..8    reserved
//! 8..16   checkpoint tx id
//! 16..24  entry count
//! 24..    entries: group u64 | type u32 | direction u8 | count i64
//! ..+4    crc32 of everything before it
//! ```

use std::collections::BTreeMap;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::primitives::io::{read_if_exists, write_file_atomic};
use crate::primitives::memory::MemoryTracker;
use crate::types::{
    field, record_crc32, Direction, GroupId, RelTypeId, Result, StoreError, TxId,
};

pub mod rebuild;

pub use rebuild::{DegreesRebuilder, LogReplayRebuilder};

const DEGREES_MAGIC: [u8; 4] = *b"RSGD";
const DEGREES_LAYOUT: u16 = 1;
const HEADER_LEN: usize = 24;
const ENTRY_LEN: usize = 8 + 4 + 1 + 8;
/// Approximate heap cost of one map entry, charged while rebuilding.
const ENTRY_MEMORY: u64 = 64;

const HDR_MAGIC: Range<usize> = 0..4;
const HDR_LAYOUT: Range<usize> = 4..6;
const HDR_RESERVED: Range<usize> = 6..8;
const HDR_TX: Range<usize> = 8..16;
const HDR_COUNT: Range<usize> = 16..24;

/// Identifies one degree counter.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
pub struct DegreeKey {
    /// Relationship group.
    pub group: GroupId,
    /// Relationship type.
    pub rel_type: RelTypeId,
    /// Direction relative to the group owner.
    pub direction: Direction,
}

impl DegreeKey {
    /// Builds a key.
    pub fn new(group: GroupId, rel_type: RelTypeId, direction: Direction) -> Self {
        Self {
            group,
            rel_type,
            direction,
        }
    }
}

/// Receives signed degree changes.
pub trait DegreeUpdater {
    /// Adds `delta` to the counter for `key`.
    fn increment(&mut self, key: DegreeKey, delta: i64) -> Result<()>;
}

/// Encodes a checkpoint file.
pub fn encode_degrees_file(tx_id: TxId, counts: &BTreeMap<DegreeKey, i64>) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_LEN];
    buf[HDR_MAGIC].copy_from_slice(&DEGREES_MAGIC);
    buf[HDR_LAYOUT].copy_from_slice(&DEGREES_LAYOUT.to_be_bytes());
    buf[HDR_TX].copy_from_slice(&tx_id.0.to_be_bytes());
    buf[HDR_COUNT].copy_from_slice(&(counts.len() as u64).to_be_bytes());
    buf.reserve(counts.len() * ENTRY_LEN + 4);
    for (key, count) in counts {
        buf.extend_from_slice(&key.group.0.to_be_bytes());
        buf.extend_from_slice(&key.rel_type.0.to_be_bytes());
        buf.push(key.direction.as_u8());
        buf.extend_from_slice(&count.to_be_bytes());
    }
    let crc = record_crc32(&[&buf]);
    buf.extend_from_slice(&crc.to_be_bytes());
    buf
}

/// Decodes and verifies a checkpoint file.
pub fn decode_degrees_file(buf: &[u8]) -> Result<(TxId, BTreeMap<DegreeKey, i64>)> {
    if buf.len() < HEADER_LEN + 4 {
        return Err(StoreError::Corruption("degrees file truncated"));
    }
    if buf[HDR_MAGIC] != DEGREES_MAGIC {
        return Err(StoreError::Corruption("degrees file magic mismatch"));
    }
    let body_len = buf.len() - 4;
    let stored = u32::from_be_bytes(field(buf, body_len..buf.len(), "degrees crc")?);
    if stored != record_crc32(&[&buf[..body_len]]) {
        return Err(StoreError::Corruption("degrees file crc mismatch"));
    }
    let layout = u16::from_be_bytes(field(buf, HDR_LAYOUT, "degrees layout")?);
    if layout != DEGREES_LAYOUT {
        return Err(StoreError::UnsupportedFormat(format!(
            "degrees file layout {layout}"
        )));
    }
    if buf[HDR_RESERVED].iter().any(|b| *b != 0) {
        return Err(StoreError::Corruption("degrees reserved field non-zero"));
    }
    let tx_id = TxId(u64::from_be_bytes(field(buf, HDR_TX, "degrees tx")?));
    let count = u64::from_be_bytes(field(buf, HDR_COUNT, "degrees count")?);
    let expected = (count as usize)
        .checked_mul(ENTRY_LEN)
        .and_then(|len| len.checked_add(HEADER_LEN));
    if expected != Some(body_len) {
        return Err(StoreError::Corruption("degrees entry count mismatch"));
    }
    let mut counts = BTreeMap::new();
    for entry in buf[HEADER_LEN..body_len].chunks_exact(ENTRY_LEN) {
        let direction = Direction::from_u8(entry[12])
            .ok_or(StoreError::Corruption("degrees entry direction"))?;
        let key = DegreeKey {
            group: GroupId(u64::from_be_bytes(field(entry, 0..8, "degrees group")?)),
            rel_type: RelTypeId(u32::from_be_bytes(field(entry, 8..12, "degrees type")?)),
            direction,
        };
        let value = i64::from_be_bytes(field(entry, 13..21, "degrees count")?);
        counts.insert(key, value);
    }
    Ok((tx_id, counts))
}

/// How [`RelationshipGroupDegreesStore::start`] brought the store up.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub enum StartOutcome {
    /// The checkpoint matched the last committed transaction.
    Reused,
    /// Counters were rebuilt; holds the checkpoint that was found, if any.
    Rebuilt {
        /// Transaction of the discarded checkpoint.
        previous_checkpoint: Option<TxId>,
    },
}

/// Construction options.
#[derive(Copy, Clone, Debug)]
pub struct DegreesStoreOptions {
    /// Sync the checkpoint file and its directory.
    pub fsync: bool,
}

impl Default for DegreesStoreOptions {
    fn default() -> Self {
        Self { fsync: true }
    }
}

struct DegreesState {
    counts: BTreeMap<DegreeKey, i64>,
    applied_tx: TxId,
    checkpointed_tx: Option<TxId>,
    needs_rebuild: bool,
}

/// Degree counters for dense nodes, backed by a checkpoint file.
pub struct RelationshipGroupDegreesStore {
    path: PathBuf,
    rebuilder: Box<dyn DegreesRebuilder>,
    state: RwLock<DegreesState>,
    writer: Mutex<()>,
    started: AtomicBool,
    options: DegreesStoreOptions,
}

impl RelationshipGroupDegreesStore {
    /// Opens the store at `path`. Nothing is rebuilt until [`Self::start`].
    ///
    /// A missing or unreadable checkpoint marks the store for rebuild.
    pub fn open(
        path: &Path,
        rebuilder: Box<dyn DegreesRebuilder>,
        options: DegreesStoreOptions,
    ) -> Result<Self> {
        let state = match read_if_exists(path)? {
            None => DegreesState {
                counts: BTreeMap::new(),
                applied_tx: TxId::BASE,
                checkpointed_tx: None,
                needs_rebuild: true,
            },
            Some(bytes) => match decode_degrees_file(&bytes) {
                Ok((tx_id, counts)) => DegreesState {
                    counts,
                    applied_tx: tx_id,
                    checkpointed_tx: Some(tx_id),
                    needs_rebuild: false,
                },
                Err(err) if err.is_corruption() => {
                    warn!(path = %path.display(), error = %err, "degrees.checkpoint_unreadable");
                    DegreesState {
                        counts: BTreeMap::new(),
                        applied_tx: TxId::BASE,
                        checkpointed_tx: None,
                        needs_rebuild: true,
                    }
                }
                Err(err) => return Err(err),
            },
        };
        Ok(Self {
            path: path.to_path_buf(),
            rebuilder,
            state: RwLock::new(state),
            writer: Mutex::new(()),
            started: AtomicBool::new(false),
            options,
        })
    }

    /// Brings the counters in line with the last committed transaction,
    /// rebuilding only when the checkpoint is missing or does not match.
    pub fn start(&self, memory: &MemoryTracker) -> Result<StartOutcome> {
        let _writer = self.writer.lock();
        let target = self.rebuilder.last_committed_tx();
        let (checkpoint, needs_rebuild) = {
            let state = self.state.read();
            (state.checkpointed_tx, state.needs_rebuild)
        };
        let outcome = match checkpoint {
            Some(tx) if !needs_rebuild && tx == target => {
                debug!(tx = tx.0, "degrees.checkpoint_current");
                StartOutcome::Reused
            }
            previous => {
                match previous {
                    Some(tx) if tx > target => warn!(
                        checkpoint = tx.0,
                        last_committed = target.0,
                        "degrees.checkpoint_ahead_of_log"
                    ),
                    Some(tx) => info!(
                        checkpoint = tx.0,
                        last_committed = target.0,
                        "degrees.checkpoint_stale"
                    ),
                    None => info!(last_committed = target.0, "degrees.checkpoint_missing"),
                }
                self.rebuild_locked(memory)?;
                StartOutcome::Rebuilt {
                    previous_checkpoint: previous,
                }
            }
        };
        self.started.store(true, Ordering::Release);
        Ok(outcome)
    }

    /// Discards the counters and rebuilds them from the rebuilder's source.
    pub fn rebuild(&self, memory: &MemoryTracker) -> Result<()> {
        let _writer = self.writer.lock();
        self.rebuild_locked(memory)
    }

    fn rebuild_locked(&self, memory: &MemoryTracker) -> Result<()> {
        let target = self.rebuilder.last_committed_tx();
        let mut updater = RebuildUpdater {
            counts: BTreeMap::new(),
            memory,
            charged: 0,
        };
        let result = self.rebuilder.rebuild(&mut updater, memory);
        let charged = updater.charged;
        let mut counts = std::mem::take(&mut updater.counts);
        memory.release(charged);
        result?;
        counts.retain(|_, v| *v != 0);
        info!(entries = counts.len(), tx = target.0, "degrees.rebuilt");
        write_file_atomic(&self.path, &encode_degrees_file(target, &counts), self.options.fsync)?;
        let mut state = self.state.write();
        state.counts = counts;
        state.applied_tx = target;
        state.checkpointed_tx = Some(target);
        state.needs_rebuild = false;
        Ok(())
    }

    /// Current degree for a key; zero when absent.
    pub fn degree(&self, group: GroupId, rel_type: RelTypeId, direction: Direction) -> i64 {
        self.state
            .read()
            .counts
            .get(&DegreeKey::new(group, rel_type, direction))
            .copied()
            .unwrap_or(0)
    }

    /// Last transaction whose deltas are reflected in memory.
    pub fn tx_id(&self) -> TxId {
        self.state.read().applied_tx
    }

    /// Transaction recorded by the last durable checkpoint.
    pub fn checkpointed_tx_id(&self) -> Option<TxId> {
        self.state.read().checkpointed_tx
    }

    /// Starts applying the deltas of `tx_id`.
    ///
    /// Returns `None` when that transaction is already reflected, which makes
    /// replay after a crash idempotent. Only one applier exists at a time.
    pub fn apply(&self, tx_id: TxId) -> Result<Option<DegreesApplier<'_>>> {
        if !self.started.load(Ordering::Acquire) {
            return Err(StoreError::Invalid("degrees store not started"));
        }
        let guard = self.writer.lock();
        let applied = self.state.read().applied_tx;
        if tx_id <= applied {
            debug!(tx = tx_id.0, applied = applied.0, "degrees.apply_skipped");
            return Ok(None);
        }
        Ok(Some(DegreesApplier {
            store: self,
            _writer: guard,
            tx_id,
            deltas: BTreeMap::new(),
            committed: false,
        }))
    }

    /// Writes the counters and their transaction to disk.
    pub fn checkpoint(&self) -> Result<TxId> {
        let _writer = self.writer.lock();
        let (tx_id, bytes) = {
            let state = self.state.read();
            (state.applied_tx, encode_degrees_file(state.applied_tx, &state.counts))
        };
        write_file_atomic(&self.path, &bytes, self.options.fsync)?;
        self.state.write().checkpointed_tx = Some(tx_id);
        debug!(tx = tx_id.0, "degrees.checkpointed");
        Ok(tx_id)
    }

    /// All non-zero counters in key order.
    pub fn entries(&self) -> Vec<(DegreeKey, i64)> {
        self.state
            .read()
            .counts
            .iter()
            .map(|(k, v)| (*k, *v))
            .collect()
    }

    /// Path of the checkpoint file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

struct RebuildUpdater<'m> {
    counts: BTreeMap<DegreeKey, i64>,
    memory: &'m MemoryTracker,
    charged: u64,
}

impl DegreeUpdater for RebuildUpdater<'_> {
    fn increment(&mut self, key: DegreeKey, delta: i64) -> Result<()> {
        if !self.counts.contains_key(&key) {
            self.memory.allocate(ENTRY_MEMORY)?;
            self.charged += ENTRY_MEMORY;
        }
        let slot = self.counts.entry(key).or_insert(0);
        *slot = slot
            .checked_add(delta)
            .ok_or(StoreError::Corruption("degree overflow"))?;
        Ok(())
    }
}

/// Batch of degree deltas for one transaction.
///
/// Nothing is visible until [`DegreesApplier::commit`]; dropping the applier
/// discards the batch.
#[must_use = "degree deltas are discarded unless committed"]
pub struct DegreesApplier<'a> {
    store: &'a RelationshipGroupDegreesStore,
    _writer: MutexGuard<'a, ()>,
    tx_id: TxId,
    deltas: BTreeMap<DegreeKey, i64>,
    committed: bool,
}

impl DegreesApplier<'_> {
    /// Transaction this batch belongs to.
    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    /// Applies every delta at once and advances the store's transaction id.
    ///
    /// Fails without changing anything if a counter would leave the `i64`
    /// range.
    pub fn commit(mut self) -> Result<()> {
        let mut state = self.store.state.write();
        let mut updated = Vec::with_capacity(self.deltas.len());
        for (key, delta) in &self.deltas {
            if *delta == 0 {
                continue;
            }
            let current = state.counts.get(key).copied().unwrap_or(0);
            let next = current
                .checked_add(*delta)
                .ok_or(StoreError::Invalid("degree overflow"))?;
            updated.push((*key, next));
        }
        for (key, value) in updated {
            if value == 0 {
                state.counts.remove(&key);
            } else {
                state.counts.insert(key, value);
            }
        }
        state.applied_tx = self.tx_id;
        self.committed = true;
        Ok(())
    }
}

impl DegreeUpdater for DegreesApplier<'_> {
    fn increment(&mut self, key: DegreeKey, delta: i64) -> Result<()> {
        let slot = self.deltas.entry(key).or_insert(0);
        *slot = slot
            .checked_add(delta)
            .ok_or(StoreError::Invalid("degree delta overflow"))?;
        Ok(())
    }
}

impl Drop for DegreesApplier<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.deltas.is_empty() {
            warn!(
                tx = self.tx_id.0,
                deltas = self.deltas.len(),
                "degrees.batch_discarded"
            );
        }
    }
}
