//! Fixture stores for tests.
//!
//! Builds a complete database of a given format in a directory: record
//! files, a transaction log holding committed degree changes, the degrees
//! store checkpointed at the last transaction (for formats that have one)
//! and metadata.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::degrees::{encode_degrees_file, DegreeKey};
use crate::format::{MetadataLayout, StoreVersion};
use crate::log::command::GroupDegreeCommand;
use crate::log::{LogCommand, TransactionLogWriter};
use crate::primitives::io::write_file_atomic;
use crate::store::layout::DatabaseLayout;
use crate::store::meta::{MetaData, MetaDataStore, StoreIdentity};
use crate::store::records::{RecordFile, RecordKind};
use crate::types::{Direction, GroupId, RelTypeId, Result, StoreError, TxId};

/// Last committed transaction of every sample store.
pub const SAMPLE_LAST_COMMITTED_TX: TxId = TxId(51);
/// The sample log rotates to a new file after this transaction.
const ROTATE_AFTER: u64 = 30;
/// The sample log records a checkpoint after this transaction.
const CHECKPOINT_AFTER: u64 = 40;

/// What a prepared sample store contains.
#[derive(Clone, Debug)]
pub struct SampleStore {
    /// Format written.
    pub version: StoreVersion,
    /// Identity written to the metadata.
    pub identity: StoreIdentity,
    /// Last committed transaction.
    pub last_committed_tx: TxId,
    /// Degrees implied by the log.
    pub degrees: BTreeMap<DegreeKey, i64>,
}

/// Writes a sample store of `version` into `layout`.
pub fn prepare_sample_legacy_database(
    version: StoreVersion,
    layout: &DatabaseLayout,
    identity: StoreIdentity,
) -> Result<SampleStore> {
    std::fs::create_dir_all(layout.database_directory())?;
    for (idx, kind) in RecordKind::ALL.iter().enumerate() {
        let count = 8 * (idx as u64 + 1);
        let payload: Vec<u8> = (0..count * 4).map(|b| (b as u8) ^ (idx as u8)).collect();
        RecordFile::new(*kind, version.record_layout(), count, Bytes::from(payload))
            .write(&layout.record_file(*kind), false)?;
    }

    let mut writer = TransactionLogWriter::create(
        layout,
        version.codec(),
        identity.store_id.random,
        TxId::BASE,
        false,
    )?;
    let mut counts: BTreeMap<DegreeKey, i64> = BTreeMap::new();
    for tx in (TxId::BASE.0 + 1)..=SAMPLE_LAST_COMMITTED_TX.0 {
        let commands = sample_commands(tx, &counts);
        for command in &commands {
            if let LogCommand::GroupDegree(cmd) = command {
                let key = DegreeKey::new(cmd.group, cmd.rel_type, cmd.direction);
                let slot = counts.entry(key).or_insert(0);
                *slot = slot
                    .checked_add(cmd.delta)
                    .ok_or(StoreError::Invalid("sample degree overflow"))?;
            }
        }
        writer.append_transaction(TxId(tx), &commands)?;
        if tx == ROTATE_AFTER {
            writer.rotate()?;
        }
        if tx == CHECKPOINT_AFTER {
            writer.append_checkpoint()?;
        }
    }
    counts.retain(|_, v| *v != 0);

    if version.has_degrees_store() {
        write_file_atomic(
            &layout.relationship_group_degrees_store(),
            &encode_degrees_file(SAMPLE_LAST_COMMITTED_TX, &counts),
            false,
        )?;
    }
    MetaDataStore::write(
        &layout.metadata_store(),
        &MetaData {
            store_version: version,
            identity,
            last_committed_tx: SAMPLE_LAST_COMMITTED_TX,
            checkpoint_log_version: match version.metadata_layout() {
                MetadataLayout::V1 => None,
                MetadataLayout::V2 => Some(0),
            },
        },
        false,
    )?;
    Ok(SampleStore {
        version,
        identity,
        last_committed_tx: SAMPLE_LAST_COMMITTED_TX,
        degrees: counts,
    })
}

fn sample_commands(tx: u64, counts: &BTreeMap<DegreeKey, i64>) -> Vec<LogCommand> {
    let key = DegreeKey::new(
        GroupId(tx % 5),
        RelTypeId((tx % 3) as u32),
        Direction::ALL[(tx % 3) as usize],
    );
    let mut commands = vec![degree_command(key, (tx % 4 + 1) as i64)];
    // every seventh transaction also removes one relationship from an earlier group
    if tx % 7 == 0 {
        if let Some((earlier, _)) = counts.iter().find(|(k, v)| **v > 0 && **k != key) {
            commands.push(degree_command(*earlier, -1));
        }
    }
    commands
}

fn degree_command(key: DegreeKey, delta: i64) -> LogCommand {
    LogCommand::GroupDegree(GroupDegreeCommand {
        group: key.group,
        rel_type: key.rel_type,
        direction: key.direction,
        delta,
    })
}
