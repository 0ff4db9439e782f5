//! Sources the degrees store can be rebuilt from.

use tracing::debug;

use super::{DegreeKey, DegreeUpdater};
use crate::log::files::{is_torn_write, LogFileReader, LogFiles};
use crate::log::tail::LogTailMetadata;
use crate::log::LogCommand;
use crate::primitives::memory::MemoryTracker;
use crate::store::layout::DatabaseLayout;
use crate::types::{Result, StoreError, TxId};

/// Produces the full set of degree counters up to a known transaction.
pub trait DegreesRebuilder: Send + Sync {
    /// Transaction the rebuilt counters must reflect.
    fn last_committed_tx(&self) -> TxId;

    /// Feeds every counter into `updater`.
    fn rebuild(&self, updater: &mut dyn DegreeUpdater, memory: &MemoryTracker) -> Result<()>;
}

/// Rebuilds counters by replaying committed degree commands from the
/// transaction logs of a database.
pub struct LogReplayRebuilder {
    layout: DatabaseLayout,
    last_committed: TxId,
}

impl LogReplayRebuilder {
    /// Replays the logs in `layout` up to and including `last_committed`.
    pub fn new(layout: DatabaseLayout, last_committed: TxId) -> Self {
        Self {
            layout,
            last_committed,
        }
    }

    /// Replays up to the tail's last committed transaction.
    pub fn from_tail(layout: DatabaseLayout, tail: &LogTailMetadata) -> Self {
        Self::new(layout, tail.last_committed_tx)
    }

    /// Replays one file. Returns true when replay must stop at this file.
    fn replay_file(
        &self,
        reader: &mut LogFileReader,
        pending: &mut Vec<(DegreeKey, i64)>,
        updater: &mut dyn DegreeUpdater,
        replayed: &mut TxId,
    ) -> Result<bool> {
        loop {
            let command = match reader.next_command() {
                Ok(Some(command)) => command,
                Ok(None) => return Ok(false),
                Err(err) if is_torn_write(&err) => return Ok(true),
                Err(err) => return Err(err),
            };
            match command {
                LogCommand::Start(_) => pending.clear(),
                LogCommand::GroupDegree(cmd) => pending.push((
                    DegreeKey::new(cmd.group, cmd.rel_type, cmd.direction),
                    cmd.delta,
                )),
                LogCommand::Commit(commit) => {
                    if commit.tx_id > self.last_committed {
                        return Ok(true);
                    }
                    for (key, delta) in pending.drain(..) {
                        updater.increment(key, delta)?;
                    }
                    *replayed = commit.tx_id;
                }
                LogCommand::Checkpoint(_) | LogCommand::Enrichment(_) => {}
            }
        }
    }
}

impl DegreesRebuilder for LogReplayRebuilder {
    fn last_committed_tx(&self) -> TxId {
        self.last_committed
    }

    fn rebuild(&self, updater: &mut dyn DegreeUpdater, memory: &MemoryTracker) -> Result<()> {
        let files = LogFiles::new(&self.layout);
        let versions = files.log_versions()?;
        let Some(first) = versions.first().copied() else {
            if self.last_committed <= TxId::BASE {
                return Ok(());
            }
            return Err(StoreError::InvalidOwned(format!(
                "cannot rebuild degrees up to tx {}: no transaction logs",
                self.last_committed
            )));
        };
        let history_start = files.read_header(first)?.last_committed_tx_before;
        if history_start > TxId::BASE {
            return Err(StoreError::InvalidOwned(format!(
                "cannot rebuild degrees: log history starts after tx {history_start}"
            )));
        }

        let mut replayed = history_start;
        let mut pending: Vec<(DegreeKey, i64)> = Vec::new();
        for version in versions {
            let mut reader = files.open_reader(version)?;
            let charge = reader.file_len();
            memory.allocate(charge)?;
            let outcome = self.replay_file(&mut reader, &mut pending, updater, &mut replayed);
            memory.release(charge);
            if outcome? {
                break;
            }
        }
        if replayed < self.last_committed {
            return Err(StoreError::InvalidOwned(format!(
                "log history ends at tx {replayed}, expected {}",
                self.last_committed
            )));
        }
        debug!(replayed = replayed.0, "degrees.log_replay_complete");
        Ok(())
    }
}
