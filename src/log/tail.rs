//! Summary of the newest transaction log file.

use serde::Serialize;
use tracing::{debug, warn};

use super::codec::LogCommandCodec;
use super::command::LogCommand;
use super::files::{is_torn_write, LogFiles};
use crate::primitives::memory::MemoryTracker;
use crate::store::layout::DatabaseLayout;
use crate::types::{LogPosition, Result, StoreError, TxId};

/// Last checkpoint found in the log.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CheckpointInfo {
    /// Last transaction the checkpoint covers.
    pub tx_id: TxId,
    /// Position recovery would start from.
    pub position: LogPosition,
    /// Where the checkpoint entry itself sits.
    pub entry_position: LogPosition,
}

/// What the log says about committed history.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct LogTailMetadata {
    /// Highest committed transaction.
    pub last_committed_tx: TxId,
    /// Position just after that transaction's commit entry.
    pub last_committed_position: LogPosition,
    /// Position after the last readable entry.
    pub end_position: LogPosition,
    /// Newest checkpoint in the newest file.
    pub last_checkpoint: Option<CheckpointInfo>,
    /// An open transaction or a torn entry was found at the end.
    pub recovery_required: bool,
    /// Codec of the newest file.
    pub codec: Option<LogCommandCodec>,
    empty: bool,
}

/// Tail reported when no log files exist.
pub const EMPTY_LOG_TAIL: LogTailMetadata = LogTailMetadata {
    last_committed_tx: TxId::BASE,
    last_committed_position: LogPosition::START,
    end_position: LogPosition::START,
    last_checkpoint: None,
    recovery_required: false,
    codec: None,
    empty: true,
};

impl LogTailMetadata {
    /// True when there was no log to read.
    pub fn is_empty(&self) -> bool {
        self.empty
    }
}

/// Reads the newest log file and summarises its tail.
#[derive(Clone, Debug, Default)]
pub struct LogTailExtractor;

impl LogTailExtractor {
    /// Creates an extractor.
    pub fn new() -> Self {
        Self
    }

    /// Scans the newest log file in `layout`.
    ///
    /// A torn final entry ends the scan and flags recovery; any other decode
    /// failure is returned. The file buffer is charged to `memory` for the
    /// duration of the scan.
    pub fn tail_metadata(
        &self,
        layout: &DatabaseLayout,
        memory: &MemoryTracker,
    ) -> Result<LogTailMetadata> {
        let files = LogFiles::new(layout);
        let Some(version) = files.highest_version()? else {
            debug!(dir = %layout.database_directory().display(), "log_tail.no_logs");
            return Ok(EMPTY_LOG_TAIL);
        };
        let file_len = std::fs::metadata(files.path_for(version))?.len();
        memory.allocate(file_len)?;
        let result = scan(&files, version);
        memory.release(file_len);
        result
    }
}

fn scan(files: &LogFiles, version: u64) -> Result<LogTailMetadata> {
    let mut reader = files.open_reader(version)?;
    let header = reader.header().clone();
    let mut last_committed_tx = header.last_committed_tx_before;
    let mut last_committed_position = reader.position();
    let mut last_checkpoint = None;
    let mut open_tx: Option<TxId> = None;
    let mut torn = false;
    loop {
        let entry_position = reader.position();
        let command = match reader.next_command() {
            Ok(Some(command)) => command,
            Ok(None) => break,
            Err(err) if is_torn_write(&err) => {
                warn!(position = %entry_position, "log_tail.torn_entry");
                torn = true;
                break;
            }
            Err(err) => return Err(err),
        };
        match command {
            LogCommand::Start(start) => {
                if open_tx.is_some() {
                    return Err(StoreError::Corruption(
                        "transaction start inside an open transaction",
                    ));
                }
                open_tx = Some(start.tx_id);
            }
            LogCommand::Commit(commit) => {
                if open_tx != Some(commit.tx_id) {
                    return Err(StoreError::Corruption("commit without matching start"));
                }
                if commit.tx_id != last_committed_tx.next() {
                    return Err(StoreError::Corruption("non-sequential transaction commit"));
                }
                open_tx = None;
                last_committed_tx = commit.tx_id;
                last_committed_position = reader.position();
            }
            LogCommand::Checkpoint(checkpoint) => {
                last_checkpoint = Some(CheckpointInfo {
                    tx_id: checkpoint.tx_id,
                    position: checkpoint.position,
                    entry_position,
                });
            }
            LogCommand::GroupDegree(_) | LogCommand::Enrichment(_) => {
                if open_tx.is_none() {
                    return Err(StoreError::Corruption(
                        "transaction body outside a transaction",
                    ));
                }
            }
        }
    }
    let tail = LogTailMetadata {
        last_committed_tx,
        last_committed_position,
        end_position: reader.position(),
        last_checkpoint,
        recovery_required: torn || open_tx.is_some(),
        codec: Some(header.codec),
        empty: false,
    };
    debug!(
        log_version = version,
        last_committed = tail.last_committed_tx.0,
        recovery_required = tail.recovery_required,
        "log_tail.scanned"
    );
    Ok(tail)
}
