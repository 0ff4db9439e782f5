//! Log command model.

use bytes::Bytes;
use uuid::Uuid;

use crate::types::{Direction, GroupId, LogPosition, RelTypeId, TxId};

/// Tag bytes that open every encoded log entry.
pub mod tags {
    /// Transaction start.
    pub const START: u8 = 1;
    /// Transaction commit.
    pub const COMMIT: u8 = 2;
    /// Checkpoint marker.
    pub const CHECKPOINT: u8 = 3;
    /// Relationship-group degree delta.
    pub const GROUP_DEGREE: u8 = 4;
    /// Change-data-capture enrichment.
    pub const ENRICHMENT: u8 = 5;
}

/// Opens a transaction in the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StartEntry {
    /// Transaction being started.
    pub tx_id: TxId,
    /// Wall-clock time the entry was written, in milliseconds.
    pub time_written: u64,
}

/// Closes a transaction in the log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommitEntry {
    /// Transaction being committed.
    pub tx_id: TxId,
    /// Wall-clock commit time, in milliseconds.
    pub time_committed: u64,
}

/// Records that every transaction up to `tx_id` is durable in the stores.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CheckpointEntry {
    /// Last transaction covered by the checkpoint.
    pub tx_id: TxId,
    /// Log position recovery would start from.
    pub position: LogPosition,
    /// Wall-clock time the entry was written, in milliseconds.
    pub time_written: u64,
}

/// Signed change to the degree of one `(group, type, direction)` key.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GroupDegreeCommand {
    /// Relationship group being changed.
    pub group: GroupId,
    /// Relationship type.
    pub rel_type: RelTypeId,
    /// Direction relative to the group owner.
    pub direction: Direction,
    /// Amount added to the degree.
    pub delta: i64,
}

/// How much of an entity change a capture entry holds.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum CaptureMode {
    /// Only changed properties.
    Diff = 1,
    /// Complete before/after state.
    Full = 2,
}

impl CaptureMode {
    /// Decodes a capture-mode byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(CaptureMode::Diff),
            2 => Some(CaptureMode::Full),
            _ => None,
        }
    }
}

/// Fixed-width header of an enrichment command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnrichmentMetadata {
    /// Capture mode the sections were produced with.
    pub capture_mode: CaptureMode,
    /// Server that produced the change.
    pub server_id: Uuid,
    /// Last transaction committed before this one.
    pub last_committed_tx: TxId,
    /// Commit time, in milliseconds.
    pub time_committed: u64,
    /// Token of the user who made the change.
    pub user_id: u32,
}

/// Encoded width of [`EnrichmentMetadata`].
pub const ENRICHMENT_METADATA_LEN: usize = 1 + 16 + 8 + 8 + 4;

/// Change-data-capture payload: metadata plus opaque sections.
///
/// The last section is optional and an empty one is treated as absent, so a
/// decoded command never holds `Some` of an empty buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EnrichmentCommand {
    metadata: EnrichmentMetadata,
    entities: Bytes,
    entity_details: Bytes,
    changes: Bytes,
    values: Bytes,
    user_metadata: Option<Bytes>,
}

impl EnrichmentCommand {
    /// Builds a command; empty `user_metadata` is normalised to `None`.
    pub fn new(
        metadata: EnrichmentMetadata,
        entities: Bytes,
        entity_details: Bytes,
        changes: Bytes,
        values: Bytes,
        user_metadata: Option<Bytes>,
    ) -> Self {
        Self {
            metadata,
            entities,
            entity_details,
            changes,
            values,
            user_metadata: user_metadata.filter(|b| !b.is_empty()),
        }
    }

    /// Fixed-width header.
    pub fn metadata(&self) -> &EnrichmentMetadata {
        &self.metadata
    }

    /// Entity identifiers section.
    pub fn entities(&self) -> &Bytes {
        &self.entities
    }

    /// Per-entity detail section.
    pub fn entity_details(&self) -> &Bytes {
        &self.entity_details
    }

    /// Change descriptors section.
    pub fn changes(&self) -> &Bytes {
        &self.changes
    }

    /// Property values section.
    pub fn values(&self) -> &Bytes {
        &self.values
    }

    /// Optional user-supplied metadata.
    pub fn user_metadata(&self) -> Option<&Bytes> {
        self.user_metadata.as_ref()
    }

    /// Sections in encoding order; an absent user section is empty.
    pub(crate) fn sections(&self) -> [&[u8]; 5] {
        [
            &self.entities,
            &self.entity_details,
            &self.changes,
            &self.values,
            self.user_metadata.as_deref().unwrap_or(&[]),
        ]
    }
}

/// One entry of the transaction log.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogCommand {
    /// Transaction start.
    Start(StartEntry),
    /// Transaction commit.
    Commit(CommitEntry),
    /// Checkpoint marker.
    Checkpoint(CheckpointEntry),
    /// Degree delta.
    GroupDegree(GroupDegreeCommand),
    /// Change-data-capture enrichment.
    Enrichment(EnrichmentCommand),
}

impl LogCommand {
    /// Tag byte that introduces this command on disk.
    pub fn tag(&self) -> u8 {
        match self {
            LogCommand::Start(_) => tags::START,
            LogCommand::Commit(_) => tags::COMMIT,
            LogCommand::Checkpoint(_) => tags::CHECKPOINT,
            LogCommand::GroupDegree(_) => tags::GROUP_DEGREE,
            LogCommand::Enrichment(_) => tags::ENRICHMENT,
        }
    }

    /// True for commands that may appear between a start and its commit.
    pub fn is_transaction_body(&self) -> bool {
        matches!(self, LogCommand::GroupDegree(_) | LogCommand::Enrichment(_))
    }
}
