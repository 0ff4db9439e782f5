//! Versioned encoders and decoders for [`LogCommand`].
//!
//! Every entry is `tag u8 | body | crc32 u32` where the checksum covers the
//! tag and body. Codecs differ only in which commands they accept and in how
//! the enrichment sections are laid out:
//!
//! * `V4_3` predates enrichment and rejects it.
//! * `V5_12` writes all five section lengths first, then the five bodies.
//! * `V5_20` interleaves each length with its body.

use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use uuid::Uuid;

use super::command::{
    tags, CaptureMode, CheckpointEntry, CommitEntry, EnrichmentCommand, EnrichmentMetadata,
    GroupDegreeCommand, LogCommand, StartEntry,
};
use crate::primitives::bytes::{InMemoryChannel, ReadableChannel, WritableChannel};
use crate::types::{
    Direction, GroupId, LogCorruption, LogPosition, RelTypeId, Result, StoreError, TxId,
};

const SECTION_COUNT: usize = 5;
const CHECKSUM_LEN: u64 = 4;

/// Versioned log-command serialization.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub enum LogCommandCodec {
    /// 4.3 generation: no enrichment.
    V4_3,
    /// 5.12 generation: enrichment with grouped section lengths.
    V5_12,
    /// 5.20 generation: enrichment with interleaved section lengths.
    V5_20,
}

impl LogCommandCodec {
    /// Codec used for newly written logs.
    pub const LATEST: LogCommandCodec = LogCommandCodec::V5_20;

    /// Identifier stored in log file headers.
    pub fn id(self) -> u8 {
        match self {
            LogCommandCodec::V4_3 => 1,
            LogCommandCodec::V5_12 => 2,
            LogCommandCodec::V5_20 => 3,
        }
    }

    /// Resolves a header identifier.
    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(LogCommandCodec::V4_3),
            2 => Ok(LogCommandCodec::V5_12),
            3 => Ok(LogCommandCodec::V5_20),
            other => Err(StoreError::UnsupportedFormat(format!(
                "unknown log codec id {other}"
            ))),
        }
    }

    /// Short name used in errors and reports.
    pub fn name(self) -> &'static str {
        match self {
            LogCommandCodec::V4_3 => "V4_3",
            LogCommandCodec::V5_12 => "V5_12",
            LogCommandCodec::V5_20 => "V5_20",
        }
    }

    /// Whether this codec can encode and decode `tag`.
    pub fn supports(self, tag: u8) -> bool {
        match tag {
            tags::START | tags::COMMIT | tags::CHECKPOINT | tags::GROUP_DEGREE => true,
            tags::ENRICHMENT => self != LogCommandCodec::V4_3,
            _ => false,
        }
    }

    fn unsupported(self, tag: u8) -> StoreError {
        StoreError::UnsupportedCommand {
            tag,
            codec: self.name(),
        }
    }

    /// Encodes `command` into `channel` followed by its checksum.
    pub fn write<W: WritableChannel>(self, channel: &mut W, command: &LogCommand) -> Result<()> {
        let tag = command.tag();
        if !self.supports(tag) {
            return Err(self.unsupported(tag));
        }
        if let LogCommand::Enrichment(cmd) = command {
            for section in cmd.sections() {
                if section.len() > u32::MAX as usize {
                    return Err(StoreError::Invalid("enrichment section exceeds u32 length"));
                }
            }
        }
        channel.begin_checksum_for_writing();
        channel.put_u8(tag);
        match command {
            LogCommand::Start(entry) => {
                channel.put_u64(entry.tx_id.0);
                channel.put_u64(entry.time_written);
            }
            LogCommand::Commit(entry) => {
                channel.put_u64(entry.tx_id.0);
                channel.put_u64(entry.time_committed);
            }
            LogCommand::Checkpoint(entry) => {
                channel.put_u64(entry.tx_id.0);
                channel.put_u64(entry.position.log_version);
                channel.put_u64(entry.position.byte_offset);
                channel.put_u64(entry.time_written);
            }
            LogCommand::GroupDegree(cmd) => {
                channel.put_u64(cmd.group.0);
                channel.put_u32(cmd.rel_type.0);
                channel.put_u8(cmd.direction.as_u8());
                channel.put_i64(cmd.delta);
            }
            LogCommand::Enrichment(cmd) => {
                write_enrichment_metadata(channel, cmd.metadata());
                let sections = cmd.sections();
                if self == LogCommandCodec::V5_12 {
                    for section in sections {
                        channel.put_u32(section.len() as u32);
                    }
                    for section in sections {
                        channel.put_bytes(section);
                    }
                } else {
                    for section in sections {
                        channel.put_u32(section.len() as u32);
                        channel.put_bytes(section);
                    }
                }
            }
        }
        channel.put_checksum();
        Ok(())
    }

    /// Decodes one command, leaving the channel positioned after its checksum.
    ///
    /// Running out of bytes mid-entry yields [`LogCorruption::Truncated`]; a
    /// checksum disagreement yields [`LogCorruption::ChecksumMismatch`].
    pub fn read<R: ReadableChannel>(self, channel: &mut R) -> Result<LogCommand> {
        let start = channel.read_position();
        channel.begin_checksum_for_reading();
        let tag = channel.get_u8().map_err(|err| truncated(err, start))?;
        if !self.supports(tag) {
            return Err(self.unsupported(tag));
        }
        let command = self
            .read_body(channel, tag, start)
            .map_err(|err| truncated(err, start))?;
        channel
            .end_checksum_and_validate(start)
            .map_err(|err| truncated(err, start))?;
        Ok(command)
    }

    fn read_body<R: ReadableChannel>(self, channel: &mut R, tag: u8, start: u64) -> Result<LogCommand> {
        let command = match tag {
            tags::START => LogCommand::Start(StartEntry {
                tx_id: TxId(channel.get_u64()?),
                time_written: channel.get_u64()?,
            }),
            tags::COMMIT => LogCommand::Commit(CommitEntry {
                tx_id: TxId(channel.get_u64()?),
                time_committed: channel.get_u64()?,
            }),
            tags::CHECKPOINT => LogCommand::Checkpoint(CheckpointEntry {
                tx_id: TxId(channel.get_u64()?),
                position: LogPosition::new(channel.get_u64()?, channel.get_u64()?),
                time_written: channel.get_u64()?,
            }),
            tags::GROUP_DEGREE => {
                let group = GroupId(channel.get_u64()?);
                let rel_type = RelTypeId(channel.get_u32()?);
                let raw_dir = channel.get_u8()?;
                let delta = channel.get_i64()?;
                let direction = Direction::from_u8(raw_dir)
                    .ok_or_else(|| invalid_field(start, "direction"))?;
                LogCommand::GroupDegree(GroupDegreeCommand {
                    group,
                    rel_type,
                    direction,
                    delta,
                })
            }
            tags::ENRICHMENT => {
                let metadata = read_enrichment_metadata(channel, start)?;
                let mut sections: [Bytes; SECTION_COUNT] = Default::default();
                if self == LogCommandCodec::V5_12 {
                    let mut lens = [0u32; SECTION_COUNT];
                    for len in lens.iter_mut() {
                        *len = channel.get_u32()?;
                    }
                    let total: u64 = lens.iter().map(|l| *l as u64).sum();
                    if total + CHECKSUM_LEN > channel.remaining() {
                        return Err(ran_out(start));
                    }
                    for (section, len) in sections.iter_mut().zip(lens) {
                        *section = channel.get_bytes(len as usize)?;
                    }
                } else {
                    for section in sections.iter_mut() {
                        let len = channel.get_u32()? as u64;
                        if len + CHECKSUM_LEN > channel.remaining() {
                            return Err(ran_out(start));
                        }
                        *section = channel.get_bytes(len as usize)?;
                    }
                }
                let [entities, entity_details, changes, values, user] = sections;
                LogCommand::Enrichment(EnrichmentCommand::new(
                    metadata,
                    entities,
                    entity_details,
                    changes,
                    values,
                    Some(user),
                ))
            }
            other => return Err(self.unsupported(other)),
        };
        Ok(command)
    }

    /// Encodes a single command into a fresh buffer.
    pub fn encode(self, command: &LogCommand) -> Result<Vec<u8>> {
        let mut channel = InMemoryChannel::new();
        self.write(&mut channel, command)?;
        Ok(channel.into_inner())
    }

    /// Decodes a single command from `bytes`.
    pub fn decode(self, bytes: &[u8]) -> Result<LogCommand> {
        let mut channel = InMemoryChannel::from_vec(bytes.to_vec(), 0);
        self.read(&mut channel)
    }
}

impl fmt::Display for LogCommandCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn write_enrichment_metadata<W: WritableChannel>(channel: &mut W, meta: &EnrichmentMetadata) {
    channel.put_u8(meta.capture_mode as u8);
    channel.put_bytes(meta.server_id.as_bytes());
    channel.put_u64(meta.last_committed_tx.0);
    channel.put_u64(meta.time_committed);
    channel.put_u32(meta.user_id);
}

fn read_enrichment_metadata<R: ReadableChannel>(
    channel: &mut R,
    start: u64,
) -> Result<EnrichmentMetadata> {
    let raw_mode = channel.get_u8()?;
    let server = channel.get_bytes(16)?;
    let last_committed_tx = TxId(channel.get_u64()?);
    let time_committed = channel.get_u64()?;
    let user_id = channel.get_u32()?;
    let capture_mode =
        CaptureMode::from_u8(raw_mode).ok_or_else(|| invalid_field(start, "capture mode"))?;
    let server_id =
        Uuid::from_slice(&server).map_err(|_| invalid_field(start, "server id"))?;
    Ok(EnrichmentMetadata {
        capture_mode,
        server_id,
        last_committed_tx,
        time_committed,
        user_id,
    })
}

fn truncated(err: StoreError, start: u64) -> StoreError {
    match err {
        StoreError::ReadPastEnd { .. } => StoreError::CorruptLogEntry {
            position: start,
            reason: LogCorruption::Truncated,
        },
        other => other,
    }
}

/// A declared section longer than the bytes left means the entry was cut
/// short, the same as running out mid-field.
fn ran_out(start: u64) -> StoreError {
    StoreError::CorruptLogEntry {
        position: start,
        reason: LogCorruption::Truncated,
    }
}

fn invalid_field(start: u64, what: &'static str) -> StoreError {
    StoreError::CorruptLogEntry {
        position: start,
        reason: LogCorruption::InvalidField(what),
    }
}
