#![forbid(unsafe_code)]
//! Identifiers, the crate error type and small encoding helpers shared by
//! every storage component.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// CRC32 checksum helpers.
pub mod checksum;

pub use checksum::{record_crc32, Checksum, Crc32Fast};

/// Transaction identifier. Committed transactions are numbered densely from
/// [`TxId::BASE`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct TxId(pub u64);

impl TxId {
    /// Identifier of the implicit transaction that created an empty store.
    pub const BASE: TxId = TxId(1);

    /// Returns the identifier that follows `self`.
    pub fn next(self) -> TxId {
        TxId(self.0 + 1)
    }
}

impl Default for TxId {
    fn default() -> Self {
        TxId::BASE
    }
}

/// Relationship-group record identifier.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct GroupId(pub u64);

/// Relationship type token.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
pub struct RelTypeId(pub u32);

/// Position inside the transaction log: file version plus byte offset.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
pub struct LogPosition {
    /// Version number of the log file.
    pub log_version: u64,
    /// Byte offset within that file.
    pub byte_offset: u64,
}

impl LogPosition {
    /// Position used when no log has been written.
    pub const START: LogPosition = LogPosition {
        log_version: 0,
        byte_offset: 0,
    };

    /// Creates a new log position.
    pub const fn new(log_version: u64, byte_offset: u64) -> Self {
        Self {
            log_version,
            byte_offset,
        }
    }
}

/// Direction of a relationship relative to the node owning the group.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
#[repr(u8)]
pub enum Direction {
    /// Relationship starts at the owning node.
    Outgoing = 0,
    /// Relationship ends at the owning node.
    Incoming = 1,
    /// Relationship starts and ends at the owning node.
    Loop = 2,
}

impl Direction {
    /// All directions in encoding order.
    pub const ALL: [Direction; 3] = [Direction::Outgoing, Direction::Incoming, Direction::Loop];

    /// Returns the on-disk byte for this direction.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decodes a direction byte.
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(Direction::Outgoing),
            1 => Some(Direction::Incoming),
            2 => Some(Direction::Loop),
            _ => None,
        }
    }
}

/// Reason a log entry could not be decoded.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LogCorruption {
    /// Stored checksum did not match the entry bytes.
    ChecksumMismatch,
    /// The entry extends past the end of the readable bytes.
    Truncated,
    /// A field held a value outside its domain.
    InvalidField(&'static str),
}

impl fmt::Display for LogCorruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogCorruption::ChecksumMismatch => f.write_str("checksum mismatch"),
            LogCorruption::Truncated => f.write_str("entry truncated"),
            LogCorruption::InvalidField(field) => write!(f, "invalid {field}"),
        }
    }
}

/// Errors produced by the record store.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    /// Underlying file system failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A persisted structure failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an invalid argument (formatted message).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// A required file or entry does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The store's format marker is unknown or the requested transition is not allowed.
    #[error("unsupported store format: {0}")]
    UnsupportedFormat(String),
    /// A transaction log entry failed to decode.
    #[error("corrupt log entry at offset {position}: {reason}")]
    CorruptLogEntry {
        /// Byte offset of the entry start.
        position: u64,
        /// What went wrong.
        reason: LogCorruption,
    },
    /// The command tag is unknown or not supported by the codec in use.
    #[error("log command tag {tag} is not supported by codec {codec}")]
    UnsupportedCommand {
        /// Tag byte found in the log.
        tag: u8,
        /// Name of the codec that rejected it.
        codec: &'static str,
    },
    /// A channel read asked for more bytes than remain.
    #[error("read past end of channel at offset {position}")]
    ReadPastEnd {
        /// Offset where the read started.
        position: u64,
    },
    /// The staging area holds an inconsistent mix of artifacts.
    #[error("partial migration: {0}")]
    PartialMigration(String),
    /// Promotion would silently change an identity field.
    #[error("store identity mismatch on {field}: {before} -> {after}")]
    IdentityMismatch {
        /// Identity field that differs.
        field: &'static str,
        /// Value currently in the target store.
        before: String,
        /// Value staged for promotion.
        after: String,
    },
    /// A memory tracker refused an allocation.
    #[error("memory limit exceeded: requested {requested} bytes with {limit} byte limit")]
    MemoryLimitExceeded {
        /// Total bytes that would have been outstanding.
        requested: u64,
        /// Configured limit.
        limit: u64,
    },
}

impl StoreError {
    /// Returns true for errors that indicate damaged persistent state.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StoreError::Corruption(_)
                | StoreError::CorruptLogEntry { .. }
                | StoreError::PartialMigration(_)
        )
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StoreError>;

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RelTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.log_version, self.byte_offset)
    }
}

/// Copies a fixed-width field out of `buf`, failing with `what` when the
/// buffer is too short.
pub(crate) fn field<const N: usize>(
    buf: &[u8],
    range: std::ops::Range<usize>,
    what: &'static str,
) -> Result<[u8; N]> {
    buf.get(range)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(StoreError::Corruption(what))
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
