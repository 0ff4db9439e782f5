//! Record files: a fixed header followed by an opaque, checksummed payload.

use std::ops::Range;
use std::path::Path;

use bytes::Bytes;

use crate::primitives::io::{write_file_atomic, StdFileIo};
use crate::types::{field, record_crc32, Result, StoreError};

/// Encoded header width.
pub const RECORD_HEADER_LEN: usize = 32;

const RECORD_MAGIC: [u8; 4] = *b"RSRF";

const REC_MAGIC: Range<usize> = 0..4;
const REC_LAYOUT: Range<usize> = 4..6;
const REC_KIND: usize = 6;
const REC_RESERVED: usize = 7;
const REC_COUNT: Range<usize> = 8..16;
const REC_PAYLOAD_LEN: Range<usize> = 16..24;
const REC_RESERVED_2: Range<usize> = 24..28;
const REC_CRC32: Range<usize> = 28..32;

/// Kind of record held by a record file.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum RecordKind {
    /// Node records.
    Node = 1,
    /// Relationship records.
    Relationship = 2,
    /// Relationship-group records.
    RelationshipGroup = 3,
    /// Property records.
    Property = 4,
}

impl RecordKind {
    /// Every record kind in file order.
    pub const ALL: [RecordKind; 4] = [
        RecordKind::Node,
        RecordKind::Relationship,
        RecordKind::RelationshipGroup,
        RecordKind::Property,
    ];

    /// File name inside the database directory.
    pub fn file_name(self) -> &'static str {
        match self {
            RecordKind::Node => "nodes.db",
            RecordKind::Relationship => "relationships.db",
            RecordKind::RelationshipGroup => "relationship_groups.db",
            RecordKind::Property => "properties.db",
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        RecordKind::ALL.into_iter().find(|k| *k as u8 == raw)
    }
}

/// Parsed record file header.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordFileHeader {
    /// Record layout id of the owning format.
    pub layout: u16,
    /// Record kind.
    pub kind: RecordKind,
    /// Number of records in the payload.
    pub record_count: u64,
    /// Payload length in bytes.
    pub payload_len: u64,
}

/// A record file held in memory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RecordFile {
    header: RecordFileHeader,
    payload: Bytes,
}

impl RecordFile {
    /// Builds a record file around `payload`.
    pub fn new(kind: RecordKind, layout: u16, record_count: u64, payload: Bytes) -> Self {
        Self {
            header: RecordFileHeader {
                layout,
                kind,
                record_count,
                payload_len: payload.len() as u64,
            },
            payload,
        }
    }

    /// Header fields.
    pub fn header(&self) -> &RecordFileHeader {
        &self.header
    }

    /// Record payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Same records under a different layout id.
    pub fn with_layout(&self, layout: u16) -> Self {
        Self::new(
            self.header.kind,
            layout,
            self.header.record_count,
            self.payload.clone(),
        )
    }

    /// Serializes header, payload and checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; RECORD_HEADER_LEN];
        buf[REC_MAGIC].copy_from_slice(&RECORD_MAGIC);
        buf[REC_LAYOUT].copy_from_slice(&self.header.layout.to_be_bytes());
        buf[REC_KIND] = self.header.kind as u8;
        buf[REC_COUNT].copy_from_slice(&self.header.record_count.to_be_bytes());
        buf[REC_PAYLOAD_LEN].copy_from_slice(&self.header.payload_len.to_be_bytes());
        let crc = record_crc32(&[&buf[..REC_CRC32.start], &self.payload]);
        buf[REC_CRC32].copy_from_slice(&crc.to_be_bytes());
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Parses and verifies an encoded record file.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < RECORD_HEADER_LEN {
            return Err(StoreError::Corruption("record file header truncated"));
        }
        if buf[REC_MAGIC] != RECORD_MAGIC {
            return Err(StoreError::Corruption("record file magic mismatch"));
        }
        if buf[REC_RESERVED] != 0 || buf[REC_RESERVED_2].iter().any(|b| *b != 0) {
            return Err(StoreError::Corruption("record file reserved field non-zero"));
        }
        let kind = RecordKind::from_u8(buf[REC_KIND])
            .ok_or(StoreError::Corruption("record file kind unknown"))?;
        let payload_len = u64::from_be_bytes(field(buf, REC_PAYLOAD_LEN, "record payload len")?);
        let payload = &buf[RECORD_HEADER_LEN..];
        if payload.len() as u64 != payload_len {
            return Err(StoreError::Corruption("record file payload length mismatch"));
        }
        let stored = u32::from_be_bytes(field(buf, REC_CRC32, "record file crc")?);
        if stored != record_crc32(&[&buf[..REC_CRC32.start], payload]) {
            return Err(StoreError::Corruption("record file crc mismatch"));
        }
        Ok(Self {
            header: RecordFileHeader {
                layout: u16::from_be_bytes(field(buf, REC_LAYOUT, "record layout")?),
                kind,
                record_count: u64::from_be_bytes(field(buf, REC_COUNT, "record count")?),
                payload_len,
            },
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Loads and verifies the file at `path`.
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = StdFileIo::open_read_only(path)?.read_all()?;
        Self::decode(&bytes)
    }

    /// Loads `path` and checks it holds `kind` records in `layout`.
    pub fn read_expecting(path: &Path, kind: RecordKind, layout: u16) -> Result<Self> {
        let file = Self::read(path)?;
        if file.header.kind != kind {
            return Err(StoreError::Corruption("record file holds unexpected kind"));
        }
        if file.header.layout != layout {
            return Err(StoreError::InvalidOwned(format!(
                "{} has record layout {}, expected {layout}",
                path.display(),
                file.header.layout
            )));
        }
        Ok(file)
    }

    /// Atomically writes the file to `path`.
    pub fn write(&self, path: &Path, sync: bool) -> Result<u64> {
        let bytes = self.encode();
        write_file_atomic(path, &bytes, sync)?;
        Ok(bytes.len() as u64)
    }
}
