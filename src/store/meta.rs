//! Metadata file: format marker, store identity and transaction counters.
//!
//! Layout (big-endian):
//!
//! ```text
//! 0..4    magic "RSMD"
//! 4..20   format marker, ASCII, zero padded
//! 20..28  store creation time (ms)
//! 28..36  store random
//! 36..52  database uuid
//! 52..68  external store id
//! 68..76  last committed transaction
//! 76..84  checkpoint log version (layout 2 only)
//! ..+4    crc32 of everything before it
//! ```

use std::fmt;
use std::ops::Range;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::format::{MetadataLayout, StoreVersion};
use crate::primitives::io::{write_file_atomic, StdFileIo};
use crate::types::{field, now_millis, record_crc32, Result, StoreError, TxId};

const META_MAGIC: [u8; 4] = *b"RSMD";
const MARKER_LEN: usize = 16;

const META_MAGIC_RANGE: Range<usize> = 0..4;
const META_MARKER: Range<usize> = 4..20;
const META_CREATION_TIME: Range<usize> = 20..28;
const META_RANDOM: Range<usize> = 28..36;
const META_DATABASE_UUID: Range<usize> = 36..52;
const META_EXTERNAL_ID: Range<usize> = 52..68;
const META_LAST_COMMITTED_TX: Range<usize> = 68..76;
const META_CHECKPOINT_LOG_VERSION: Range<usize> = 76..84;

const V1_BODY_LEN: usize = 76;
const V2_BODY_LEN: usize = 84;

/// Internal store identity, regenerated only on explicit request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct StoreId {
    /// Creation time in milliseconds.
    pub creation_time: u64,
    /// Random discriminator.
    pub random: u64,
}

impl StoreId {
    /// Fresh id stamped with the current time.
    pub fn generate() -> Self {
        Self {
            creation_time: now_millis(),
            random: OsRng.next_u64(),
        }
    }
}

impl fmt::Display for StoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:016x}", self.creation_time, self.random)
    }
}

/// Identity exposed to clustering and backup tooling. Never changes.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
pub struct ExternalStoreId(pub Uuid);

impl fmt::Display for ExternalStoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Everything that identifies a store.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct StoreIdentity {
    /// Internal store id.
    pub store_id: StoreId,
    /// Database UUID.
    pub database_uuid: Uuid,
    /// External store id.
    pub external_store_id: ExternalStoreId,
}

impl StoreIdentity {
    /// Fresh random identity.
    pub fn generate() -> Self {
        Self {
            store_id: StoreId::generate(),
            database_uuid: Uuid::new_v4(),
            external_store_id: ExternalStoreId(Uuid::new_v4()),
        }
    }
}

/// Decoded contents of a metadata file.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct MetaData {
    /// Store format.
    pub store_version: StoreVersion,
    /// Store identity.
    pub identity: StoreIdentity,
    /// Last committed transaction known to the stores.
    pub last_committed_tx: TxId,
    /// Log version of the last checkpoint; absent in layout 1.
    pub checkpoint_log_version: Option<u64>,
}

impl MetaData {
    /// Serializes in the layout of `store_version`.
    pub fn encode(&self) -> Vec<u8> {
        let layout = self.store_version.metadata_layout();
        let body_len = body_len(layout);
        let mut buf = vec![0u8; body_len + 4];
        buf[META_MAGIC_RANGE].copy_from_slice(&META_MAGIC);
        let marker = self.store_version.marker().as_bytes();
        buf[META_MARKER.start..META_MARKER.start + marker.len()].copy_from_slice(marker);
        let id = &self.identity;
        buf[META_CREATION_TIME].copy_from_slice(&id.store_id.creation_time.to_be_bytes());
        buf[META_RANDOM].copy_from_slice(&id.store_id.random.to_be_bytes());
        buf[META_DATABASE_UUID].copy_from_slice(id.database_uuid.as_bytes());
        buf[META_EXTERNAL_ID].copy_from_slice(id.external_store_id.0.as_bytes());
        buf[META_LAST_COMMITTED_TX].copy_from_slice(&self.last_committed_tx.0.to_be_bytes());
        if layout == MetadataLayout::V2 {
            let version = self.checkpoint_log_version.unwrap_or(0);
            buf[META_CHECKPOINT_LOG_VERSION].copy_from_slice(&version.to_be_bytes());
        }
        let crc = record_crc32(&[&buf[..body_len]]);
        buf[body_len..].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses and verifies a metadata file.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let marker = decode_marker(buf)?;
        let store_version = StoreVersion::from_marker(&marker)?;
        let body_len = body_len(store_version.metadata_layout());
        if buf.len() != body_len + 4 {
            return Err(StoreError::Corruption("metadata length mismatch"));
        }
        let stored = u32::from_be_bytes(field(buf, body_len..body_len + 4, "metadata crc")?);
        if stored != record_crc32(&[&buf[..body_len]]) {
            return Err(StoreError::Corruption("metadata crc mismatch"));
        }
        let identity = StoreIdentity {
            store_id: StoreId {
                creation_time: u64::from_be_bytes(field(buf, META_CREATION_TIME, "creation")?),
                random: u64::from_be_bytes(field(buf, META_RANDOM, "store random")?),
            },
            database_uuid: Uuid::from_bytes(field(buf, META_DATABASE_UUID, "database uuid")?),
            external_store_id: ExternalStoreId(Uuid::from_bytes(field(
                buf,
                META_EXTERNAL_ID,
                "external store id",
            )?)),
        };
        let checkpoint_log_version = match store_version.metadata_layout() {
            MetadataLayout::V1 => None,
            MetadataLayout::V2 => Some(u64::from_be_bytes(field(
                buf,
                META_CHECKPOINT_LOG_VERSION,
                "checkpoint log version",
            )?)),
        };
        Ok(Self {
            store_version,
            identity,
            last_committed_tx: TxId(u64::from_be_bytes(field(
                buf,
                META_LAST_COMMITTED_TX,
                "last committed tx",
            )?)),
            checkpoint_log_version,
        })
    }
}

fn body_len(layout: MetadataLayout) -> usize {
    match layout {
        MetadataLayout::V1 => V1_BODY_LEN,
        MetadataLayout::V2 => V2_BODY_LEN,
    }
}

fn decode_marker(buf: &[u8]) -> Result<String> {
    if buf.len() < META_MARKER.end {
        return Err(StoreError::Corruption("metadata truncated"));
    }
    if buf[META_MAGIC_RANGE] != META_MAGIC {
        return Err(StoreError::Corruption("metadata magic mismatch"));
    }
    let raw = &buf[META_MARKER];
    let end = raw.iter().position(|b| *b == 0).unwrap_or(MARKER_LEN);
    std::str::from_utf8(&raw[..end])
        .map(str::to_owned)
        .map_err(|_| StoreError::Corruption("metadata marker is not ASCII"))
}

/// Read and write access to store identity and counters.
pub trait MetadataProvider {
    /// Internal store id.
    fn store_id(&self) -> StoreId;
    /// External store id.
    fn external_store_id(&self) -> ExternalStoreId;
    /// Database UUID.
    fn database_id_uuid(&self) -> Uuid;
    /// Replaces the database UUID and persists it.
    fn set_database_id_uuid(&self, uuid: Uuid) -> Result<()>;
    /// Last committed transaction.
    fn last_committed_tx(&self) -> TxId;
    /// Log version of the last checkpoint, zero when never recorded.
    fn checkpoint_log_version(&self) -> u64;
}

/// Metadata file handle with an in-memory copy.
pub struct MetaDataStore {
    path: PathBuf,
    data: RwLock<MetaData>,
    sync: bool,
}

impl MetaDataStore {
    /// Writes a new metadata file and returns a handle to it.
    pub fn create(path: &Path, data: MetaData, sync: bool) -> Result<Self> {
        Self::write(path, &data, sync)?;
        Ok(Self {
            path: path.to_path_buf(),
            data: RwLock::new(data),
            sync,
        })
    }

    /// Opens an existing metadata file.
    pub fn open(path: &Path, sync: bool) -> Result<Self> {
        let data = Self::read(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            data: RwLock::new(data),
            sync,
        })
    }

    /// Decodes the metadata file at `path`.
    pub fn read(path: &Path) -> Result<MetaData> {
        let bytes = StdFileIo::open_read_only(path)?.read_all()?;
        MetaData::decode(&bytes)
    }

    /// Reads only the format marker, without resolving it.
    pub fn read_format_marker(path: &Path) -> Result<String> {
        let bytes = StdFileIo::open_read_only(path)?.read_all()?;
        decode_marker(&bytes)
    }

    /// Atomically replaces the metadata file at `path`.
    pub fn write(path: &Path, data: &MetaData, sync: bool) -> Result<()> {
        write_file_atomic(path, &data.encode(), sync)?;
        debug!(
            path = %path.display(),
            version = data.store_version.marker(),
            last_committed = data.last_committed_tx.0,
            "metadata.written"
        );
        Ok(())
    }

    /// Snapshot of the current contents.
    pub fn data(&self) -> MetaData {
        self.data.read().clone()
    }

    /// Store format recorded in the file.
    pub fn store_version(&self) -> StoreVersion {
        self.data.read().store_version
    }

    /// Records a newer last committed transaction and persists it.
    pub fn set_last_committed_tx(&self, tx_id: TxId) -> Result<()> {
        self.update(|data| data.last_committed_tx = tx_id)
    }

    fn update(&self, f: impl FnOnce(&mut MetaData)) -> Result<()> {
        let mut guard = self.data.write();
        let mut next = guard.clone();
        f(&mut next);
        Self::write(&self.path, &next, self.sync)?;
        *guard = next;
        Ok(())
    }
}

impl MetadataProvider for MetaDataStore {
    fn store_id(&self) -> StoreId {
        self.data.read().identity.store_id
    }

    fn external_store_id(&self) -> ExternalStoreId {
        self.data.read().identity.external_store_id
    }

    fn database_id_uuid(&self) -> Uuid {
        self.data.read().identity.database_uuid
    }

    fn set_database_id_uuid(&self, uuid: Uuid) -> Result<()> {
        self.update(|data| data.identity.database_uuid = uuid)
    }

    fn last_committed_tx(&self) -> TxId {
        self.data.read().last_committed_tx
    }

    fn checkpoint_log_version(&self) -> u64 {
        self.data.read().checkpoint_log_version.unwrap_or(0)
    }
}
