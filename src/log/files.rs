//! Transaction log files: naming, headers, reading and appending.
//!
//! Each file is `transaction.log.<version>` and starts with a fixed 40-byte
//! header followed by codec-encoded entries.

use std::fs;
use std::io::ErrorKind;
use std::ops::Range;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::codec::LogCommandCodec;
use super::command::{CheckpointEntry, CommitEntry, LogCommand, StartEntry};
use crate::primitives::bytes::{InMemoryChannel, ReadableChannel};
use crate::primitives::io::{sync_dir, FileIo, StdFileIo};
use crate::store::layout::DatabaseLayout;
use crate::types::{
    field, now_millis, record_crc32, LogCorruption, LogPosition, Result, StoreError, TxId,
};

/// File name prefix shared by all log versions.
pub const LOG_FILE_PREFIX: &str = "transaction.log.";
/// Encoded header width.
pub const LOG_HEADER_LEN: usize = 40;

const LOG_MAGIC: [u8; 4] = *b"RSTL";
const LOG_HEADER_VERSION: u16 = 1;

const HDR_MAGIC: Range<usize> = 0..4;
const HDR_VERSION: Range<usize> = 4..6;
const HDR_CODEC: usize = 6;
const HDR_RESERVED: usize = 7;
const HDR_LOG_VERSION: Range<usize> = 8..16;
const HDR_PREV_TX: Range<usize> = 16..24;
const HDR_STORE_RANDOM: Range<usize> = 24..32;
const HDR_RESERVED_2: Range<usize> = 32..36;
const HDR_CRC32: Range<usize> = 36..40;

/// Header at the start of every log file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LogHeader {
    /// Codec used by every entry in the file.
    pub codec: LogCommandCodec,
    /// Version number, equal to the file name suffix.
    pub log_version: u64,
    /// Last transaction committed before this file begins.
    pub last_committed_tx_before: TxId,
    /// Random part of the owning store's id.
    pub store_random: u64,
}

impl LogHeader {
    /// Serializes the header including its checksum.
    pub fn encode(&self) -> [u8; LOG_HEADER_LEN] {
        let mut buf = [0u8; LOG_HEADER_LEN];
        buf[HDR_MAGIC].copy_from_slice(&LOG_MAGIC);
        buf[HDR_VERSION].copy_from_slice(&LOG_HEADER_VERSION.to_be_bytes());
        buf[HDR_CODEC] = self.codec.id();
        buf[HDR_LOG_VERSION].copy_from_slice(&self.log_version.to_be_bytes());
        buf[HDR_PREV_TX].copy_from_slice(&self.last_committed_tx_before.0.to_be_bytes());
        buf[HDR_STORE_RANDOM].copy_from_slice(&self.store_random.to_be_bytes());
        let crc = record_crc32(&[&buf[..HDR_CRC32.start]]);
        buf[HDR_CRC32].copy_from_slice(&crc.to_be_bytes());
        buf
    }

    /// Parses and verifies a header.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < LOG_HEADER_LEN {
            return Err(StoreError::Corruption("log header truncated"));
        }
        if buf[HDR_MAGIC] != LOG_MAGIC {
            return Err(StoreError::Corruption("log header magic mismatch"));
        }
        let stored = u32::from_be_bytes(field(buf, HDR_CRC32, "log header crc")?);
        if stored != record_crc32(&[&buf[..HDR_CRC32.start]]) {
            return Err(StoreError::Corruption("log header crc mismatch"));
        }
        let version = u16::from_be_bytes(field(buf, HDR_VERSION, "log header version")?);
        if version != LOG_HEADER_VERSION {
            return Err(StoreError::UnsupportedFormat(format!(
                "log header version {version}"
            )));
        }
        if buf[HDR_RESERVED] != 0 || buf[HDR_RESERVED_2].iter().any(|b| *b != 0) {
            return Err(StoreError::Corruption("log header reserved field non-zero"));
        }
        Ok(Self {
            codec: LogCommandCodec::from_id(buf[HDR_CODEC])?,
            log_version: u64::from_be_bytes(field(buf, HDR_LOG_VERSION, "log version")?),
            last_committed_tx_before: TxId(u64::from_be_bytes(field(
                buf,
                HDR_PREV_TX,
                "log previous tx",
            )?)),
            store_random: u64::from_be_bytes(field(buf, HDR_STORE_RANDOM, "log store id")?),
        })
    }
}

/// Locates the log files of one database directory.
#[derive(Clone, Debug)]
pub struct LogFiles {
    dir: PathBuf,
}

impl LogFiles {
    /// Log files living in `layout`'s directory.
    pub fn new(layout: &DatabaseLayout) -> Self {
        Self {
            dir: layout.transaction_logs_directory().to_path_buf(),
        }
    }

    /// Path of log file `version`.
    pub fn path_for(&self, version: u64) -> PathBuf {
        self.dir.join(format!("{LOG_FILE_PREFIX}{version}"))
    }

    /// All log versions present, ascending. A missing directory has none.
    pub fn log_versions(&self) -> Result<Vec<u64>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(suffix) = name.strip_prefix(LOG_FILE_PREFIX) {
                if let Ok(version) = suffix.parse::<u64>() {
                    versions.push(version);
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Highest log version present.
    pub fn highest_version(&self) -> Result<Option<u64>> {
        Ok(self.log_versions()?.last().copied())
    }

    /// Reads only the header of log file `version`.
    pub fn read_header(&self, version: u64) -> Result<LogHeader> {
        let io = StdFileIo::open_read_only(self.path_for(version))?;
        let mut buf = [0u8; LOG_HEADER_LEN];
        match io.read_at(0, &mut buf) {
            Ok(()) => {}
            Err(StoreError::Io(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(StoreError::Corruption("log header truncated"));
            }
            Err(err) => return Err(err),
        }
        LogHeader::decode(&buf)
    }

    /// Loads log file `version` for sequential reading.
    pub fn open_reader(&self, version: u64) -> Result<LogFileReader> {
        let bytes = StdFileIo::open_read_only(self.path_for(version))?.read_all()?;
        LogFileReader::from_bytes(bytes)
    }

    /// Directory holding the files.
    pub fn directory(&self) -> &Path {
        &self.dir
    }
}

/// Sequential reader over one fully buffered log file.
pub struct LogFileReader {
    header: LogHeader,
    channel: InMemoryChannel,
    file_len: u64,
}

impl LogFileReader {
    fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        let header = LogHeader::decode(&bytes)?;
        let file_len = bytes.len() as u64;
        let mut channel = InMemoryChannel::from_vec(bytes, 0);
        channel.seek_read(LOG_HEADER_LEN as u64)?;
        Ok(Self {
            header,
            channel,
            file_len,
        })
    }

    /// Parsed file header.
    pub fn header(&self) -> &LogHeader {
        &self.header
    }

    /// Size of the file in bytes.
    pub fn file_len(&self) -> u64 {
        self.file_len
    }

    /// Position of the next unread entry.
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.header.log_version, self.channel.read_position())
    }

    /// Next entry, or `None` at a clean end of file.
    pub fn next_command(&mut self) -> Result<Option<LogCommand>> {
        if self.channel.remaining() == 0 {
            return Ok(None);
        }
        self.header.codec.read(&mut self.channel).map(Some)
    }
}

/// True when `err` describes an entry cut short by the end of the file.
pub(crate) fn is_torn_write(err: &StoreError) -> bool {
    matches!(
        err,
        StoreError::CorruptLogEntry {
            reason: LogCorruption::Truncated,
            ..
        }
    )
}

/// Appends transactions and checkpoints to the newest log file.
pub struct TransactionLogWriter {
    files: LogFiles,
    io: StdFileIo,
    header: LogHeader,
    append_offset: u64,
    last_committed: TxId,
    sync: bool,
}

impl TransactionLogWriter {
    /// Starts log version 0 for a store with no log history.
    pub fn create(
        layout: &DatabaseLayout,
        codec: LogCommandCodec,
        store_random: u64,
        last_committed_before: TxId,
        sync: bool,
    ) -> Result<Self> {
        let files = LogFiles::new(layout);
        if files.highest_version()?.is_some() {
            return Err(StoreError::InvalidOwned(format!(
                "transaction logs already exist in {}",
                files.directory().display()
            )));
        }
        let header = LogHeader {
            codec,
            log_version: 0,
            last_committed_tx_before: last_committed_before,
            store_random,
        };
        Self::start_file(files, header, sync)
    }

    /// Reopens the newest log file for appending.
    ///
    /// A torn final entry is cut off so new entries follow the last complete one.
    pub fn open_append(layout: &DatabaseLayout, sync: bool) -> Result<Self> {
        let files = LogFiles::new(layout);
        let version = files
            .highest_version()?
            .ok_or(StoreError::NotFound("transaction log"))?;
        let mut reader = files.open_reader(version)?;
        let mut last_committed = reader.header().last_committed_tx_before;
        let mut valid_up_to = reader.position().byte_offset;
        loop {
            match reader.next_command() {
                Ok(Some(LogCommand::Commit(commit))) => {
                    last_committed = commit.tx_id;
                    valid_up_to = reader.position().byte_offset;
                }
                Ok(Some(LogCommand::Checkpoint(_))) => {
                    valid_up_to = reader.position().byte_offset;
                }
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(err) if is_torn_write(&err) => break,
                Err(err) => return Err(err),
            }
        }
        let io = StdFileIo::open(files.path_for(version))?;
        if valid_up_to < reader.file_len() {
            warn!(
                log_version = version,
                valid_up_to,
                file_len = reader.file_len(),
                "log.truncate_incomplete_tail"
            );
            io.truncate(valid_up_to)?;
            if sync {
                io.sync_all()?;
            }
        }
        Ok(Self {
            files,
            io,
            header: reader.header().clone(),
            append_offset: valid_up_to,
            last_committed,
            sync,
        })
    }

    fn start_file(files: LogFiles, header: LogHeader, sync: bool) -> Result<Self> {
        let path = files.path_for(header.log_version);
        let io = StdFileIo::open(&path)?;
        io.truncate(0)?;
        io.write_at(0, &header.encode())?;
        if sync {
            io.sync_all()?;
            sync_dir(files.directory())?;
        }
        info!(
            log_version = header.log_version,
            codec = header.codec.name(),
            "log.file_started"
        );
        Ok(Self {
            files,
            io,
            last_committed: header.last_committed_tx_before,
            header,
            append_offset: LOG_HEADER_LEN as u64,
            sync,
        })
    }

    /// Appends `start | commands | commit` for `tx_id`, which must follow the
    /// last committed transaction. Returns the position after the commit.
    pub fn append_transaction(&mut self, tx_id: TxId, commands: &[LogCommand]) -> Result<LogPosition> {
        if tx_id != self.last_committed.next() {
            return Err(StoreError::InvalidOwned(format!(
                "transaction {tx_id} does not follow last committed {}",
                self.last_committed
            )));
        }
        if commands.iter().any(|c| !c.is_transaction_body()) {
            return Err(StoreError::Invalid(
                "transaction bodies may only hold degree and enrichment commands",
            ));
        }
        let now = now_millis();
        let mut channel = InMemoryChannel::from_vec(Vec::new(), self.append_offset);
        let codec = self.header.codec;
        codec.write(
            &mut channel,
            &LogCommand::Start(StartEntry {
                tx_id,
                time_written: now,
            }),
        )?;
        for command in commands {
            codec.write(&mut channel, command)?;
        }
        codec.write(
            &mut channel,
            &LogCommand::Commit(CommitEntry {
                tx_id,
                time_committed: now,
            }),
        )?;
        self.append(channel)?;
        self.last_committed = tx_id;
        debug!(tx = tx_id.0, commands = commands.len(), "log.appended_transaction");
        Ok(self.position())
    }

    /// Appends a checkpoint covering the last committed transaction.
    pub fn append_checkpoint(&mut self) -> Result<LogPosition> {
        let covered = self.position();
        let mut channel = InMemoryChannel::from_vec(Vec::new(), self.append_offset);
        self.header.codec.write(
            &mut channel,
            &LogCommand::Checkpoint(CheckpointEntry {
                tx_id: self.last_committed,
                position: covered,
                time_written: now_millis(),
            }),
        )?;
        self.append(channel)?;
        Ok(self.position())
    }

    /// Closes the current file and starts the next version.
    pub fn rotate(&mut self) -> Result<u64> {
        let header = LogHeader {
            codec: self.header.codec,
            log_version: self.header.log_version + 1,
            last_committed_tx_before: self.last_committed,
            store_random: self.header.store_random,
        };
        let next = Self::start_file(self.files.clone(), header, self.sync)?;
        let version = next.header.log_version;
        *self = next;
        Ok(version)
    }

    fn append(&mut self, channel: InMemoryChannel) -> Result<()> {
        let bytes = channel.into_inner();
        self.io.write_at(self.append_offset, &bytes)?;
        if self.sync {
            self.io.sync_all()?;
        }
        self.append_offset += bytes.len() as u64;
        Ok(())
    }

    /// Last transaction committed through this writer or found on open.
    pub fn last_committed_tx(&self) -> TxId {
        self.last_committed
    }

    /// Position where the next entry will be written.
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.header.log_version, self.append_offset)
    }

    /// Header of the file being appended to.
    pub fn header(&self) -> &LogHeader {
        &self.header
    }
}
