#![forbid(unsafe_code)]
//! Positioned byte channels with running checksums.
//!
//! Writers and readers track their own CRC32 so a codec can bracket an entry
//! with `begin_checksum_*` and seal it with [`WritableChannel::put_checksum`]
//! or verify it with [`ReadableChannel::end_checksum_and_validate`]. All
//! integers are big-endian.

use bytes::Bytes;

use crate::types::{Checksum, Crc32Fast, LogCorruption, Result, StoreError};

/// Sink for encoded log entries.
pub trait WritableChannel {
    /// Writes one byte.
    fn put_u8(&mut self, value: u8);
    /// Writes a big-endian u32.
    fn put_u32(&mut self, value: u32);
    /// Writes a big-endian u64.
    fn put_u64(&mut self, value: u64);
    /// Writes a big-endian two's-complement i64.
    fn put_i64(&mut self, value: i64) {
        self.put_u64(value as u64);
    }
    /// Writes raw bytes.
    fn put_bytes(&mut self, src: &[u8]);
    /// Restarts the running write checksum.
    fn begin_checksum_for_writing(&mut self);
    /// Appends the running checksum (not itself checksummed) and returns it.
    fn put_checksum(&mut self) -> u32;
    /// Absolute offset of the next byte to be written.
    fn write_position(&self) -> u64;
}

/// Source of encoded log entries.
pub trait ReadableChannel {
    /// Reads one byte.
    fn get_u8(&mut self) -> Result<u8>;
    /// Reads a big-endian u32.
    fn get_u32(&mut self) -> Result<u32>;
    /// Reads a big-endian u64.
    fn get_u64(&mut self) -> Result<u64>;
    /// Reads a big-endian two's-complement i64.
    fn get_i64(&mut self) -> Result<i64> {
        Ok(self.get_u64()? as i64)
    }
    /// Reads `len` raw bytes.
    fn get_bytes(&mut self, len: usize) -> Result<Bytes>;
    /// Restarts the running read checksum.
    fn begin_checksum_for_reading(&mut self);
    /// Reads the stored checksum and compares it with the running one.
    ///
    /// `entry_start` is reported in the error when the two disagree.
    fn end_checksum_and_validate(&mut self, entry_start: u64) -> Result<u32>;
    /// Absolute offset of the next byte to be read.
    fn read_position(&self) -> u64;
    /// Bytes left to read.
    fn remaining(&self) -> u64;
}

/// Growable in-memory channel usable as both writer and reader.
///
/// `base_offset` is the absolute position of `buf[0]`, which lets a channel
/// over a file body report file offsets.
pub struct InMemoryChannel {
    buf: Vec<u8>,
    read_pos: usize,
    base_offset: u64,
    write_crc: Crc32Fast,
    read_crc: Crc32Fast,
}

impl Default for InMemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryChannel {
    /// Creates an empty channel starting at offset zero.
    pub fn new() -> Self {
        Self::from_vec(Vec::new(), 0)
    }

    /// Wraps existing bytes whose first byte sits at `base_offset`.
    pub fn from_vec(buf: Vec<u8>, base_offset: u64) -> Self {
        Self {
            buf,
            read_pos: 0,
            base_offset,
            write_crc: Crc32Fast::default(),
            read_crc: Crc32Fast::default(),
        }
    }

    /// Returns everything written so far.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable access to the written bytes.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Consumes the channel and returns its bytes.
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    /// Moves the read cursor to an absolute position.
    pub fn seek_read(&mut self, position: u64) -> Result<()> {
        let rel = position
            .checked_sub(self.base_offset)
            .ok_or(StoreError::Invalid("seek before channel start"))?;
        if rel > self.buf.len() as u64 {
            return Err(StoreError::ReadPastEnd { position });
        }
        self.read_pos = rel as usize;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8]> {
        let start = self.read_pos;
        let end = start
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(StoreError::ReadPastEnd {
                position: self.base_offset + start as u64,
            })?;
        self.read_pos = end;
        Ok(&self.buf[start..end])
    }

    fn take_checked<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        self.read_crc.update(&out);
        Ok(out)
    }

    fn push(&mut self, src: &[u8]) {
        self.write_crc.update(src);
        self.buf.extend_from_slice(src);
    }
}

impl WritableChannel for InMemoryChannel {
    fn put_u8(&mut self, value: u8) {
        self.push(&[value]);
    }

    fn put_u32(&mut self, value: u32) {
        self.push(&value.to_be_bytes());
    }

    fn put_u64(&mut self, value: u64) {
        self.push(&value.to_be_bytes());
    }

    fn put_bytes(&mut self, src: &[u8]) {
        self.push(src);
    }

    fn begin_checksum_for_writing(&mut self) {
        self.write_crc.reset();
    }

    fn put_checksum(&mut self) -> u32 {
        let crc = self.write_crc.finalize();
        self.buf.extend_from_slice(&crc.to_be_bytes());
        self.write_crc.reset();
        crc
    }

    fn write_position(&self) -> u64 {
        self.base_offset + self.buf.len() as u64
    }
}

impl ReadableChannel for InMemoryChannel {
    fn get_u8(&mut self) -> Result<u8> {
        let [b] = self.take_checked::<1>()?;
        Ok(b)
    }

    fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_checked::<4>()?))
    }

    fn get_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_checked::<8>()?))
    }

    fn get_bytes(&mut self, len: usize) -> Result<Bytes> {
        let out = Bytes::copy_from_slice(self.take(len)?);
        self.read_crc.update(&out);
        Ok(out)
    }

    fn begin_checksum_for_reading(&mut self) {
        self.read_crc.reset();
    }

    fn end_checksum_and_validate(&mut self, entry_start: u64) -> Result<u32> {
        let computed = self.read_crc.finalize();
        let mut stored = [0u8; 4];
        stored.copy_from_slice(self.take(4)?);
        let stored = u32::from_be_bytes(stored);
        self.read_crc.reset();
        if stored != computed {
            return Err(StoreError::CorruptLogEntry {
                position: entry_start,
                reason: LogCorruption::ChecksumMismatch,
            });
        }
        Ok(stored)
    }

    fn read_position(&self) -> u64 {
        self.base_offset + self.read_pos as u64
    }

    fn remaining(&self) -> u64 {
        (self.buf.len() - self.read_pos) as u64
    }
}
