#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::Write;

use bytes::Bytes;
use recstore::format::StoreVersion;
use recstore::log::{
    CaptureMode, EnrichmentCommand, EnrichmentMetadata, LogCommand, LogCommandCodec, LogFiles,
    LogTailExtractor, StartEntry, TransactionLogWriter, EMPTY_LOG_TAIL, ENRICHMENT_METADATA_LEN,
    LOG_HEADER_LEN,
};
use recstore::primitives::memory::MemoryTracker;
use recstore::store::layout::DatabaseLayout;
use recstore::store::meta::StoreIdentity;
use recstore::testkit::{prepare_sample_legacy_database, SAMPLE_LAST_COMMITTED_TX};
use recstore::types::{Result, StoreError, TxId};
use tempfile::tempdir;
use uuid::Uuid;

fn append_raw(layout: &DatabaseLayout, bytes: &[u8]) -> Result<()> {
    let files = LogFiles::new(layout);
    let newest = files.highest_version()?.expect("a log file");
    let mut file = OpenOptions::new().append(true).open(files.path_for(newest))?;
    file.write_all(bytes)?;
    Ok(())
}

fn start_entry(codec: LogCommandCodec, tx: u64) -> Vec<u8> {
    codec
        .encode(&LogCommand::Start(StartEntry {
            tx_id: TxId(tx),
            time_written: 7,
        }))
        .expect("encode start")
}

#[test]
fn no_log_gives_the_empty_tail() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let tail = LogTailExtractor::new()
        .tail_metadata(&DatabaseLayout::new(dir.path()), &MemoryTracker::unlimited())?;
    assert!(tail.is_empty());
    assert_eq!(tail, EMPTY_LOG_TAIL);
    assert_eq!(tail.last_committed_tx, TxId::BASE);
    Ok(())
}

#[test]
fn sample_store_tail_reports_last_commit_and_checkpoint() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV4_3, &layout, StoreIdentity::generate())?;
    let tracker = MemoryTracker::unlimited();
    let tail = LogTailExtractor::new().tail_metadata(&layout, &tracker)?;
    assert!(!tail.is_empty());
    assert_eq!(tail.last_committed_tx, SAMPLE_LAST_COMMITTED_TX);
    assert_eq!(tail.codec, Some(LogCommandCodec::V4_3));
    assert!(!tail.recovery_required);
    assert_eq!(tail.end_position, tail.last_committed_position);
    assert_eq!(tail.end_position.log_version, 1);
    let checkpoint = tail.last_checkpoint.expect("checkpoint after tx 40");
    assert_eq!(checkpoint.tx_id, TxId(40));
    assert!(checkpoint.entry_position.byte_offset >= checkpoint.position.byte_offset);
    assert_eq!(tracker.allocated(), 0);
    assert!(tracker.peak() > 0);
    Ok(())
}

#[test]
fn torn_final_entry_requests_recovery() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV5_20, &layout, StoreIdentity::generate())?;
    let entry = start_entry(LogCommandCodec::V5_20, 52);
    append_raw(&layout, &entry[..5])?;

    let tail = LogTailExtractor::new().tail_metadata(&layout, &MemoryTracker::unlimited())?;
    assert!(tail.recovery_required);
    assert_eq!(tail.last_committed_tx, SAMPLE_LAST_COMMITTED_TX);

    // reopening for append cuts the torn bytes off
    let writer = TransactionLogWriter::open_append(&layout, false)?;
    assert_eq!(writer.last_committed_tx(), SAMPLE_LAST_COMMITTED_TX);
    drop(writer);
    let tail = LogTailExtractor::new().tail_metadata(&layout, &MemoryTracker::unlimited())?;
    assert!(!tail.recovery_required);
    Ok(())
}

#[test]
fn enrichment_torn_inside_a_section_requests_recovery() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV5_20, &layout, StoreIdentity::generate())?;
    let enrichment = LogCommandCodec::V5_20
        .encode(&LogCommand::Enrichment(EnrichmentCommand::new(
            EnrichmentMetadata {
                capture_mode: CaptureMode::Full,
                server_id: Uuid::from_u64_pair(1, 1),
                last_committed_tx: SAMPLE_LAST_COMMITTED_TX,
                time_committed: 9,
                user_id: 4,
            },
            Bytes::from(vec![0xAB; 100]),
            Bytes::from_static(b"details"),
            Bytes::new(),
            Bytes::new(),
            None,
        )))
        .expect("encode enrichment");
    let mut tail_bytes = start_entry(LogCommandCodec::V5_20, 52);
    // tag, fixed metadata, first length, then 20 of the 100 section bytes
    tail_bytes.extend_from_slice(&enrichment[..1 + ENRICHMENT_METADATA_LEN + 4 + 20]);
    append_raw(&layout, &tail_bytes)?;

    let tail = LogTailExtractor::new().tail_metadata(&layout, &MemoryTracker::unlimited())?;
    assert!(tail.recovery_required);
    assert_eq!(tail.last_committed_tx, SAMPLE_LAST_COMMITTED_TX);

    let writer = TransactionLogWriter::open_append(&layout, false)?;
    assert_eq!(writer.last_committed_tx(), SAMPLE_LAST_COMMITTED_TX);
    drop(writer);
    let tail = LogTailExtractor::new().tail_metadata(&layout, &MemoryTracker::unlimited())?;
    assert!(!tail.recovery_required);
    assert_eq!(tail.end_position, tail.last_committed_position);
    Ok(())
}

#[test]
fn open_transaction_at_the_end_requests_recovery() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV5_12, &layout, StoreIdentity::generate())?;
    append_raw(&layout, &start_entry(LogCommandCodec::V5_12, 52))?;
    let tail = LogTailExtractor::new().tail_metadata(&layout, &MemoryTracker::unlimited())?;
    assert!(tail.recovery_required);
    assert_eq!(tail.last_committed_tx, SAMPLE_LAST_COMMITTED_TX);
    assert!(tail.end_position.byte_offset > tail.last_committed_position.byte_offset);
    Ok(())
}

#[test]
fn checksum_failure_inside_the_log_is_an_error() -> Result<()> {
    let dir = tempdir().expect("tmpdir");
    let layout = DatabaseLayout::new(dir.path());
    prepare_sample_legacy_database(StoreVersion::StandardV5_20, &layout, StoreIdentity::generate())?;
    let files = LogFiles::new(&layout);
    let path = files.path_for(files.highest_version()?.expect("a log file"));
    let mut bytes = std::fs::read(&path)?;
    bytes[LOG_HEADER_LEN + 4] ^= 0x10;
    std::fs::write(&path, bytes)?;

    let err = LogTailExtractor::new()
        .tail_metadata(&layout, &MemoryTracker::unlimited())
        .unwrap_err();
    assert!(err.is_corruption());
    assert!(matches!(err, StoreError::CorruptLogEntry { .. }));
    Ok(())
}
