//! Transaction log: command model, versioned codecs, file handling and tail
//! extraction.

pub mod codec;
pub mod command;
pub mod files;
pub mod tail;

pub use codec::LogCommandCodec;
pub use command::{
    tags, CaptureMode, CheckpointEntry, CommitEntry, EnrichmentCommand, EnrichmentMetadata,
    GroupDegreeCommand, LogCommand, StartEntry, ENRICHMENT_METADATA_LEN,
};
pub use files::{LogFileReader, LogFiles, LogHeader, TransactionLogWriter, LOG_HEADER_LEN};
pub use tail::{CheckpointInfo, LogTailExtractor, LogTailMetadata, EMPTY_LOG_TAIL};
