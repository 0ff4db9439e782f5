//! On-disk store files: directory layout, metadata and record files.

pub mod layout;
pub mod meta;
pub mod records;

pub use layout::{DatabaseLayout, MIGRATION_DIRECTORY};
pub use meta::{
    ExternalStoreId, MetaData, MetaDataStore, MetadataProvider, StoreId, StoreIdentity,
};
pub use records::{RecordFile, RecordFileHeader, RecordKind, RECORD_HEADER_LEN};
