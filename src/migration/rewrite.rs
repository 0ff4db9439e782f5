//! Record rewriting collaborators used by the migrator.

use serde::Serialize;
use tracing::debug;

use crate::format::StoreVersion;
use crate::primitives::io::copy_file_atomic;
use crate::store::layout::DatabaseLayout;
use crate::store::records::{RecordFile, RecordKind};
use crate::types::{Result, StoreError};

/// Notified for every record file written into the staging area.
pub trait IndexImporterHook: Send + Sync {
    /// `kind` was rewritten with `record_count` records.
    fn record_file_rewritten(&self, kind: RecordKind, record_count: u64) -> Result<()>;
}

/// Hook that ignores every notification.
pub struct NoIndexImport;

impl IndexImporterHook for NoIndexImport {
    fn record_file_rewritten(&self, _kind: RecordKind, _record_count: u64) -> Result<()> {
        Ok(())
    }
}

/// Totals produced by a rewrite.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RewriteSummary {
    /// Record files written.
    pub files: usize,
    /// Records written.
    pub records: u64,
    /// Bytes written.
    pub bytes: u64,
}

impl RewriteSummary {
    fn add(&mut self, records: u64, bytes: u64) {
        self.files += 1;
        self.records += records;
        self.bytes += bytes;
    }
}

/// Converts the record files of `source` into `to`'s layout under `staging`.
///
/// Implementations must only write into `staging` and must leave complete,
/// verifiable files there when they return `Ok`.
pub trait BatchRewrite: Send + Sync {
    /// Performs the rewrite.
    fn rewrite(
        &self,
        source: &DatabaseLayout,
        staging: &DatabaseLayout,
        from: StoreVersion,
        to: StoreVersion,
        index_importer: &dyn IndexImporterHook,
    ) -> Result<RewriteSummary>;
}

/// Default rewriter: re-encodes each record file with the target layout,
/// one file per task on a rayon pool when more than one thread is configured.
pub struct RecordFileRewriter {
    threads: usize,
    fsync: bool,
}

impl RecordFileRewriter {
    /// Rewriter using `threads` workers (0 or 1 runs inline).
    pub fn new(threads: usize, fsync: bool) -> Self {
        Self { threads, fsync }
    }

    fn rewrite_one(
        &self,
        source: &DatabaseLayout,
        staging: &DatabaseLayout,
        from: StoreVersion,
        to: StoreVersion,
        kind: RecordKind,
    ) -> Result<(RecordKind, u64, u64)> {
        let file = RecordFile::read_expecting(&source.record_file(kind), kind, from.record_layout())?;
        let rewritten = file.with_layout(to.record_layout());
        let bytes = rewritten.write(&staging.record_file(kind), self.fsync)?;
        debug!(
            kind = kind.file_name(),
            records = file.header().record_count,
            "rewrite.record_file_written"
        );
        Ok((kind, file.header().record_count, bytes))
    }
}

impl BatchRewrite for RecordFileRewriter {
    fn rewrite(
        &self,
        source: &DatabaseLayout,
        staging: &DatabaseLayout,
        from: StoreVersion,
        to: StoreVersion,
        index_importer: &dyn IndexImporterHook,
    ) -> Result<RewriteSummary> {
        let results: Vec<Result<(RecordKind, u64, u64)>> = if self.threads <= 1 {
            RecordKind::ALL
                .iter()
                .map(|kind| self.rewrite_one(source, staging, from, to, *kind))
                .collect()
        } else {
            use rayon::prelude::*;
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.threads)
                .build()
                .map_err(|e| StoreError::InvalidOwned(format!("rayon pool: {e}")))?;
            pool.install(|| {
                RecordKind::ALL
                    .par_iter()
                    .map(|kind| self.rewrite_one(source, staging, from, to, *kind))
                    .collect()
            })
        };
        let mut summary = RewriteSummary::default();
        for result in results {
            let (kind, records, bytes) = result?;
            index_importer.record_file_rewritten(kind, records)?;
            summary.add(records, bytes);
        }
        Ok(summary)
    }
}

/// Copies record files verbatim when the record layout does not change.
pub fn carry_over_record_files(
    source: &DatabaseLayout,
    staging: &DatabaseLayout,
    from: StoreVersion,
    fsync: bool,
) -> Result<RewriteSummary> {
    let mut summary = RewriteSummary::default();
    for kind in RecordKind::ALL {
        let src = source.record_file(kind);
        let file = RecordFile::read_expecting(&src, kind, from.record_layout())?;
        let bytes = copy_file_atomic(&src, &staging.record_file(kind), fsync)?;
        summary.add(file.header().record_count, bytes);
    }
    Ok(summary)
}
