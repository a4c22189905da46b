//! The three trait contracts the dispatcher worker drives in sequence:
//! [`QueryRunner`] -> [`Exporter`] -> (optionally) [`TransferAgent`].
//!
//! Concrete implementations live in `query-runner`, `exporter`, and
//! `transfer-agent`; this crate only knows their shapes so the worker loop
//! can be written once against `Arc<dyn ...>` and swapped in tests for the
//! in-memory doubles in `testing-support`.

use crate::error::DispatchError;
use crate::job::{ExportFormat, Job, SshIdentity};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::path::Path;
use tokio_util::sync::CancellationToken;

/// A single result-set cell. The schema is unknown until the query runs, so
/// cells are dynamically typed rather than mapped onto a fixed struct.
#[derive(Debug, Clone, PartialEq)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

pub type Row = Vec<CellValue>;

/// One streamed batch of rows, sized by the query runner's configured chunk
/// size.
pub type RowChunk = Vec<Row>;

/// What `QueryRunner::run` hands the exporter: the column list up front,
/// then a stream of row chunks the exporter drains as it writes.
pub struct QueryResult {
    pub columns: Vec<String>,
    pub chunks: BoxStream<'static, Result<RowChunk, DispatchError>>,
}

#[async_trait]
pub trait QueryRunner: Send + Sync {
    /// Connect using `job.db_credentials`, execute `job.query_text`, and
    /// return a column list plus a chunked row stream. Exactly one
    /// connection is opened and it is closed on every exit path, including
    /// early cancellation.
    async fn run(&self, job: &Job, cancel: CancellationToken) -> Result<QueryResult, DispatchError>;
}

/// What the exporter reports back once a result set is fully written.
#[derive(Debug, Clone)]
pub struct ExportOutcome {
    pub local_path: std::path::PathBuf,
    pub row_count: u64,
    pub column_count: u64,
    pub byte_size: u64,
}

#[async_trait]
pub trait Exporter: Send + Sync {
    /// Drain `result` into `target_path` in `format`. On any failure exit
    /// path (including cancellation), the partial file at `target_path`
    /// must be removed.
    async fn export(
        &self,
        result: QueryResult,
        format: ExportFormat,
        target_path: &Path,
        cancel: CancellationToken,
    ) -> Result<ExportOutcome, DispatchError>;
}

#[async_trait]
pub trait TransferAgent: Send + Sync {
    /// Push `local_path` to `identity`'s host, creating `remote_dir` if
    /// absent, under `remote_filename`. Returns the final remote absolute
    /// path. Overwrites an existing remote file of a different size;
    /// leaves one of a matching size in place.
    async fn transfer(
        &self,
        local_path: &Path,
        identity: &SshIdentity,
        remote_dir: &str,
        remote_filename: &str,
        cancel: CancellationToken,
    ) -> Result<String, DispatchError>;
}
