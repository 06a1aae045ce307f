// ABOUTME: Chunked table writers that turn streamed rows into numbered dump files
// ABOUTME: SQL-insert, CSV and JSON Lines variants behind one closed enum

pub mod csv;
pub mod json;
pub mod sql;

pub use self::csv::CsvWriter;
pub use self::json::JsonWriter;
pub use self::sql::SqlWriter;

use crate::migration::files::data_file_name;
use crate::session::SqlValue;
use crate::utils::sha256_hex;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Data file format produced by a dump
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Sql,
    Csv,
    Json,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Sql => "sql",
            OutputFormat::Csv => "csv",
            OutputFormat::Json => "json",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Size thresholds that drive statement batching and file rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLimits {
    /// Accumulated row bytes after which a new INSERT statement is started
    pub stmt_size: u64,
    /// Accumulated row bytes after which the chunk is written to a file
    pub chunk_bytes: u64,
}

impl ChunkLimits {
    pub fn new(stmt_size: u64, chunksize_in_mb: u64) -> Self {
        Self {
            stmt_size,
            chunk_bytes: chunksize_in_mb.saturating_mul(1024 * 1024),
        }
    }
}

/// A data file written by a flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkFile {
    pub path: PathBuf,
    pub file_name: String,
    pub part: u32,
    pub bytes: u64,
    pub rows: u64,
    pub sha256: String,
}

/// Accumulates one table's rows and writes them out in numbered chunks
///
/// The variant is picked once per table from the run's [`OutputFormat`].
pub enum TableWriter {
    Sql(SqlWriter),
    Csv(CsvWriter),
    Json(JsonWriter),
}

impl TableWriter {
    pub fn new(format: OutputFormat, table: &str, limits: ChunkLimits) -> Self {
        match format {
            OutputFormat::Sql => TableWriter::Sql(SqlWriter::new(table, limits)),
            OutputFormat::Csv => TableWriter::Csv(CsvWriter::new(limits)),
            OutputFormat::Json => TableWriter::Json(JsonWriter::new(limits)),
        }
    }

    pub fn format(&self) -> OutputFormat {
        match self {
            TableWriter::Sql(_) => OutputFormat::Sql,
            TableWriter::Csv(_) => OutputFormat::Csv,
            TableWriter::Json(_) => OutputFormat::Json,
        }
    }

    /// Set the column names rows will be written under
    pub fn initialize(&mut self, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            bail!("Cannot write rows without any selected column");
        }
        match self {
            TableWriter::Sql(w) => w.initialize(fields),
            TableWriter::Csv(w) => w.initialize(fields),
            TableWriter::Json(w) => w.initialize(fields),
        }
        Ok(())
    }

    /// Buffer one row, returning the number of bytes it added
    pub fn write_row(&mut self, row: &[SqlValue]) -> Result<usize> {
        let expected = self.field_count();
        if row.len() != expected {
            bail!(
                "Row has {} value(s) but {} column(s) were selected",
                row.len(),
                expected
            );
        }
        match self {
            TableWriter::Sql(w) => Ok(w.write_row(row)),
            TableWriter::Csv(w) => w.write_row(row),
            TableWriter::Json(w) => w.write_row(row),
        }
    }

    /// True once the buffered chunk reached the configured size
    pub fn should_flush(&self) -> bool {
        let (buffered, limits) = match self {
            TableWriter::Sql(w) => (w.chunk_row_bytes(), w.limits()),
            TableWriter::Csv(w) => (w.chunk_row_bytes(), w.limits()),
            TableWriter::Json(w) => (w.chunk_row_bytes(), w.limits()),
        };
        buffered >= limits.chunk_bytes
    }

    /// Write the buffered chunk to `<db>.<table>.<file_no>.<ext>` under `dir`
    ///
    /// Returns `None` when nothing was buffered.
    pub async fn flush(
        &mut self,
        dir: &Path,
        db: &str,
        table: &str,
        file_no: u32,
    ) -> Result<Option<ChunkFile>> {
        let taken = match self {
            TableWriter::Sql(w) => w.take_chunk(),
            TableWriter::Csv(w) => w.take_chunk()?,
            TableWriter::Json(w) => w.take_chunk(),
        };
        let Some((data, rows)) = taken else {
            return Ok(None);
        };

        let file_name = data_file_name(db, table, file_no, self.format());
        let path = dir.join(&file_name);
        tokio::fs::write(&path, &data)
            .await
            .with_context(|| format!("Failed to write chunk file {}", path.display()))?;

        tracing::debug!(
            "Wrote {} ({} rows, {} bytes)",
            file_name,
            rows,
            data.len()
        );

        Ok(Some(ChunkFile {
            sha256: sha256_hex(&data),
            path,
            file_name,
            part: file_no,
            bytes: data.len() as u64,
            rows,
        }))
    }

    /// Write the final partial chunk, if any
    pub async fn close(
        &mut self,
        dir: &Path,
        db: &str,
        table: &str,
        file_no: u32,
    ) -> Result<Option<ChunkFile>> {
        self.flush(dir, db, table, file_no).await
    }

    fn field_count(&self) -> usize {
        match self {
            TableWriter::Sql(w) => w.field_count(),
            TableWriter::Csv(w) => w.field_count(),
            TableWriter::Json(w) => w.field_count(),
        }
    }
}
