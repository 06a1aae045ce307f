// ABOUTME: CSV table writer with a header row at the top of every chunk file
// ABOUTME: Flushes by accumulated byte size only

use super::ChunkLimits;
use crate::session::SqlValue;
use anyhow::{anyhow, Context, Result};

pub struct CsvWriter {
    limits: ChunkLimits,
    header: Vec<String>,
    writer: Option<::csv::Writer<Vec<u8>>>,
    chunk_row_bytes: u64,
    chunk_rows: u64,
}

impl CsvWriter {
    pub fn new(limits: ChunkLimits) -> Self {
        Self {
            limits,
            header: Vec::new(),
            writer: None,
            chunk_row_bytes: 0,
            chunk_rows: 0,
        }
    }

    pub fn initialize(&mut self, fields: &[String]) {
        self.header = fields.to_vec();
    }

    pub fn write_row(&mut self, row: &[SqlValue]) -> Result<usize> {
        if self.writer.is_none() {
            let mut writer = ::csv::Writer::from_writer(Vec::new());
            writer
                .write_record(&self.header)
                .context("Failed to write CSV header")?;
            writer.flush().context("Failed to buffer CSV header")?;
            self.writer = Some(writer);
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| anyhow!("CSV chunk writer missing"))?;

        let before = writer.get_ref().len();
        let record = row.iter().map(|value| match value {
            SqlValue::Null => b"NULL".as_slice(),
            SqlValue::Numeric(text) => text.as_bytes(),
            SqlValue::Bytes(bytes) => bytes.as_slice(),
        });
        writer
            .write_record(record)
            .context("Failed to write CSV record")?;
        writer.flush().context("Failed to buffer CSV record")?;

        let added = writer.get_ref().len() - before;
        self.chunk_row_bytes += added as u64;
        self.chunk_rows += 1;
        Ok(added)
    }

    pub fn limits(&self) -> ChunkLimits {
        self.limits
    }

    pub fn field_count(&self) -> usize {
        self.header.len()
    }

    pub fn chunk_row_bytes(&self) -> u64 {
        self.chunk_row_bytes
    }

    pub fn take_chunk(&mut self) -> Result<Option<(Vec<u8>, u64)>> {
        let Some(writer) = self.writer.take() else {
            return Ok(None);
        };
        let data = writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to finish CSV chunk: {}", e.error()))?;
        let rows = std::mem::take(&mut self.chunk_rows);
        self.chunk_row_bytes = 0;
        Ok(Some((data, rows)))
    }
}
