// ABOUTME: Multi-row INSERT writer and MySQL string-literal escaping
// ABOUTME: Batches row tuples by statement size and chunks statements into files

use super::ChunkLimits;
use crate::session::SqlValue;
use crate::utils::quote_ident;

/// Append `input` to `out` using MySQL string-literal escaping
///
/// `NUL ' " \b \n \r \t 0x1A \` become `\0 \' \" \b \n \r \t \Z \\`; every
/// other byte is copied unchanged. Newlines therefore never appear raw inside a
/// literal, which keeps `;\n` a safe statement delimiter.
pub fn escape_bytes(input: &[u8], out: &mut Vec<u8>) {
    for &byte in input {
        let escaped: Option<&[u8]> = match byte {
            0x00 => Some(b"\\0"),
            b'\'' => Some(b"\\'"),
            b'"' => Some(b"\\\""),
            0x08 => Some(b"\\b"),
            b'\n' => Some(b"\\n"),
            b'\r' => Some(b"\\r"),
            b'\t' => Some(b"\\t"),
            0x1A => Some(b"\\Z"),
            b'\\' => Some(b"\\\\"),
            _ => None,
        };
        match escaped {
            Some(seq) => out.extend_from_slice(seq),
            None => out.push(byte),
        }
    }
}

/// Render one value as it appears inside a VALUES tuple
pub fn format_value(value: &SqlValue, out: &mut Vec<u8>) {
    match value {
        SqlValue::Null => out.extend_from_slice(b"NULL"),
        SqlValue::Numeric(text) => out.extend_from_slice(text.as_bytes()),
        SqlValue::Bytes(bytes) => {
            out.push(b'"');
            escape_bytes(bytes, out);
            out.push(b'"');
        }
    }
}

/// Render a full `(v1,v2,...)` tuple
pub fn format_row(row: &[SqlValue]) -> Vec<u8> {
    let mut out = Vec::with_capacity(row.len() * 8 + 2);
    out.push(b'(');
    for (idx, value) in row.iter().enumerate() {
        if idx > 0 {
            out.push(b',');
        }
        format_value(value, &mut out);
    }
    out.push(b')');
    out
}

pub struct SqlWriter {
    table: String,
    limits: ChunkLimits,
    field_count: usize,
    insert_prefix: String,
    pending: Vec<u8>,
    stmt_bytes: u64,
    chunk: Vec<u8>,
    chunk_row_bytes: u64,
    chunk_rows: u64,
}

impl SqlWriter {
    pub fn new(table: &str, limits: ChunkLimits) -> Self {
        Self {
            table: table.to_string(),
            limits,
            field_count: 0,
            insert_prefix: String::new(),
            pending: Vec::new(),
            stmt_bytes: 0,
            chunk: Vec::new(),
            chunk_row_bytes: 0,
            chunk_rows: 0,
        }
    }

    pub fn initialize(&mut self, fields: &[String]) {
        let columns: Vec<String> = fields.iter().map(|f| quote_ident(f)).collect();
        self.field_count = fields.len();
        self.insert_prefix = format!(
            "INSERT INTO {}({}) VALUES\n",
            quote_ident(&self.table),
            columns.join(",")
        );
    }

    pub fn write_row(&mut self, row: &[SqlValue]) -> usize {
        let tuple = format_row(row);
        let added = tuple.len();

        if !self.pending.is_empty() {
            self.pending.extend_from_slice(b",\n");
        }
        self.pending.extend_from_slice(&tuple);
        self.stmt_bytes += added as u64;
        self.chunk_row_bytes += added as u64;
        self.chunk_rows += 1;

        if self.stmt_bytes >= self.limits.stmt_size {
            self.finish_statement();
        }
        added
    }

    pub fn limits(&self) -> ChunkLimits {
        self.limits
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn chunk_row_bytes(&self) -> u64 {
        self.chunk_row_bytes
    }

    /// Finalize the pending statement and hand out the buffered chunk
    pub fn take_chunk(&mut self) -> Option<(Vec<u8>, u64)> {
        self.finish_statement();
        if self.chunk.is_empty() {
            return None;
        }
        let rows = std::mem::take(&mut self.chunk_rows);
        self.chunk_row_bytes = 0;
        Some((std::mem::take(&mut self.chunk), rows))
    }

    fn finish_statement(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.chunk.extend_from_slice(self.insert_prefix.as_bytes());
        self.chunk.append(&mut self.pending);
        self.chunk.extend_from_slice(b";\n");
        self.stmt_bytes = 0;
    }
}
