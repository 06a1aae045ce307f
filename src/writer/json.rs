// ABOUTME: JSON Lines table writer, one object per row keyed by column name
// ABOUTME: Preserves decimal precision and base64-encodes non-UTF-8 bytes

use super::ChunkLimits;
use crate::session::SqlValue;
use anyhow::{Context, Result};
use serde_json::Value as JsonValue;

/// Convert a SqlValue to JSON
///
/// - Integers → JSON numbers
/// - Other numerics (decimals, floats) → strings, so no precision is lost
/// - UTF-8 bytes → JSON strings
/// - Non-UTF-8 bytes → `{"_type": "binary", "data": <base64>}`
/// - NULL → JSON null
pub fn sql_value_to_json(value: &SqlValue) -> JsonValue {
    match value {
        SqlValue::Null => JsonValue::Null,
        SqlValue::Numeric(text) => {
            if let Ok(i) = text.parse::<i64>() {
                JsonValue::Number(i.into())
            } else if let Ok(u) = text.parse::<u64>() {
                JsonValue::Number(u.into())
            } else {
                JsonValue::String(text.clone())
            }
        }
        SqlValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => {
                let encoded =
                    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, bytes);
                serde_json::json!({
                    "_type": "binary",
                    "data": encoded
                })
            }
        },
    }
}

pub struct JsonWriter {
    limits: ChunkLimits,
    fields: Vec<String>,
    chunk: Vec<u8>,
    chunk_rows: u64,
}

impl JsonWriter {
    pub fn new(limits: ChunkLimits) -> Self {
        Self {
            limits,
            fields: Vec::new(),
            chunk: Vec::new(),
            chunk_rows: 0,
        }
    }

    pub fn initialize(&mut self, fields: &[String]) {
        self.fields = fields.to_vec();
    }

    pub fn write_row(&mut self, row: &[SqlValue]) -> Result<usize> {
        let object: serde_json::Map<String, JsonValue> = self
            .fields
            .iter()
            .zip(row)
            .map(|(name, value)| (name.clone(), sql_value_to_json(value)))
            .collect();

        let before = self.chunk.len();
        serde_json::to_writer(&mut self.chunk, &JsonValue::Object(object))
            .context("Failed to serialize row as JSON")?;
        self.chunk.push(b'\n');
        self.chunk_rows += 1;
        Ok(self.chunk.len() - before)
    }

    pub fn limits(&self) -> ChunkLimits {
        self.limits
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn chunk_row_bytes(&self) -> u64 {
        self.chunk.len() as u64
    }

    pub fn take_chunk(&mut self) -> Option<(Vec<u8>, u64)> {
        if self.chunk.is_empty() {
            return None;
        }
        let rows = std::mem::take(&mut self.chunk_rows);
        Some((std::mem::take(&mut self.chunk), rows))
    }
}
