// ABOUTME: mysql_async-backed Session used for production dump and restore runs
// ABOUTME: Streams rows through the text protocol without buffering result sets

use super::converter::{is_numeric_column, to_sql_value, to_text};
use crate::session::{RowSink, Session, TextRow};
use anyhow::{Context, Result};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Row, Value};

/// A single MySQL connection
pub struct MysqlSession {
    conn: Conn,
}

impl MysqlSession {
    pub fn new(conn: Conn) -> Self {
        Self { conn }
    }

    /// Server-side connection id, useful when correlating with the processlist
    pub fn connection_id(&self) -> u32 {
        self.conn.id()
    }
}

#[async_trait]
impl Session for MysqlSession {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.conn
            .query_drop(sql)
            .await
            .with_context(|| format!("Failed to execute statement on connection {}", self.connection_id()))
    }

    async fn execute_raw(&mut self, sql: &[u8]) -> Result<()> {
        self.conn
            .query_drop(sql)
            .await
            .with_context(|| format!("Failed to execute statement on connection {}", self.connection_id()))
    }

    async fn query_rows(&mut self, sql: &str) -> Result<Vec<TextRow>> {
        let rows: Vec<Row> = self
            .conn
            .query(sql)
            .await
            .with_context(|| format!("Query failed: {}", sql))?;

        Ok(rows
            .iter()
            .map(|row| {
                (0..row.len())
                    .map(|idx| row.as_ref(idx).and_then(to_text))
                    .collect()
            })
            .collect())
    }

    async fn stream_rows(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<u64> {
        let mut result = self
            .conn
            .query_iter(sql)
            .await
            .with_context(|| format!("Failed to open cursor for: {}", sql))?;

        let mut numeric: Option<Vec<bool>> = None;
        let mut count = 0u64;

        while let Some(mut row) = result
            .next()
            .await
            .with_context(|| format!("Failed to fetch row from: {}", sql))?
        {
            let kinds = numeric.get_or_insert_with(|| {
                row.columns_ref()
                    .iter()
                    .map(|column| is_numeric_column(column.column_type()))
                    .collect()
            });

            let values = kinds
                .iter()
                .enumerate()
                .map(|(idx, is_numeric)| {
                    let value = row.take::<Value, usize>(idx).unwrap_or(Value::NULL);
                    to_sql_value(value, *is_numeric)
                })
                .collect();

            sink.accept(values).await?;
            count += 1;
        }

        result
            .drop_result()
            .await
            .context("Failed to drain streaming result")?;

        Ok(count)
    }

    async fn disconnect(self) -> Result<()> {
        self.conn
            .disconnect()
            .await
            .context("Failed to disconnect from MySQL")
    }
}
