// ABOUTME: Driver-neutral session traits consumed by the pool, dumper and loader
// ABOUTME: Defines SqlValue, streaming row sinks, and the connector factory seam

use anyhow::{Context, Result};
use async_trait::async_trait;

/// One row of a metadata query, every column rendered as text (`None` for NULL)
pub type TextRow = Vec<Option<String>>;

/// A single field of a streamed data row
///
/// The variant decides how the value is rendered by the writers: numeric
/// column types are emitted unquoted, everything else as an escaped literal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    /// Signed, unsigned, float, integral or decimal value in its textual form
    Numeric(String),
    Bytes(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Receives rows one at a time from a streaming cursor
#[async_trait]
pub trait RowSink: Send {
    async fn accept(&mut self, row: Vec<SqlValue>) -> Result<()>;
}

/// A live database session
///
/// Sessions are owned by a [`crate::pool::Pool`] and lent to exactly one worker
/// at a time, so methods take `&mut self`.
#[async_trait]
pub trait Session: Send + Sized + 'static {
    /// Execute a statement, discarding any result set
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Execute a statement given as raw bytes
    ///
    /// Dump files may hold string literals that are not valid UTF-8. Drivers
    /// that accept byte queries should override this; the default requires
    /// UTF-8.
    async fn execute_raw(&mut self, sql: &[u8]) -> Result<()> {
        let sql = std::str::from_utf8(sql).context("Statement is not valid UTF-8")?;
        self.execute(sql).await
    }

    /// Run a (small) metadata query and collect every row as text
    async fn query_rows(&mut self, sql: &str) -> Result<Vec<TextRow>>;

    /// Run a query on a server-side cursor, pushing each row into `sink`
    ///
    /// Returns the number of rows streamed.
    async fn stream_rows(&mut self, sql: &str, sink: &mut dyn RowSink) -> Result<u64>;

    /// Terminate the session
    async fn disconnect(self) -> Result<()>;
}

/// Factory for new sessions
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Session: Session;

    async fn connect(&self) -> Result<Self::Session>;
}
