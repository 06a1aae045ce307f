// ABOUTME: Parallel table dump into a directory of schema files and chunked data files
// ABOUTME: Per-table failures are logged and skipped; the run itself keeps going

use super::files::{
    database_file_name, schema_file_name, view_file_name, FileKind, METADATA_FILE,
};
use super::manifest::{Manifest, ManifestEntry};
use super::progress::{ProgressReporter, Stats};
use crate::config::Config;
use crate::filters::{DatabaseSelector, TableSelector};
use crate::mysql::MysqlConnector;
use crate::pool::{Pool, PooledSession};
use crate::session::{Connector, RowSink, Session, SqlValue, TextRow};
use crate::table_rules::TableRules;
use crate::utils::{format_bytes, format_duration, megabytes_per_second, quote_ident, sha256_hex};
use crate::writer::{ChunkFile, ChunkLimits, OutputFormat, TableWriter};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Result of one database's table exports
#[derive(Debug, Default)]
struct DatabaseOutcome {
    entries: Vec<ManifestEntry>,
    dumped: usize,
    failed: usize,
}

/// Exports the selected databases into `Config::outdir`
///
/// Table data is streamed in parallel on one sub-pool per database. Sub-pools
/// draw their connections from a budget of `Config::threads`, so at most that
/// many data connections (plus the metadata connection) are ever open. A
/// table whose export fails is logged and left out of the manifest; the run
/// still succeeds.
pub struct Dumper<C: Connector = MysqlConnector> {
    config: Config,
    connector: C,
    stats: Arc<Stats>,
}

impl Dumper {
    pub fn new(config: Config) -> Result<Self> {
        let connector = MysqlConnector::new(&config)?;
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> Dumper<C> {
    pub fn with_connector(config: Config, connector: C) -> Result<Self> {
        config.validate().context("Invalid dump configuration")?;
        Ok(Self {
            config,
            connector,
            stats: Stats::new(),
        })
    }

    pub fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let started = Instant::now();
        let outdir = &self.config.outdir;

        tokio::fs::create_dir_all(outdir)
            .await
            .with_context(|| format!("Failed to create output directory {}", outdir.display()))?;

        if !self.config.rules.is_empty() {
            tracing::info!(
                "Applying table rules (fingerprint {})",
                self.config.rules.fingerprint()
            );
        }

        let meta_pool = Pool::new(1, &self.connector, &self.config.session_vars, "")
            .await
            .context("Failed to create metadata connection pool")?;

        let reporter = ProgressReporter::start(
            self.stats(),
            Duration::from_millis(self.config.interval_ms),
            "dump",
            &cancel,
        );

        let mut manifest = Manifest::new(self.config.format, self.config.rules.fingerprint());
        let mut tasks: JoinSet<DatabaseOutcome> = JoinSet::new();

        let scheduled = self
            .schedule(&meta_pool, &cancel, &mut manifest, &mut tasks)
            .await;
        let outcome = collect_database_dumps(&mut tasks).await;

        reporter.stop().await;
        meta_pool.close().await;

        scheduled?;
        if cancel.is_cancelled() {
            bail!(
                "Dump cancelled; {} is incomplete and has no manifest",
                outdir.display()
            );
        }

        manifest.extend(outcome.entries);
        manifest.save(outdir)?;

        let totals = self.stats.snapshot();
        let elapsed = started.elapsed();
        tracing::info!(
            "✓ Dump completed in {}: {} table(s), {} rows, {} ({:.2} MB/s)",
            format_duration(elapsed),
            outcome.dumped,
            totals.rows,
            format_bytes(totals.bytes),
            megabytes_per_second(totals.bytes, elapsed)
        );
        if outcome.failed > 0 {
            tracing::warn!(
                "{} table(s) failed to dump and are missing from {}",
                outcome.failed,
                outdir.display()
            );
        }

        Ok(())
    }

    /// Write every schema file and spawn one data task per database
    ///
    /// A database's sub-pool is opened only once its share of the connection
    /// budget is free, and is closed by its task when its last table is done.
    async fn schedule(
        &self,
        meta_pool: &Pool<C::Session>,
        cancel: &CancellationToken,
        manifest: &mut Manifest,
        tasks: &mut JoinSet<DatabaseOutcome>,
    ) -> Result<()> {
        let outdir = &self.config.outdir;
        let mut meta = meta_pool.get().await?;

        let selector = DatabaseSelector::from_config(&self.config)?;
        let databases = resolve_databases(&mut *meta, &selector).await?;

        tokio::fs::write(outdir.join(METADATA_FILE), b"")
            .await
            .with_context(|| format!("Failed to write metadata marker in {}", outdir.display()))?;

        if databases.is_empty() {
            tracing::warn!("No databases matched the selection; nothing to dump");
            return Ok(());
        }
        tracing::info!(
            "Dumping {} database(s) to {}",
            databases.len(),
            outdir.display()
        );

        let table_selector = TableSelector::from_config(&self.config);
        let pool_size = sub_pool_size(self.config.threads, databases.len());
        let budget = Arc::new(Semaphore::new(self.config.threads));
        let rules = Arc::new(self.config.rules.clone());
        let limits = ChunkLimits::new(self.config.stmt_size, self.config.chunksize_in_mb);

        for db in &databases {
            if cancel.is_cancelled() {
                tracing::warn!("Cancellation requested; not starting remaining databases");
                break;
            }

            let objects = list_objects(&mut *meta, db, &table_selector).await?;
            manifest.push(write_database_schema(&mut *meta, outdir, db).await?);
            for view in &objects.views {
                manifest.push(write_view_schema(&mut *meta, outdir, db, view).await?);
            }

            if objects.tables.is_empty() {
                tracing::info!("No tables to dump in '{}'", db);
                continue;
            }

            let mut units = Vec::with_capacity(objects.tables.len());
            for table in &objects.tables {
                manifest.push(write_table_schema(&mut *meta, outdir, db, table).await?);
                units.push(TableDump {
                    database: db.clone(),
                    table: table.clone(),
                    outdir: outdir.clone(),
                    format: self.config.format,
                    limits,
                    rules: Arc::clone(&rules),
                    stats: self.stats(),
                });
            }

            let lease = tokio::select! {
                _ = cancel.cancelled() => break,
                lease = Arc::clone(&budget).acquire_many_owned(pool_size as u32) => {
                    lease.context("Connection budget closed")?
                }
            };
            let pool = Pool::new(pool_size, &self.connector, &self.config.session_vars, db)
                .await
                .with_context(|| format!("Failed to create connection pool for database '{}'", db))?;

            tasks.spawn(dump_database(pool, lease, units, cancel.clone()));
        }

        Ok(())
    }
}

/// Connections per database sub-pool; the sizes of concurrently open
/// sub-pools never sum past `threads`
fn sub_pool_size(threads: usize, databases: usize) -> usize {
    (threads / databases.max(1)).clamp(1, threads.max(1))
}

/// Run every table of one database on its sub-pool, then close the pool
async fn dump_database<S: Session>(
    pool: Pool<S>,
    lease: OwnedSemaphorePermit,
    units: Vec<TableDump>,
    cancel: CancellationToken,
) -> DatabaseOutcome {
    let mut outcome = DatabaseOutcome::default();
    let mut tasks: JoinSet<(TableDump, Result<Vec<ManifestEntry>>)> = JoinSet::new();

    for unit in units {
        if cancel.is_cancelled() {
            tracing::warn!("Cancellation requested; not starting remaining tables");
            break;
        }
        let session = match pool.get().await {
            Ok(session) => session,
            Err(e) => {
                outcome.failed += 1;
                tracing::error!("Failed to dump table {}.{}: {:#}", unit.database, unit.table, e);
                continue;
            }
        };
        tasks.spawn(async move {
            let result = unit.run(session).await;
            (unit, result)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok((_, Ok(files))) => {
                outcome.dumped += 1;
                outcome.entries.extend(files);
            }
            Ok((unit, Err(e))) => {
                outcome.failed += 1;
                tracing::error!("Failed to dump table {}.{}: {:#}", unit.database, unit.table, e);
            }
            Err(e) => {
                outcome.failed += 1;
                tracing::error!("Table dump task failed: {}", e);
            }
        }
    }

    tracing::debug!(
        "Database '{}' done; releasing {} connection(s)",
        pool.label(),
        pool.size()
    );
    pool.close().await;
    drop(lease);
    outcome
}

async fn collect_database_dumps(tasks: &mut JoinSet<DatabaseOutcome>) -> DatabaseOutcome {
    let mut total = DatabaseOutcome::default();

    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(outcome) => {
                total.entries.extend(outcome.entries);
                total.dumped += outcome.dumped;
                total.failed += outcome.failed;
            }
            Err(e) => {
                total.failed += 1;
                tracing::error!("Database dump task failed: {}", e);
            }
        }
    }

    total
}

/// Tables and views of one database
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DatabaseObjects {
    pub tables: Vec<String>,
    pub views: Vec<String>,
}

pub async fn resolve_databases<S: Session>(
    session: &mut S,
    selector: &DatabaseSelector,
) -> Result<Vec<String>> {
    if !selector.needs_discovery() {
        return Ok(selector.select(&[]));
    }

    let rows = session
        .query_rows("SHOW DATABASES")
        .await
        .context("Failed to list databases")?;
    let available = rows
        .into_iter()
        .map(|row| {
            row.into_iter()
                .next()
                .flatten()
                .context("Malformed SHOW DATABASES result: missing database name")
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(selector.select(&available))
}

/// An explicit table list is taken as-is and yields no views
pub async fn list_objects<S: Session>(
    session: &mut S,
    database: &str,
    selector: &TableSelector,
) -> Result<DatabaseObjects> {
    if let TableSelector::Exact(tables) = selector {
        return Ok(DatabaseObjects {
            tables: tables.clone(),
            views: Vec::new(),
        });
    }

    let rows = session
        .query_rows(&format!("SHOW FULL TABLES FROM {}", quote_ident(database)))
        .await
        .with_context(|| format!("Failed to list tables in '{}'", database))?;

    let mut objects = DatabaseObjects::default();
    for row in rows {
        let mut columns = row.into_iter();
        let name = columns.next().flatten().with_context(|| {
            format!("Malformed SHOW FULL TABLES result for '{}'", database)
        })?;
        match columns.next().flatten().as_deref() {
            Some("VIEW") => objects.views.push(name),
            Some("BASE TABLE") | None => objects.tables.push(name),
            Some(other) => tracing::debug!("Skipping {} '{}.{}'", other, database, name),
        }
    }

    Ok(objects)
}

async fn show_create<S: Session>(session: &mut S, sql: &str) -> Result<String> {
    let rows = session
        .query_rows(sql)
        .await
        .with_context(|| format!("Failed to run '{}'", sql))?;
    rows.into_iter()
        .next()
        .and_then(|row| row.into_iter().nth(1).flatten())
        .with_context(|| format!("'{}' returned no definition", sql))
}

async fn write_schema_file(
    outdir: &Path,
    file_name: String,
    statement: &str,
    kind: FileKind,
    database: &str,
    table: Option<&str>,
) -> Result<ManifestEntry> {
    let content = format!("{};\n", statement);
    let path = outdir.join(&file_name);
    tokio::fs::write(&path, content.as_bytes())
        .await
        .with_context(|| format!("Failed to write schema file {}", path.display()))?;

    Ok(ManifestEntry {
        file: file_name,
        kind,
        database: database.to_string(),
        table: table.map(str::to_string),
        part: None,
        bytes: content.len() as u64,
        rows: 0,
        sha256: sha256_hex(content.as_bytes()),
    })
}

async fn write_database_schema<S: Session>(
    session: &mut S,
    outdir: &Path,
    database: &str,
) -> Result<ManifestEntry> {
    let sql = format!("SHOW CREATE DATABASE IF NOT EXISTS {}", quote_ident(database));
    let statement = show_create(session, &sql).await?;
    write_schema_file(
        outdir,
        database_file_name(database),
        &statement,
        FileKind::DatabaseCreate,
        database,
        None,
    )
    .await
}

async fn write_table_schema<S: Session>(
    session: &mut S,
    outdir: &Path,
    database: &str,
    table: &str,
) -> Result<ManifestEntry> {
    let sql = format!(
        "SHOW CREATE TABLE {}.{}",
        quote_ident(database),
        quote_ident(table)
    );
    let statement = show_create(session, &sql).await?;
    write_schema_file(
        outdir,
        schema_file_name(database, table),
        &statement,
        FileKind::TableSchema,
        database,
        Some(table),
    )
    .await
}

async fn write_view_schema<S: Session>(
    session: &mut S,
    outdir: &Path,
    database: &str,
    view: &str,
) -> Result<ManifestEntry> {
    let sql = format!(
        "SHOW CREATE VIEW {}.{}",
        quote_ident(database),
        quote_ident(view)
    );
    let statement = show_create(session, &sql).await?;
    write_schema_file(
        outdir,
        view_file_name(database, view),
        &statement,
        FileKind::ViewSchema,
        database,
        Some(view),
    )
    .await
}

/// True for columns the server computes (`VIRTUAL GENERATED` / `STORED GENERATED`)
pub fn is_generated_column(extra: &str) -> bool {
    let extra = extra.to_ascii_uppercase();
    extra.contains("VIRTUAL GENERATED") || extra.contains("STORED GENERATED")
}

/// Column list of a table's data SELECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectPlan {
    /// Column names written to the data files
    pub fields: Vec<String>,
    /// SELECT expressions, one per field
    pub expressions: Vec<String>,
}

impl SelectPlan {
    /// Build from `SHOW FIELDS` rows (`Field, Type, Null, Key, Default, Extra`)
    ///
    /// Generated and filtered columns are dropped; rewritten columns are
    /// aliased back to their own name.
    pub fn build(table: &str, columns: &[TextRow], rules: &TableRules) -> Result<Self> {
        let mut fields = Vec::new();
        let mut expressions = Vec::new();

        for row in columns {
            let name = row
                .first()
                .cloned()
                .flatten()
                .with_context(|| format!("Malformed SHOW FIELDS result for '{}'", table))?;
            let extra = row.get(5).cloned().flatten().unwrap_or_default();

            if is_generated_column(&extra) || rules.is_filtered(table, &name) {
                continue;
            }

            let expression = match rules.select_expression(table, &name) {
                Some(expr) => format!("{} AS {}", expr, quote_ident(&name)),
                None => quote_ident(&name),
            };
            fields.push(name);
            expressions.push(expression);
        }

        if fields.is_empty() {
            bail!("Table '{}' has no columns left to dump", table);
        }

        Ok(Self {
            fields,
            expressions,
        })
    }

    pub fn query(&self, database: &str, table: &str, predicate: Option<&str>) -> String {
        let mut sql = format!(
            "SELECT {} FROM {}.{}",
            self.expressions.join(","),
            quote_ident(database),
            quote_ident(table)
        );
        if let Some(predicate) = predicate {
            sql.push_str(" WHERE ");
            sql.push_str(predicate);
        }
        sql
    }
}

/// One (database, table) export
struct TableDump {
    database: String,
    table: String,
    outdir: PathBuf,
    format: OutputFormat,
    limits: ChunkLimits,
    rules: Arc<TableRules>,
    stats: Arc<Stats>,
}

impl TableDump {
    async fn run<S: Session>(&self, mut session: PooledSession<S>) -> Result<Vec<ManifestEntry>> {
        tracing::debug!(
            "Dumping {}.{} on connection #{}",
            self.database,
            self.table,
            session.id()
        );

        let columns = session
            .query_rows(&format!(
                "SHOW FIELDS FROM {}.{}",
                quote_ident(&self.database),
                quote_ident(&self.table)
            ))
            .await
            .with_context(|| format!("Failed to read columns of {}.{}", self.database, self.table))?;
        let plan = SelectPlan::build(&self.table, &columns, &self.rules)?;
        let sql = plan.query(
            &self.database,
            &self.table,
            self.rules.where_clause(&self.table),
        );

        let mut writer = TableWriter::new(self.format, &self.table, self.limits);
        writer.initialize(&plan.fields)?;
        let mut sink = TableSink {
            dump: self,
            writer,
            next_file: 1,
            files: Vec::new(),
        };

        let rows = session
            .stream_rows(&sql, &mut sink)
            .await
            .with_context(|| format!("Failed to stream rows of {}.{}", self.database, self.table))?;
        let files = sink.finish().await?;

        tracing::info!(
            "✓ Dumped {}.{} ({} rows, {} file(s), connection #{})",
            self.database,
            self.table,
            rows,
            files.len(),
            session.id()
        );

        Ok(files
            .into_iter()
            .map(|file| ManifestEntry {
                file: file.file_name,
                kind: FileKind::TableData,
                database: self.database.clone(),
                table: Some(self.table.clone()),
                part: Some(file.part),
                bytes: file.bytes,
                rows: file.rows,
                sha256: file.sha256,
            })
            .collect())
    }
}

/// Receives streamed rows and rotates chunk files as they fill up
struct TableSink<'a> {
    dump: &'a TableDump,
    writer: TableWriter,
    next_file: u32,
    files: Vec<ChunkFile>,
}

impl TableSink<'_> {
    async fn flush(&mut self) -> Result<()> {
        let written = self
            .writer
            .flush(
                &self.dump.outdir,
                &self.dump.database,
                &self.dump.table,
                self.next_file,
            )
            .await?;
        self.record(written);
        Ok(())
    }

    async fn finish(mut self) -> Result<Vec<ChunkFile>> {
        let written = self
            .writer
            .close(
                &self.dump.outdir,
                &self.dump.database,
                &self.dump.table,
                self.next_file,
            )
            .await?;
        self.record(written);
        Ok(self.files)
    }

    fn record(&mut self, written: Option<ChunkFile>) {
        if let Some(file) = written {
            self.dump.stats.add_files(1);
            self.next_file += 1;
            self.files.push(file);
        }
    }
}

#[async_trait]
impl<'a> RowSink for TableSink<'a> {
    async fn accept(&mut self, row: Vec<SqlValue>) -> Result<()> {
        let added = self.writer.write_row(&row)?;
        self.dump.stats.add_bytes(added as u64);
        self.dump.stats.add_rows(1);
        if self.writer.should_flush() {
            self.flush().await?;
        }
        Ok(())
    }
}
