// ABOUTME: Phased replay of a dump directory into a live server
// ABOUTME: Schemas restore sequentially; data files restore in parallel and abort together

use super::files::{
    classify, file_name_of, parse_file_name, relative_name, FileKind, RestoreFileSet, TableRef,
};
use super::manifest::{Manifest, ManifestEntry};
use super::progress::{ProgressReporter, Stats};
use crate::config::Config;
use crate::mysql::MysqlConnector;
use crate::pool::{Pool, PooledSession};
use crate::session::{Connector, Session};
use crate::utils::{
    format_bytes, format_duration, megabytes_per_second, quote_ident, sha256_hex,
    split_statements, trim_ascii_whitespace,
};
use crate::writer::OutputFormat;
use anyhow::{bail, Context, Result};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Replays a dump directory (`Config::outdir`) into the configured server
///
/// Database creates, then table schemas, then views run one after another on a
/// single session. Only when all of them succeeded do data files start, in
/// random order and bounded by the pool; the first failing data file cancels
/// the rest and fails the run.
pub struct Loader<C: Connector = MysqlConnector> {
    config: Config,
    connector: C,
    stats: Arc<Stats>,
}

impl Loader {
    pub fn new(config: Config) -> Result<Self> {
        let connector = MysqlConnector::new(&config)?;
        Self::with_connector(config, connector)
    }
}

impl<C: Connector> Loader<C> {
    pub fn with_connector(config: Config, connector: C) -> Result<Self> {
        config.validate().context("Invalid restore configuration")?;
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
        let dir = &self.config.outdir;

        let metadata = tokio::fs::metadata(dir)
            .await
            .with_context(|| format!("Failed to read dump directory {}", dir.display()))?;
        if !metadata.is_dir() {
            bail!("Dump directory {} is not a directory", dir.display());
        }

        let pool = Pool::new(
            self.config.threads,
            &self.connector,
            &self.config.session_vars,
            "",
        )
        .await
        .context("Failed to create restore connection pool")?;

        let reporter = ProgressReporter::start(
            self.stats(),
            Duration::from_millis(self.config.interval_ms),
            "restore",
            &cancel,
        );
        let result = self.restore(&pool, &cancel).await;
        reporter.stop().await;
        pool.close().await;
        result?;

        let totals = self.stats.snapshot();
        let elapsed = started.elapsed();
        tracing::info!(
            "✓ Restore completed in {}: {} file(s), {} ({:.2} MB/s)",
            format_duration(elapsed),
            totals.files,
            format_bytes(totals.bytes),
            megabytes_per_second(totals.bytes, elapsed)
        );
        Ok(())
    }

    async fn restore(&self, pool: &Pool<C::Session>, cancel: &CancellationToken) -> Result<()> {
        let dir = &self.config.outdir;
        let files = RestoreFileSet::scan(dir)?;
        let catalog = Arc::new(Catalog::new(Manifest::load(dir)?));

        tracing::info!(
            "Restoring {} from {}: {} database(s), {} table schema(s), {} view(s), {} data file(s)",
            if catalog.has_manifest() { "with manifest" } else { "without manifest" },
            dir.display(),
            files.databases.len(),
            files.schemas.len(),
            files.views.len(),
            files.tables.len()
        );
        if files.is_empty() {
            tracing::warn!("No restorable .sql files found in {}", dir.display());
        } else {
            tracing::debug!("Found {} restorable file(s)", files.len());
        }
        let present = files
            .paths()
            .map(|path| relative_name(dir, path))
            .collect::<Result<HashSet<_>>>()?;
        for missing in catalog.missing(&present) {
            tracing::warn!(
                "{} is listed in the manifest but missing from {}",
                missing,
                dir.display()
            );
        }

        {
            let mut session = pool.get().await?;

            for path in &files.databases {
                ensure_not_cancelled(cancel)?;
                self.restore_database_file(&mut *session, path, &catalog)
                    .await?;
            }
            tracing::info!("✓ Created {} database(s)", files.databases.len());

            for path in &files.schemas {
                ensure_not_cancelled(cancel)?;
                self.restore_schema_file(&mut *session, path, FileKind::TableSchema, &catalog)
                    .await?;
            }
            tracing::info!("✓ Restored {} table schema(s)", files.schemas.len());

            for path in &files.views {
                ensure_not_cancelled(cancel)?;
                self.restore_schema_file(&mut *session, path, FileKind::ViewSchema, &catalog)
                    .await?;
            }
            tracing::info!("✓ Restored {} view(s)", files.views.len());
        }

        self.restore_tables(pool, files.tables, catalog, cancel)
            .await
    }

    async fn restore_database_file(
        &self,
        session: &mut C::Session,
        path: &Path,
        catalog: &Catalog,
    ) -> Result<()> {
        let key = relative_name(&self.config.outdir, path)?;
        let data = read_verified(path, &key, catalog).await?;

        let statement = trim_statement(&data);
        if !statement.is_empty() {
            session
                .execute_raw(statement)
                .await
                .with_context(|| format!("Failed to execute {}", key))?;
        }
        self.stats.add_bytes(data.len() as u64);
        self.stats.add_files(1);
        tracing::debug!("Executed {}", key);
        Ok(())
    }

    async fn restore_schema_file(
        &self,
        session: &mut C::Session,
        path: &Path,
        kind: FileKind,
        catalog: &Catalog,
    ) -> Result<()> {
        let key = relative_name(&self.config.outdir, path)?;
        let target = catalog.target(&key, file_name_of(path)?, kind)?;
        let data = read_verified(path, &key, catalog).await?;

        prepare_session(session, &target.database).await?;
        if self.config.overwrite_tables {
            let object = if kind == FileKind::ViewSchema { "VIEW" } else { "TABLE" };
            session
                .execute(&format!(
                    "DROP {} IF EXISTS {}",
                    object,
                    quote_ident(&target.table)
                ))
                .await
                .with_context(|| {
                    format!("Failed to drop {}.{}", target.database, target.table)
                })?;
        }
        for statement in split_statements(&data) {
            session
                .execute_raw(statement)
                .await
                .with_context(|| format!("Failed to execute statement from {}", key))?;
        }

        self.stats.add_bytes(data.len() as u64);
        self.stats.add_files(1);
        tracing::debug!("Restored schema {}.{}", target.database, target.table);
        Ok(())
    }

    /// Restore data files concurrently, aborting everything on the first failure
    async fn restore_tables(
        &self,
        pool: &Pool<C::Session>,
        mut files: Vec<PathBuf>,
        catalog: Arc<Catalog>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        files.shuffle(&mut rand::thread_rng());

        let group = cancel.child_token();
        let mut tasks: JoinSet<Result<()>> = JoinSet::new();
        let mut failures = FirstFailure::default();

        for path in files {
            let key = match relative_name(&self.config.outdir, &path) {
                Ok(key) => key,
                Err(e) => {
                    failures.record(e);
                    group.cancel();
                    break;
                }
            };
            let session = tokio::select! {
                _ = group.cancelled() => break,
                session = pool.get() => session,
            };
            let session = match session {
                Ok(session) => session,
                Err(e) => {
                    failures.record(e);
                    group.cancel();
                    break;
                }
            };

            let catalog = Arc::clone(&catalog);
            let stats = self.stats();
            let group = group.clone();
            tasks.spawn(async move {
                let result =
                    restore_data_file(session, &path, &key, &catalog, &stats, &group).await;
                if result.is_err() {
                    group.cancel();
                }
                result
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => failures.record(e),
                Err(e) => {
                    group.cancel();
                    failures.record(anyhow::anyhow!("Restore task failed: {}", e));
                }
            }
        }

        if let Some(e) = failures.into_error() {
            return Err(e);
        }
        ensure_not_cancelled(cancel)?;
        Ok(())
    }
}

async fn restore_data_file<S: Session>(
    mut session: PooledSession<S>,
    path: &Path,
    key: &str,
    catalog: &Catalog,
    stats: &Stats,
    cancel: &CancellationToken,
) -> Result<()> {
    let target = catalog.target(key, file_name_of(path)?, FileKind::TableData)?;
    let data = read_verified(path, key, catalog).await?;

    tracing::debug!(
        "Restoring {}.{} part {} on connection #{}",
        target.database,
        target.table,
        target
            .part
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string()),
        session.id()
    );

    prepare_session(&mut *session, &target.database).await?;
    for statement in split_statements(&data) {
        if cancel.is_cancelled() {
            return Err(Cancelled(key.to_string()).into());
        }
        session
            .execute_raw(statement)
            .await
            .with_context(|| format!("Failed to execute statement from {}", key))?;
    }

    stats.add_bytes(data.len() as u64);
    stats.add_files(1);
    stats.add_rows(catalog.rows(key));
    tracing::info!("✓ Restored {}", key);
    Ok(())
}

async fn prepare_session<S: Session>(session: &mut S, database: &str) -> Result<()> {
    session
        .execute(&format!("USE {}", quote_ident(database)))
        .await
        .with_context(|| format!("Failed to switch to database '{}'", database))?;
    session
        .execute("SET FOREIGN_KEY_CHECKS=0")
        .await
        .context("Failed to disable foreign key checks")
}

async fn read_verified(path: &Path, key: &str, catalog: &Catalog) -> Result<Vec<u8>> {
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    catalog.verify(key, &data)?;
    Ok(data)
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        bail!("Restore cancelled");
    }
    Ok(())
}

/// Whitespace and trailing `;` stripped
fn trim_statement(data: &[u8]) -> &[u8] {
    let mut statement = trim_ascii_whitespace(data);
    while let Some(stripped) = statement.strip_suffix(b";") {
        statement = trim_ascii_whitespace(stripped);
    }
    statement
}

/// A data file stopped because the restore group was cancelled
#[derive(Debug)]
struct Cancelled(String);

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Restore of {} cancelled", self.0)
    }
}

impl std::error::Error for Cancelled {}

/// Keeps the error that caused an abort rather than the cancellations it triggered
#[derive(Default)]
struct FirstFailure {
    error: Option<anyhow::Error>,
}

impl FirstFailure {
    fn record(&mut self, error: anyhow::Error) {
        match &self.error {
            None => self.error = Some(error),
            Some(first) if first.is::<Cancelled>() && !error.is::<Cancelled>() => {
                self.error = Some(error)
            }
            Some(_) => tracing::debug!("Additional restore failure: {:#}", error),
        }
    }

    fn into_error(self) -> Option<anyhow::Error> {
        self.error
    }
}

/// Resolves restore targets from the manifest, falling back to file names
///
/// Entries are keyed by path relative to the dump directory.
struct Catalog {
    manifest: Option<Manifest>,
    entries: HashMap<String, ManifestEntry>,
}

impl Catalog {
    fn new(manifest: Option<Manifest>) -> Self {
        let entries = manifest
            .as_ref()
            .map(|m| {
                m.entries
                    .iter()
                    .map(|entry| (entry.file.clone(), entry.clone()))
                    .collect()
            })
            .unwrap_or_default();

        if let Some(m) = &manifest {
            if m.format != OutputFormat::Sql {
                tracing::warn!(
                    "Dump was written as {}; only .sql files can be restored",
                    m.format
                );
            }
        }

        Self { manifest, entries }
    }

    fn has_manifest(&self) -> bool {
        self.manifest.is_some()
    }

    fn target(&self, key: &str, name: &str, kind: FileKind) -> Result<TableRef> {
        if let Some(entry) = self.entries.get(key) {
            if let Some(table) = &entry.table {
                return Ok(TableRef {
                    database: entry.database.clone(),
                    table: table.clone(),
                    part: entry.part,
                });
            }
        }
        parse_file_name(name, kind)
    }

    /// Restorable manifest entries that are not among `present`
    fn missing(&self, present: &HashSet<String>) -> Vec<&str> {
        self.manifest
            .iter()
            .flat_map(|m| &m.entries)
            .filter(|entry| classify(&entry.file).is_some() && !present.contains(&entry.file))
            .map(|entry| entry.file.as_str())
            .collect()
    }

    /// Reject files whose content differs from what the dump recorded
    fn verify(&self, key: &str, data: &[u8]) -> Result<()> {
        let Some(entry) = self.entries.get(key) else {
            return Ok(());
        };
        let actual = sha256_hex(data);
        if actual != entry.sha256 {
            bail!(
                "Checksum mismatch for {}: manifest records {}, file has {}",
                key,
                entry.sha256,
                actual
            );
        }
        Ok(())
    }

    fn rows(&self, key: &str) -> u64 {
        self.entries.get(key).map_or(0, |entry| entry.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest_with(entry: ManifestEntry) -> Manifest {
        let mut manifest = Manifest::new(OutputFormat::Sql, String::new());
        manifest.push(entry);
        manifest
    }

    fn data_entry(file: &str, sha256: &str) -> ManifestEntry {
        ManifestEntry {
            file: file.to_string(),
            kind: FileKind::TableData,
            database: "shop".to_string(),
            table: Some("users".to_string()),
            part: Some(3),
            bytes: 5,
            rows: 7,
            sha256: sha256.to_string(),
        }
    }

    #[test]
    fn test_trim_statement() {
        assert_eq!(
            trim_statement(b"  CREATE DATABASE `a`;\n"),
            b"CREATE DATABASE `a`"
        );
        assert_eq!(trim_statement(b"SELECT 1 ; ;\n"), b"SELECT 1");
        assert!(trim_statement(b" ;\n").is_empty());
    }

    #[test]
    fn test_catalog_prefers_manifest() {
        let catalog = Catalog::new(Some(manifest_with(data_entry(
            "odd.name.sql",
            &sha256_hex(b"hello"),
        ))));
        let target = catalog
            .target("odd.name.sql", "odd.name.sql", FileKind::TableData)
            .unwrap();
        assert_eq!(target.database, "shop");
        assert_eq!(target.table, "users");
        assert_eq!(target.part, Some(3));
        assert_eq!(catalog.rows("odd.name.sql"), 7);

        let fallback = catalog
            .target("crm.leads.00002.sql", "crm.leads.00002.sql", FileKind::TableData)
            .unwrap();
        assert_eq!(fallback.database, "crm");
        assert_eq!(fallback.part, Some(2));
        assert_eq!(catalog.rows("crm.leads.00002.sql"), 0);
    }

    #[test]
    fn test_catalog_verifies_checksums() {
        let catalog = Catalog::new(Some(manifest_with(data_entry(
            "shop.users.00003.sql",
            &sha256_hex(b"hello"),
        ))));
        assert!(catalog.verify("shop.users.00003.sql", b"hello").is_ok());
        let err = catalog
            .verify("shop.users.00003.sql", b"tampered")
            .unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
        assert!(catalog.verify("not.listed.sql", b"anything").is_ok());
    }

    #[test]
    fn test_catalog_keys_by_relative_path() {
        let catalog = Catalog::new(Some(manifest_with(data_entry(
            "shop.users.00003.sql",
            &sha256_hex(b"hello"),
        ))));
        // A same-named file in a subdirectory is not the one the manifest recorded
        let nested = "copy/shop.users.00003.sql";
        assert!(catalog.verify(nested, b"different").is_ok());
        assert_eq!(catalog.rows(nested), 0);
        let target = catalog
            .target(nested, "shop.users.00003.sql", FileKind::TableData)
            .unwrap();
        assert_eq!(target.part, Some(3));
        assert!(catalog.verify("shop.users.00003.sql", b"different").is_err());
    }

    #[test]
    fn test_catalog_reports_missing_entries() {
        let mut manifest = manifest_with(data_entry("shop.users.00003.sql", "x"));
        manifest.push(data_entry("shop.users.00004.sql", "y"));
        manifest.push(data_entry("shop.users.00001.csv", "z"));
        let catalog = Catalog::new(Some(manifest));

        let present: HashSet<String> = ["shop.users.00003.sql".to_string()].into_iter().collect();
        assert_eq!(catalog.missing(&present), vec!["shop.users.00004.sql"]);
        assert!(Catalog::new(None).missing(&present).is_empty());
    }

    #[test]
    fn test_first_failure_prefers_root_cause() {
        let mut failures = FirstFailure::default();
        failures.record(Cancelled("a.b.00001.sql".into()).into());
        failures.record(anyhow::anyhow!("Duplicate entry"));
        failures.record(Cancelled("a.b.00002.sql".into()).into());
        assert_eq!(
            failures.into_error().unwrap().to_string(),
            "Duplicate entry"
        );
    }
}
