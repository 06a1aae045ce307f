// ABOUTME: Dump directory naming scheme and restore-side file classification
// ABOUTME: Builds and parses `db.table[.part].ext` names and walks an output directory

use crate::writer::OutputFormat;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Empty marker written at the root of every dump directory
pub const METADATA_FILE: &str = "metadata";
/// Structured index of the files a dump produced
pub const MANIFEST_FILE: &str = "manifest.json";

const DATABASE_SUFFIX: &str = "-schema-create.sql";
const SCHEMA_SUFFIX: &str = "-schema.sql";
const VIEW_SUFFIX: &str = "-schema-view.sql";
const DATA_SUFFIX: &str = ".sql";

pub fn database_file_name(db: &str) -> String {
    format!("{}{}", db, DATABASE_SUFFIX)
}

pub fn schema_file_name(db: &str, table: &str) -> String {
    format!("{}.{}{}", db, table, SCHEMA_SUFFIX)
}

pub fn view_file_name(db: &str, view: &str) -> String {
    format!("{}.{}{}", db, view, VIEW_SUFFIX)
}

/// `<db>.<table>.<NNNNN>.<ext>` with a zero-padded 5-digit sequence number
pub fn data_file_name(db: &str, table: &str, file_no: u32, format: OutputFormat) -> String {
    format!("{}.{}.{:05}.{}", db, table, file_no, format.extension())
}

/// What a file in a dump directory holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    DatabaseCreate,
    TableSchema,
    ViewSchema,
    TableData,
}

/// Classify a file name by suffix; `None` for files restore ignores
///
/// # Examples
///
/// ```
/// # use mysql_dumper::migration::files::{classify, FileKind};
/// assert_eq!(classify("shop-schema-create.sql"), Some(FileKind::DatabaseCreate));
/// assert_eq!(classify("shop.users-schema.sql"), Some(FileKind::TableSchema));
/// assert_eq!(classify("shop.v_users-schema-view.sql"), Some(FileKind::ViewSchema));
/// assert_eq!(classify("shop.users.00001.sql"), Some(FileKind::TableData));
/// assert_eq!(classify("shop.users.00001.csv"), None);
/// assert_eq!(classify("metadata"), None);
/// ```
pub fn classify(file_name: &str) -> Option<FileKind> {
    if file_name.ends_with(DATABASE_SUFFIX) {
        Some(FileKind::DatabaseCreate)
    } else if file_name.ends_with(SCHEMA_SUFFIX) {
        Some(FileKind::TableSchema)
    } else if file_name.ends_with(VIEW_SUFFIX) {
        Some(FileKind::ViewSchema)
    } else if file_name.ends_with(DATA_SUFFIX) {
        Some(FileKind::TableData)
    } else {
        None
    }
}

/// Database, table and optional part recovered from a file name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub database: String,
    pub table: String,
    pub part: Option<u32>,
}

/// Parse `database.table[.part]` out of a table, view or data file name
pub fn parse_file_name(file_name: &str, kind: FileKind) -> Result<TableRef> {
    let suffix = match kind {
        FileKind::TableSchema => SCHEMA_SUFFIX,
        FileKind::ViewSchema => VIEW_SUFFIX,
        FileKind::TableData => DATA_SUFFIX,
        FileKind::DatabaseCreate => {
            bail!(
                "Database creation file '{}' does not name a table",
                file_name
            )
        }
    };

    let stem = file_name
        .strip_suffix(suffix)
        .with_context(|| format!("File '{}' does not end with '{}'", file_name, suffix))?;
    let parts: Vec<&str> = stem.split('.').collect();
    if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
        bail!(
            "Expected '<database>.<table>' in file name '{}'",
            file_name
        );
    }

    Ok(TableRef {
        database: parts[0].to_string(),
        table: parts[1].to_string(),
        part: parts.get(2).and_then(|p| p.parse().ok()),
    })
}

/// Every restorable file under a dump directory, bucketed by kind
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreFileSet {
    pub databases: Vec<PathBuf>,
    pub schemas: Vec<PathBuf>,
    pub views: Vec<PathBuf>,
    pub tables: Vec<PathBuf>,
}

impl RestoreFileSet {
    /// Walk `dir` recursively and classify every regular file
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut set = Self::default();

        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry =
                entry.with_context(|| format!("Failed to walk dump directory {}", dir.display()))?;
            if entry.file_type().is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                tracing::warn!("Skipping non UTF-8 file name {}", entry.path().display());
                continue;
            };
            match classify(name) {
                Some(FileKind::DatabaseCreate) => set.databases.push(entry.into_path()),
                Some(FileKind::TableSchema) => set.schemas.push(entry.into_path()),
                Some(FileKind::ViewSchema) => set.views.push(entry.into_path()),
                Some(FileKind::TableData) => set.tables.push(entry.into_path()),
                None => {}
            }
        }

        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.databases.len() + self.schemas.len() + self.views.len() + self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every file of the set, in restore order
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.databases
            .iter()
            .chain(&self.schemas)
            .chain(&self.views)
            .chain(&self.tables)
    }
}

/// `path` relative to the dump directory, `/`-separated
///
/// This is the key a manifest records a file under.
pub fn relative_name(dir: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(dir)
        .with_context(|| format!("{} is outside {}", path.display(), dir.display()))?;
    let parts = relative
        .components()
        .map(|part| {
            part.as_os_str()
                .to_str()
                .with_context(|| format!("Invalid file name in path {}", path.display()))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(parts.join("/"))
}

/// File name component of a path as UTF-8
pub fn file_name_of(path: &Path) -> Result<&str> {
    path.file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("Invalid file name in path {}", path.display()))
}
