// ABOUTME: Run configuration shared by dump and restore, with defaults and validation
// ABOUTME: Parses TOML config and rules files into Config and TableRules

use crate::table_rules::TableRules;
use crate::writer::OutputFormat;
use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ADDRESS: &str = "127.0.0.1:3306";
pub const DEFAULT_CHUNKSIZE_IN_MB: u64 = 128;
pub const DEFAULT_STMT_SIZE: u64 = 1_000_000;
pub const DEFAULT_THREADS: usize = 16;
pub const DEFAULT_INTERVAL_MS: u64 = 10_000;

/// Parameters of one dump or restore run
///
/// Immutable once a run starts. Counters live in
/// [`Stats`](crate::migration::progress::Stats), never here.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub user: String,
    pub password: String,
    /// `host[:port]`
    pub address: String,
    /// Comma-separated exact database names
    pub database: String,
    /// Select databases by pattern instead of by name
    pub database_regexp: Option<String>,
    /// Select the databases the pattern does NOT match
    pub database_invert_regexp: bool,
    /// Comma-separated table names applied to every selected database
    pub table: String,
    #[serde(skip)]
    pub rules: TableRules,
    pub chunksize_in_mb: u64,
    /// Accumulated row bytes before a new INSERT statement starts
    pub stmt_size: u64,
    /// Global concurrency budget
    pub threads: usize,
    pub outdir: PathBuf,
    /// Progress log cadence
    pub interval_ms: u64,
    /// Restore only: drop tables and views before creating them
    pub overwrite_tables: bool,
    /// `;`-separated statements executed on every new session
    pub session_vars: String,
    pub format: OutputFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user: String::new(),
            password: String::new(),
            address: DEFAULT_ADDRESS.to_string(),
            database: String::new(),
            database_regexp: None,
            database_invert_regexp: false,
            table: String::new(),
            rules: TableRules::default(),
            chunksize_in_mb: DEFAULT_CHUNKSIZE_IN_MB,
            stmt_size: DEFAULT_STMT_SIZE,
            threads: DEFAULT_THREADS,
            outdir: PathBuf::new(),
            interval_ms: DEFAULT_INTERVAL_MS,
            overwrite_tables: false,
            session_vars: String::new(),
            format: OutputFormat::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("user", &self.user)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("address", &self.address)
            .field("database", &self.database)
            .field("database_regexp", &self.database_regexp)
            .field("database_invert_regexp", &self.database_invert_regexp)
            .field("table", &self.table)
            .field("rules", &self.rules)
            .field("chunksize_in_mb", &self.chunksize_in_mb)
            .field("stmt_size", &self.stmt_size)
            .field("threads", &self.threads)
            .field("outdir", &self.outdir)
            .field("interval_ms", &self.interval_ms)
            .field("overwrite_tables", &self.overwrite_tables)
            .field("session_vars", &self.session_vars)
            .field("format", &self.format)
            .finish()
    }
}

impl Config {
    /// Reject configurations a run cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            bail!("threads must be at least 1");
        }
        if self.chunksize_in_mb == 0 {
            bail!("chunksize_in_mb must be at least 1");
        }
        if self.stmt_size == 0 {
            bail!("stmt_size must be at least 1");
        }
        if self.interval_ms == 0 {
            bail!("interval_ms must be at least 1");
        }
        if self.outdir.as_os_str().is_empty() {
            bail!("outdir cannot be empty");
        }
        crate::mysql::parse_address(&self.address)?;

        match &self.database_regexp {
            Some(pattern) => {
                if !self.database.trim().is_empty() {
                    bail!("Cannot use both --database and --database-regexp");
                }
                Regex::new(pattern)
                    .with_context(|| format!("Invalid database regexp '{}'", pattern))?;
            }
            None => {
                if self.database_invert_regexp {
                    bail!("--database-invert-regexp requires --database-regexp");
                }
            }
        }

        Ok(())
    }

    /// Load a config file; its `[tables.*]` sections become the table rules
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let parsed: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse TOML config at {}", path.display()))?;

        let mut config = parsed.config;
        config.rules = rules_from_tables(parsed.tables)?;
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(flatten)]
    config: Config,
    #[serde(default)]
    tables: BTreeMap<String, TableRuleConfig>,
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    tables: BTreeMap<String, TableRuleConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct TableRuleConfig {
    #[serde(default, rename = "where")]
    predicate: Option<String>,
    #[serde(default)]
    filters: Vec<String>,
    #[serde(default)]
    selects: BTreeMap<String, String>,
}

/// Parse a TOML rules file of `[tables.<name>]` sections
pub fn load_table_rules_from_file(path: &Path) -> Result<TableRules> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read rules file at {}", path.display()))?;
    let parsed: RulesFile = toml::from_str(&raw)
        .with_context(|| format!("Failed to parse TOML rules at {}", path.display()))?;
    rules_from_tables(parsed.tables)
}

fn rules_from_tables(tables: BTreeMap<String, TableRuleConfig>) -> Result<TableRules> {
    let mut rules = TableRules::default();
    for (table, rule) in tables {
        if let Some(predicate) = rule.predicate {
            rules.add_where(table.clone(), predicate)?;
        }
        for column in rule.filters {
            rules.add_filter(table.clone(), column)?;
        }
        for (column, expression) in rule.selects {
            rules.add_select(table.clone(), column, expression)?;
        }
    }
    Ok(rules)
}
