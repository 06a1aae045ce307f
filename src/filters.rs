// ABOUTME: Database and table selection for a dump run
// ABOUTME: Exact lists, regex include/exclude and discovery of everything

use crate::config::Config;
use crate::utils::split_list;
use anyhow::{Context, Result};
use regex::Regex;

/// Schemas owned by the server itself, skipped when dumping everything
pub const SYSTEM_DATABASES: &[&str] = &["information_schema", "performance_schema", "mysql", "sys"];

pub fn is_system_database(name: &str) -> bool {
    SYSTEM_DATABASES
        .iter()
        .any(|system| system.eq_ignore_ascii_case(name))
}

/// How the databases of a run are chosen
#[derive(Debug, Clone)]
pub enum DatabaseSelector {
    /// Exactly these names, in order; no discovery
    Exact(Vec<String>),
    /// Discovered names matching (or, inverted, not matching) a pattern,
    /// system schemas included
    Pattern { regex: Regex, invert: bool },
    /// Every discovered non-system database
    All,
}

impl DatabaseSelector {
    pub fn from_config(config: &Config) -> Result<Self> {
        let names = split_list(&config.database);
        if !names.is_empty() {
            return Ok(DatabaseSelector::Exact(names));
        }
        if let Some(pattern) = &config.database_regexp {
            let regex = Regex::new(pattern)
                .with_context(|| format!("Invalid database regexp '{}'", pattern))?;
            return Ok(DatabaseSelector::Pattern {
                regex,
                invert: config.database_invert_regexp,
            });
        }
        Ok(DatabaseSelector::All)
    }

    /// True when the selection must be resolved against `SHOW DATABASES`
    pub fn needs_discovery(&self) -> bool {
        !matches!(self, DatabaseSelector::Exact(_))
    }

    /// Determines if a discovered database is part of the run
    pub fn should_dump(&self, name: &str) -> bool {
        match self {
            DatabaseSelector::Exact(names) => names.iter().any(|n| n == name),
            DatabaseSelector::Pattern { regex, invert } => regex.is_match(name) != *invert,
            DatabaseSelector::All => !is_system_database(name),
        }
    }

    /// Resolve the final database list
    ///
    /// Exact selections ignore `available` entirely.
    pub fn select(&self, available: &[String]) -> Vec<String> {
        match self {
            DatabaseSelector::Exact(names) => names.clone(),
            _ => available
                .iter()
                .filter(|name| self.should_dump(name))
                .cloned()
                .collect(),
        }
    }
}

/// How the tables of each selected database are chosen
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableSelector {
    Exact(Vec<String>),
    All,
}

impl TableSelector {
    pub fn from_config(config: &Config) -> Self {
        let names = split_list(&config.table);
        if names.is_empty() {
            TableSelector::All
        } else {
            TableSelector::Exact(names)
        }
    }
}
