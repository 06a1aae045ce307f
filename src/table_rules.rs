// ABOUTME: Per-table dump rules: row predicates, column rewrites and column filters
// ABOUTME: Supports CLI/config inputs and deterministic fingerprints

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Rules keyed by table name, applied to that table in every selected database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableRules {
    wheres: BTreeMap<String, String>,
    selects: BTreeMap<String, BTreeMap<String, String>>,
    filters: BTreeMap<String, BTreeSet<String>>,
}

impl TableRules {
    /// Restrict the rows dumped from `table` to those matching `predicate`
    pub fn add_where(&mut self, table: String, predicate: String) -> Result<()> {
        let table = non_empty(&table, "table")?;
        let predicate = predicate.trim();
        if predicate.is_empty() {
            bail!("Where predicate cannot be empty for '{}'", table);
        }
        self.wheres.insert(table, predicate.to_string());
        Ok(())
    }

    /// Replace the SELECT expression of `table.column`, keeping the column name
    pub fn add_select(&mut self, table: String, column: String, expression: String) -> Result<()> {
        let table = non_empty(&table, "table")?;
        let column = non_empty(&column, "column")?;
        let expression = expression.trim();
        if expression.is_empty() {
            bail!("Select expression cannot be empty for '{}.{}'", table, column);
        }
        if self.is_filtered(&table, &column) {
            bail!(
                "Cannot rewrite column '{}.{}' because it is filtered out",
                table,
                column
            );
        }
        self.selects
            .entry(table)
            .or_default()
            .insert(column, expression.to_string());
        Ok(())
    }

    /// Omit `table.column` from dumped data
    pub fn add_filter(&mut self, table: String, column: String) -> Result<()> {
        let table = non_empty(&table, "table")?;
        let column = non_empty(&column, "column")?;
        if self.select_expression(&table, &column).is_some() {
            bail!(
                "Cannot filter column '{}.{}' because it has a select expression",
                table,
                column
            );
        }
        self.filters.entry(table).or_default().insert(column);
        Ok(())
    }

    /// Apply `table:predicate` entries
    pub fn apply_where_cli(&mut self, entries: &[String]) -> Result<()> {
        for entry in entries {
            let (table, predicate) = entry
                .split_once(':')
                .with_context(|| format!("Where rule '{}' missing ':' separator", entry))?;
            if predicate.trim().is_empty() {
                bail!("Where rule '{}' must include a predicate after ':'", entry);
            }
            self.add_where(table.to_string(), predicate.to_string())?;
        }
        Ok(())
    }

    /// Apply `table.column` entries
    pub fn apply_filter_cli(&mut self, entries: &[String]) -> Result<()> {
        for entry in entries {
            let (table, column) = parse_column_ref(entry)?;
            self.add_filter(table, column)?;
        }
        Ok(())
    }

    /// Apply `table.column=expression` entries
    pub fn apply_select_cli(&mut self, entries: &[String]) -> Result<()> {
        for entry in entries {
            let (target, expression) = entry
                .split_once('=')
                .with_context(|| format!("Select rule '{}' must be table.column=expression", entry))?;
            let (table, column) = parse_column_ref(target)?;
            self.add_select(table, column, expression.to_string())?;
        }
        Ok(())
    }

    pub fn where_clause(&self, table: &str) -> Option<&str> {
        self.wheres.get(table).map(String::as_str)
    }

    pub fn select_expression(&self, table: &str, column: &str) -> Option<&str> {
        self.selects
            .get(table)
            .and_then(|columns| columns.get(column))
            .map(String::as_str)
    }

    pub fn is_filtered(&self, table: &str, column: &str) -> bool {
        self.filters
            .get(table)
            .is_some_and(|columns| columns.contains(column))
    }

    /// Fold `other` into these rules; `other` wins on conflicts
    pub fn merge(&mut self, other: TableRules) -> Result<()> {
        for (table, predicate) in other.wheres {
            self.add_where(table, predicate)?;
        }
        for (table, columns) in other.filters {
            for column in columns {
                if let Some(columns) = self.selects.get_mut(&table) {
                    columns.remove(&column);
                }
                self.add_filter(table.clone(), column)?;
            }
        }
        for (table, columns) in other.selects {
            for (column, expression) in columns {
                if let Some(filtered) = self.filters.get_mut(&table) {
                    filtered.remove(&column);
                }
                self.add_select(table.clone(), column, expression)?;
            }
        }
        Ok(())
    }

    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"wheres");
        for (table, predicate) in &self.wheres {
            hash_entry(&mut hasher, &[table, predicate]);
        }
        hasher.update(b"selects");
        for (table, columns) in &self.selects {
            for (column, expression) in columns {
                hash_entry(&mut hasher, &[table, column, expression]);
            }
        }
        hasher.update(b"filters");
        for (table, columns) in &self.filters {
            for column in columns {
                hash_entry(&mut hasher, &[table, column]);
            }
        }
        format!("{:x}", hasher.finalize())
    }

    pub fn is_empty(&self) -> bool {
        self.wheres.is_empty() && self.selects.is_empty() && self.filters.is_empty()
    }
}

fn parse_column_ref(input: &str) -> Result<(String, String)> {
    let trimmed = input.trim();
    let (table, column) = trimmed
        .split_once('.')
        .with_context(|| format!("Column must be specified as 'table.column', got '{}'", input))?;
    Ok((non_empty(table, "table")?, non_empty(column, "column")?))
}

fn non_empty(value: &str, label: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        bail!("{} name cannot be empty", label);
    }
    Ok(trimmed.to_string())
}

fn hash_entry(hasher: &mut Sha256, parts: &[&String]) {
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update(b"|");
    }
    hasher.update(b";");
}
