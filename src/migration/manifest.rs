// ABOUTME: Structured index of the files in a dump directory
// ABOUTME: Written atomically after a dump, consulted and verified by restore

use super::files::{FileKind, MANIFEST_FILE};
use crate::writer::OutputFormat;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    /// File name relative to the dump directory
    pub file: String,
    pub kind: FileKind,
    pub database: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part: Option<u32>,
    pub bytes: u64,
    pub rows: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Manifest {
    pub version: u32,
    pub format: OutputFormat,
    pub rules_fingerprint: String,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(format: OutputFormat, rules_fingerprint: String) -> Self {
        Self {
            version: MANIFEST_VERSION,
            format,
            rules_fingerprint,
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: ManifestEntry) {
        self.entries.push(entry);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = ManifestEntry>) {
        self.entries.extend(entries);
    }

    /// Entries keyed by file name
    pub fn index(&self) -> HashMap<&str, &ManifestEntry> {
        self.entries
            .iter()
            .map(|entry| (entry.file.as_str(), entry))
            .collect()
    }

    /// Read `manifest.json` from a dump directory, if it has one
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read manifest at {}", path.display()))?;
        let manifest: Manifest = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse manifest JSON at {}", path.display()))?;

        if manifest.version != MANIFEST_VERSION {
            bail!(
                "Manifest version mismatch (found {}, expected {}) in {}",
                manifest.version,
                MANIFEST_VERSION,
                path.display()
            );
        }

        Ok(Some(manifest))
    }

    /// Write `manifest.json` into `dir` via a temp file and rename
    pub fn save(&self, dir: &Path) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        let mut sorted = self.clone();
        sorted.entries.sort_by(|a, b| a.file.cmp(&b.file));

        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp manifest in {}", dir.display()))?;
        serde_json::to_writer_pretty(tmp.as_file_mut(), &sorted)
            .with_context(|| format!("Failed to serialize manifest at {}", path.display()))?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to persist manifest at {}", path.display()))?;

        Ok(())
    }
}
