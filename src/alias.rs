//
// alias.rs
// Dicom-Prep-rs
//
// Persistent, append-only mapping from real patient identifiers to stable pseudonymous subject aliases.
//
// Thales Matheus Mendonça Santos - November 2025

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::PrepError;

/// Prefix of every allocated alias (`Subject1`, `Subject2`, ...).
pub const ALIAS_PREFIX: &str = "Subject";

/// Default file name of the persisted table.
pub const DEFAULT_STORE_FILE: &str = "anonymizer_dictionary.bin";

/// Anything able to hand out an alias for a real identifier.
pub trait Pseudonymizer {
    fn pseudonym(&mut self, real_id: &str) -> Result<String>;
}

/// A patient whose alias is already known (e.g. from its directory name).
#[derive(Debug, Clone)]
pub struct FixedAlias(pub String);

impl Pseudonymizer for FixedAlias {
    fn pseudonym(&mut self, _real_id: &str) -> Result<String> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AliasEntry {
    /// The identifier exactly as seen, the lookup key.
    pub raw: String,
    pub alias: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AliasTable {
    entries: Vec<AliasEntry>,
}

/// A new identifier that only differs from a known one by case or spacing.
/// Both keep their own alias; the pair is reported for a manual look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    pub existing: String,
    pub existing_alias: String,
    pub incoming: String,
    pub incoming_alias: String,
}

#[derive(Debug)]
pub struct AliasStore {
    path: PathBuf,
    entries: Vec<AliasEntry>,
    index: HashMap<String, usize>,
    /// Normalized form -> first entry carrying it.
    normalized: HashMap<String, usize>,
    used_aliases: HashSet<String>,
    previous_entries: usize,
    collisions: Vec<Collision>,
}

impl AliasStore {
    /// Load the table at `path`, or start an empty one if the file does not exist yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let table = if path.exists() {
            let bytes = fs::read(&path)
                .with_context(|| format!("Failed to read alias store {:?}", path))?;
            bincode::deserialize::<AliasTable>(&bytes).map_err(|e| PrepError::Store {
                path: path.clone(),
                reason: e.to_string(),
            })?
        } else {
            debug!("No alias store at {:?}, starting empty", path);
            AliasTable::default()
        };

        let mut store = Self {
            path,
            entries: Vec::with_capacity(table.entries.len()),
            index: HashMap::new(),
            normalized: HashMap::new(),
            used_aliases: HashSet::new(),
            previous_entries: 0,
            collisions: Vec::new(),
        };
        for entry in table.entries {
            store.push(entry);
        }
        store.previous_entries = store.entries.len();
        info!(
            "Loaded {} alias mapping(s) from {:?}",
            store.previous_entries, store.path
        );
        Ok(store)
    }

    /// Return the alias for `real_id`, allocating a fresh one on first sight.
    ///
    /// Identifiers are compared exactly, so distinct identifiers never share an alias.
    pub fn resolve(&mut self, real_id: &str) -> String {
        if let Some(&idx) = self.index.get(real_id) {
            return self.entries[idx].alias.clone();
        }

        let alias = self.next_alias();
        debug!("New alias {} allocated", alias);
        if let Some(&idx) = self.normalized.get(&normalize_id(real_id)) {
            let existing = &self.entries[idx];
            warn!(
                "Identifier {:?} ({}) looks like {:?} ({}); check they are different patients",
                real_id, alias, existing.raw, existing.alias
            );
            self.collisions.push(Collision {
                existing: existing.raw.clone(),
                existing_alias: existing.alias.clone(),
                incoming: real_id.to_string(),
                incoming_alias: alias.clone(),
            });
        }
        self.push(AliasEntry {
            raw: real_id.to_string(),
            alias: alias.clone(),
        });
        alias
    }

    pub fn get(&self, real_id: &str) -> Option<&str> {
        self.index
            .get(real_id)
            .map(|&idx| self.entries[idx].alias.as_str())
    }

    /// True when `name` is an alias this store handed out.
    pub fn is_alias(&self, name: &str) -> bool {
        self.used_aliases.contains(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of mappings that existed when the store was loaded.
    pub fn previous_entries(&self) -> usize {
        self.previous_entries
    }

    pub fn collisions(&self) -> &[Collision] {
        &self.collisions
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = &AliasEntry> {
        self.entries.iter()
    }

    /// Persist the table. The bytes go to a sibling temp file first and are renamed into place.
    pub fn flush(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }
        let table = AliasTable {
            entries: self.entries.clone(),
        };
        let bytes = bincode::serialize(&table).map_err(|e| PrepError::Store {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, bytes).with_context(|| format!("Failed to write {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to move alias store into {:?}", self.path))?;
        info!("Saved {} alias mapping(s) to {:?}", self.len(), self.path);
        Ok(())
    }

    /// Plain-text `patient aliases.txt` style listing.
    pub fn write_alias_table(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        let _ = writeln!(out, "{:<40}{}", "Patient Name", "Patient Alias");
        for entry in &self.entries {
            let _ = writeln!(out, "{:<40}{}", entry.raw, entry.alias);
        }
        fs::write(path, out).with_context(|| format!("Failed to write {:?}", path))?;
        Ok(())
    }

    /// Boxed table for terminal output.
    pub fn render_table(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "printing contents of: {}:", self.path.display());
        let _ = writeln!(out, " {} ", "-".repeat(71));
        let _ = writeln!(out, "| {:^3} | {:^50} | {:^10} |", "No.", "Patient's Name", "Alias");
        let _ = writeln!(
            out,
            "| {:<3} | {:<50} | {:<10} |",
            "-".repeat(3),
            "-".repeat(50),
            "-".repeat(10)
        );
        for (i, entry) in self.entries.iter().enumerate() {
            let _ = writeln!(
                out,
                "| {:<3} | {:<50} | {:<10} |",
                format!("{}.", i + 1),
                entry.raw,
                entry.alias
            );
        }
        let _ = write!(out, " {} ", "-".repeat(71));
        out
    }

    fn push(&mut self, entry: AliasEntry) {
        self.normalized
            .entry(normalize_id(&entry.raw))
            .or_insert(self.entries.len());
        self.index.insert(entry.raw.clone(), self.entries.len());
        self.used_aliases.insert(entry.alias.clone());
        self.entries.push(entry);
    }

    fn next_alias(&self) -> String {
        let mut n = self.entries.len() + 1;
        loop {
            let candidate = format!("{}{}", ALIAS_PREFIX, n);
            if !self.used_aliases.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

impl Pseudonymizer for AliasStore {
    fn pseudonym(&mut self, real_id: &str) -> Result<String> {
        Ok(self.resolve(real_id))
    }
}

/// Lowercase, trim and collapse inner whitespace. Used to spot near-duplicate identifiers.
pub fn normalize_id(real_id: &str) -> String {
    real_id
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
