//! Decision store: one CSV record per row id.
//!
//! Upserts are appended and flushed one record at a time; on load later lines
//! win over earlier ones for the same id. `compact` rewrites the file with a
//! single line per id (temp file + rename). Before a file with a foreign header
//! or unreadable lines is rewritten, the original is copied to `<name>.bak`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::rows::RowId;

const HEADER: &[&str] = &[
    "url_id",
    "decision",
    "confidence",
    "rationale",
    "organisation_name",
    "organisation_type",
    "evidence",
    "is_ongoing",
    "site_owner_is_initiative",
    "notes",
    "model",
    "raw_response",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    #[serde(alias = "INCLUDE", alias = "Include")]
    Include,
    #[serde(alias = "EXCLUDE", alias = "Exclude")]
    Exclude,
    #[default]
    #[serde(alias = "UNKNOWN", alias = "Unknown", alias = "")]
    Unknown,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Include => "include",
            Decision::Exclude => "exclude",
            Decision::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    #[serde(rename = "url_id")]
    pub id: RowId,
    pub decision: Decision,
    /// Older result files hold `4.0`, `None` or nothing here.
    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: Option<u8>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub organisation_name: Option<String>,
    #[serde(default)]
    pub organisation_type: Option<String>,
    /// Supporting quotes, ` | `-separated.
    #[serde(default)]
    pub evidence: String,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub is_ongoing: Option<bool>,
    #[serde(default, deserialize_with = "lenient_bool")]
    pub site_owner_is_initiative: Option<bool>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub raw_response: String,
}

impl DecisionRecord {
    pub fn unknown(id: RowId, rationale: impl Into<String>, model: &str) -> Self {
        DecisionRecord {
            id,
            decision: Decision::Unknown,
            confidence: None,
            rationale: rationale.into(),
            organisation_name: None,
            organisation_type: None,
            evidence: String::new(),
            is_ongoing: None,
            site_owner_is_initiative: None,
            notes: String::new(),
            model: model.to_string(),
            raw_response: String::new(),
        }
    }
}

fn lenient_confidence<'de, D: Deserializer<'de>>(d: D) -> Result<Option<u8>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(raw
        .and_then(|s| s.trim().parse::<f64>().ok())
        .filter(|n| (1.0..=5.0).contains(n))
        .map(|n| n.round() as u8))
}

fn lenient_bool<'de, D: Deserializer<'de>>(d: D) -> Result<Option<bool>, D::Error> {
    let raw: Option<String> = Option::deserialize(d)?;
    Ok(match raw.as_deref().map(|s| s.trim().to_lowercase()).as_deref() {
        Some("true" | "yes" | "1") => Some(true),
        Some("false" | "no" | "0") => Some(false),
        _ => None,
    })
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecisionCounts {
    pub include: usize,
    pub exclude: usize,
    pub unknown: usize,
}

pub struct DecisionStore {
    path: PathBuf,
    records: IndexMap<RowId, DecisionRecord>,
    writer: Option<csv::Writer<File>>,
    /// File needs a rewrite before appending (foreign header or damaged lines).
    stale: bool,
}

impl DecisionStore {
    /// Load `path` if it exists. Nothing is written until the first upsert.
    pub fn open(path: &Path) -> Result<DecisionStore> {
        let mut store = DecisionStore {
            path: path.to_path_buf(),
            records: IndexMap::new(),
            writer: None,
            stale: false,
        };
        if !path.exists() {
            return Ok(store);
        }

        let mut rdr = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .with_context(|| format!("Failed to open decision store {}", path.display()))?;
        let header: Vec<String> = rdr.headers()?.iter().map(str::to_string).collect();
        if !header.is_empty() && header != HEADER {
            debug!("{} has a foreign header; will rewrite", path.display());
            store.stale = true;
        }

        let mut lines = 0usize;
        for (i, result) in rdr.deserialize::<DecisionRecord>().enumerate() {
            match result {
                Ok(record) => {
                    lines += 1;
                    store.records.insert(record.id.clone(), record);
                }
                Err(e) => {
                    warn!("{}: skipping damaged line {}: {}", path.display(), i + 2, e);
                    store.stale = true;
                }
            }
        }
        if lines > store.records.len() {
            debug!(
                "{}: {} line(s) for {} id(s)",
                path.display(),
                lines,
                store.records.len()
            );
        }
        info!(
            "Loaded {} decision(s) from {}",
            store.records.len(),
            path.display()
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &RowId) -> Option<&DecisionRecord> {
        self.records.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DecisionRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn counts(&self) -> DecisionCounts {
        let mut c = DecisionCounts::default();
        for r in self.records.values() {
            match r.decision {
                Decision::Include => c.include += 1,
                Decision::Exclude => c.exclude += 1,
                Decision::Unknown => c.unknown += 1,
            }
        }
        c
    }

    /// Persist one record (a single flushed CSV line), replacing any earlier decision.
    pub fn upsert(&mut self, record: DecisionRecord) -> Result<()> {
        let path = self.path.clone();
        let writer = self.writer()?;
        writer
            .serialize(&record)
            .with_context(|| format!("Failed to write decision store {}", path.display()))?;
        writer
            .flush()
            .with_context(|| format!("Failed to flush decision store {}", path.display()))?;
        self.records.insert(record.id.clone(), record);
        Ok(())
    }

    /// Rewrite the file with one line per id, in first-decided order.
    pub fn compact(&mut self) -> Result<()> {
        self.writer = None;
        ensure_parent(&self.path)?;
        if self.stale && self.path.exists() {
            let backup = self.path.with_extension("csv.bak");
            fs::copy(&self.path, &backup)
                .with_context(|| format!("Failed to back up {}", self.path.display()))?;
            warn!(
                "Rewriting {}; the previous file is kept as {}",
                self.path.display(),
                backup.display()
            );
        }
        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut wtr = csv::Writer::from_path(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            if self.records.is_empty() {
                wtr.write_record(HEADER)?;
            }
            for record in self.records.values() {
                wtr.serialize(record)?;
            }
            wtr.flush()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        self.stale = false;
        Ok(())
    }

    fn writer(&mut self) -> Result<&mut csv::Writer<File>> {
        if self.stale {
            self.compact()?;
        }
        if self.writer.is_none() {
            ensure_parent(&self.path)?;
            let fresh = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("Failed to open {} for writing", self.path.display()))?;
            self.writer = Some(csv::WriterBuilder::new().has_headers(fresh).from_writer(file));
        }
        self.writer
            .as_mut()
            .context("decision store writer unavailable")
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display())),
        _ => Ok(()),
    }
}
