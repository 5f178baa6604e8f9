//! Dataset builder: original rows joined with their Include decisions.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::{IndexMap, IndexSet};
use itertools::Itertools;
use tracing::{debug, info, warn};

use crate::config::OutputConfig;
use crate::decisions::{Decision, DecisionStore};
use crate::rows::{extension, RowId, RowSet};
use crate::workbook;

pub const DECISION_COLUMNS: &[&str] = &["decision", "confidence", "rationale"];

#[derive(Debug, Clone)]
pub struct FinalRecord {
    pub id: RowId,
    pub source: String,
    pub columns: IndexMap<String, String>,
    pub decision: Decision,
    pub confidence: Option<u8>,
    pub rationale: String,
}

#[derive(Debug)]
pub struct Dataset {
    pub headers: Vec<String>,
    pub records: Vec<FinalRecord>,
    /// Decisions whose id matches no input row.
    pub orphans: Vec<RowId>,
    source_column: String,
}

impl Dataset {
    /// Keep rows decided Include, in row-source order. Rows without a decision
    /// are left out, never defaulted.
    pub fn build(rows: &RowSet, decisions: &DecisionStore, config: &OutputConfig) -> Dataset {
        let orphans: Vec<RowId> = decisions
            .iter()
            .filter(|d| !rows.contains(&d.id))
            .map(|d| d.id.clone())
            .collect();
        if !orphans.is_empty() {
            warn!(
                "{} decision(s) refer to rows not in the current input; ignoring them",
                orphans.len()
            );
            for id in &orphans {
                debug!("orphaned decision {}", id);
            }
        }

        let records: Vec<FinalRecord> = rows
            .iter()
            .filter_map(|row| {
                let d = decisions.get(&row.id)?;
                (d.decision == Decision::Include).then(|| FinalRecord {
                    id: row.id.clone(),
                    source: row.source.clone(),
                    columns: row.columns.clone(),
                    decision: d.decision,
                    confidence: d.confidence,
                    rationale: d.rationale.clone(),
                })
            })
            .collect();

        let reserved: IndexSet<&str> = std::iter::once(config.source_column.as_str())
            .chain(DECISION_COLUMNS.iter().copied())
            .collect();
        let columns = || records.iter().flat_map(|r| r.columns.keys());
        for name in columns().filter(|c| reserved.contains(c.as_str())).unique() {
            warn!("Input column '{}' clashes with an output column and is dropped", name);
        }
        let mut headers: Vec<String> = config
            .leading_columns
            .iter()
            .chain(columns())
            .filter(|c| !reserved.contains(c.as_str()))
            .unique()
            .cloned()
            .collect();
        headers.extend(reserved.iter().map(|s| s.to_string()));

        info!(
            "{} of {} row(s) included ({} decision(s) on file)",
            records.len(),
            rows.len(),
            decisions.len()
        );
        Dataset {
            headers,
            records,
            orphans,
            source_column: config.source_column.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// One output line, aligned with `headers`.
    pub fn cells(&self, rec: &FinalRecord) -> Vec<String> {
        self.headers
            .iter()
            .map(|h| match h.as_str() {
                "decision" => rec.decision.to_string(),
                "confidence" => rec.confidence.map(|c| c.to_string()).unwrap_or_default(),
                "rationale" => rec.rationale.clone(),
                h if h == self.source_column => rec.source.clone(),
                h => rec.columns.get(h).cloned().unwrap_or_default(),
            })
            .collect()
    }

    /// `.xlsx` paths get a workbook, anything else CSV.
    pub fn write(&self, path: &Path) -> Result<()> {
        match extension(path).as_str() {
            "xlsx" => self.write_xlsx(path),
            _ => self.write_csv(path),
        }
    }

    /// Always writes the header, even with no records.
    pub fn write_csv(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let mut wtr = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        wtr.write_record(&self.headers)?;
        for rec in &self.records {
            wtr.write_record(self.cells(rec))?;
        }
        wtr.flush()?;
        info!("Wrote {} row(s) to {}", self.records.len(), path.display());
        Ok(())
    }

    pub fn write_xlsx(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let n = workbook::write_sheet(
            path,
            &self.headers,
            self.records.iter().map(|rec| self.cells(rec)),
        )?;
        info!("Wrote {} row(s) to {}", n, path.display());
        Ok(())
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        ensure_parent(path)?;
        let objects: Vec<IndexMap<&str, String>> = self
            .records
            .iter()
            .map(|rec| {
                self.headers
                    .iter()
                    .map(String::as_str)
                    .zip(self.cells(rec))
                    .collect()
            })
            .collect();
        let json = serde_json::to_string_pretty(&objects)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Wrote {} row(s) to {}", self.records.len(), path.display());
        Ok(())
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display())),
        _ => Ok(()),
    }
}
