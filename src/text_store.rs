//! On-disk text store: `<root>/<group>/<row id>.txt`, plus one
//! `scrape_summary.csv` per group describing each fetch.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::rows::RowId;

pub const SUMMARY_FILE: &str = "scrape_summary.csv";

/// One line of `scrape_summary.csv`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryRow {
    pub row: usize,
    pub url: String,
    pub final_url: Option<String>,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub title: Option<String>,
    pub text_file: Option<String>,
    #[serde(default)]
    pub scraped_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchStatus {
    Available,
    Empty,
    Failed(String),
    /// Never scraped.
    Missing,
}

#[derive(Debug, Clone)]
pub struct ScrapedText {
    pub id: RowId,
    pub content: String,
    pub status: FetchStatus,
}

impl ScrapedText {
    pub fn is_available(&self) -> bool {
        self.status == FetchStatus::Available
    }
}

pub struct TextStore {
    root: PathBuf,
    files: HashMap<RowId, PathBuf>,
    failures: HashMap<RowId, String>,
}

impl TextStore {
    /// Index every `.txt` file and summary under `root`. A missing root is an empty store.
    pub fn open(root: &Path) -> Result<TextStore> {
        let mut store = TextStore {
            root: root.to_path_buf(),
            files: HashMap::new(),
            failures: HashMap::new(),
        };
        if !root.exists() {
            warn!("Text store {} does not exist yet", root.display());
            return Ok(store);
        }

        let mut summaries = Vec::new();
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let path = entry.path();
            if !entry.file_type().is_file() {
                continue;
            }
            if path.file_name().is_some_and(|n| n == SUMMARY_FILE) {
                summaries.push(path.to_path_buf());
            } else if path.extension().is_some_and(|e| e == "txt") {
                if let Some(stem) = path.file_stem() {
                    let id = RowId::new(stem.to_string_lossy());
                    if store.files.insert(id.clone(), path.to_path_buf()).is_some() {
                        debug!("{} stored twice; using {}", id, path.display());
                    }
                }
            }
        }

        for summary in summaries {
            for row in read_summary(&summary)? {
                let Some(err) = row.error.filter(|e| !e.trim().is_empty()) else {
                    continue;
                };
                store.failures.insert(RowId::from_url(&row.url), err);
            }
        }

        debug!(
            "Text store {}: {} text file(s), {} recorded failure(s)",
            root.display(),
            store.files.len(),
            store.failures.len()
        );
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(root: &Path, group: &str, id: &RowId) -> PathBuf {
        root.join(group).join(format!("{}.txt", id))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn lookup(&self, id: &RowId) -> Result<ScrapedText> {
        let Some(path) = self.files.get(id) else {
            let status = match self.failures.get(id) {
                Some(err) => FetchStatus::Failed(err.clone()),
                None => FetchStatus::Missing,
            };
            return Ok(ScrapedText {
                id: id.clone(),
                content: String::new(),
                status,
            });
        };

        let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let content = String::from_utf8_lossy(&bytes).trim().to_string();
        let status = if content.is_empty() {
            FetchStatus::Empty
        } else {
            FetchStatus::Available
        };
        Ok(ScrapedText {
            id: id.clone(),
            content,
            status,
        })
    }
}

pub fn read_summary(path: &Path) -> Result<Vec<SummaryRow>> {
    let mut rdr =
        csv::Reader::from_path(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for (i, result) in rdr.deserialize::<SummaryRow>().enumerate() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => warn!("{}: skipping line {}: {}", path.display(), i + 2, e),
        }
    }
    Ok(rows)
}

pub fn write_summary(path: &Path, rows: &[SummaryRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_reports_each_status() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let ok = RowId::from_url("https://bank.ie");
        let blank = RowId::from_url("https://blank.ie");
        let failed = RowId::from_url("https://down.ie");
        let never = RowId::from_url("https://never.ie");

        fs::create_dir_all(root.join("Dublin")).unwrap();
        fs::write(TextStore::path_for(root, "Dublin", &ok), "  Food bank open daily \n").unwrap();
        fs::write(TextStore::path_for(root, "Dublin", &blank), "\n\n  ").unwrap();
        write_summary(
            &root.join("Dublin").join(SUMMARY_FILE),
            &[SummaryRow {
                row: 2,
                url: "https://down.ie".into(),
                final_url: None,
                status: None,
                error: Some("connection refused".into()),
                title: None,
                text_file: None,
                scraped_at: None,
            }],
        )
        .unwrap();

        let store = TextStore::open(root).unwrap();
        assert_eq!(store.len(), 2);

        let t = store.lookup(&ok).unwrap();
        assert!(t.is_available());
        assert_eq!(t.content, "Food bank open daily");
        assert_eq!(store.lookup(&blank).unwrap().status, FetchStatus::Empty);
        assert_eq!(
            store.lookup(&failed).unwrap().status,
            FetchStatus::Failed("connection refused".into())
        );
        assert_eq!(store.lookup(&never).unwrap().status, FetchStatus::Missing);
    }

    #[test]
    fn missing_root_is_empty() {
        let store = TextStore::open(Path::new("/nonexistent/scraped")).unwrap();
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn summary_without_timestamp_column_still_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SUMMARY_FILE);
        fs::write(
            &path,
            "row,url,final_url,status,error,title,text_file\n0,https://a.ie,https://a.ie/,200,,A,/t/a.txt\n",
        )
        .unwrap();
        let rows = read_summary(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, Some(200));
        assert!(rows[0].error.is_none());
    }
}
