//! Row source: input tables and the de-duplicated row set.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use crate::workbook;

pub const TABLE_EXTENSIONS: &[&str] = &["xlsx", "xls", "csv", "json", "jsonl", "ndjson"];
pub const JSON_EXTENSIONS: &[&str] = &["json", "jsonl", "ndjson"];

const URL_COLUMNS: &[&str] = &["url", "website", "link", "web", "homepage", "page_url"];
const URL_HINTS: &[&str] = &["url", "site", "web", "link"];
const NAME_COLUMNS: &[&str] = &[
    "name",
    "organisation",
    "organization",
    "organisation name",
    "organization name",
];
const WRAPPER_KEYS: &[&str] = &["data", "rows", "items", "results", "records"];

/// Stable row key: `<host>__<sha1(url)[..10]>`, the same key earlier runs used
/// for text files and results tables.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RowId(String);

impl RowId {
    pub fn new(id: impl Into<String>) -> Self {
        RowId(id.into().trim().to_string())
    }

    pub fn from_url(url: &str) -> Self {
        let host = url::Url::parse(url)
            .ok()
            .map(|u| {
                let mut host = u.host_str().unwrap_or_default().replace([':', '[', ']'], "_");
                if let Some(port) = u.port() {
                    host.push('_');
                    host.push_str(&port.to_string());
                }
                host
            })
            .unwrap_or_default();
        let hash = format!("{:x}", Sha1::digest(url.as_bytes()));
        RowId(format!("{}__{}", host, &hash[..10]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One input file, all cells as strings.
#[derive(Debug, Clone)]
pub struct Table {
    /// File name, e.g. `Dublin_results.csv`.
    pub name: String,
    pub stem: String,
    pub headers: Vec<String>,
    pub records: Vec<Vec<String>>,
}

impl Table {
    pub fn load(path: &Path) -> Result<Table> {
        let ext = extension(path);
        let (headers, records) = match ext.as_str() {
            "csv" => load_csv(path)?,
            "xlsx" | "xls" => workbook::read_first_sheet(path)?,
            e if JSON_EXTENSIONS.contains(&e) => load_json(path)?,
            _ => bail!("Unsupported table type: {}", path.display()),
        };
        Ok(Table {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            stem: path
                .file_stem()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            headers,
            records,
        })
    }

    /// Text store sub-directory for this table (`Dublin_results` -> `Dublin`).
    pub fn group(&self) -> String {
        self.stem.replace("_results", "")
    }

    pub fn url_column(&self) -> Option<usize> {
        detect_url_column(&self.headers)
    }

    /// Rows that carry an http(s) URL, plus the number of rows without one.
    pub fn rows(&self) -> (Vec<Row>, usize) {
        let Some(url_col) = self.url_column() else {
            warn!("No URL-like column in {}", self.name);
            return (Vec::new(), self.records.len());
        };
        let name_col = detect_name_column(&self.headers);
        let group = self.group();

        let mut rows = Vec::with_capacity(self.records.len());
        let mut skipped = 0;
        for (index, record) in self.records.iter().enumerate() {
            let url = record.get(url_col).map(|v| v.trim()).unwrap_or_default();
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                skipped += 1;
                continue;
            }
            let columns: IndexMap<String, String> = self
                .headers
                .iter()
                .cloned()
                .zip(record.iter().cloned())
                .collect();
            rows.push(Row {
                id: RowId::from_url(url),
                source: self.name.clone(),
                group: group.clone(),
                index,
                name: name_col
                    .and_then(|c| record.get(c))
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty()),
                url: url.to_string(),
                columns,
            });
        }
        (rows, skipped)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: RowId,
    pub source: String,
    pub group: String,
    /// 0-based data row index within `source`.
    pub index: usize,
    pub name: Option<String>,
    pub url: String,
    pub columns: IndexMap<String, String>,
}

/// Rows from every input table, de-duplicated by id (first seen wins).
#[derive(Debug, Default)]
pub struct RowSet {
    rows: Vec<Row>,
    index: HashMap<RowId, usize>,
    pub without_url: usize,
    pub duplicates: usize,
}

impl RowSet {
    pub fn load_dir(dir: &Path) -> Result<RowSet> {
        Ok(Self::from_tables(load_tables(dir)?))
    }

    pub fn from_tables(tables: impl IntoIterator<Item = Table>) -> RowSet {
        let mut set = RowSet::default();
        for table in tables {
            let (rows, skipped) = table.rows();
            debug!(
                "{}: {} row(s) with URL, {} without",
                table.name,
                rows.len(),
                skipped
            );
            set.without_url += skipped;
            for row in rows {
                set.push(row);
            }
        }
        set
    }

    /// Returns false when the id was already present; the earlier row is kept.
    pub fn push(&mut self, row: Row) -> bool {
        if let Some(&pos) = self.index.get(&row.id) {
            self.duplicates += 1;
            let kept = &self.rows[pos];
            let conflicts: Vec<&str> = kept
                .columns
                .iter()
                .filter(|(k, v)| {
                    row.columns
                        .get(*k)
                        .is_some_and(|other| !other.is_empty() && !v.is_empty() && other != *v)
                })
                .map(|(k, _)| k.as_str())
                .collect();
            if conflicts.is_empty() {
                debug!("Duplicate row {} in {} ignored", row.id, row.source);
            } else {
                warn!(
                    "Duplicate row {} ({} row {}) conflicts with {} row {} on [{}]; keeping the first",
                    row.id,
                    row.source,
                    row.index,
                    kept.source,
                    kept.index,
                    conflicts.join(", ")
                );
            }
            return false;
        }
        self.index.insert(row.id.clone(), self.rows.len());
        self.rows.push(row);
        true
    }

    pub fn contains(&self, id: &RowId) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Row> {
        self.rows.iter()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Every table directly inside `dir`, in file name order. Any unreadable table is fatal.
pub fn load_tables(dir: &Path) -> Result<Vec<Table>> {
    let files = list_tables(dir)?;
    info!("Found {} input table(s) in {}", files.len(), dir.display());
    files
        .iter()
        .map(|path| Table::load(path).with_context(|| format!("Failed to read {}", path.display())))
        .collect()
}

/// Table files directly inside `dir`, sorted by name.
pub fn list_tables(dir: &Path) -> Result<Vec<PathBuf>> {
    list_with_extensions(dir, TABLE_EXTENSIONS)
}

pub fn list_with_extensions(dir: &Path, extensions: &[&str]) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && extensions.contains(&extension(p).as_str()))
        .filter(|p| !is_lock_file(p))
        .collect();
    files.sort();
    Ok(files)
}

/// Office leaves `~$name.xlsx` next to open workbooks.
fn is_lock_file(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().starts_with("~$"))
}

pub fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

pub fn normalize_header(h: &str) -> String {
    h.trim().replace(['\n', '\r'], " ")
}

/// Exact (case-insensitive) match against known URL column names first,
/// then any header mentioning url/site/web/link.
pub fn detect_url_column(headers: &[String]) -> Option<usize> {
    let lower: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
    URL_COLUMNS
        .iter()
        .find_map(|cand| lower.iter().position(|h| h == cand))
        .or_else(|| {
            lower
                .iter()
                .position(|h| URL_HINTS.iter().any(|hint| h.contains(hint)))
        })
}

fn detect_name_column(headers: &[String]) -> Option<usize> {
    let lower: Vec<String> = headers.iter().map(|h| h.trim().to_lowercase()).collect();
    NAME_COLUMNS
        .iter()
        .find_map(|cand| lower.iter().position(|h| h == cand))
}

fn load_csv(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut rdr = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = rdr.headers()?.iter().map(normalize_header).collect();
    let mut records = Vec::new();
    for result in rdr.records() {
        let record = result?;
        let mut cells: Vec<String> = record.iter().map(str::to_string).collect();
        cells.resize(headers.len(), String::new());
        records.push(cells);
    }
    Ok((headers, records))
}

fn load_json(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let raw = fs::read_to_string(path)?;
    let values = parse_json_records(&raw)?;

    let flat: Vec<IndexMap<String, String>> = values
        .into_iter()
        .map(|v| {
            let mut out = IndexMap::new();
            match v {
                Value::Object(_) => flatten_json(&v, "", &mut out),
                other => {
                    out.insert("_value".to_string(), scalar_to_string(&other));
                }
            }
            out
        })
        .collect();

    let headers: IndexSet<String> = flat.iter().flat_map(|r| r.keys().cloned()).collect();
    let headers: Vec<String> = headers.into_iter().collect();
    let records = flat
        .iter()
        .map(|r| {
            headers
                .iter()
                .map(|h| r.get(h).cloned().unwrap_or_default())
                .collect()
        })
        .collect();
    Ok((headers, records))
}

/// A JSON document (array, wrapped array or single object) or NDJSON lines.
pub fn parse_json_records(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Array(items)) => Ok(items),
        Ok(Value::Object(obj)) => {
            for key in WRAPPER_KEYS {
                if let Some(Value::Array(items)) = obj.get(*key) {
                    return Ok(items.clone());
                }
            }
            Ok(vec![Value::Object(obj)])
        }
        Ok(other) => Ok(vec![other]),
        Err(_) => raw
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .enumerate()
            .map(|(i, line)| {
                serde_json::from_str(line).with_context(|| format!("Invalid JSON on line {}", i + 1))
            })
            .collect(),
    }
}

/// Nested objects become `parent.child` columns; arrays stay as JSON text.
pub fn flatten_json(value: &Value, prefix: &str, out: &mut IndexMap<String, String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                let key = if prefix.is_empty() {
                    normalize_header(k)
                } else {
                    format!("{}.{}", prefix, normalize_header(k))
                };
                flatten_json(v, &key, out);
            }
        }
        other => {
            out.insert(prefix.to_string(), scalar_to_string(other));
        }
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(_) | Value::Number(_) => v.to_string(),
        Value::Array(_) | Value::Object(_) => v.to_string(),
    }
}
