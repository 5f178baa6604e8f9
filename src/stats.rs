use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use indexmap::IndexMap;
use rayon::prelude::*;
use serde::Serialize;
use tracing::warn;

use crate::rows::{list_tables, Table};
use crate::utils::truncate;

pub const DETAILED_FILE: &str = "entry_counts_detailed.csv";
pub const SUMMARY_FILE: &str = "entry_counts_summary.csv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileCount {
    pub folder: String,
    pub file: String,
    pub rows: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FolderCount {
    pub folder: String,
    pub total_rows: usize,
}

/// Row counts of every table directly inside each of `dirs`. Unreadable files
/// are reported and left out.
pub fn count_rows(dirs: &[impl AsRef<Path>]) -> Result<Vec<FileCount>> {
    let mut jobs = Vec::new();
    for dir in dirs {
        let dir = dir.as_ref();
        let folder = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| dir.display().to_string());
        for path in list_tables(dir)? {
            jobs.push((folder.clone(), path));
        }
    }

    let counts = jobs
        .par_iter()
        .filter_map(|(folder, path)| match Table::load(path) {
            Ok(table) => Some(FileCount {
                folder: folder.clone(),
                file: table.name,
                rows: table.records.len(),
            }),
            Err(e) => {
                warn!("Error reading {}: {:#}", path.display(), e);
                None
            }
        })
        .collect();
    Ok(counts)
}

pub fn summarise(counts: &[FileCount]) -> Vec<FolderCount> {
    let mut totals: IndexMap<&str, usize> = IndexMap::new();
    for c in counts {
        *totals.entry(c.folder.as_str()).or_default() += c.rows;
    }
    totals
        .into_iter()
        .map(|(folder, total_rows)| FolderCount {
            folder: folder.to_string(),
            total_rows,
        })
        .collect()
}

pub fn print_counts(counts: &[FileCount], summary: &[FolderCount]) {
    println!("=== Detailed (per file) ===");
    println!("{:<24} | {:<40} | {:>7}", "Folder", "File", "Rows");
    println!("{}", "-".repeat(77));
    for c in counts {
        println!(
            "{:<24} | {:<40} | {:>7}",
            truncate(&c.folder, 24),
            truncate(&c.file, 40),
            c.rows
        );
    }
    println!("\n=== Summary (per folder) ===");
    for s in summary {
        println!("{:<24} | {:>7}", truncate(&s.folder, 24), s.total_rows);
    }
    let total: usize = summary.iter().map(|s| s.total_rows).sum();
    println!("{:<24} | {:>7}", "TOTAL", total);
}

pub fn write_counts(out_dir: &Path, counts: &[FileCount], summary: &[FolderCount]) -> Result<()> {
    fs::create_dir_all(out_dir)
        .with_context(|| format!("Failed to create {}", out_dir.display()))?;
    write_csv(&out_dir.join(DETAILED_FILE), counts)?;
    write_csv(&out_dir.join(SUMMARY_FILE), summary)
}

fn write_csv<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    for row in rows {
        wtr.serialize(row)?;
    }
    wtr.flush()?;
    Ok(())
}
