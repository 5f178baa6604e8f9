//! JSON/NDJSON exports to `<stem>_results.csv` or `<stem>_results.xlsx`
//! tables the rest of the pipeline reads.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use tracing::{error, info};

use crate::rows::{detect_url_column, list_with_extensions, Table, JSON_EXTENSIONS};
use crate::workbook;

const RESULTS_SUFFIX: &str = "_results";
pub const URL_HEADER: &str = "URL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum TableFormat {
    #[default]
    Csv,
    Xlsx,
}

impl TableFormat {
    fn extension(self) -> &'static str {
        match self {
            TableFormat::Csv => "csv",
            TableFormat::Xlsx => "xlsx",
        }
    }
}

#[derive(Debug, Default)]
pub struct ConvertStats {
    pub converted: usize,
    pub failed: usize,
    pub rows: usize,
}

/// Convert every JSON-like file directly inside `dir`. A bad file is logged and skipped.
pub fn convert_dir(dir: &Path, format: TableFormat) -> Result<ConvertStats> {
    let inputs = list_with_extensions(dir, JSON_EXTENSIONS)?;
    let mut stats = ConvertStats::default();
    if inputs.is_empty() {
        info!("No JSON/NDJSON files found in {}", dir.display());
        return Ok(stats);
    }
    info!("Found {} file(s) in {}", inputs.len(), dir.display());

    for path in &inputs {
        match convert_file(path, format) {
            Ok((out, rows)) => {
                stats.converted += 1;
                stats.rows += rows;
                println!(
                    "  {} -> {}  (rows: {})",
                    file_name(path),
                    file_name(&out),
                    rows
                );
            }
            Err(e) => {
                stats.failed += 1;
                error!("{}: {:#}", file_name(path), e);
            }
        }
    }
    Ok(stats)
}

pub fn convert_file(path: &Path, format: TableFormat) -> Result<(PathBuf, usize)> {
    let mut table = Table::load(path)?;
    promote_url_column(&mut table.headers);

    let out = output_path(path, format);
    match format {
        TableFormat::Csv => {
            let mut wtr = csv::Writer::from_path(&out)
                .with_context(|| format!("Failed to create {}", out.display()))?;
            wtr.write_record(&table.headers)?;
            for record in &table.records {
                wtr.write_record(record)?;
            }
            wtr.flush()?;
        }
        TableFormat::Xlsx => {
            workbook::write_sheet(&out, &table.headers, table.records.iter().cloned())?;
        }
    }
    Ok((out, table.records.len()))
}

/// Rename the detected URL column to `URL` unless one already exists.
pub fn promote_url_column(headers: &mut [String]) {
    if headers.iter().any(|h| h == URL_HEADER) {
        return;
    }
    if let Some(i) = detect_url_column(headers) {
        headers[i] = URL_HEADER.to_string();
    }
}

fn output_path(input: &Path, format: TableFormat) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = format.extension();
    let name = if stem.ends_with(RESULTS_SUFFIX) {
        format!("{}.{}", stem, ext)
    } else {
        format!("{}{}.{}", stem, RESULTS_SUFFIX, ext)
    };
    input.with_file_name(name)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rows::RowSet;
    use std::fs;

    #[test]
    fn url_column_is_promoted_once() {
        let mut h = vec!["name".to_string(), "contact.website".to_string()];
        promote_url_column(&mut h);
        assert_eq!(h, vec!["name", "URL"]);

        let mut h = vec!["URL".to_string(), "homepage".to_string()];
        promote_url_column(&mut h);
        assert_eq!(h, vec!["URL", "homepage"]);

        let mut h = vec!["name".to_string()];
        promote_url_column(&mut h);
        assert_eq!(h, vec!["name"]);
    }

    #[test]
    fn output_names() {
        assert_eq!(
            output_path(Path::new("d/Cork.json"), TableFormat::Csv),
            PathBuf::from("d/Cork_results.csv")
        );
        assert_eq!(
            output_path(Path::new("d/Cork_results.ndjson"), TableFormat::Csv),
            PathBuf::from("d/Cork_results.csv")
        );
        assert_eq!(
            output_path(Path::new("d/Cork.json"), TableFormat::Xlsx),
            PathBuf::from("d/Cork_results.xlsx")
        );
    }

    #[test]
    fn converted_tables_feed_the_row_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("Galway.json"),
            r#"{"items": [
                {"title": "Seed Library", "links": {"website": "https://seeds.ie"}, "city": "Galway"},
                {"title": "No Site", "links": {"website": null}, "city": "Galway"}
            ]}"#,
        )
        .unwrap();
        fs::write(dir.path().join("broken.jsonl"), "{\"a\":1}\nnope\n").unwrap();

        let stats = convert_dir(dir.path(), TableFormat::Csv).unwrap();
        assert_eq!(stats.converted, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.rows, 2);

        let csv_text = fs::read_to_string(dir.path().join("Galway_results.csv")).unwrap();
        assert!(csv_text.starts_with("title,URL,city\n"));

        fs::remove_file(dir.path().join("Galway.json")).unwrap();
        fs::remove_file(dir.path().join("broken.jsonl")).unwrap();
        let rows = RowSet::load_dir(dir.path()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows.without_url, 1);
        assert_eq!(rows.iter().next().unwrap().group, "Galway");
    }

    #[test]
    fn workbook_conversion_keeps_json_key_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("Louth.ndjson"),
            "{\"title\":\"Drogheda Pantry\",\"site\":\"https://pantry.ie\",\"county\":\"Louth\"}\n",
        )
        .unwrap();

        let stats = convert_dir(dir.path(), TableFormat::Xlsx).unwrap();
        assert_eq!(stats.converted, 1);

        let table = Table::load(&dir.path().join("Louth_results.xlsx")).unwrap();
        assert_eq!(table.headers, vec!["title", "URL", "county"]);
        assert_eq!(table.records[0][1], "https://pantry.ie");
    }
}
