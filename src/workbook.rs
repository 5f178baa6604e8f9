//! Excel workbooks in and out. Only the first worksheet is read; every cell
//! becomes a string like the CSV loader produces.

use std::path::Path;

use anyhow::{Context, Result};
use calamine::{open_workbook_auto, Data, Reader};
use rust_xlsxwriter::{Format, Workbook};

use crate::rows::normalize_header;

const SHEET_NAME: &str = "Sheet1";

pub fn read_first_sheet(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut wb = open_workbook_auto(path)
        .with_context(|| format!("Failed to open workbook {}", path.display()))?;
    let range = wb
        .worksheet_range_at(0)
        .with_context(|| format!("{} has no worksheets", path.display()))??;

    let mut rows = range.rows();
    let Some(first) = rows.next() else {
        return Ok((Vec::new(), Vec::new()));
    };
    let headers: Vec<String> = first.iter().map(|c| normalize_header(&cell_text(c))).collect();
    let records = rows
        .map(|r| {
            let mut cells: Vec<String> = r.iter().map(cell_text).collect();
            cells.resize(headers.len(), String::new());
            cells
        })
        .collect();
    Ok((headers, records))
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// One worksheet with a bold header row. Cells are written as text.
pub fn write_sheet(
    path: &Path,
    headers: &[String],
    records: impl IntoIterator<Item = Vec<String>>,
) -> Result<usize> {
    let mut workbook = Workbook::new();
    let bold = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(SHEET_NAME)?;

    for (c, h) in headers.iter().enumerate() {
        sheet.write_string_with_format(0, u16::try_from(c)?, h, &bold)?;
    }
    let mut written = 0usize;
    for (r, record) in records.into_iter().enumerate() {
        let row = u32::try_from(r + 1)?;
        for (c, value) in record.iter().enumerate() {
            if !value.is_empty() {
                sheet.write_string(row, u16::try_from(c)?, value)?;
            }
        }
        written += 1;
    }

    workbook
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(written)
}
