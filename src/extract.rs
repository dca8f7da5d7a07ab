//! Spreadsheet extraction into normalized Markdown documents.
//!
//! Workbooks are read with `calamine`, which handles both OOXML (`.xlsx`)
//! and legacy BIFF (`.xls`). Every non-empty worksheet becomes one
//! [`SheetDocument`] whose body is a Markdown section:
//!
//! ```text
//! # Sheet: Q3
//!
//! | Region | Revenue |
//! | --- | --- |
//! | North | 1200 |
//! ```
//!
//! The first non-empty row is treated as the header row.

use std::io::Cursor;
use std::path::Path;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use calamine::{Data, Reader};
use uuid::Uuid;

use crate::models::{FileKind, SheetDocument};

/// Maximum sheets to process in a workbook.
const MAX_SHEETS: usize = 100;
/// Maximum cells to process per sheet (avoids unbounded memory).
const MAX_CELLS_PER_SHEET: usize = 100_000;

/// Turns a spreadsheet on disk into normalized documents.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    async fn extract(&self, path: &Path, kind: FileKind) -> Result<Vec<SheetDocument>>;
}

/// Default extractor backed by `calamine`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpreadsheetExtractor;

#[async_trait]
impl DocumentExtractor for SpreadsheetExtractor {
    async fn extract(&self, path: &Path, kind: FileKind) -> Result<Vec<SheetDocument>> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let source_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("upload.{}", kind.extension()));

        let sheets = tokio::task::spawn_blocking(move || read_workbook(&bytes)).await??;

        let docs: Vec<SheetDocument> = sheets
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.into_document(&source_name))
            .collect();

        if docs.is_empty() {
            bail!("workbook contains no non-empty sheets");
        }
        Ok(docs)
    }
}

/// Cell text of one worksheet, trailing blank rows removed.
#[derive(Debug, Clone)]
pub struct SheetTable {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

impl SheetTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_count(&self) -> usize {
        self.rows.iter().map(|r| r.len()).max().unwrap_or(0)
    }

    /// Header row plus data rows, skipping leading blank rows.
    pub fn header_and_body(&self) -> Option<(&[String], &[Vec<String>])> {
        let start = self.rows.iter().position(|r| !row_is_blank(r))?;
        Some((&self.rows[start], &self.rows[start + 1..]))
    }

    /// Render the sheet as a Markdown section.
    pub fn to_markdown(&self) -> String {
        let mut out = format!("# Sheet: {}\n\n", self.name);
        let Some((header, body)) = self.header_and_body() else {
            return out;
        };
        let width = self.column_count();

        let header_cells: Vec<String> = (0..width)
            .map(|i| match header.get(i).map(|s| s.trim()) {
                Some(h) if !h.is_empty() => escape_cell(h),
                _ => format!("Column {}", i + 1),
            })
            .collect();
        out.push_str(&table_row(&header_cells));
        out.push_str(&table_row(&vec!["---".to_string(); width]));

        for row in body.iter().filter(|r| !row_is_blank(r)) {
            let cells: Vec<String> = (0..width)
                .map(|i| row.get(i).map(|c| escape_cell(c)).unwrap_or_default())
                .collect();
            out.push_str(&table_row(&cells));
        }
        out
    }

    fn into_document(self, source_name: &str) -> SheetDocument {
        let body = self.to_markdown();
        let data_rows = self
            .header_and_body()
            .map(|(_, b)| b.iter().filter(|r| !row_is_blank(r)).count())
            .unwrap_or(0);
        SheetDocument {
            id: Uuid::new_v4().to_string(),
            source_name: source_name.to_string(),
            columns: self.column_count(),
            rows: data_rows,
            sheet_name: self.name,
            body,
        }
    }
}

fn row_is_blank(row: &[String]) -> bool {
    row.iter().all(|c| c.trim().is_empty())
}

fn table_row(cells: &[String]) -> String {
    format!("| {} |\n", cells.join(" | "))
}

fn escape_cell(s: &str) -> String {
    s.trim().replace('|', "\\|").replace(['\r', '\n'], " ")
}

/// Parse workbook bytes into per-sheet cell text.
pub fn read_workbook(bytes: &[u8]) -> Result<Vec<SheetTable>> {
    let mut workbook = calamine::open_workbook_auto_from_rs(Cursor::new(bytes))
        .map_err(|e| anyhow::anyhow!("not a readable spreadsheet: {}", e))?;

    let mut tables = Vec::new();
    for name in workbook.sheet_names().into_iter().take(MAX_SHEETS) {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| anyhow::anyhow!("sheet '{}': {}", name, e))?;

        let mut rows: Vec<Vec<String>> = Vec::new();
        let mut cell_count = 0usize;
        for row in range.rows() {
            if cell_count >= MAX_CELLS_PER_SHEET {
                break;
            }
            cell_count += row.len();
            rows.push(row.iter().map(cell_text).collect());
        }
        while rows.last().is_some_and(|r| row_is_blank(r)) {
            rows.pop();
        }
        tables.push(SheetTable { name, rows });
    }
    Ok(tables)
}

fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => f.to_string(),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => b.to_string(),
        Data::DateTime(dt) => dt.to_string(),
        Data::DateTimeIso(s) | Data::DurationIso(s) => s.clone(),
        Data::Error(e) => format!("#{:?}", e),
    }
}
