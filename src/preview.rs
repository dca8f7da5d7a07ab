//! Tabular preview of an uploaded workbook.
//!
//! Shows the first non-empty sheet the way a dataframe viewer would: a
//! header row, then up to `max_rows` data rows, column widths capped at
//! `max_col_width` characters.

use anyhow::Result;
use serde::Serialize;

use crate::config::PreviewConfig;
use crate::extract::{read_workbook, SheetTable};

#[derive(Debug, Clone, Serialize)]
pub struct Preview {
    pub sheet_name: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
    /// Data rows in the sheet, before truncation.
    pub total_rows: usize,
    /// Sheets in the workbook, including the previewed one.
    pub sheet_count: usize,
}

impl Preview {
    pub fn from_bytes(bytes: &[u8], config: &PreviewConfig) -> Result<Self> {
        let tables = read_workbook(bytes)?;
        let sheet_count = tables.len();
        let first = tables
            .iter()
            .find(|t| !t.is_empty())
            .ok_or_else(|| anyhow::anyhow!("workbook has no data to preview"))?;
        Ok(Self::from_table(first, sheet_count, config.max_rows))
    }

    pub fn from_table(table: &SheetTable, sheet_count: usize, max_rows: usize) -> Self {
        let width = table.column_count();
        let (columns, body) = match table.header_and_body() {
            Some((header, body)) => {
                let columns: Vec<String> = (0..width)
                    .map(|i| match header.get(i).map(|h| h.trim()) {
                        Some(h) if !h.is_empty() => h.to_string(),
                        _ => format!("Column {}", i + 1),
                    })
                    .collect();
                (columns, body)
            }
            None => (Vec::new(), &[][..]),
        };
        let rows: Vec<Vec<String>> = body
            .iter()
            .take(max_rows)
            .map(|r| (0..width).map(|i| r.get(i).cloned().unwrap_or_default()).collect())
            .collect();
        Self {
            sheet_name: table.name.clone(),
            columns,
            rows,
            total_rows: body.len(),
            sheet_count,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.rows.len() < self.total_rows
    }

    /// Render as a fixed-width text table.
    pub fn render_text(&self, max_col_width: usize) -> String {
        let max_col_width = max_col_width.max(3);
        let mut widths: Vec<usize> = self.columns.iter().map(|c| c.chars().count()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.chars().count());
            }
        }
        for w in widths.iter_mut() {
            *w = (*w).min(max_col_width);
        }

        let mut out = format!("Sheet: {}\n", self.sheet_name);
        out.push_str(&format_line(&self.columns, &widths));
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        out.push_str(&format_line(&rule, &widths));
        for row in &self.rows {
            out.push_str(&format_line(row, &widths));
        }
        if self.is_truncated() {
            out.push_str(&format!(
                "... {} more rows\n",
                self.total_rows - self.rows.len()
            ));
        }
        if self.sheet_count > 1 {
            out.push_str(&format!("({} sheets in workbook)\n", self.sheet_count));
        }
        out
    }
}

fn format_line(cells: &[String], widths: &[usize]) -> String {
    let parts: Vec<String> = cells
        .iter()
        .zip(widths)
        .map(|(cell, w)| format!("{:<width$}", fit(cell, *w), width = *w))
        .collect();
    format!("{}\n", parts.join("  ").trim_end())
}

fn fit(cell: &str, width: usize) -> String {
    let cell = cell.replace(['\r', '\n'], " ");
    if cell.chars().count() <= width {
        return cell;
    }
    let mut out: String = cell.chars().take(width.saturating_sub(1)).collect();
    out.push('…');
    out
}
