//! Structure-aware Markdown chunker.
//!
//! Splits the Markdown body of each [`SheetDocument`] into [`Chunk`]s that
//! respect a configurable `max_tokens` limit. Splitting happens at heading
//! boundaries first, then at blank-line blocks. Tables are never cut inside
//! a row: an oversized table is split between rows and every piece repeats
//! the header row and its `---` separator, so each chunk is a readable
//! table on its own. Continuation chunks repeat the section heading.
//!
//! Each chunk receives a UUID plus a SHA-256 hash of its text.

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::{Chunk, SheetDocument};

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Splits normalized documents into retrieval units.
pub trait Chunker: Send + Sync {
    fn chunk(&self, docs: &[SheetDocument]) -> Vec<Chunk>;
}

#[derive(Debug, Clone, Copy)]
pub struct MarkdownChunker {
    pub max_tokens: usize,
}

impl MarkdownChunker {
    pub fn new(max_tokens: usize) -> Self {
        Self { max_tokens }
    }
}

impl Chunker for MarkdownChunker {
    fn chunk(&self, docs: &[SheetDocument]) -> Vec<Chunk> {
        docs.iter()
            .flat_map(|d| chunk_markdown(&d.id, &d.body, self.max_tokens))
            .collect()
    }
}

enum Block<'a> {
    Text(Vec<&'a str>),
    Table(Vec<&'a str>),
}

struct Section<'a> {
    heading: Option<&'a str>,
    blocks: Vec<Block<'a>>,
}

/// Split Markdown text into chunks, respecting max_tokens.
/// Returns chunks with contiguous indices starting at 0.
pub fn chunk_markdown(document_id: &str, text: &str, max_tokens: usize) -> Vec<Chunk> {
    let max_chars = max_tokens.max(1) * CHARS_PER_TOKEN;

    let mut pieces: Vec<String> = Vec::new();
    for section in split_sections(text) {
        pieces.extend(pack_section(&section, max_chars));
    }

    // Guarantee at least one chunk
    if pieces.is_empty() {
        pieces.push(text.trim().to_string());
    }

    pieces
        .iter()
        .enumerate()
        .map(|(i, p)| make_chunk(document_id, i as i64, p))
        .collect()
}

fn is_table_line(line: &str) -> bool {
    line.trim_start().starts_with('|')
}

fn is_separator_row(line: &str) -> bool {
    let t = line.trim();
    t.starts_with('|') && t.contains('-') && t.chars().all(|c| matches!(c, '|' | '-' | ':' | ' '))
}

fn split_sections(text: &str) -> Vec<Section<'_>> {
    let mut sections = vec![Section {
        heading: None,
        blocks: Vec::new(),
    }];
    let mut current: Option<Block<'_>> = None;

    fn close<'a>(current: &mut Option<Block<'a>>, sections: &mut [Section<'a>]) {
        if let Some(block) = current.take() {
            if let Some(section) = sections.last_mut() {
                section.blocks.push(block);
            }
        }
    }

    for line in text.lines() {
        if line.trim().is_empty() {
            close(&mut current, &mut sections);
            continue;
        }
        if line.trim_start().starts_with('#') {
            close(&mut current, &mut sections);
            sections.push(Section {
                heading: Some(line.trim()),
                blocks: Vec::new(),
            });
            continue;
        }
        let table = is_table_line(line);
        let extended = match (&mut current, table) {
            (Some(Block::Table(lines)), true) | (Some(Block::Text(lines)), false) => {
                lines.push(line);
                true
            }
            _ => false,
        };
        if !extended {
            close(&mut current, &mut sections);
            current = Some(if table {
                Block::Table(vec![line])
            } else {
                Block::Text(vec![line])
            });
        }
    }
    close(&mut current, &mut sections);

    sections
        .into_iter()
        .filter(|s| s.heading.is_some() || !s.blocks.is_empty())
        .collect()
}

fn pack_section(section: &Section<'_>, max_chars: usize) -> Vec<String> {
    let prefix = section
        .heading
        .map(|h| format!("{}\n\n", h))
        .unwrap_or_default();
    let budget = max_chars.saturating_sub(prefix.len()).max(1);

    let mut out = Vec::new();
    let mut buf = String::new();

    for block in &section.blocks {
        let units = match block {
            Block::Text(lines) => split_text(&lines.join("\n"), budget),
            Block::Table(lines) => split_table(lines, budget),
        };
        for unit in units {
            // If adding this unit would exceed max, flush current buffer
            let would_be = if buf.is_empty() {
                unit.len()
            } else {
                buf.len() + 2 + unit.len()
            };
            if would_be > budget && !buf.is_empty() {
                out.push(format!("{}{}", prefix, buf));
                buf.clear();
            }
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(&unit);
        }
    }

    if !buf.is_empty() {
        out.push(format!("{}{}", prefix, buf));
    }
    if out.is_empty() {
        if let Some(h) = section.heading {
            out.push(h.to_string());
        }
    }
    out
}

/// Hard-split prose that exceeds the budget, preferring newline then space.
fn split_text(text: &str, budget: usize) -> Vec<String> {
    if text.len() <= budget {
        return vec![text.to_string()];
    }
    let mut pieces = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        let mut split_at = remaining.len().min(budget);
        while !remaining.is_char_boundary(split_at) {
            split_at -= 1;
        }
        if split_at == 0 {
            split_at = remaining
                .char_indices()
                .nth(1)
                .map(|(i, _)| i)
                .unwrap_or(remaining.len());
        }
        let actual_split = if split_at < remaining.len() {
            remaining[..split_at]
                .rfind('\n')
                .or_else(|| remaining[..split_at].rfind(' '))
                .filter(|pos| *pos > 0)
                .map(|pos| pos + 1)
                .unwrap_or(split_at)
        } else {
            split_at
        };
        let piece = remaining[..actual_split].trim();
        if !piece.is_empty() {
            pieces.push(piece.to_string());
        }
        remaining = &remaining[actual_split..];
    }
    pieces
}

/// Split a table between rows, repeating the header in each piece.
fn split_table(lines: &[&str], budget: usize) -> Vec<String> {
    let whole = lines.join("\n");
    if whole.len() <= budget {
        return vec![whole];
    }

    let header_len = if lines.len() > 1 && is_separator_row(lines[1]) {
        2
    } else {
        1
    };
    let header = lines[..header_len.min(lines.len())].join("\n");
    let rows = &lines[header_len.min(lines.len())..];
    if rows.is_empty() {
        return vec![whole];
    }

    let mut pieces = Vec::new();
    let mut buf = header.clone();
    let mut has_rows = false;
    for row in rows {
        if has_rows && buf.len() + 1 + row.len() > budget {
            pieces.push(std::mem::replace(&mut buf, header.clone()));
            has_rows = false;
        }
        buf.push('\n');
        buf.push_str(row);
        has_rows = true;
    }
    if has_rows {
        pieces.push(buf);
    }
    pieces
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
