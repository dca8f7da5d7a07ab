//! Shared fixtures for integration tests: in-memory workbooks and stub
//! collaborators that count their calls.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;

use sheetqa::config::Config;
use sheetqa::embedding::Embedder;
use sheetqa::extract::{DocumentExtractor, SpreadsheetExtractor};
use sheetqa::generation::{FragmentStream, Generator};
use sheetqa::ingest::Services;
use sheetqa::models::{FileKind, SheetDocument};

// ============ Workbook fixtures ============

fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

fn column_letter(i: usize) -> char {
    (b'A' + i as u8) as char
}

/// Build a minimal `.xlsx` workbook. Cells that parse as numbers are
/// written as numeric cells, everything else as shared strings.
pub fn xlsx(sheets: &[(&str, &[&[&str]])]) -> Vec<u8> {
    let mut strings: Vec<String> = Vec::new();
    let mut sheet_xml = Vec::new();

    for (_, rows) in sheets {
        let mut data = String::new();
        for (r, row) in rows.iter().enumerate() {
            data.push_str(&format!("<row r=\"{}\">", r + 1));
            for (c, value) in row.iter().enumerate() {
                let cell_ref = format!("{}{}", column_letter(c), r + 1);
                if value.parse::<f64>().is_ok() {
                    data.push_str(&format!("<c r=\"{}\"><v>{}</v></c>", cell_ref, value));
                } else {
                    let idx = strings.len();
                    strings.push(escape_xml(value));
                    data.push_str(&format!("<c r=\"{}\" t=\"s\"><v>{}</v></c>", cell_ref, idx));
                }
            }
            data.push_str("</row>");
        }
        sheet_xml.push(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <worksheet xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\">\
             <sheetData>{}</sheetData></worksheet>",
            data
        ));
    }

    let mut content_types = String::from(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <Types xmlns=\"http://schemas.openxmlformats.org/package/2006/content-types\">\
         <Default Extension=\"rels\" ContentType=\"application/vnd.openxmlformats-package.relationships+xml\"/>\
         <Default Extension=\"xml\" ContentType=\"application/xml\"/>\
         <Override PartName=\"/xl/workbook.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml\"/>\
         <Override PartName=\"/xl/sharedStrings.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml\"/>",
    );
    let mut sheet_entries = String::new();
    let mut rels = String::new();
    for (i, (name, _)) in sheets.iter().enumerate() {
        content_types.push_str(&format!(
            "<Override PartName=\"/xl/worksheets/sheet{}.xml\" ContentType=\"application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml\"/>",
            i + 1
        ));
        sheet_entries.push_str(&format!(
            "<sheet name=\"{}\" sheetId=\"{}\" r:id=\"rId{}\"/>",
            escape_xml(name),
            i + 1,
            i + 1
        ));
        rels.push_str(&format!(
            "<Relationship Id=\"rId{}\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet\" Target=\"worksheets/sheet{}.xml\"/>",
            i + 1,
            i + 1
        ));
    }
    content_types.push_str("</Types>");
    rels.push_str(&format!(
        "<Relationship Id=\"rId{}\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings\" Target=\"sharedStrings.xml\"/>",
        sheets.len() + 1
    ));

    let workbook = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <workbook xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" \
         xmlns:r=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships\">\
         <sheets>{}</sheets></workbook>",
        sheet_entries
    );
    let workbook_rels = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">{}</Relationships>",
        rels
    );
    let root_rels = "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <Relationships xmlns=\"http://schemas.openxmlformats.org/package/2006/relationships\">\
         <Relationship Id=\"rId1\" Type=\"http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument\" Target=\"xl/workbook.xml\"/>\
         </Relationships>";
    let shared = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
         <sst xmlns=\"http://schemas.openxmlformats.org/spreadsheetml/2006/main\" count=\"{n}\" uniqueCount=\"{n}\">{}</sst>",
        strings
            .iter()
            .map(|s| format!("<si><t>{}</t></si>", s))
            .collect::<String>(),
        n = strings.len()
    );

    let mut buf = Vec::new();
    {
        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
        let opts = zip::write::SimpleFileOptions::default();
        let mut add = |path: &str, body: &str| {
            zip.start_file(path, opts).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        };
        add("[Content_Types].xml", &content_types);
        add("_rels/.rels", root_rels);
        add("xl/workbook.xml", &workbook);
        add("xl/_rels/workbook.xml.rels", &workbook_rels);
        add("xl/sharedStrings.xml", &shared);
        for (i, xml) in sheet_xml.iter().enumerate() {
            add(&format!("xl/worksheets/sheet{}.xml", i + 1), xml);
        }
        zip.finish().unwrap();
    }
    buf
}

/// A small regional sales workbook.
pub fn sales_workbook() -> Vec<u8> {
    xlsx(&[(
        "Q3",
        &[
            &["Region", "Revenue", "Units"],
            &["North", "1200", "40"],
            &["South", "800", "25"],
            &["East", "950", "31"],
        ],
    )])
}

// ============ Stub collaborators ============

/// Delegates to the real extractor and records every call.
#[derive(Default)]
pub struct CountingExtractor {
    pub calls: AtomicUsize,
    pub paths: Mutex<Vec<PathBuf>>,
}

impl CountingExtractor {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_path(&self) -> Option<PathBuf> {
        self.paths.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl DocumentExtractor for CountingExtractor {
    async fn extract(&self, path: &Path, kind: FileKind) -> Result<Vec<SheetDocument>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.paths.lock().unwrap().push(path.to_path_buf());
        assert!(path.exists(), "upload must be materialized before extraction");
        SpreadsheetExtractor.extract(path, kind).await
    }
}

/// Deterministic bag-of-words embedder: words hash into a fixed number of
/// buckets, so texts sharing words score as similar.
#[derive(Default)]
pub struct HashEmbedder {
    pub calls: AtomicUsize,
    pub texts: AtomicUsize,
}

const HASH_DIMS: usize = 32;

impl HashEmbedder {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn vector(text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; HASH_DIMS];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7usize, |h, b| h.wrapping_mul(31).wrapping_add(b as usize))
                % HASH_DIMS;
            v[bucket] += 1.0;
        }
        // Keep every vector non-zero.
        v[0] += 0.01;
        v
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash"
    }
    fn dims(&self) -> usize {
        HASH_DIMS
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

/// One scripted generation: fragments, then optionally a mid-stream error.
#[derive(Clone)]
pub struct Script {
    pub fragments: Vec<String>,
    pub fail_with: Option<String>,
}

impl Script {
    pub fn answer(fragments: &[&str]) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail_with: None,
        }
    }

    pub fn broken(fragments: &[&str], error: &str) -> Self {
        Self {
            fragments: fragments.iter().map(|f| f.to_string()).collect(),
            fail_with: Some(error.to_string()),
        }
    }
}

/// Plays queued scripts in order, then falls back to a default answer.
pub struct ScriptedGenerator {
    scripts: Mutex<VecDeque<Script>>,
    fallback: Script,
    pub prompts: Mutex<Vec<String>>,
    refuse_start: bool,
}

impl ScriptedGenerator {
    pub fn new(fallback: &[&str]) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            fallback: Script::answer(fallback),
            prompts: Mutex::new(Vec::new()),
            refuse_start: false,
        }
    }

    /// A generator whose backend is unreachable.
    pub fn unreachable() -> Self {
        Self {
            refuse_start: true,
            ..Self::new(&[])
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str) -> Result<FragmentStream> {
        if self.refuse_start {
            bail!("connection refused");
        }
        self.prompts.lock().unwrap().push(prompt.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let mut items: Vec<Result<String>> = script.fragments.into_iter().map(Ok).collect();
        if let Some(err) = script.fail_with {
            items.push(Err(anyhow::anyhow!(err)));
        }
        Ok(futures::stream::iter(items).boxed())
    }
}

/// Stubs wired into a [`Services`], with handles kept for assertions.
pub struct Harness {
    pub services: Services,
    pub extractor: Arc<CountingExtractor>,
    pub embedder: Arc<HashEmbedder>,
    pub generator: Arc<ScriptedGenerator>,
}

pub fn harness_with(config: Config, generator: ScriptedGenerator) -> Harness {
    let extractor = Arc::new(CountingExtractor::default());
    let embedder = Arc::new(HashEmbedder::default());
    let generator = Arc::new(generator);
    let services = Services::new(config, embedder.clone(), generator.clone())
        .with_extractor(extractor.clone());
    Harness {
        services,
        extractor,
        embedder,
        generator,
    }
}

pub fn harness() -> Harness {
    harness_with(Config::minimal(), ScriptedGenerator::new(&["ok"]))
}
