//! # sheetqa
//!
//! Chat with a spreadsheet. Upload an `.xlsx` or `.xls` workbook, ask
//! questions about it in natural language, and get answers streamed from a
//! local language model, grounded in the rows of the workbook.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────────┐   ┌──────────────┐
//! │  Upload  │──▶│ Extract → Chunk → Embed →    │──▶│   Session    │
//! │ .xlsx/.xls│   │ InMemoryIndex → RagPipeline  │   │ pipeline cache│
//! └──────────┘   └──────────────────────────────┘   └──────┬───────┘
//!                                                          │
//!                ┌─────────────────────────────────────────┤
//!                ▼                                         ▼
//!          ┌──────────┐  retrieve top-k → QA prompt  ┌──────────┐
//!          │ Question │─────────────────────────────▶│ Ollama   │
//!          └──────────┘   ◀── streamed fragments ─── └──────────┘
//! ```
//!
//! Every uploaded workbook is indexed once per session and cached under
//! `(session, file name)`; later uploads of the same name reuse the cached
//! pipeline. Each chat turn is appended to the session transcript.
//!
//! ## Quick Start
//!
//! ```bash
//! sheetqa preview sales.xlsx
//! sheetqa ask sales.xlsx "Which region had the highest revenue?"
//! sheetqa chat sales.xlsx
//! sheetqa serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error kinds reported by the orchestrators |
//! | [`extract`] | Workbook → Markdown documents |
//! | [`preview`] | Tabular preview of the first sheet |
//! | [`chunk`] | Table-aware Markdown chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | In-memory vector index |
//! | [`prompt`] | The fixed QA prompt |
//! | [`generation`] | Streaming answer generation |
//! | [`pipeline`] | Query pipelines and their handles |
//! | [`session`] | Session state and pipeline cache |
//! | [`ingest`] | Upload ingestion |
//! | [`query`] | Chat turns |
//! | [`server`] | HTTP + SSE server |

pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod models;
pub mod pipeline;
pub mod preview;
pub mod prompt;
pub mod query;
pub mod server;
pub mod session;
