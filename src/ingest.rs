//! Upload ingestion.
//!
//! Turns an uploaded spreadsheet into a cached, ready-to-query pipeline:
//!
//! ```text
//! validate extension → temp file → cache lookup
//!     miss: extract → chunk → embed → index → RagPipeline → cache insert
//!     hit:  reuse the cached handle
//! → preview of the first sheet
//! ```
//!
//! The temporary directory is removed when this function returns, on every
//! path. A failed ingestion leaves the session's cache untouched.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::chunk::{Chunker, MarkdownChunker};
use crate::config::{CacheKeying, Config};
use crate::embedding::{embed_batched, Embedder};
use crate::error::{Error, Result};
use crate::extract::{DocumentExtractor, SpreadsheetExtractor};
use crate::generation::Generator;
use crate::index::{InMemoryIndex, VectorIndex};
use crate::models::FileKind;
use crate::pipeline::{PipelineHandle, RagPipeline};
use crate::preview::Preview;
use crate::session::{CacheKey, Session};

/// A file as received from the presentation layer.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            bytes,
        }
    }
}

/// Collaborators and settings shared by every ingestion and query.
#[derive(Clone)]
pub struct Services {
    pub config: Config,
    pub extractor: Arc<dyn DocumentExtractor>,
    pub chunker: Arc<dyn Chunker>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn Generator>,
}

impl Services {
    /// Default extractor and chunker around the given embedder and generator.
    pub fn new(config: Config, embedder: Arc<dyn Embedder>, generator: Arc<dyn Generator>) -> Self {
        let chunker = MarkdownChunker::new(config.chunking.max_tokens);
        Self {
            config,
            extractor: Arc::new(SpreadsheetExtractor),
            chunker: Arc::new(chunker),
            embedder,
            generator,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn DocumentExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = chunker;
        self
    }
}

#[derive(Debug)]
pub struct IngestOutcome {
    pub handle: PipelineHandle,
    pub preview: Preview,
    /// True when the handle came from the session cache.
    pub cached: bool,
    /// Chunks indexed by this call; zero on a cache hit.
    pub chunks: usize,
}

/// Ingest `upload` into `session` and make it the active document.
pub async fn ingest_upload(
    session: &mut Session,
    upload: Upload,
    services: &Services,
) -> Result<IngestOutcome> {
    let filename = Path::new(&upload.filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let kind = FileKind::from_filename(&filename)
        .ok_or_else(|| Error::UnsupportedFileType(upload.filename.clone()))?;

    tracing::info!(
        session = %session.id(),
        file = %filename,
        bytes = upload.bytes.len(),
        "upload accepted"
    );

    let temp_dir = tempfile::Builder::new().prefix("sheetqa-").tempdir()?;
    let path = temp_dir.path().join(&filename);
    tokio::fs::write(&path, &upload.bytes).await?;

    let key = cache_key_for(session, &filename, &upload.bytes, services.config.cache.key);

    let (handle, cached, chunks) = match session.lookup_pipeline(&key) {
        Some(handle) => {
            tracing::info!(key = %key, "pipeline cache hit");
            (handle, true, 0)
        }
        None => {
            tracing::info!(key = %key, "pipeline cache miss; indexing");
            let (handle, chunks) = build_pipeline(&path, &filename, kind, services).await?;
            (handle, false, chunks)
        }
    };

    let preview = render_preview(upload.bytes, &filename, services).await?;

    if !cached {
        session.insert_pipeline(key.clone(), handle.clone())?;
    }
    session.set_active(key);

    Ok(IngestOutcome {
        handle,
        preview,
        cached,
        chunks,
    })
}

async fn build_pipeline(
    path: &Path,
    filename: &str,
    kind: FileKind,
    services: &Services,
) -> Result<(PipelineHandle, usize)> {
    let docs = services
        .extractor
        .extract(path, kind)
        .await
        .map_err(|e| Error::extraction(filename, format!("{:#}", e)))?;

    let chunks = services.chunker.chunk(&docs);
    if chunks.is_empty() {
        return Err(Error::index_build("document produced no chunks"));
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embed_batched(
        services.embedder.as_ref(),
        &texts,
        services.config.embedding.batch_size,
    )
    .await
    .map_err(|e| Error::index_build(format!("{:#}", e)))?;

    let chunk_count = chunks.len();
    let index = InMemoryIndex::build(chunks, vectors).map_err(Error::index_build)?;
    tracing::info!(
        file = %filename,
        sheets = docs.len(),
        chunks = chunk_count,
        dims = index.dims(),
        "index built"
    );

    let pipeline = RagPipeline::new(
        services.embedder.clone(),
        Box::new(index),
        services.generator.clone(),
        services.config.retrieval.top_k,
    );
    Ok((PipelineHandle::new(pipeline), chunk_count))
}

async fn render_preview(bytes: Vec<u8>, filename: &str, services: &Services) -> Result<Preview> {
    let config = services.config.preview.clone();
    tokio::task::spawn_blocking(move || Preview::from_bytes(&bytes, &config))
        .await
        .map_err(|e| Error::extraction(filename, e))?
        .map_err(|e| Error::extraction(filename, format!("{:#}", e)))
}

/// Hex SHA-256 of the uploaded bytes.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Cache key for an upload under the configured keying mode.
pub fn cache_key_for(session: &Session, filename: &str, bytes: &[u8], keying: CacheKeying) -> CacheKey {
    let fp = match keying {
        CacheKeying::Name => None,
        CacheKeying::Content => Some(fingerprint(bytes)),
    };
    session.cache_key(filename, fp)
}
