//! Ready-to-query RAG pipelines.
//!
//! A [`RagPipeline`] owns the vector index of one ingested workbook and
//! answers a question in three steps: embed the question, retrieve the
//! `top_k` most similar chunks, then stream an answer from the generator
//! for the rendered QA prompt. Callers only ever see it through a
//! [`PipelineHandle`].

use std::fmt;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::embedding::{embed_query, Embedder};
use crate::generation::{FragmentStream, Generator};
use crate::index::VectorIndex;
use crate::models::RetrievedChunk;
use crate::prompt::render_qa_prompt;

/// Result of a query: the chunks used as context and the answer stream.
pub struct StreamingResponse {
    pub sources: Vec<RetrievedChunk>,
    pub fragments: FragmentStream,
}

#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn query(&self, question: &str) -> Result<StreamingResponse>;
}

pub struct RagPipeline {
    embedder: Arc<dyn Embedder>,
    index: Box<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    top_k: usize,
    dims: usize,
}

impl RagPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Box<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
        top_k: usize,
    ) -> Self {
        let dims = index.dims();
        Self {
            embedder,
            index,
            dims,
            generator,
            top_k: top_k.max(1),
        }
    }
}

#[async_trait]
impl QueryEngine for RagPipeline {
    async fn query(&self, question: &str) -> Result<StreamingResponse> {
        let query_vec = embed_query(self.embedder.as_ref(), question).await?;
        if query_vec.len() != self.dims {
            bail!(
                "query embedding has {} dimensions but the index was built with {}",
                query_vec.len(),
                self.dims
            );
        }
        let sources = self.index.query(&query_vec, self.top_k);
        tracing::debug!(retrieved = sources.len(), top_k = self.top_k, "retrieved context");

        let prompt = render_qa_prompt(&sources, question);
        let fragments = self.generator.generate(&prompt).await?;
        Ok(StreamingResponse { sources, fragments })
    }
}

/// Opaque, cheaply clonable handle to a cached pipeline.
#[derive(Clone)]
pub struct PipelineHandle(Arc<dyn QueryEngine>);

impl PipelineHandle {
    pub fn new(engine: impl QueryEngine + 'static) -> Self {
        Self(Arc::new(engine))
    }

    pub async fn query(&self, question: &str) -> Result<StreamingResponse> {
        self.0.query(question).await
    }

    /// True when both handles refer to the same pipeline instance.
    pub fn ptr_eq(&self, other: &PipelineHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for PipelineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineHandle").finish_non_exhaustive()
    }
}
