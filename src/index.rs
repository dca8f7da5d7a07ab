//! In-memory vector index.
//!
//! Holds the chunks of one ingested workbook together with their embedding
//! vectors. Search is brute-force cosine similarity over all stored
//! vectors, which is plenty for a single spreadsheet.

use anyhow::{bail, Result};

use crate::embedding::cosine_similarity;
use crate::models::{Chunk, RetrievedChunk};

/// Searchable vector storage for one document set.
pub trait VectorIndex: Send + Sync {
    /// Return up to `top_k` chunks ranked by similarity to `query_vec`.
    fn query(&self, query_vec: &[f32], top_k: usize) -> Vec<RetrievedChunk>;

    /// Dimension every stored vector (and every query vector) must have.
    fn dims(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct StoredVector {
    chunk: Chunk,
    vector: Vec<f32>,
}

pub struct InMemoryIndex {
    entries: Vec<StoredVector>,
    dims: usize,
}

impl InMemoryIndex {
    /// Build an index from chunks and their vectors (same order, same length).
    pub fn build(chunks: Vec<Chunk>, vectors: Vec<Vec<f32>>) -> Result<Self> {
        if chunks.len() != vectors.len() {
            bail!(
                "{} chunks but {} vectors; cannot build index",
                chunks.len(),
                vectors.len()
            );
        }
        if chunks.is_empty() {
            bail!("no chunks to index");
        }
        let dims = vectors[0].len();
        if dims == 0 {
            bail!("embedding vectors are empty");
        }
        if let Some(bad) = vectors.iter().position(|v| v.len() != dims) {
            bail!(
                "vector {} has {} dimensions, expected {}",
                bad,
                vectors[bad].len(),
                dims
            );
        }

        let entries = chunks
            .into_iter()
            .zip(vectors)
            .map(|(chunk, vector)| StoredVector { chunk, vector })
            .collect();
        Ok(Self { entries, dims })
    }
}

impl VectorIndex for InMemoryIndex {
    fn query(&self, query_vec: &[f32], top_k: usize) -> Vec<RetrievedChunk> {
        let mut candidates: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, sv)| (i, cosine_similarity(query_vec, &sv.vector)))
            .collect();
        // Ties keep chunk order.
        candidates.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        candidates.truncate(top_k);
        candidates
            .into_iter()
            .map(|(i, score)| {
                let chunk = &self.entries[i].chunk;
                RetrievedChunk {
                    chunk_id: chunk.id.clone(),
                    document_id: chunk.document_id.clone(),
                    score,
                    text: chunk.text.clone(),
                }
            })
            .collect()
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}
