//! Per-user session state.
//!
//! A [`Session`] exclusively owns its pipeline cache, its chat transcript,
//! and the retrieval context of the last answered turn. Orchestrators take
//! `&mut Session` explicitly; nothing lives in process globals.
//!
//! The HTTP server keeps many sessions in a [`SessionStore`], each behind
//! its own async mutex so one user action runs at a time per session.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{ChatMessage, RetrievedChunk, Role, SessionId};
use crate::pipeline::PipelineHandle;

/// Identity of a cached pipeline.
///
/// `fingerprint` is only set under content keying, where it holds the
/// SHA-256 of the uploaded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub session: SessionId,
    pub document: String,
    pub fingerprint: Option<String>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.session, self.document)?;
        if let Some(fp) = &self.fingerprint {
            let short: String = fp.chars().take(12).collect();
            write!(f, "@{}", short)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Session {
    id: SessionId,
    pipelines: HashMap<CacheKey, PipelineHandle>,
    transcript: Vec<ChatMessage>,
    context: Option<Vec<RetrievedChunk>>,
    active: Option<CacheKey>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(SessionId::new())
    }

    pub fn with_id(id: SessionId) -> Self {
        Self {
            id,
            pipelines: HashMap::new(),
            transcript: Vec::new(),
            context: None,
            active: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Build the cache key for a document in this session.
    pub fn cache_key(&self, document: &str, fingerprint: Option<String>) -> CacheKey {
        CacheKey {
            session: self.id,
            document: document.to_string(),
            fingerprint,
        }
    }

    pub fn lookup_pipeline(&self, key: &CacheKey) -> Option<PipelineHandle> {
        self.pipelines.get(key).cloned()
    }

    /// Cache a pipeline. An existing entry for `key` is never replaced.
    pub fn insert_pipeline(&mut self, key: CacheKey, handle: PipelineHandle) -> Result<()> {
        if self.pipelines.contains_key(&key) {
            return Err(Error::DuplicateKey(key.to_string()));
        }
        self.pipelines.insert(key, handle);
        Ok(())
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Make `key` the document that chat turns are answered from.
    pub fn set_active(&mut self, key: CacheKey) {
        self.active = Some(key);
    }

    pub fn active_document(&self) -> Option<&str> {
        self.active.as_ref().map(|k| k.document.as_str())
    }

    /// Handle for the active document, if one has been ingested.
    pub fn active_pipeline(&self) -> Option<PipelineHandle> {
        self.active.as_ref().and_then(|k| self.lookup_pipeline(k))
    }

    pub fn append_message(&mut self, role: Role, text: impl Into<String>) {
        self.transcript.push(ChatMessage::new(role, text));
    }

    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    pub fn set_context(&mut self, sources: Vec<RetrievedChunk>) {
        self.context = Some(sources);
    }

    /// Chunks that grounded the last answer.
    pub fn context(&self) -> Option<&[RetrievedChunk]> {
        self.context.as_deref()
    }

    /// Clear the transcript and retrieval context. Cached pipelines stay.
    pub fn reset(&mut self) {
        let dropped_messages = std::mem::take(&mut self.transcript).len();
        let dropped_sources = self.context.take().map(|c| c.len()).unwrap_or(0);
        tracing::info!(
            session = %self.id,
            dropped_messages,
            dropped_sources,
            "session reset"
        );
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared, lockable session.
pub type SharedSession = Arc<Mutex<Session>>;

/// All live sessions of a server process.
#[derive(Default)]
pub struct SessionStore {
    sessions: StdMutex<HashMap<SessionId, SharedSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return `id` if it names a live session, otherwise create one.
    ///
    /// Repeated calls with the returned id always yield that same id.
    pub fn get_or_create_session(&self, id: Option<SessionId>) -> SessionId {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = id {
            if sessions.contains_key(&id) {
                return id;
            }
        }
        let id = id.unwrap_or_default();
        sessions.insert(id, Arc::new(Mutex::new(Session::with_id(id))));
        tracing::info!(session = %id, "session created");
        id
    }

    pub fn get(&self, id: SessionId) -> Option<SharedSession> {
        self.sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    /// Tear down a session, dropping its transcript and cached pipelines.
    ///
    /// A turn still holding the session finishes first; the memory goes
    /// with its last reference. Returns false for an unknown id.
    pub fn remove(&self, id: SessionId) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
            .is_some();
        if removed {
            tracing::info!(session = %id, "session removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
