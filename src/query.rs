//! Chat turns.
//!
//! [`ask`] runs one question against the session's active document: the
//! user message is recorded, the cached pipeline streams an answer, each
//! fragment is relayed to a [`TurnSink`] together with the answer so far,
//! and the completed answer is recorded as one assistant message.
//!
//! A generation failure ends the turn with [`Error::Generation`] and no
//! assistant message. Nothing is retried.

use futures::StreamExt;

use crate::error::{Error, Result};
use crate::models::{RetrievedChunk, Role};
use crate::session::Session;

/// Receives an answer while it is being generated.
pub trait TurnSink: Send {
    /// `partial` is everything received so far, `fragment` included.
    fn on_fragment(&mut self, fragment: &str, partial: &str);
}

impl<F> TurnSink for F
where
    F: FnMut(&str, &str) + Send,
{
    fn on_fragment(&mut self, fragment: &str, partial: &str) {
        self(fragment, partial)
    }
}

/// Sink that discards fragments.
pub struct Discard;

impl TurnSink for Discard {
    fn on_fragment(&mut self, _fragment: &str, _partial: &str) {}
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    pub sources: Vec<RetrievedChunk>,
}

/// Answer `question` from the session's active document.
pub async fn ask(session: &mut Session, question: &str, sink: &mut dyn TurnSink) -> Result<Answer> {
    let question = question.trim();
    if question.is_empty() {
        return Err(Error::EmptyQuestion);
    }
    let handle = session.active_pipeline().ok_or(Error::NoActiveDocument)?;

    session.append_message(Role::User, question);

    let response = handle.query(question).await.map_err(|e| {
        tracing::warn!(session = %session.id(), error = %format!("{:#}", e), "generation failed to start");
        Error::generation(format!("{:#}", e))
    })?;
    tracing::debug!(session = %session.id(), sources = response.sources.len(), "generation started");

    let mut answer = String::new();
    let mut fragments = response.fragments;
    while let Some(next) = fragments.next().await {
        match next {
            Ok(fragment) => {
                answer.push_str(&fragment);
                sink.on_fragment(&fragment, &answer);
            }
            Err(e) => {
                tracing::warn!(
                    session = %session.id(),
                    received_chars = answer.len(),
                    error = %format!("{:#}", e),
                    "generation interrupted"
                );
                return Err(Error::generation(format!("{:#}", e)));
            }
        }
    }

    session.set_context(response.sources.clone());
    session.append_message(Role::Assistant, answer.clone());
    tracing::info!(session = %session.id(), answer_chars = answer.len(), "turn complete");

    Ok(Answer {
        text: answer,
        sources: response.sources,
    })
}
