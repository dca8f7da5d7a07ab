//! Streaming answer generation.
//!
//! The [`Generator`] trait turns a fully rendered prompt into a lazy,
//! finite stream of text fragments. [`OllamaGenerator`] implements it
//! against Ollama's `POST /api/generate` with `stream: true`, which replies
//! with newline-delimited JSON objects:
//!
//! ```text
//! {"model":"llama3.2","response":"The ","done":false}
//! {"model":"llama3.2","response":"answer","done":false}
//! {"model":"llama3.2","response":"","done":true}
//! ```
//!
//! Network chunks do not align with lines, so the decoder buffers bytes
//! until a full line is available. A stream that ends without a
//! `"done": true` line is reported as an error.

use std::pin::Pin;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;

/// Lazy sequence of answer fragments. Not restartable.
pub type FragmentStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Start generating for `prompt`. Errors here mean the stream never started.
    async fn generate(&self, prompt: &str) -> Result<FragmentStream>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct StreamLine {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Ollama-backed generator, configured once at startup.
pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
    temperature: Option<f32>,
}

impl OllamaGenerator {
    /// `request_timeout_secs` bounds connecting and each wait between body
    /// chunks, not the whole answer, so a long but live stream is not cut off.
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.request_timeout_secs);
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    /// Verify Ollama is reachable. Warns if the model has not been pulled.
    pub async fn health_check(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.url);
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .with_context(|| format!("Ollama is not reachable at {}", self.url))?;
        if !response.status().is_success() {
            bail!("Ollama health check failed: HTTP {}", response.status());
        }

        let tags: serde_json::Value = response.json().await.unwrap_or_default();
        let pulled = tags
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models.iter().any(|m| {
                    m.get("name")
                        .and_then(|n| n.as_str())
                        .is_some_and(|n| n == self.model || n.starts_with(&format!("{}:", self.model)))
                })
            })
            .unwrap_or(false);
        if !pulled {
            tracing::warn!(model = %self.model, "model not found in Ollama; run `ollama pull {}`", self.model);
        }
        Ok(())
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str) -> Result<FragmentStream> {
        let request = GenerateRequest {
            model: &self.model,
            prompt,
            stream: true,
            options: self.temperature.map(|temperature| GenerateOptions { temperature }),
        };

        tracing::debug!(model = %self.model, prompt_chars = prompt.len(), "starting generation");

        let response = self
            .client
            .post(format!("{}/api/generate", self.url))
            .json(&request)
            .send()
            .await
            .with_context(|| format!("generation request to {} failed", self.url))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama generation failed: HTTP {} - {}", status, body);
        }

        Ok(ndjson_fragments(response.bytes_stream()))
    }
}

struct DecodeState<S> {
    inner: Pin<Box<S>>,
    buf: Vec<u8>,
    finished: bool,
}

enum Decoded {
    Fragment(String),
    Last(String),
}

fn decode_line(line: &[u8]) -> Result<Option<Decoded>> {
    let text = std::str::from_utf8(line).context("generation stream is not UTF-8")?;
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    let parsed: StreamLine =
        serde_json::from_str(text).with_context(|| format!("malformed stream line: {}", text))?;
    if let Some(err) = parsed.error {
        bail!("{}", err);
    }
    Ok(Some(if parsed.done {
        Decoded::Last(parsed.response)
    } else {
        Decoded::Fragment(parsed.response)
    }))
}

/// Decode an NDJSON byte stream into non-empty text fragments.
pub fn ndjson_fragments<S, B, E>(bytes: S) -> FragmentStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let state = DecodeState {
        inner: Box::pin(bytes),
        buf: Vec::new(),
        finished: false,
    };

    futures::stream::try_unfold(state, |mut st| async move {
        loop {
            if st.finished {
                return Ok(None);
            }
            if let Some(pos) = st.buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = st.buf.drain(..=pos).collect();
                match decode_line(&line)? {
                    Some(Decoded::Fragment(text)) if !text.is_empty() => {
                        return Ok(Some((text, st)));
                    }
                    Some(Decoded::Last(text)) => {
                        st.finished = true;
                        if !text.is_empty() {
                            return Ok(Some((text, st)));
                        }
                        return Ok(None);
                    }
                    _ => continue,
                }
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(chunk.as_ref()),
                Some(Err(e)) => bail!("generation stream interrupted: {}", e),
                None => {
                    if st.buf.iter().all(|b| b.is_ascii_whitespace()) {
                        bail!("generation stream ended before completion");
                    }
                    // Final line without a trailing newline.
                    st.buf.push(b'\n');
                }
            }
        }
    })
    .boxed()
}
