//! HTTP embedding provider for OpenAI-compatible `/v1/embeddings`
//! endpoints (OpenAI, Ollama, LM Studio, …).

use crate::error::{Error, Result};
use crate::provider::{EmbeddingKind, EmbeddingProvider};
use crate::retry::{with_backoff, CircuitBreaker, RetryPolicy};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

/// Sanitize API error messages so internal paths never leak to users.
fn sanitize_api_error(error: &str) -> String {
    let lower = error.to_lowercase();
    if lower.contains("/home") || lower.contains("/root") || lower.contains("\\users\\") {
        return "An internal error occurred in the embedding backend.".to_string();
    }
    if lower.contains("connection refused") || lower.contains("failed to connect") {
        return "Failed to connect to the embedding backend. Is it running?".to_string();
    }
    if error.len() < 200 {
        return error.to_string();
    }
    "Embedding request failed. Please try again.".to_string()
}

// ── API types ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRow {
    embedding: Vec<f32>,
    #[serde(default)]
    index: usize,
}

// ── Provider ────────────────────────────────────────────────────

/// OpenAI-style HTTP embedding provider.
pub struct HttpProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    timeout: Duration,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl HttpProvider {
    /// Create a provider for `base_url` with the given model/dimension.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
        dimension: usize,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Provider(format!("client init: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            dimension,
            timeout,
            breaker: CircuitBreaker::default(),
            retry,
        })
    }

    /// Retrieval-tuned models want a task prefix per input kind.
    fn task_prefix(kind: EmbeddingKind) -> &'static str {
        match kind {
            EmbeddingKind::Content | EmbeddingKind::Metadata => "search_document: ",
            EmbeddingKind::Query => "search_query: ",
        }
    }

    async fn request(&self, inputs: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let expected = inputs.len();
        let body = EmbeddingsRequest {
            model: &self.model,
            input: inputs,
        };
        let mut req = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout.as_millis() as u64)
            } else {
                Error::Network(sanitize_api_error(&e.to_string()))
            }
        })?;

        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(|secs| secs * 1000)
                .unwrap_or(1_000);
            return Err(Error::RateLimited { retry_after_ms });
        }
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(Error::Api(format!(
                "embeddings request failed with status {status}: {}",
                sanitize_api_error(&text)
            )));
        }

        let mut parsed: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| Error::InvalidResponse(e.to_string()))?;
        if parsed.data.len() != expected {
            return Err(Error::InvalidResponse(format!(
                "expected {expected} embeddings, got {}",
                parsed.data.len()
            )));
        }
        parsed.data.sort_by_key(|row| row.index);
        let vectors: Vec<Vec<f32>> = parsed.data.into_iter().map(|row| row.embedding).collect();
        for v in &vectors {
            if v.len() != self.dimension {
                return Err(Error::InvalidResponse(format!(
                    "expected dimension {}, got {}",
                    self.dimension,
                    v.len()
                )));
            }
        }
        Ok(vectors)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpProvider {
    #[instrument(skip(self, text), fields(text_len = text.len(), kind = %kind))]
    async fn embed(&self, text: &str, kind: EmbeddingKind) -> Result<Vec<f32>> {
        let input = format!("{}{}", Self::task_prefix(kind), text);
        let mut vectors = with_backoff(&self.breaker, &self.retry, || {
            self.request(vec![input.clone()])
        })
        .await?;
        vectors
            .pop()
            .ok_or_else(|| Error::InvalidResponse("empty embedding result".to_string()))
    }

    #[instrument(skip(self, texts), fields(batch_size = texts.len(), kind = %kind))]
    async fn embed_batch(&self, texts: &[String], kind: EmbeddingKind) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let prefix = Self::task_prefix(kind);
        let inputs: Vec<String> = texts.iter().map(|t| format!("{prefix}{t}")).collect();
        let vectors = with_backoff(&self.breaker, &self.retry, || self.request(inputs.clone()))
            .await?;
        debug!(count = vectors.len(), "Generated batch embeddings");
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &str {
        "http"
    }

    fn model(&self) -> &str {
        &self.model
    }
}
