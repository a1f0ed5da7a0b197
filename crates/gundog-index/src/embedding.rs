//! Embedding provider contract and the HTTP-backed implementation.
//!
//! The engine consumes an opaque embedder: batched text-in, vector-out.
//! Returned vectors need not be normalized; the engine normalizes before
//! storing.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{IndexError, Result};

/// Default maximum batch size the engine sends to a provider.
pub const DEFAULT_BATCH_SIZE: usize = 32;

/// Contract for sentence-embedding backends.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Stable identifier encoding model name and version.
    fn identifier(&self) -> &str;

    /// Output dimension.
    fn dimension(&self) -> usize;

    /// Largest batch the provider accepts.
    fn max_batch_size(&self) -> usize {
        DEFAULT_BATCH_SIZE
    }
}

/// L2-normalize a vector in place. Zero vectors are left untouched.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Provider speaking the OpenAI-compatible `/v1/embeddings` protocol.
pub struct HttpEmbeddings {
    endpoint: String,
    api_key: Option<String>,
    model: String,
    dimension: usize,
    client: Client,
}

impl HttpEmbeddings {
    pub fn new(
        endpoint: String,
        model: String,
        dimension: usize,
        api_key: Option<String>,
    ) -> Self {
        Self {
            endpoint,
            api_key,
            model,
            dimension,
            client: Client::new(),
        }
    }

    pub fn from_config(config: &crate::config::EmbeddingConfig) -> Self {
        Self::new(
            config.endpoint.clone(),
            config.model.clone(),
            config.dimension,
            config.api_key.clone(),
        )
    }

    /// Send one embedding request, retrying on 429 with backoff.
    async fn send_request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let body = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let max_retries = 3;
        let mut retries = 0;
        let mut backoff_secs = 1u64;

        loop {
            debug!(
                count = body.input.len(),
                endpoint = %self.endpoint,
                "sending embedding request"
            );

            let mut request = self.client.post(&self.endpoint).json(&body);
            if let Some(ref key) = self.api_key {
                request = request.header("Authorization", format!("Bearer {key}"));
            }
            let response = request
                .send()
                .await
                .map_err(|e| IndexError::Embed(format!("network error: {e}")))?;

            let status = response.status();
            if status.is_success() {
                let parsed: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| IndexError::Embed(format!("invalid response: {e}")))?;

                let mut vectors: Vec<(usize, Vec<f32>)> = parsed
                    .data
                    .into_iter()
                    .map(|d| (d.index, d.embedding))
                    .collect();
                vectors.sort_by_key(|(idx, _)| *idx);

                let vectors: Vec<Vec<f32>> =
                    vectors.into_iter().map(|(_, v)| v).collect();
                for vector in &vectors {
                    if vector.len() != self.dimension {
                        return Err(IndexError::Embed(format!(
                            "model returned dimension {} but {} is configured",
                            vector.len(),
                            self.dimension
                        )));
                    }
                }
                return Ok(vectors);
            }

            if status.as_u16() == 429 {
                retries += 1;
                if retries > max_retries {
                    return Err(IndexError::Embed(format!(
                        "rate limited after {max_retries} retries"
                    )));
                }
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);
                warn!(
                    retry_after,
                    attempt = retries,
                    "embedding endpoint rate limited, retrying"
                );
                tokio::time::sleep(tokio::time::Duration::from_secs(retry_after)).await;
                backoff_secs *= 2;
                continue;
            }

            let detail = response.text().await.unwrap_or_default();
            return Err(IndexError::Embed(format!(
                "endpoint returned {}: {detail}",
                status.as_u16()
            )));
        }
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        self.send_request(texts.to_vec()).await
    }

    fn identifier(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
