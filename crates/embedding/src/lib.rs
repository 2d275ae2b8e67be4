//! Embedding provider adapter — maps text to fixed-dimension float vectors.
//!
//! The memory engine treats embedding generation as an opaque function
//! `text -> Vec<f32>`.  Two backends are provided:
//!
//! | Provider              | Use case                                       |
//! |-----------------------|------------------------------------------------|
//! | [`HttpEmbeddingClient`] | OpenAI-style `/embeddings` HTTP endpoint     |
//! | [`HashEmbedder`]      | Deterministic local vectors (offline, tests)   |

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use engram_config::EmbeddingConfig;

/// Backend abstraction for embedding generation.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Dimension of every vector this provider returns.
    fn dimension(&self) -> usize;

    /// Embed a single text string.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed multiple texts.  The default implementation embeds one at a
    /// time; backends with a batch endpoint should override it.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Build a provider from configuration.
pub fn provider_from_config(config: &EmbeddingConfig) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.to_ascii_lowercase().as_str() {
        "hash" => Ok(Box::new(HashEmbedder::new(config.dimension))),
        "http" => Ok(Box::new(HttpEmbeddingClient::new(config)?)),
        other => bail!("unknown embedding provider: {other}"),
    }
}

// ── HTTP client ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingItem>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingItem {
    embedding: Vec<f32>,
}

/// Client for an OpenAI-style `POST {base_url}/embeddings` endpoint.
///
/// Transient failures (connection errors, HTTP 429/5xx) are retried with
/// bounded exponential backoff before the error is surfaced to the caller.
#[derive(Debug, Clone)]
pub struct HttpEmbeddingClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
    dimension: usize,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl HttpEmbeddingClient {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: if config.api_key.is_empty() {
                None
            } else {
                Some(config.api_key.clone())
            },
            dimension: config.dimension,
            retry_attempts: config.retry_attempts.max(1),
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
        })
    }

    async fn request(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/embeddings", self.base_url);
        let payload = json!({
            "model": self.model,
            "input": inputs,
        });

        let mut last_err = None;
        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                let delay = self.retry_base_delay * 2u32.pow(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&endpoint).json(&payload);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(resp) if resp.status().is_success() => {
                    let body: EmbeddingsResponse =
                        resp.json().await.context("malformed embeddings response")?;
                    let vectors: Vec<Vec<f32>> =
                        body.data.into_iter().map(|item| item.embedding).collect();
                    if vectors.len() != inputs.len() {
                        bail!(
                            "embedding count mismatch: sent {}, got {}",
                            inputs.len(),
                            vectors.len()
                        );
                    }
                    return Ok(vectors);
                }
                Ok(resp) => {
                    let status = resp.status();
                    // Client errors other than rate limits will not heal on retry.
                    if status.is_client_error() && status.as_u16() != 429 {
                        let body = resp.text().await.unwrap_or_default();
                        bail!("embedding request rejected ({status}): {body}");
                    }
                    warn!(%status, attempt, "embedding request failed — will retry");
                    last_err = Some(anyhow::anyhow!("embedding endpoint returned {status}"));
                }
                Err(err) => {
                    warn!(error = %err, attempt, "embedding request error — will retry");
                    last_err = Some(err.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("embedding request failed")))
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingClient {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.request(std::slice::from_ref(&text.to_string())).await?;
        vectors
            .pop()
            .context("embeddings response contained no vectors")
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

// ── Hash embedder ─────────────────────────────────────────────────────────────

/// Deterministic token-bucket embedder.
///
/// Each lowercased alphanumeric token is hashed into a vector component and
/// counted; the result is L2-normalized.  Texts sharing tokens therefore get
/// a higher cosine similarity, which makes the provider usable for offline
/// operation and meaningful in tests.  It is not a substitute for a real
/// embedding model.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        assert!(dimension > 0, "embedding dimension must be positive");
        Self { dimension }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0f32; self.dimension];

        for token in text
            .split(|ch: char| !ch.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let token = token.to_lowercase();
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let hash = hasher.finish();
            let bucket = (hash % self.dimension as u64) as usize;
            // Sign bit from a higher hash bit spreads tokens across both
            // directions of each axis.
            let sign = if hash & (1 << 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in &mut vector {
                *value /= norm;
            }
        }

        Ok(vector)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cosine(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let ma: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let mb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if ma == 0.0 || mb == 0.0 { 0.0 } else { dot / (ma * mb) }
    }

    #[tokio::test]
    async fn hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("the rate limiter uses a token bucket").await.unwrap();
        let b = embedder.embed("the rate limiter uses a token bucket").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn hash_embedder_output_is_normalized() {
        let embedder = HashEmbedder::new(32);
        let v = embedder.embed("normalize me please").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn shared_tokens_raise_similarity() {
        let embedder = HashEmbedder::new(128);
        let base = embedder.embed("user prefers dark mode themes").await.unwrap();
        let close = embedder.embed("dark mode themes are preferred").await.unwrap();
        let far = embedder.embed("quarterly revenue grew twelve percent").await.unwrap();

        assert!(cosine(&base, &close) > cosine(&base, &far));
    }

    #[tokio::test]
    async fn empty_text_embeds_to_zero_vector() {
        let embedder = HashEmbedder::new(16);
        let v = embedder.embed("").await.unwrap();
        assert!(v.iter().all(|x| *x == 0.0));
    }

    #[tokio::test]
    async fn batch_default_matches_single_calls() {
        let embedder = HashEmbedder::new(32);
        let texts = vec!["alpha beta".to_string(), "gamma delta".to_string()];
        let batch = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0], embedder.embed("alpha beta").await.unwrap());
        assert_eq!(batch[1], embedder.embed("gamma delta").await.unwrap());
    }

    #[test]
    fn provider_from_config_rejects_unknown_backend() {
        let mut cfg = engram_config::EmbeddingConfig::default();
        cfg.provider = "carrier-pigeon".to_string();
        assert!(provider_from_config(&cfg).is_err());
    }
}
