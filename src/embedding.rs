//! Embedding provider abstraction and implementations.
//!
//! Defines the [`EmbeddingProvider`] trait and concrete implementations:
//! - **[`DisabledProvider`]** — returns errors; used when embeddings are not configured.
//! - **[`OpenAIProvider`]** — calls the OpenAI embeddings API with batching, retry, and backoff.
//! - **[`OllamaProvider`]** — calls a local Ollama instance's `/api/embed` endpoint.
//! - **[`FixtureProvider`]** — deterministic hash-derived vectors; no network, stable
//!   across runs, for tests and offline rebuilds.
//!
//! Also provides the codecs for the artifact's vector rows:
//! - [`vec_to_blob`] — encode a `Vec<f32>` as little-endian bytes
//! - [`blob_to_vec`] — decode little-endian bytes back into a `Vec<f32>`
//!
//! # Retry Strategy
//!
//! The OpenAI and Ollama providers use exponential backoff for transient errors:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Every request carries the configured timeout, so a rebuild never hangs on
//! a single call; callers treat all [`KbError::EmbeddingProvider`] results as
//! retryable at their own level.

use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::config::EmbeddingConfig;
use crate::error::{KbError, KbResult};

/// Trait for embedding providers.
///
/// Defines the interface that all embedding backends must implement.
/// The actual embedding computation is performed by [`embed_texts`]
/// (kept as a free function due to async trait limitations).
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;
    /// Returns the embedding vector dimensionality (e.g. `1536`).
    fn dims(&self) -> usize;
}

/// Embed a batch of texts using the configured provider.
///
/// Returns one vector per input text, in the same order. Dispatches to the
/// appropriate backend based on the config's `provider` field.
pub async fn embed_texts(
    _provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
    texts: &[String],
) -> KbResult<Vec<Vec<f32>>> {
    match config.provider.as_str() {
        "openai" => embed_openai(config, texts).await,
        "ollama" => embed_ollama(config, texts).await,
        "fixture" => embed_fixture(config, texts),
        "disabled" => Err(KbError::EmbeddingProvider(
            "embedding provider is disabled".to_string(),
        )),
        other => Err(KbError::EmbeddingProvider(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
pub fn create_provider(config: &EmbeddingConfig) -> KbResult<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Box::new(DisabledProvider)),
        "openai" => Ok(Box::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Box::new(OllamaProvider::new(config)?)),
        "fixture" => Ok(Box::new(FixtureProvider::new(config))),
        other => Err(KbError::EmbeddingProvider(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

// ============ Disabled Provider ============

/// A no-op embedding provider that always returns errors.
pub struct DisabledProvider;

impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
}

// ============ OpenAI Provider ============

/// Embedding provider using the OpenAI API.
///
/// Calls the `POST /v1/embeddings` endpoint with the configured model.
/// Requires the `OPENAI_API_KEY` environment variable to be set.
pub struct OpenAIProvider {
    model: String,
    dims: usize,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> KbResult<Self> {
        let model = config.model.clone().ok_or_else(|| {
            KbError::EmbeddingProvider("embedding.model required for OpenAI provider".to_string())
        })?;
        let dims = config.dims.ok_or_else(|| {
            KbError::EmbeddingProvider("embedding.dims required for OpenAI provider".to_string())
        })?;

        if std::env::var("OPENAI_API_KEY").is_err() {
            return Err(KbError::EmbeddingProvider(
                "OPENAI_API_KEY environment variable not set".to_string(),
            ));
        }

        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_openai(config: &EmbeddingConfig, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
    let api_key = std::env::var("OPENAI_API_KEY")
        .map_err(|_| KbError::EmbeddingProvider("OPENAI_API_KEY not set".to_string()))?;

    let model = config
        .model
        .as_ref()
        .ok_or_else(|| KbError::EmbeddingProvider("embedding.model required".to_string()))?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| KbError::EmbeddingProvider(e.to_string()))?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            // Exponential backoff: 1s, 2s, 4s, 8s, ...
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post("https://api.openai.com/v1/embeddings")
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| KbError::EmbeddingProvider(e.to_string()))?;
                    return parse_openai_response(&json);
                }

                // Rate limited or server error — retry
                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(KbError::EmbeddingProvider(format!(
                        "OpenAI API error {}: {}",
                        status, body_text
                    )));
                    continue;
                }

                // Client error (not 429) — don't retry
                let body_text = response.text().await.unwrap_or_default();
                return Err(KbError::EmbeddingProvider(format!(
                    "OpenAI API error {}: {}",
                    status, body_text
                )));
            }
            Err(e) => {
                last_err = Some(KbError::EmbeddingProvider(e.to_string()));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        KbError::EmbeddingProvider("embedding failed after retries".to_string())
    }))
}

fn parse_openai_response(json: &serde_json::Value) -> KbResult<Vec<Vec<f32>>> {
    let data = json.get("data").and_then(|d| d.as_array()).ok_or_else(|| {
        KbError::EmbeddingProvider("invalid OpenAI response: missing data array".to_string())
    })?;

    let mut embeddings = Vec::with_capacity(data.len());

    for item in data {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| {
                KbError::EmbeddingProvider("invalid OpenAI response: missing embedding".to_string())
            })?;

        let vec: Vec<f32> = embedding
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        embeddings.push(vec);
    }

    Ok(embeddings)
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Calls `POST /api/embed` on the configured URL (default
/// `http://localhost:11434`). Requires an embedding model to be pulled.
pub struct OllamaProvider {
    model: String,
    dims: usize,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> KbResult<Self> {
        let model = config.model.clone().ok_or_else(|| {
            KbError::EmbeddingProvider("embedding.model required for Ollama provider".to_string())
        })?;
        let dims = config.dims.ok_or_else(|| {
            KbError::EmbeddingProvider("embedding.dims required for Ollama provider".to_string())
        })?;
        Ok(Self { model, dims })
    }
}

impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

async fn embed_ollama(config: &EmbeddingConfig, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
    let model = config
        .model
        .as_ref()
        .ok_or_else(|| KbError::EmbeddingProvider("embedding.model required".to_string()))?;

    let url = config.url.as_deref().unwrap_or("http://localhost:11434");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| KbError::EmbeddingProvider(e.to_string()))?;

    let body = serde_json::json!({
        "model": model,
        "input": texts,
    });

    let mut last_err = None;

    for attempt in 0..=config.max_retries {
        if attempt > 0 {
            let delay = Duration::from_secs(1 << (attempt - 1).min(5));
            tokio::time::sleep(delay).await;
        }

        let resp = client
            .post(format!("{}/api/embed", url))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await;

        match resp {
            Ok(response) => {
                let status = response.status();

                if status.is_success() {
                    let json: serde_json::Value = response
                        .json()
                        .await
                        .map_err(|e| KbError::EmbeddingProvider(e.to_string()))?;
                    return parse_ollama_response(&json);
                }

                if status.as_u16() == 429 || status.is_server_error() {
                    let body_text = response.text().await.unwrap_or_default();
                    last_err = Some(KbError::EmbeddingProvider(format!(
                        "Ollama API error {}: {}",
                        status, body_text
                    )));
                    continue;
                }

                let body_text = response.text().await.unwrap_or_default();
                return Err(KbError::EmbeddingProvider(format!(
                    "Ollama API error {}: {}",
                    status, body_text
                )));
            }
            Err(e) => {
                last_err = Some(KbError::EmbeddingProvider(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    url, e
                )));
                continue;
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        KbError::EmbeddingProvider("Ollama embedding failed after retries".to_string())
    }))
}

fn parse_ollama_response(json: &serde_json::Value) -> KbResult<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            KbError::EmbeddingProvider(
                "invalid Ollama response: missing embeddings array".to_string(),
            )
        })?;

    let mut result = Vec::with_capacity(embeddings.len());

    for embedding in embeddings {
        let vec: Vec<f32> = embedding
            .as_array()
            .ok_or_else(|| {
                KbError::EmbeddingProvider(
                    "invalid Ollama response: embedding is not an array".to_string(),
                )
            })?
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        result.push(vec);
    }

    Ok(result)
}

// ============ Fixture Provider ============

/// Deterministic embedding provider: vectors are derived from a SHA-256
/// expansion of the text, L2-normalized. The same text always produces the
/// same vector, which makes rebuilds reproducible without any model.
pub struct FixtureProvider {
    dims: usize,
}

impl FixtureProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self {
            dims: config.dims.unwrap_or(384),
        }
    }
}

impl EmbeddingProvider for FixtureProvider {
    fn model_name(&self) -> &str {
        "fixture"
    }
    fn dims(&self) -> usize {
        self.dims
    }
}

fn embed_fixture(config: &EmbeddingConfig, texts: &[String]) -> KbResult<Vec<Vec<f32>>> {
    let dims = config.dims.unwrap_or(384);
    Ok(texts.iter().map(|t| fixture_vector(t, dims)).collect())
}

fn fixture_vector(text: &str, dims: usize) -> Vec<f32> {
    let mut bytes = Vec::with_capacity(dims * 4 + 32);
    let mut counter: u32 = 0;
    while bytes.len() < dims * 4 {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        hasher.update(counter.to_le_bytes());
        bytes.extend_from_slice(&hasher.finalize());
        counter += 1;
    }

    let mut out: Vec<f32> = bytes
        .chunks_exact(4)
        .take(dims)
        .map(|b| {
            let v = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
            (v as f64 / u32::MAX as f64) as f32 * 2.0 - 1.0
        })
        .collect();

    let norm = out.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut out {
            *v /= norm;
        }
    }
    out
}

// ============ Vector codecs ============

/// Encode a float vector as little-endian `f32` bytes, 4 bytes per value.
/// This is the row encoding of the artifact's index file.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian `f32` bytes back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
