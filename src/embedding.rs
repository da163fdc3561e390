//! Embedding providers.
//!
//! Concrete implementations of
//! [`EmbeddingProvider`](chat_recall_core::embedding::EmbeddingProvider):
//!
//! - **[`DisabledProvider`]**: fails every call; questions and indexing
//!   report that embeddings are not configured.
//! - **`hash`**: the offline [`HashingProvider`] from the core crate.
//! - **[`OpenAIProvider`]**: `POST /v1/embeddings`, needs `OPENAI_API_KEY`.
//! - **[`OllamaProvider`]**: a local Ollama instance's `/api/embed`.
//! - **`LocalProvider`**: fastembed ONNX models, behind the
//!   `local-embeddings-fastembed` feature.
//!
//! HTTP providers run every batch through [`with_retry`] so transient
//! failures back off and permanent ones surface at once.
//!
//! ```rust,no_run
//! # use chat_recall::config::EmbeddingConfig;
//! # use chat_recall::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "disabled"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "disabled");
//! ```

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chat_recall_core::embedding::{EmbeddingProvider, HashingProvider};
use chat_recall_core::error::ProviderError;

use crate::config::EmbeddingConfig;
use crate::retry::{classify_reqwest, classify_status, with_retry, RetryPolicy};

/// Dimensionality of the hashing provider when `embedding.dims` is unset.
pub const DEFAULT_HASH_DIMS: usize = 256;

/// Build the configured provider.
///
/// # Errors
///
/// Unknown provider names, missing model or dims, a missing API key, or
/// `local` without the fastembed feature.
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledProvider)),
        "hash" => Ok(Arc::new(HashingProvider::new(
            config.dims.unwrap_or(DEFAULT_HASH_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => bail!("Local embedding provider requires --features local-embeddings-fastembed"),
        other => bail!("Unknown embedding provider: {}", other),
    }
}

fn retry_policy(config: &EmbeddingConfig) -> RetryPolicy {
    RetryPolicy::new(config.max_retries, config.backoff_base_ms, config.timeout_secs)
}

/// Every vector must match the configured dimensionality.
fn check_dims(label: &str, expected: usize, inputs: usize, vectors: &[Vec<f32>]) -> Result<(), ProviderError> {
    if vectors.len() != inputs {
        return Err(ProviderError::Permanent(format!(
            "{} returned {} embeddings for {} inputs",
            label,
            vectors.len(),
            inputs
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
        return Err(ProviderError::Permanent(format!(
            "{} returned {}-dimensional vectors, expected {}",
            label,
            bad.len(),
            expected
        )));
    }
    Ok(())
}

// ============ Disabled Provider ============

pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::Permanent(
            "embedding provider is disabled; set [embedding].provider".to_string(),
        ))
    }
}

// ============ OpenAI Provider ============

/// OpenAI (or compatible gateway) embeddings.
pub struct OpenAIProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    api_key: String,
    retry: RetryPolicy,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());

        Ok(Self {
            client: reqwest::Client::builder().build()?,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            api_key,
            retry: retry_policy(config),
        })
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
            "dimensions": self.dims,
        });
        let response = self
            .client
            .post(format!("{}/embeddings", self.url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_reqwest("OpenAI", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("OpenAI", status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest("OpenAI", e))?;
        parse_openai_response(&json)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = with_retry(&self.retry, "OpenAI", || self.embed_once(texts)).await?;
        check_dims("OpenAI", self.dims, texts.len(), &vectors)?;
        Ok(vectors)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::Permanent("Invalid OpenAI response: missing data array".into()))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| ProviderError::Permanent("Invalid OpenAI response: missing embedding".into()))?;
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        indexed.push((index, to_f32(embedding)));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn to_f32(values: &[serde_json::Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

// ============ Ollama Provider ============

pub struct OllamaProvider {
    client: reqwest::Client,
    model: String,
    dims: usize,
    url: String,
    retry: RetryPolicy,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| anyhow::anyhow!("embedding.dims required for Ollama provider"))?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| "http://localhost:11434".to_string());

        Ok(Self {
            client: reqwest::Client::builder().build()?,
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            retry: retry_policy(config),
        })
    }

    async fn embed_once(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let response = self
            .client
            .post(format!("{}/api/embed", self.url))
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                ProviderError::Transient(format!(
                    "Ollama connection error (is Ollama running at {}?): {}",
                    self.url, e
                ))
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status("Ollama", status, &text));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| classify_reqwest("Ollama", e))?;
        parse_ollama_response(&json)
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let vectors = with_retry(&self.retry, "Ollama", || self.embed_once(texts)).await?;
        check_dims("Ollama", self.dims, texts.len(), &vectors)?;
        Ok(vectors)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::Permanent("Invalid Ollama response: missing embeddings array".into()))?;

    embeddings
        .iter()
        .map(|e| {
            e.as_array().map(|values| to_f32(values)).ok_or_else(|| {
                ProviderError::Permanent("Invalid Ollama response: embedding is not an array".into())
            })
        })
        .collect()
}

// ============ Local Provider (fastembed) ============

#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model_name: String,
    dims: usize,
    model: Arc<std::sync::Mutex<Option<fastembed::TextEmbedding>>>,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "multilingual-e5-small".to_string());
        fastembed_model(&model_name)?;
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "multilingual-e5-base" => 768,
            "multilingual-e5-large" => 1024,
            _ => 384,
        });
        Ok(Self {
            model_name,
            dims,
            model: Arc::new(std::sync::Mutex::new(None)),
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        other => bail!(
            "Unknown local embedding model: '{}'. Supported models: \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large, \
             all-minilm-l6-v2, bge-small-en-v1.5",
            other
        ),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let name = self.model_name.clone();
        let slot = Arc::clone(&self.model);
        let texts = texts.to_vec();
        let inputs = texts.len();

        let vectors = tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| ProviderError::Permanent("local model lock poisoned".into()))?;
            if guard.is_none() {
                let kind = fastembed_model(&name).map_err(|e| ProviderError::Permanent(e.to_string()))?;
                let model = fastembed::TextEmbedding::try_new(
                    fastembed::InitOptions::new(kind).with_show_download_progress(true),
                )
                .map_err(|e| ProviderError::Permanent(format!("Failed to initialize local model: {}", e)))?;
                *guard = Some(model);
            }
            match guard.as_mut() {
                Some(model) => model
                    .embed(texts, None)
                    .map_err(|e| ProviderError::Permanent(format!("Local embedding failed: {}", e))),
                None => Err(ProviderError::Permanent("local model unavailable".into())),
            }
        })
        .await
        .map_err(|e| ProviderError::Permanent(format!("local embedding task failed: {}", e)))??;

        check_dims("local", self.dims, inputs, &vectors)?;
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_disabled_and_hash() {
        let config = EmbeddingConfig::default();
        assert_eq!(create_provider(&config).unwrap().model_name(), "disabled");

        let config = EmbeddingConfig {
            provider: "hash".into(),
            dims: Some(64),
            ..EmbeddingConfig::default()
        };
        let p = create_provider(&config).unwrap();
        assert_eq!(p.model_name(), "hash");
        assert_eq!(p.dims(), 64);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = EmbeddingConfig {
            provider: "mystery".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_provider(&config).is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_fails_permanently() {
        let err = DisabledProvider.embed(&["x".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_openai_response_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let v = parse_openai_response(&json).unwrap();
        assert_eq!(v, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.5]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.5]]);
        assert!(parse_ollama_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_check_dims() {
        assert!(check_dims("t", 2, 1, &[vec![1.0, 0.0]]).is_ok());
        assert!(check_dims("t", 3, 1, &[vec![1.0, 0.0]]).is_err());
        assert!(check_dims("t", 2, 2, &[vec![1.0, 0.0]]).is_err());
    }
}
