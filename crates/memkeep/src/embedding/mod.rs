//! Text embedding backends
//!
//! The default backend runs a local ONNX model through fastembed. A remote
//! OpenAI-compatible endpoint and a deterministic hashing embedder (used in
//! tests and when no model can be downloaded) implement the same trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{EmbeddingConfig, EmbeddingProvider};
use crate::error::{MemkeepError, Result};
use crate::storage::lexical::tokenize;

/// Output dimension of the bundled fastembed model
pub const FASTEMBED_DIMENSIONS: usize = 384;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn dimensions(&self) -> usize;

    fn name(&self) -> &'static str;
}

/// Build the embedder selected by configuration
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Arc<dyn Embedder>> {
    match config.provider {
        EmbeddingProvider::Fastembed => {
            if config.dimensions != FASTEMBED_DIMENSIONS {
                return Err(MemkeepError::Config(format!(
                    "fastembed produces {FASTEMBED_DIMENSIONS} dimensions, configured {}",
                    config.dimensions
                )));
            }
            Ok(Arc::new(FastEmbedder::new()?))
        }
        EmbeddingProvider::Remote => Ok(Arc::new(RemoteEmbedder::new(config)?)),
        EmbeddingProvider::Hashing => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
    }
}

/// Local multilingual E5 model
pub struct FastEmbedder {
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedder {
    pub fn new() -> Result<Self> {
        info!("Loading fastembed model (MultilingualE5Small)");
        let model = TextEmbedding::try_new(InitOptions::new(FastEmbedModel::MultilingualE5Small))
            .map_err(|e| MemkeepError::Embedding(e.to_string()))?;
        Ok(Self {
            model: Arc::new(Mutex::new(model)),
        })
    }
}

#[async_trait]
impl Embedder for FastEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = Arc::clone(&self.model);
        let text = text.to_string();
        let embeddings = tokio::task::spawn_blocking(move || {
            let mut model = model.lock();
            model.embed(vec![text], None)
        })
        .await
        .map_err(|e| MemkeepError::Embedding(format!("Embedding task failed: {e}")))?
        .map_err(|e| MemkeepError::Embedding(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| MemkeepError::Embedding("No embedding returned".to_string()))
    }

    fn dimensions(&self) -> usize {
        FASTEMBED_DIMENSIONS
    }

    fn name(&self) -> &'static str {
        "fastembed"
    }
}

/// OpenAI-compatible `/embeddings` client
pub struct RemoteEmbedder {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    dimensions: usize,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

impl RemoteEmbedder {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        Self::with_api_key(config, config.api_key())
    }

    pub fn with_api_key(config: &EmbeddingConfig, api_key: Option<String>) -> Result<Self> {
        if config.api_url.is_empty() {
            return Err(MemkeepError::Config(
                "embedding.api_url is required for the remote provider".to_string(),
            ));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| MemkeepError::Embedding(e.to_string()))?;
        info!(
            "RemoteEmbedder initialized with model: {}, api_url: {}",
            config.model, config.api_url
        );
        Ok(Self {
            client,
            api_url: config.api_url.clone(),
            api_key,
            model: config.model.clone(),
            dimensions: config.dimensions,
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        debug!("Requesting embedding from {}", self.api_url);
        let mut request = self.client.post(&self.api_url).json(&EmbeddingRequest {
            model: &self.model,
            input: text,
        });
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| MemkeepError::Embedding(format!("Embedding request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(MemkeepError::Embedding(format!(
                "Embedding API returned {status}: {body}"
            )));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| MemkeepError::Embedding(format!("Invalid embedding response: {e}")))?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| MemkeepError::Embedding("No embedding returned".to_string()))?;

        if embedding.len() != self.dimensions {
            return Err(MemkeepError::Embedding(format!(
                "Expected {} dimensions, got {}",
                self.dimensions,
                embedding.len()
            )));
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Deterministic signed feature hashing over index terms.
///
/// Texts sharing terms land close together; no model is needed.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimensions: usize,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_sync(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        for term in tokenize(text) {
            let hash = fnv1a(term.as_bytes());
            let slot = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[slot] += sign;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed_sync(text))
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn name(&self) -> &'static str {
        "hashing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::vector::cosine_similarity;

    mod hashing {
        use super::*;

        #[tokio::test]
        async fn test_deterministic_and_normalized() {
            let embedder = HashingEmbedder::new(64);
            let a = embedder.embed("user prefers dark mode").await.unwrap();
            let b = embedder.embed("user prefers dark mode").await.unwrap();
            assert_eq!(a, b);
            assert_eq!(a.len(), 64);
            let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }

        #[tokio::test]
        async fn test_shared_terms_are_closer() {
            let embedder = HashingEmbedder::new(256);
            let q = embedder.embed("dark mode").await.unwrap();
            let near = embedder.embed("user prefers dark mode").await.unwrap();
            let far = embedder.embed("deploy happens friday").await.unwrap();
            assert!(cosine_similarity(&q, &near) > cosine_similarity(&q, &far));
        }

        #[tokio::test]
        async fn test_empty_text_is_zero_vector() {
            let embedder = HashingEmbedder::new(16);
            let v = embedder.embed("the a of").await.unwrap();
            assert!(v.iter().all(|x| *x == 0.0));
        }
    }

    mod remote {
        use super::*;
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        fn config(api_url: String, dimensions: usize) -> EmbeddingConfig {
            EmbeddingConfig {
                provider: EmbeddingProvider::Remote,
                api_url,
                dimensions,
                ..Default::default()
            }
        }

        #[tokio::test]
        async fn test_remote_embedding() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1/embeddings"))
                .and(header("Authorization", "Bearer test-key"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "data": [{ "embedding": [0.1, 0.2, 0.3] }]
                })))
                .mount(&server)
                .await;

            let embedder = RemoteEmbedder::with_api_key(
                &config(format!("{}/v1/embeddings", server.uri()), 3),
                Some("test-key".to_string()),
            )
            .unwrap();
            let v = embedder.embed("hello").await.unwrap();
            assert_eq!(v, vec![0.1, 0.2, 0.3]);
        }

        #[tokio::test]
        async fn test_remote_dimension_mismatch() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "data": [{ "embedding": [0.1, 0.2] }]
                })))
                .mount(&server)
                .await;

            let embedder =
                RemoteEmbedder::with_api_key(&config(server.uri(), 3), None).unwrap();
            assert!(embedder.embed("hello").await.is_err());
        }

        #[tokio::test]
        async fn test_remote_server_error() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
                .mount(&server)
                .await;

            let embedder =
                RemoteEmbedder::with_api_key(&config(server.uri(), 3), None).unwrap();
            let err = embedder.embed("hello").await.unwrap_err();
            assert_eq!(err.kind(), "embedding_error");
        }

        #[test]
        fn test_remote_requires_url() {
            assert!(RemoteEmbedder::with_api_key(&config(String::new(), 3), None).is_err());
        }
    }

    #[cfg(feature = "ml-tests")]
    mod fastembed_model {
        use super::*;

        #[tokio::test]
        async fn test_similar_texts_have_high_similarity() {
            let embedder = FastEmbedder::new().expect("Failed to load model");
            let a = embedder.embed("The quick brown fox jumps over the lazy dog").await.unwrap();
            let b = embedder.embed("A fast brown fox leaps over a sleepy dog").await.unwrap();
            let c = embedder.embed("Quantum computing revolutionizes cryptography").await.unwrap();
            assert_eq!(a.len(), FASTEMBED_DIMENSIONS);
            assert!(cosine_similarity(&a, &b) > cosine_similarity(&a, &c));
        }
    }
}
