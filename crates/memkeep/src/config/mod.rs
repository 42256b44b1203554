use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{MemkeepError, Result};

/// Environment variable overriding `storage.root`
pub const ENV_STORE_PATH: &str = "MEMKEEP_STORE_PATH";
/// Environment variable that switches to cloud mode with the given vector store URL
pub const ENV_VECTOR_URL: &str = "MEMKEEP_VECTOR_URL";

/// Main configuration structure for memkeep
///
/// The configuration is injected explicitly into the engine at startup; it
/// decides which metadata, vector and lexical backends are active.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Storage root and backend selection
    #[serde(default)]
    pub storage: StorageConfig,
    /// Dense embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Model-backed classifier configuration
    #[serde(default)]
    pub classifier: ClassifierConfig,
    /// Index write timeouts, retries and reconciliation
    #[serde(default)]
    pub indexing: IndexingConfig,
    /// Hybrid retrieval tunables
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Relation graph tunables
    #[serde(default)]
    pub graph: GraphConfig,
    /// Confidence decay profiles
    #[serde(default)]
    pub decay: DecayConfig,
    /// Reflection cycle configuration
    #[serde(default)]
    pub reflection: ReflectionConfig,
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from an explicit path, or the first default location
    /// that exists, then apply environment overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => {
                tracing::info!("Loading config from: {}", path.display());
                Self::from_file(path)?
            }
            None => {
                let default_paths = [
                    dirs::home_dir().map(|h| h.join(".memkeep").join("config.toml")),
                    dirs::config_dir().map(|c| c.join("memkeep").join("config.toml")),
                    Some(PathBuf::from("config.toml")),
                ];

                match default_paths.iter().flatten().find(|p| p.exists()) {
                    Some(path) => {
                        tracing::info!("Loading config from: {}", path.display());
                        Self::from_file(path)?
                    }
                    None => {
                        tracing::info!("No config file found, using defaults");
                        Config::default()
                    }
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemkeepError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        toml::from_str(&content)
            .map_err(|e| MemkeepError::Config(format!("Failed to parse config: {e}")))
    }

    /// Apply environment-style overrides using the given lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup(ENV_STORE_PATH).filter(|v| !v.trim().is_empty()) {
            self.storage.root = PathBuf::from(root);
        }
        if let Some(url) = lookup(ENV_VECTOR_URL).filter(|v| !v.trim().is_empty()) {
            self.storage.mode = StorageMode::Cloud;
            self.storage.cloud.url = url;
        }
    }

    /// Reject tunables outside their meaningful range.
    pub fn validate(&self) -> Result<()> {
        if self.retrieval.rrf_k <= 0.0 {
            return Err(MemkeepError::Config("retrieval.rrf_k must be positive".into()));
        }
        if self.retrieval.candidate_multiplier == 0 {
            return Err(MemkeepError::Config(
                "retrieval.candidate_multiplier must be at least 1".into(),
            ));
        }
        if self.retrieval.prime_limit == 0 {
            return Err(MemkeepError::Config("retrieval.prime_limit must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.retrieval.prime_min_relevance) {
            return Err(MemkeepError::Config(
                "retrieval.prime_min_relevance must be within 0.0..=1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retrieval.recency_max_boost) {
            return Err(MemkeepError::Config(
                "retrieval.recency_max_boost must be within 0.0..=1.0".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.graph.contradiction_penalty) {
            return Err(MemkeepError::Config(
                "graph.contradiction_penalty must be within 0..=100".into(),
            ));
        }
        if !(20.0..=50.0).contains(&self.graph.contradiction_penalty) {
            tracing::warn!(
                penalty = self.graph.contradiction_penalty,
                "graph.contradiction_penalty is outside the recommended 20..=50 range"
            );
        }
        if !(0.0..=100.0).contains(&self.decay.min_confidence)
            || !(0.0..=100.0).contains(&self.decay.resurrect_confidence)
        {
            return Err(MemkeepError::Config(
                "decay confidence values must be within 0..=100".into(),
            ));
        }
        if self.decay.ephemeral_hours <= 0.0
            || self.decay.session_days <= 0.0
            || self.decay.durable_days <= 0.0
        {
            return Err(MemkeepError::Config("decay half-lives must be positive".into()));
        }
        if self.reflection.batch_size == 0 {
            return Err(MemkeepError::Config(
                "reflection.batch_size must be at least 1".into(),
            ));
        }
        if self.embedding.dimensions == 0 {
            return Err(MemkeepError::Config(
                "embedding.dimensions must be at least 1".into(),
            ));
        }
        if self.storage.mode == StorageMode::Cloud {
            parse_url("storage.cloud.url", &self.storage.cloud.url)?;
        }
        if !self.classifier.api_url.is_empty() {
            parse_url("classifier.api_url", &self.classifier.api_url)?;
        }
        if self.embedding.provider == EmbeddingProvider::Remote {
            parse_url("embedding.api_url", &self.embedding.api_url)?;
        }
        Ok(())
    }
}

fn parse_url(field: &str, value: &str) -> Result<url::Url> {
    url::Url::parse(value)
        .map_err(|e| MemkeepError::Config(format!("{field} is not a valid URL ({value}): {e}")))
}

fn secret_from_env(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

/// Which retrieval index backends are active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// LanceDB vectors under the storage root
    #[default]
    Local,
    /// Remote Qdrant collection for vectors
    Cloud,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Local => "local",
            StorageMode::Cloud => "cloud",
        }
    }
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for the metadata store and local indices
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Local or cloud vector index
    #[serde(default)]
    pub mode: StorageMode,
    /// Remote vector store settings, used in cloud mode
    #[serde(default)]
    pub cloud: CloudConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            mode: StorageMode::default(),
            cloud: CloudConfig::default(),
        }
    }
}

impl StorageConfig {
    /// Path of the metadata store file
    pub fn metadata_path(&self) -> PathBuf {
        self.root.join("memkeep.db")
    }

    /// Path of the lexical index file
    pub fn lexical_path(&self) -> PathBuf {
        self.root.join("index").join("lexical.db")
    }

    /// Directory of the local vector index
    pub fn vector_dir(&self) -> PathBuf {
        self.root.join("index").join("vectors")
    }
}

fn default_root() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".memkeep"))
        .unwrap_or_else(|| PathBuf::from(".memkeep"))
}

/// Remote vector store configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CloudConfig {
    /// Qdrant endpoint URL
    #[serde(default)]
    pub url: String,
    /// Environment variable name for the API key
    #[serde(default = "default_cloud_api_key_env")]
    pub api_key_env: String,
    /// Collection holding memory vectors
    #[serde(default = "default_collection")]
    pub collection: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key_env: default_cloud_api_key_env(),
            collection: default_collection(),
        }
    }
}

impl CloudConfig {
    /// API key read from the configured environment variable
    pub fn api_key(&self) -> Option<String> {
        secret_from_env(&self.api_key_env)
    }
}

fn default_cloud_api_key_env() -> String {
    "QDRANT_API_KEY".to_string()
}

fn default_collection() -> String {
    "memkeep_memories".to_string()
}

/// Embedding backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Local ONNX model through fastembed
    #[default]
    Fastembed,
    /// OpenAI-compatible embeddings endpoint
    Remote,
    /// Deterministic feature hashing, no model download
    Hashing,
}

/// Embedding model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProvider,
    /// Model identifier for the remote provider
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Embedding dimension size
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
    /// Remote embeddings endpoint
    #[serde(default)]
    pub api_url: String,
    /// Environment variable name for the remote API key
    #[serde(default = "default_embedding_api_key_env")]
    pub api_key_env: String,
    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProvider::default(),
            model: default_embedding_model(),
            dimensions: default_embedding_dimensions(),
            api_url: String::new(),
            api_key_env: default_embedding_api_key_env(),
            timeout_secs: default_embedding_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn api_key(&self) -> Option<String> {
        secret_from_env(&self.api_key_env)
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_embedding_dimensions() -> usize {
    384
}

fn default_embedding_api_key_env() -> String {
    "MEMKEEP_EMBEDDING_KEY".to_string()
}

fn default_embedding_timeout_secs() -> u64 {
    15
}

/// Model-backed classifier configuration
///
/// The model stage is enabled only when `api_url` is set and the key in
/// `api_key_env` is present; otherwise the heuristic classifier is used.
#[derive(Debug, Clone, Deserialize)]
pub struct ClassifierConfig {
    /// OpenAI-compatible chat completions endpoint
    #[serde(default = "default_classifier_api_url")]
    pub api_url: String,
    /// Environment variable name for API key
    #[serde(default = "default_classifier_api_key_env")]
    pub api_key_env: String,
    /// Model identifier
    #[serde(default = "default_classifier_model")]
    pub model: String,
    /// Per-call timeout in seconds
    #[serde(default = "default_classifier_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries on transient API failures
    #[serde(default = "default_classifier_max_retries")]
    pub max_retries: u32,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_url: default_classifier_api_url(),
            api_key_env: default_classifier_api_key_env(),
            model: default_classifier_model(),
            timeout_secs: default_classifier_timeout_secs(),
            max_retries: default_classifier_max_retries(),
        }
    }
}

impl ClassifierConfig {
    pub fn api_key(&self) -> Option<String> {
        secret_from_env(&self.api_key_env)
    }
}

fn default_classifier_api_url() -> String {
    "https://api.openai.com/v1/chat/completions".to_string()
}

fn default_classifier_api_key_env() -> String {
    "MEMKEEP_CLASSIFIER_KEY".to_string()
}

fn default_classifier_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_classifier_timeout_secs() -> u64 {
    10
}

fn default_classifier_max_retries() -> u32 {
    2
}

/// Index write and reconciliation configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IndexingConfig {
    /// Timeout for a single embedding or index write, in seconds
    #[serde(default = "default_indexing_timeout_secs")]
    pub timeout_secs: u64,
    /// Attempts per phase before reporting lag
    #[serde(default = "default_indexing_max_attempts")]
    pub max_attempts: u32,
    /// Initial backoff between attempts, doubled each retry
    #[serde(default = "default_indexing_backoff_ms")]
    pub backoff_ms: u64,
    /// Interval of the background reconciliation job, in seconds (0 disables)
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Records processed per reconciliation pass
    #[serde(default = "default_reconcile_batch")]
    pub reconcile_batch: usize,
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_indexing_timeout_secs(),
            max_attempts: default_indexing_max_attempts(),
            backoff_ms: default_indexing_backoff_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_batch: default_reconcile_batch(),
        }
    }
}

fn default_indexing_timeout_secs() -> u64 {
    15
}

fn default_indexing_max_attempts() -> u32 {
    3
}

fn default_indexing_backoff_ms() -> u64 {
    250
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_reconcile_batch() -> usize {
    50
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalConfig {
    /// Reciprocal rank fusion constant
    #[serde(default = "default_rrf_k")]
    pub rrf_k: f64,
    /// Candidates fetched per list, as a multiple of the requested limit
    #[serde(default = "default_candidate_multiplier")]
    pub candidate_multiplier: usize,
    /// Lower bound on candidates fetched per list
    #[serde(default = "default_min_candidates")]
    pub min_candidates: usize,
    /// Memories younger than this get a recency boost
    #[serde(default = "default_recency_window_hours")]
    pub recency_window_hours: f64,
    /// Maximum multiplicative recency boost (0.2 = +20%)
    #[serde(default = "default_recency_max_boost")]
    pub recency_max_boost: f64,
    /// Record an access for every returned memory
    #[serde(default = "default_touch_on_read")]
    pub touch_on_read: bool,
    /// Limit used when the caller gives none
    #[serde(default = "default_limit")]
    pub default_limit: usize,
    /// Cached query embeddings
    #[serde(default = "default_query_cache_size")]
    pub query_cache_size: usize,
    /// Memories surfaced by proactive recall
    #[serde(default = "default_prime_limit")]
    pub prime_limit: usize,
    /// Relevance below which proactive recall drops a memory, in `[0, 1]`
    #[serde(default = "default_prime_min_relevance")]
    pub prime_min_relevance: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: default_rrf_k(),
            candidate_multiplier: default_candidate_multiplier(),
            min_candidates: default_min_candidates(),
            recency_window_hours: default_recency_window_hours(),
            recency_max_boost: default_recency_max_boost(),
            touch_on_read: default_touch_on_read(),
            default_limit: default_limit(),
            query_cache_size: default_query_cache_size(),
            prime_limit: default_prime_limit(),
            prime_min_relevance: default_prime_min_relevance(),
        }
    }
}

fn default_rrf_k() -> f64 {
    60.0
}

fn default_candidate_multiplier() -> usize {
    3
}

fn default_min_candidates() -> usize {
    20
}

fn default_recency_window_hours() -> f64 {
    48.0
}

fn default_recency_max_boost() -> f64 {
    0.2
}

fn default_touch_on_read() -> bool {
    true
}

fn default_limit() -> usize {
    10
}

fn default_query_cache_size() -> usize {
    256
}

fn default_prime_limit() -> usize {
    3
}

fn default_prime_min_relevance() -> f64 {
    0.3
}

/// Relation graph configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GraphConfig {
    /// Cosine similarity at or above which RELATED_TO is created
    #[serde(default = "default_related_threshold")]
    pub related_threshold: f32,
    /// Dense neighbors inspected per write
    #[serde(default = "default_related_candidates")]
    pub related_candidates: usize,
    /// Minimum similarity for a correction to target its nearest neighbor
    #[serde(default = "default_correction_threshold")]
    pub correction_threshold: f32,
    /// Minimum similarity before two claims are checked for opposition
    #[serde(default = "default_opposition_threshold")]
    pub opposition_threshold: f32,
    /// Confidence points removed from a contradicted memory
    #[serde(default = "default_contradiction_penalty")]
    pub contradiction_penalty: f64,
    /// Memories sharing a person or project that get auto-linked
    #[serde(default = "default_label_link_limit")]
    pub label_link_limit: usize,
    /// How far back a continuation may reach for its commitment, in days
    #[serde(default = "default_follows_window_days")]
    pub follows_window_days: i64,
    /// Upper bound on traversal depth
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    /// Similarity above which a save reports a possible duplicate
    #[serde(default = "default_duplicate_threshold")]
    pub duplicate_threshold: f32,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            related_threshold: default_related_threshold(),
            related_candidates: default_related_candidates(),
            correction_threshold: default_correction_threshold(),
            opposition_threshold: default_opposition_threshold(),
            contradiction_penalty: default_contradiction_penalty(),
            label_link_limit: default_label_link_limit(),
            follows_window_days: default_follows_window_days(),
            max_depth: default_max_depth(),
            duplicate_threshold: default_duplicate_threshold(),
        }
    }
}

fn default_related_threshold() -> f32 {
    0.75
}

fn default_related_candidates() -> usize {
    10
}

fn default_correction_threshold() -> f32 {
    0.5
}

fn default_opposition_threshold() -> f32 {
    0.8
}

fn default_contradiction_penalty() -> f64 {
    30.0
}

fn default_label_link_limit() -> usize {
    20
}

fn default_follows_window_days() -> i64 {
    14
}

fn default_max_depth() -> usize {
    3
}

fn default_duplicate_threshold() -> f32 {
    0.95
}

/// Half-life profiles and archive policy
#[derive(Debug, Clone, Deserialize)]
pub struct DecayConfig {
    #[serde(default = "default_ephemeral_hours")]
    pub ephemeral_hours: f64,
    #[serde(default = "default_session_days")]
    pub session_days: f64,
    #[serde(default = "default_durable_days")]
    pub durable_days: f64,
    /// Memories decaying below this confidence are archived
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    /// Un-archive memories when an access hit reaches them
    #[serde(default)]
    pub resurrect_on_access: bool,
    /// Confidence assigned to a resurrected memory
    #[serde(default = "default_resurrect_confidence")]
    pub resurrect_confidence: f64,
}

impl Default for DecayConfig {
    fn default() -> Self {
        Self {
            ephemeral_hours: default_ephemeral_hours(),
            session_days: default_session_days(),
            durable_days: default_durable_days(),
            min_confidence: default_min_confidence(),
            resurrect_on_access: false,
            resurrect_confidence: default_resurrect_confidence(),
        }
    }
}

fn default_ephemeral_hours() -> f64 {
    24.0
}

fn default_session_days() -> f64 {
    7.0
}

fn default_durable_days() -> f64 {
    90.0
}

fn default_min_confidence() -> f64 {
    10.0
}

fn default_resurrect_confidence() -> f64 {
    30.0
}

/// Reflection cycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ReflectionConfig {
    /// Memories processed per committed batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Periodic reflection interval in minutes; on demand only when unset
    #[serde(default)]
    pub interval_minutes: Option<u64>,
    /// Journal entries older than this are consolidated
    #[serde(default = "default_journal_max_age_days")]
    pub journal_max_age_days: i64,
    /// Minimum confidence for identity synthesis
    #[serde(default = "default_identity_min_confidence")]
    pub identity_min_confidence: f64,
    /// Memories listed per gate section of the identity document
    #[serde(default = "default_identity_max_per_gate")]
    pub identity_max_per_gate: usize,
}

impl Default for ReflectionConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            interval_minutes: None,
            journal_max_age_days: default_journal_max_age_days(),
            identity_min_confidence: default_identity_min_confidence(),
            identity_max_per_gate: default_identity_max_per_gate(),
        }
    }
}

fn default_batch_size() -> usize {
    100
}

fn default_journal_max_age_days() -> i64 {
    14
}

fn default_identity_min_confidence() -> f64 {
    70.0
}

fn default_identity_max_per_gate() -> usize {
    8
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:7373")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:7373".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}
