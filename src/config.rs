//! Configuration parsing and validation.
//!
//! Loaded from a TOML file (default `config/recall.toml`). Every section
//! except `[db]` is optional and every key has a default.

use anyhow::{Context, Result};
use chat_recall_core::chunk::ChunkPolicy;
use chat_recall_core::flip::{FlipPolicy, WindowPolicy};
use chat_recall_core::search::SearchParams;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reasoning: ReasoningConfig,
    #[serde(default)]
    pub flip: FlipConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
    #[serde(default)]
    pub aliases: AliasesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl DbConfig {
    /// Advisory lock file held by `index`/`reindex`.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_gap_secs")]
    pub max_gap_secs: i64,
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_gap_secs: default_max_gap_secs(),
            max_chars: default_max_chars(),
        }
    }
}

impl ChunkingConfig {
    pub fn policy(&self) -> ChunkPolicy {
        ChunkPolicy {
            max_gap_secs: self.max_gap_secs,
            max_chars: self.max_chars,
        }
    }
}

fn default_max_gap_secs() -> i64 {
    300
}
fn default_max_chars() -> usize {
    2000
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_half_life")]
    pub recency_half_life_days: f64,
    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,
    #[serde(default)]
    pub max_per_sender: usize,
    #[serde(default = "default_true")]
    pub exclude_forwards_for_speaker: bool,
    #[serde(default = "default_forward_penalty")]
    pub forward_penalty: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_k: default_candidate_k(),
            page_size: default_page_size(),
            max_results: default_max_results(),
            recency_half_life_days: default_half_life(),
            recency_weight: default_recency_weight(),
            max_per_sender: 0,
            exclude_forwards_for_speaker: true,
            forward_penalty: default_forward_penalty(),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> SearchParams {
        SearchParams {
            candidate_k: self.candidate_k,
            max_results: self.max_results,
            recency_half_life_days: self.recency_half_life_days,
            recency_weight: self.recency_weight,
            max_per_sender: self.max_per_sender,
            exclude_forwards_for_speaker: self.exclude_forwards_for_speaker,
            forward_penalty: self.forward_penalty,
            min_similarity: None,
        }
    }
}

fn default_candidate_k() -> usize {
    50
}
fn default_page_size() -> usize {
    5
}
fn default_max_results() -> usize {
    50
}
fn default_half_life() -> f64 {
    365.0
}
fn default_recency_weight() -> f64 {
    0.2
}
fn default_true() -> bool {
    true
}
fn default_forward_penalty() -> f64 {
    0.5
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, OpenAI-compatible gateways).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_concurrency() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_backoff_base_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReasoningConfig {
    #[serde(default = "default_reasoning_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_reasoning_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            provider: default_reasoning_provider(),
            model: None,
            url: None,
            timeout_secs: default_reasoning_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_reasoning_provider() -> String {
    "keyword".to_string()
}
fn default_reasoning_timeout() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct FlipConfig {
    #[serde(default = "default_window")]
    pub window: String,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_min_quotes")]
    pub min_quotes_per_window: usize,
    #[serde(default = "default_flip_candidate_k")]
    pub candidate_k: usize,
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f32,
}

impl Default for FlipConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            window_size: default_window_size(),
            min_quotes_per_window: default_min_quotes(),
            candidate_k: default_flip_candidate_k(),
            min_similarity: default_min_similarity(),
        }
    }
}

impl FlipConfig {
    pub fn policy(&self) -> FlipPolicy {
        FlipPolicy {
            window: match self.window.as_str() {
                "fixed" => WindowPolicy::Fixed(self.window_size),
                _ => WindowPolicy::Midpoint,
            },
            min_quotes_per_window: self.min_quotes_per_window,
            candidate_k: self.candidate_k,
            min_similarity: self.min_similarity,
        }
    }
}

fn default_window() -> String {
    "midpoint".to_string()
}
fn default_window_size() -> usize {
    3
}
fn default_min_quotes() -> usize {
    2
}
fn default_flip_candidate_k() -> usize {
    100
}
fn default_min_similarity() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct ConversationConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: i64,
    #[serde(default = "default_max_chains")]
    pub max_chains: usize,
    /// Mentions of these names (the bot's own handle) are ignored.
    #[serde(default)]
    pub bot_names: Vec<String>,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_chains: default_max_chains(),
            bot_names: Vec::new(),
        }
    }
}

fn default_ttl_secs() -> i64 {
    1800
}
fn default_max_chains() -> usize {
    50
}

/// `[aliases.seed]`: identity id → nicknames, applied with `alias seed`.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AliasesConfig {
    #[serde(default)]
    pub seed: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.max_chars == 0 {
        anyhow::bail!("chunking.max_chars must be > 0");
    }
    if config.chunking.max_gap_secs < 0 {
        anyhow::bail!("chunking.max_gap_secs must be >= 0");
    }

    // Validate retrieval
    let r = &config.retrieval;
    if r.page_size < 1 {
        anyhow::bail!("retrieval.page_size must be >= 1");
    }
    if r.candidate_k < 1 || r.max_results < 1 {
        anyhow::bail!("retrieval.candidate_k and retrieval.max_results must be >= 1");
    }
    if !(0.0..=1.0).contains(&r.recency_weight) {
        anyhow::bail!("retrieval.recency_weight must be in [0.0, 1.0]");
    }
    if r.recency_half_life_days <= 0.0 {
        anyhow::bail!("retrieval.recency_half_life_days must be > 0");
    }
    if !(0.0..=1.0).contains(&r.forward_penalty) {
        anyhow::bail!("retrieval.forward_penalty must be in [0.0, 1.0]");
    }

    // Validate embedding
    let e = &config.embedding;
    if e.concurrency < 1 {
        anyhow::bail!("embedding.concurrency must be >= 1");
    }
    match e.provider.as_str() {
        "disabled" | "hash" => {}
        "openai" | "ollama" | "local" => {
            if e.dims.is_none() || e.dims == Some(0) {
                anyhow::bail!("embedding.dims must be > 0 when provider is '{}'", e.provider);
            }
            if e.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    e.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, hash, openai, ollama, or local.",
            other
        ),
    }

    // Validate reasoning
    match config.reasoning.provider.as_str() {
        "keyword" | "disabled" => {}
        "openai" => {
            if config.reasoning.model.is_none() {
                anyhow::bail!("reasoning.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown reasoning provider: '{}'. Must be keyword, openai, or disabled.",
            other
        ),
    }

    // Validate flip
    match config.flip.window.as_str() {
        "midpoint" | "fixed" => {}
        other => anyhow::bail!("flip.window must be 'midpoint' or 'fixed', got '{}'", other),
    }
    if config.flip.min_quotes_per_window < 1 {
        anyhow::bail!("flip.min_quotes_per_window must be >= 1");
    }
    if config.flip.window == "fixed" && config.flip.window_size < 1 {
        anyhow::bail!("flip.window_size must be >= 1");
    }

    // Validate conversation
    if config.conversation.ttl_secs <= 0 {
        anyhow::bail!("conversation.ttl_secs must be > 0");
    }
    if config.conversation.max_chains < 1 {
        anyhow::bail!("conversation.max_chains must be >= 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = parse("[db]\npath = \"./data/recall.sqlite\"\n").unwrap();
        assert_eq!(config.chunking.max_gap_secs, 300);
        assert_eq!(config.retrieval.page_size, 5);
        assert_eq!(config.embedding.provider, "disabled");
        assert_eq!(config.embedding.concurrency, 4);
        assert_eq!(config.reasoning.provider, "keyword");
        assert_eq!(config.flip.min_quotes_per_window, 2);
        assert_eq!(config.conversation.ttl_secs, 1800);
        assert_eq!(config.logging.level, "info");
        assert_eq!(
            config.db.lock_path(),
            PathBuf::from("./data/recall.sqlite.lock")
        );
    }

    #[test]
    fn test_network_provider_requires_model_and_dims() {
        let err = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("embedding.dims"));
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\n").is_ok());
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\nrecency_weight = 1.5\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"nope\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[flip]\nwindow = \"sliding\"\n").is_err());
        assert!(parse("[db]\npath = \"x\"\n[retrieval]\npage_size = 0\n").is_err());
    }

    #[test]
    fn test_zero_retries_means_single_attempt() {
        let config =
            parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"hash\"\nmax_retries = 0\n").unwrap();
        assert_eq!(config.embedding.max_retries, 0);
    }

    #[test]
    fn test_alias_seed_table() {
        let config = parse(
            "[db]\npath = \"x\"\n[aliases.seed]\nuser1 = [\"гусь\", \"goose\"]\n",
        )
        .unwrap();
        assert_eq!(config.aliases.seed["user1"], vec!["гусь", "goose"]);
    }

    #[test]
    fn test_fixed_window_policy() {
        let config = parse("[db]\npath = \"x\"\n[flip]\nwindow = \"fixed\"\nwindow_size = 4\n").unwrap();
        assert_eq!(config.flip.policy().window, WindowPolicy::Fixed(4));
    }
}
