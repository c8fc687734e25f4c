use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub evidence: EvidenceConfig,
    #[serde(default)]
    pub composer: ComposerConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/evh.sqlite")
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_retrieval_limit")]
    pub default_limit: usize,
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: default_retrieval_limit(),
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_retrieval_limit() -> usize {
    8
}
fn default_cache_ttl_secs() -> u64 {
    300
}

/// Guardrail settings shared by every pipeline entry point: per-requester
/// rate limits, per-endpoint circuit breakers, and operation timeouts.
#[derive(Debug, Deserialize, Clone)]
pub struct SecurityConfig {
    #[serde(default = "default_rate_limit_max")]
    pub rate_limit_max: u32,
    #[serde(default = "default_rate_limit_window_secs")]
    pub rate_limit_window_secs: u64,
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
    #[serde(default = "default_retrieval_timeout_secs")]
    pub retrieval_timeout_secs: u64,
    #[serde(default = "default_composition_timeout_secs")]
    pub composition_timeout_secs: u64,
    #[serde(default = "default_evidence_timeout_secs")]
    pub evidence_timeout_secs: u64,
    #[serde(default = "default_rules_timeout_secs")]
    pub rules_timeout_secs: u64,
    #[serde(default = "default_max_input_tokens")]
    pub max_input_tokens: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_max: default_rate_limit_max(),
            rate_limit_window_secs: default_rate_limit_window_secs(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            retrieval_timeout_secs: default_retrieval_timeout_secs(),
            composition_timeout_secs: default_composition_timeout_secs(),
            evidence_timeout_secs: default_evidence_timeout_secs(),
            rules_timeout_secs: default_rules_timeout_secs(),
            max_input_tokens: default_max_input_tokens(),
        }
    }
}

fn default_rate_limit_max() -> u32 {
    30
}
fn default_rate_limit_window_secs() -> u64 {
    60
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_secs() -> u64 {
    300
}
fn default_retrieval_timeout_secs() -> u64 {
    8
}
fn default_composition_timeout_secs() -> u64 {
    10
}
fn default_evidence_timeout_secs() -> u64 {
    5
}
fn default_rules_timeout_secs() -> u64 {
    3
}
fn default_max_input_tokens() -> usize {
    1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_model_base_url(),
            model: None,
            api_key_env: default_api_key_env(),
            max_retries: default_max_retries(),
            timeout_secs: default_model_timeout_secs(),
            temperature: default_temperature(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_model_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_model_timeout_secs() -> u64 {
    30
}
fn default_temperature() -> f64 {
    0.2
}

impl ModelConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct EvidenceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_evidence_base_url")]
    pub base_url: String,
    #[serde(default = "default_evidence_limit")]
    pub default_limit: usize,
    #[serde(default = "default_evidence_max_ids")]
    pub max_ids: usize,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_evidence_base_url(),
            default_limit: default_evidence_limit(),
            max_ids: default_evidence_max_ids(),
        }
    }
}

fn default_evidence_base_url() -> String {
    "https://eutils.ncbi.nlm.nih.gov/entrez/eutils".to_string()
}
fn default_evidence_limit() -> usize {
    3
}
fn default_evidence_max_ids() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ComposerConfig {
    #[serde(default = "default_min_citations")]
    pub min_citations: usize,
    #[serde(default = "default_fallback_confidence")]
    pub fallback_confidence: f64,
    #[serde(default = "default_max_prompt_tokens")]
    pub max_prompt_tokens: usize,
    #[serde(default = "default_max_context_passages")]
    pub max_context_passages: usize,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            min_citations: default_min_citations(),
            fallback_confidence: default_fallback_confidence(),
            max_prompt_tokens: default_max_prompt_tokens(),
            max_context_passages: default_max_context_passages(),
            system_prompt: default_system_prompt(),
        }
    }
}

fn default_min_citations() -> usize {
    2
}
fn default_fallback_confidence() -> f64 {
    0.1
}
fn default_max_prompt_tokens() -> usize {
    3000
}
fn default_max_context_passages() -> usize {
    6
}
fn default_system_prompt() -> String {
    "You are a clinical tutor for pediatric emergency simulation training. \
     Answer only from the provided case passages."
        .to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7878".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate retrieval
    if config.retrieval.default_limit == 0 {
        anyhow::bail!("retrieval.default_limit must be >= 1");
    }

    // Validate security
    if config.security.rate_limit_max == 0 {
        anyhow::bail!("security.rate_limit_max must be >= 1");
    }
    if config.security.rate_limit_window_secs == 0 {
        anyhow::bail!("security.rate_limit_window_secs must be >= 1");
    }
    if config.security.breaker_failure_threshold == 0 {
        anyhow::bail!("security.breaker_failure_threshold must be >= 1");
    }
    if config.security.max_input_tokens == 0 {
        anyhow::bail!("security.max_input_tokens must be >= 1");
    }

    // Validate model
    if config.model.is_enabled() && config.model.model.is_none() {
        anyhow::bail!(
            "model.model must be specified when provider is '{}'",
            config.model.provider
        );
    }

    match config.model.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown model provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if !(0.0..=2.0).contains(&config.model.temperature) {
        anyhow::bail!("model.temperature must be in [0.0, 2.0]");
    }

    // Validate composer
    if config.composer.min_citations == 0 {
        anyhow::bail!("composer.min_citations must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.composer.fallback_confidence) {
        anyhow::bail!("composer.fallback_confidence must be in [0.0, 1.0]");
    }

    // Validate evidence
    if config.evidence.enabled && config.evidence.max_ids == 0 {
        anyhow::bail!("evidence.max_ids must be >= 1 when evidence is enabled");
    }

    Ok(config)
}
