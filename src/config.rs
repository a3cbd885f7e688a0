use anyhow::{Context, Result};
use globset::Glob;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub vault: VaultConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub aggregate: AggregateConfig,
    #[serde(default)]
    pub ranking: RankingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Accept self-signed certificates. Never enabled implicitly.
    #[serde(default)]
    pub trust_self_signed: bool,
}

impl VaultConfig {
    /// API key from `VAULT_API_KEY`, falling back to the config file.
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var("VAULT_API_KEY")
            .ok()
            .filter(|k| !k.is_empty())
            .or_else(|| self.api_key.clone())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TransportConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    #[serde(default = "default_breaker_cooldown_ms")]
    pub breaker_cooldown_ms: u64,
    #[serde(default = "default_timeout_short_ms")]
    pub timeout_short_ms: u64,
    #[serde(default = "default_timeout_medium_ms")]
    pub timeout_medium_ms: u64,
    #[serde(default = "default_timeout_long_ms")]
    pub timeout_long_ms: u64,
    #[serde(default = "default_large_file_bytes")]
    pub large_file_bytes: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_ms: default_breaker_cooldown_ms(),
            timeout_short_ms: default_timeout_short_ms(),
            timeout_medium_ms: default_timeout_medium_ms(),
            timeout_long_ms: default_timeout_long_ms(),
            large_file_bytes: default_large_file_bytes(),
        }
    }
}

impl TransportConfig {
    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_millis(self.breaker_cooldown_ms)
    }
}

fn default_max_retries() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    200
}
fn default_backoff_max_ms() -> u64 {
    5_000
}
fn default_breaker_threshold() -> u32 {
    5
}
fn default_breaker_cooldown_ms() -> u64 {
    30_000
}
fn default_timeout_short_ms() -> u64 {
    3_000
}
fn default_timeout_medium_ms() -> u64 {
    10_000
}
fn default_timeout_long_ms() -> u64 {
    30_000
}
fn default_large_file_bytes() -> u64 {
    256 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
    #[serde(default)]
    pub max_entries: Option<usize>,
    #[serde(default)]
    pub disk_path: Option<PathBuf>,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl_secs(),
            max_entries: None,
            disk_path: None,
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

fn default_ttl_secs() -> u64 {
    300
}
fn default_sweep_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_exclude_globs")]
    pub exclude_globs: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            concurrency: default_concurrency(),
            exclude_globs: default_exclude_globs(),
        }
    }
}

fn default_max_depth() -> usize {
    16
}
fn default_concurrency() -> usize {
    8
}
fn default_exclude_globs() -> Vec<String> {
    vec![".obsidian/**".to_string(), ".trash/**".to_string()]
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default)]
    pub synonyms: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_filename_weight")]
    pub filename_weight: f64,
    #[serde(default = "default_content_weight")]
    pub content_weight: f64,
    #[serde(default = "default_true")]
    pub language_variants: bool,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            synonyms: BTreeMap::new(),
            filename_weight: default_filename_weight(),
            content_weight: default_content_weight(),
            language_variants: true,
        }
    }
}

fn default_filename_weight() -> f64 {
    2.0
}
fn default_content_weight() -> f64 {
    1.0
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct AggregateConfig {
    #[serde(default = "default_pass_cap")]
    pub filename_cap: usize,
    #[serde(default = "default_pass_cap")]
    pub path_cap: usize,
    #[serde(default = "default_content_cap")]
    pub content_cap: usize,
    #[serde(default = "default_snippet_radius")]
    pub snippet_radius: usize,
    #[serde(default = "default_browse_sample")]
    pub browse_sample: usize,
    #[serde(default = "default_concurrency")]
    pub fetch_concurrency: usize,
    #[serde(default = "default_similarity")]
    pub fuzzy_threshold: f64,
    #[serde(default = "default_stream_window")]
    pub stream_window: usize,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            filename_cap: default_pass_cap(),
            path_cap: default_pass_cap(),
            content_cap: default_content_cap(),
            snippet_radius: default_snippet_radius(),
            browse_sample: default_browse_sample(),
            fetch_concurrency: default_concurrency(),
            fuzzy_threshold: default_similarity(),
            stream_window: default_stream_window(),
        }
    }
}

fn default_pass_cap() -> usize {
    50
}
fn default_content_cap() -> usize {
    100
}
fn default_snippet_radius() -> usize {
    160
}
fn default_browse_sample() -> usize {
    20
}
fn default_similarity() -> f64 {
    0.88
}
fn default_stream_window() -> usize {
    16
}

#[derive(Debug, Deserialize, Clone)]
pub struct RankingConfig {
    /// Glob pattern → multiplicative weight. Weights above 1.0 are overrides.
    #[serde(default)]
    pub path_boosts: BTreeMap<String, f64>,
    /// Tag (without `#`) → multiplicative weight.
    #[serde(default)]
    pub tag_boosts: BTreeMap<String, f64>,
    #[serde(default = "default_half_life_days")]
    pub half_life_days: f64,
    /// Freshness strength in `[0, 1]`; the factor is `2^(-w · age / half_life)`.
    #[serde(default = "default_freshness_weight")]
    pub freshness_weight: f64,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            path_boosts: BTreeMap::new(),
            tag_boosts: BTreeMap::new(),
            half_life_days: default_half_life_days(),
            freshness_weight: default_freshness_weight(),
        }
    }
}

fn default_half_life_days() -> f64 {
    30.0
}
fn default_freshness_weight() -> f64 {
    0.3
}

#[derive(Debug, Deserialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_similarity")]
    pub similarity_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,
    #[serde(default = "default_min_partial_tokens")]
    pub min_partial_tokens: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            min_partial_tokens: default_min_partial_tokens(),
        }
    }
}

fn default_token_budget() -> usize {
    4_000
}
fn default_min_partial_tokens() -> usize {
    32
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
    "127.0.0.1:7341".to_string()
}

impl Config {
    /// Config pointing at `base_url` with every other section defaulted.
    pub fn for_base_url(base_url: &str) -> Self {
        Self {
            vault: VaultConfig {
                base_url: base_url.to_string(),
                api_key: None,
                trust_self_signed: false,
            },
            transport: TransportConfig::default(),
            cache: CacheConfig::default(),
            discovery: DiscoveryConfig::default(),
            query: QueryConfig::default(),
            aggregate: AggregateConfig::default(),
            ranking: RankingConfig::default(),
            dedup: DedupConfig::default(),
            context: ContextConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let base = config.vault.base_url.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        anyhow::bail!("vault.base_url must start with http:// or https://, got '{}'", base);
    }

    if config.transport.breaker_threshold == 0 {
        anyhow::bail!("transport.breaker_threshold must be >= 1");
    }

    let dedup = config.dedup.similarity_threshold;
    if !(dedup > 0.0 && dedup <= 1.0) {
        anyhow::bail!("dedup.similarity_threshold must be in (0.0, 1.0]");
    }

    if !(0.0..=1.0).contains(&config.aggregate.fuzzy_threshold) {
        anyhow::bail!("aggregate.fuzzy_threshold must be in [0.0, 1.0]");
    }

    if config.context.token_budget == 0 {
        anyhow::bail!("context.token_budget must be > 0");
    }

    if !(0.0..=1.0).contains(&config.ranking.freshness_weight) {
        anyhow::bail!("ranking.freshness_weight must be in [0.0, 1.0]");
    }

    if config.ranking.half_life_days <= 0.0 {
        anyhow::bail!("ranking.half_life_days must be > 0");
    }

    for (pattern, weight) in &config.ranking.path_boosts {
        Glob::new(pattern)
            .with_context(|| format!("ranking.path_boosts: invalid glob '{}'", pattern))?;
        if *weight < 0.0 {
            anyhow::bail!("ranking.path_boosts['{}'] must be >= 0", pattern);
        }
    }

    for (tag, weight) in &config.ranking.tag_boosts {
        if *weight < 0.0 {
            anyhow::bail!("ranking.tag_boosts['{}'] must be >= 0", tag);
        }
    }

    if config.discovery.concurrency == 0 || config.aggregate.fetch_concurrency == 0 {
        anyhow::bail!("concurrency settings must be >= 1");
    }

    Ok(())
}
