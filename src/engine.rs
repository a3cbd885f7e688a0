//! The retrieval engine: one value owning every shared component.
//!
//! An [`Engine`] is built once from a [`Config`] and handed (behind an
//! `Arc`) to the CLI, the HTTP server and the tool registry. It owns the
//! single circuit breaker, cache, transport and vault client, so tests can
//! construct an isolated engine against a fake vault without any global
//! state.

use globset::Glob;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::aggregate::Aggregator;
use crate::boost::MetadataBoost;
use crate::cache::TtlCache;
use crate::circuit::CircuitBreaker;
use crate::config::Config;
use crate::context::ContextAssembler;
use crate::dedup::Deduplicator;
use crate::discovery::{Discovery, Inventory};
use crate::error::{Result, VaultError};
use crate::pipeline::{AskOutput, Pipeline, SearchOutput};
use crate::query::QueryComposer;
use crate::stats::StatsReport;
use crate::transport::Transport;
use crate::vault::{Note, VaultClient};

pub struct Engine {
    config: Config,
    breaker: Arc<CircuitBreaker>,
    cache: Arc<TtlCache>,
    transport: Arc<Transport>,
    client: Arc<VaultClient>,
    discovery: Arc<Discovery>,
    pipeline: Pipeline,
    shutdown: CancellationToken,
}

impl Engine {
    pub fn new(config: Config) -> Result<Self> {
        let breaker = Arc::new(CircuitBreaker::new(
            config.transport.breaker_threshold,
            config.transport.breaker_cooldown(),
        ));
        let cache = Arc::new(match &config.cache.disk_path {
            Some(path) => TtlCache::with_disk(config.cache.max_entries, path),
            None => TtlCache::new(config.cache.max_entries),
        });
        let transport = Arc::new(Transport::new(
            &config.vault,
            &config.transport,
            breaker.clone(),
        )?);
        let client = Arc::new(VaultClient::new(
            transport.clone(),
            cache.clone(),
            config.cache.ttl(),
            config.aggregate.stream_window,
        ));
        let discovery = Arc::new(Discovery::new(client.clone(), &config.discovery)?);

        let pipeline = Pipeline::new(
            QueryComposer::new(&config.query),
            Aggregator::new(client.clone(), discovery.clone(), &config.aggregate),
            MetadataBoost::new(&config.ranking)?,
            Deduplicator::new(config.dedup.similarity_threshold),
            ContextAssembler::new(config.context.min_partial_tokens),
        );

        tracing::debug!(base_url = %config.vault.base_url, "engine ready");
        Ok(Self {
            config,
            breaker,
            cache,
            transport,
            client,
            discovery,
            pipeline,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn client(&self) -> &Arc<VaultClient> {
        &self.client
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// A token for one request. It is cancelled when the engine shuts
    /// down, or after `timeout_ms` if given.
    pub fn request_token(&self, timeout_ms: Option<u64>) -> CancellationToken {
        let token = self.shutdown.child_token();
        if let Some(ms) = timeout_ms {
            let deadline = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = deadline.cancelled() => {}
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        tracing::debug!(timeout_ms = ms, "request deadline reached");
                        deadline.cancel();
                    }
                }
            });
        }
        token
    }

    /// Sweep expired cache entries every `sweep_interval_secs` until shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let engine = self.clone();
        let period = Duration::from_secs(self.config.cache.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = engine.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = engine.cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "cache sweep");
                        }
                    }
                }
            }
        })
    }

    /// Cancel outstanding requests and flush the cache to disk.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        if let Err(e) = self.cache.persist() {
            tracing::warn!(error = %e, "failed to persist cache");
        }
    }

    // ============ Operations ============

    /// Walk the vault from `root`. `glob` keeps only matching files.
    pub async fn list_vault(
        &self,
        root: &str,
        max_depth: Option<usize>,
        glob: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Inventory> {
        let matcher = match glob {
            Some(pattern) => Some(
                Glob::new(pattern)
                    .map_err(|e| VaultError::Validation(format!("invalid glob '{}': {}", pattern, e)))?
                    .compile_matcher(),
            ),
            None => None,
        };
        let predicate = |entry: &crate::models::VaultEntry| match &matcher {
            Some(m) => !entry.is_directory && m.is_match(&entry.path),
            None => true,
        };

        match max_depth {
            Some(depth) => {
                Discovery::new(self.client.clone(), &self.config.discovery)?
                    .with_max_depth(depth)
                    .traverse_with_filter(root, predicate, cancel)
                    .await
            }
            None => {
                self.discovery
                    .traverse_with_filter(root, predicate, cancel)
                    .await
            }
        }
    }

    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchOutput> {
        self.pipeline.search(query, limit, cancel).await
    }

    /// Run the full pipeline. `budget` defaults to `context.token_budget`.
    pub async fn ask(
        &self,
        query: &str,
        budget: Option<usize>,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<AskOutput> {
        let budget = budget.unwrap_or(self.config.context.token_budget);
        self.pipeline.ask(query, budget, limit, cancel).await
    }

    pub async fn read_note(&self, path: &str, cancel: &CancellationToken) -> Result<Note> {
        self.client.read_note(path, 0, cancel).await
    }

    pub async fn put_note(
        &self,
        path: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.client.put_note(path, content, cancel).await
    }

    pub fn stats(&self) -> StatsReport {
        StatsReport {
            base_url: self.config.vault.base_url.clone(),
            cache: self.cache.stats(),
            transport: self.transport.stats(),
            circuit: self.breaker.state(),
            consecutive_failures: self.breaker.consecutive_failures(),
            cache_file: self
                .config
                .cache
                .disk_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }

    /// Drop every cached listing and note. Returns how many were removed.
    pub fn clear_cache(&self) -> usize {
        let removed = self.cache.clear();
        tracing::info!(removed, "cache cleared");
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_builds_from_defaults() {
        let engine = Engine::new(Config::for_base_url("http://127.0.0.1:9")).unwrap();
        let stats = engine.stats();
        assert_eq!(stats.cache.entries, 0);
        assert_eq!(stats.transport.requests, 0);
        assert_eq!(engine.clear_cache(), 0);
    }

    #[test]
    fn test_engine_rejects_bad_boost_glob() {
        let mut cfg = Config::for_base_url("http://127.0.0.1:9");
        cfg.ranking.path_boosts.insert("[".into(), 0.5);
        assert!(matches!(Engine::new(cfg), Err(VaultError::Validation(_))));
    }

    #[tokio::test]
    async fn test_request_token_deadline() {
        let engine = Engine::new(Config::for_base_url("http://127.0.0.1:9")).unwrap();
        let token = engine.request_token(Some(10));
        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        let untimed = engine.request_token(None);
        engine.shutdown();
        assert!(untimed.is_cancelled());
    }
}
