//! Recursive vault discovery.
//!
//! The vault API lists one directory level per call, so the walk issues one
//! listing per directory, level by level, with up to `concurrency` listings
//! in flight. Listings come from the cache when warm.
//!
//! A subdirectory that fails with 403/404 or a transport error is skipped
//! and recorded in [`Inventory::skipped`], and the inventory is flagged as
//! partial. Only a failed root listing, an open circuit or cancellation fail
//! the walk as a whole.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::{Result, VaultError};
use crate::models::VaultEntry;
use crate::vault::{normalize_dir, VaultClient};

#[derive(Debug, Clone, Serialize)]
pub struct SkippedPath {
    pub path: String,
    pub reason: String,
    pub code: &'static str,
}

/// Result of a walk. `entries` are sorted by path.
#[derive(Debug, Clone, Serialize)]
pub struct Inventory {
    pub entries: Vec<VaultEntry>,
    pub skipped: Vec<SkippedPath>,
}

impl Inventory {
    /// True when some subtree could not be listed.
    pub fn is_partial(&self) -> bool {
        !self.skipped.is_empty()
    }

    pub fn files(&self) -> impl Iterator<Item = &VaultEntry> {
        self.entries.iter().filter(|e| !e.is_directory)
    }
}

pub struct Discovery {
    client: Arc<VaultClient>,
    max_depth: usize,
    concurrency: usize,
    excludes: GlobSet,
}

impl Discovery {
    pub fn new(client: Arc<VaultClient>, config: &DiscoveryConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &config.exclude_globs {
            let glob = Glob::new(pattern).map_err(|e| {
                VaultError::Validation(format!("invalid exclude glob '{}': {}", pattern, e))
            })?;
            builder.add(glob);
        }
        let excludes = builder
            .build()
            .map_err(|e| VaultError::Validation(e.to_string()))?;

        Ok(Self {
            client,
            max_depth: config.max_depth,
            concurrency: config.concurrency.max(1),
            excludes,
        })
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub async fn traverse(&self, root: &str, cancel: &CancellationToken) -> Result<Inventory> {
        self.traverse_with_filter(root, |_| true, cancel).await
    }

    /// Walk from `root`, keeping entries for which `predicate` holds.
    /// Directories are always descended into regardless of the predicate.
    pub async fn traverse_with_filter<F>(
        &self,
        root: &str,
        predicate: F,
        cancel: &CancellationToken,
    ) -> Result<Inventory>
    where
        F: Fn(&VaultEntry) -> bool,
    {
        let root = normalize_dir(root);
        let started = std::time::Instant::now();

        // The root listing must succeed; without it there is nothing partial to return.
        let root_entries = self.client.list_dir(&root, cancel).await?;

        let mut entries: Vec<VaultEntry> = Vec::new();
        let mut skipped: Vec<SkippedPath> = Vec::new();
        let mut frontier: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        seen.insert(root.clone());
        self.absorb(root_entries, 1, &mut seen, &mut entries, &mut frontier);

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut depth = 1;
        while !frontier.is_empty() {
            depth += 1;
            let mut tasks: JoinSet<(String, Result<Vec<VaultEntry>>)> = JoinSet::new();
            for dir in frontier.drain(..) {
                let client = self.client.clone();
                let semaphore = semaphore.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let result = client.list_dir(&dir, &cancel).await;
                    (dir, result)
                });
            }

            let mut next: Vec<String> = Vec::new();
            while let Some(joined) = tasks.join_next().await {
                let (dir, result) = match joined {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "listing task failed");
                        continue;
                    }
                };
                match result {
                    Ok(children) => {
                        self.absorb(children, depth, &mut seen, &mut entries, &mut next)
                    }
                    Err(err) if err.is_fatal() => {
                        tasks.abort_all();
                        return Err(err);
                    }
                    Err(err) => {
                        tracing::warn!(path = %dir, error = %err, "skipping unreadable directory");
                        skipped.push(SkippedPath {
                            path: dir,
                            reason: err.to_string(),
                            code: err.code(),
                        });
                    }
                }
            }
            frontier = next;
        }

        entries.retain(|e| predicate(e));
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        skipped.sort_by(|a, b| a.path.cmp(&b.path));

        tracing::info!(
            root = %root,
            entries = entries.len(),
            skipped = skipped.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "vault walk finished"
        );
        Ok(Inventory { entries, skipped })
    }

    /// Record listed children and queue subdirectories within depth.
    /// A path already recorded is neither kept again nor listed again.
    fn absorb(
        &self,
        children: Vec<VaultEntry>,
        depth: usize,
        seen: &mut HashSet<String>,
        entries: &mut Vec<VaultEntry>,
        frontier: &mut Vec<String>,
    ) {
        for child in children {
            if self.is_excluded(&child) || !seen.insert(child.path.clone()) {
                continue;
            }
            if child.is_directory {
                if depth < self.max_depth {
                    frontier.push(child.path.clone());
                } else {
                    tracing::debug!(path = %child.path, "max depth reached, not descending");
                }
            }
            entries.push(child);
        }
    }

    fn is_excluded(&self, entry: &VaultEntry) -> bool {
        let trimmed = entry.path.trim_end_matches('/');
        if self.excludes.is_match(trimmed) {
            return true;
        }
        // `dir/**` patterns exclude the directory itself.
        entry.is_directory && self.excludes.is_match(format!("{}/_", trimmed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlCache;
    use crate::circuit::CircuitBreaker;
    use crate::config::{TransportConfig, VaultConfig};
    use crate::transport::Transport;
    use std::time::Duration;

    const TTL: Duration = Duration::from_secs(60);

    /// A client whose network calls all fail; listings come from the cache.
    fn make_client() -> Arc<VaultClient> {
        let vault = VaultConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            trust_self_signed: false,
        };
        let transport = TransportConfig {
            max_retries: 0,
            ..TransportConfig::default()
        };
        let breaker = Arc::new(CircuitBreaker::new(100, Duration::from_secs(30)));
        let transport = Arc::new(Transport::new(&vault, &transport, breaker).unwrap());
        Arc::new(VaultClient::new(
            transport,
            Arc::new(TtlCache::new(None)),
            TTL,
            16,
        ))
    }

    fn seed(client: &VaultClient, dir: &str, entries: Vec<VaultEntry>) {
        client.cache().set_json(&format!("list:{}", dir), &entries, TTL);
    }

    fn make_vault() -> Arc<VaultClient> {
        let client = make_client();
        seed(
            &client,
            "",
            vec![
                VaultEntry::directory("a/"),
                VaultEntry::directory(".obsidian/"),
                VaultEntry::file("top.md"),
            ],
        );
        seed(
            &client,
            "a/",
            vec![VaultEntry::directory("a/b/"), VaultEntry::file("a/x.md")],
        );
        seed(&client, "a/b/", vec![VaultEntry::file("a/b/y.md")]);
        client
    }

    fn paths(inv: &Inventory) -> Vec<&str> {
        inv.entries.iter().map(|e| e.path.as_str()).collect()
    }

    #[tokio::test]
    async fn test_walk_sorted_and_excludes_config_dir() {
        let discovery = Discovery::new(make_vault(), &DiscoveryConfig::default()).unwrap();
        let inv = discovery
            .traverse("", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            paths(&inv),
            vec!["a/", "a/b/", "a/b/y.md", "a/x.md", "top.md"]
        );
        assert!(!inv.is_partial());
        assert_eq!(inv.files().count(), 3);
    }

    #[tokio::test]
    async fn test_depth_limit() {
        let discovery = Discovery::new(make_vault(), &DiscoveryConfig::default())
            .unwrap()
            .with_max_depth(2);
        let inv = discovery
            .traverse("", &CancellationToken::new())
            .await
            .unwrap();
        assert!(paths(&inv).contains(&"a/b/"));
        assert!(!paths(&inv).contains(&"a/b/y.md"));
    }

    #[tokio::test]
    async fn test_unreachable_subdir_is_skipped() {
        let client = make_vault();
        seed(
            &client,
            "",
            vec![VaultEntry::directory("gone/"), VaultEntry::file("top.md")],
        );
        let discovery = Discovery::new(client, &DiscoveryConfig::default()).unwrap();
        let inv = discovery
            .traverse("", &CancellationToken::new())
            .await
            .unwrap();
        assert!(inv.is_partial());
        assert_eq!(inv.skipped[0].path, "gone/");
        assert!(paths(&inv).contains(&"top.md"));
    }

    #[tokio::test]
    async fn test_same_named_nested_folder() {
        let client = make_client();
        seed(&client, "", vec![VaultEntry::directory("notes/")]);
        seed(
            &client,
            "notes/",
            vec![VaultEntry::directory("notes/notes/"), VaultEntry::file("notes/a.md")],
        );
        seed(&client, "notes/notes/", vec![VaultEntry::file("notes/notes/deep.md")]);
        let discovery = Discovery::new(client, &DiscoveryConfig::default()).unwrap();
        let inv = discovery
            .traverse("", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            paths(&inv),
            vec!["notes/", "notes/a.md", "notes/notes/", "notes/notes/deep.md"]
        );
    }

    #[tokio::test]
    async fn test_repeated_listing_entries_kept_once() {
        let client = make_client();
        seed(
            &client,
            "",
            vec![
                VaultEntry::directory("a/"),
                VaultEntry::directory("a/"),
                VaultEntry::file("top.md"),
            ],
        );
        seed(&client, "a/", vec![VaultEntry::file("a/x.md"), VaultEntry::file("a/x.md")]);
        let discovery = Discovery::new(client, &DiscoveryConfig::default()).unwrap();
        let inv = discovery
            .traverse("", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(paths(&inv), vec!["a/", "a/x.md", "top.md"]);
    }

    #[tokio::test]
    async fn test_cancelled_walk_fails() {
        let discovery = Discovery::new(make_client(), &DiscoveryConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = discovery.traverse("", &cancel).await.unwrap_err();
        assert!(matches!(err, VaultError::Cancelled));
    }

    #[test]
    fn test_invalid_exclude_glob() {
        let cfg = DiscoveryConfig {
            exclude_globs: vec!["[".to_string()],
            ..DiscoveryConfig::default()
        };
        assert!(matches!(
            Discovery::new(make_client(), &cfg),
            Err(VaultError::Validation(_))
        ));
    }
}
