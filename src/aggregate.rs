//! Candidate aggregation over the discovered inventory.
//!
//! # Passes
//!
//! | Pass | Input | Match type | Cap |
//! |------|-------|-----------|-----|
//! | filename | file stems vs. filename terms (substring, then fuzzy) | `filename` / `fuzzy` | `filename_cap` |
//! | path | directory part vs. content terms | `filename` | `path_cap` |
//! | content | note bodies vs. content terms | `content` / `tag` | `content_cap` |
//!
//! The filename and path passes work on names only. The content pass reads
//! notes through the shared [`VaultClient`] with up to `fetch_concurrency`
//! reads in flight; every candidate found by an earlier pass is read too,
//! so each one carries a snippet and its body for ranking.
//!
//! An empty query (no terms, no filters) returns an evenly spaced browse
//! sample of the inventory instead.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::AggregateConfig;
use crate::context::estimate_tokens;
use crate::discovery::{Discovery, Inventory, SkippedPath};
use crate::error::{Result, VaultError};
use crate::models::{
    Candidate, ComposedQuery, Field, MatchType, VaultEntry, META_BODY, META_MODIFIED, META_TAGS,
};
use crate::query::tokenize;
use crate::rank::{file_stem, sort_ranked};
use crate::vault::{Note, VaultClient};

/// Metadata key naming the pass that produced a candidate.
pub const META_MATCHED_ON: &str = "matched_on";

#[derive(Debug, Clone, Serialize)]
pub struct AggregateOutcome {
    pub candidates: Vec<Candidate>,
    /// Some directories or notes could not be read.
    pub partial: bool,
    pub skipped: Vec<SkippedPath>,
    pub browse: bool,
    pub files_scanned: usize,
}

/// A provisional hit before its note is read.
#[derive(Debug, Clone)]
struct Hit {
    entry: VaultEntry,
    score: f64,
    match_type: MatchType,
    matched_on: &'static str,
}

pub struct Aggregator {
    client: Arc<VaultClient>,
    discovery: Arc<Discovery>,
    config: AggregateConfig,
}

impl Aggregator {
    pub fn new(client: Arc<VaultClient>, discovery: Arc<Discovery>, config: &AggregateConfig) -> Self {
        Self {
            client,
            discovery,
            config: config.clone(),
        }
    }

    pub async fn aggregate(
        &self,
        query: &ComposedQuery,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<AggregateOutcome> {
        let inventory = self.discovery.traverse("", cancel).await?;
        self.aggregate_inventory(query, &inventory, limit, cancel).await
    }

    /// Aggregate over an inventory that was already walked.
    pub async fn aggregate_inventory(
        &self,
        query: &ComposedQuery,
        inventory: &Inventory,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<AggregateOutcome> {
        let limit = limit.max(1);
        let files: Vec<&VaultEntry> = inventory
            .files()
            .filter(|e| passes_name_filters(e, &query.filters))
            .collect();
        let mut skipped = inventory.skipped.clone();

        if query.is_browse() {
            let candidates = self.browse(&files, limit, &mut skipped, cancel).await?;
            return Ok(AggregateOutcome {
                partial: !skipped.is_empty(),
                files_scanned: files.len(),
                candidates,
                skipped,
                browse: true,
            });
        }

        let filename_hits = self.filename_pass(&files, query);
        let seen: HashSet<&str> = filename_hits.iter().map(|h| h.entry.path.as_str()).collect();
        let path_hits = self.path_pass(&files, query, &seen);
        tracing::debug!(
            filename = filename_hits.len(),
            path = path_hits.len(),
            files = files.len(),
            "name passes finished"
        );

        let mut hits: Vec<Hit> = filename_hits;
        hits.extend(path_hits);
        let mut candidates = self
            .content_pass(&files, hits, query, &mut skipped, cancel)
            .await?;
        sort_ranked(&mut candidates);
        candidates.truncate(limit);
        Ok(AggregateOutcome {
            partial: !skipped.is_empty(),
            files_scanned: files.len(),
            candidates,
            skipped,
            browse: false,
        })
    }

    // ============ Browse ============

    async fn browse(
        &self,
        files: &[&VaultEntry],
        limit: usize,
        skipped: &mut Vec<SkippedPath>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>> {
        let sample = even_sample(files, self.config.browse_sample.min(limit).max(1));
        let notes = self.fetch_notes(&sample, skipped, cancel).await?;

        Ok(sample
            .into_iter()
            .map(|entry| {
                let note = notes.get(&entry.path);
                let snippet = note
                    .map(|n| extract_snippet(&n.content, &[], self.config.snippet_radius))
                    .unwrap_or_default();
                build_candidate(&entry, note, 0.0, MatchType::Filename, "browse", snippet)
            })
            .collect())
    }

    // ============ Name passes ============

    fn filename_pass(&self, files: &[&VaultEntry], query: &ComposedQuery) -> Vec<Hit> {
        let terms = query.terms_for(Field::Filename);
        let mut hits: Vec<Hit> = Vec::new();
        for entry in files {
            let stem = file_stem(&entry.path).to_lowercase();
            let words = tokenize(&stem);
            let mut score = 0.0;
            let mut exact = false;
            for t in &terms {
                if stem.contains(t.term.as_str()) {
                    score += t.weight;
                    exact = true;
                    continue;
                }
                let best = words
                    .iter()
                    .map(|w| strsim::jaro_winkler(&t.term, w))
                    .fold(0.0_f64, f64::max);
                if best >= self.config.fuzzy_threshold {
                    score += t.weight * best;
                }
            }
            if score > 0.0 {
                hits.push(Hit {
                    entry: (*entry).clone(),
                    score,
                    match_type: if exact {
                        MatchType::Filename
                    } else {
                        MatchType::Fuzzy
                    },
                    matched_on: "filename",
                });
            }
        }
        cap(hits, self.config.filename_cap)
    }

    fn path_pass(
        &self,
        files: &[&VaultEntry],
        query: &ComposedQuery,
        seen: &HashSet<&str>,
    ) -> Vec<Hit> {
        let terms = query.terms_for(Field::Content);
        let mut hits: Vec<Hit> = Vec::new();
        for entry in files {
            if seen.contains(entry.path.as_str()) {
                continue;
            }
            let dir = match entry.path.rfind('/') {
                Some(pos) => entry.path[..pos].to_lowercase(),
                None => continue,
            };
            let score: f64 = terms
                .iter()
                .filter(|t| dir.contains(t.term.as_str()))
                .map(|t| t.weight)
                .sum();
            if score > 0.0 {
                hits.push(Hit {
                    entry: (*entry).clone(),
                    score,
                    match_type: MatchType::Filename,
                    matched_on: "path",
                });
            }
        }
        cap(hits, self.config.path_cap)
    }

    // ============ Content pass ============

    async fn content_pass(
        &self,
        files: &[&VaultEntry],
        hits: Vec<Hit>,
        query: &ComposedQuery,
        skipped: &mut Vec<SkippedPath>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>> {
        let terms = query.terms_for(Field::Content);
        let term_strs: Vec<&str> = terms.iter().map(|t| t.term.as_str()).collect();
        let required_tags: Vec<&str> = query
            .filters
            .get("tag")
            .map(|t| t.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let radius = self.config.snippet_radius;

        let content_score = |note: &Note| -> f64 {
            let lower = note.content.to_lowercase();
            terms
                .iter()
                .filter(|t| lower.contains(t.term.as_str()))
                .map(|t| t.weight)
                .sum()
        };
        let tags_ok = |note: &Note| required_tags.iter().all(|t| note.tags.iter().any(|n| n == t));

        let mut candidates: Vec<Candidate> = Vec::new();

        // Earlier hits: read them for snippets and bodies.
        let hit_entries: Vec<VaultEntry> = hits.iter().map(|h| h.entry.clone()).collect();
        let notes = self.fetch_notes(&hit_entries, skipped, cancel).await?;
        for hit in &hits {
            let Some(note) = notes.get(&hit.entry.path) else {
                continue;
            };
            if !tags_ok(note) {
                continue;
            }
            let score = hit.score + content_score(note);
            let snippet = extract_snippet(&note.content, &term_strs, radius);
            candidates.push(build_candidate(
                &hit.entry,
                Some(note),
                score,
                hit.match_type,
                hit.matched_on,
                snippet,
            ));
        }

        // Remaining files: scan in batches until the content cap is reached.
        let already: HashSet<&str> = hits.iter().map(|h| h.entry.path.as_str()).collect();
        let rest: Vec<VaultEntry> = files
            .iter()
            .filter(|e| !already.contains(e.path.as_str()))
            .map(|e| (*e).clone())
            .collect();
        let filter_only = terms.is_empty();
        let batch = self.config.fetch_concurrency.max(1) * 4;
        let mut found = 0usize;

        'scan: for chunk in rest.chunks(batch) {
            if cancel.is_cancelled() {
                return Err(VaultError::Cancelled);
            }
            let notes = self.fetch_notes(chunk, skipped, cancel).await?;
            for entry in chunk {
                if found >= self.config.content_cap {
                    break 'scan;
                }
                let Some(note) = notes.get(&entry.path) else {
                    continue;
                };
                if !tags_ok(note) {
                    continue;
                }
                let (score, match_type) = if filter_only {
                    let mt = if required_tags.is_empty() {
                        MatchType::Filename
                    } else {
                        MatchType::Tag
                    };
                    (0.0, mt)
                } else {
                    match content_score(note) {
                        s if s > 0.0 => (s, MatchType::Content),
                        _ => continue,
                    }
                };
                found += 1;
                let snippet = extract_snippet(&note.content, &term_strs, radius);
                candidates.push(build_candidate(
                    entry,
                    Some(note),
                    score,
                    match_type,
                    "content",
                    snippet,
                ));
            }
        }

        tracing::debug!(
            candidates = candidates.len(),
            content_matches = found,
            "content pass finished"
        );
        Ok(candidates)
    }

    /// Read notes concurrently. Unreadable notes are recorded in `skipped`;
    /// an open circuit or cancellation aborts the whole fetch.
    async fn fetch_notes(
        &self,
        entries: &[VaultEntry],
        skipped: &mut Vec<SkippedPath>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Note>> {
        let semaphore = Arc::new(Semaphore::new(self.config.fetch_concurrency.max(1)));
        let mut tasks: JoinSet<(String, Result<Note>)> = JoinSet::new();
        for entry in entries {
            let client = self.client.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let path = entry.path.clone();
            let size_hint = entry.size_bytes;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = client.read_note(&path, size_hint, &cancel).await;
                (path, result)
            });
        }

        let mut notes = HashMap::with_capacity(entries.len());
        while let Some(joined) = tasks.join_next().await {
            let (path, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "note fetch task failed");
                    continue;
                }
            };
            match result {
                Ok(note) => {
                    notes.insert(path, note);
                }
                Err(err) if err.is_fatal() => {
                    tasks.abort_all();
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(path = %path, error = %err, "skipping unreadable note");
                    skipped.push(SkippedPath {
                        path,
                        reason: err.to_string(),
                        code: err.code(),
                    });
                }
            }
        }
        Ok(notes)
    }
}

fn cap(mut hits: Vec<Hit>, limit: usize) -> Vec<Hit> {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.entry.path.cmp(&b.entry.path))
    });
    hits.truncate(limit);
    hits
}

/// `path:` and `ext:` filters; each accepts a comma-separated list.
fn passes_name_filters(entry: &VaultEntry, filters: &BTreeMap<String, String>) -> bool {
    let lower = entry.path.to_lowercase();
    if let Some(paths) = filters.get("path") {
        let ok = paths
            .split(',')
            .map(|p| p.trim_start_matches('/').to_lowercase())
            .any(|p| lower.starts_with(&p) || lower.contains(&p));
        if !ok {
            return false;
        }
    }
    if let Some(exts) = filters.get("ext") {
        let ok = exts.split(',').any(|ext| lower.ends_with(&format!(".{}", ext)));
        if !ok {
            return false;
        }
    }
    true
}

/// Up to `k` entries spread evenly across `files`.
fn even_sample(files: &[&VaultEntry], k: usize) -> Vec<VaultEntry> {
    let n = files.len();
    if n <= k {
        return files.iter().map(|e| (*e).clone()).collect();
    }
    (0..k).map(|i| files[i * n / k].clone()).collect()
}

fn build_candidate(
    entry: &VaultEntry,
    note: Option<&Note>,
    score: f64,
    match_type: MatchType,
    matched_on: &str,
    snippet: String,
) -> Candidate {
    let mut metadata = BTreeMap::new();
    metadata.insert(META_MATCHED_ON.to_string(), matched_on.to_string());
    let modified = note.and_then(|n| n.modified_at).or(entry.modified_at);
    if let Some(ts) = modified {
        metadata.insert(META_MODIFIED.to_string(), ts.to_rfc3339());
    }
    if let Some(note) = note {
        if !note.tags.is_empty() {
            metadata.insert(META_TAGS.to_string(), note.tags.join(","));
        }
        metadata.insert("size_bytes".to_string(), note.size_bytes.to_string());
        metadata.insert(META_BODY.to_string(), note.content.clone());
    }
    Candidate {
        path: entry.path.clone(),
        score,
        match_type,
        tokens_estimate: estimate_tokens(&snippet),
        snippet,
        metadata,
    }
}

/// Text around the first occurrence of the earliest-listed term found,
/// `radius` characters on each side, whitespace collapsed. Falls back to
/// the start of the body when no term occurs.
pub fn extract_snippet(body: &str, terms: &[&str], radius: usize) -> String {
    let lower = body.to_lowercase();
    // Lowercasing can change byte lengths outside ASCII; only reuse offsets when it didn't.
    let found = terms
        .iter()
        .find_map(|t| {
            if lower.len() == body.len() {
                lower.find(*t).map(|pos| (pos, t.len()))
            } else {
                body.find(*t).map(|pos| (pos, t.len()))
            }
        })
        .filter(|(pos, len)| body.is_char_boundary(*pos) && body.is_char_boundary(pos + len));

    let (start, end) = match found {
        Some((pos, len)) => (
            back_chars(body, pos, radius),
            forward_chars(body, pos + len, radius),
        ),
        None => (0, forward_chars(body, 0, radius * 2)),
    };

    let mut snippet = String::new();
    if start > 0 {
        snippet.push('…');
    }
    snippet.push_str(&body[start..end].split_whitespace().collect::<Vec<_>>().join(" "));
    if end < body.len() {
        snippet.push('…');
    }
    snippet
}

/// Byte offset `n` characters before `pos`.
fn back_chars(s: &str, pos: usize, n: usize) -> usize {
    if n == 0 {
        return pos;
    }
    s[..pos]
        .char_indices()
        .rev()
        .nth(n.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

/// Byte offset `n` characters after `pos`.
fn forward_chars(s: &str, pos: usize, n: usize) -> usize {
    s[pos..]
        .char_indices()
        .nth(n)
        .map(|(i, _)| pos + i)
        .unwrap_or(s.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(paths: &[&str]) -> Vec<VaultEntry> {
        paths.iter().map(|p| VaultEntry::file(*p)).collect()
    }

    #[test]
    fn test_snippet_centres_on_term() {
        let body = format!("{} needle {}", "a".repeat(100), "b".repeat(100));
        let s = extract_snippet(&body, &["needle"], 10);
        assert!(s.contains("needle"));
        assert!(s.starts_with('…') && s.ends_with('…'));
        assert!(s.chars().count() <= 10 + 6 + 10 + 2 + 2);
    }

    #[test]
    fn test_snippet_zero_radius_is_just_the_term() {
        assert_eq!(extract_snippet("one two three", &["two"], 0), "…two…");
        assert_eq!(back_chars("one two", 4, 0), 4);
        assert_eq!(back_chars("one two", 4, 1), 3);
    }

    #[test]
    fn test_snippet_falls_back_to_prefix() {
        let s = extract_snippet("short body text", &["missing"], 160);
        assert_eq!(s, "short body text");
    }

    #[test]
    fn test_snippet_case_insensitive_and_multibyte() {
        let s = extract_snippet("Año nuevo: ALPHA release", &["alpha"], 4);
        assert!(s.contains("ALPHA"), "{}", s);
        let s = extract_snippet("über ALPHA", &["alpha"], 2);
        assert!(s.starts_with("über") || s.starts_with('…'));
    }

    #[test]
    fn test_name_filters() {
        let mut filters = BTreeMap::new();
        filters.insert("path".to_string(), "projects/".to_string());
        filters.insert("ext".to_string(), "md".to_string());
        assert!(passes_name_filters(&VaultEntry::file("projects/a.md"), &filters));
        assert!(!passes_name_filters(&VaultEntry::file("projects/a.txt"), &filters));
        assert!(!passes_name_filters(&VaultEntry::file("notes/a.md"), &filters));
    }

    #[test]
    fn test_even_sample() {
        let all = entries(&["a", "b", "c", "d", "e", "f", "g", "h", "i", "j"]);
        let refs: Vec<&VaultEntry> = all.iter().collect();
        let sample = even_sample(&refs, 3);
        let paths: Vec<&str> = sample.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["a", "d", "g"]);
        assert_eq!(even_sample(&refs[..2], 5).len(), 2);
    }

    #[test]
    fn test_cap_keeps_best() {
        let hit = |p: &str, s: f64| Hit {
            entry: VaultEntry::file(p),
            score: s,
            match_type: MatchType::Filename,
            matched_on: "filename",
        };
        let capped = cap(vec![hit("a", 0.1), hit("b", 0.9), hit("c", 0.5)], 2);
        let paths: Vec<&str> = capped.iter().map(|h| h.entry.path.as_str()).collect();
        assert_eq!(paths, vec!["b", "c"]);
    }
}
