//! Typed binding to the vault HTTP file API.
//!
//! | Method | Path | Meaning |
//! |--------|------|---------|
//! | `GET` | `/vault/{dir}/` | one-level listing, body `{"files": [...]}` |
//! | `GET` | `/vault/{path}` | note content (JSON note form when requested) |
//! | `PUT` | `/vault/{path}` | create or replace a note |
//! | `DELETE` | `/vault/{path}` | remove a note |
//!
//! `POST` is never issued: it is not a dependable write path on this API.
//!
//! Listings and note reads go through the [`TtlCache`] first. Writes and
//! deletes invalidate the note and its parent listing.

use chrono::{DateTime, TimeZone, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cache::TtlCache;
use crate::error::{Result, VaultError};
use crate::models::VaultEntry;
use crate::transport::{RequestOptions, TimeoutTier, Transport};

/// Media type asking the API for content plus tags, frontmatter and stat.
pub const NOTE_JSON: &str = "application/vnd.olrapi.note+json";

#[derive(Debug, Deserialize)]
struct Listing {
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct NoteJson {
    content: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    frontmatter: serde_json::Value,
    #[serde(default)]
    stat: Option<NoteStat>,
}

#[derive(Debug, Deserialize)]
struct NoteStat {
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    mtime: Option<i64>,
    #[serde(default)]
    size: Option<u64>,
}

/// A note as read from the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub path: String,
    pub content: String,
    pub tags: Vec<String>,
    pub modified_at: Option<DateTime<Utc>>,
    pub size_bytes: u64,
}

pub struct VaultClient {
    transport: Arc<Transport>,
    cache: Arc<TtlCache>,
    ttl: Duration,
    stream_window: usize,
}

fn listing_key(dir: &str) -> String {
    format!("list:{}", dir)
}

fn note_key(path: &str) -> String {
    format!("note:{}", path)
}

/// Normalise a directory path to `""` (root) or `"a/b/"`.
pub fn normalize_dir(dir: &str) -> String {
    let trimmed = dir.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("{}/", trimmed)
    }
}

fn parent_dir(path: &str) -> String {
    match path.trim_end_matches('/').rfind('/') {
        Some(pos) => path[..=pos].to_string(),
        None => String::new(),
    }
}

impl VaultClient {
    pub fn new(
        transport: Arc<Transport>,
        cache: Arc<TtlCache>,
        ttl: Duration,
        stream_window: usize,
    ) -> Self {
        Self {
            transport,
            cache,
            ttl,
            stream_window,
        }
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// List one directory level. Returned paths are vault-relative.
    pub async fn list_dir(&self, dir: &str, cancel: &CancellationToken) -> Result<Vec<VaultEntry>> {
        let dir = normalize_dir(dir);
        let key = listing_key(&dir);
        if let Some(entries) = self.cache.get_json::<Vec<VaultEntry>>(&key) {
            return Ok(entries);
        }

        let opts = RequestOptions::tier(TimeoutTier::Short).accept("application/json");
        let resp = self
            .transport
            .request(Method::GET, &dir, None, &opts, cancel)
            .await?;
        let entries = parse_listing(&dir, &resp.body)?;
        self.cache.set_json(&key, &entries, self.ttl);
        Ok(entries)
    }

    /// Read a note. The body is streamed chunk by chunk; files whose size
    /// is known to exceed the large-file threshold get the long timeout.
    pub async fn read_note(
        &self,
        path: &str,
        size_hint: u64,
        cancel: &CancellationToken,
    ) -> Result<Note> {
        let key = note_key(path);
        if let Some(note) = self.cache.get_json::<Note>(&key) {
            return Ok(note);
        }

        let tier = if size_hint > self.transport.config().large_file_bytes {
            TimeoutTier::Long
        } else {
            TimeoutTier::Medium
        };
        let opts = RequestOptions::tier(tier).accept(NOTE_JSON);
        let body = self
            .transport
            .get_streamed(path, &opts, self.stream_window, cancel)
            .await?;
        let note = if body.is_json() {
            parse_note(path, body.text.as_bytes())?
        } else {
            plain_note(path, body.text)
        };

        self.cache.set_json(&key, &note, self.ttl);
        Ok(note)
    }

    /// Create or replace a note with `PUT`.
    pub async fn put_note(
        &self,
        path: &str,
        content: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if path.is_empty() || path.ends_with('/') {
            return Err(VaultError::Validation(format!(
                "'{}' is not a file path",
                path
            )));
        }
        let opts = RequestOptions::tier(TimeoutTier::Medium).content_type("text/markdown");
        self.transport
            .request(
                Method::PUT,
                path,
                Some(content.as_bytes().to_vec()),
                &opts,
                cancel,
            )
            .await?;
        self.invalidate(path);
        tracing::info!(path, bytes = content.len(), "note written");
        Ok(())
    }

    pub async fn delete_note(&self, path: &str, cancel: &CancellationToken) -> Result<()> {
        let opts = RequestOptions::tier(TimeoutTier::Medium);
        self.transport
            .request(Method::DELETE, path, None, &opts, cancel)
            .await?;
        self.invalidate(path);
        tracing::info!(path, "note deleted");
        Ok(())
    }

    fn invalidate(&self, path: &str) {
        self.cache.remove(&note_key(path));
        // Every ancestor listing may change when a new directory appears.
        let mut dir = parent_dir(path);
        loop {
            self.cache.remove(&listing_key(&dir));
            if dir.is_empty() {
                break;
            }
            dir = parent_dir(&dir);
        }
    }
}

fn parse_listing(dir: &str, body: &[u8]) -> Result<Vec<VaultEntry>> {
    let listing: Listing = serde_json::from_slice(body).map_err(|e| VaultError::Decode {
        path: dir.to_string(),
        message: format!("expected {{\"files\": [...]}}: {}", e),
    })?;

    let mut entries: Vec<VaultEntry> = listing
        .files
        .into_iter()
        .filter(|name| !name.is_empty())
        .map(|name| {
            // Names are relative to the listed directory.
            let full = format!("{}{}", dir, name.trim_start_matches('/'));
            if full.ends_with('/') {
                VaultEntry::directory(full)
            } else {
                VaultEntry::file(full)
            }
        })
        .collect();
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    entries.dedup_by(|a, b| a.path == b.path);
    Ok(entries)
}

fn parse_note(path: &str, body: &[u8]) -> Result<Note> {
    let raw: NoteJson = serde_json::from_slice(body).map_err(|e| VaultError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })?;

    let mut tags: Vec<String> = raw.tags.iter().map(|t| normalize_tag(t)).collect();
    tags.extend(frontmatter_tags(&raw.frontmatter));
    tags.extend(extract_inline_tags(&raw.content));
    tags.sort();
    tags.dedup();

    let (modified_at, size) = match raw.stat {
        Some(stat) => (
            stat.mtime.and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
            stat.size,
        ),
        None => (None, None),
    };

    Ok(Note {
        path: path.to_string(),
        size_bytes: size.unwrap_or(raw.content.len() as u64),
        content: raw.content,
        tags,
        modified_at,
    })
}

fn plain_note(path: &str, content: String) -> Note {
    let mut tags = extract_inline_tags(&content);
    tags.sort();
    tags.dedup();
    Note {
        path: path.to_string(),
        size_bytes: content.len() as u64,
        content,
        tags,
        modified_at: None,
    }
}

fn normalize_tag(tag: &str) -> String {
    tag.trim().trim_start_matches('#').to_lowercase()
}

fn frontmatter_tags(frontmatter: &serde_json::Value) -> Vec<String> {
    match frontmatter.get("tags") {
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(normalize_tag)
            .filter(|t| !t.is_empty())
            .collect(),
        Some(serde_json::Value::String(s)) => s
            .split([',', ' '])
            .map(normalize_tag)
            .filter(|t| !t.is_empty())
            .collect(),
        _ => Vec::new(),
    }
}

/// `#tag` tokens in body text. Markdown headings (`# Title`) are not tags.
pub fn extract_inline_tags(content: &str) -> Vec<String> {
    let mut tags = Vec::new();
    for token in content.split_whitespace() {
        let Some(rest) = token.strip_prefix('#') else {
            continue;
        };
        let tag: String = rest
            .chars()
            .take_while(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '/'))
            .collect();
        if !tag.is_empty() && tag.chars().any(|c| !c.is_numeric()) {
            tags.push(tag.to_lowercase());
        }
    }
    tags
}
