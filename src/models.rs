//! Core data models that flow through the retrieval pipeline.
//!
//! Every stage hands its output to the next by value. Nothing here holds a
//! reference into another stage's data, so concurrent queries never share a
//! [`Candidate`] or a [`ContextBlock`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One file or directory discovered in the vault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaultEntry {
    /// Vault-relative path. Directories carry a trailing `/`.
    pub path: String,
    pub is_directory: bool,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
}

impl VaultEntry {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_directory: false,
            size_bytes: 0,
            modified_at: None,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_directory: true,
            size_bytes: 0,
            modified_at: None,
        }
    }

    /// Last path component without any trailing slash.
    pub fn file_name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    Filename,
    Content,
    Tag,
    Fuzzy,
}

/// A scored, provisional search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub path: String,
    pub score: f64,
    pub match_type: MatchType,
    pub snippet: String,
    pub tokens_estimate: usize,
    pub metadata: BTreeMap<String, String>,
}

impl Candidate {
    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .get(META_MODIFIED)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc))
    }

    pub fn tags(&self) -> Vec<&str> {
        self.metadata
            .get(META_TAGS)
            .map(|t| t.split(',').filter(|s| !s.is_empty()).collect())
            .unwrap_or_default()
    }
}

/// Metadata key holding the RFC 3339 modification time.
pub const META_MODIFIED: &str = "modified_at";
/// Metadata key holding comma-separated tags.
pub const META_TAGS: &str = "tags";
/// Metadata key holding the full note body, used by ranking.
pub const META_BODY: &str = "body";

/// Which field of a note a term is matched against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Filename,
    Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightedTerm {
    pub term: String,
    pub weight: f64,
    pub field: Field,
    /// False for synonyms and language variants.
    pub original: bool,
}

/// A user query expanded into weighted terms and structured filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposedQuery {
    pub raw_text: String,
    pub expanded_terms: Vec<WeightedTerm>,
    pub filters: BTreeMap<String, String>,
}

impl ComposedQuery {
    /// True when there is nothing to match on: no terms and no filters.
    pub fn is_browse(&self) -> bool {
        self.expanded_terms.is_empty() && self.filters.is_empty()
    }

    /// Distinct terms for a field, highest weight first.
    pub fn terms_for(&self, field: Field) -> Vec<&WeightedTerm> {
        let mut terms: Vec<&WeightedTerm> = self
            .expanded_terms
            .iter()
            .filter(|t| t.field == field)
            .collect();
        terms.sort_by(|a, b| {
            b.weight
                .partial_cmp(&a.weight)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.term.cmp(&b.term))
        });
        terms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextChunk {
    pub source_path: String,
    pub text: String,
    pub tokens: usize,
    pub score: f64,
    pub truncated: bool,
}

/// Token-budgeted context handed to a language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBlock {
    pub chunks: Vec<ContextChunk>,
    pub total_tokens: usize,
    pub budget: usize,
}

impl ContextBlock {
    /// Render as plain text with a citation header per chunk.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for chunk in &self.chunks {
            out.push_str(&format!("[source: {}]\n", chunk.source_path));
            out.push_str(chunk.text.trim_end());
            out.push_str("\n\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_name_strips_dirs() {
        assert_eq!(VaultEntry::file("notes/a.md").file_name(), "a.md");
        assert_eq!(VaultEntry::directory("notes/daily/").file_name(), "daily");
        assert_eq!(VaultEntry::file("root.md").file_name(), "root.md");
    }

    #[test]
    fn test_candidate_metadata_accessors() {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_TAGS.to_string(), "work,urgent".to_string());
        metadata.insert(
            META_MODIFIED.to_string(),
            "2026-01-02T03:04:05Z".to_string(),
        );
        let c = Candidate {
            path: "a.md".into(),
            score: 0.0,
            match_type: MatchType::Content,
            snippet: String::new(),
            tokens_estimate: 0,
            metadata,
        };
        assert_eq!(c.tags(), vec!["work", "urgent"]);
        assert_eq!(c.modified_at().unwrap().timestamp(), 1_767_323_045);
    }
}
