//! Near-duplicate collapsing.
//!
//! Two candidates are duplicates when the normalized Levenshtein similarity
//! of their text (snippet, or path when the snippet is empty) reaches the
//! threshold. Candidates are visited in score order and each one is compared
//! against everything already kept, so the higher-scored copy survives. The
//! collapsed paths are listed under the survivor's `duplicates` metadata.
//!
//! Pairwise comparison is O(n²) in the candidate count. A length-ratio
//! bound skips the edit-distance computation for pairs that cannot reach
//! the threshold.

use crate::models::Candidate;
use crate::rank::sort_by_score;

/// Metadata key listing paths collapsed into a candidate.
pub const META_DUPLICATES: &str = "duplicates";

pub struct Deduplicator {
    threshold: f64,
}

impl Deduplicator {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn dedupe(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        sort_by_score(&mut candidates);

        let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let dup_of = kept.iter().position(|k| {
                k.path == candidate.path || self.similarity(k, &candidate) >= self.threshold
            });
            match dup_of {
                Some(idx) => {
                    tracing::debug!(
                        kept = %kept[idx].path,
                        dropped = %candidate.path,
                        "collapsed near-duplicate"
                    );
                    if kept[idx].path != candidate.path {
                        let entry = kept[idx]
                            .metadata
                            .entry(META_DUPLICATES.to_string())
                            .or_default();
                        if !entry.is_empty() {
                            entry.push(',');
                        }
                        entry.push_str(&candidate.path);
                    }
                }
                None => kept.push(candidate),
            }
        }
        kept
    }

    /// Similarity in `[0, 1]`; `0.0` when the length ratio rules out a match.
    pub fn similarity(&self, a: &Candidate, b: &Candidate) -> f64 {
        let (x, y) = (comparable_text(a), comparable_text(b));
        let (lx, ly) = (x.chars().count(), y.chars().count());
        let (short, long) = if lx < ly { (lx, ly) } else { (ly, lx) };
        if long == 0 {
            return 1.0;
        }
        // Edit distance is at least the length difference.
        if (short as f64 / long as f64) < self.threshold {
            return 0.0;
        }
        strsim::normalized_levenshtein(x, y)
    }
}

fn comparable_text(c: &Candidate) -> &str {
    let snippet = c.snippet.trim();
    if snippet.is_empty() {
        &c.path
    } else {
        snippet
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MatchType;
    use std::collections::BTreeMap;

    fn candidate(path: &str, score: f64, snippet: &str) -> Candidate {
        Candidate {
            path: path.to_string(),
            score,
            match_type: MatchType::Content,
            snippet: snippet.to_string(),
            tokens_estimate: 0,
            metadata: BTreeMap::new(),
        }
    }

    const TEXT: &str = "Quarterly planning notes: ship the sync engine, hire two engineers, review the budget.";

    fn near_copy() -> String {
        // Change 4 of ~88 characters: about 95% similar.
        TEXT.replacen("two", "six", 1).replacen("ship", "shop", 1)
    }

    #[test]
    fn test_near_duplicates_collapse_keeping_higher_score() {
        let d = Deduplicator::new(0.9);
        let out = d.dedupe(vec![
            candidate("copy.md", 0.4, &near_copy()),
            candidate("orig.md", 0.9, TEXT),
        ]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].path, "orig.md");
        assert_eq!(out[0].metadata[META_DUPLICATES], "copy.md");
    }

    #[test]
    fn test_distinct_snippets_survive() {
        let d = Deduplicator::new(0.88);
        let out = d.dedupe(vec![
            candidate("a.md", 0.9, TEXT),
            candidate("b.md", 0.8, "Grocery list: eggs, milk, coffee."),
        ]);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_survivors_below_threshold() {
        let d = Deduplicator::new(0.85);
        let texts = [
            TEXT.to_string(),
            near_copy(),
            "totally different content about gardening".to_string(),
            "totally different content about gardens".to_string(),
            "meeting notes".to_string(),
        ];
        let input: Vec<Candidate> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| candidate(&format!("{}.md", i), 1.0 - i as f64 * 0.1, t))
            .collect();
        let out = d.dedupe(input);
        for (i, a) in out.iter().enumerate() {
            for b in &out[i + 1..] {
                assert!(d.similarity(a, b) < d.threshold());
            }
        }
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn test_same_path_collapses() {
        let d = Deduplicator::new(0.9);
        let out = d.dedupe(vec![candidate("a.md", 0.5, "x"), candidate("a.md", 0.7, "y")]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].score, 0.7);
        assert!(!out[0].metadata.contains_key(META_DUPLICATES));
    }

    #[test]
    fn test_empty_snippets_compare_paths() {
        let d = Deduplicator::new(0.9);
        let out = d.dedupe(vec![
            candidate("notes/a.md", 0.5, ""),
            candidate("journal/zz.md", 0.4, ""),
        ]);
        assert_eq!(out.len(), 2);
    }
}
