//! TF-IDF relevance over a query-scoped index.
//!
//! The index is built from the candidate set only (not the whole vault):
//! document frequency counts how many candidates contain a term. Each
//! expanded term contributes in the field it was composed for:
//!
//! ```text
//! raw(d) = Σ weight(t, f) × tf(t, d, f) × idf(t, f)
//! tf     = 1 + ln(count)            (0 when absent)
//! idf    = ln(1 + N / df)
//! ```
//!
//! Raw scores are divided by the set maximum, so every score lands in
//! `[0, 1]`. Ranking reads only paths and note bodies, never the incoming
//! score, so ranking an already-ranked set returns the same order.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::models::{Candidate, ComposedQuery, Field, META_BODY};
use crate::query::tokenize;

/// Score assigned to every candidate when no term occurs anywhere
/// (browse and filter-only queries).
const NEUTRAL_SCORE: f64 = 1.0;

/// Per-candidate term counts for both fields.
struct DocTerms {
    filename: HashMap<String, usize>,
    content: HashMap<String, usize>,
}

impl DocTerms {
    fn build(candidate: &Candidate) -> Self {
        Self {
            filename: count(&tokenize(file_stem(&candidate.path))),
            content: count(&tokenize(body_of(candidate))),
        }
    }

    fn field(&self, field: Field) -> &HashMap<String, usize> {
        match field {
            Field::Filename => &self.filename,
            Field::Content => &self.content,
        }
    }
}

fn count(tokens: &[String]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for t in tokens {
        *counts.entry(t.clone()).or_insert(0) += 1;
    }
    counts
}

fn body_of(candidate: &Candidate) -> &str {
    candidate
        .metadata
        .get(META_BODY)
        .map(|s| s.as_str())
        .unwrap_or(&candidate.snippet)
}

/// File name without directories or extension.
pub fn file_stem(path: &str) -> &str {
    let name = path.rsplit('/').next().unwrap_or(path);
    match name.rfind('.') {
        Some(pos) if pos > 0 => &name[..pos],
        _ => name,
    }
}

/// Score and order candidates. Output is sorted by score descending, then
/// most recently modified, then path.
pub fn rank(mut candidates: Vec<Candidate>, query: &ComposedQuery) -> Vec<Candidate> {
    if candidates.is_empty() {
        return candidates;
    }

    let docs: Vec<DocTerms> = candidates.iter().map(DocTerms::build).collect();
    let n = docs.len() as f64;

    let raw: Vec<f64> = docs
        .iter()
        .map(|doc| {
            query
                .expanded_terms
                .iter()
                .map(|t| {
                    let tf = match doc.field(t.field).get(&t.term) {
                        Some(&c) if c > 0 => 1.0 + (c as f64).ln(),
                        _ => return 0.0,
                    };
                    let df = docs
                        .iter()
                        .filter(|d| d.field(t.field).contains_key(&t.term))
                        .count() as f64;
                    t.weight * tf * (1.0 + n / df).ln()
                })
                .sum()
        })
        .collect();

    let max = raw.iter().cloned().fold(0.0_f64, f64::max);
    for (candidate, raw_score) in candidates.iter_mut().zip(raw) {
        candidate.score = if max > 0.0 {
            (raw_score / max).clamp(0.0, 1.0)
        } else {
            NEUTRAL_SCORE
        };
    }

    sort_ranked(&mut candidates);
    candidates
}

/// Canonical result order: score, then recency, then path.
pub fn sort_ranked(candidates: &mut [Candidate]) {
    candidates.sort_by(compare_ranked);
}

/// Score order only. Stable, so equal scores keep the order they arrive in.
pub fn sort_by_score(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

pub fn compare_ranked(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.modified_at().cmp(&a.modified_at()))
        .then_with(|| a.path.cmp(&b.path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryConfig;
    use crate::models::{MatchType, META_MODIFIED};
    use crate::query::QueryComposer;
    use std::collections::BTreeMap;

    fn candidate(path: &str, body: &str) -> Candidate {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_BODY.to_string(), body.to_string());
        Candidate {
            path: path.to_string(),
            score: 0.0,
            match_type: MatchType::Content,
            snippet: String::new(),
            tokens_estimate: 0,
            metadata,
        }
    }

    fn compose(q: &str) -> ComposedQuery {
        QueryComposer::new(&QueryConfig::default()).compose(q)
    }

    #[test]
    fn test_filename_match_outranks_body_mention() {
        let ranked = rank(
            vec![
                candidate("notes/beta.md", "mentions alpha once"),
                candidate("notes/alpha.md", "nothing relevant here"),
            ],
            &compose("alpha"),
        );
        assert_eq!(ranked[0].path, "notes/alpha.md");
        assert!((ranked[0].score - 1.0).abs() < 1e-9);
        assert!(ranked[1].score > 0.0);
    }

    #[test]
    fn test_rare_term_weighs_more() {
        // "common" is in every doc, "rare" in one: the rare hit wins.
        let ranked = rank(
            vec![
                candidate("a.md", "common common common"),
                candidate("b.md", "common rare"),
                candidate("c.md", "common"),
            ],
            &compose("common rare"),
        );
        assert_eq!(ranked[0].path, "b.md");
    }

    #[test]
    fn test_scores_bounded() {
        let ranked = rank(
            vec![
                candidate("x.md", "alpha alpha alpha alpha"),
                candidate("alpha.md", "alpha"),
                candidate("y.md", "zzz"),
            ],
            &compose("alpha"),
        );
        for c in &ranked {
            assert!((0.0..=1.0).contains(&c.score), "score {}", c.score);
        }
    }

    #[test]
    fn test_rank_is_idempotent() {
        let q = compose("alpha beta");
        let once = rank(
            vec![
                candidate("a.md", "alpha"),
                candidate("b.md", "beta beta"),
                candidate("alpha-beta.md", "alpha beta"),
            ],
            &q,
        );
        let twice = rank(once.clone(), &q);
        let paths = |v: &[Candidate]| v.iter().map(|c| c.path.clone()).collect::<Vec<_>>();
        assert_eq!(paths(&once), paths(&twice));
        for (a, b) in once.iter().zip(&twice) {
            assert!((a.score - b.score).abs() < 1e-12);
        }
    }

    #[test]
    fn test_ties_broken_by_recency_then_path() {
        let mut older = candidate("b.md", "");
        older
            .metadata
            .insert(META_MODIFIED.into(), "2025-01-01T00:00:00Z".into());
        let mut newer = candidate("c.md", "");
        newer
            .metadata
            .insert(META_MODIFIED.into(), "2026-01-01T00:00:00Z".into());
        let undated = candidate("a.md", "");

        let ranked = rank(vec![older, undated, newer], &compose(""));
        let paths: Vec<&str> = ranked.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["c.md", "b.md", "a.md"]);
        assert!(ranked.iter().all(|c| c.score == NEUTRAL_SCORE));
    }

    #[test]
    fn test_file_stem() {
        assert_eq!(file_stem("notes/daily/2026-01-01.md"), "2026-01-01");
        assert_eq!(file_stem(".hidden"), ".hidden");
        assert_eq!(file_stem("README"), "README");
    }
}
