//! Metadata boosts applied after relevance ranking.
//!
//! Three multiplicative factors:
//!
//! - **path**: product of the weights of every `path_boosts` glob the path matches
//! - **tag**: product of the weights of every `tag_boosts` tag the note carries
//! - **freshness**: `2^(-w · age / half_life)`, with `w = freshness_weight`.
//!   It falls monotonically toward zero as a note ages; at `w = 1` the score
//!   halves every `half_life_days`.
//!
//! The boosted score is clamped to `[0, 1]`. Boosts must not let a
//! less relevant candidate overtake a more relevant one, so each candidate's
//! boosted score is capped at the lowest boosted score of every candidate
//! with strictly higher relevance. Candidates of equal relevance are free to
//! reorder. A candidate that matches a table weight above `1.0` is an
//! explicit override and is exempt from the cap.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobMatcher};
use std::collections::HashMap;

use crate::config::RankingConfig;
use crate::error::{Result, VaultError};
use crate::models::Candidate;
use crate::rank::{sort_by_score, sort_ranked};

pub struct MetadataBoost {
    paths: Vec<(GlobMatcher, f64)>,
    tags: HashMap<String, f64>,
    half_life_days: f64,
    freshness_weight: f64,
}

impl MetadataBoost {
    pub fn new(config: &RankingConfig) -> Result<Self> {
        let mut paths = Vec::with_capacity(config.path_boosts.len());
        for (pattern, weight) in &config.path_boosts {
            let glob = Glob::new(pattern).map_err(|e| {
                VaultError::Validation(format!("invalid path boost '{}': {}", pattern, e))
            })?;
            paths.push((glob.compile_matcher(), *weight));
        }
        let tags = config
            .tag_boosts
            .iter()
            .map(|(tag, w)| (tag.trim_start_matches('#').to_lowercase(), *w))
            .collect();

        Ok(Self {
            paths,
            tags,
            half_life_days: config.half_life_days,
            freshness_weight: config.freshness_weight.clamp(0.0, 1.0),
        })
    }

    /// Boost factor for one candidate at `now`.
    pub fn factor(&self, candidate: &Candidate, now: DateTime<Utc>) -> f64 {
        self.table_weights(candidate)
            .iter()
            .product::<f64>()
            * self.freshness(candidate.modified_at(), now)
    }

    /// Weights of every path glob and tag entry the candidate matches.
    fn table_weights(&self, candidate: &Candidate) -> Vec<f64> {
        let mut weights: Vec<f64> = self
            .paths
            .iter()
            .filter(|(m, _)| m.is_match(&candidate.path))
            .map(|(_, w)| *w)
            .collect();
        weights.extend(
            candidate
                .tags()
                .iter()
                .filter_map(|t| self.tags.get(&t.to_lowercase())),
        );
        weights
    }

    fn is_override(&self, candidate: &Candidate) -> bool {
        self.table_weights(candidate).iter().any(|w| *w > 1.0)
    }

    /// Unknown modification times decay as if one half-life old.
    fn freshness(&self, modified_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
        let w = self.freshness_weight;
        if w == 0.0 {
            return 1.0;
        }
        let age_days = match modified_at {
            Some(ts) => ((now - ts).num_seconds().max(0) as f64) / 86_400.0,
            None => self.half_life_days,
        };
        0.5_f64.powf(w * age_days / self.half_life_days)
    }

    pub fn apply(&self, candidates: Vec<Candidate>) -> Vec<Candidate> {
        self.apply_at(candidates, Utc::now())
    }

    /// Apply boosts as of `now` and re-sort.
    pub fn apply_at(&self, mut candidates: Vec<Candidate>, now: DateTime<Utc>) -> Vec<Candidate> {
        sort_ranked(&mut candidates);

        // Lowest boosted score among strictly more relevant candidates.
        let mut ceiling = f64::INFINITY;
        let mut group_relevance: Option<f64> = None;
        let mut group_floor = f64::INFINITY;
        for c in candidates.iter_mut() {
            if group_relevance.is_some_and(|r| c.score < r) {
                ceiling = ceiling.min(group_floor);
                group_floor = f64::INFINITY;
            }
            group_relevance = Some(c.score);

            let mut boosted = (c.score * self.factor(c, now)).clamp(0.0, 1.0);
            if !self.is_override(c) {
                boosted = boosted.min(ceiling);
            }
            group_floor = group_floor.min(boosted);
            c.score = boosted;
        }

        // Capped ties keep relevance order.
        sort_by_score(&mut candidates);
        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MatchType, META_MODIFIED, META_TAGS};
    use chrono::{Duration, TimeZone};
    use std::collections::BTreeMap;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
    }

    fn candidate(path: &str, score: f64, tags: &str, age_days: Option<i64>) -> Candidate {
        let mut metadata = BTreeMap::new();
        metadata.insert(META_TAGS.to_string(), tags.to_string());
        if let Some(days) = age_days {
            metadata.insert(
                META_MODIFIED.to_string(),
                (now() - Duration::days(days)).to_rfc3339(),
            );
        }
        Candidate {
            path: path.to_string(),
            score,
            match_type: MatchType::Content,
            snippet: String::new(),
            tokens_estimate: 0,
            metadata,
        }
    }

    fn config() -> RankingConfig {
        let mut cfg = RankingConfig::default();
        cfg.path_boosts.insert("archive/**".into(), 0.5);
        cfg.tag_boosts.insert("#draft".into(), 0.8);
        cfg
    }

    #[test]
    fn test_freshness_half_life() {
        let boost = MetadataBoost::new(&config()).unwrap();
        let w = config().freshness_weight;
        let fresh = boost.freshness(Some(now()), now());
        let one = boost.freshness(Some(now() - Duration::days(30)), now());
        assert!((fresh - 1.0).abs() < 1e-9);
        assert!((one - 0.5_f64.powf(w)).abs() < 1e-6);
        assert!(boost.freshness(None, now()) < fresh);
    }

    #[test]
    fn test_freshness_decays_toward_zero() {
        let boost = MetadataBoost::new(&RankingConfig::default()).unwrap();
        let mut last = 1.0;
        for days in [1, 30, 365, 3650] {
            let f = boost.freshness(Some(now() - Duration::days(days)), now());
            assert!(f < last);
            last = f;
        }
        assert!(last < 1e-6);
    }

    #[test]
    fn test_fresh_weak_match_stays_below_old_exact_match() {
        let boost = MetadataBoost::new(&RankingConfig::default()).unwrap();
        let out = boost.apply_at(
            vec![
                candidate("notes/exact.md", 1.0, "", Some(365)),
                candidate("notes/weak.md", 0.72, "", Some(0)),
            ],
            now(),
        );
        assert_eq!(out[0].path, "notes/exact.md");
        assert!(out[1].score <= out[0].score);
        assert!(out[0].score < 0.2);

        // Later stages keep the order when the capped scores tie.
        let kept = crate::dedup::Deduplicator::new(0.99).dedupe(out);
        assert_eq!(kept[0].path, "notes/exact.md");
    }

    #[test]
    fn test_equal_relevance_reordered_by_freshness() {
        let boost = MetadataBoost::new(&RankingConfig::default()).unwrap();
        let out = boost.apply_at(
            vec![
                candidate("notes/top.md", 1.0, "", Some(0)),
                candidate("notes/old.md", 0.5, "", Some(90)),
                candidate("notes/new.md", 0.5, "", Some(1)),
            ],
            now(),
        );
        let paths: Vec<&str> = out.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["notes/top.md", "notes/new.md", "notes/old.md"]);
        assert!(out[1].score > out[2].score);
    }

    #[test]
    fn test_path_and_tag_demote() {
        let boost = MetadataBoost::new(&config()).unwrap();
        let out = boost.apply_at(
            vec![
                candidate("archive/old.md", 1.0, "", Some(0)),
                candidate("notes/draft.md", 1.0, "draft", Some(0)),
                candidate("notes/plain.md", 1.0, "", Some(0)),
            ],
            now(),
        );
        let paths: Vec<&str> = out.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["notes/plain.md", "notes/draft.md", "archive/old.md"]);
        assert!((out[2].score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_weights_at_most_one_never_raise() {
        let boost = MetadataBoost::new(&config()).unwrap();
        let out = boost.apply_at(
            vec![
                candidate("notes/exact.md", 1.0, "", Some(400)),
                candidate("notes/weak.md", 0.2, "", Some(0)),
            ],
            now(),
        );
        assert_eq!(out[0].path, "notes/exact.md");
        assert!(out.iter().all(|c| c.score <= 1.0));
        assert!(out[1].score <= 0.2);
    }

    #[test]
    fn test_override_can_lift_and_is_clamped() {
        let mut cfg = config();
        cfg.path_boosts.insert("pinned/**".into(), 10.0);
        let boost = MetadataBoost::new(&cfg).unwrap();
        let out = boost.apply_at(
            vec![
                candidate("notes/exact.md", 1.0, "", Some(0)),
                candidate("pinned/weak.md", 0.2, "", Some(0)),
            ],
            now(),
        );
        assert_eq!(out[0].path, "notes/exact.md");
        assert_eq!(out[0].score, 1.0);
        assert_eq!(out[1].score, 1.0);
    }

    #[test]
    fn test_invalid_glob_rejected() {
        let mut cfg = RankingConfig::default();
        cfg.path_boosts.insert("[".into(), 1.0);
        assert!(matches!(
            MetadataBoost::new(&cfg),
            Err(VaultError::Validation(_))
        ));
    }
}
