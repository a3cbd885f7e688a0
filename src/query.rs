//! Query composition: raw text → weighted terms + structured filters.
//!
//! Filters are written inline:
//!
//! | Syntax | Filter key |
//! |--------|-----------|
//! | `tag:work`, `#work` | `tag` |
//! | `path:projects/` | `path` |
//! | `ext:md` | `ext` |
//!
//! Remaining words are lowercased, stop words dropped, and each word is
//! emitted once per field (filename, content). Synonyms and language
//! variants (plural and gendered suffixes) are added at reduced weight.
//! Composition is a pure function of the input and the tables.

use std::collections::{BTreeMap, HashMap};

use crate::config::QueryConfig;
use crate::models::{ComposedQuery, Field, WeightedTerm};

const SYNONYM_WEIGHT: f64 = 0.6;
const VARIANT_WEIGHT: f64 = 0.8;

/// Built-in synonym groups; every member expands to the others.
const SYNONYM_GROUPS: &[&[&str]] = &[
    &["meeting", "reunion", "sync"],
    &["todo", "task", "pendiente", "tarea"],
    &["note", "nota"],
    &["project", "proyecto"],
    &["idea", "concept", "concepto"],
    &["bug", "issue", "error"],
    &["doc", "docs", "documentation", "documentacion"],
];

const STOP_WORDS: &[&str] = &[
    "a", "an", "and", "the", "of", "in", "on", "for", "to", "is", "are", "what", "how", "with",
    "el", "la", "los", "las", "de", "del", "en", "y", "un", "una", "que", "por", "para", "con",
];

pub struct QueryComposer {
    synonyms: HashMap<String, Vec<String>>,
    filename_weight: f64,
    content_weight: f64,
    language_variants: bool,
}

impl QueryComposer {
    pub fn new(config: &QueryConfig) -> Self {
        let mut synonyms: HashMap<String, Vec<String>> = HashMap::new();
        for group in SYNONYM_GROUPS {
            for word in group.iter() {
                let others = group
                    .iter()
                    .filter(|w| *w != word)
                    .map(|w| w.to_string());
                synonyms.entry(word.to_string()).or_default().extend(others);
            }
        }
        for (word, alts) in &config.synonyms {
            let word = word.to_lowercase();
            for alt in alts {
                let alt = alt.to_lowercase();
                synonyms.entry(word.clone()).or_default().push(alt.clone());
                synonyms.entry(alt).or_default().push(word.clone());
            }
        }
        for alts in synonyms.values_mut() {
            alts.sort();
            alts.dedup();
        }

        Self {
            synonyms,
            filename_weight: config.filename_weight,
            content_weight: config.content_weight,
            language_variants: config.language_variants,
        }
    }

    pub fn compose(&self, raw: &str) -> ComposedQuery {
        let mut filters: BTreeMap<String, String> = BTreeMap::new();
        let mut words: Vec<String> = Vec::new();

        for token in raw.split_whitespace() {
            if let Some((key, value)) = parse_filter(token) {
                filters
                    .entry(key.to_string())
                    .and_modify(|v| {
                        v.push(',');
                        v.push_str(&value);
                    })
                    .or_insert(value);
                continue;
            }
            words.extend(tokenize(token));
        }

        // (term, field) → best weight, first-seen order preserved.
        let mut order: Vec<(String, Field)> = Vec::new();
        let mut best: HashMap<(String, Field), (f64, bool)> = HashMap::new();
        let mut push = |term: &str, base: f64, original: bool| {
            for (field, field_weight) in [
                (Field::Filename, self.filename_weight),
                (Field::Content, self.content_weight),
            ] {
                let key = (term.to_string(), field);
                let weight = base * field_weight;
                match best.get_mut(&key) {
                    Some(slot) => {
                        if weight > slot.0 {
                            *slot = (weight, original || slot.1);
                        }
                    }
                    None => {
                        order.push(key.clone());
                        best.insert(key, (weight, original));
                    }
                }
            }
        };

        for word in &words {
            push(word, 1.0, true);
            if let Some(alts) = self.synonyms.get(word) {
                for alt in alts {
                    push(alt, SYNONYM_WEIGHT, false);
                }
            }
            if self.language_variants {
                for variant in variants(word) {
                    push(&variant, VARIANT_WEIGHT, false);
                }
            }
        }

        let expanded_terms = order
            .into_iter()
            .map(|key| {
                let (weight, original) = best[&key];
                WeightedTerm {
                    term: key.0,
                    weight,
                    field: key.1,
                    original,
                }
            })
            .collect();

        ComposedQuery {
            raw_text: raw.to_string(),
            expanded_terms,
            filters,
        }
    }
}

fn parse_filter(token: &str) -> Option<(&'static str, String)> {
    if let Some(tag) = token.strip_prefix('#') {
        let tag = tag.trim_matches(|c: char| c.is_ascii_punctuation() && c != '/' && c != '-');
        if !tag.is_empty() && !tag.chars().all(|c| c.is_numeric()) {
            return Some(("tag", tag.to_lowercase()));
        }
        return None;
    }
    let (key, value) = token.split_once(':')?;
    if value.is_empty() {
        return None;
    }
    match key.to_lowercase().as_str() {
        "tag" => Some(("tag", value.trim_start_matches('#').to_lowercase())),
        "path" => Some(("path", value.to_string())),
        "ext" => Some(("ext", value.trim_start_matches('.').to_lowercase())),
        _ => None,
    }
}

/// Lowercased alphanumeric words with stop words and 1-char tokens removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() >= 2 && !STOP_WORDS.contains(&w.as_str()))
        .collect()
}

/// Plural and gendered surface forms of `word` (English and Spanish rules).
pub fn variants(word: &str) -> Vec<String> {
    if word.chars().count() < 3 || word.chars().any(|c| c.is_numeric()) {
        return Vec::new();
    }
    let mut out: Vec<String> = Vec::new();
    let stem = |suffix: &str| word[..word.len() - suffix.len()].to_string();

    if let Some(base) = word.strip_suffix("ies") {
        out.push(format!("{}y", base));
    } else if word.ends_with("os") || word.ends_with("as") {
        let s = stem("os");
        out.push(format!("{}o", s));
        out.push(format!("{}a", s));
        out.push(format!("{}{}", s, if word.ends_with("os") { "as" } else { "os" }));
    } else if ["ses", "xes", "zes", "ches", "shes"]
        .iter()
        .any(|suffix| word.ends_with(suffix))
    {
        out.push(stem("es"));
    } else if word.ends_with("ss") || word.ends_with("us") || word.ends_with("is") {
        out.push(format!("{}es", word));
    } else if word.ends_with('s') {
        out.push(stem("s"));
    } else if word.ends_with('o') || word.ends_with('a') {
        let s = stem("o");
        let other = if word.ends_with('o') { 'a' } else { 'o' };
        out.push(format!("{}{}", s, other));
        out.push(format!("{}s", word));
        out.push(format!("{}{}s", s, other));
    } else if word.ends_with('y') {
        out.push(format!("{}ies", stem("y")));
    } else {
        out.push(format!("{}s", word));
        if !word.ends_with('e') {
            out.push(format!("{}es", word));
        }
    }

    out.retain(|v| v != word && v.chars().count() >= 2);
    out.sort();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composer() -> QueryComposer {
        QueryComposer::new(&QueryConfig::default())
    }

    fn weight(q: &ComposedQuery, term: &str, field: Field) -> Option<f64> {
        q.expanded_terms
            .iter()
            .find(|t| t.term == term && t.field == field)
            .map(|t| t.weight)
    }

    #[test]
    fn test_filename_weighted_twice_content() {
        let q = composer().compose("alpha");
        let f = weight(&q, "alpha", Field::Filename).unwrap();
        let c = weight(&q, "alpha", Field::Content).unwrap();
        assert!((f - 2.0 * c).abs() < 1e-9);
    }

    #[test]
    fn test_filters_extracted() {
        let q = composer().compose("budget #Finance path:projects/ ext:.md tag:q3");
        assert_eq!(q.filters["tag"], "finance,q3");
        assert_eq!(q.filters["path"], "projects/");
        assert_eq!(q.filters["ext"], "md");
        assert!(q.expanded_terms.iter().all(|t| !t.term.contains(':')));
        assert!(weight(&q, "budget", Field::Content).is_some());
    }

    #[test]
    fn test_synonyms_reduced_weight() {
        let q = composer().compose("meeting");
        let syn = weight(&q, "reunion", Field::Content).unwrap();
        let orig = weight(&q, "meeting", Field::Content).unwrap();
        assert!(syn < orig);
        let t = q.expanded_terms.iter().find(|t| t.term == "reunion").unwrap();
        assert!(!t.original);
    }

    #[test]
    fn test_config_synonyms_are_symmetric() {
        let mut cfg = QueryConfig::default();
        cfg.synonyms
            .insert("k8s".to_string(), vec!["Kubernetes".to_string()]);
        let c = QueryComposer::new(&cfg);
        assert!(weight(&c.compose("kubernetes"), "k8s", Field::Content).is_some());
    }

    #[test]
    fn test_language_variants() {
        assert_eq!(variants("notes"), vec!["note"]);
        assert_eq!(variants("stories"), vec!["story"]);
        assert_eq!(variants("amigo"), vec!["amiga", "amigas", "amigos"]);
        assert_eq!(variants("amigas"), vec!["amiga", "amigo", "amigos"]);
        assert!(variants("x1").is_empty());
    }

    #[test]
    fn test_stop_words_and_empty() {
        let q = composer().compose("the   ");
        assert!(q.expanded_terms.is_empty());
        assert!(q.is_browse());
        assert!(composer().compose("").is_browse());
    }

    #[test]
    fn test_compose_is_deterministic() {
        let a = composer().compose("project status notes");
        let b = composer().compose("project status notes");
        assert_eq!(a.expanded_terms, b.expanded_terms);
    }
}
