//! Token-budgeted context assembly.
//!
//! Candidates are taken greedily in score order. The first candidate that
//! does not fit ends assembly; if the remaining budget is at least
//! `min_partial_tokens`, a truncated prefix of it is included first.
//! The assembled block never exceeds the budget.

use crate::error::{Result, VaultError};
use crate::models::{Candidate, ContextBlock, ContextChunk};
use std::cmp::Ordering;

/// Approximate chars-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Appended to truncated chunk text.
const ELLIPSIS: &str = "…";

/// Token estimate for `text`: characters divided by four, rounded up.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

pub struct ContextAssembler {
    min_partial_tokens: usize,
}

impl ContextAssembler {
    pub fn new(min_partial_tokens: usize) -> Self {
        Self {
            min_partial_tokens: min_partial_tokens.max(1),
        }
    }

    pub fn assemble(&self, candidates: &[Candidate], budget: usize) -> ContextBlock {
        let mut ordered: Vec<&Candidate> = candidates.iter().collect();
        ordered.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

        let mut chunks: Vec<ContextChunk> = Vec::new();
        let mut used = 0usize;
        for candidate in ordered {
            let text = chunk_text(candidate);
            if text.is_empty() {
                continue;
            }
            let tokens = estimate_tokens(text);
            let remaining = budget - used;
            if tokens <= remaining {
                used += tokens;
                chunks.push(ContextChunk {
                    source_path: candidate.path.clone(),
                    text: text.to_string(),
                    tokens,
                    score: candidate.score,
                    truncated: false,
                });
                continue;
            }
            if remaining >= self.min_partial_tokens {
                let partial = truncate_to_tokens(text, remaining);
                let tokens = estimate_tokens(&partial);
                if !partial.is_empty() && tokens <= remaining {
                    used += tokens;
                    chunks.push(ContextChunk {
                        source_path: candidate.path.clone(),
                        text: partial,
                        tokens,
                        score: candidate.score,
                        truncated: true,
                    });
                }
            }
            break;
        }

        ContextBlock {
            chunks,
            total_tokens: used,
            budget,
        }
    }
}

impl ContextBlock {
    /// Re-check the budget invariant on an assembled block.
    pub fn verify(&self) -> Result<()> {
        let counted: usize = self.chunks.iter().map(|c| c.tokens).sum();
        if counted != self.total_tokens || self.total_tokens > self.budget {
            return Err(VaultError::BudgetExceeded {
                used: counted.max(self.total_tokens),
                budget: self.budget,
            });
        }
        Ok(())
    }
}

fn chunk_text(candidate: &Candidate) -> &str {
    candidate.snippet.trim()
}

/// Longest prefix (cut at whitespace when possible) that, with the
/// ellipsis appended, fits in `max_tokens`.
fn truncate_to_tokens(text: &str, max_tokens: usize) -> String {
    let max_chars = (max_tokens * CHARS_PER_TOKEN).saturating_sub(ELLIPSIS.chars().count());
    if max_chars == 0 {
        return String::new();
    }
    let cut = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let head = &text[..cut];
    let head = match head.rfind(char::is_whitespace) {
        Some(pos) if pos > head.len() / 2 => &head[..pos],
        _ => head,
    };
    format!("{}{}", head.trim_end(), ELLIPSIS)
}
