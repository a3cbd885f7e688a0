//! Retrieval pipeline: compose → aggregate → rank → dedupe → assemble.
//!
//! ```text
//! Composing → Aggregating → Ranking → Deduplicating → Assembling → Done
//!      └───────────┴────────────┴────────────┴──────────────┴──→ Failed
//! ```
//!
//! Stages only move forward. Any stage may fail, which ends the run in
//! [`PipelineStage::Failed`]. A [`PipelineTrace`] records how long each
//! completed stage took and is returned with every result.

use serde::Serialize;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::aggregate::Aggregator;
use crate::boost::MetadataBoost;
use crate::context::ContextAssembler;
use crate::dedup::Deduplicator;
use crate::discovery::SkippedPath;
use crate::error::{Result, VaultError};
use crate::models::{Candidate, ComposedQuery, ContextBlock, META_BODY};
use crate::query::QueryComposer;
use crate::rank::rank;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Composing,
    Aggregating,
    Ranking,
    Deduplicating,
    Assembling,
    Done,
    Failed,
}

impl PipelineStage {
    /// The stage that follows on success, `None` for terminal stages.
    pub fn next(self) -> Option<PipelineStage> {
        use PipelineStage::*;
        match self {
            Composing => Some(Aggregating),
            Aggregating => Some(Ranking),
            Ranking => Some(Deduplicating),
            Deduplicating => Some(Assembling),
            Assembling => Some(Done),
            Done | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStage::Done | PipelineStage::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageTiming {
    pub stage: PipelineStage,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineTrace {
    pub stages: Vec<StageTiming>,
    pub outcome: PipelineStage,
    pub total_ms: u64,
}

/// Tracks one run through the stages.
#[derive(Debug)]
pub struct PipelineRun {
    stage: PipelineStage,
    started: Instant,
    stage_started: Instant,
    stages: Vec<StageTiming>,
}

impl PipelineRun {
    pub fn start() -> Self {
        let now = Instant::now();
        Self {
            stage: PipelineStage::Composing,
            started: now,
            stage_started: now,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self) -> PipelineStage {
        self.stage
    }

    /// Complete the current stage and move to the next one.
    pub fn advance(&mut self) -> Result<PipelineStage> {
        let next = self.stage.next().ok_or_else(|| {
            VaultError::Validation(format!("pipeline already finished in {:?}", self.stage))
        })?;
        self.stages.push(StageTiming {
            stage: self.stage,
            elapsed_ms: self.stage_started.elapsed().as_millis() as u64,
        });
        tracing::debug!(from = ?self.stage, to = ?next, "pipeline stage complete");
        self.stage = next;
        self.stage_started = Instant::now();
        Ok(next)
    }

    /// Complete `stage` and mark the run `Done`; later stages are skipped.
    fn finish_at(&mut self, stage: PipelineStage) -> Result<()> {
        while self.stage != stage {
            self.advance()?;
        }
        self.stages.push(StageTiming {
            stage: self.stage,
            elapsed_ms: self.stage_started.elapsed().as_millis() as u64,
        });
        self.stage = PipelineStage::Done;
        Ok(())
    }

    pub fn fail(&mut self, err: &VaultError) {
        tracing::warn!(stage = ?self.stage, error = %err, "pipeline failed");
        self.stage = PipelineStage::Failed;
    }

    pub fn trace(&self) -> PipelineTrace {
        PipelineTrace {
            stages: self.stages.clone(),
            outcome: self.stage,
            total_ms: self.started.elapsed().as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchOutput {
    pub query: ComposedQuery,
    pub candidates: Vec<Candidate>,
    pub partial: bool,
    pub browse: bool,
    pub skipped: Vec<SkippedPath>,
    pub trace: PipelineTrace,
}

#[derive(Debug, Clone, Serialize)]
pub struct AskOutput {
    pub query: ComposedQuery,
    pub context: ContextBlock,
    pub candidates: Vec<Candidate>,
    pub partial: bool,
    pub skipped: Vec<SkippedPath>,
    pub trace: PipelineTrace,
}

pub struct Pipeline {
    composer: QueryComposer,
    aggregator: Aggregator,
    boost: MetadataBoost,
    dedup: Deduplicator,
    assembler: ContextAssembler,
}

/// Ranked candidates plus what aggregation reported.
struct Retrieved {
    query: ComposedQuery,
    candidates: Vec<Candidate>,
    partial: bool,
    browse: bool,
    skipped: Vec<SkippedPath>,
}

impl Pipeline {
    pub fn new(
        composer: QueryComposer,
        aggregator: Aggregator,
        boost: MetadataBoost,
        dedup: Deduplicator,
        assembler: ContextAssembler,
    ) -> Self {
        Self {
            composer,
            aggregator,
            boost,
            dedup,
            assembler,
        }
    }

    pub fn composer(&self) -> &QueryComposer {
        &self.composer
    }

    /// Ranked, deduplicated candidates without context assembly.
    pub async fn search(
        &self,
        raw: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<SearchOutput> {
        let mut run = PipelineRun::start();
        let result = async {
            let r = self.retrieve(&mut run, raw, limit, cancel).await?;
            run.finish_at(PipelineStage::Deduplicating)?;
            Ok::<_, VaultError>(r)
        }
        .await;

        match result {
            Ok(r) => {
                let trace = run.trace();
                tracing::info!(
                    query = raw,
                    results = r.candidates.len(),
                    partial = r.partial,
                    total_ms = trace.total_ms,
                    "search finished"
                );
                Ok(SearchOutput {
                    query: r.query,
                    candidates: strip_bodies(r.candidates, limit),
                    partial: r.partial,
                    browse: r.browse,
                    skipped: r.skipped,
                    trace,
                })
            }
            Err(err) => {
                run.fail(&err);
                Err(err)
            }
        }
    }

    /// Full pipeline ending in a token-budgeted [`ContextBlock`].
    pub async fn ask(
        &self,
        raw: &str,
        budget: usize,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<AskOutput> {
        let mut run = PipelineRun::start();
        let result = async {
            let r = self.retrieve(&mut run, raw, limit, cancel).await?;
            run.advance()?; // → Assembling
            checkpoint(cancel)?;
            let context = self.assembler.assemble(&r.candidates, budget);
            context.verify()?;
            run.advance()?; // → Done
            Ok::<_, VaultError>((r, context))
        }
        .await;

        match result {
            Ok((r, context)) => {
                let trace = run.trace();
                tracing::info!(
                    query = raw,
                    chunks = context.chunks.len(),
                    tokens = context.total_tokens,
                    budget,
                    partial = r.partial,
                    total_ms = trace.total_ms,
                    "ask finished"
                );
                Ok(AskOutput {
                    query: r.query,
                    context,
                    candidates: strip_bodies(r.candidates, limit),
                    partial: r.partial,
                    skipped: r.skipped,
                    trace,
                })
            }
            Err(err) => {
                run.fail(&err);
                Err(err)
            }
        }
    }

    /// Composing through Deduplicating. Leaves `run` in `Deduplicating`.
    async fn retrieve(
        &self,
        run: &mut PipelineRun,
        raw: &str,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<Retrieved> {
        checkpoint(cancel)?;
        let query = self.composer.compose(raw);
        run.advance()?; // → Aggregating

        let outcome = self.aggregator.aggregate(&query, limit, cancel).await?;
        run.advance()?; // → Ranking

        checkpoint(cancel)?;
        let ranked = rank(outcome.candidates, &query);
        let boosted = self.boost.apply(ranked);
        run.advance()?; // → Deduplicating

        checkpoint(cancel)?;
        let candidates = self.dedup.dedupe(boosted);

        Ok(Retrieved {
            query,
            candidates,
            partial: outcome.partial,
            browse: outcome.browse,
            skipped: outcome.skipped,
        })
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(VaultError::Cancelled)
    } else {
        Ok(())
    }
}

/// Drop note bodies (kept only for ranking) and cap the list.
fn strip_bodies(mut candidates: Vec<Candidate>, limit: usize) -> Vec<Candidate> {
    candidates.truncate(limit.max(1));
    for c in candidates.iter_mut() {
        c.metadata.remove(META_BODY);
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order() {
        let mut run = PipelineRun::start();
        let mut seen = vec![run.stage()];
        while !run.stage().is_terminal() {
            seen.push(run.advance().unwrap());
        }
        assert_eq!(
            seen,
            vec![
                PipelineStage::Composing,
                PipelineStage::Aggregating,
                PipelineStage::Ranking,
                PipelineStage::Deduplicating,
                PipelineStage::Assembling,
                PipelineStage::Done,
            ]
        );
        assert_eq!(run.trace().stages.len(), 5);
        assert!(run.advance().is_err());
    }

    #[test]
    fn test_fail_is_terminal() {
        let mut run = PipelineRun::start();
        run.advance().unwrap();
        run.fail(&VaultError::Cancelled);
        assert_eq!(run.stage(), PipelineStage::Failed);
        assert!(run.stage().is_terminal());
        assert!(run.advance().is_err());
        assert_eq!(run.trace().outcome, PipelineStage::Failed);
    }

    #[test]
    fn test_finish_at_marks_done() {
        let mut run = PipelineRun::start();
        run.finish_at(PipelineStage::Deduplicating).unwrap();
        let trace = run.trace();
        assert_eq!(trace.outcome, PipelineStage::Done);
        assert_eq!(trace.stages.last().unwrap().stage, PipelineStage::Deduplicating);
    }

    #[test]
    fn test_checkpoint() {
        let cancel = CancellationToken::new();
        assert!(checkpoint(&cancel).is_ok());
        cancel.cancel();
        assert!(matches!(checkpoint(&cancel), Err(VaultError::Cancelled)));
    }
}
