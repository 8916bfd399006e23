/// Sequential insertion: place a queue of new candidates one at a time.
///
/// Used for bulk onboarding and for ranking a friend's games you haven't
/// ranked. Each candidate is fully persisted before the next one fetches its
/// prefix, so every session sees all earlier insertions of the batch.
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::EngineConfig;
use crate::error::RankError;
use crate::policy::ComparisonPolicy;
use crate::retry::with_retry;
use crate::session::{Phase, RankingSession, UndoOutcome};
use crate::shift::{Removal, ShiftProtocol};
use crate::store::OrderedStore;
use crate::types::{CandidateItem, Placement, Progress, RankedItem, UserId};
use crate::undo::UndoStack;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PlacedCandidate {
    pub candidate: CandidateItem,
    pub placement: Placement,
}

/// Outcome of a batch so far.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BatchReport {
    pub placed: Vec<PlacedCandidate>,
    /// Skipped by the caller after a failure, or already ranked.
    pub skipped: Vec<CandidateItem>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.placed.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchStep {
    Compare { candidate: CandidateItem, opponent: RankedItem },
    /// A store call is needed before the next comparison: `retry` it, or
    /// `skip` the candidate. `placement` is set when the position is
    /// already decided and only the save is outstanding.
    Waiting { candidate: CandidateItem, placement: Option<Placement> },
    Complete(BatchReport),
}

pub struct SequentialInsertionWorkflow<S: OrderedStore> {
    store: Arc<S>,
    user: UserId,
    config: EngineConfig,
    queue: VecDeque<CandidateItem>,
    total: usize,
    session: Option<RankingSession>,
    placed: UndoStack<PlacedCandidate>,
    skipped: Vec<CandidateItem>,
}

impl<S: OrderedStore> SequentialInsertionWorkflow<S> {
    pub fn new(store: Arc<S>, user: UserId, candidates: Vec<CandidateItem>, config: EngineConfig) -> Self {
        SequentialInsertionWorkflow {
            store,
            user,
            config,
            total: candidates.len(),
            queue: candidates.into(),
            session: None,
            placed: UndoStack::new(),
            skipped: Vec::new(),
        }
    }

    /// Construct and load the first candidate.
    pub async fn begin(
        store: Arc<S>,
        user: UserId,
        candidates: Vec<CandidateItem>,
        config: EngineConfig,
    ) -> Result<Self, RankError> {
        let mut workflow = Self::new(store, user, candidates, config);
        info!(user = %workflow.user, total = workflow.total, "batch started");
        workflow.advance().await?;
        Ok(workflow)
    }

    pub fn progress(&self) -> Progress {
        Progress { current: self.placed.len() + self.skipped.len(), total: self.total }
    }

    pub fn report(&self) -> BatchReport {
        BatchReport {
            placed: self.placed.iter().cloned().collect(),
            skipped: self.skipped.clone(),
        }
    }

    pub fn current_step(&self) -> BatchStep {
        match &self.session {
            Some(session) => match session.phase() {
                Phase::AwaitingChoice { pivot } => match session.prefix().get(pivot) {
                    Some(opponent) => BatchStep::Compare {
                        candidate: session.candidate().clone(),
                        opponent: opponent.clone(),
                    },
                    None => BatchStep::Waiting { candidate: session.candidate().clone(), placement: None },
                },
                _ => BatchStep::Waiting {
                    candidate: session.candidate().clone(),
                    placement: session.placement(),
                },
            },
            None => match self.queue.front() {
                Some(next) => BatchStep::Waiting { candidate: next.clone(), placement: None },
                None => BatchStep::Complete(self.report()),
            },
        }
    }

    /// Apply a choice for the current comparison; persists and moves on to
    /// the next candidate when the position becomes final.
    pub async fn resolve_comparison(&mut self, candidate_won: bool) -> Result<BatchStep, RankError> {
        if let Some(session) = self.session.as_mut() {
            session.resolve_choice(candidate_won);
            if session.is_terminal() {
                return self.advance().await;
            }
        }
        Ok(self.current_step())
    }

    /// Redo whatever store call last failed (loading a prefix or saving).
    pub async fn retry(&mut self) -> Result<BatchStep, RankError> {
        self.advance().await
    }

    /// Give up on the current candidate and continue with the next.
    pub async fn skip(&mut self) -> Result<BatchStep, RankError> {
        let dropped = match self.session.take() {
            Some(session) => Some(session.candidate().clone()),
            None => self.queue.pop_front(),
        };
        if let Some(candidate) = dropped {
            warn!(user = %self.user, item = %candidate.item_id, "candidate skipped");
            self.skipped.push(candidate);
        }
        self.advance().await
    }

    /// Step back one comparison, or, with none left in the current session,
    /// take back the most recently placed candidate and rank it again.
    ///
    /// Returns false when there is nothing to undo.
    pub async fn undo_last(&mut self) -> Result<bool, RankError> {
        if let Some(session) = self.session.as_mut() {
            if let UndoOutcome::Restored(_) = session.undo() {
                return Ok(true);
            }
        }

        let Some(last) = self.placed.pop() else {
            return Ok(false);
        };
        let protocol = ShiftProtocol::new(self.store.as_ref(), &self.user, &self.config.retry);
        if let Err(e) = protocol.remove(&last.candidate.item_id, Removal::Delete).await {
            self.placed.push(last);
            return Err(e);
        }

        if let Some(session) = self.session.take() {
            self.queue.push_front(session.candidate().clone());
            session.cancel();
        }
        info!(user = %self.user, item = %last.candidate.item_id, "placement taken back");
        self.queue.push_front(last.candidate);
        self.advance().await?;
        Ok(true)
    }

    /// Stop the batch. Placed candidates stay placed.
    pub fn cancel(mut self) -> BatchReport {
        if let Some(session) = self.session.take() {
            session.cancel();
        }
        let report = self.report();
        info!(user = %self.user, placed = report.placed.len(), "batch cancelled");
        report
    }

    /// Drive until a comparison needs the user, the batch is done, or a
    /// store call fails.
    async fn advance(&mut self) -> Result<BatchStep, RankError> {
        loop {
            if let Some(session) = &self.session {
                if !session.is_terminal() {
                    return Ok(self.current_step());
                }
                self.persist_current().await?;
                continue;
            }

            if self.queue.is_empty() {
                let report = self.report();
                info!(user = %self.user, placed = report.placed.len(), skipped = report.skipped.len(), "batch complete");
                return Ok(BatchStep::Complete(report));
            }

            let prefix = with_retry(&self.config.retry, "fetch_ranked_items", || {
                self.store.fetch_ranked_items(&self.user)
            })
            .await?;

            let Some(candidate) = self.queue.pop_front() else {
                continue;
            };
            if prefix.iter().any(|r| r.item_id == candidate.item_id) {
                warn!(user = %self.user, item = %candidate.item_id, "already ranked, skipping");
                self.skipped.push(candidate);
                continue;
            }
            self.session = Some(RankingSession::begin(
                candidate,
                prefix,
                ComparisonPolicy::new(self.config.policy),
            ));
        }
    }

    async fn persist_current(&mut self) -> Result<(), RankError> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let placement = session.placement().ok_or(RankError::NotTerminal)?;
        let candidate = session.candidate().clone();
        let protocol = ShiftProtocol::new(self.store.as_ref(), &self.user, &self.config.retry);
        protocol.insert(&candidate.item_id, placement.position, Some(session.prefix())).await?;

        self.session = None;
        self.placed.push(PlacedCandidate { candidate, placement });
        Ok(())
    }
}
