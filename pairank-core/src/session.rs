/// Binary-insertion session for placing one candidate into a ranked prefix.
///
/// Pure in-memory state machine: `NotStarted -> AwaitingChoice -> Resolving ->
/// Terminal`. Nothing here touches the store; the owning workflow persists the
/// final position once the session reaches Terminal.
use tracing::debug;

use crate::error::RankError;
use crate::policy::{ComparisonPolicy, Decision};
use crate::types::{CandidateItem, Placement, RankedItem};
use crate::undo::UndoStack;

/// Bounds and counter captured before each comparison is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub low: i64,
    pub high: i64,
    pub comparison_count: u32,
}

/// Observable search state. `low`/`high` are inclusive 0-based indices into
/// the ranked prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionState {
    pub low: i64,
    pub high: i64,
    pub comparison_count: u32,
    pub max_comparisons: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    NotStarted,
    AwaitingChoice { pivot: usize },
    /// Transient while a choice is being applied.
    Resolving,
    Terminal(Placement),
}

/// What the caller should show next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison<'a> {
    Pending { candidate: &'a CandidateItem, opponent: &'a RankedItem },
    Terminal(Placement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    Restored(SessionState),
    /// No comparison left to undo in this session; the workflow has to step
    /// back to the previous item.
    WorkflowLevelUndoRequired,
}

#[derive(Debug, Clone)]
pub struct RankingSession {
    candidate: CandidateItem,
    /// Sorted ascending by position.
    prefix: Vec<RankedItem>,
    policy: ComparisonPolicy,
    low: i64,
    high: i64,
    comparison_count: u32,
    phase: Phase,
    history: UndoStack<SessionSnapshot>,
}

impl RankingSession {
    pub fn new(candidate: CandidateItem, mut prefix: Vec<RankedItem>, policy: ComparisonPolicy) -> Self {
        prefix.sort_by_key(|r| r.position);
        RankingSession {
            candidate,
            prefix,
            policy,
            low: 0,
            high: -1,
            comparison_count: 0,
            phase: Phase::NotStarted,
            history: UndoStack::new(),
        }
    }

    /// Construct and start in one step.
    pub fn begin(candidate: CandidateItem, prefix: Vec<RankedItem>, policy: ComparisonPolicy) -> Self {
        let mut session = Self::new(candidate, prefix, policy);
        session.start();
        session
    }

    /// Reset bounds to the whole prefix and ask the policy for the first step.
    /// An empty prefix goes straight to Terminal at position 1.
    pub fn start(&mut self) -> Phase {
        self.low = 0;
        self.high = self.prefix.len() as i64 - 1;
        self.comparison_count = 0;
        self.history.clear();
        self.apply_decision();
        debug!(item = %self.candidate.item_id, prefix_len = self.prefix.len(), phase = ?self.phase, "session started");
        self.phase
    }

    pub fn candidate(&self) -> &CandidateItem {
        &self.candidate
    }

    pub fn prefix(&self) -> &[RankedItem] {
        &self.prefix
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn state(&self) -> SessionState {
        SessionState {
            low: self.low,
            high: self.high,
            comparison_count: self.comparison_count,
            max_comparisons: self.policy.max_comparisons(),
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.phase, Phase::Terminal(_))
    }

    pub fn placement(&self) -> Option<Placement> {
        match self.phase {
            Phase::Terminal(p) => Some(p),
            _ => None,
        }
    }

    /// The opponent for the comparison currently awaiting a choice.
    pub fn present_pivot(&self) -> Result<Option<&RankedItem>, RankError> {
        match self.phase {
            Phase::AwaitingChoice { pivot } => self
                .prefix
                .get(pivot)
                .map(Some)
                .ok_or(RankError::EmptyOpponentSet { index: pivot, len: self.prefix.len() }),
            _ => Ok(None),
        }
    }

    pub fn current_comparison(&self) -> Result<Comparison<'_>, RankError> {
        match self.phase {
            Phase::Terminal(p) => Ok(Comparison::Terminal(p)),
            Phase::NotStarted | Phase::Resolving => Err(RankError::NotStarted),
            Phase::AwaitingChoice { .. } => {
                let opponent = self.present_pivot()?.ok_or(RankError::NotStarted)?;
                Ok(Comparison::Pending { candidate: &self.candidate, opponent })
            }
        }
    }

    /// Apply the user's choice for the current pivot.
    ///
    /// `candidate_won` moves the search toward position 1. Calling this when
    /// no comparison is pending leaves the session untouched.
    pub fn resolve_choice(&mut self, candidate_won: bool) -> SessionState {
        let Phase::AwaitingChoice { pivot } = self.phase else {
            debug!(item = %self.candidate.item_id, phase = ?self.phase, "no pending comparison to resolve");
            return self.state();
        };
        self.phase = Phase::Resolving;

        self.history.push(SessionSnapshot {
            low: self.low,
            high: self.high,
            comparison_count: self.comparison_count,
        });

        if candidate_won {
            self.high = pivot as i64 - 1;
        } else {
            self.low = pivot as i64 + 1;
        }
        self.comparison_count += 1;
        self.apply_decision();

        debug!(
            item = %self.candidate.item_id,
            candidate_won,
            low = self.low,
            high = self.high,
            comparisons = self.comparison_count,
            "comparison resolved"
        );
        self.state()
    }

    /// Roll back the most recent comparison, restoring bounds verbatim.
    pub fn undo(&mut self) -> UndoOutcome {
        match self.history.pop() {
            Some(snapshot) => {
                self.low = snapshot.low;
                self.high = snapshot.high;
                self.comparison_count = snapshot.comparison_count;
                self.apply_decision();
                debug!(item = %self.candidate.item_id, comparisons = self.comparison_count, "comparison undone");
                UndoOutcome::Restored(self.state())
            }
            None => UndoOutcome::WorkflowLevelUndoRequired,
        }
    }

    /// Drop the session. No store write has happened before Terminal is
    /// persisted, so there is nothing to compensate.
    pub fn cancel(self) {
        debug!(item = %self.candidate.item_id, comparisons = self.comparison_count, "session cancelled");
    }

    fn apply_decision(&mut self) {
        self.phase = match self.policy.decide(self.low, self.high, self.comparison_count) {
            Decision::Compare { pivot } => Phase::AwaitingChoice { pivot },
            Decision::Terminal { position, approximate } => Phase::Terminal(Placement { position, approximate }),
        };
    }
}
