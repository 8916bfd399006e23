/// Full re-rank: rebuild a user's whole ordering from scratch.
///
/// All items are shuffled and every position is cleared. The first two items
/// are compared head to head and written as positions 1 and 2 together. Every
/// later item goes through a `RankingSession` against the already rebuilt
/// prefix. After each placement a `RebuildSnapshot` is pushed, so "go back one
/// game" still works once that item's own comparison history is gone.
///
/// An interrupted rebuild leaves rows with null positions behind; `resume`
/// keeps the ranked part and continues with the rest.
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, info};

use crate::engine::EngineConfig;
use crate::error::RankError;
use crate::policy::ComparisonPolicy;
use crate::retry::with_retry;
use crate::session::{Phase, RankingSession, UndoOutcome};
use crate::shift::{insert_into_prefix, remove_from_prefix, Removal, ShiftProtocol};
use crate::store::OrderedStore;
use crate::types::{check_contiguous, CandidateItem, ItemId, Progress, RankedItem, UserId};
use crate::undo::UndoStack;

/// State captured after each fully placed item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RebuildSnapshot {
    /// Queue index of the placed item (0 for the bootstrap pair).
    pub item_index: usize,
    /// The rebuilt prefix as it was before this placement.
    pub ranked_prefix: Vec<RankedItem>,
    pub assigned_position: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RebuildSummary {
    pub total: usize,
    /// Choices answered, including ones later undone.
    pub comparisons: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildStep {
    /// Which of these two do you prefer? Seeds positions 1 and 2.
    Bootstrap { first: CandidateItem, second: CandidateItem },
    Compare { candidate: CandidateItem, opponent: CandidateItem, opponent_position: u32 },
    /// A decided placement still needs saving; call `retry`.
    Waiting { candidate: CandidateItem },
    Complete(RebuildSummary),
}

enum Stage {
    /// `first_won` is set once chosen; the pair is then written together.
    Bootstrap { first_won: Option<bool> },
    Placing(RankingSession),
    /// Between items: the next stage is chosen from `next_index`.
    Between,
    Complete,
}

pub struct RebuildWorkflow<S: OrderedStore> {
    store: Arc<S>,
    user: UserId,
    config: EngineConfig,
    /// Shuffled order of placement. `queue[..next_index]` is placed.
    queue: Vec<CandidateItem>,
    catalog: HashMap<ItemId, CandidateItem>,
    next_index: usize,
    /// In-memory mirror of the rebuilt part of the store.
    prefix: Vec<RankedItem>,
    stage: Stage,
    history: UndoStack<RebuildSnapshot>,
    comparisons: usize,
    completion: Option<RebuildSummary>,
    completion_emitted: bool,
}

impl<S: OrderedStore> RebuildWorkflow<S> {
    fn from_parts(
        store: Arc<S>,
        user: UserId,
        config: EngineConfig,
        queue: Vec<CandidateItem>,
        prefix: Vec<RankedItem>,
    ) -> Self {
        let catalog = queue.iter().map(|c| (c.item_id.clone(), c.clone())).collect();
        RebuildWorkflow {
            store,
            user,
            config,
            next_index: prefix.len(),
            queue,
            catalog,
            prefix,
            stage: Stage::Between,
            history: UndoStack::new(),
            comparisons: 0,
            completion: None,
            completion_emitted: false,
        }
    }

    /// Shuffle `items`, clear every stored position, and start rebuilding.
    pub async fn begin(
        store: Arc<S>,
        user: UserId,
        mut items: Vec<CandidateItem>,
        config: EngineConfig,
        rng: &mut impl Rng,
    ) -> Result<Self, RankError> {
        dedup(&mut items);
        items.shuffle(rng);
        with_retry(&config.retry, "clear_all_positions", || store.clear_all_positions(&user)).await?;
        info!(user = %user, total = items.len(), "rebuild started");

        let mut workflow = Self::from_parts(store, user, config, items, Vec::new());
        workflow.advance().await?;
        Ok(workflow)
    }

    /// Continue an interrupted rebuild.
    ///
    /// Ranked rows are kept in their stored order; everything else (`items`
    /// not ranked, plus any stored rows with a null position) is shuffled and
    /// placed after them.
    pub async fn resume(
        store: Arc<S>,
        user: UserId,
        items: Vec<CandidateItem>,
        config: EngineConfig,
        rng: &mut impl Rng,
    ) -> Result<Self, RankError> {
        let ranked =
            with_retry(&config.retry, "fetch_ranked_items", || store.fetch_ranked_items(&user)).await?;
        check_contiguous(&ranked).map_err(|detail| RankError::InvariantViolation {
            user: user.to_string(),
            detail,
        })?;
        let unranked =
            with_retry(&config.retry, "fetch_unranked_items", || store.fetch_unranked_items(&user)).await?;

        let mut by_id: HashMap<ItemId, CandidateItem> =
            items.into_iter().map(|c| (c.item_id.clone(), c)).collect();
        let mut take = |id: &ItemId| {
            by_id.remove(id).unwrap_or_else(|| CandidateItem::new(id.clone(), id.to_string()))
        };

        let mut queue: Vec<CandidateItem> = ranked.iter().map(|r| take(&r.item_id)).collect();
        let mut remainder: Vec<CandidateItem> = unranked.iter().map(&mut take).collect();
        remainder.extend(by_id.into_values());
        dedup(&mut remainder);
        remainder.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        remainder.shuffle(rng);

        info!(user = %user, kept = queue.len(), remaining = remainder.len(), "rebuild resumed");
        queue.extend(remainder);

        let mut workflow = Self::from_parts(store, user, config, queue, ranked);
        workflow.advance().await?;
        Ok(workflow)
    }

    /// Whether a rebuild for `user` was interrupted and can be resumed.
    pub async fn needs_resume(store: &S, user: &UserId) -> Result<bool, RankError> {
        Ok(!store.fetch_unranked_items(user).await?.is_empty())
    }

    pub fn progress(&self) -> Progress {
        Progress { current: self.prefix.len(), total: self.queue.len() }
    }

    pub fn ranked_prefix(&self) -> &[RankedItem] {
        &self.prefix
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stage, Stage::Complete)
    }

    /// The completion event. Yields `Some` exactly once per workflow.
    pub fn take_completion(&mut self) -> Option<RebuildSummary> {
        self.completion.take()
    }

    fn summary(&self) -> RebuildSummary {
        RebuildSummary { total: self.queue.len(), comparisons: self.comparisons }
    }

    fn lookup(&self, id: &ItemId) -> CandidateItem {
        self.catalog.get(id).cloned().unwrap_or_else(|| CandidateItem::new(id.clone(), id.to_string()))
    }

    pub fn current_step(&self) -> RebuildStep {
        match &self.stage {
            Stage::Complete => RebuildStep::Complete(self.summary()),
            Stage::Bootstrap { first_won: None } => RebuildStep::Bootstrap {
                first: self.queue[0].clone(),
                second: self.queue[1].clone(),
            },
            Stage::Bootstrap { first_won: Some(_) } => RebuildStep::Waiting { candidate: self.queue[0].clone() },
            Stage::Placing(session) => match session.phase() {
                Phase::AwaitingChoice { pivot } => match session.prefix().get(pivot) {
                    Some(opponent) => RebuildStep::Compare {
                        candidate: session.candidate().clone(),
                        opponent: self.lookup(&opponent.item_id),
                        opponent_position: opponent.position,
                    },
                    None => RebuildStep::Waiting { candidate: session.candidate().clone() },
                },
                _ => RebuildStep::Waiting { candidate: session.candidate().clone() },
            },
            Stage::Between => match self.queue.get(self.next_index) {
                Some(next) => RebuildStep::Waiting { candidate: next.clone() },
                None => RebuildStep::Complete(self.summary()),
            },
        }
    }

    /// Answer the current question. For the bootstrap pair `first_won`
    /// means the first item is preferred; otherwise it means the candidate
    /// beat the opponent.
    pub async fn resolve_comparison(&mut self, first_won: bool) -> Result<RebuildStep, RankError> {
        match &mut self.stage {
            Stage::Bootstrap { first_won: decided @ None } => {
                *decided = Some(first_won);
            }
            Stage::Placing(session) if matches!(session.phase(), Phase::AwaitingChoice { .. }) => {
                session.resolve_choice(first_won);
            }
            _ => return Ok(self.current_step()),
        }
        self.comparisons += 1;
        self.advance().await
    }

    /// Re-attempt a save that failed.
    pub async fn retry(&mut self) -> Result<RebuildStep, RankError> {
        self.advance().await
    }

    /// Go back one step: the last comparison of the current item if there
    /// is one, otherwise the whole previous item (or the bootstrap pair).
    ///
    /// Returns false when there is nothing left to undo. Items ranked before
    /// a `resume` cannot be undone.
    pub async fn undo_last(&mut self) -> Result<bool, RankError> {
        let bootstrap_pending = match &mut self.stage {
            Stage::Complete => return Ok(false),
            Stage::Placing(session) => {
                if let UndoOutcome::Restored(_) = session.undo() {
                    return Ok(true);
                }
                false
            }
            Stage::Bootstrap { first_won } => first_won.is_some(),
            Stage::Between => false,
        };
        if bootstrap_pending {
            // Decided but not (fully) saved: take back whatever landed.
            let pair: Vec<ItemId> = self.queue[..2].iter().map(|c| c.item_id.clone()).collect();
            self.unrank(&pair).await?;
            self.stage = Stage::Bootstrap { first_won: None };
            return Ok(true);
        }

        let Some(snapshot) = self.history.pop() else {
            return Ok(false);
        };
        let placed: Vec<ItemId> = self.queue[snapshot.item_index..self.next_index]
            .iter()
            .map(|c| c.item_id.clone())
            .collect();
        if let Err(e) = self.unrank(&placed).await {
            self.history.push(snapshot);
            return Err(e);
        }

        debug!(
            user = %self.user,
            item_index = snapshot.item_index,
            position = snapshot.assigned_position,
            "rebuild step undone"
        );
        self.prefix = snapshot.ranked_prefix;
        self.next_index = snapshot.item_index;
        if let Stage::Placing(session) = std::mem::replace(&mut self.stage, Stage::Between) {
            session.cancel();
        }
        self.advance().await?;
        Ok(true)
    }

    /// Null out `items`' positions (highest first), closing each gap.
    async fn unrank(&mut self, items: &[ItemId]) -> Result<(), RankError> {
        let mut targets: Vec<RankedItem> =
            self.prefix.iter().filter(|r| items.contains(&r.item_id)).cloned().collect();
        targets.sort_by(|a, b| b.position.cmp(&a.position));
        let protocol = ShiftProtocol::new(self.store.as_ref(), &self.user, &self.config.retry);
        for target in targets {
            protocol.remove(&target.item_id, Removal::Unrank).await?;
            remove_from_prefix(&mut self.prefix, &target.item_id);
        }
        Ok(())
    }

    /// Drive until a question needs the user, the rebuild is complete, or a
    /// save fails.
    async fn advance(&mut self) -> Result<RebuildStep, RankError> {
        loop {
            match &self.stage {
                Stage::Bootstrap { first_won: None } | Stage::Complete => return Ok(self.current_step()),
                Stage::Bootstrap { first_won: Some(won) } => {
                    let won = *won;
                    self.persist_bootstrap(won).await?;
                    self.stage = Stage::Between;
                }
                Stage::Placing(session) if !session.is_terminal() => return Ok(self.current_step()),
                Stage::Placing(_) => {
                    self.persist_session().await?;
                    self.stage = Stage::Between;
                }
                Stage::Between => self.enter_next(),
            }
        }
    }

    fn enter_next(&mut self) {
        let remaining = self.queue.len().saturating_sub(self.next_index);
        self.stage = if remaining == 0 {
            if !self.completion_emitted {
                self.completion_emitted = true;
                self.completion = Some(self.summary());
                info!(user = %self.user, total = self.queue.len(), comparisons = self.comparisons, "rebuild complete");
            }
            Stage::Complete
        } else if self.prefix.is_empty() && remaining >= 2 {
            Stage::Bootstrap { first_won: None }
        } else {
            Stage::Placing(RankingSession::begin(
                self.queue[self.next_index].clone(),
                self.prefix.clone(),
                ComparisonPolicy::new(self.config.policy),
            ))
        };
    }

    async fn persist_bootstrap(&mut self, first_won: bool) -> Result<(), RankError> {
        let (first, second) = (self.queue[0].item_id.clone(), self.queue[1].item_id.clone());
        let (winner, loser) = if first_won { (first, second) } else { (second, first) };

        let protocol = ShiftProtocol::new(self.store.as_ref(), &self.user, &self.config.retry);
        for (item, position) in [(winner, 1), (loser, 2)] {
            if self.prefix.iter().any(|r| r.item_id == item) {
                continue;
            }
            protocol.insert(&item, position, Some(&self.prefix)).await?;
            insert_into_prefix(&mut self.prefix, item, position);
        }

        self.history.push(RebuildSnapshot { item_index: 0, ranked_prefix: Vec::new(), assigned_position: 1 });
        self.next_index = 2;
        Ok(())
    }

    async fn persist_session(&mut self) -> Result<(), RankError> {
        let Stage::Placing(session) = &self.stage else {
            return Ok(());
        };
        let placement = session.placement().ok_or(RankError::NotTerminal)?;
        let item = session.candidate().item_id.clone();

        let protocol = ShiftProtocol::new(self.store.as_ref(), &self.user, &self.config.retry);
        protocol.insert(&item, placement.position, Some(&self.prefix)).await?;

        self.history.push(RebuildSnapshot {
            item_index: self.next_index,
            ranked_prefix: self.prefix.clone(),
            assigned_position: placement.position,
        });
        insert_into_prefix(&mut self.prefix, item, placement.position);
        self.next_index += 1;
        Ok(())
    }
}

/// Drop repeated item ids, keeping the first occurrence.
fn dedup(items: &mut Vec<CandidateItem>) {
    let mut seen = HashSet::new();
    items.retain(|c| seen.insert(c.item_id.clone()));
}
