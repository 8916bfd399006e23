/// Ranking engine: handle-based single-item placement for one user.
///
/// The caller surfaces each comparison, feeds the choice back, and the engine
/// persists through the shift protocol once a position is final. Bulk and
/// rebuild workflows are started from here too.
use std::collections::HashMap;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::batch::SequentialInsertionWorkflow;
use crate::error::RankError;
use crate::policy::{ComparisonPolicy, PolicyConfig};
use crate::rebuild::RebuildWorkflow;
use crate::retry::RetryConfig;
use crate::session::{Comparison, RankingSession, SessionState, UndoOutcome};
use crate::shift::{Removal, ShiftProtocol};
use crate::store::OrderedStore;
use crate::types::{CandidateItem, ItemId, Placement, RankedItem, UserId};

/// Configuration shared by the engine and every workflow it starts.
#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    pub policy: PolicyConfig,
    pub retry: RetryConfig,
}

/// Opaque reference to one in-flight placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Owned view of the current comparison for a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CurrentComparison {
    Pending { candidate: CandidateItem, opponent: RankedItem },
    /// A final position exists. `persisted` is false while a failed save
    /// is waiting for `retry`.
    Terminal { placement: Placement, persisted: bool },
}

/// What `RankingEngine::cancel` did with a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// Dropped before anything was written.
    Dropped,
    /// The position was already saved; the handle is released.
    Released(Placement),
    /// A re-rank whose old row is already gone. The handle stays open until
    /// `retry` saves the new position.
    SaveRequired,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlacementKind {
    Insert,
    /// Re-ranking an existing item; `removed` once its old row is gone.
    Rerank { removed: bool },
}

enum Entry {
    Active { session: RankingSession, kind: PlacementKind },
    Placed(Placement),
}

pub struct RankingEngine<S: OrderedStore> {
    store: Arc<S>,
    user: UserId,
    config: EngineConfig,
    entries: HashMap<SessionHandle, Entry>,
    next_handle: u64,
}

impl<S: OrderedStore> RankingEngine<S> {
    pub fn new(store: Arc<S>, user: UserId, config: EngineConfig) -> Self {
        RankingEngine { store, user, config, entries: HashMap::new(), next_handle: 1 }
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn policy(&self) -> ComparisonPolicy {
        ComparisonPolicy::new(self.config.policy)
    }

    fn protocol(&self) -> ShiftProtocol<'_, S> {
        ShiftProtocol::new(self.store.as_ref(), &self.user, &self.config.retry)
    }

    /// Current ordered list, ascending by position.
    pub async fn ranked_items(&self) -> Result<Vec<RankedItem>, RankError> {
        Ok(self.store.fetch_ranked_items(&self.user).await?)
    }

    /// Start placing a new candidate.
    ///
    /// With an empty list the candidate is placed at position 1 right away
    /// and the returned handle is already Terminal. If that save fails the
    /// handle is still returned, unpersisted, for `retry`.
    pub async fn begin_insertion(&mut self, candidate: CandidateItem) -> Result<SessionHandle, RankError> {
        let prefix = self.ranked_items().await?;
        if prefix.iter().any(|r| r.item_id == candidate.item_id) {
            return Err(RankError::AlreadyRanked(candidate.item_id));
        }
        let session = RankingSession::begin(candidate, prefix, self.policy());
        self.open(session, PlacementKind::Insert).await
    }

    /// Start re-ranking an item already in the list.
    ///
    /// Comparisons run against the list without the item. Nothing is written
    /// until a final position exists; then the old row is removed and the
    /// item inserted at its new position as two protocol runs.
    pub async fn begin_rerank(&mut self, candidate: CandidateItem) -> Result<SessionHandle, RankError> {
        let mut prefix = self.ranked_items().await?;
        if crate::shift::remove_from_prefix(&mut prefix, &candidate.item_id).is_none() {
            return Err(RankError::UnknownItem(candidate.item_id));
        }
        let session = RankingSession::begin(candidate, prefix, self.policy());
        self.open(session, PlacementKind::Rerank { removed: false }).await
    }

    async fn open(&mut self, session: RankingSession, kind: PlacementKind) -> Result<SessionHandle, RankError> {
        let handle = SessionHandle(self.next_handle);
        self.next_handle += 1;
        debug!(user = %self.user, handle = handle.0, item = %session.candidate().item_id, "placement opened");
        let terminal = session.is_terminal();
        self.entries.insert(handle, Entry::Active { session, kind });
        if terminal {
            if let Err(e) = self.persist(handle).await {
                warn!(user = %self.user, handle = handle.0, error = %e, "immediate placement not saved");
            }
        }
        Ok(handle)
    }

    pub fn current_comparison(&self, handle: SessionHandle) -> Result<CurrentComparison, RankError> {
        match self.entries.get(&handle) {
            None => Err(RankError::UnknownHandle(handle.0)),
            Some(Entry::Placed(placement)) => {
                Ok(CurrentComparison::Terminal { placement: *placement, persisted: true })
            }
            Some(Entry::Active { session, .. }) => match session.current_comparison()? {
                Comparison::Pending { candidate, opponent } => Ok(CurrentComparison::Pending {
                    candidate: candidate.clone(),
                    opponent: opponent.clone(),
                }),
                Comparison::Terminal(placement) => {
                    Ok(CurrentComparison::Terminal { placement, persisted: false })
                }
            },
        }
    }

    /// Apply a choice. When it makes the position final, persist it.
    ///
    /// A persistence failure leaves the decision in place; call `retry`.
    pub async fn resolve_comparison(
        &mut self,
        handle: SessionHandle,
        candidate_won: bool,
    ) -> Result<SessionState, RankError> {
        let state = match self.entries.get_mut(&handle) {
            None => return Err(RankError::UnknownHandle(handle.0)),
            Some(Entry::Placed(_)) => return Err(RankError::NotTerminal),
            Some(Entry::Active { session, .. }) => {
                let state = session.resolve_choice(candidate_won);
                if !session.is_terminal() {
                    return Ok(state);
                }
                state
            }
        };
        self.persist(handle).await?;
        Ok(state)
    }

    /// Re-attempt persistence of a final position after a failure.
    pub async fn retry(&mut self, handle: SessionHandle) -> Result<Placement, RankError> {
        let placed = match self.entries.get(&handle) {
            None => return Err(RankError::UnknownHandle(handle.0)),
            Some(Entry::Placed(placement)) => Some(*placement),
            Some(Entry::Active { .. }) => None,
        };
        match placed {
            Some(placement) => Ok(placement),
            None => self.persist(handle).await,
        }
    }

    /// Undo the last comparison for this placement.
    pub fn undo(&mut self, handle: SessionHandle) -> Result<UndoOutcome, RankError> {
        match self.entries.get_mut(&handle) {
            None => Err(RankError::UnknownHandle(handle.0)),
            Some(Entry::Placed(_)) => Ok(UndoOutcome::WorkflowLevelUndoRequired),
            Some(Entry::Active { session, kind }) => {
                if matches!(kind, PlacementKind::Rerank { removed: true }) {
                    // The old row is gone; only the insert remains to retry.
                    return Ok(UndoOutcome::WorkflowLevelUndoRequired);
                }
                Ok(session.undo())
            }
        }
    }

    /// Drop a placement, or release one that is already saved.
    ///
    /// Before Terminal is persisted this never touches the store. A re-rank
    /// that has already removed its old row is refused: dropping it would
    /// lose the item.
    pub fn cancel(&mut self, handle: SessionHandle) -> CancelOutcome {
        match self.entries.remove(&handle) {
            Some(Entry::Active { kind: kind @ PlacementKind::Rerank { removed: true }, session }) => {
                warn!(user = %self.user, item = %session.candidate().item_id, "re-rank must be saved before it can end");
                self.entries.insert(handle, Entry::Active { session, kind });
                CancelOutcome::SaveRequired
            }
            Some(Entry::Active { session, .. }) => {
                session.cancel();
                CancelOutcome::Dropped
            }
            Some(Entry::Placed(placement)) => CancelOutcome::Released(placement),
            None => CancelOutcome::Unknown,
        }
    }

    /// Handles not yet cancelled or released.
    pub fn open_handles(&self) -> usize {
        self.entries.len()
    }

    /// Remove an item from the ranking entirely.
    pub async fn remove_item(&self, item: &ItemId) -> Result<u32, RankError> {
        self.protocol().remove(item, Removal::Delete).await
    }

    async fn persist(&mut self, handle: SessionHandle) -> Result<Placement, RankError> {
        let (item, placement, prefix, kind) = match self.entries.get(&handle) {
            Some(Entry::Active { session, kind }) => {
                let placement = session.placement().ok_or(RankError::NotTerminal)?;
                (session.candidate().item_id.clone(), placement, session.prefix().to_vec(), *kind)
            }
            Some(Entry::Placed(placement)) => return Ok(*placement),
            None => return Err(RankError::UnknownHandle(handle.0)),
        };

        if kind == (PlacementKind::Rerank { removed: false }) {
            self.protocol().remove(&item, Removal::Delete).await?;
            if let Some(Entry::Active { kind, .. }) = self.entries.get_mut(&handle) {
                *kind = PlacementKind::Rerank { removed: true };
            }
        }

        self.protocol().insert(&item, placement.position, Some(&prefix)).await?;

        info!(
            user = %self.user,
            item = %item,
            position = placement.position,
            approximate = placement.approximate,
            "placement persisted"
        );
        self.entries.insert(handle, Entry::Placed(placement));
        Ok(placement)
    }

    /// Start a bulk onboarding run over `candidates`, in order.
    pub async fn begin_batch(
        &self,
        candidates: Vec<CandidateItem>,
    ) -> Result<SequentialInsertionWorkflow<S>, RankError> {
        SequentialInsertionWorkflow::begin(self.store.clone(), self.user.clone(), candidates, self.config.clone())
            .await
    }

    /// Rebuild the whole ordering from scratch over `items`.
    pub async fn begin_rebuild(
        &self,
        items: Vec<CandidateItem>,
        rng: &mut impl Rng,
    ) -> Result<RebuildWorkflow<S>, RankError> {
        RebuildWorkflow::begin(self.store.clone(), self.user.clone(), items, self.config.clone(), rng).await
    }

    /// Continue an interrupted rebuild.
    pub async fn resume_rebuild(
        &self,
        items: Vec<CandidateItem>,
        rng: &mut impl Rng,
    ) -> Result<RebuildWorkflow<S>, RankError> {
        RebuildWorkflow::resume(self.store.clone(), self.user.clone(), items, self.config.clone(), rng).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{ids, FailMode, FlakyStore, Oracle};
    use crate::types::check_contiguous;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn config() -> EngineConfig {
        EngineConfig { policy: PolicyConfig::default(), retry: RetryConfig::immediate(2) }
    }

    fn user() -> UserId {
        UserId::new("u1")
    }

    async fn place<S: OrderedStore>(
        engine: &mut RankingEngine<S>,
        candidate: CandidateItem,
        oracle: &Oracle,
        rerank: bool,
    ) -> Placement {
        let handle = if rerank {
            engine.begin_rerank(candidate).await.unwrap()
        } else {
            engine.begin_insertion(candidate).await.unwrap()
        };
        loop {
            match engine.current_comparison(handle).unwrap() {
                CurrentComparison::Pending { candidate, opponent } => {
                    let won = oracle.prefers(&candidate.item_id, &opponent.item_id);
                    engine.resolve_comparison(handle, won).await.unwrap();
                }
                CurrentComparison::Terminal { placement, persisted } => {
                    assert!(persisted);
                    return placement;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_hades_example_persists_order() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&user(), &["zelda", "metroid", "celeste"]).await;
        let mut engine = RankingEngine::new(store.clone(), user(), config());

        let handle = engine.begin_insertion(CandidateItem::new("hades", "Hades")).await.unwrap();
        match engine.current_comparison(handle).unwrap() {
            CurrentComparison::Pending { opponent, .. } => assert_eq!(opponent.item_id.as_str(), "metroid"),
            other => panic!("unexpected {other:?}"),
        }
        engine.resolve_comparison(handle, false).await.unwrap();
        match engine.current_comparison(handle).unwrap() {
            CurrentComparison::Pending { opponent, .. } => assert_eq!(opponent.item_id.as_str(), "celeste"),
            other => panic!("unexpected {other:?}"),
        }
        engine.resolve_comparison(handle, true).await.unwrap();
        assert_eq!(
            engine.current_comparison(handle).unwrap(),
            CurrentComparison::Terminal {
                placement: Placement { position: 3, approximate: false },
                persisted: true
            }
        );
        let ranked = store.fetch_ranked_items(&user()).await.unwrap();
        assert_eq!(ids(&ranked), vec!["zelda", "metroid", "hades", "celeste"]);
    }

    #[tokio::test]
    async fn test_empty_list_places_immediately() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = RankingEngine::new(store.clone(), user(), config());
        let handle = engine.begin_insertion(CandidateItem::new("hades", "Hades")).await.unwrap();
        assert_eq!(
            engine.current_comparison(handle).unwrap(),
            CurrentComparison::Terminal {
                placement: Placement { position: 1, approximate: false },
                persisted: true
            }
        );
        assert_eq!(ids(&store.fetch_ranked_items(&user()).await.unwrap()), vec!["hades"]);
    }

    #[tokio::test]
    async fn test_cancel_before_terminal_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&user(), &["a", "b", "c"]).await;
        let mut engine = RankingEngine::new(store.clone(), user(), config());
        let handle = engine.begin_insertion(CandidateItem::new("x", "X")).await.unwrap();
        engine.resolve_comparison(handle, true).await.unwrap();
        assert_eq!(engine.cancel(handle), CancelOutcome::Dropped);
        assert_eq!(engine.cancel(handle), CancelOutcome::Unknown);
        assert_eq!(ids(&store.fetch_ranked_items(&user()).await.unwrap()), vec!["a", "b", "c"]);
        assert!(matches!(engine.current_comparison(handle), Err(RankError::UnknownHandle(_))));
    }

    #[tokio::test]
    async fn test_failed_first_placement_returns_handle_for_retry() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        let mut engine = RankingEngine::new(store.clone(), user(), config());
        store.fail(FailMode::AllWrites);
        let handle = engine.begin_insertion(CandidateItem::new("hades", "Hades")).await.unwrap();
        assert_eq!(
            engine.current_comparison(handle).unwrap(),
            CurrentComparison::Terminal {
                placement: Placement { position: 1, approximate: false },
                persisted: false
            }
        );
        assert_eq!(engine.open_handles(), 1);

        store.heal();
        assert_eq!(engine.retry(handle).await.unwrap().position, 1);
        assert_eq!(ids(&store.inner().fetch_ranked_items(&user()).await.unwrap()), vec!["hades"]);
    }

    #[tokio::test]
    async fn test_cancel_releases_saved_placement() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&user(), &["a"]).await;
        let mut engine = RankingEngine::new(store.clone(), user(), config());
        let handle = engine.begin_insertion(CandidateItem::new("x", "X")).await.unwrap();
        engine.resolve_comparison(handle, true).await.unwrap();
        assert_eq!(engine.open_handles(), 1);

        let placement = Placement { position: 1, approximate: false };
        assert_eq!(engine.cancel(handle), CancelOutcome::Released(placement));
        assert_eq!(engine.open_handles(), 0);
        assert_eq!(ids(&store.fetch_ranked_items(&user()).await.unwrap()), vec!["x", "a"]);
    }

    #[tokio::test]
    async fn test_rerank_cannot_be_dropped_after_old_row_removed() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.inner().seed(&user(), &["a", "b", "c"]).await;
        let mut engine = RankingEngine::new(store.clone(), user(), config());
        let handle = engine.begin_rerank(CandidateItem::new("c", "C")).await.unwrap();

        // The delete of c goes through, then shifting b for the insert fails.
        store.fail(FailMode::AfterWrites(1));
        let err = engine.resolve_comparison(handle, true).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(engine.undo(handle).unwrap(), UndoOutcome::WorkflowLevelUndoRequired);
        store.heal();

        assert_eq!(engine.cancel(handle), CancelOutcome::SaveRequired);
        assert_eq!(
            engine.current_comparison(handle).unwrap(),
            CurrentComparison::Terminal {
                placement: Placement { position: 1, approximate: false },
                persisted: false
            }
        );

        assert_eq!(engine.retry(handle).await.unwrap().position, 1);
        assert_eq!(ids(&store.inner().fetch_ranked_items(&user()).await.unwrap()), vec!["c", "a", "b"]);
        assert!(matches!(engine.cancel(handle), CancelOutcome::Released(_)));
    }

    #[tokio::test]
    async fn test_duplicate_insertion_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&user(), &["a"]).await;
        let mut engine = RankingEngine::new(store, user(), config());
        let err = engine.begin_insertion(CandidateItem::new("a", "A")).await.unwrap_err();
        assert!(matches!(err, RankError::AlreadyRanked(_)));
    }

    #[tokio::test]
    async fn test_undo_through_handle_and_fallback() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&user(), &["a", "b", "c", "d"]).await;
        let mut engine = RankingEngine::new(store, user(), config());
        let handle = engine.begin_insertion(CandidateItem::new("x", "X")).await.unwrap();
        assert_eq!(engine.undo(handle).unwrap(), UndoOutcome::WorkflowLevelUndoRequired);

        let first = engine.current_comparison(handle).unwrap();
        engine.resolve_comparison(handle, false).await.unwrap();
        assert!(matches!(engine.undo(handle).unwrap(), UndoOutcome::Restored(_)));
        assert_eq!(engine.current_comparison(handle).unwrap(), first);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_decision_for_retry() {
        let store = Arc::new(FlakyStore::new(MemoryStore::new()));
        store.inner().seed(&user(), &["a", "b"]).await;
        let mut engine = RankingEngine::new(store.clone(), user(), config());
        let handle = engine.begin_insertion(CandidateItem::new("x", "X")).await.unwrap();

        store.fail(FailMode::AllWrites);
        // pivot = a; losing moves to b
        engine.resolve_comparison(handle, false).await.unwrap();
        let err = engine.resolve_comparison(handle, true).await.unwrap_err();
        assert_eq!(err.user_message(), "Couldn't save. Try again.");
        assert_eq!(
            engine.current_comparison(handle).unwrap(),
            CurrentComparison::Terminal {
                placement: Placement { position: 2, approximate: false },
                persisted: false
            }
        );

        store.heal();
        let placement = engine.retry(handle).await.unwrap();
        assert_eq!(placement.position, 2);
        assert_eq!(ids(&store.inner().fetch_ranked_items(&user()).await.unwrap()), vec!["a", "x", "b"]);
    }

    #[tokio::test]
    async fn test_rerank_moves_item() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&user(), &["a", "b", "c", "d", "e"]).await;
        let mut engine = RankingEngine::new(store.clone(), user(), config());
        let oracle = Oracle::from_order(&["a", "d", "b", "c", "e"]);
        let placement = place(&mut engine, CandidateItem::new("d", "D"), &oracle, true).await;
        assert_eq!(placement.position, 2);
        assert_eq!(ids(&store.fetch_ranked_items(&user()).await.unwrap()), vec!["a", "d", "b", "c", "e"]);
    }

    #[tokio::test]
    async fn test_rerank_unknown_item() {
        let store = Arc::new(MemoryStore::new());
        let mut engine = RankingEngine::new(store, user(), config());
        let err = engine.begin_rerank(CandidateItem::new("x", "X")).await.unwrap_err();
        assert!(matches!(err, RankError::UnknownItem(_)));
    }

    #[tokio::test]
    async fn test_remove_item() {
        let store = Arc::new(MemoryStore::new());
        store.seed(&user(), &["a", "b", "c"]).await;
        let engine = RankingEngine::new(store.clone(), user(), config());
        assert_eq!(engine.remove_item(&"a".into()).await.unwrap(), 1);
        assert_eq!(ids(&store.fetch_ranked_items(&user()).await.unwrap()), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_ordering_invariant_over_random_operations() {
        let universe: Vec<String> = (0..30).map(|i| format!("g{i:02}")).collect();
        let order: Vec<&str> = universe.iter().map(String::as_str).collect();
        let oracle = Oracle::from_order(&order);

        for seed in 0..8u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let store = Arc::new(MemoryStore::new());
            let mut engine = RankingEngine::new(store.clone(), user(), config());

            for _ in 0..60 {
                let ranked = store.fetch_ranked_items(&user()).await.unwrap();
                let id = &universe[rng.random_range(0..universe.len())];
                let present = ranked.iter().any(|r| r.item_id.as_str() == id);
                match (present, rng.random_range(0..3)) {
                    (false, _) => {
                        place(&mut engine, CandidateItem::new(id.as_str(), id.as_str()), &oracle, false).await;
                    }
                    (true, 0) => {
                        engine.remove_item(&ItemId::new(id.as_str())).await.unwrap();
                    }
                    (true, _) => {
                        place(&mut engine, CandidateItem::new(id.as_str(), id.as_str()), &oracle, true).await;
                    }
                }

                let ranked = store.fetch_ranked_items(&user()).await.unwrap();
                assert!(check_contiguous(&ranked).is_ok(), "seed {seed}: {ranked:?}");
                // Every placement is consistent with the oracle.
                for pair in ranked.windows(2) {
                    assert!(oracle.prefers(&pair[0].item_id, &pair[1].item_id), "seed {seed}: {ranked:?}");
                }
            }
        }
    }
}
