/// pairank-core: Pairwise-choice ranking engine.
///
/// "Which do you prefer, A or B?" → binary insertion → a durable, contiguous
/// 1..=N ordering. No UI, no network: bring your own `OrderedStore`.
///
/// Position 1 is the most preferred item. A new item is placed by comparing
/// it against the midpoint of the shrinking range of candidate positions;
/// once the range closes (or the comparison budget runs out) the engine
/// shifts the rows below it down one slot and writes the new row into the gap.
///
/// # Quick start
///
/// ```rust
/// use std::sync::Arc;
/// use pairank_core::{CandidateItem, CurrentComparison, EngineConfig, MemoryStore, RankingEngine, UserId};
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let store = Arc::new(MemoryStore::new());
/// let user = UserId::new("alice");
/// store.seed(&user, &["zelda", "tetris", "doom"]).await;
///
/// let mut engine = RankingEngine::new(store, user, EngineConfig::default());
/// let handle = engine.begin_insertion(CandidateItem::new("hades", "Hades")).await?;
///
/// while let CurrentComparison::Pending { opponent, .. } = engine.current_comparison(handle)? {
///     // Ask the user. Here: Hades beats everything except Zelda.
///     let prefers_candidate = opponent.item_id.as_str() != "zelda";
///     engine.resolve_comparison(handle, prefers_candidate).await?;
/// }
///
/// let ranked = engine.ranked_items().await?;
/// assert_eq!(ranked[1].item_id.as_str(), "hades");
/// # Ok::<(), pairank_core::RankError>(())
/// # }).unwrap();
/// ```

pub mod batch;
pub mod constants;
pub mod engine;
pub mod error;
pub mod policy;
pub mod rebuild;
pub mod retry;
pub mod session;
pub mod shift;
pub mod store;
pub mod types;
pub mod undo;

#[cfg(test)]
mod testing;

// Re-export primary public API at crate root.
pub use batch::{BatchReport, BatchStep, PlacedCandidate, SequentialInsertionWorkflow};
pub use engine::{CancelOutcome, CurrentComparison, EngineConfig, RankingEngine, SessionHandle};
pub use error::{RankError, StoreError};
pub use policy::{comparison_bound, ComparisonPolicy, Decision, PolicyConfig};
pub use rebuild::{RebuildStep, RebuildSummary, RebuildWorkflow};
pub use retry::RetryConfig;
pub use session::{Comparison, Phase, RankingSession, SessionState, UndoOutcome};
pub use shift::{Removal, ShiftProtocol};
pub use store::{MemoryStore, OrderedStore, StoredRow};
pub use types::{CandidateItem, ItemId, Placement, Progress, RankedItem, UserId};
