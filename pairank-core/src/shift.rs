/// Position-shift persistence protocol.
///
/// Keeps a user's positions contiguous using only point writes:
///
/// - insert: every row at `>= position` moves +1, highest first, then the
///   new row is written into the vacated slot;
/// - remove: the row is deleted (or unranked), then every row at
///   `> position` moves -1, lowest first.
///
/// Each row write is retried in place. Writing in that order means each
/// target position is already vacated when it is claimed. After every
/// operation the list is re-fetched and checked against `1..=N`.
use tracing::{debug, error, info};

use crate::constants::FIRST_POSITION;
use crate::error::{RankError, StoreError};
use crate::retry::{with_retry, RetryConfig};
use crate::store::OrderedStore;
use crate::types::{check_contiguous, ItemId, RankedItem, UserId};

/// Direction of a range shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delta {
    /// +1 for every row at `>= from`, applied in descending order.
    Increment,
    /// -1 for every row at `> from`, applied in ascending order.
    Decrement,
}

/// What happens to the removed row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Delete the row entirely.
    Delete,
    /// Keep the row but null its position (rebuild undo).
    Unrank,
}

/// Write plan for a range shift over an already-fetched list: `(item, new_position)`
/// in the order the writes must be issued.
pub fn plan_shift(ranked: &[RankedItem], from: u32, delta: Delta) -> Vec<(ItemId, u32)> {
    let mut plan: Vec<(ItemId, u32)> = match delta {
        Delta::Increment => ranked
            .iter()
            .filter(|r| r.position >= from)
            .map(|r| (r.item_id.clone(), r.position + 1))
            .collect(),
        Delta::Decrement => ranked
            .iter()
            .filter(|r| r.position > from)
            .map(|r| (r.item_id.clone(), r.position - 1))
            .collect(),
    };
    match delta {
        Delta::Increment => plan.sort_by(|a, b| b.1.cmp(&a.1)),
        Delta::Decrement => plan.sort_by(|a, b| a.1.cmp(&b.1)),
    }
    plan
}

/// Shared handle for running the protocol against one user's list.
pub struct ShiftProtocol<'a, S: OrderedStore + ?Sized> {
    store: &'a S,
    user: &'a UserId,
    retry: &'a RetryConfig,
}

impl<'a, S: OrderedStore + ?Sized> ShiftProtocol<'a, S> {
    pub fn new(store: &'a S, user: &'a UserId, retry: &'a RetryConfig) -> Self {
        ShiftProtocol { store, user, retry }
    }

    async fn fetch(&self) -> Result<Vec<RankedItem>, StoreError> {
        with_retry(self.retry, "fetch_ranked_items", || self.store.fetch_ranked_items(self.user)).await
    }

    /// Apply a range shift, fetching the current list first.
    /// Returns the number of rows moved.
    pub async fn shift_range(&self, from: u32, delta: Delta) -> Result<usize, RankError> {
        let ranked = self.fetch().await?;
        self.apply_plan(&plan_shift(&ranked, from, delta), 0).await
    }

    /// Issue the planned writes in order. `already_written` counts writes
    /// made earlier in the same logical operation, so a failure here can be
    /// reported as a partial shift.
    async fn apply_plan(&self, plan: &[(ItemId, u32)], already_written: usize) -> Result<usize, RankError> {
        let total = already_written + plan.len();
        for (done, (item, position)) in plan.iter().enumerate() {
            debug!(user = %self.user, item = %item, position, "shift write");
            let write = with_retry(self.retry, "set_position", || {
                self.store.set_position(self.user, item, Some(*position))
            })
            .await;
            if let Err(source) = write {
                let written = already_written + done;
                return Err(self.write_failure(written, total, source));
            }
        }
        Ok(plan.len())
    }

    fn write_failure(&self, written: usize, total: usize, source: StoreError) -> RankError {
        if written == 0 {
            RankError::StoreUnavailable { source }
        } else {
            error!(
                user = %self.user,
                written,
                total,
                error = %source,
                "shift interrupted; positions are inconsistent"
            );
            RankError::PartialShift { written, total, source }
        }
    }

    fn violation(&self, detail: String) -> RankError {
        error!(user = %self.user, %detail, "position invariant violated");
        RankError::InvariantViolation { user: self.user.to_string(), detail }
    }

    /// Insert `item` at `position`, shifting everything at or below it.
    ///
    /// `expected` is the ranked list the comparisons were run against. If the
    /// store no longer matches it the insert is refused before any write, so a
    /// position computed against a stale list is never committed.
    pub async fn insert(
        &self,
        item: &ItemId,
        position: u32,
        expected: Option<&[RankedItem]>,
    ) -> Result<(), RankError> {
        let ranked = self.fetch().await?;
        if ranked.iter().any(|r| &r.item_id == item) {
            return Err(RankError::AlreadyRanked(item.clone()));
        }
        if let Some(expected) = expected {
            if ranked.as_slice() != expected {
                return Err(RankError::StalePrefix { expected: expected.len(), found: ranked.len() });
            }
        }
        let n = ranked.len() as u32;
        if position < FIRST_POSITION || position > n + 1 {
            return Err(self.violation(format!("insert position {position} outside {FIRST_POSITION}..={}", n + 1)));
        }

        let plan = plan_shift(&ranked, position, Delta::Increment);
        let moved = self.apply_plan(&plan, 0).await?;

        // Verify the hole before committing the final insert.
        let shifted = self.fetch().await.map_err(|source| self.write_failure(moved, moved + 1, source))?;
        if let Err(detail) = check_hole(&shifted, position) {
            return Err(self.violation(detail));
        }

        let write = with_retry(self.retry, "insert_at", || self.store.insert_at(self.user, item, position)).await;
        if let Err(source) = write {
            return Err(self.write_failure(moved, moved + 1, source));
        }

        self.verify(moved + 1).await?;
        info!(user = %self.user, item = %item, position, shifted = moved, "item placed");
        Ok(())
    }

    /// Remove `item` from the ranking and close the gap it leaves.
    /// Returns the position it held.
    pub async fn remove(&self, item: &ItemId, removal: Removal) -> Result<u32, RankError> {
        let ranked = self.fetch().await?;
        let position = ranked
            .iter()
            .find(|r| &r.item_id == item)
            .map(|r| r.position)
            .ok_or_else(|| RankError::UnknownItem(item.clone()))?;

        let plan = plan_shift(&ranked, position, Delta::Decrement);
        let total = plan.len() + 1;
        let first = match removal {
            Removal::Delete => with_retry(self.retry, "delete_item", || self.store.delete_item(self.user, item)).await,
            Removal::Unrank => {
                with_retry(self.retry, "set_position", || self.store.set_position(self.user, item, None)).await
            }
        };
        if let Err(source) = first {
            return Err(self.write_failure(0, total, source));
        }

        self.apply_plan(&plan, 1).await?;
        self.verify(total).await?;
        info!(user = %self.user, item = %item, position, ?removal, "item removed");
        Ok(position)
    }

    /// Re-fetch and confirm positions are exactly `1..=N`.
    pub async fn verify(&self, writes: usize) -> Result<Vec<RankedItem>, RankError> {
        let ranked = self.fetch().await.map_err(|source| self.write_failure(writes, writes, source))?;
        check_contiguous(&ranked).map_err(|detail| self.violation(detail))?;
        Ok(ranked)
    }
}

/// After the +1 shift, positions must be `1..=N+1` minus exactly `position`.
fn check_hole(ranked: &[RankedItem], position: u32) -> Result<(), String> {
    let mut expected = 1;
    for r in ranked {
        if expected == position {
            expected += 1;
        }
        if r.position != expected {
            return Err(format!(
                "after shift expected position {expected}, found {} ({})",
                r.position, r.item_id
            ));
        }
        expected += 1;
    }
    Ok(())
}

/// Apply an insertion to an in-memory prefix the same way the store sees it.
pub fn insert_into_prefix(prefix: &mut Vec<RankedItem>, item: ItemId, position: u32) {
    for r in prefix.iter_mut().filter(|r| r.position >= position) {
        r.position += 1;
    }
    prefix.push(RankedItem { item_id: item, position });
    prefix.sort_by_key(|r| r.position);
}

/// Apply a removal to an in-memory prefix. Returns the removed position.
pub fn remove_from_prefix(prefix: &mut Vec<RankedItem>, item: &ItemId) -> Option<u32> {
    let idx = prefix.iter().position(|r| &r.item_id == item)?;
    let removed = prefix.remove(idx).position;
    for r in prefix.iter_mut().filter(|r| r.position > removed) {
        r.position -= 1;
    }
    Some(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::{FailMode, FlakyStore};

    fn user() -> UserId {
        UserId::new("u1")
    }

    fn ids(ranked: &[RankedItem]) -> Vec<String> {
        ranked.iter().map(|r| r.item_id.to_string()).collect()
    }

    #[test]
    fn test_plan_increment_is_descending() {
        let ranked = vec![RankedItem::new("a", 1), RankedItem::new("b", 2), RankedItem::new("c", 3)];
        let plan = plan_shift(&ranked, 2, Delta::Increment);
        assert_eq!(plan, vec![(ItemId::new("c"), 4), (ItemId::new("b"), 3)]);
    }

    #[test]
    fn test_plan_decrement_is_ascending_and_exclusive() {
        let ranked = vec![RankedItem::new("a", 1), RankedItem::new("c", 3), RankedItem::new("d", 4)];
        let plan = plan_shift(&ranked, 2, Delta::Decrement);
        assert_eq!(plan, vec![(ItemId::new("c"), 2), (ItemId::new("d"), 3)]);
    }

    #[tokio::test]
    async fn test_insert_in_middle_shifts_tail() {
        let store = MemoryStore::new();
        store.seed(&user(), &["zelda", "metroid", "celeste"]).await;
        let retry = RetryConfig::immediate(1);
        let u = user();
        let protocol = ShiftProtocol::new(&store, &u, &retry);

        protocol.insert(&"hades".into(), 3, None).await.unwrap();

        let ranked = store.fetch_ranked_items(&user()).await.unwrap();
        assert_eq!(ids(&ranked), vec!["zelda", "metroid", "hades", "celeste"]);
        assert!(check_contiguous(&ranked).is_ok());
    }

    #[tokio::test]
    async fn test_insert_succeeds_against_unique_position_index() {
        // MemoryStore rejects collisions, so ascending writes would fail here.
        let store = MemoryStore::new();
        store.seed(&user(), &["a", "b", "c", "d", "e"]).await;
        let retry = RetryConfig::immediate(1);
        let u = user();
        ShiftProtocol::new(&store, &u, &retry).insert(&"top".into(), 1, None).await.unwrap();
        let ranked = store.fetch_ranked_items(&user()).await.unwrap();
        assert_eq!(ids(&ranked), vec!["top", "a", "b", "c", "d", "e"]);
    }

    #[tokio::test]
    async fn test_insert_refuses_stale_prefix() {
        let store = MemoryStore::new();
        store.seed(&user(), &["a", "b"]).await;
        let retry = RetryConfig::immediate(1);
        let u = user();
        let seen = vec![RankedItem::new("a", 1)];
        let err = ShiftProtocol::new(&store, &u, &retry)
            .insert(&"c".into(), 2, Some(&seen))
            .await
            .unwrap_err();
        assert!(matches!(err, RankError::StalePrefix { expected: 1, found: 2 }));
        assert_eq!(store.fetch_ranked_items(&user()).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_insert_rejects_already_ranked_item() {
        let store = MemoryStore::new();
        store.seed(&user(), &["a", "b"]).await;
        let retry = RetryConfig::immediate(1);
        let u = user();
        let err = ShiftProtocol::new(&store, &u, &retry).insert(&"b".into(), 1, None).await.unwrap_err();
        assert!(matches!(err, RankError::AlreadyRanked(_)));
    }

    #[tokio::test]
    async fn test_remove_closes_gap() {
        let store = MemoryStore::new();
        store.seed(&user(), &["a", "b", "c", "d"]).await;
        let retry = RetryConfig::immediate(1);
        let u = user();
        let held = ShiftProtocol::new(&store, &u, &retry).remove(&"b".into(), Removal::Delete).await.unwrap();
        assert_eq!(held, 2);
        let ranked = store.fetch_ranked_items(&user()).await.unwrap();
        assert_eq!(ids(&ranked), vec!["a", "c", "d"]);
        assert!(check_contiguous(&ranked).is_ok());
        assert!(store.fetch_unranked_items(&user()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unrank_keeps_row() {
        let store = MemoryStore::new();
        store.seed(&user(), &["a", "b", "c"]).await;
        let retry = RetryConfig::immediate(1);
        let u = user();
        ShiftProtocol::new(&store, &u, &retry).remove(&"a".into(), Removal::Unrank).await.unwrap();
        assert_eq!(ids(&store.fetch_ranked_items(&user()).await.unwrap()), vec!["b", "c"]);
        assert_eq!(store.fetch_unranked_items(&user()).await.unwrap(), vec![ItemId::new("a")]);
    }

    #[tokio::test]
    async fn test_transient_write_failures_are_retried() {
        let store = FlakyStore::new(MemoryStore::new());
        store.inner().seed(&user(), &["a", "b", "c"]).await;
        store.fail(FailMode::NextWrites(2));
        let retry = RetryConfig::immediate(3);
        let u = user();
        ShiftProtocol::new(&store, &u, &retry).insert(&"x".into(), 1, None).await.unwrap();
        let ranked = store.inner().fetch_ranked_items(&user()).await.unwrap();
        assert_eq!(ids(&ranked), vec!["x", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_failure_before_any_write_is_store_unavailable() {
        let store = FlakyStore::new(MemoryStore::new());
        store.inner().seed(&user(), &["a", "b"]).await;
        store.fail(FailMode::AllWrites);
        let retry = RetryConfig::immediate(2);
        let u = user();
        let err = ShiftProtocol::new(&store, &u, &retry).insert(&"x".into(), 1, None).await.unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
        assert_eq!(ids(&store.inner().fetch_ranked_items(&user()).await.unwrap()), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failure_mid_shift_is_partial() {
        let store = FlakyStore::new(MemoryStore::new());
        store.inner().seed(&user(), &["a", "b", "c"]).await;
        store.fail(FailMode::AfterWrites(1));
        let retry = RetryConfig::immediate(2);
        let u = user();
        let err = ShiftProtocol::new(&store, &u, &retry).insert(&"x".into(), 1, None).await.unwrap_err();
        match err {
            RankError::PartialShift { written, total, .. } => {
                assert_eq!(written, 1);
                assert_eq!(total, 3);
            }
            other => panic!("expected PartialShift, got {other:?}"),
        }
        // The candidate itself was never written.
        let ranked = store.inner().fetch_ranked_items(&user()).await.unwrap();
        assert!(ranked.iter().all(|r| r.item_id.as_str() != "x"));
    }

    #[tokio::test]
    async fn test_gap_after_shift_aborts_before_insert() {
        let store = FlakyStore::new(MemoryStore::new());
        store.inner().seed(&user(), &["a", "b", "c"]).await;
        store.fail(FailMode::SilentlyDropWrites);
        let retry = RetryConfig::immediate(1);
        let u = user();
        let err = ShiftProtocol::new(&store, &u, &retry).insert(&"x".into(), 2, None).await.unwrap_err();
        assert!(matches!(err, RankError::InvariantViolation { .. }), "got {err:?}");
        let ranked = store.inner().fetch_ranked_items(&user()).await.unwrap();
        assert!(ranked.iter().all(|r| r.item_id.as_str() != "x"));
    }

    #[test]
    fn test_in_memory_prefix_helpers_mirror_protocol() {
        let mut prefix = vec![RankedItem::new("a", 1), RankedItem::new("b", 2)];
        insert_into_prefix(&mut prefix, ItemId::new("x"), 2);
        assert_eq!(ids(&prefix), vec!["a", "x", "b"]);
        assert_eq!(remove_from_prefix(&mut prefix, &ItemId::new("a")), Some(1));
        assert_eq!(prefix, vec![RankedItem::new("x", 1), RankedItem::new("b", 2)]);
        assert_eq!(remove_from_prefix(&mut prefix, &ItemId::new("zz")), None);
    }
}
