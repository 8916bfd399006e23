/// The durable ordered store the engine writes to, and an in-memory reference
/// implementation.
///
/// The store offers point writes only. It has no range-shift primitive and no
/// multi-row transactions; `shift` builds those on top of these calls.
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::types::{ItemId, RankedItem, UserId};

#[async_trait]
pub trait OrderedStore: Send + Sync {
    /// All rows with a position, ascending by position.
    async fn fetch_ranked_items(&self, user: &UserId) -> Result<Vec<RankedItem>, StoreError>;

    /// Rows that exist but currently have no position (mid-rebuild).
    async fn fetch_unranked_items(&self, user: &UserId) -> Result<Vec<ItemId>, StoreError>;

    /// Point write on an existing row. `None` clears the position.
    async fn set_position(
        &self,
        user: &UserId,
        item: &ItemId,
        position: Option<u32>,
    ) -> Result<(), StoreError>;

    /// Create the row if missing, then set its position.
    async fn insert_at(&self, user: &UserId, item: &ItemId, position: u32) -> Result<(), StoreError>;

    async fn delete_item(&self, user: &UserId, item: &ItemId) -> Result<(), StoreError>;

    /// Null out every position for `user`, keeping the rows.
    async fn clear_all_positions(&self, user: &UserId) -> Result<(), StoreError>;
}

/// A single stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StoredRow {
    pub item_id: ItemId,
    pub position: Option<u32>,
}

/// In-memory `OrderedStore`.
///
/// Enforces a unique index on `(user, position)` the way a relational backend
/// would, so an out-of-order shift fails loudly instead of silently
/// duplicating a position.
#[derive(Debug, Default)]
pub struct MemoryStore {
    rows: RwLock<HashMap<UserId, Vec<StoredRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a store from existing rows, e.g. loaded from disk.
    pub fn from_rows(rows: HashMap<UserId, Vec<StoredRow>>) -> Self {
        MemoryStore { rows: RwLock::new(rows) }
    }

    /// Copy of every row, for persisting or inspection.
    pub async fn snapshot(&self) -> HashMap<UserId, Vec<StoredRow>> {
        self.rows.read().await.clone()
    }

    /// Seed `user`'s list with `ids` at positions `1..=N` in the given order.
    pub async fn seed(&self, user: &UserId, ids: &[&str]) {
        let mut rows = self.rows.write().await;
        let list = rows.entry(user.clone()).or_default();
        list.clear();
        for (idx, id) in ids.iter().enumerate() {
            list.push(StoredRow { item_id: ItemId::new(*id), position: Some(idx as u32 + 1) });
        }
    }

    fn claim(list: &[StoredRow], item: &ItemId, position: u32) -> Result<(), StoreError> {
        match list.iter().find(|r| r.position == Some(position) && &r.item_id != item) {
            Some(holder) => Err(StoreError::PositionTaken { position, holder: holder.item_id.clone() }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl OrderedStore for MemoryStore {
    async fn fetch_ranked_items(&self, user: &UserId) -> Result<Vec<RankedItem>, StoreError> {
        let rows = self.rows.read().await;
        let mut ranked: Vec<RankedItem> = rows
            .get(user)
            .map(|list| {
                list.iter()
                    .filter_map(|r| r.position.map(|p| RankedItem { item_id: r.item_id.clone(), position: p }))
                    .collect()
            })
            .unwrap_or_default();
        ranked.sort_by_key(|r| r.position);
        Ok(ranked)
    }

    async fn fetch_unranked_items(&self, user: &UserId) -> Result<Vec<ItemId>, StoreError> {
        let rows = self.rows.read().await;
        Ok(rows
            .get(user)
            .map(|list| list.iter().filter(|r| r.position.is_none()).map(|r| r.item_id.clone()).collect())
            .unwrap_or_default())
    }

    async fn set_position(
        &self,
        user: &UserId,
        item: &ItemId,
        position: Option<u32>,
    ) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let list = rows.entry(user.clone()).or_default();
        if let Some(p) = position {
            Self::claim(list, item, p)?;
        }
        let row = list
            .iter_mut()
            .find(|r| &r.item_id == item)
            .ok_or_else(|| StoreError::NotFound { item: item.clone() })?;
        row.position = position;
        Ok(())
    }

    async fn insert_at(&self, user: &UserId, item: &ItemId, position: u32) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let list = rows.entry(user.clone()).or_default();
        Self::claim(list, item, position)?;
        match list.iter_mut().find(|r| &r.item_id == item) {
            Some(row) => row.position = Some(position),
            None => list.push(StoredRow { item_id: item.clone(), position: Some(position) }),
        }
        Ok(())
    }

    async fn delete_item(&self, user: &UserId, item: &ItemId) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        let list = rows.entry(user.clone()).or_default();
        let before = list.len();
        list.retain(|r| &r.item_id != item);
        if list.len() == before {
            return Err(StoreError::NotFound { item: item.clone() });
        }
        Ok(())
    }

    async fn clear_all_positions(&self, user: &UserId) -> Result<(), StoreError> {
        let mut rows = self.rows.write().await;
        if let Some(list) = rows.get_mut(user) {
            for row in list.iter_mut() {
                row.position = None;
            }
        }
        Ok(())
    }
}
