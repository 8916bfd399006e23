/// Test support: a failure-injecting store wrapper and preference oracles.
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::OrderedStore;
use crate::types::{ItemId, RankedItem, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailMode {
    Healthy,
    /// The next `n` writes fail, then writes succeed again.
    NextWrites(u32),
    AllWrites,
    /// The first `n` writes succeed, every later write fails.
    AfterWrites(u32),
    /// Writes report success but change nothing.
    SilentlyDropWrites,
    AllReads,
}

/// Wraps a store and injects failures on demand.
pub struct FlakyStore<S> {
    inner: S,
    state: Mutex<(FailMode, u32)>,
}

impl<S: OrderedStore> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        FlakyStore { inner, state: Mutex::new((FailMode::Healthy, 0)) }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn fail(&self, mode: FailMode) {
        *self.state.lock().unwrap() = (mode, 0);
    }

    pub fn heal(&self) {
        self.fail(FailMode::Healthy);
    }

    /// Ok(true) = apply the write, Ok(false) = pretend.
    fn gate_write(&self) -> Result<bool, StoreError> {
        let mut state = self.state.lock().unwrap();
        match state.0 {
            FailMode::Healthy | FailMode::AllReads => Ok(true),
            FailMode::NextWrites(0) => Ok(true),
            FailMode::NextWrites(n) => {
                state.0 = FailMode::NextWrites(n - 1);
                injected()
            }
            FailMode::AllWrites => injected(),
            FailMode::AfterWrites(k) => {
                if state.1 < k {
                    state.1 += 1;
                    Ok(true)
                } else {
                    injected()
                }
            }
            FailMode::SilentlyDropWrites => Ok(false),
        }
    }

    fn gate_read(&self) -> Result<(), StoreError> {
        match self.state.lock().unwrap().0 {
            FailMode::AllReads => Err(StoreError::Unavailable("injected read failure".into())),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl<S: OrderedStore> OrderedStore for FlakyStore<S> {
    async fn fetch_ranked_items(&self, user: &UserId) -> Result<Vec<RankedItem>, StoreError> {
        self.gate_read()?;
        self.inner.fetch_ranked_items(user).await
    }

    async fn fetch_unranked_items(&self, user: &UserId) -> Result<Vec<ItemId>, StoreError> {
        self.gate_read()?;
        self.inner.fetch_unranked_items(user).await
    }

    async fn set_position(&self, user: &UserId, item: &ItemId, position: Option<u32>) -> Result<(), StoreError> {
        if self.gate_write()? {
            self.inner.set_position(user, item, position).await?;
        }
        Ok(())
    }

    async fn insert_at(&self, user: &UserId, item: &ItemId, position: u32) -> Result<(), StoreError> {
        if self.gate_write()? {
            self.inner.insert_at(user, item, position).await?;
        }
        Ok(())
    }

    async fn delete_item(&self, user: &UserId, item: &ItemId) -> Result<(), StoreError> {
        if self.gate_write()? {
            self.inner.delete_item(user, item).await?;
        }
        Ok(())
    }

    async fn clear_all_positions(&self, user: &UserId) -> Result<(), StoreError> {
        if self.gate_write()? {
            self.inner.clear_all_positions(user).await?;
        }
        Ok(())
    }
}

fn injected() -> Result<bool, StoreError> {
    Err(StoreError::Unavailable("injected write failure".into()))
}

/// A total preference order over item ids: lower score = more preferred.
pub struct Oracle {
    rank: HashMap<ItemId, usize>,
}

impl Oracle {
    /// `order[0]` is the most preferred item.
    pub fn from_order(order: &[&str]) -> Self {
        Oracle {
            rank: order.iter().enumerate().map(|(i, id)| (ItemId::new(*id), i)).collect(),
        }
    }

    pub fn prefers(&self, a: &ItemId, b: &ItemId) -> bool {
        self.rank[a] < self.rank[b]
    }
}

pub fn ids(ranked: &[RankedItem]) -> Vec<String> {
    ranked.iter().map(|r| r.item_id.to_string()).collect()
}
