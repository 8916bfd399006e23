use std::fmt;

use crate::constants::FIRST_POSITION;

/// Opaque, stable identity of the thing being ranked.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        ItemId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        ItemId(s)
    }
}

/// Owner of a ranked list. Every store operation is scoped to one user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        UserId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        UserId(s.to_string())
    }
}

/// One persisted entry of a user's ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RankedItem {
    pub item_id: ItemId,
    /// 1-based; 1 = most preferred. Contiguous and unique at rest.
    pub position: u32,
}

impl RankedItem {
    pub fn new(item_id: impl Into<ItemId>, position: u32) -> Self {
        RankedItem { item_id: item_id.into(), position }
    }
}

/// A not-yet-ranked item awaiting placement.
///
/// Carries only what a comparison prompt needs to show; no position.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CandidateItem {
    pub item_id: ItemId,
    pub title: String,
    /// Cover art reference (URL or storage key).
    pub cover: Option<String>,
    /// Identifier in an external catalog, if the item came from one.
    pub external_id: Option<String>,
}

impl CandidateItem {
    pub fn new(item_id: impl Into<ItemId>, title: impl Into<String>) -> Self {
        CandidateItem {
            item_id: item_id.into(),
            title: title.into(),
            cover: None,
            external_id: None,
        }
    }
}

/// `(current, total)` progress through a multi-item workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Progress {
    /// Items already placed.
    pub current: usize,
    pub total: usize,
}

impl Progress {
    pub fn is_done(&self) -> bool {
        self.current >= self.total
    }
}

/// Final position of a completed placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Placement {
    pub position: u32,
    /// True when the comparison budget stopped the search before the
    /// bounds crossed, so the position is a best guess.
    pub approximate: bool,
}

/// Checks that `items` (in any order) hold exactly the positions `1..=N`.
///
/// Returns a description of the first gap or duplicate found.
pub fn check_contiguous(items: &[RankedItem]) -> Result<(), String> {
    let mut positions: Vec<u32> = items.iter().map(|r| r.position).collect();
    positions.sort_unstable();
    for (idx, &pos) in positions.iter().enumerate() {
        let expected = idx as u32 + FIRST_POSITION;
        if pos != expected {
            return Err(if idx > 0 && positions[idx - 1] == pos {
                format!("duplicate position {pos}")
            } else {
                format!("expected position {expected}, found {pos}")
            });
        }
    }
    Ok(())
}
