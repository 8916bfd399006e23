/// Error taxonomy for store access and ranking workflows.
///
/// Comparison resolution is pure arithmetic and never fails; everything here
/// comes from persistence or from a caller breaking an API contract.
use crate::types::ItemId;

/// Errors an `OrderedStore` implementation reports.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Network or backend failure. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("item {item} not found")]
    NotFound { item: ItemId },
    /// A point write targeted a position another row still holds.
    #[error("position {position} is already held by {holder}")]
    PositionTaken { position: u32, holder: ItemId },
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Errors surfaced by the ranking engine and its workflows.
#[derive(Debug, thiserror::Error)]
pub enum RankError {
    /// Persistence failed before any row changed. Safe to retry or skip.
    #[error("store unavailable: {source}")]
    StoreUnavailable {
        #[source]
        source: StoreError,
    },

    /// Some rows of a shift were written and then the store stopped
    /// answering. The list is known to be inconsistent.
    #[error("shift interrupted after {written} of {total} row writes: {source}")]
    PartialShift {
        written: usize,
        total: usize,
        #[source]
        source: StoreError,
    },

    /// Post-write verification found a gap or duplicate. The final insert
    /// was not committed.
    #[error("position invariant violated for user {user}: {detail}")]
    InvariantViolation { user: String, detail: String },

    /// A pivot fell outside the ranked prefix. Indicates a defect.
    #[error("pivot index {index} outside ranked prefix of length {len}")]
    EmptyOpponentSet { index: usize, len: usize },

    #[error("no session with handle {0}")]
    UnknownHandle(u64),

    #[error("item {0} is not in the ranked list")]
    UnknownItem(ItemId),

    #[error("item {0} is already ranked")]
    AlreadyRanked(ItemId),

    /// The stored list no longer matches the one the comparisons ran
    /// against, e.g. another device wrote to it in between.
    #[error("ranked list changed during comparison: expected {expected} items, found {found}")]
    StalePrefix { expected: usize, found: usize },

    /// Persistence was requested before the search reached Terminal.
    #[error("placement has not reached a final position yet")]
    NotTerminal,

    #[error("session has not been started")]
    NotStarted,
}

impl RankError {
    /// Short text safe to show a user. Never includes backend detail.
    pub fn user_message(&self) -> &'static str {
        match self {
            RankError::StoreUnavailable { .. } => "Couldn't save. Try again.",
            RankError::PartialShift { .. } | RankError::InvariantViolation { .. } => {
                "Couldn't save. Your ranking may need to be corrected manually."
            }
            RankError::UnknownItem(_) => "That game isn't in your ranking.",
            RankError::AlreadyRanked(_) => "That game is already in your ranking.",
            RankError::StalePrefix { .. } => "Your ranking changed elsewhere. Start this game again.",
            RankError::EmptyOpponentSet { .. }
            | RankError::UnknownHandle(_)
            | RankError::NotTerminal
            | RankError::NotStarted => "Something went wrong. Please start this game over.",
        }
    }

    /// Whether the same operation may be attempted again unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RankError::StoreUnavailable { .. })
    }
}

impl From<StoreError> for RankError {
    fn from(source: StoreError) -> Self {
        RankError::StoreUnavailable { source }
    }
}
