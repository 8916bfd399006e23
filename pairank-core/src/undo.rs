/// Snapshot stack used for exact rollback.
///
/// One entry is pushed per resolved step; `pop` hands the snapshot back
/// verbatim. Used at two levels: per-comparison inside a `RankingSession`,
/// and per-placed-item inside the multi-item workflows.
#[derive(Debug, Clone)]
pub struct UndoStack<T> {
    entries: Vec<T>,
}

impl<T> UndoStack<T> {
    pub fn new() -> Self {
        UndoStack { entries: Vec::new() }
    }

    pub fn push(&mut self, snapshot: T) {
        self.entries.push(snapshot);
    }

    pub fn pop(&mut self) -> Option<T> {
        self.entries.pop()
    }

    pub fn peek(&self) -> Option<&T> {
        self.entries.last()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest first.
    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T> Default for UndoStack<T> {
    fn default() -> Self {
        Self::new()
    }
}
