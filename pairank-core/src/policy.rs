/// Comparison policy: where to look next, and when to stop.
///
/// Pure arithmetic over `(low, high, comparison_count)`. No IO, no state.
use crate::constants::MAX_COMPARISONS;

/// Tunables for the binary-insertion search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PolicyConfig {
    /// Hard cap on resolved comparisons per placement.
    pub max_comparisons: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig { max_comparisons: MAX_COMPARISONS }
    }
}

/// What the search should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Compare the candidate against `prefix[pivot]`.
    Compare { pivot: usize },
    /// Stop. `position` is 1-based; `approximate` is set when the budget,
    /// not the bounds, ended the search.
    Terminal { position: u32, approximate: bool },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ComparisonPolicy {
    config: PolicyConfig,
}

impl ComparisonPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        ComparisonPolicy { config }
    }

    pub fn max_comparisons(&self) -> u32 {
        self.config.max_comparisons
    }

    /// Decide the next step for inclusive 0-based bounds into the prefix.
    ///
    /// An empty prefix arrives as `low = 0, high = -1` and terminates at
    /// position 1 without a comparison.
    pub fn decide(&self, low: i64, high: i64, comparison_count: u32) -> Decision {
        if low > high {
            return Decision::Terminal { position: (low + 1) as u32, approximate: false };
        }
        if comparison_count >= self.config.max_comparisons {
            return Decision::Terminal { position: (low + 1) as u32, approximate: true };
        }
        Decision::Compare { pivot: ((low + high) / 2) as usize }
    }
}

/// Upper bound on comparisons to insert into a list of `n` items:
/// `min(ceil(log2(n + 1)), max_comparisons)`.
pub fn comparison_bound(n: usize, max_comparisons: u32) -> u32 {
    // ceil(log2(n + 1)) is the bit length of n.
    let exact = usize::BITS - n.leading_zeros();
    exact.min(max_comparisons)
}
