/// Default cap on resolved comparisons per placement.
///
/// Binary insertion needs `ceil(log2(N + 1))` comparisons to converge exactly.
/// Past this many the session stops and accepts `low + 1` as the position:
/// a 10-comparison ceiling covers lists up to 1023 items exactly and keeps
/// the question count predictable beyond that.
pub const MAX_COMPARISONS: u32 = 10;

/// Attempts per individual row write before the shift protocol gives up.
pub const SHIFT_WRITE_ATTEMPTS: u32 = 3;

/// First backoff between row-write attempts, in milliseconds.
pub const INITIAL_RETRY_BACKOFF_MS: u64 = 50;

/// Ceiling for the exponential row-write backoff, in milliseconds.
pub const MAX_RETRY_BACKOFF_MS: u64 = 1_000;

/// Lowest valid position. Position 1 is the most preferred item.
pub const FIRST_POSITION: u32 = 1;
