/// Derives the slash-window epoch from a block height.
///
/// The chain itself has no epoch notion at this granularity; the monitor
/// buckets heights by `slash_window` so counters and alert latches can be
/// scoped to one window. `window` comes from the oracle params endpoint and
/// is always positive on a live chain.
pub fn epoch_number(height: u64, window: u64) -> u64 {
    height / window
}
