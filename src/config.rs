//! Tuning constants (spec section 6) and the subset of them that can vary
//! at runtime without resizing a fixed array.

use std::path::PathBuf;

/// Frames captured per allocation site.
pub const STACK_CAP: usize = 16;

/// Width of the tail guard, in bytes, written immediately after every
/// payload.
pub const GUARD_LEN: usize = 16;

/// Sentinel byte pattern written into the tail guard.
pub const GUARD_BYTE: u8 = 0xCC;

/// Number of chain-head slots in the live-block index. A pointer hashes to
/// `(ptr >> 12) % SLOT_COUNT` (4 KiB page bucketing).
pub const SLOT_COUNT: usize = 1 << 20;

/// Maximum number of simultaneously tracked (live + pending) blocks.
pub const POOL_CAP: usize = 100_000;

/// Minimum dwell, in milliseconds, a freed block spends on the delayed-free
/// queue before its tail guard is checked and the real free happens.
pub const DELAY_MS: u64 = 1_000;

/// Minimum interval, in milliseconds, between unforced stats emissions.
pub const STATS_MS: u64 = 10_000;

/// Runtime-tunable knobs. `STACK_CAP`, `GUARD_LEN`, `SLOT_COUNT`, and
/// `POOL_CAP` stay compile-time constants because they size fixed arrays
/// the Tracker preallocates once, with no further recursive allocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub delay_ms: u64,
    pub stats_ms: u64,
    pub guard_byte: u8,
    /// Extra directory to search for debug symbols/modules, replacing the
    /// source's hard-coded absolute library path. Falls back to the
    /// `HEAPWATCH_SYMBOL_PATH` environment variable when unset.
    pub extra_symbol_path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            delay_ms: DELAY_MS,
            stats_ms: STATS_MS,
            guard_byte: GUARD_BYTE,
            extra_symbol_path: std::env::var_os("HEAPWATCH_SYMBOL_PATH").map(PathBuf::from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = Config::default();
        assert_eq!(config.delay_ms, 1_000);
        assert_eq!(config.stats_ms, 10_000);
        assert_eq!(config.guard_byte, 0xCC);
    }
}
