//! Start-time configuration.
//!
//! The control surface hands the engine a packed `u32`.  It is decoded exactly once, in
//! [`Config::from_bits`], and only the typed [`Config`] travels further into the engine.
//!
//! Layout of the packed word:
//!
//! | bits    | mask          | meaning                                                  |
//! |---------|---------------|----------------------------------------------------------|
//! | 23      | `0x0080_0000` | large-map mode: file-backed ledger arena, track `mmap`   |
//! | 22      | `0x0040_0000` | allocator mode: track `malloc`/`calloc`/`realloc`/...    |
//! | 21      | `0x0020_0000` | diff cache: retain one snapshot and report deltas        |
//! | 16..=20 | `0x001F_0000` | unwind depth `d`, `d + 1` frames are captured            |
//! | 0..=15  | `0x0000_FFFF` | minimum size of a recorded heap allocation, in bytes     |

use std::fmt;

pub const MAP64_MODE: u32 = 0x0080_0000;
pub const ALLOC_MODE: u32 = 0x0040_0000;
pub const DIFF_CACHE: u32 = 0x0020_0000;
pub const DEPTH_MASK: u32 = 0x001F_0000;
pub const LIMIT_MASK: u32 = 0x0000_FFFF;

const DEPTH_SHIFT: u32 = 16;
const KNOWN_BITS: u32 = MAP64_MODE | ALLOC_MODE | DIFF_CACHE | DEPTH_MASK | LIMIT_MASK;

/// Upper bound on the number of frames kept per call stack.
pub const MAX_DEPTH: usize = 32;

/// Decoded configuration word.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Config {
    /// Back the ledger with a file in the storage directory and track address-space mappings.
    pub large_map: bool,
    /// Track heap allocations.
    pub alloc_hooks: bool,
    /// Retain the previous snapshot so that reports can show deltas.
    pub diff_cache: bool,
    /// Number of frames captured per allocation, in `1..=MAX_DEPTH`.
    pub max_depth: usize,
    /// Heap allocations below this size are not recorded.
    pub min_size: usize,
}

impl Config {
    pub fn from_bits(bits: u32) -> Self {
        let unknown = bits & !KNOWN_BITS;
        if unknown != 0 {
            tracing::warn!("ignoring unknown configuration bits {:#010x}", unknown);
        }
        let depth = ((bits & DEPTH_MASK) >> DEPTH_SHIFT) as usize;
        Config {
            large_map: bits & MAP64_MODE != 0,
            alloc_hooks: bits & ALLOC_MODE != 0,
            diff_cache: bits & DIFF_CACHE != 0,
            max_depth: (depth + 1).min(MAX_DEPTH),
            min_size: (bits & LIMIT_MASK) as usize,
        }
    }

    /// Re-encode into the wire format.  `from_bits(c.to_bits()) == c` for every decoded config.
    pub fn to_bits(&self) -> u32 {
        let mut bits = 0;
        if self.large_map {
            bits |= MAP64_MODE;
        }
        if self.alloc_hooks {
            bits |= ALLOC_MODE;
        }
        if self.diff_cache {
            bits |= DIFF_CACHE;
        }
        let depth = self.max_depth.saturating_sub(1).min((DEPTH_MASK >> DEPTH_SHIFT) as usize);
        bits |= (depth as u32) << DEPTH_SHIFT;
        bits |= self.min_size.min(LIMIT_MASK as usize) as u32;
        bits
    }

    /// Whether any kind of interception will record something.
    pub fn records_anything(&self) -> bool {
        self.large_map || self.alloc_hooks
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "map64={} alloc={} diff={} depth={} limit={}",
            self.large_map, self.alloc_hooks, self.diff_cache, self.max_depth, self.min_size
        )
    }
}

/// Engine sizing that is not part of the wire format.
#[derive(Clone, Debug)]
pub struct EngineOptions {
    /// Maximum number of live records the ledger can hold.
    pub ledger_capacity: usize,
    /// Number of independently locked ledger shards, rounded up to a power of two.
    pub shards: usize,
    /// Innermost frames dropped from stacks captured outside a trampoline, such as direct
    /// calls into the tracker.
    pub skip_frames: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            ledger_capacity: 1 << 18,
            shards: 64,
            skip_frames: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_flags_and_params() {
        let config = Config::from_bits(MAP64_MODE | DIFF_CACHE | 0x000F_0000 | 1024);
        assert!(config.large_map);
        assert!(!config.alloc_hooks);
        assert!(config.diff_cache);
        assert_eq!(config.max_depth, 16);
        assert_eq!(config.min_size, 1024);
    }

    #[test]
    fn depth_is_capped() {
        let config = Config::from_bits(DEPTH_MASK);
        assert_eq!(config.max_depth, MAX_DEPTH);
        assert_eq!(Config::from_bits(0).max_depth, 1);
    }

    #[test]
    fn reencode() {
        let bits = ALLOC_MODE | 0x0005_0000 | 16;
        assert_eq!(Config::from_bits(bits).to_bits(), bits);
    }

    #[test]
    fn unknown_bits_are_ignored() {
        let config = Config::from_bits(0x8000_0000 | ALLOC_MODE);
        assert!(config.alloc_hooks);
        assert!(!config.large_map);
    }
}
