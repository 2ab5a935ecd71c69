//! Heap configuration.
//!
//! All sizes are in bytes. A configuration is validated once when the heap
//! is created; option strings (`MaxHeapSize=64m` style) can be applied one at
//! a time with [`HeapConfig::apply_option`].

use crate::chunk::AlignedLayout;
use crate::error::ConfigError;
use crate::object::ObjectHeader;
use crate::policy::CollectionPolicy;

/// Smallest supported aligned chunk.
pub const MIN_ALIGNED_CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on survivor spaces (ages are stored in a byte).
pub const MAX_SURVIVOR_SPACES: usize = 64;

/// Fill pattern written over freshly produced chunk memory.
pub const DEFAULT_PRODUCE_ZAP: usize = 0xbaad_babe_baad_babe;

/// Fill pattern written over chunk memory being released.
pub const DEFAULT_CONSUME_ZAP: usize = 0xdead_beef_dead_beef;

const KIB: usize = 1024;
const MIB: usize = 1024 * KIB;

/// Configuration of a [`Heap`](crate::Heap).
///
/// # Example
///
/// ```ignore
/// use genscavenge::{CollectionPolicy, HeapConfig};
///
/// let config = HeapConfig {
///     young_size: 2 * 1024 * 1024,
///     policy: CollectionPolicy::BySpaceAndTime,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    // =========================================================================
    // Chunks
    // =========================================================================
    /// Size (and alignment) of aligned chunks. Power of two.
    ///
    /// Default: 1MB
    pub aligned_chunk_size: usize,

    /// Objects at least this large get their own unaligned chunk.
    ///
    /// Default: 128KB
    pub large_object_threshold: usize,

    // =========================================================================
    // Heap sizing
    // =========================================================================
    /// Chunk bytes kept committed instead of being returned to the system.
    ///
    /// Default: 0
    pub min_heap_size: usize,

    /// Upper bound on chunk bytes owned by all spaces.
    ///
    /// Default: 256MB
    pub max_heap_size: usize,

    /// Eden chunk bytes that trigger an incremental collection.
    ///
    /// Default: 8MB
    pub young_size: usize,

    /// Number of survivor from/to pairs. Zero promotes eden survivors
    /// straight to the old generation.
    ///
    /// Default: 1
    pub max_survivor_spaces: usize,

    // =========================================================================
    // Policy
    // =========================================================================
    /// Collection policy.
    ///
    /// Default: `ByTime`
    pub policy: CollectionPolicy,

    /// Share of total collection time that incremental collections may take
    /// before a complete collection is requested.
    ///
    /// Default: 50
    pub percent_time_in_incremental: u32,

    /// Old generation chunk bytes below which `BySpaceAndTime` never asks
    /// for a complete collection.
    ///
    /// Default: 16MB
    pub complete_collection_min_old_bytes: usize,

    /// Soft reference retention per MiB of heap headroom, in nanoseconds.
    ///
    /// Default: 1s
    pub soft_ref_lru_nanos_per_mib: u64,

    // =========================================================================
    // Debugging
    // =========================================================================
    /// Verify the heap before every cycle.
    pub verify_before: bool,

    /// Verify the heap after every cycle.
    pub verify_after: bool,

    /// Turn verification failures into [`GcError::Verification`](crate::GcError).
    ///
    /// Default: true
    pub abort_on_verification_failure: bool,

    /// Fill produced and released chunk memory with the zap patterns.
    pub zap_chunks: bool,

    /// Pattern for produced chunk memory.
    pub produce_zap_pattern: usize,

    /// Pattern for released chunk memory.
    pub consume_zap_pattern: usize,

    /// Log a summary line after every cycle.
    pub print_gc_summary: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            aligned_chunk_size: MIB,
            large_object_threshold: 128 * KIB,
            min_heap_size: 0,
            max_heap_size: 256 * MIB,
            young_size: 8 * MIB,
            max_survivor_spaces: 1,
            policy: CollectionPolicy::ByTime,
            percent_time_in_incremental: 50,
            complete_collection_min_old_bytes: 16 * MIB,
            soft_ref_lru_nanos_per_mib: 1_000_000_000,
            verify_before: false,
            verify_after: false,
            abort_on_verification_failure: true,
            zap_chunks: false,
            produce_zap_pattern: DEFAULT_PRODUCE_ZAP,
            consume_zap_pattern: DEFAULT_CONSUME_ZAP,
            print_gc_summary: false,
        }
    }
}

impl HeapConfig {
    /// A small heap for tests: 64KB chunks, verification on both sides of
    /// every cycle.
    pub fn for_testing() -> Self {
        Self {
            aligned_chunk_size: 64 * KIB,
            large_object_threshold: 16 * KIB,
            max_heap_size: 16 * MIB,
            young_size: 256 * KIB,
            complete_collection_min_old_bytes: MIB,
            verify_before: true,
            verify_after: true,
            zap_chunks: true,
            ..Default::default()
        }
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.aligned_chunk_size.is_power_of_two()
            || self.aligned_chunk_size < MIN_ALIGNED_CHUNK_SIZE
        {
            return Err(ConfigError::InvalidChunkSize(self.aligned_chunk_size));
        }
        if self.min_heap_size > self.max_heap_size {
            return Err(ConfigError::HeapSizeInverted {
                min: self.min_heap_size,
                max: self.max_heap_size,
            });
        }
        if self.young_size == 0 || self.young_size > self.max_heap_size {
            return Err(ConfigError::InvalidYoungSize {
                young: self.young_size,
                max: self.max_heap_size,
            });
        }
        if self.max_survivor_spaces > MAX_SURVIVOR_SPACES {
            return Err(ConfigError::TooManySurvivorSpaces {
                got: self.max_survivor_spaces,
            });
        }
        let usable = AlignedLayout::new(self.aligned_chunk_size).usable_bytes();
        if self.large_object_threshold == 0 || self.large_object_threshold > usable {
            return Err(ConfigError::InvalidLargeObjectThreshold {
                threshold: self.large_object_threshold,
                usable,
            });
        }
        if self.percent_time_in_incremental == 0 || self.percent_time_in_incremental > 100 {
            return Err(ConfigError::InvalidPercent(self.percent_time_in_incremental));
        }
        for pattern in [self.produce_zap_pattern, self.consume_zap_pattern] {
            if !ObjectHeader::is_zap_pattern(pattern) {
                return Err(ConfigError::InvalidZapPattern(pattern));
            }
        }
        Ok(())
    }

    /// Apply a named option, e.g. `apply_option("MaxHeapSize", "64m")`.
    ///
    /// Sizes accept `k`, `m` and `g` suffixes; booleans accept `true`/`false`.
    pub fn apply_option(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            option: name.to_string(),
            value: value.to_string(),
        };
        match name {
            "AlignedHeapChunkSize" => self.aligned_chunk_size = parse_size(value).ok_or_else(invalid)?,
            "LargeObjectThreshold" => {
                self.large_object_threshold = parse_size(value).ok_or_else(invalid)?
            }
            "MinHeapSize" => self.min_heap_size = parse_size(value).ok_or_else(invalid)?,
            "MaxHeapSize" => self.max_heap_size = parse_size(value).ok_or_else(invalid)?,
            "MaxNewSize" => self.young_size = parse_size(value).ok_or_else(invalid)?,
            "MaxSurvivorSpaces" => {
                self.max_survivor_spaces = value.parse().map_err(|_| invalid())?
            }
            "CollectionPolicy" => self.policy = CollectionPolicy::from_name(value)?,
            "PercentTimeInIncrementalCollection" => {
                self.percent_time_in_incremental = value.parse().map_err(|_| invalid())?
            }
            "CompleteCollectionMinOldSize" => {
                self.complete_collection_min_old_bytes = parse_size(value).ok_or_else(invalid)?
            }
            "SoftRefLRUPolicyMSPerMB" => {
                let millis: u64 = value.parse().map_err(|_| invalid())?;
                self.soft_ref_lru_nanos_per_mib = millis.checked_mul(1_000_000).ok_or_else(invalid)?;
            }
            "VerifyBeforeGC" => self.verify_before = parse_bool(value).ok_or_else(invalid)?,
            "VerifyAfterGC" => self.verify_after = parse_bool(value).ok_or_else(invalid)?,
            "AbortOnVerificationFailure" => {
                self.abort_on_verification_failure = parse_bool(value).ok_or_else(invalid)?
            }
            "ZapChunks" => self.zap_chunks = parse_bool(value).ok_or_else(invalid)?,
            "PrintGCSummary" => self.print_gc_summary = parse_bool(value).ok_or_else(invalid)?,
            _ => return Err(ConfigError::UnknownOption(name.to_string())),
        }
        Ok(())
    }
}

/// Parse a byte size with an optional `k`/`m`/`g` suffix (case-insensitive).
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    let (digits, multiplier) = match value.char_indices().last()? {
        (index, 'k' | 'K') => (&value[..index], KIB),
        (index, 'm' | 'M') => (&value[..index], MIB),
        (index, 'g' | 'G') => (&value[..index], 1024 * MIB),
        _ => (value, 1),
    };
    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}
