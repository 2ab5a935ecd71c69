//! Collector errors

use thiserror::Error;

use crate::roots::RootKind;
use crate::verify::VerifyReport;

/// Errors reported by the heap and the collector
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GcError {
    /// No memory could be obtained, even after a forced complete collection
    #[error("Out of memory: could not allocate {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request
        requested: usize,
    },

    /// A cycle was requested from inside a running cycle
    #[error("Collection requested while a collection is in progress")]
    CollectionInProgress,

    /// Heap verification found inconsistencies
    #[error("Heap verification failed: {0}")]
    Verification(VerifyReport),

    /// A root provider could not describe its references
    #[error("Missing reference map for {kind:?} roots: {detail}")]
    MissingReferenceMap {
        /// Root domain that failed
        kind: RootKind,
        /// Provider-specific description
        detail: String,
    },

    /// An earlier cycle failed midway and left the heap unusable
    #[error("Heap is poisoned by an earlier failed collection")]
    Poisoned,

    /// The heap configuration is inconsistent
    #[error("Invalid heap configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Chunk size is not a power of two or too small
    #[error("Aligned chunk size {0} must be a power of two of at least {min} bytes", min = crate::config::MIN_ALIGNED_CHUNK_SIZE)]
    InvalidChunkSize(usize),

    /// Minimum heap size exceeds the maximum
    #[error("Minimum heap size {min} exceeds maximum heap size {max}")]
    HeapSizeInverted {
        /// Minimum heap size
        min: usize,
        /// Maximum heap size
        max: usize,
    },

    /// Young generation does not fit in the heap
    #[error("Young generation size {young} must be non-zero and at most the maximum heap size {max}")]
    InvalidYoungSize {
        /// Young generation size
        young: usize,
        /// Maximum heap size
        max: usize,
    },

    /// Too many survivor spaces
    #[error("At most {max} survivor spaces are supported, got {got}", max = crate::config::MAX_SURVIVOR_SPACES)]
    TooManySurvivorSpaces {
        /// Requested count
        got: usize,
    },

    /// Large object threshold does not fit an aligned chunk
    #[error("Large object threshold {threshold} must be in 1..={usable} for this chunk size")]
    InvalidLargeObjectThreshold {
        /// Requested threshold
        threshold: usize,
        /// Usable bytes of an aligned chunk
        usable: usize,
    },

    /// Percentage outside 1..=100
    #[error("Percentage must be in 1..=100, got {0}")]
    InvalidPercent(u32),

    /// Zap pattern that decodes as a live header
    #[error("Zap pattern {0:#x} is indistinguishable from an object header")]
    InvalidZapPattern(usize),

    /// Unknown option name
    #[error("Unknown option: {0}")]
    UnknownOption(String),

    /// Option value could not be parsed
    #[error("Invalid value '{value}' for option {option}")]
    InvalidValue {
        /// Option name
        option: String,
        /// Rejected value
        value: String,
    },

    /// Unknown policy name
    #[error("Unknown collection policy: {0}")]
    UnknownPolicy(String),
}

/// Result type for collector operations
pub type Result<T> = std::result::Result<T, GcError>;
