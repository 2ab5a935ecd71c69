//! Collection causes and statistics snapshots.

use std::fmt;
use std::time::Duration;

use crate::accounting::Accounting;
use crate::policy::CollectionPolicy;
use crate::timers::CyclePhase;

/// Why a collection was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum GcCause {
    /// Eden reached the young generation size
    EdenFull,
    /// The embedder asked for a collection
    Explicit,
    /// An allocation failed or the heap exceeded its maximum size
    OutOfMemory,
    /// Diagnostic tooling
    Diagnostic,
    /// Tests
    Test,
}

impl fmt::Display for GcCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GcCause::EdenFull => "eden full",
            GcCause::Explicit => "explicit",
            GcCause::OutOfMemory => "out of memory",
            GcCause::Diagnostic => "diagnostic",
            GcCause::Test => "test",
        };
        f.write_str(name)
    }
}

/// What a cycle collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CollectionKind {
    /// Young generation only
    Incremental,
    /// Whole heap
    Complete,
    /// Incremental scavenge followed by a complete one
    IncrementalThenComplete,
}

impl CollectionKind {
    /// Kind for a pair of decisions, `None` when nothing ran.
    pub fn from_decision(incremental: bool, complete: bool) -> Option<Self> {
        match (incremental, complete) {
            (true, false) => Some(CollectionKind::Incremental),
            (false, true) => Some(CollectionKind::Complete),
            (true, true) => Some(CollectionKind::IncrementalThenComplete),
            (false, false) => None,
        }
    }

    /// Whether the whole heap was collected.
    pub fn is_complete(self) -> bool {
        !matches!(self, CollectionKind::Incremental)
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CycleSummary {
    /// Epoch reached by the cycle
    pub epoch: u64,
    /// Request cause
    pub cause: GcCause,
    /// What was collected
    pub kind: CollectionKind,
    /// Soft references were treated as weak
    pub soft_as_weak: bool,
    /// Chunk bytes owned by the heap before the cycle
    pub used_before: usize,
    /// Chunk bytes owned by the heap after the cycle
    pub used_after: usize,
    /// Bytes promoted to the old generation
    pub promoted_bytes: usize,
    /// Bytes copied within the young generation
    pub copied_bytes: usize,
    /// Referents cleared by reference processing
    pub cleared_references: usize,
    /// Time between pause and resume
    pub pause: Duration,
}

/// Point-in-time statistics of a heap.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HeapStats {
    /// Completed cycles
    pub epoch: u64,
    /// Current cycle phase
    pub phase: CyclePhase,
    /// Active policy
    pub policy: CollectionPolicy,
    /// Accounting record
    pub accounting: Accounting,
    /// Chunk bytes of the young generation
    pub young_chunk_bytes: usize,
    /// Chunk bytes of the old generation
    pub old_chunk_bytes: usize,
    /// Bytes occupied by objects in all spaces
    pub used_object_bytes: usize,
    /// Bytes held by chunks, including the free list
    pub committed_bytes: usize,
    /// References waiting to be taken by the embedder
    pub pending_references: usize,
    /// Pinned objects
    pub pinned_objects: usize,
    /// Last completed cycle
    pub last_cycle: Option<CycleSummary>,
}

impl HeapStats {
    /// Total collection time.
    pub fn total_collection_time(&self) -> Duration {
        Duration::from_nanos(self.accounting.collection_nanos())
    }

    /// Chunk bytes owned by all spaces.
    pub fn heap_chunk_bytes(&self) -> usize {
        self.young_chunk_bytes + self.old_chunk_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_kind_from_decision() {
        assert_eq!(CollectionKind::from_decision(false, false), None);
        assert_eq!(
            CollectionKind::from_decision(true, false),
            Some(CollectionKind::Incremental)
        );
        assert!(CollectionKind::from_decision(true, true)
            .unwrap()
            .is_complete());
        assert!(!CollectionKind::Incremental.is_complete());
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(GcCause::EdenFull.to_string(), "eden full");
        assert_eq!(GcCause::OutOfMemory.to_string(), "out of memory");
    }
}
