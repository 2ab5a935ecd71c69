//! Reference processing for weak and soft references.
//!
//! Reference objects found while scanning do not keep their referent alive.
//! Whether the referent survives is only known once the Cheney scan has
//! drained, so such references are threaded onto a discovered list (through
//! their next-discovered word) and decided afterwards:
//!
//! - referent was copied: the referent slot is fixed up;
//! - referent was not evacuated by this cycle: nothing changes;
//! - otherwise the referent is dead: the slot is cleared and, when the
//!   reference has a queue, the reference becomes pending.
//!
//! Soft references accessed recently enough are treated as strong instead of
//! being discovered, unless the cycle runs with soft references as weak.

use std::sync::atomic::Ordering;

use crate::address::Address;
use crate::object::{Object, ObjectKind};

/// Terminator of the discovered list. A reference whose next-discovered word
/// is null is not on the list.
pub const DISCOVERED_END: Address = Address::from_usize(1);

const MIB: usize = 1024 * 1024;

/// Soft reference retention for `headroom_bytes` of free heap.
pub fn soft_retention_threshold(headroom_bytes: usize, nanos_per_mib: u64) -> u64 {
    ((headroom_bytes / MIB) as u64).saturating_mul(nanos_per_mib)
}

/// Whether a soft referent last accessed at `timestamp` is retained at `now`.
#[inline]
pub fn retains_softly(now: u64, timestamp: u64, threshold: u64) -> bool {
    now.saturating_sub(timestamp) < threshold
}

/// Fate of a discovered reference's referent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentStatus {
    /// The referent was copied to the given address
    Moved(Address),
    /// The referent did not move and stays alive
    Retained,
    /// The referent is unreachable
    Unreachable,
}

/// Result of processing the discovered list.
#[derive(Debug, Default)]
pub struct ReferenceOutcome {
    /// References whose referent survived
    pub retained: Vec<Object>,
    /// Number of referents cleared
    pub cleared: usize,
    /// Cleared references that carry a queue
    pub enqueued: Vec<Address>,
}

/// Collector-owned discovered list plus the soft reference clock for the
/// running cycle.
#[derive(Debug)]
pub struct ReferenceProcessor {
    head: Address,
    discovered: usize,
    now: u64,
    soft_threshold: u64,
    soft_as_weak: bool,
}

impl Default for ReferenceProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceProcessor {
    /// Empty processor.
    pub fn new() -> Self {
        Self {
            head: DISCOVERED_END,
            discovered: 0,
            now: 0,
            soft_threshold: 0,
            soft_as_weak: false,
        }
    }

    /// Prepare for a cycle.
    pub fn begin_cycle(&mut self, now: u64, soft_threshold: u64, soft_as_weak: bool) {
        debug_assert!(self.is_empty(), "discovered list survived a cycle");
        self.now = now;
        self.soft_threshold = soft_threshold;
        self.soft_as_weak = soft_as_weak;
    }

    /// Retention threshold of the running cycle.
    pub fn soft_threshold(&self) -> u64 {
        self.soft_threshold
    }

    /// Whether soft references are treated as weak this cycle.
    pub fn soft_as_weak(&self) -> bool {
        self.soft_as_weak
    }

    /// Whether `reference` keeps its referent alive as if it were strong.
    pub fn retains_strongly(&self, reference: Object) -> bool {
        reference.kind() == ObjectKind::SoftReference
            && !self.soft_as_weak
            && retains_softly(self.now, reference.timestamp(), self.soft_threshold)
    }

    /// Put `reference` on the discovered list. Returns false when it is
    /// already linked.
    pub fn discover(&mut self, reference: Object) -> bool {
        if !reference.next_discovered().is_null() {
            return false;
        }
        reference.set_next_discovered(self.head);
        self.head = reference.address();
        self.discovered += 1;
        true
    }

    /// Number of references on the discovered list.
    pub fn discovered_count(&self) -> usize {
        self.discovered
    }

    /// Whether the discovered list is empty.
    pub fn is_empty(&self) -> bool {
        self.head == DISCOVERED_END
    }

    /// Drain the discovered list, deciding each referent with `status`.
    pub fn process(&mut self, mut status: impl FnMut(Address) -> ReferentStatus) -> ReferenceOutcome {
        let mut outcome = ReferenceOutcome::default();
        let mut cursor = std::mem::replace(&mut self.head, DISCOVERED_END);
        self.discovered = 0;

        while cursor != DISCOVERED_END {
            // SAFETY: only reference objects are linked into the list
            let reference = unsafe { Object::new(cursor) };
            cursor = reference.next_discovered();
            reference.set_next_discovered(Address::NULL);

            let referent = reference.referent();
            if referent.is_null() {
                continue;
            }
            match status(referent) {
                ReferentStatus::Moved(target) => {
                    // SAFETY: the referent slot is part of the reference object
                    unsafe { reference.referent_slot().store_ref(target) };
                    outcome.retained.push(reference);
                }
                ReferentStatus::Retained => outcome.retained.push(reference),
                ReferentStatus::Unreachable => {
                    // SAFETY: the referent slot is a word-aligned word of the object
                    unsafe { reference.referent_slot().as_atomic_word() }
                        .store(0, Ordering::Release);
                    outcome.cleared += 1;
                    if !reference.queue().is_null() {
                        outcome.enqueued.push(reference.address());
                    }
                }
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectShape, QUEUE_OFFSET};

    struct Backing(Vec<u64>);

    impl Backing {
        fn new() -> Self {
            Self(vec![0; 64])
        }

        fn object(&mut self, word: usize, shape: ObjectShape) -> Object {
            let addr = Address::from_ptr(self.0.as_mut_ptr()).add(word * 8);
            unsafe { Object::initialize(addr, &shape, false) }
        }
    }

    #[test]
    fn test_soft_threshold() {
        assert_eq!(soft_retention_threshold(0, 1_000), 0);
        assert_eq!(soft_retention_threshold(MIB - 1, 1_000), 0);
        assert_eq!(soft_retention_threshold(3 * MIB, 1_000), 3_000);
        assert_eq!(soft_retention_threshold(usize::MAX, u64::MAX), u64::MAX);
    }

    #[test]
    fn test_soft_retention_boundary() {
        let threshold = 1_000;
        let timestamp = 5_000;
        // Age just below the threshold survives, at or above it does not.
        assert!(retains_softly(timestamp + threshold - 1, timestamp, threshold));
        assert!(!retains_softly(timestamp + threshold, timestamp, threshold));
        assert!(!retains_softly(timestamp + threshold + 1, timestamp, threshold));
        // A clock behind the timestamp counts as age zero.
        assert!(retains_softly(0, timestamp, threshold));
    }

    #[test]
    fn test_retains_strongly() {
        let mut backing = Backing::new();
        let soft = backing.object(0, ObjectShape::soft_reference());
        let weak = backing.object(16, ObjectShape::weak_reference());
        soft.set_timestamp(100);

        let mut processor = ReferenceProcessor::new();
        processor.begin_cycle(150, 100, false);
        assert!(processor.retains_strongly(soft));
        assert!(!processor.retains_strongly(weak));

        processor.begin_cycle(150, 100, true);
        assert!(!processor.retains_strongly(soft));
    }

    #[test]
    fn test_discover_once() {
        let mut backing = Backing::new();
        let weak = backing.object(0, ObjectShape::weak_reference());
        let mut processor = ReferenceProcessor::new();

        assert!(processor.discover(weak));
        assert!(!processor.discover(weak));
        assert_eq!(processor.discovered_count(), 1);
        assert_eq!(weak.next_discovered(), DISCOVERED_END);

        let outcome = processor.process(|_| ReferentStatus::Retained);
        // Null referents are skipped.
        assert!(outcome.retained.is_empty());
        assert!(processor.is_empty());
        assert!(weak.next_discovered().is_null());
    }

    #[test]
    fn test_process_fixes_clears_and_enqueues() {
        let mut backing = Backing::new();
        let moved = backing.object(0, ObjectShape::weak_reference());
        let dead = backing.object(8, ObjectShape::weak_reference());
        let queued = backing.object(16, ObjectShape::weak_reference());
        let queue = backing.object(24, ObjectShape::plain(0, 0));

        let old_target = Address::from_usize(0x1000);
        let new_target = Address::from_usize(0x2000);
        let dead_target = Address::from_usize(0x3000);
        unsafe {
            moved.referent_slot().store_ref(old_target);
            dead.referent_slot().store_ref(dead_target);
            queued.referent_slot().store_ref(dead_target);
            queued.address().add(QUEUE_OFFSET).store_ref(queue.address());
        }

        let mut processor = ReferenceProcessor::new();
        for reference in [moved, dead, queued] {
            processor.discover(reference);
        }
        let outcome = processor.process(|referent| {
            if referent == old_target {
                ReferentStatus::Moved(new_target)
            } else {
                ReferentStatus::Unreachable
            }
        });

        assert_eq!(moved.referent(), new_target);
        assert_eq!(outcome.retained, vec![moved]);
        assert!(dead.referent().is_null());
        assert!(queued.referent().is_null());
        assert_eq!(outcome.cleared, 2);
        assert_eq!(outcome.enqueued, vec![queued.address()]);
    }
}
