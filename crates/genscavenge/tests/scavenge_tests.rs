//! Whole-cycle scavenger tests
//!
//! Each test drives a real heap through allocation, root registration and
//! collection requests, then inspects where objects ended up.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, OnceLock, Weak, mpsc};
use std::thread;
use std::time::Duration;

use genscavenge::address::WORD;
use genscavenge::chunk::{UNALIGNED_CHUNK_ALIGNMENT, enclosing_chunk};
use genscavenge::object::NEXT_DISCOVERED_OFFSET;
use genscavenge::reference::soft_retention_threshold;
use genscavenge::space::Space;
use genscavenge::{
    Address, CollectionKind, CollectionPolicy, GcCause, GcError, HandshakeSafepoint, Heap,
    HeapBuilder, HeapConfig, ManualClock, MemorySource, Object, ObjectShape, RootKind,
    RootProvider, RootSlots, SpaceId, SystemMemory, VerifyFailure,
};

fn heap_with_roots(config: HeapConfig) -> (Arc<Heap>, RootSlots) {
    let heap = Heap::new(config).unwrap();
    let roots = RootSlots::new(RootKind::ThreadStack);
    heap.register_roots(Arc::new(roots.clone()));
    (heap, roots)
}

fn space_of(heap: &Heap, address: Address) -> Option<SpaceId> {
    heap.with_generations(|generations| {
        generations
            .spaces()
            .find(|space| {
                space
                    .chunks()
                    .any(|chunk| chunk.contains_object_address(address))
            })
            .map(Space::id)
    })
}

fn slot_card_is_dirty(heap: &Heap, holder: Address, index: usize) -> bool {
    heap.with_generations(|_| unsafe {
        let object = Object::new(holder);
        let chunk = enclosing_chunk(object, heap.config().aligned_chunk_size);
        chunk
            .card_table()
            .is_dirty(chunk.card_index(object.slot_address(index)))
    })
}

fn write_u64(heap: &Heap, object: Address, value: u64) {
    unsafe { heap.write_payload(object, 0, &value.to_le_bytes()) };
}

fn read_u64(heap: &Heap, object: Address) -> u64 {
    let mut buf = [0u8; 8];
    unsafe { heap.read_payload(object, 0, &mut buf) };
    u64::from_le_bytes(buf)
}

fn only_incrementally() -> HeapConfig {
    HeapConfig {
        policy: CollectionPolicy::OnlyIncrementally,
        ..HeapConfig::for_testing()
    }
}

#[test]
fn test_eden_full_triggers_incremental_collection() {
    let (heap, roots) = heap_with_roots(HeapConfig::for_testing());
    let shape = ObjectShape::plain(1, 100);

    let mut rooted = Vec::new();
    let mut after_collection = None;
    for i in 0..100_000u64 {
        let before = heap.epoch();
        let object = heap.allocate(&shape).unwrap();
        write_u64(&heap, object, i);
        if heap.epoch() > before {
            after_collection = Some(object);
            break;
        }
        if i % 10 == 0 {
            rooted.push((roots.push(object), i));
        }
    }
    let after_collection = after_collection.expect("eden never filled");

    let stats = heap.stats();
    assert_eq!(stats.epoch, 1);
    assert_eq!(stats.accounting.incremental_count, 1);
    assert_eq!(stats.accounting.complete_count, 0);
    let summary = stats.last_cycle.unwrap();
    assert_eq!(summary.cause, GcCause::EdenFull);
    assert_eq!(summary.kind, CollectionKind::Incremental);
    assert!(summary.copied_bytes > 0);
    assert_eq!(summary.promoted_bytes, 0);

    for (index, value) in rooted {
        let object = roots.get(index);
        assert_eq!(space_of(&heap, object), Some(SpaceId::SurvivorFrom(0)));
        assert_eq!(read_u64(&heap, object), value);
    }
    assert_eq!(space_of(&heap, after_collection), Some(SpaceId::Eden));
}

#[test]
fn test_old_occupancy_triggers_complete_collection() {
    let config = HeapConfig {
        policy: CollectionPolicy::BySpaceAndTime,
        max_survivor_spaces: 0,
        complete_collection_min_old_bytes: 128 * 1024,
        ..HeapConfig::for_testing()
    };
    let (heap, roots) = heap_with_roots(config);
    let shape = ObjectShape::plain(0, 1000);

    let mut count = 0u64;
    while heap.stats().accounting.complete_count == 0 {
        assert!(count < 5_000, "no complete collection happened");
        let object = heap.allocate(&shape).unwrap();
        write_u64(&heap, object, count);
        roots.push(object);
        count += 1;
    }

    let stats = heap.stats();
    assert!(stats.accounting.incremental_count >= 2);
    let summary = stats.last_cycle.unwrap();
    assert_eq!(summary.kind, CollectionKind::IncrementalThenComplete);
    assert!(summary.used_before > 128 * 1024);

    for index in 0..roots.len() {
        assert_eq!(read_u64(&heap, roots.get(index)), index as u64);
    }
    assert!(heap.verify().unwrap().is_ok());
}

#[test]
fn test_linked_list_survives_cycles() {
    let (heap, roots) = heap_with_roots(HeapConfig::for_testing());
    roots.push(Address::NULL);
    let shape = ObjectShape::plain(1, 8);

    for i in 0..2_000u64 {
        let node = heap.allocate(&shape).unwrap();
        write_u64(&heap, node, i);
        unsafe { heap.write_ref(node, 0, roots.get(0)) };
        roots.set(0, node);
        if i == 500 {
            heap.request_collection(GcCause::Test).unwrap();
        }
        if i == 1_000 {
            heap.request_complete_collection(GcCause::Test).unwrap();
        }
    }
    heap.request_collection(GcCause::Test).unwrap();

    let mut cursor = roots.get(0);
    let mut expected = 2_000u64;
    while !cursor.is_null() {
        expected -= 1;
        assert_eq!(read_u64(&heap, cursor), expected);
        cursor = unsafe { heap.read_ref(cursor, 0) };
    }
    assert_eq!(expected, 0);
}

#[test]
fn test_to_spaces_empty_after_cycle() {
    let (heap, roots) = heap_with_roots(HeapConfig {
        max_survivor_spaces: 3,
        ..only_incrementally()
    });
    for i in 0..50u64 {
        let object = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
        write_u64(&heap, object, i);
        roots.push(object);
    }
    for _ in 0..5 {
        heap.request_collection(GcCause::Test).unwrap();
        heap.with_generations(|generations| {
            for space in generations.spaces() {
                if space.id().is_to_space() {
                    assert!(space.is_empty(), "{} not empty", space.id());
                }
            }
            assert!(generations.young.eden.is_empty());
        });
    }
    // Ages 0, 1, 2 in survivor spaces, then old.
    assert_eq!(space_of(&heap, roots.get(0)), Some(SpaceId::OldFrom));
    for index in 0..roots.len() {
        assert_eq!(read_u64(&heap, roots.get(index)), index as u64);
    }
}

#[test]
fn test_survivor_aging() {
    let (heap, roots) = heap_with_roots(HeapConfig {
        max_survivor_spaces: 2,
        ..only_incrementally()
    });
    let object = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    roots.push(object);

    let expected = [
        SpaceId::SurvivorFrom(0),
        SpaceId::SurvivorFrom(1),
        SpaceId::OldFrom,
        SpaceId::OldFrom,
    ];
    for space in expected {
        heap.request_collection(GcCause::Test).unwrap();
        assert_eq!(space_of(&heap, roots.get(0)), Some(space));
    }
}

#[test]
fn test_complete_collection_moves_everything_old() {
    let (heap, roots) = heap_with_roots(HeapConfig::for_testing());
    for _ in 0..20 {
        let object = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
        roots.push(object);
    }
    heap.request_complete_collection(GcCause::Explicit).unwrap();

    let stats = heap.stats();
    assert_eq!(stats.young_chunk_bytes, 0);
    assert!(stats.old_chunk_bytes > 0);
    assert_eq!(stats.accounting.complete_count, 1);
    for index in 0..roots.len() {
        assert_eq!(space_of(&heap, roots.get(index)), Some(SpaceId::OldFrom));
    }
}

#[test]
fn test_incremental_cleans_card_and_updates_pointer() {
    let (heap, roots) = heap_with_roots(HeapConfig {
        max_survivor_spaces: 0,
        ..only_incrementally()
    });
    let holder = heap.allocate(&ObjectShape::plain(1, 0)).unwrap();
    roots.push(holder);
    heap.request_collection(GcCause::Test).unwrap();
    let holder = roots.get(0);
    assert_eq!(space_of(&heap, holder), Some(SpaceId::OldFrom));
    assert!(!slot_card_is_dirty(&heap, holder, 0));

    let young = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    write_u64(&heap, young, 42);
    unsafe { heap.write_ref(holder, 0, young) };
    assert!(slot_card_is_dirty(&heap, holder, 0));

    heap.request_collection(GcCause::Test).unwrap();
    assert_eq!(roots.get(0), holder, "old holder moved in an incremental cycle");
    let promoted = unsafe { heap.read_ref(holder, 0) };
    assert_ne!(promoted, young);
    assert_eq!(space_of(&heap, promoted), Some(SpaceId::OldFrom));
    assert_eq!(read_u64(&heap, promoted), 42);
    assert!(!slot_card_is_dirty(&heap, holder, 0));
}

#[test]
fn test_card_stays_dirty_while_target_is_young() {
    let (heap, roots) = heap_with_roots(HeapConfig {
        max_survivor_spaces: 1,
        ..only_incrementally()
    });
    let holder = heap.allocate(&ObjectShape::plain(1, 0)).unwrap();
    roots.push(holder);
    heap.request_collection(GcCause::Test).unwrap();
    heap.request_collection(GcCause::Test).unwrap();
    let holder = roots.get(0);
    assert_eq!(space_of(&heap, holder), Some(SpaceId::OldFrom));

    let young = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    write_u64(&heap, young, 7);
    unsafe { heap.write_ref(holder, 0, young) };

    heap.request_collection(GcCause::Test).unwrap();
    let survivor = unsafe { heap.read_ref(holder, 0) };
    assert_eq!(space_of(&heap, survivor), Some(SpaceId::SurvivorFrom(0)));
    assert!(slot_card_is_dirty(&heap, holder, 0));

    heap.request_collection(GcCause::Test).unwrap();
    let old = unsafe { heap.read_ref(holder, 0) };
    assert_eq!(space_of(&heap, old), Some(SpaceId::OldFrom));
    assert_eq!(read_u64(&heap, old), 7);
    assert!(!slot_card_is_dirty(&heap, holder, 0));
}

#[test]
fn test_large_object_promoted_by_relinking() {
    let (heap, roots) = heap_with_roots(only_incrementally());
    let large = heap.allocate(&ObjectShape::plain(1, 20 * 1024)).unwrap();
    roots.push(large);
    let small = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    write_u64(&heap, small, 99);
    unsafe { heap.write_ref(large, 0, small) };

    heap.request_collection(GcCause::Test).unwrap();
    assert_eq!(roots.get(0), large);
    assert!(unsafe { Object::new(large) }.is_unaligned());
    assert_eq!(space_of(&heap, large), Some(SpaceId::SurvivorFrom(0)));
    let small = unsafe { heap.read_ref(large, 0) };
    assert_eq!(read_u64(&heap, small), 99);

    heap.request_collection(GcCause::Test).unwrap();
    assert_eq!(roots.get(0), large);
    assert_eq!(space_of(&heap, large), Some(SpaceId::OldFrom));
    let small = unsafe { heap.read_ref(large, 0) };
    assert_eq!(space_of(&heap, small), Some(SpaceId::OldFrom));
    assert_eq!(read_u64(&heap, small), 99);
}

#[test]
fn test_pinned_object_does_not_move() {
    let (heap, roots) = heap_with_roots(HeapConfig::for_testing());
    let pinned = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    write_u64(&heap, pinned, 5);
    let neighbour = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    roots.push(pinned);
    roots.push(neighbour);
    let pin = heap.pin(pinned).unwrap();

    heap.request_collection(GcCause::Test).unwrap();
    assert_eq!(roots.get(0), pinned);
    // The whole chunk was promoted, so its other objects stay put too.
    assert_eq!(roots.get(1), neighbour);
    assert_eq!(space_of(&heap, pinned), Some(SpaceId::OldFrom));
    assert_eq!(read_u64(&heap, pinned), 5);

    assert!(heap.unpin(pin));
    heap.request_complete_collection(GcCause::Test).unwrap();
    assert_ne!(roots.get(0), pinned);
    assert_eq!(read_u64(&heap, roots.get(0)), 5);
}

#[test]
fn test_pinned_large_object_does_not_move() {
    let (heap, _roots) = heap_with_roots(only_incrementally());
    let large = heap.allocate(&ObjectShape::plain(1, 20 * 1024)).unwrap();
    let small = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    write_u64(&heap, small, 17);
    unsafe { heap.write_ref(large, 0, small) };
    let pin = heap.pin(large).unwrap();

    heap.request_collection(GcCause::Test).unwrap();
    assert!(unsafe { Object::new(large) }.is_unaligned());
    assert_eq!(space_of(&heap, large), Some(SpaceId::OldFrom));
    let small = unsafe { heap.read_ref(large, 0) };
    assert_eq!(space_of(&heap, small), Some(SpaceId::SurvivorFrom(0)));
    assert!(slot_card_is_dirty(&heap, large, 0));
    assert!(heap.verify().unwrap().is_ok());

    heap.request_complete_collection(GcCause::Test).unwrap();
    assert_eq!(space_of(&heap, large), Some(SpaceId::OldFrom));
    let small = unsafe { heap.read_ref(large, 0) };
    assert_eq!(space_of(&heap, small), Some(SpaceId::OldFrom));
    assert_eq!(read_u64(&heap, small), 17);
    assert!(heap.verify().unwrap().is_ok());
    assert!(heap.unpin(pin));
}

#[test]
fn test_pinned_old_object_survives_complete_collection() {
    let (heap, roots) = heap_with_roots(HeapConfig::for_testing());
    let object = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    write_u64(&heap, object, 23);
    roots.push(object);
    roots.push(heap.allocate(&ObjectShape::plain(0, 8)).unwrap());
    heap.request_complete_collection(GcCause::Test).unwrap();

    let pinned = roots.get(0);
    let neighbour = roots.get(1);
    assert_eq!(space_of(&heap, pinned), Some(SpaceId::OldFrom));
    let pin = heap.pin(pinned).unwrap();

    heap.request_complete_collection(GcCause::Test).unwrap();
    assert_eq!(roots.get(0), pinned);
    assert_eq!(roots.get(1), neighbour);
    assert_eq!(space_of(&heap, pinned), Some(SpaceId::OldFrom));
    assert_eq!(read_u64(&heap, pinned), 23);
    assert_eq!(heap.stats().pinned_objects, 1);
    assert!(heap.verify().unwrap().is_ok());

    assert!(heap.unpin(pin));
    heap.request_complete_collection(GcCause::Test).unwrap();
    assert_ne!(roots.get(0), pinned);
    assert_eq!(read_u64(&heap, roots.get(0)), 23);
    assert!(heap.verify().unwrap().is_ok());
}

/// Every word of `object` after its header.
fn words_after_header(object: Address) -> Vec<usize> {
    let object = unsafe { Object::new(object) };
    (WORD..object.size())
        .step_by(WORD)
        .map(|offset| unsafe { object.address().add(offset).load_word() })
        .collect()
}

/// Copy `objects` once and check each copy against its previous words, with
/// references translated through `moved`.
fn assert_copied_verbatim(heap: &Heap, roots: &RootSlots, expected_space: SpaceId) {
    let before: Vec<(Address, Vec<usize>)> = (0..roots.len())
        .map(|index| (roots.get(index), words_after_header(roots.get(index))))
        .collect();
    heap.request_collection(GcCause::Test).unwrap();

    let moved = |word: usize| {
        before
            .iter()
            .position(|(old, _)| old.as_usize() == word)
            .map_or(word, |index| roots.get(index).as_usize())
    };
    for (index, (old, old_words)) in before.iter().enumerate() {
        let copy = roots.get(index);
        assert_ne!(copy, *old);
        assert_eq!(space_of(heap, copy), Some(expected_space));
        let object = unsafe { Object::new(copy) };
        let new_words = words_after_header(copy);
        assert_eq!(new_words.len(), old_words.len());
        for (position, (&old_word, &new_word)) in old_words.iter().zip(&new_words).enumerate() {
            let offset = (position + 1) * WORD;
            if object.kind().is_reference() && offset == NEXT_DISCOVERED_OFFSET {
                assert_eq!(new_word, 0);
            } else {
                assert_eq!(new_word, moved(old_word), "word at offset {offset} of root {index}");
            }
        }
    }
}

#[test]
fn test_copies_are_identical_apart_from_header() {
    let config = HeapConfig {
        max_survivor_spaces: 1,
        ..only_incrementally()
    };
    let clock = Arc::new(ManualClock::new(123_456_789));
    let heap = Heap::builder(config).clock(clock).build().unwrap();
    let roots = RootSlots::new(RootKind::ThreadStack);
    heap.register_roots(Arc::new(roots.clone()));

    let first = roots.push(heap.allocate(&ObjectShape::plain(0, 8)).unwrap());
    let second = roots.push(heap.allocate(&ObjectShape::plain(0, 8)).unwrap());
    let plain = roots.push(heap.allocate(&ObjectShape::plain(3, 37)).unwrap());
    let soft = roots.push(heap.allocate(&ObjectShape::soft_reference()).unwrap());

    let payload: Vec<u8> = (0..37u8).map(|i| i.wrapping_mul(7).wrapping_add(3)).collect();
    unsafe {
        heap.write_payload(roots.get(first), 0, &u64::MAX.to_le_bytes());
        heap.write_payload(roots.get(second), 0, &0x0102_0304_0506_0708u64.to_le_bytes());
        heap.write_ref(roots.get(plain), 0, roots.get(first));
        heap.write_ref(roots.get(plain), 1, roots.get(second));
        heap.write_ref(roots.get(plain), 2, roots.get(soft));
        heap.write_payload(roots.get(plain), 0, &payload);
        heap.write_referent(roots.get(soft), roots.get(first));
        heap.write_queue(roots.get(soft), roots.get(second));
        assert_eq!(Object::new(roots.get(soft)).timestamp(), 123_456_789);
    }

    assert_copied_verbatim(&heap, &roots, SpaceId::SurvivorFrom(0));
    assert_copied_verbatim(&heap, &roots, SpaceId::OldFrom);

    let mut copied = vec![0u8; 37];
    unsafe {
        heap.read_payload(roots.get(plain), 0, &mut copied);
        assert_eq!(Object::new(roots.get(soft)).timestamp(), 123_456_789);
    }
    assert_eq!(copied, payload);
    assert!(heap.verify().unwrap().is_ok());
}

#[test]
fn test_weak_references() {
    let (heap, roots) = heap_with_roots(HeapConfig::for_testing());
    let kept_ref = roots.push(heap.allocate(&ObjectShape::weak_reference()).unwrap());
    let dead_ref = roots.push(heap.allocate(&ObjectShape::weak_reference()).unwrap());
    let target = roots.push(heap.allocate(&ObjectShape::plain(0, 8)).unwrap());
    let queue = heap.allocate(&ObjectShape::plain(0, 0)).unwrap();
    let garbage = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    unsafe {
        heap.write_referent(roots.get(kept_ref), roots.get(target));
        heap.write_referent(roots.get(dead_ref), garbage);
        heap.write_queue(roots.get(dead_ref), queue);
    }

    heap.request_collection(GcCause::Test).unwrap();

    unsafe {
        assert_eq!(heap.reference_get(roots.get(kept_ref)), roots.get(target));
        assert!(heap.reference_get(roots.get(dead_ref)).is_null());
        assert!(!Object::new(roots.get(dead_ref)).queue().is_null());
    }
    assert_eq!(heap.stats().pending_references, 1);
    assert_eq!(heap.take_pending_references(), vec![roots.get(dead_ref)]);
    assert!(heap.take_pending_references().is_empty());
    assert_eq!(heap.stats().last_cycle.unwrap().cleared_references, 1);
}

/// Collect once with the clock `age` nanos past the soft reference's
/// timestamp and report whether the referent survived.
fn soft_referent_survives(age_from_threshold: i64) -> bool {
    let config = HeapConfig {
        soft_ref_lru_nanos_per_mib: 1_000,
        ..only_incrementally()
    };
    let clock = Arc::new(ManualClock::new(1_000));
    let heap = Heap::builder(config.clone())
        .clock(clock.clone())
        .build()
        .unwrap();
    let roots = RootSlots::new(RootKind::ThreadStack);
    heap.register_roots(Arc::new(roots.clone()));

    let soft = roots.push(heap.allocate(&ObjectShape::soft_reference()).unwrap());
    let referent = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    write_u64(&heap, referent, 11);
    unsafe { heap.write_referent(roots.get(soft), referent) };

    let used = heap.stats().heap_chunk_bytes();
    let threshold = soft_retention_threshold(
        config.max_heap_size - used,
        config.soft_ref_lru_nanos_per_mib,
    );
    assert!(threshold > 0);
    clock.set((1_000 + threshold as i64 + age_from_threshold) as u64);

    heap.request_collection(GcCause::Test).unwrap();
    let referent = unsafe { heap.reference_get(roots.get(soft)) };
    if referent.is_null() {
        return false;
    }
    assert_eq!(read_u64(&heap, referent), 11);
    true
}

#[test]
fn test_soft_reference_retention_boundary() {
    assert!(soft_referent_survives(-1));
    assert!(!soft_referent_survives(0));
    assert!(!soft_referent_survives(1));
}

/// Memory source that allows a fixed number of unaligned chunks.
struct LargeChunkBudget {
    remaining: AtomicUsize,
}

impl MemorySource for LargeChunkBudget {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        if layout.align() == UNALIGNED_CHUNK_ALIGNMENT
            && self
                .remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
        {
            return None;
        }
        SystemMemory.reserve(layout)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { SystemMemory.release(ptr, layout) }
    }
}

#[test]
fn test_unaligned_chunk_failure_escalates_to_out_of_memory() {
    let memory = Arc::new(LargeChunkBudget {
        remaining: AtomicUsize::new(1),
    });
    let heap = Heap::builder(HeapConfig::for_testing())
        .memory_source(memory)
        .clock(Arc::new(ManualClock::new(0)))
        .build()
        .unwrap();
    let roots = RootSlots::new(RootKind::ThreadStack);
    heap.register_roots(Arc::new(roots.clone()));

    // Young soft reference: retained by age, only cleared when soft
    // references are treated as weak.
    let soft = roots.push(heap.allocate(&ObjectShape::soft_reference()).unwrap());
    let referent = heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    unsafe { heap.write_referent(roots.get(soft), referent) };

    let large_shape = ObjectShape::plain(0, 20 * 1024);
    let large = roots.push(heap.allocate(&large_shape).unwrap());

    let result = heap.allocate(&large_shape);
    assert_eq!(
        result,
        Err(GcError::OutOfMemory {
            requested: large_shape.size()
        })
    );

    let stats = heap.stats();
    assert_eq!(stats.epoch, 1);
    assert_eq!(stats.accounting.complete_count, 1);
    let summary = stats.last_cycle.unwrap();
    assert_eq!(summary.cause, GcCause::OutOfMemory);
    assert!(summary.kind.is_complete());
    assert!(summary.soft_as_weak);
    assert!(unsafe { heap.reference_get(roots.get(soft)) }.is_null());

    assert_eq!(space_of(&heap, roots.get(large)), Some(SpaceId::OldFrom));
    assert!(!heap.is_poisoned());
}

#[test]
fn test_heap_limit_reports_out_of_memory() {
    let config = HeapConfig {
        max_heap_size: 512 * 1024,
        young_size: 256 * 1024,
        ..HeapConfig::for_testing()
    };
    let (heap, roots) = heap_with_roots(config);
    let mut result = Ok(Address::NULL);
    for _ in 0..10_000 {
        result = heap.allocate(&ObjectShape::plain(0, 1000));
        match result {
            Ok(object) => {
                roots.push(object);
            }
            Err(_) => break,
        }
    }
    assert!(matches!(result, Err(GcError::OutOfMemory { .. })));
    assert_eq!(
        heap.stats().last_cycle.unwrap().cause,
        GcCause::OutOfMemory
    );
}

#[test]
fn test_verification_failure_aborts_cycle() {
    let (heap, roots) = heap_with_roots(HeapConfig::for_testing());
    let holder = roots.push(heap.allocate(&ObjectShape::plain(1, 0)).unwrap());
    let bogus = Address::from_usize(0x10);
    unsafe { heap.write_ref(roots.get(holder), 0, bogus) };

    let Err(GcError::Verification(report)) = heap.request_collection(GcCause::Test) else {
        panic!("expected a verification failure");
    };
    assert!(report.failures.iter().any(|failure| matches!(
        failure,
        VerifyFailure::DanglingPointer { target, .. } if *target == bogus
    )));
    assert_eq!(heap.epoch(), 0);
    assert!(!heap.is_poisoned());

    unsafe { heap.write_ref(roots.get(holder), 0, Address::NULL) };
    heap.request_collection(GcCause::Test).unwrap();
    assert_eq!(heap.epoch(), 1);
}

#[test]
fn test_concurrent_requests_collect_once() {
    let heap = Heap::new(HeapConfig::for_testing()).unwrap();
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let heap = Arc::clone(&heap);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let observed = heap.epoch();
                barrier.wait();
                heap.request_collection_since(observed, GcCause::Test)
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }
    assert_eq!(heap.epoch(), 1);
}

#[test]
fn test_handshake_mutators_requesting_together_collect_once() {
    const ROUNDS: u64 = 3;
    let safepoint = Arc::new(HandshakeSafepoint::new());
    let heap = HeapBuilder::new(HeapConfig::for_testing())
        .safepoint(safepoint.clone())
        .build()
        .unwrap();
    let barrier = Arc::new(Barrier::new(2));
    let (sender, receiver) = mpsc::channel();

    for _ in 0..2 {
        let heap = Arc::clone(&heap);
        let safepoint = Arc::clone(&safepoint);
        let barrier = Arc::clone(&barrier);
        let sender = sender.clone();
        thread::spawn(move || {
            let mutator = safepoint.register_mutator();
            for _ in 0..ROUNDS {
                barrier.wait();
                heap.allocate(&ObjectShape::plain(0, 16)).unwrap();
                let observed = heap.epoch();
                barrier.wait();
                let result = heap.request_collection_since(observed, GcCause::Test);
                sender.send(result).unwrap();
            }
            safepoint.unregister_mutator(&mutator);
        });
    }
    drop(sender);

    for _ in 0..2 * ROUNDS {
        receiver
            .recv_timeout(Duration::from_secs(10))
            .expect("requester stuck behind another thread's cycle")
            .unwrap();
    }
    assert_eq!(heap.epoch(), ROUNDS);
    assert!(heap.verify().unwrap().is_ok());
}

/// Provider that tries to re-enter the heap while being scanned.
struct ReentrantRoots {
    heap: OnceLock<Weak<Heap>>,
    results: Mutex<Vec<Result<(), GcError>>>,
}

impl RootProvider for ReentrantRoots {
    fn kind(&self) -> RootKind {
        RootKind::ThreadLocal
    }

    fn visit_roots(&self, _visitor: &mut dyn FnMut(&mut Address)) -> genscavenge::Result<()> {
        if let Some(heap) = self.heap.get().and_then(Weak::upgrade) {
            let collect = heap.request_collection(GcCause::Test);
            let allocate = heap.allocate(&ObjectShape::plain(0, 0)).map(|_| ());
            let mut results = self.results.lock().unwrap();
            results.push(collect);
            results.push(allocate);
        }
        Ok(())
    }
}

#[test]
fn test_reentrant_request_is_rejected() {
    let heap = Heap::new(HeapConfig::for_testing()).unwrap();
    let provider = Arc::new(ReentrantRoots {
        heap: OnceLock::new(),
        results: Mutex::new(Vec::new()),
    });
    provider.heap.set(Arc::downgrade(&heap)).unwrap();
    heap.register_roots(provider.clone());

    heap.request_collection(GcCause::Test).unwrap();
    assert_eq!(heap.epoch(), 1);
    assert!(!heap.is_poisoned());

    let results = std::mem::take(&mut *provider.results.lock().unwrap());
    assert!(!results.is_empty());
    assert!(results
        .iter()
        .all(|result| *result == Err(GcError::CollectionInProgress)));

    heap.request_collection(GcCause::Test).unwrap();
    assert_eq!(heap.epoch(), 2);
}

struct BrokenFrames;

impl RootProvider for BrokenFrames {
    fn kind(&self) -> RootKind {
        RootKind::ThreadStack
    }

    fn visit_roots(&self, _visitor: &mut dyn FnMut(&mut Address)) -> genscavenge::Result<()> {
        Err(GcError::MissingReferenceMap {
            kind: RootKind::ThreadStack,
            detail: "no reference map at pc 0x42".to_string(),
        })
    }
}

#[test]
fn test_missing_reference_map_poisons_heap() {
    let config = HeapConfig {
        verify_before: false,
        verify_after: false,
        ..HeapConfig::for_testing()
    };
    let heap = Heap::new(config).unwrap();
    heap.allocate(&ObjectShape::plain(0, 8)).unwrap();
    heap.register_roots(Arc::new(BrokenFrames));

    let result = heap.request_collection(GcCause::Test);
    assert!(matches!(
        result,
        Err(GcError::MissingReferenceMap {
            kind: RootKind::ThreadStack,
            ..
        })
    ));
    assert!(heap.is_poisoned());
    assert_eq!(heap.epoch(), 0);
    assert_eq!(
        heap.allocate(&ObjectShape::plain(0, 8)),
        Err(GcError::Poisoned)
    );
    assert_eq!(
        heap.request_collection(GcCause::Test),
        Err(GcError::Poisoned)
    );
}
