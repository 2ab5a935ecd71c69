//! Scavenger: one stop-the-world copying pass over the heap.
//!
//! ## Algorithm
//!
//! 1. Chunks holding pinned objects move, as a whole, to the old to-space.
//! 2. Roots (providers, pins, pending references) are evacuated; an
//!    incremental pass also rescans the slots under dirty cards of the old
//!    generation.
//! 3. Cheney scan: every to-space keeps a frontier (aligned chunk plus scan
//!    pointer, and the last scanned unaligned chunk). Frontiers are advanced
//!    in turn until none of them moves; the copies themselves are the work
//!    list.
//! 4. Discovered references are decided.
//! 5. Evacuated from-spaces are released and to-spaces become from-spaces.
//!
//! Evacuated spaces are eden and the survivor from-spaces, plus the old
//! from-space in a complete pass. Eden survivors go to survivor-to 0,
//! survivor-from `i` survivors to survivor-to `i + 1`, and objects past the
//! last survivor space (or everything, in a complete pass) to old-to.
//! Objects in unaligned chunks never move: their chunk is relinked.

use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::accounting::Accounting;
use crate::address::Address;
use crate::chunk::{self, ChunkRef};
use crate::chunk_allocator::ChunkAllocator;
use crate::error::{GcError, Result};
use crate::generation::Generations;
use crate::object::{HeaderState, Object, QUEUE_OFFSET};
use crate::reference::{ReferenceProcessor, ReferentStatus};
use crate::remembered_set;
use crate::roots::RootProvider;
use crate::space::SpaceId;
use crate::timers::{CyclePhase, CycleTimers};
use crate::verify::{VerifyFailure, VerifyReport};

/// Roots of one pass.
pub(crate) struct ScavengeRoots<'r> {
    pub providers: &'r [Arc<dyn RootProvider>],
    pub pinned: &'r [Address],
    pub pending: &'r mut Vec<Address>,
}

/// What one pass did beyond the accounting record.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ScavengeOutcome {
    pub discovered_references: usize,
    pub cleared_references: usize,
    pub pinned_chunks: usize,
}

/// Scan position in one to-space.
#[derive(Debug)]
struct ScanFrontier {
    space: SpaceId,
    aligned: Option<(ChunkRef, Address)>,
    unaligned: Option<ChunkRef>,
}

impl ScanFrontier {
    fn new(space: SpaceId) -> Self {
        Self {
            space,
            aligned: None,
            unaligned: None,
        }
    }
}

/// Whether objects of `space` are moved by a pass.
fn is_evacuated(space: SpaceId, complete: bool) -> bool {
    match space {
        SpaceId::Eden | SpaceId::SurvivorFrom(_) => true,
        SpaceId::OldFrom => complete,
        SpaceId::SurvivorTo(_) | SpaceId::OldTo => false,
    }
}

/// Error for an object that cannot be interpreted.
fn corrupt_object(object: Object) -> GcError {
    GcError::Verification(VerifyReport {
        failures: vec![VerifyFailure::InFlightHeader {
            object: object.address(),
            header: object.header_word(),
        }],
        chunks: 0,
        objects: 1,
    })
}

/// One copying pass.
pub(crate) struct Scavenger<'a> {
    generations: &'a mut Generations,
    allocator: &'a ChunkAllocator,
    accounting: &'a mut Accounting,
    references: &'a mut ReferenceProcessor,
    chunk_size: usize,
    complete: bool,
    survivor_count: usize,
    frontiers: Vec<ScanFrontier>,
    outcome: ScavengeOutcome,
}

impl<'a> Scavenger<'a> {
    pub fn new(
        generations: &'a mut Generations,
        allocator: &'a ChunkAllocator,
        accounting: &'a mut Accounting,
        references: &'a mut ReferenceProcessor,
        complete: bool,
    ) -> Self {
        let survivor_count = generations.young.survivor_count();
        let mut frontiers: Vec<ScanFrontier> = (0..survivor_count)
            .map(|age| ScanFrontier::new(SpaceId::SurvivorTo(age as u8)))
            .collect();
        frontiers.push(ScanFrontier::new(SpaceId::OldTo));
        Self {
            chunk_size: allocator.aligned_layout().chunk_size,
            generations,
            allocator,
            accounting,
            references,
            complete,
            survivor_count,
            frontiers,
            outcome: ScavengeOutcome::default(),
        }
    }

    /// Run the pass. An error leaves the heap half-moved.
    pub fn run(
        mut self,
        roots: ScavengeRoots<'_>,
        phase: &AtomicU8,
        timers: &mut CycleTimers,
    ) -> Result<ScavengeOutcome> {
        phase.store(CyclePhase::RootScanning as u8, Ordering::Release);
        timers.root_scan.start();
        self.promote_pinned_chunks(roots.pinned);
        self.scan_roots(roots.providers, roots.pinned, roots.pending)?;
        if !self.complete {
            self.scan_dirty_cards()?;
        }
        timers.root_scan.stop();

        phase.store(CyclePhase::Copying as u8, Ordering::Release);
        timers.copy.start();
        self.drain()?;
        timers.copy.stop();

        phase.store(CyclePhase::ReferenceProcessing as u8, Ordering::Release);
        timers.references.start();
        let enqueued = self.process_references();
        roots.pending.extend(enqueued);
        timers.references.stop();

        phase.store(CyclePhase::SpaceSwap as u8, Ordering::Release);
        timers.release.start();
        self.release_from_spaces();
        timers.release.stop();

        Ok(self.outcome)
    }

    fn destination(&self, space: SpaceId) -> SpaceId {
        if self.complete {
            return SpaceId::OldTo;
        }
        let next_age = match space {
            SpaceId::Eden => 0,
            SpaceId::SurvivorFrom(age) => age as usize + 1,
            _ => return SpaceId::OldTo,
        };
        if next_age < self.survivor_count {
            SpaceId::SurvivorTo(next_age as u8)
        } else {
            SpaceId::OldTo
        }
    }

    fn record_move(&mut self, from: SpaceId, to: SpaceId, bytes: usize) {
        if from.is_young() && !to.is_young() {
            self.accounting.record_promoted(bytes);
        } else {
            self.accounting.record_copied(bytes);
        }
    }

    fn chunk_of(&self, object: Object) -> ChunkRef {
        // SAFETY: only objects with a normal header in a chunk of this heap
        // are looked up
        unsafe { chunk::enclosing_chunk(object, self.chunk_size) }
    }

    fn is_young(&self, address: Address) -> bool {
        // SAFETY: `address` is a live object that was just evacuated or kept
        let object = unsafe { Object::new(address) };
        self.chunk_of(object)
            .space()
            .is_some_and(SpaceId::is_young)
    }

    fn promote_pinned_chunks(&mut self, pinned: &[Address]) {
        for address in pinned {
            // SAFETY: pinned objects are live and do not move
            let object = unsafe { Object::new(*address) };
            let chunk = self.chunk_of(object);
            let Some(space) = chunk.space() else {
                continue;
            };
            if !is_evacuated(space, self.complete) {
                continue;
            }
            self.generations.space_mut(space).extract_chunk(chunk);
            remembered_set::clean_cards_of_chunk(chunk);
            self.generations.old.to.append_chunk(chunk);
            self.record_move(space, SpaceId::OldTo, chunk.used_bytes());
            self.outcome.pinned_chunks += 1;

            #[cfg(feature = "gc_logging")]
            tracing::debug!(
                target: "genscavenge::gc",
                object = %address,
                chunk = %chunk.base(),
                from = %space,
                "Promoted pinned chunk"
            );
        }
    }

    fn scan_roots(
        &mut self,
        providers: &[Arc<dyn RootProvider>],
        pinned: &[Address],
        pending: &mut [Address],
    ) -> Result<()> {
        for provider in providers {
            let mut failure = None;
            provider.visit_roots(&mut |slot: &mut Address| {
                if failure.is_some() || slot.is_null() {
                    return;
                }
                match self.evacuate(*slot) {
                    Ok(target) => *slot = target,
                    Err(error) => failure = Some(error),
                }
            })?;
            if let Some(error) = failure {
                return Err(error);
            }
        }
        for address in pinned {
            self.evacuate(*address)?;
        }
        for slot in pending.iter_mut() {
            *slot = self.evacuate(*slot)?;
        }
        Ok(())
    }

    /// Rescan the slots under dirty cards of the old from-space.
    fn scan_dirty_cards(&mut self) -> Result<()> {
        let chunks: Vec<ChunkRef> = self.generations.old.from.chunks().collect();
        for chunk in chunks {
            let mut result = Ok(());
            remembered_set::walk_dirty_cards(chunk, |object, slot| {
                if result.is_err() {
                    return;
                }
                result = if object.kind().is_reference() && slot == object.referent_slot() {
                    self.scan_referent(object, chunk, true)
                } else {
                    self.scan_slot(slot, chunk, true)
                };
            });
            result?;
        }
        Ok(())
    }

    /// Move `address` out of an evacuated space if needed and return its
    /// current address.
    fn evacuate(&mut self, address: Address) -> Result<Address> {
        // SAFETY: slots and roots only hold object starts
        let object = unsafe { Object::new(address) };
        let unaligned = match object.header() {
            HeaderState::Forwarded(target) => return Ok(target),
            HeaderState::Zapped(_) => return Err(corrupt_object(object)),
            HeaderState::Normal { unaligned, .. } => unaligned,
        };
        let chunk = self.chunk_of(object);
        let Some(space) = chunk.space() else {
            return Err(corrupt_object(object));
        };
        if !is_evacuated(space, self.complete) {
            return Ok(address);
        }
        let destination = self.destination(space);
        let size = object.size();

        if unaligned {
            self.generations.space_mut(space).extract_chunk(chunk);
            remembered_set::clean_cards_of_chunk(chunk);
            self.generations.space_mut(destination).append_chunk(chunk);
            self.record_move(space, destination, size);
            return Ok(address);
        }

        let target = self.allocate_in(destination, size)?;
        // SAFETY: source and target are distinct objects of `size` bytes
        unsafe { ptr::copy_nonoverlapping(address.as_ptr::<u8>(), target.as_ptr::<u8>(), size) };
        // SAFETY: the copy is a complete object
        let copy = unsafe { Object::new(target) };
        if copy.kind().is_reference() {
            copy.set_next_discovered(Address::NULL);
        }
        object.forward_to(target);
        self.record_move(space, destination, size);
        Ok(target)
    }

    fn allocate_in(&mut self, space: SpaceId, size: usize) -> Result<Address> {
        if let Some(address) = self.generations.space_mut(space).allocate(size) {
            return Ok(address);
        }
        let chunk = self.allocator.produce_aligned_chunk()?;
        self.generations.space_mut(space).append_chunk(chunk);
        chunk
            .allocate(size)
            .ok_or(GcError::OutOfMemory { requested: size })
    }

    fn scan_slot(&mut self, slot: Address, holder: ChunkRef, holder_is_old: bool) -> Result<()> {
        // SAFETY: `slot` is a reference slot of a live object
        let target = unsafe { slot.load_ref() };
        if target.is_null() {
            return Ok(());
        }
        let moved = self.evacuate(target)?;
        if moved != target {
            // SAFETY: as above
            unsafe { slot.store_ref(moved) };
        }
        if holder_is_old {
            remembered_set::dirty_card_if_necessary(holder, slot, self.is_young(moved));
        }
        Ok(())
    }

    fn scan_referent(&mut self, reference: Object, holder: ChunkRef, holder_is_old: bool) -> Result<()> {
        let slot = reference.referent_slot();
        let referent = reference.referent();
        if referent.is_null() {
            return Ok(());
        }
        // SAFETY: a non-null referent is an object start
        let object = unsafe { Object::new(referent) };
        match object.header() {
            HeaderState::Forwarded(target) => {
                // SAFETY: the referent slot is part of the reference object
                unsafe { slot.store_ref(target) };
                if holder_is_old {
                    remembered_set::dirty_card_if_necessary(holder, slot, self.is_young(target));
                }
                return Ok(());
            }
            HeaderState::Zapped(_) => return Err(corrupt_object(object)),
            HeaderState::Normal { .. } => {}
        }
        let evacuated = self
            .chunk_of(object)
            .space()
            .is_some_and(|space| is_evacuated(space, self.complete));
        if !evacuated {
            if holder_is_old {
                remembered_set::dirty_card_if_necessary(holder, slot, self.is_young(referent));
            }
            return Ok(());
        }
        if self.references.retains_strongly(reference) {
            return self.scan_slot(slot, holder, holder_is_old);
        }
        if self.references.discover(reference) {
            self.outcome.discovered_references += 1;
        }
        Ok(())
    }

    fn scan_object(&mut self, object: Object) -> Result<()> {
        let holder = self.chunk_of(object);
        let holder_is_old = holder.space().is_some_and(|space| !space.is_young());
        if object.kind().is_reference() {
            self.scan_slot(object.address().add(QUEUE_OFFSET), holder, holder_is_old)?;
            self.scan_referent(object, holder, holder_is_old)?;
        }
        for index in 0..object.slot_count() {
            self.scan_slot(object.slot_address(index), holder, holder_is_old)?;
        }
        Ok(())
    }

    /// Advance every frontier until none moves.
    fn drain(&mut self) -> Result<()> {
        loop {
            let mut progress = false;
            for index in 0..self.frontiers.len() {
                progress |= self.scan_frontier(index)?;
            }
            if !progress {
                return Ok(());
            }
        }
    }

    fn scan_frontier(&mut self, index: usize) -> Result<bool> {
        let space = self.frontiers[index].space;
        let mut progress = false;

        let start = self.frontiers[index].aligned.or_else(|| {
            self.generations
                .space(space)
                .aligned_chunks()
                .first()
                .map(|chunk| (chunk, chunk.objects_start()))
        });
        if let Some((mut chunk, mut cursor)) = start {
            loop {
                while cursor < chunk.top() {
                    // SAFETY: everything below top in a to-space is an object
                    let object = unsafe { Object::new(cursor) };
                    self.scan_object(object)?;
                    cursor = cursor.add(object.size());
                    progress = true;
                }
                match chunk.next() {
                    Some(next) => {
                        chunk = next;
                        cursor = next.objects_start();
                    }
                    None => break,
                }
            }
            self.frontiers[index].aligned = Some((chunk, cursor));
        }

        loop {
            let next = match self.frontiers[index].unaligned {
                Some(scanned) => scanned.next(),
                None => self.generations.space(space).unaligned_chunks().first(),
            };
            let Some(chunk) = next else {
                break;
            };
            for object in chunk.objects() {
                self.scan_object(object)?;
            }
            self.frontiers[index].unaligned = Some(chunk);
            progress = true;
        }

        Ok(progress)
    }

    /// Decide discovered references and return the ones to enqueue.
    fn process_references(&mut self) -> Vec<Address> {
        let chunk_size = self.chunk_size;
        let complete = self.complete;
        let outcome = self.references.process(|referent| {
            // SAFETY: referents that were not cleared are object starts
            let object = unsafe { Object::new(referent) };
            match object.header() {
                HeaderState::Forwarded(target) => ReferentStatus::Moved(target),
                HeaderState::Zapped(_) => ReferentStatus::Unreachable,
                HeaderState::Normal { .. } => {
                    // SAFETY: normal header, object inside a heap chunk
                    let chunk = unsafe { chunk::enclosing_chunk(object, chunk_size) };
                    match chunk.space() {
                        Some(space) if is_evacuated(space, complete) => ReferentStatus::Unreachable,
                        _ => ReferentStatus::Retained,
                    }
                }
            }
        });

        for reference in &outcome.retained {
            let holder = self.chunk_of(*reference);
            if holder.space().is_some_and(|space| !space.is_young()) {
                let referent = reference.referent();
                remembered_set::dirty_card_if_necessary(
                    holder,
                    reference.referent_slot(),
                    self.is_young(referent),
                );
            }
        }
        self.outcome.cleared_references = outcome.cleared;

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "genscavenge::gc",
            discovered = self.outcome.discovered_references,
            retained = outcome.retained.len(),
            cleared = outcome.cleared,
            enqueued = outcome.enqueued.len(),
            "Processed references"
        );

        outcome.enqueued
    }

    /// Release evacuated from-spaces and turn to-spaces into from-spaces.
    fn release_from_spaces(&mut self) {
        let mut released = vec![SpaceId::Eden];
        released.extend((0..self.survivor_count).map(|age| SpaceId::SurvivorFrom(age as u8)));
        if self.complete {
            released.push(SpaceId::OldFrom);
        }
        for space in released {
            for chunk in self.generations.space_mut(space).take_chunks() {
                self.allocator.consume_chunk(chunk);
            }
        }
        self.generations.absorb_to_spaces();
    }
}
