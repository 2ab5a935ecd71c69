//! The heap: mutator allocation, field access and collection requests.
//!
//! A [`Heap`] is shared between threads through an `Arc`. Eden bump
//! allocation and chunk linking happen under the heap state lock; a
//! collection holds the same lock for the whole cycle once the safepoint has
//! paused every other mutator. Requests are serialized by a second lock and
//! deduplicated by the epoch counter.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::FxHashMap;

use crate::accounting::Accounting;
use crate::address::Address;
use crate::chunk::{self, UnalignedLayout};
use crate::chunk_allocator::{ChunkAllocator, MemorySource, SystemMemory};
use crate::clock::{Clock, MonotonicClock};
use crate::collector::{ScavengeOutcome, ScavengeRoots, Scavenger};
use crate::config::HeapConfig;
use crate::error::{GcError, Result};
use crate::generation::Generations;
use crate::object::{Object, ObjectKind, ObjectShape, QUEUE_OFFSET};
use crate::policy::PolicyInputs;
use crate::reference::{ReferenceProcessor, soft_retention_threshold};
use crate::roots::{RootProvider, RootsId};
use crate::safepoint::{NoSafepoint, Safepoint};
use crate::space::Space;
use crate::stats::{CollectionKind, CycleSummary, GcCause, HeapStats};
use crate::timers::{CyclePhase, CycleTimers};
use crate::verify::{self, VerifyReport};

const NO_OWNER: u64 = 0;

/// How long a waiting requester blocks on the collection lock between
/// safepoint polls.
const COLLECTION_LOCK_POLL: Duration = Duration::from_micros(100);

static NEXT_THREAD_TOKEN: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static THREAD_TOKEN: u64 = NEXT_THREAD_TOKEN.fetch_add(1, Ordering::Relaxed);
}

fn current_thread_token() -> u64 {
    THREAD_TOKEN.with(|token| *token)
}

/// Handle of a pinned object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinId(u64);

/// What a cycle was asked to do.
#[derive(Debug, Clone, Copy)]
struct CycleRequest {
    cause: GcCause,
    force_complete: bool,
    soft_as_weak: bool,
}

impl CycleRequest {
    fn normal(cause: GcCause) -> Self {
        Self {
            cause,
            force_complete: false,
            soft_as_weak: false,
        }
    }

    fn complete(cause: GcCause) -> Self {
        Self {
            cause,
            force_complete: true,
            soft_as_weak: false,
        }
    }

    fn out_of_memory() -> Self {
        Self {
            cause: GcCause::OutOfMemory,
            force_complete: true,
            soft_as_weak: true,
        }
    }
}

/// Why an allocation attempt did not produce memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AllocationFailure {
    EdenFull,
    OutOfMemory,
}

/// Everything guarded by the heap state lock.
struct HeapState {
    generations: Generations,
    accounting: Accounting,
    references: ReferenceProcessor,
    /// Cleared references with a queue, kept alive until taken
    pending: Vec<Address>,
    pins: FxHashMap<PinId, Address>,
    next_pin: u64,
    last_cycle: Option<CycleSummary>,
}

/// Builder for [`Heap`].
pub struct HeapBuilder {
    config: HeapConfig,
    memory: Arc<dyn MemorySource>,
    safepoint: Arc<dyn Safepoint>,
    clock: Arc<dyn Clock>,
}

impl HeapBuilder {
    /// Builder with the system allocator, no safepoint and a monotonic clock.
    pub fn new(config: HeapConfig) -> Self {
        Self {
            config,
            memory: Arc::new(SystemMemory),
            safepoint: Arc::new(NoSafepoint),
            clock: Arc::new(MonotonicClock::new()),
        }
    }

    /// Source of chunk memory.
    pub fn memory_source(mut self, memory: Arc<dyn MemorySource>) -> Self {
        self.memory = memory;
        self
    }

    /// Pause mechanism.
    pub fn safepoint(mut self, safepoint: Arc<dyn Safepoint>) -> Self {
        self.safepoint = safepoint;
        self
    }

    /// Clock for soft reference ages.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and create the heap.
    pub fn build(self) -> Result<Arc<Heap>> {
        self.config.validate()?;
        let allocator = ChunkAllocator::new(&self.config, self.memory);
        let state = HeapState {
            generations: Generations::new(self.config.max_survivor_spaces),
            accounting: Accounting::default(),
            references: ReferenceProcessor::new(),
            pending: Vec::new(),
            pins: FxHashMap::default(),
            next_pin: 0,
            last_cycle: None,
        };

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "genscavenge::gc",
            chunk_size = self.config.aligned_chunk_size,
            young_size = self.config.young_size,
            max_heap_size = self.config.max_heap_size,
            survivor_spaces = self.config.max_survivor_spaces,
            policy = self.config.policy.name(),
            "Heap created"
        );

        Ok(Arc::new(Heap {
            allocator,
            state: Mutex::new(state),
            collection_lock: Mutex::new(()),
            roots: RwLock::new(Vec::new()),
            next_roots_id: AtomicU64::new(0),
            safepoint: self.safepoint,
            clock: self.clock,
            epoch: AtomicU64::new(0),
            cycle_owner: AtomicU64::new(NO_OWNER),
            phase: AtomicU8::new(CyclePhase::Idle as u8),
            poisoned: AtomicBool::new(false),
            config: self.config,
        }))
    }
}

/// Generational scavenging heap.
pub struct Heap {
    config: HeapConfig,
    allocator: ChunkAllocator,
    state: Mutex<HeapState>,
    /// Serializes collection requests
    collection_lock: Mutex<()>,
    roots: RwLock<Vec<(RootsId, Arc<dyn RootProvider>)>>,
    next_roots_id: AtomicU64,
    safepoint: Arc<dyn Safepoint>,
    clock: Arc<dyn Clock>,
    /// Completed cycles
    epoch: AtomicU64,
    /// Token of the thread running a cycle
    cycle_owner: AtomicU64,
    phase: AtomicU8,
    poisoned: AtomicBool,
}

impl Heap {
    /// Heap with default collaborators.
    pub fn new(config: HeapConfig) -> Result<Arc<Self>> {
        HeapBuilder::new(config).build()
    }

    /// Builder for a heap with custom collaborators.
    pub fn builder(config: HeapConfig) -> HeapBuilder {
        HeapBuilder::new(config)
    }

    /// Configuration the heap was built with.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Number of completed cycles.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Current cycle phase.
    pub fn phase(&self) -> CyclePhase {
        CyclePhase::from(self.phase.load(Ordering::Acquire))
    }

    /// Whether a failed cycle left the heap unusable.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    /// Whether the calling thread is the one running the current cycle. That
    /// is always a caller bug, typically a root provider calling back into
    /// the heap, so it is reported at error level.
    fn in_own_cycle(&self) -> bool {
        let reentered = self.cycle_owner.load(Ordering::Acquire) == current_thread_token();
        #[cfg(feature = "gc_logging")]
        if reentered {
            tracing::error!(
                target: "genscavenge::gc",
                phase = ?self.phase(),
                "Heap re-entered from its own collection cycle"
            );
        }
        reentered
    }

    fn check_usable(&self) -> Result<()> {
        if self.in_own_cycle() {
            return Err(GcError::CollectionInProgress);
        }
        if self.is_poisoned() {
            return Err(GcError::Poisoned);
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    /// Allocate a zeroed object of the given shape.
    ///
    /// May run an eden-full collection, and an out-of-memory collection when
    /// no chunk can be obtained. Any address held outside registered roots is
    /// stale after this call.
    pub fn allocate(&self, shape: &ObjectShape) -> Result<Address> {
        self.check_usable()?;
        let Some(size) = self.allocation_size(shape) else {
            #[cfg(feature = "gc_logging")]
            tracing::warn!(
                target: "genscavenge::gc",
                ref_slots = shape.ref_slots,
                payload_bytes = shape.payload_bytes,
                "Object shape exceeds the address space"
            );
            return Err(GcError::OutOfMemory {
                requested: shape.size(),
            });
        };
        let mut may_collect = true;
        let mut retried = false;
        loop {
            let observed = self.epoch();
            match self.try_allocate(shape, size, may_collect) {
                Ok(address) => return Ok(address),
                Err(AllocationFailure::EdenFull) => {
                    may_collect = false;
                    self.collect(observed, CycleRequest::normal(GcCause::EdenFull))?;
                }
                Err(AllocationFailure::OutOfMemory) if !retried => {
                    retried = true;
                    match self.collect(observed, CycleRequest::out_of_memory()) {
                        Err(GcError::OutOfMemory { .. }) => {
                            return Err(GcError::OutOfMemory { requested: size });
                        }
                        other => other?,
                    }
                }
                Err(AllocationFailure::OutOfMemory) => {
                    #[cfg(feature = "gc_logging")]
                    tracing::warn!(
                        target: "genscavenge::gc",
                        requested = size,
                        "Allocation failed after out-of-memory collection"
                    );
                    return Err(GcError::OutOfMemory { requested: size });
                }
            }
        }
    }

    /// Object size, or `None` when neither the object nor its chunk can be
    /// represented.
    fn allocation_size(&self, shape: &ObjectShape) -> Option<usize> {
        let size = shape.checked_size()?;
        if size >= self.config.large_object_threshold {
            UnalignedLayout::new(size)?;
        }
        Some(size)
    }

    fn eden_is_full(&self, eden: &Space, needed: usize, may_collect: bool) -> bool {
        may_collect
            && self.config.policy.collects_on_allocation()
            && !eden.is_empty()
            && eden.chunk_bytes().saturating_add(needed) > self.config.young_size
    }

    fn try_allocate(
        &self,
        shape: &ObjectShape,
        size: usize,
        may_collect: bool,
    ) -> std::result::Result<Address, AllocationFailure> {
        let mut state = self.state.lock();

        let (address, unaligned) = if size >= self.config.large_object_threshold {
            let needed = UnalignedLayout::new(size)
                .ok_or(AllocationFailure::OutOfMemory)?
                .chunk_size;
            if self.eden_is_full(&state.generations.young.eden, needed, may_collect) {
                return Err(AllocationFailure::EdenFull);
            }
            if state.generations.chunk_bytes().saturating_add(needed) > self.config.max_heap_size {
                return Err(AllocationFailure::OutOfMemory);
            }
            let chunk = self
                .allocator
                .produce_unaligned_chunk(size)
                .map_err(|_| AllocationFailure::OutOfMemory)?;
            state.generations.young.eden.append_chunk(chunk);
            let address = chunk.allocate(size).ok_or(AllocationFailure::OutOfMemory)?;
            (address, true)
        } else {
            match state.generations.young.eden.allocate(size) {
                Some(address) => (address, false),
                None => {
                    let needed = self.config.aligned_chunk_size;
                    if self.eden_is_full(&state.generations.young.eden, needed, may_collect) {
                        return Err(AllocationFailure::EdenFull);
                    }
                    if state.generations.chunk_bytes().saturating_add(needed)
                        > self.config.max_heap_size
                    {
                        return Err(AllocationFailure::OutOfMemory);
                    }
                    let chunk = self
                        .allocator
                        .produce_aligned_chunk()
                        .map_err(|_| AllocationFailure::OutOfMemory)?;
                    state.generations.young.eden.append_chunk(chunk);
                    let address = chunk.allocate(size).ok_or(AllocationFailure::OutOfMemory)?;
                    (address, false)
                }
            }
        };

        // SAFETY: freshly allocated memory of `size` bytes inside a chunk
        let object = unsafe { Object::initialize(address, shape, unaligned) };
        if shape.kind == ObjectKind::SoftReference {
            object.set_timestamp(self.clock.now_nanos());
        }
        Ok(address)
    }

    // ---------------------------------------------------------------------
    // Field access
    // ---------------------------------------------------------------------

    /// Read reference slot `index` of `object`.
    ///
    /// # Safety
    /// `object` must be a live object of this heap with more than `index`
    /// slots, and no cycle may run concurrently.
    pub unsafe fn read_ref(&self, object: Address, index: usize) -> Address {
        // SAFETY: guaranteed by the caller
        unsafe { Object::new(object).slot_address(index).load_ref() }
    }

    /// Store `value` into reference slot `index` of `object` and dirty the
    /// slot's card.
    ///
    /// # Safety
    /// As for [`read_ref`](Self::read_ref); `value` must be null or a live
    /// object of this heap.
    pub unsafe fn write_ref(&self, object: Address, index: usize, value: Address) {
        // SAFETY: guaranteed by the caller
        let holder = unsafe { Object::new(object) };
        let slot = holder.slot_address(index);
        // SAFETY: as above
        unsafe {
            slot.store_ref(value);
            self.dirty_card_for(object, slot);
        }
    }

    /// Set the referent of a weak or soft reference.
    ///
    /// # Safety
    /// `reference` must be a live reference object of this heap and
    /// `referent` null or a live object of this heap.
    pub unsafe fn write_referent(&self, reference: Address, referent: Address) {
        // SAFETY: guaranteed by the caller
        let object = unsafe { Object::new(reference) };
        debug_assert!(object.kind().is_reference());
        let slot = object.referent_slot();
        // SAFETY: as above
        unsafe {
            slot.store_ref(referent);
            self.dirty_card_for(reference, slot);
        }
    }

    /// Set the notification queue of a weak or soft reference.
    ///
    /// # Safety
    /// As for [`write_referent`](Self::write_referent).
    pub unsafe fn write_queue(&self, reference: Address, queue: Address) {
        let slot = reference.add(QUEUE_OFFSET);
        // SAFETY: guaranteed by the caller
        unsafe {
            slot.store_ref(queue);
            self.dirty_card_for(reference, slot);
        }
    }

    /// Current referent of a weak or soft reference. Reading a soft
    /// reference refreshes its access timestamp.
    ///
    /// # Safety
    /// `reference` must be a live reference object of this heap.
    pub unsafe fn reference_get(&self, reference: Address) -> Address {
        // SAFETY: guaranteed by the caller
        let object = unsafe { Object::new(reference) };
        if object.kind() == ObjectKind::SoftReference {
            object.set_timestamp(self.clock.now_nanos());
        }
        // SAFETY: the referent slot is a word-aligned word of the object
        Address::from_usize(unsafe { object.referent_slot().as_atomic_word() }.load(Ordering::Acquire))
    }

    /// Copy payload bytes of `object` starting at `offset` into `buf`.
    ///
    /// # Safety
    /// `object` must be a live object of this heap.
    pub unsafe fn read_payload(&self, object: Address, offset: usize, buf: &mut [u8]) {
        // SAFETY: guaranteed by the caller
        let object = unsafe { Object::new(object) };
        assert!(offset + buf.len() <= object.payload_len(), "payload read out of bounds");
        // SAFETY: bounds checked above
        unsafe {
            std::ptr::copy_nonoverlapping(
                object.payload_address().add(offset).as_ptr::<u8>(),
                buf.as_mut_ptr(),
                buf.len(),
            )
        };
    }

    /// Copy `bytes` into the payload of `object` starting at `offset`.
    ///
    /// # Safety
    /// `object` must be a live object of this heap.
    pub unsafe fn write_payload(&self, object: Address, offset: usize, bytes: &[u8]) {
        // SAFETY: guaranteed by the caller
        let object = unsafe { Object::new(object) };
        assert!(offset + bytes.len() <= object.payload_len(), "payload write out of bounds");
        // SAFETY: bounds checked above
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                object.payload_address().add(offset).as_ptr::<u8>(),
                bytes.len(),
            )
        };
    }

    /// Dirty the card covering `slot`, a field of `holder`. This is what a
    /// write barrier calls after a reference store.
    ///
    /// # Safety
    /// `holder` must be a live object of this heap containing `slot`.
    pub unsafe fn dirty_card_for(&self, holder: Address, slot: Address) {
        // SAFETY: guaranteed by the caller
        let chunk = unsafe { chunk::enclosing_chunk(Object::new(holder), self.config.aligned_chunk_size) };
        crate::remembered_set::dirty_card_for(chunk, slot);
    }

    // ---------------------------------------------------------------------
    // Pins, pending references, roots
    // ---------------------------------------------------------------------

    /// Keep `object` at its address until unpinned.
    pub fn pin(&self, object: Address) -> Result<PinId> {
        self.check_usable()?;
        let mut state = self.state.lock();
        let id = PinId(state.next_pin);
        state.next_pin += 1;
        state.pins.insert(id, object);
        Ok(id)
    }

    /// Release a pin. Returns false for an unknown id.
    pub fn unpin(&self, id: PinId) -> bool {
        if self.in_own_cycle() {
            return false;
        }
        self.state.lock().pins.remove(&id).is_some()
    }

    /// Take the references whose referents were cleared and that carry a
    /// queue.
    pub fn take_pending_references(&self) -> Vec<Address> {
        if self.in_own_cycle() {
            return Vec::new();
        }
        std::mem::take(&mut self.state.lock().pending)
    }

    /// Add a root provider.
    pub fn register_roots(&self, provider: Arc<dyn RootProvider>) -> RootsId {
        let id = RootsId(self.next_roots_id.fetch_add(1, Ordering::Relaxed));
        self.roots.write().push((id, provider));
        id
    }

    /// Remove a root provider. Returns false for an unknown id.
    pub fn unregister_roots(&self, id: RootsId) -> bool {
        let mut roots = self.roots.write();
        let before = roots.len();
        roots.retain(|(registered, _)| *registered != id);
        roots.len() != before
    }

    fn providers(&self) -> Vec<Arc<dyn RootProvider>> {
        self.roots
            .read()
            .iter()
            .map(|(_, provider)| Arc::clone(provider))
            .collect()
    }

    // ---------------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------------

    /// Run a cycle as the policy decides.
    pub fn request_collection(&self, cause: GcCause) -> Result<()> {
        self.collect(self.epoch(), CycleRequest::normal(cause))
    }

    /// Run a cycle unless one completed after `observed_epoch`.
    pub fn request_collection_since(&self, observed_epoch: u64, cause: GcCause) -> Result<()> {
        self.collect(observed_epoch, CycleRequest::normal(cause))
    }

    /// Run a cycle that includes a complete collection.
    pub fn request_complete_collection(&self, cause: GcCause) -> Result<()> {
        self.collect(self.epoch(), CycleRequest::complete(cause))
    }

    fn collect(&self, observed_epoch: u64, request: CycleRequest) -> Result<()> {
        self.check_usable()?;
        let _serialized = self.lock_collection();
        if self.epoch() != observed_epoch {
            return Ok(());
        }
        if self.is_poisoned() {
            return Err(GcError::Poisoned);
        }

        self.safepoint.request_pause();
        self.cycle_owner.store(current_thread_token(), Ordering::Release);
        let result = {
            let mut state = self.state.lock();
            self.collect_paused(&mut state, request)
        };
        self.cycle_owner.store(NO_OWNER, Ordering::Release);
        self.phase.store(CyclePhase::Idle as u8, Ordering::Release);
        self.safepoint.resume_all();
        result
    }

    /// Serialize cycle requests. A requester that loses the race keeps polling
    /// the safepoint so the winner's pause request can park it.
    fn lock_collection(&self) -> MutexGuard<'_, ()> {
        loop {
            if let Some(guard) = self.collection_lock.try_lock_for(COLLECTION_LOCK_POLL) {
                return guard;
            }
            self.safepoint.poll();
        }
    }

    fn collect_paused(&self, state: &mut HeapState, request: CycleRequest) -> Result<()> {
        let max_heap_size = self.config.max_heap_size;
        if !request.soft_as_weak {
            self.run_cycle(state, request)?;
            let used = state.generations.chunk_bytes();
            if used <= max_heap_size {
                return Ok(());
            }

            #[cfg(feature = "gc_logging")]
            tracing::warn!(
                target: "genscavenge::gc",
                used,
                max_heap_size,
                "Heap over budget after collection, forcing complete collection"
            );
        }

        self.run_cycle(state, CycleRequest::out_of_memory())?;
        let used = state.generations.chunk_bytes();
        if used > max_heap_size {
            return Err(GcError::OutOfMemory {
                requested: used - max_heap_size,
            });
        }
        Ok(())
    }

    /// One cycle: policy decision, verification, incremental and complete
    /// scavenges. Returns false when the policy declined.
    fn run_cycle(&self, state: &mut HeapState, request: CycleRequest) -> Result<bool> {
        let inputs = PolicyInputs::from_config(&self.config, request.force_complete);
        let decision = self.config.policy.decide(&state.accounting, &inputs);
        let Some(kind) = CollectionKind::from_decision(decision.incremental, decision.complete)
        else {
            #[cfg(feature = "gc_logging")]
            tracing::debug!(
                target: "genscavenge::gc",
                cause = %request.cause,
                policy = self.config.policy.name(),
                "Policy declined collection"
            );
            return Ok(false);
        };

        self.phase.store(CyclePhase::Paused as u8, Ordering::Release);
        let mut timers = CycleTimers::default();
        timers.cycle.start();
        let used_before = state.generations.chunk_bytes();

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "genscavenge::gc",
            epoch = self.epoch() + 1,
            cause = %request.cause,
            ?kind,
            soft_as_weak = request.soft_as_weak,
            used_before,
            "GC cycle start"
        );

        if self.config.verify_before {
            timers.verify_before.start();
            self.verify_locked(state)?;
            timers.verify_before.stop();
        }

        let now = self.clock.now_nanos();
        let mut promoted_bytes = 0;
        let mut copied_bytes = 0;
        let mut cleared_references = 0;
        for complete in [false, true] {
            if (complete && !decision.complete) || (!complete && !decision.incremental) {
                continue;
            }
            let outcome = self.scavenge(state, complete, now, request.soft_as_weak, &mut timers)?;
            promoted_bytes += state.accounting.last_promoted_bytes;
            copied_bytes += state.accounting.last_copied_bytes;
            cleared_references += outcome.cleared_references;
        }

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        self.phase.store(CyclePhase::Released as u8, Ordering::Release);

        if self.config.verify_after {
            timers.verify_after.start();
            self.verify_locked(state)?;
            timers.verify_after.stop();
        }
        timers.cycle.stop();

        let summary = CycleSummary {
            epoch,
            cause: request.cause,
            kind,
            soft_as_weak: request.soft_as_weak,
            used_before,
            used_after: state.generations.chunk_bytes(),
            promoted_bytes,
            copied_bytes,
            cleared_references,
            pause: timers.cycle.elapsed(),
        };

        #[cfg(feature = "gc_logging")]
        if self.config.print_gc_summary {
            tracing::info!(
                target: "genscavenge::gc",
                epoch,
                cause = %summary.cause,
                kind = ?summary.kind,
                used_before = summary.used_before,
                used_after = summary.used_after,
                freed = summary.used_before.saturating_sub(summary.used_after),
                promoted = summary.promoted_bytes,
                copied = summary.copied_bytes,
                cleared_references,
                pause_us = summary.pause.as_micros() as u64,
                "GC cycle complete"
            );
        }
        timers.log_summary(epoch);

        state.last_cycle = Some(summary);
        Ok(true)
    }

    fn scavenge(
        &self,
        state: &mut HeapState,
        complete: bool,
        now: u64,
        soft_as_weak: bool,
        timers: &mut CycleTimers,
    ) -> Result<ScavengeOutcome> {
        let start = Instant::now();
        let young_before = state.generations.young.chunk_bytes();
        let old_before = state.generations.old.chunk_bytes();
        state.accounting.before_collection(young_before, old_before);

        let headroom = self
            .config
            .max_heap_size
            .saturating_sub(young_before + old_before);
        let threshold = soft_retention_threshold(headroom, self.config.soft_ref_lru_nanos_per_mib);
        state.references.begin_cycle(now, threshold, soft_as_weak);

        let providers = self.providers();
        let HeapState {
            generations,
            accounting,
            references,
            pending,
            pins,
            ..
        } = &mut *state;
        let pinned: Vec<Address> = pins.values().copied().collect();
        let roots = ScavengeRoots {
            providers: &providers,
            pinned: &pinned,
            pending,
        };
        let scavenger = Scavenger::new(generations, &self.allocator, accounting, references, complete);
        let outcome = match scavenger.run(roots, &self.phase, timers) {
            Ok(outcome) => outcome,
            Err(error) => {
                self.poisoned.store(true, Ordering::Release);

                #[cfg(feature = "gc_logging")]
                tracing::error!(
                    target: "genscavenge::gc",
                    %error,
                    complete,
                    "Collection failed midway, heap poisoned"
                );

                return Err(error);
            }
        };

        let young_after = state.generations.young.chunk_bytes();
        let old_after = state.generations.old.chunk_bytes();
        state.accounting.after_collection(
            complete,
            start.elapsed().as_nanos() as u64,
            young_after,
            old_after,
        );

        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "genscavenge::gc",
            complete,
            young_before,
            young_after,
            old_before,
            old_after,
            promoted = state.accounting.last_promoted_bytes,
            copied = state.accounting.last_copied_bytes,
            pinned_chunks = outcome.pinned_chunks,
            "Scavenge finished"
        );

        Ok(outcome)
    }

    fn root_values(&self, state: &HeapState) -> Result<Vec<Address>> {
        let mut values: Vec<Address> = state.pending.clone();
        values.extend(state.pins.values().copied());
        for provider in self.providers() {
            provider.visit_roots(&mut |slot: &mut Address| values.push(*slot))?;
        }
        Ok(values)
    }

    fn verify_locked(&self, state: &HeapState) -> Result<VerifyReport> {
        let roots = self.root_values(state)?;
        let report = verify::verify_heap(&state.generations, self.config.aligned_chunk_size, &roots);
        if !report.is_ok() && self.config.abort_on_verification_failure {
            return Err(GcError::Verification(report));
        }
        Ok(report)
    }

    /// Verify the heap now, regardless of `verify_before`/`verify_after`.
    /// Failures are reported, never returned as errors.
    pub fn verify(&self) -> Result<VerifyReport> {
        self.check_usable()?;
        let state = self.state.lock();
        let roots = self.root_values(&state)?;
        Ok(verify::verify_heap(
            &state.generations,
            self.config.aligned_chunk_size,
            &roots,
        ))
    }

    /// Statistics snapshot. Must not be called from a root provider.
    pub fn stats(&self) -> HeapStats {
        let state = self.state.lock();
        HeapStats {
            epoch: self.epoch(),
            phase: self.phase(),
            policy: self.config.policy,
            accounting: state.accounting.clone(),
            young_chunk_bytes: state.generations.young.chunk_bytes(),
            old_chunk_bytes: state.generations.old.chunk_bytes(),
            used_object_bytes: state.generations.spaces().map(Space::used_bytes).sum(),
            committed_bytes: self.allocator.committed_bytes(),
            pending_references: state.pending.len(),
            pinned_objects: state.pins.len(),
            last_cycle: state.last_cycle.clone(),
        }
    }

    /// Run `f` with the generations locked. Intended for tests and tools.
    pub fn with_generations<R>(&self, f: impl FnOnce(&Generations) -> R) -> R {
        f(&self.state.lock().generations)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for chunk in state.generations.take_all_chunks() {
            self.allocator.release_chunk(chunk);
        }
        self.allocator.release_free_list();
    }
}
