//! Stop-the-world pause primitive.
//!
//! The collector only needs two calls: [`Safepoint::request_pause`] before a
//! cycle and [`Safepoint::resume_all`] after it. Threads waiting for another
//! thread's cycle call [`Safepoint::poll`] so they can be paused too. Embedders with their own
//! thread machinery implement the trait; [`NoSafepoint`] serves
//! single-threaded embedders, and [`HandshakeSafepoint`] is a cooperative
//! handshake where mutators poll [`safepoint_check`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex, RwLock};

/// Pauses and resumes all mutator threads.
pub trait Safepoint: Send + Sync {
    /// Block until no mutator other than the caller executes managed code.
    fn request_pause(&self);

    /// Let the paused mutators continue.
    fn resume_all(&self);

    /// Called repeatedly by a thread waiting on the heap while another thread
    /// may be starting a cycle. Parks the caller if a pause was requested.
    fn poll(&self) {}
}

/// Safepoint for embedders whose mutators never run during a collection.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSafepoint;

impl Safepoint for NoSafepoint {
    fn request_pause(&self) {}

    fn resume_all(&self) {}
}

/// Safe point state for the handshake protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafePointState {
    /// Normal execution
    Running = 0,
    /// Waiting at safe point
    AtSafePoint = 1,
    /// Requested to reach safe point
    Requested = 2,
}

/// Per-mutator handshake state
pub struct MutatorState {
    /// Registration id
    pub id: usize,
    thread: ThreadId,
    state: AtomicU8,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl MutatorState {
    fn new(id: usize, thread: ThreadId) -> Self {
        Self {
            id,
            thread,
            state: AtomicU8::new(SafePointState::Running as u8),
            condvar: Condvar::new(),
            mutex: Mutex::new(()),
        }
    }

    /// Current state
    pub fn state(&self) -> SafePointState {
        match self.state.load(Ordering::Acquire) {
            0 => SafePointState::Running,
            1 => SafePointState::AtSafePoint,
            _ => SafePointState::Requested,
        }
    }

    fn request_safe_point(&self) {
        // A mutator already parked stays parked.
        let _ = self.state.compare_exchange(
            SafePointState::Running as u8,
            SafePointState::Requested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Park at the safe point until resumed
    pub fn enter_safe_point(&self) {
        let mut guard = self.mutex.lock();
        self.state
            .store(SafePointState::AtSafePoint as u8, Ordering::Release);
        while self.state.load(Ordering::Acquire) == SafePointState::AtSafePoint as u8 {
            self.condvar.wait(&mut guard);
        }
    }

    fn resume(&self) {
        let _guard = self.mutex.lock();
        self.state
            .store(SafePointState::Running as u8, Ordering::Release);
        self.condvar.notify_one();
    }

    /// Whether the mutator is parked
    pub fn is_at_safe_point(&self) -> bool {
        self.state.load(Ordering::Acquire) == SafePointState::AtSafePoint as u8
    }
}

/// Cooperative handshake with registered mutator threads.
///
/// The thread requesting the pause is never waited for, so a mutator may
/// trigger a collection itself. Mutators must poll [`safepoint_check`]
/// regularly and must not block on the heap while a pause is requested.
#[derive(Default)]
pub struct HandshakeSafepoint {
    mutators: RwLock<Vec<Arc<MutatorState>>>,
    next_id: AtomicUsize,
}

impl HandshakeSafepoint {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the calling thread as a mutator.
    pub fn register_mutator(&self) -> Arc<MutatorState> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(MutatorState::new(id, thread::current().id()));
        self.mutators.write().push(Arc::clone(&state));
        state
    }

    /// Remove a mutator.
    pub fn unregister_mutator(&self, state: &Arc<MutatorState>) {
        self.mutators.write().retain(|s| s.id != state.id);
    }

    /// Number of registered mutators.
    pub fn mutator_count(&self) -> usize {
        self.mutators.read().len()
    }
}

impl Safepoint for HandshakeSafepoint {
    fn request_pause(&self) {
        let current = thread::current().id();
        let others: Vec<Arc<MutatorState>> = self
            .mutators
            .read()
            .iter()
            .filter(|m| m.thread != current)
            .cloned()
            .collect();

        for mutator in &others {
            mutator.request_safe_point();
        }

        let backoff = Backoff::new();
        while !others.iter().all(|m| m.is_at_safe_point()) {
            backoff.snooze();
        }
    }

    fn resume_all(&self) {
        let current = thread::current().id();
        for mutator in self.mutators.read().iter() {
            if mutator.thread != current {
                mutator.resume();
            }
        }
    }

    fn poll(&self) {
        let current = thread::current().id();
        let mutator = self
            .mutators
            .read()
            .iter()
            .find(|m| m.thread == current)
            .cloned();
        if let Some(mutator) = mutator {
            safepoint_check(&mutator);
        }
    }
}

/// Safepoint check - call periodically in mutator code
#[inline]
pub fn safepoint_check(mutator: &MutatorState) {
    if mutator.state() == SafePointState::Requested {
        mutator.enter_safe_point();
    }
}
