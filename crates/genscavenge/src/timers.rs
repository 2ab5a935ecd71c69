//! Per-phase cycle timers.

use std::time::{Duration, Instant};

/// Phases of a collection cycle.
///
/// `Idle -> Paused -> RootScanning -> Copying -> ReferenceProcessing ->
/// SpaceSwap -> Released -> Idle`
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CyclePhase {
    /// No cycle in progress
    Idle = 0,
    /// Mutators are stopped and the collector owns the heap
    Paused = 1,
    /// Roots and dirty cards are being scanned
    RootScanning = 2,
    /// The Cheney scan is draining the to-spaces
    Copying = 3,
    /// Discovered references are being decided
    ReferenceProcessing = 4,
    /// From-space chunks are released and to-spaces become from-spaces
    SpaceSwap = 5,
    /// The cycle finished; mutators are about to resume
    Released = 6,
}

impl From<u8> for CyclePhase {
    fn from(v: u8) -> Self {
        match v {
            1 => CyclePhase::Paused,
            2 => CyclePhase::RootScanning,
            3 => CyclePhase::Copying,
            4 => CyclePhase::ReferenceProcessing,
            5 => CyclePhase::SpaceSwap,
            6 => CyclePhase::Released,
            _ => CyclePhase::Idle,
        }
    }
}

/// A resettable stopwatch accumulating elapsed time.
#[derive(Debug, Default, Clone)]
pub struct Timer {
    started: Option<Instant>,
    elapsed: Duration,
}

impl Timer {
    /// Start (or restart) measuring.
    pub fn start(&mut self) {
        self.started = Some(Instant::now());
    }

    /// Stop measuring and add the interval.
    pub fn stop(&mut self) {
        if let Some(started) = self.started.take() {
            self.elapsed += started.elapsed();
        }
    }

    /// Accumulated time.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Forget everything.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Timers for the phases of one request.
#[derive(Debug, Default, Clone)]
pub struct CycleTimers {
    /// Whole request, pause included
    pub cycle: Timer,
    /// Verification before the cycle
    pub verify_before: Timer,
    /// Roots and dirty cards
    pub root_scan: Timer,
    /// Cheney scan
    pub copy: Timer,
    /// Reference processing
    pub references: Timer,
    /// Releasing from-spaces and swapping
    pub release: Timer,
    /// Verification after the cycle
    pub verify_after: Timer,
}

impl CycleTimers {
    /// Log the phase breakdown.
    pub fn log_summary(&self, epoch: u64) {
        #[cfg(feature = "gc_logging")]
        tracing::debug!(
            target: "genscavenge::gc",
            epoch,
            cycle_us = self.cycle.elapsed().as_micros() as u64,
            verify_before_us = self.verify_before.elapsed().as_micros() as u64,
            root_scan_us = self.root_scan.elapsed().as_micros() as u64,
            copy_us = self.copy.elapsed().as_micros() as u64,
            references_us = self.references.elapsed().as_micros() as u64,
            release_us = self.release.elapsed().as_micros() as u64,
            verify_after_us = self.verify_after.elapsed().as_micros() as u64,
            "GC phase timers"
        );
        #[cfg(not(feature = "gc_logging"))]
        let _ = epoch;
    }
}
