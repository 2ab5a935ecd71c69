//! # genscavenge
//!
//! Generational, copying, stop-the-world garbage collector.
//!
//! ## Design
//!
//! - **Chunks**: the heap is a set of aligned chunks (many objects, bump
//!   allocated) and unaligned chunks (one large object each)
//! - **Young generation**: eden plus survivor from/to space pairs
//! - **Old generation**: one from/to space pair
//! - **Remembered set**: a card table per chunk, cleaned and re-dirtied by
//!   the collector
//! - **Scavenging**: Cheney copying with a scan frontier per to-space; large
//!   objects are promoted by relinking their chunk
//! - **References**: weak and soft references are discovered while scanning
//!   and decided once the copy has drained

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod accounting;
pub mod address;
pub mod card_table;
pub mod chunk;
pub mod chunk_allocator;
pub mod clock;
mod collector;
pub mod config;
pub mod error;
pub mod generation;
pub mod heap;
pub mod object;
pub mod policy;
pub mod reference;
pub mod remembered_set;
pub mod roots;
pub mod safepoint;
pub mod space;
pub mod stats;
pub mod timers;
pub mod verify;

pub use accounting::Accounting;
pub use address::Address;
pub use card_table::{CARD_SIZE, CardTable};
pub use chunk::{ChunkKind, ChunkRef};
pub use chunk_allocator::{ChunkAllocator, MemorySource, SystemMemory};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::HeapConfig;
pub use error::{ConfigError, GcError, Result};
pub use heap::{Heap, HeapBuilder, PinId};
pub use object::{HeaderState, Object, ObjectKind, ObjectShape};
pub use policy::{CollectionPolicy, Decision, PolicyInputs};
pub use roots::{RootKind, RootProvider, RootSlots, RootsId};
pub use safepoint::{HandshakeSafepoint, MutatorState, NoSafepoint, Safepoint, safepoint_check};
pub use space::SpaceId;
pub use stats::{CollectionKind, CycleSummary, GcCause, HeapStats};
pub use timers::CyclePhase;
pub use verify::{VerifyFailure, VerifyReport};
