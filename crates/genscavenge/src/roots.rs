//! Root providers.
//!
//! The collector does not walk stacks itself. Each root domain (a thread's
//! stack frames, its thread-local objects, the mutable part of the image
//! heap) is exposed by a [`RootProvider`] that hands every slot to a visitor,
//! which may overwrite it with the object's new address.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::Address;
use crate::error::Result;

/// Domain of a root provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum RootKind {
    /// Reference slots in the frames of a mutator thread
    ThreadStack,
    /// Objects held by a thread's local storage
    ThreadLocal,
    /// Mutable static roots of the image heap
    ImageHeap,
}

/// A set of root slots.
pub trait RootProvider: Send + Sync {
    /// Domain of the roots.
    fn kind(&self) -> RootKind;

    /// Call `visitor` with every root slot. Null slots may be skipped.
    ///
    /// A provider that cannot describe a frame returns
    /// [`GcError::MissingReferenceMap`](crate::GcError::MissingReferenceMap).
    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Address)) -> Result<()>;
}

/// Handle of a registered provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootsId(pub(crate) u64);

/// A growable vector of root slots shared between the embedder and the heap.
///
/// Cloning yields another handle to the same slots.
#[derive(Clone)]
pub struct RootSlots {
    kind: RootKind,
    slots: Arc<Mutex<Vec<Address>>>,
}

impl RootSlots {
    /// Empty slot vector of the given domain.
    pub fn new(kind: RootKind) -> Self {
        Self {
            kind,
            slots: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Add a slot and return its index.
    pub fn push(&self, value: Address) -> usize {
        let mut slots = self.slots.lock();
        slots.push(value);
        slots.len() - 1
    }

    /// Read slot `index`.
    pub fn get(&self, index: usize) -> Address {
        self.slots.lock()[index]
    }

    /// Overwrite slot `index`.
    pub fn set(&self, index: usize, value: Address) {
        self.slots.lock()[index] = value;
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    /// Whether there are no slots.
    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Drop every slot.
    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}

impl RootProvider for RootSlots {
    fn kind(&self) -> RootKind {
        self.kind
    }

    fn visit_roots(&self, visitor: &mut dyn FnMut(&mut Address)) -> Result<()> {
        for slot in self.slots.lock().iter_mut() {
            if !slot.is_null() {
                visitor(slot);
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for RootSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootSlots")
            .field("kind", &self.kind)
            .field("slots", &*self.slots.lock())
            .finish()
    }
}
