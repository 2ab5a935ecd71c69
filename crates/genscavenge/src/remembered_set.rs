//! Remembered set: card marking on top of the per-chunk card tables.
//!
//! Cards are dirtied for the address of the *slot* that was written. The
//! invariant maintained between cycles is:
//!
//! * a clean card contains no reference slot that points into the young
//!   generation;
//! * every slot of an old object that points into the young generation lies
//!   in a dirty card.
//!
//! The collector cleans a dirty card before it rescans the slots inside it and
//! re-dirties it when a slot still points into the young generation.

use std::fmt;

use crate::address::Address;
use crate::chunk::ChunkRef;
use crate::object::Object;
use crate::space::SpaceId;

/// Dirty the card covering `address`, which must lie inside `chunk`.
#[inline]
pub fn dirty_card_for(chunk: ChunkRef, address: Address) {
    chunk.card_table().dirty(chunk.card_index(address));
}

/// Dirty the card of `slot` if the value stored there is young.
#[inline]
pub fn dirty_card_if_necessary(chunk: ChunkRef, slot: Address, target_is_young: bool) {
    if target_is_young {
        dirty_card_for(chunk, slot);
    }
}

/// Mark every card of `chunk` clean.
pub fn clean_cards_of_chunk(chunk: ChunkRef) {
    chunk.card_table().clean_all();
}

/// Address range `[start, end)` covered by card `index`, clipped to the
/// allocated object area.
pub fn card_range(chunk: ChunkRef, index: usize) -> (Address, Address) {
    let start = chunk.card_start(index).max(chunk.objects_start());
    let end = chunk.card_start(index + 1).min(chunk.top());
    (start, end)
}

/// Objects whose span intersects card `index`, in address order.
pub fn objects_intersecting_card(chunk: ChunkRef, index: usize) -> CardObjects {
    let (_, end) = card_range(chunk, index);
    CardObjects {
        cursor: chunk.first_object_in_card(index),
        end,
    }
}

/// Iterator returned by [`objects_intersecting_card`].
pub struct CardObjects {
    cursor: Option<Address>,
    end: Address,
}

impl Iterator for CardObjects {
    type Item = Object;

    fn next(&mut self) -> Option<Object> {
        let current = self.cursor?;
        if current >= self.end {
            self.cursor = None;
            return None;
        }
        // SAFETY: the first-object table and object sizes only yield object starts
        let object = unsafe { Object::new(current) };
        let size = object.size();
        self.cursor = (size != 0).then(|| current.add(size));
        Some(object)
    }
}

/// Call `f` with every dirty card index of `chunk` and the reference slots
/// located in that card. Each card is cleaned before its slots are visited.
pub fn walk_dirty_cards(chunk: ChunkRef, mut f: impl FnMut(Object, Address)) {
    let dirty: Vec<usize> = chunk.card_table().dirty_indices().collect();
    for index in dirty {
        chunk.card_table().clean(index);
        let (start, end) = card_range(chunk, index);
        for object in objects_intersecting_card(chunk, index) {
            object.for_each_reference_slot(|slot| {
                if slot >= start && slot < end {
                    f(object, slot);
                }
            });
        }
    }
}

/// A card table inconsistency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CardFailure {
    /// Chunk holding the card
    pub chunk: Address,
    /// Card index
    pub card: usize,
    /// Object holding the slot
    pub holder: Address,
    /// Slot address
    pub slot: Address,
    /// Young object referenced from the slot
    pub target: Address,
    /// Space of the holder
    pub space: Option<SpaceId>,
}

impl fmt::Display for CardFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "clean card {} of chunk {} ({}) covers slot {} of object {} referencing young object {}",
            self.card,
            self.chunk,
            self.space.map_or_else(|| "no space".to_string(), |s| s.to_string()),
            self.slot,
            self.holder,
            self.target
        )
    }
}

/// Check the card invariant for one old chunk.
///
/// Walks every clean card and every object intersecting it; any reference
/// slot inside the card that `is_young` accepts is a failure. Because each
/// slot lies in exactly one card, this also proves that every young
/// reference sits under a dirty card.
pub fn verify_chunk_cards(chunk: ChunkRef, is_young: impl Fn(Address) -> bool) -> Vec<CardFailure> {
    let mut failures = Vec::new();
    let table = chunk.card_table();
    if chunk.used_bytes() == 0 {
        return failures;
    }
    let first = chunk.card_index(chunk.objects_start());
    let last = chunk.card_index(chunk.top().sub(1));
    for index in first..=last {
        if table.is_dirty(index) {
            continue;
        }
        let (start, end) = card_range(chunk, index);
        for object in objects_intersecting_card(chunk, index) {
            object.for_each_reference_slot(|slot| {
                if slot < start || slot >= end {
                    return;
                }
                // SAFETY: reference slots of a walked object are readable
                let target = unsafe { slot.load_ref() };
                if !target.is_null() && is_young(target) {
                    failures.push(CardFailure {
                        chunk: chunk.base(),
                        card: index,
                        holder: object.address(),
                        slot,
                        target,
                        space: chunk.space(),
                    });
                }
            });
        }
    }
    failures
}
