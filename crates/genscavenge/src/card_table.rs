//! Card table: one byte per 512-byte region of a chunk.
//!
//! A dirty card may contain a slot that references the young generation; a
//! clean card is proven not to. The dirty value is zero so that the barrier's
//! hot path is a single store of a constant.
//!
//! Card bytes are written concurrently by the write barrier (racy, idempotent
//! stores) and read and cleaned by the collector while it holds exclusive
//! access to the heap.

use std::sync::atomic::{AtomicU8, Ordering};

/// Size of a card in bytes.
pub const CARD_SIZE: usize = 512;
/// Log2 of [`CARD_SIZE`].
pub const CARD_SHIFT: u32 = CARD_SIZE.trailing_zeros();

/// Value of a dirty card.
pub const DIRTY_ENTRY: u8 = 0;
/// Value of a clean card.
pub const CLEAN_ENTRY: u8 = 1;

/// Card index covering byte `offset` of the covered region.
#[inline]
pub const fn index_for_offset(offset: usize) -> usize {
    offset >> CARD_SHIFT
}

/// Byte offset of the first byte covered by card `index`.
#[inline]
pub const fn offset_for_index(index: usize) -> usize {
    index << CARD_SHIFT
}

/// Number of cards needed to cover `bytes`.
#[inline]
pub const fn cards_for(bytes: usize) -> usize {
    bytes.div_ceil(CARD_SIZE)
}

/// A view over the card bytes of one chunk.
#[derive(Clone, Copy)]
pub struct CardTable<'a> {
    cards: &'a [AtomicU8],
}

impl<'a> CardTable<'a> {
    /// View an existing slice of card bytes.
    pub fn new(cards: &'a [AtomicU8]) -> Self {
        Self { cards }
    }

    /// Number of cards.
    #[inline]
    pub fn len(&self) -> usize {
        self.cards.len()
    }

    /// Whether the table covers nothing.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Mark card `index` dirty.
    #[inline]
    pub fn dirty(&self, index: usize) {
        self.cards[index].store(DIRTY_ENTRY, Ordering::Relaxed);
    }

    /// Mark card `index` clean.
    #[inline]
    pub fn clean(&self, index: usize) {
        self.cards[index].store(CLEAN_ENTRY, Ordering::Relaxed);
    }

    /// Clean cards `start..end`.
    pub fn clean_range(&self, start: usize, end: usize) {
        for card in &self.cards[start..end] {
            card.store(CLEAN_ENTRY, Ordering::Relaxed);
        }
    }

    /// Clean every card.
    pub fn clean_all(&self) {
        self.clean_range(0, self.cards.len());
    }

    /// Whether card `index` is dirty.
    ///
    /// Only meaningful while the collector holds exclusive heap access.
    #[inline]
    pub fn is_dirty(&self, index: usize) -> bool {
        self.cards[index].load(Ordering::Relaxed) == DIRTY_ENTRY
    }

    /// Number of dirty cards.
    pub fn dirty_count(&self) -> usize {
        self.cards
            .iter()
            .filter(|card| card.load(Ordering::Relaxed) == DIRTY_ENTRY)
            .count()
    }

    /// Indices of dirty cards in ascending order.
    pub fn dirty_indices(&self) -> impl Iterator<Item = usize> + 'a {
        let cards = self.cards;
        cards
            .iter()
            .enumerate()
            .filter(|(_, card)| card.load(Ordering::Relaxed) == DIRTY_ENTRY)
            .map(|(index, _)| index)
    }
}

impl std::fmt::Debug for CardTable<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CardTable")
            .field("cards", &self.len())
            .field("dirty", &self.dirty_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backing(len: usize) -> Vec<AtomicU8> {
        (0..len).map(|_| AtomicU8::new(CLEAN_ENTRY)).collect()
    }

    #[test]
    fn test_index_conversion() {
        assert_eq!(index_for_offset(0), 0);
        assert_eq!(index_for_offset(511), 0);
        assert_eq!(index_for_offset(512), 1);
        assert_eq!(offset_for_index(3), 1536);
        assert_eq!(cards_for(1), 1);
        assert_eq!(cards_for(1024), 2);
        assert_eq!(cards_for(1025), 3);
    }

    #[test]
    fn test_dirty_and_clean() {
        let cards = backing(8);
        let table = CardTable::new(&cards);

        assert!(!table.is_dirty(2));
        table.dirty(2);
        table.dirty(2);
        assert!(table.is_dirty(2));
        assert_eq!(table.dirty_count(), 1);

        table.clean(2);
        assert!(!table.is_dirty(2));
    }

    #[test]
    fn test_clean_range_and_iteration() {
        let cards = backing(8);
        let table = CardTable::new(&cards);
        for index in [0, 3, 4, 7] {
            table.dirty(index);
        }
        assert_eq!(table.dirty_indices().collect::<Vec<_>>(), vec![0, 3, 4, 7]);

        table.clean_range(3, 5);
        assert_eq!(table.dirty_indices().collect::<Vec<_>>(), vec![0, 7]);

        table.clean_all();
        assert_eq!(table.dirty_count(), 0);
    }
}
