//! Heap chunks.
//!
//! A chunk is a block of raw memory whose first bytes hold a [`ChunkHeader`].
//! Two layouts exist:
//!
//! ```text
//! Aligned chunk (aligned_chunk_size bytes, aligned to its size):
//! ┌────────┬────────────┬────────────────────┬──────────────────────────┐
//! │ header │ card table │ first-object table │ objects ... top ... end  │
//! └────────┴────────────┴────────────────────┴──────────────────────────┘
//!
//! Unaligned chunk (sized for exactly one object):
//! ┌────────┬────────────────────────┬────────────┐
//! │ header │ object                 │ card table │
//! └────────┴────────────────────────┴────────────┘
//! ```
//!
//! Card indices are relative to the chunk base in both layouts, so the same
//! arithmetic serves aligned and unaligned chunks. The enclosing chunk of an
//! object is found by masking its address (aligned) or subtracting the fixed
//! object offset (unaligned, selected by the header's unaligned flag).

use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::sync::atomic::AtomicU8;

use crate::address::{Address, WORD, align_up, checked_align_up};
use crate::card_table::{self, CardTable};
use crate::object::Object;
use crate::space::SpaceId;

/// Alignment of the object area inside chunks.
const AREA_ALIGNMENT: usize = 64;

/// First-object table entry meaning "no object intersects this card".
const NO_OBJECT: u32 = u32::MAX;

/// Marker stored in the header for "owned by no space".
const NO_SPACE: u16 = u16::MAX;

/// Bytes reserved for the chunk header in both layouts.
pub const CHUNK_HEADER_SIZE: usize = align_up(size_of::<ChunkHeader>(), AREA_ALIGNMENT);

/// Offset of the single object in an unaligned chunk.
pub const UNALIGNED_OBJECT_OFFSET: usize = CHUNK_HEADER_SIZE;

/// Alignment of unaligned chunks.
pub const UNALIGNED_CHUNK_ALIGNMENT: usize = AREA_ALIGNMENT;

/// Chunk layout variant.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Fixed size, size-aligned, many objects.
    Aligned = 0,
    /// Exactly one large object, never recycled.
    Unaligned = 1,
}

/// In-memory chunk header.
#[repr(C)]
pub struct ChunkHeader {
    top: usize,
    end: usize,
    objects_start: usize,
    size: usize,
    card_table_start: usize,
    card_count: usize,
    first_object_table: usize,
    prev: *mut ChunkHeader,
    next: *mut ChunkHeader,
    free_next: *mut ChunkHeader,
    space: u16,
    kind: ChunkKind,
}

/// Offsets of the parts of an aligned chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlignedLayout {
    /// Total chunk size.
    pub chunk_size: usize,
    /// Number of cards (covering the whole chunk).
    pub card_count: usize,
    /// Offset of the card table.
    pub card_table_offset: usize,
    /// Offset of the first-object table.
    pub first_object_table_offset: usize,
    /// Offset of the first object.
    pub objects_offset: usize,
}

impl AlignedLayout {
    /// Layout of an aligned chunk of `chunk_size` bytes.
    pub const fn new(chunk_size: usize) -> Self {
        let card_count = card_table::cards_for(chunk_size);
        let card_table_offset = CHUNK_HEADER_SIZE;
        let first_object_table_offset = align_up(card_table_offset + card_count, WORD);
        let objects_offset = align_up(
            first_object_table_offset + card_count * size_of::<u32>(),
            AREA_ALIGNMENT,
        );
        Self {
            chunk_size,
            card_count,
            card_table_offset,
            first_object_table_offset,
            objects_offset,
        }
    }

    /// Bytes available for objects.
    pub const fn usable_bytes(&self) -> usize {
        self.chunk_size - self.objects_offset
    }
}

/// Offsets of the parts of an unaligned chunk holding one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnalignedLayout {
    /// Total chunk size.
    pub chunk_size: usize,
    /// Number of cards (covering header and object).
    pub card_count: usize,
    /// Offset of the card table, right after the object.
    pub card_table_offset: usize,
}

impl UnalignedLayout {
    /// Layout of an unaligned chunk for an object of `object_size` bytes, or
    /// `None` when the chunk size overflows.
    pub fn new(object_size: usize) -> Option<Self> {
        let object_end = UNALIGNED_OBJECT_OFFSET.checked_add(object_size)?;
        let card_table_offset = checked_align_up(object_end, WORD)?;
        let card_count = card_table::cards_for(object_end);
        Some(Self {
            chunk_size: checked_align_up(card_table_offset.checked_add(card_count)?, WORD)?,
            card_count,
            card_table_offset,
        })
    }
}

/// Handle to a live chunk.
///
/// A `ChunkRef` is only created for memory that holds an initialized header
/// and stays valid until the chunk allocator releases it; all accessors rely
/// on that.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRef(NonNull<ChunkHeader>);

// SAFETY: chunk metadata is only mutated under the heap lock or while the
// collector has exclusive access; card bytes are atomics.
unsafe impl Send for ChunkRef {}
unsafe impl Sync for ChunkRef {}

impl ChunkRef {
    /// Wrap a raw header pointer.
    ///
    /// # Safety
    /// `ptr` must point to an initialized chunk header.
    #[inline]
    pub unsafe fn from_raw(ptr: NonNull<ChunkHeader>) -> Self {
        Self(ptr)
    }

    /// Wrap a possibly-null header pointer.
    ///
    /// # Safety
    /// Same as [`ChunkRef::from_raw`] when non-null.
    #[inline]
    pub(crate) unsafe fn from_nullable(ptr: *mut ChunkHeader) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    /// Raw header pointer.
    #[inline]
    pub fn as_ptr(self) -> *mut ChunkHeader {
        self.0.as_ptr()
    }

    #[inline]
    fn header(&self) -> &ChunkHeader {
        // SAFETY: ChunkRef invariant
        unsafe { self.0.as_ref() }
    }

    #[inline]
    fn header_mut(&mut self) -> &mut ChunkHeader {
        // SAFETY: ChunkRef invariant; mutation is serialized by the heap lock
        unsafe { self.0.as_mut() }
    }

    /// First byte of the chunk.
    #[inline]
    pub fn base(self) -> Address {
        Address::from_ptr(self.as_ptr())
    }

    /// Layout variant.
    #[inline]
    pub fn kind(self) -> ChunkKind {
        self.header().kind
    }

    /// Whether this is an aligned chunk.
    #[inline]
    pub fn is_aligned(self) -> bool {
        self.kind() == ChunkKind::Aligned
    }

    /// Total reserved bytes.
    #[inline]
    pub fn size(self) -> usize {
        self.header().size
    }

    /// Allocation pointer.
    #[inline]
    pub fn top(self) -> Address {
        Address::from_usize(self.header().top)
    }

    /// Set the allocation pointer.
    #[inline]
    pub fn set_top(mut self, top: Address) {
        self.header_mut().top = top.as_usize();
    }

    /// End of the object area.
    #[inline]
    pub fn end(self) -> Address {
        Address::from_usize(self.header().end)
    }

    /// Start of the object area.
    #[inline]
    pub fn objects_start(self) -> Address {
        Address::from_usize(self.header().objects_start)
    }

    /// Bytes occupied by objects.
    #[inline]
    pub fn used_bytes(self) -> usize {
        self.top().offset_from(self.objects_start())
    }

    /// Bytes still available for bump allocation.
    #[inline]
    pub fn free_bytes(self) -> usize {
        self.end().offset_from(self.top())
    }

    /// Owning space, if any.
    #[inline]
    pub fn space(self) -> Option<SpaceId> {
        match self.header().space {
            NO_SPACE => None,
            encoded => SpaceId::decode(encoded),
        }
    }

    /// Set or clear the owning space.
    #[inline]
    pub fn set_space(mut self, space: Option<SpaceId>) {
        self.header_mut().space = space.map_or(NO_SPACE, SpaceId::encode);
    }

    /// Raw owning-space value, for diagnostics.
    #[inline]
    pub(crate) fn raw_space(self) -> u16 {
        self.header().space
    }

    /// Previous chunk in the owning list.
    #[inline]
    pub fn prev(self) -> Option<ChunkRef> {
        // SAFETY: links only ever hold live chunks or null
        unsafe { Self::from_nullable(self.header().prev) }
    }

    /// Next chunk in the owning list.
    #[inline]
    pub fn next(self) -> Option<ChunkRef> {
        // SAFETY: links only ever hold live chunks or null
        unsafe { Self::from_nullable(self.header().next) }
    }

    /// Set the previous link.
    #[inline]
    pub fn set_prev(mut self, prev: Option<ChunkRef>) {
        self.header_mut().prev = prev.map_or(ptr::null_mut(), ChunkRef::as_ptr);
    }

    /// Set the next link.
    #[inline]
    pub fn set_next(mut self, next: Option<ChunkRef>) {
        self.header_mut().next = next.map_or(ptr::null_mut(), ChunkRef::as_ptr);
    }

    #[inline]
    pub(crate) fn free_next(self) -> *mut ChunkHeader {
        self.header().free_next
    }

    #[inline]
    pub(crate) fn set_free_next(mut self, next: *mut ChunkHeader) {
        self.header_mut().free_next = next;
    }

    /// The chunk's card table.
    #[inline]
    pub fn card_table(&self) -> CardTable<'_> {
        let header = self.header();
        // SAFETY: the card bytes live inside the chunk for its whole lifetime
        let cards = unsafe {
            std::slice::from_raw_parts(
                header.card_table_start as *const AtomicU8,
                header.card_count,
            )
        };
        CardTable::new(cards)
    }

    /// Card index covering `address`, which must lie inside the chunk.
    #[inline]
    pub fn card_index(self, address: Address) -> usize {
        card_table::index_for_offset(address.offset_from(self.base()))
    }

    /// First address covered by card `index`.
    #[inline]
    pub fn card_start(self, index: usize) -> Address {
        self.base().add(card_table::offset_for_index(index))
    }

    /// Whether `address` lies in the allocated object area.
    #[inline]
    pub fn contains_object_address(self, address: Address) -> bool {
        address >= self.objects_start() && address < self.top()
    }

    /// Bump-allocate `size` bytes, recording the object in the first-object
    /// table. The memory is left as is.
    pub fn allocate(mut self, size: usize) -> Option<Address> {
        let start = self.top();
        if size > self.free_bytes() {
            return None;
        }
        let end = start.add(size);
        self.header_mut().top = end.as_usize();
        if self.is_aligned() {
            self.record_object(start, end);
        }
        Some(start)
    }

    fn first_object_table(self) -> *mut u32 {
        self.header().first_object_table as *mut u32
    }

    fn record_object(self, start: Address, end: Address) {
        let table = self.first_object_table();
        let first = self.card_index(start);
        let last = self.card_index(end.sub(1));
        let offset = start.offset_from(self.base()) as u32;
        for index in first..=last {
            // SAFETY: index < card_count because the object lies in the chunk
            unsafe {
                let entry = table.add(index);
                if *entry == NO_OBJECT {
                    *entry = offset;
                }
            }
        }
    }

    /// Start of the first object whose span intersects card `index`.
    pub fn first_object_in_card(self, index: usize) -> Option<Address> {
        if !self.is_aligned() {
            let object = self.objects_start();
            let covered = self.card_index(object)..=self.card_index(self.end().sub(1));
            return (self.top() > object && covered.contains(&index)).then_some(object);
        }
        if index >= self.header().card_count {
            return None;
        }
        // SAFETY: index < card_count
        let entry = unsafe { *self.first_object_table().add(index) };
        (entry != NO_OBJECT).then(|| self.base().add(entry as usize))
    }

    fn reset_first_object_table(self) {
        if self.is_aligned() {
            let table = self.first_object_table();
            for index in 0..self.header().card_count {
                // SAFETY: index < card_count
                unsafe { *table.add(index) = NO_OBJECT };
            }
        }
    }

    /// Reset an aligned chunk to its freshly produced state.
    pub(crate) fn reset(mut self) {
        let objects_start = self.header().objects_start;
        let header = self.header_mut();
        header.top = objects_start;
        header.space = NO_SPACE;
        header.prev = ptr::null_mut();
        header.next = ptr::null_mut();
        header.free_next = ptr::null_mut();
        self.card_table().clean_all();
        self.reset_first_object_table();
    }

    /// Fill the unallocated object area with `pattern`.
    pub(crate) fn zap_free_area(self, pattern: usize) {
        let mut cursor = self.top();
        while cursor < self.end() {
            // SAFETY: the free area lies inside the chunk and is word aligned
            unsafe { cursor.store_word(pattern) };
            cursor = cursor.add(WORD);
        }
    }

    /// Fill the whole object area with `pattern`.
    pub(crate) fn zap_all(self, pattern: usize) {
        let mut cursor = self.objects_start();
        while cursor < self.end() {
            // SAFETY: the object area lies inside the chunk and is word aligned
            unsafe { cursor.store_word(pattern) };
            cursor = cursor.add(WORD);
        }
    }

    /// Iterate over the objects between the start of the area and `top`.
    pub fn objects(self) -> ObjectWalk {
        ObjectWalk {
            cursor: self.objects_start(),
            limit: self.top(),
        }
    }
}

impl std::fmt::Debug for ChunkRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("base", &self.base())
            .field("kind", &self.kind())
            .field("space", &self.space())
            .field("top", &self.top())
            .field("end", &self.end())
            .finish()
    }
}

/// Iterator over consecutive objects of a chunk.
pub struct ObjectWalk {
    cursor: Address,
    limit: Address,
}

impl Iterator for ObjectWalk {
    type Item = Object;

    fn next(&mut self) -> Option<Object> {
        if self.cursor >= self.limit {
            return None;
        }
        // SAFETY: every address between objects_start and top starts an object
        let object = unsafe { Object::new(self.cursor) };
        let size = object.size();
        if size == 0 {
            // A zero size would loop forever; the verifier reports it.
            self.cursor = self.limit;
        } else {
            self.cursor = self.cursor.add(size);
        }
        Some(object)
    }
}

/// Write a fresh aligned-chunk header into `memory`.
///
/// # Safety
/// `memory` must be valid for `layout.chunk_size` bytes and aligned to it.
pub(crate) unsafe fn initialize_aligned(memory: NonNull<u8>, layout: &AlignedLayout) -> ChunkRef {
    let base = memory.as_ptr() as usize;
    let header = ChunkHeader {
        top: base + layout.objects_offset,
        end: base + layout.chunk_size,
        objects_start: base + layout.objects_offset,
        size: layout.chunk_size,
        card_table_start: base + layout.card_table_offset,
        card_count: layout.card_count,
        first_object_table: base + layout.first_object_table_offset,
        prev: ptr::null_mut(),
        next: ptr::null_mut(),
        free_next: ptr::null_mut(),
        space: NO_SPACE,
        kind: ChunkKind::Aligned,
    };
    let header_ptr = memory.cast::<ChunkHeader>();
    // SAFETY: caller guarantees the memory is valid and aligned
    unsafe { header_ptr.as_ptr().write(header) };
    let chunk = ChunkRef(header_ptr);
    chunk.reset();
    chunk
}

/// Write a fresh unaligned-chunk header into `memory`.
///
/// # Safety
/// `memory` must be valid for `layout.chunk_size` bytes and aligned to
/// [`UNALIGNED_CHUNK_ALIGNMENT`].
pub(crate) unsafe fn initialize_unaligned(
    memory: NonNull<u8>,
    object_size: usize,
    layout: &UnalignedLayout,
) -> ChunkRef {
    let base = memory.as_ptr() as usize;
    let objects_start = base + UNALIGNED_OBJECT_OFFSET;
    let header = ChunkHeader {
        top: objects_start,
        end: objects_start + object_size,
        objects_start,
        size: layout.chunk_size,
        card_table_start: base + layout.card_table_offset,
        card_count: layout.card_count,
        first_object_table: 0,
        prev: ptr::null_mut(),
        next: ptr::null_mut(),
        free_next: ptr::null_mut(),
        space: NO_SPACE,
        kind: ChunkKind::Unaligned,
    };
    let header_ptr = memory.cast::<ChunkHeader>();
    // SAFETY: caller guarantees the memory is valid and aligned
    unsafe { header_ptr.as_ptr().write(header) };
    let chunk = ChunkRef(header_ptr);
    chunk.card_table().clean_all();
    chunk
}

/// Find the chunk that holds `object`.
///
/// # Safety
/// `object` must be a live (normal or forwarded) object inside a chunk of a
/// heap whose aligned chunks are `aligned_chunk_size` bytes.
#[inline]
pub unsafe fn enclosing_chunk(object: Object, aligned_chunk_size: usize) -> ChunkRef {
    let base = if object.is_unaligned() {
        object.address().sub(UNALIGNED_OBJECT_OFFSET)
    } else {
        object.address().align_down(aligned_chunk_size)
    };
    // SAFETY: caller guarantees the object lies in a chunk of this heap
    unsafe { ChunkRef::from_raw(NonNull::new_unchecked(base.as_ptr())) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectShape;
    use std::alloc::{Layout, alloc_zeroed, dealloc};

    const CHUNK: usize = 64 * 1024;

    struct TestMemory {
        ptr: NonNull<u8>,
        layout: Layout,
    }

    impl TestMemory {
        fn new(size: usize, align: usize) -> Self {
            let layout = Layout::from_size_align(size, align).unwrap();
            let ptr = NonNull::new(unsafe { alloc_zeroed(layout) }).unwrap();
            Self { ptr, layout }
        }
    }

    impl Drop for TestMemory {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }

    #[test]
    fn test_aligned_layout() {
        let layout = AlignedLayout::new(CHUNK);
        assert_eq!(layout.card_count, CHUNK / card_table::CARD_SIZE);
        assert!(layout.objects_offset > layout.first_object_table_offset);
        assert_eq!(layout.objects_offset % AREA_ALIGNMENT, 0);
        assert!(layout.usable_bytes() < CHUNK);
    }

    #[test]
    fn test_aligned_chunk_allocation() {
        let memory = TestMemory::new(CHUNK, CHUNK);
        let layout = AlignedLayout::new(CHUNK);
        let chunk = unsafe { initialize_aligned(memory.ptr, &layout) };

        assert_eq!(chunk.kind(), ChunkKind::Aligned);
        assert_eq!(chunk.top(), chunk.objects_start());
        assert_eq!(chunk.space(), None);
        assert_eq!(chunk.card_table().dirty_count(), 0);

        let first = chunk.allocate(64).unwrap();
        let second = chunk.allocate(64).unwrap();
        assert_eq!(second, first.add(64));
        assert_eq!(chunk.used_bytes(), 128);
        assert!(chunk.allocate(layout.usable_bytes()).is_none());
    }

    #[test]
    fn test_first_object_table_tracks_straddling_objects() {
        let memory = TestMemory::new(CHUNK, CHUNK);
        let layout = AlignedLayout::new(CHUNK);
        let chunk = unsafe { initialize_aligned(memory.ptr, &layout) };

        let shape = ObjectShape::plain(0, 1200);
        let start = chunk.allocate(shape.size()).unwrap();
        unsafe { Object::initialize(start, &shape, false) };

        let first_card = chunk.card_index(start);
        let last_card = chunk.card_index(start.add(shape.size() - 1));
        assert!(last_card > first_card);
        for index in first_card..=last_card {
            assert_eq!(chunk.first_object_in_card(index), Some(start));
        }
        assert_eq!(chunk.first_object_in_card(last_card + 1), None);
        assert_eq!(chunk.objects().count(), 1);
    }

    #[test]
    fn test_space_and_links() {
        let memory_a = TestMemory::new(CHUNK, CHUNK);
        let memory_b = TestMemory::new(CHUNK, CHUNK);
        let layout = AlignedLayout::new(CHUNK);
        let a = unsafe { initialize_aligned(memory_a.ptr, &layout) };
        let b = unsafe { initialize_aligned(memory_b.ptr, &layout) };

        a.set_space(Some(SpaceId::Eden));
        a.set_next(Some(b));
        b.set_prev(Some(a));
        assert_eq!(a.space(), Some(SpaceId::Eden));
        assert_eq!(a.next(), Some(b));
        assert_eq!(b.prev(), Some(a));

        a.reset();
        assert_eq!(a.space(), None);
        assert_eq!(a.next(), None);
    }

    #[test]
    fn test_enclosing_chunk_lookup() {
        let aligned_memory = TestMemory::new(CHUNK, CHUNK);
        let chunk = unsafe { initialize_aligned(aligned_memory.ptr, &AlignedLayout::new(CHUNK)) };
        let shape = ObjectShape::plain(1, 16);
        let addr = chunk.allocate(shape.size()).unwrap();
        let object = unsafe { Object::initialize(addr, &shape, false) };
        assert_eq!(unsafe { enclosing_chunk(object, CHUNK) }, chunk);

        let big = ObjectShape::plain(0, 4096);
        assert!(UnalignedLayout::new(usize::MAX - 8).is_none());
        let layout = UnalignedLayout::new(big.size()).unwrap();
        let unaligned_memory = TestMemory::new(layout.chunk_size, UNALIGNED_CHUNK_ALIGNMENT);
        let large = unsafe { initialize_unaligned(unaligned_memory.ptr, big.size(), &layout) };
        let addr = large.allocate(big.size()).unwrap();
        assert_eq!(addr, large.objects_start());
        let object = unsafe { Object::initialize(addr, &big, true) };
        assert_eq!(unsafe { enclosing_chunk(object, CHUNK) }, large);
        assert_eq!(large.free_bytes(), 0);
        assert_eq!(large.first_object_in_card(0), Some(addr));
    }
}
