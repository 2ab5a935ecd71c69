//! Object layout interpreted by the collector.
//!
//! Every object starts with a three-word prefix:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────┬─────────────────────────┐
//! │ header word  │ size (bytes) │ strong slots │ kind-specific words ... │
//! └──────────────┴──────────────┴──────────────┴─────────────────────────┘
//! ```
//!
//! Plain objects continue with their strong reference slots and then raw
//! payload. Reference objects (weak/soft) insert four words first: referent,
//! next-discovered link, last-access timestamp and notification queue.
//!
//! The header word is decoded into a [`HeaderState`] instead of being tested
//! bit by bit at every use: an object is either `Normal`, `Forwarded` to its
//! copy while a cycle is running, or `Zapped` by the debug fill patterns.

use crate::address::{Address, WORD, checked_align_up};

/// Offset of the header word.
pub const HEADER_OFFSET: usize = 0;
/// Offset of the size word.
pub const SIZE_OFFSET: usize = WORD;
/// Offset of the strong-slot count word.
pub const SLOT_COUNT_OFFSET: usize = 2 * WORD;
/// Size of the common prefix.
pub const PREFIX_SIZE: usize = 3 * WORD;

/// Offset of the referent slot in reference objects.
pub const REFERENT_OFFSET: usize = PREFIX_SIZE;
/// Offset of the next-discovered link in reference objects.
pub const NEXT_DISCOVERED_OFFSET: usize = PREFIX_SIZE + WORD;
/// Offset of the last-access timestamp in reference objects.
pub const TIMESTAMP_OFFSET: usize = PREFIX_SIZE + 2 * WORD;
/// Offset of the notification queue slot in reference objects.
pub const QUEUE_OFFSET: usize = PREFIX_SIZE + 3 * WORD;
/// Size of the prefix of reference objects.
pub const REFERENCE_PREFIX_SIZE: usize = PREFIX_SIZE + 4 * WORD;

/// Alignment of every object.
pub const OBJECT_ALIGNMENT: usize = WORD;

const TAG_MASK: usize = 0b11;
const TAG_NORMAL: usize = 0b00;
const TAG_FORWARDED: usize = 0b01;
const KIND_SHIFT: usize = 2;
const KIND_MASK: usize = 0b11 << KIND_SHIFT;
const UNALIGNED_BIT: usize = 1 << 4;

/// Kind of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Ordinary object: strong slots plus payload.
    Plain,
    /// Reference whose referent is cleared as soon as it is only weakly reachable.
    WeakReference,
    /// Reference whose referent is kept while it was accessed recently enough.
    SoftReference,
}

impl ObjectKind {
    /// Whether this kind carries the deferred-liveness reference block.
    #[inline]
    pub fn is_reference(self) -> bool {
        !matches!(self, ObjectKind::Plain)
    }

    fn encode(self) -> usize {
        let bits = match self {
            ObjectKind::Plain => 0,
            ObjectKind::WeakReference => 1,
            ObjectKind::SoftReference => 2,
        };
        bits << KIND_SHIFT
    }

    fn decode(word: usize) -> Option<Self> {
        match (word & KIND_MASK) >> KIND_SHIFT {
            0 => Some(ObjectKind::Plain),
            1 => Some(ObjectKind::WeakReference),
            2 => Some(ObjectKind::SoftReference),
            _ => None,
        }
    }
}

/// Decoded header word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderState {
    /// A live, unmoved object.
    Normal {
        /// Object kind.
        kind: ObjectKind,
        /// Whether the object lives alone in an unaligned chunk.
        unaligned: bool,
    },
    /// The object was copied during the running cycle.
    Forwarded(Address),
    /// The word holds a debug fill pattern or garbage.
    Zapped(usize),
}

/// Encoder/decoder for header words.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader(usize);

impl ObjectHeader {
    /// Header of a freshly allocated object.
    pub fn new(kind: ObjectKind, unaligned: bool) -> Self {
        let mut word = TAG_NORMAL | kind.encode();
        if unaligned {
            word |= UNALIGNED_BIT;
        }
        Self(word)
    }

    /// Header recording that the object was copied to `target`.
    pub fn forwarded(target: Address) -> Self {
        debug_assert!(target.is_aligned_to(OBJECT_ALIGNMENT));
        Self(target.as_usize() | TAG_FORWARDED)
    }

    /// Wrap a raw header word.
    pub const fn from_word(word: usize) -> Self {
        Self(word)
    }

    /// The raw header word.
    pub const fn word(self) -> usize {
        self.0
    }

    /// Decode the header word.
    pub fn state(self) -> HeaderState {
        match self.0 & TAG_MASK {
            TAG_NORMAL => match ObjectKind::decode(self.0) {
                Some(kind) if self.0 & !(KIND_MASK | UNALIGNED_BIT) == 0 => HeaderState::Normal {
                    kind,
                    unaligned: self.0 & UNALIGNED_BIT != 0,
                },
                _ => HeaderState::Zapped(self.0),
            },
            TAG_FORWARDED => HeaderState::Forwarded(Address::from_usize(self.0 & !TAG_MASK)),
            _ => HeaderState::Zapped(self.0),
        }
    }

    /// Whether a pattern can never be mistaken for a live or forwarded header.
    pub fn is_zap_pattern(word: usize) -> bool {
        matches!(ObjectHeader(word).state(), HeaderState::Zapped(_))
    }
}

/// Allocation request: what the mutator wants to allocate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectShape {
    /// Object kind.
    pub kind: ObjectKind,
    /// Number of strong reference slots.
    pub ref_slots: usize,
    /// Number of raw payload bytes after the slots.
    pub payload_bytes: usize,
}

impl ObjectShape {
    /// A plain object.
    pub const fn plain(ref_slots: usize, payload_bytes: usize) -> Self {
        Self {
            kind: ObjectKind::Plain,
            ref_slots,
            payload_bytes,
        }
    }

    /// A weak reference object with no extra slots.
    pub const fn weak_reference() -> Self {
        Self {
            kind: ObjectKind::WeakReference,
            ref_slots: 0,
            payload_bytes: 0,
        }
    }

    /// A soft reference object with no extra slots.
    pub const fn soft_reference() -> Self {
        Self {
            kind: ObjectKind::SoftReference,
            ref_slots: 0,
            payload_bytes: 0,
        }
    }

    /// Total size in bytes, rounded up to the object alignment, or `None`
    /// when it does not fit in the address space.
    pub fn checked_size(&self) -> Option<usize> {
        let prefix = if self.kind.is_reference() {
            REFERENCE_PREFIX_SIZE
        } else {
            PREFIX_SIZE
        };
        let slots = self.ref_slots.checked_mul(WORD)?;
        let unaligned = prefix.checked_add(slots)?.checked_add(self.payload_bytes)?;
        checked_align_up(unaligned, OBJECT_ALIGNMENT)
    }

    /// Total size in bytes, rounded up to the object alignment. Saturates at
    /// `usize::MAX` for shapes no heap can hold.
    pub fn size(&self) -> usize {
        self.checked_size().unwrap_or(usize::MAX)
    }
}

/// A view of an object in the heap.
///
/// The view reads the object's memory directly; constructing one asserts that
/// the address is the start of an initialized object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Object(Address);

impl Object {
    /// View the object at `address`.
    ///
    /// # Safety
    /// `address` must be the start of an initialized object whose memory stays
    /// valid while the view is used.
    #[inline]
    pub unsafe fn new(address: Address) -> Self {
        Self(address)
    }

    /// Write a fresh object of the given shape at `address` and return it.
    ///
    /// # Safety
    /// `address` must be valid for `shape.size()` bytes and object aligned.
    pub unsafe fn initialize(address: Address, shape: &ObjectShape, unaligned: bool) -> Self {
        let size = shape.size();
        // SAFETY: caller guarantees the range is valid for writes
        unsafe {
            std::ptr::write_bytes(address.as_ptr::<u8>(), 0, size);
            address
                .add(HEADER_OFFSET)
                .store_word(ObjectHeader::new(shape.kind, unaligned).word());
            address.add(SIZE_OFFSET).store_word(size);
            address.add(SLOT_COUNT_OFFSET).store_word(shape.ref_slots);
        }
        Self(address)
    }

    /// Start address of the object.
    #[inline]
    pub fn address(self) -> Address {
        self.0
    }

    /// Decoded header.
    #[inline]
    pub fn header(self) -> HeaderState {
        // SAFETY: Object::new guarantees validity
        ObjectHeader::from_word(unsafe { self.0.load_word() }).state()
    }

    /// Raw header word.
    #[inline]
    pub fn header_word(self) -> usize {
        // SAFETY: Object::new guarantees validity
        unsafe { self.0.load_word() }
    }

    /// Replace the header with a forwarding header.
    #[inline]
    pub fn forward_to(self, target: Address) {
        // SAFETY: Object::new guarantees validity
        unsafe { self.0.store_word(ObjectHeader::forwarded(target).word()) }
    }

    /// Kind of a non-forwarded object.
    #[inline]
    pub fn kind(self) -> ObjectKind {
        match self.header() {
            HeaderState::Normal { kind, .. } => kind,
            _ => ObjectKind::Plain,
        }
    }

    /// Whether the header carries the unaligned-chunk flag.
    #[inline]
    pub fn is_unaligned(self) -> bool {
        matches!(self.header(), HeaderState::Normal { unaligned: true, .. })
    }

    /// Total size in bytes.
    #[inline]
    pub fn size(self) -> usize {
        // SAFETY: Object::new guarantees validity
        unsafe { self.0.add(SIZE_OFFSET).load_word() }
    }

    /// Number of strong reference slots.
    #[inline]
    pub fn slot_count(self) -> usize {
        // SAFETY: Object::new guarantees validity
        unsafe { self.0.add(SLOT_COUNT_OFFSET).load_word() }
    }

    /// End address (exclusive).
    #[inline]
    pub fn end(self) -> Address {
        self.0.add(self.size())
    }

    fn slots_offset(self) -> usize {
        if self.kind().is_reference() {
            REFERENCE_PREFIX_SIZE
        } else {
            PREFIX_SIZE
        }
    }

    /// Address of strong slot `index`.
    #[inline]
    pub fn slot_address(self, index: usize) -> Address {
        debug_assert!(index < self.slot_count());
        self.0.add(self.slots_offset() + index * WORD)
    }

    /// Start of the raw payload.
    #[inline]
    pub fn payload_address(self) -> Address {
        self.0.add(self.slots_offset() + self.slot_count() * WORD)
    }

    /// Number of raw payload bytes (including alignment padding).
    #[inline]
    pub fn payload_len(self) -> usize {
        self.end().offset_from(self.payload_address())
    }

    /// Call `f` with the address of every slot the collector must treat as a
    /// strong reference: the strong slots and, for references, the queue.
    pub fn for_each_strong_slot(self, mut f: impl FnMut(Address)) {
        if self.kind().is_reference() {
            f(self.0.add(QUEUE_OFFSET));
        }
        for index in 0..self.slot_count() {
            f(self.slot_address(index));
        }
    }

    /// Like [`Object::for_each_strong_slot`], plus the referent slot of
    /// reference objects. This is the set of slots the card invariant covers.
    pub fn for_each_reference_slot(self, mut f: impl FnMut(Address)) {
        if self.kind().is_reference() {
            f(self.0.add(REFERENT_OFFSET));
        }
        self.for_each_strong_slot(f);
    }

    /// Address of the referent slot of a reference object.
    #[inline]
    pub fn referent_slot(self) -> Address {
        debug_assert!(self.kind().is_reference());
        self.0.add(REFERENT_OFFSET)
    }

    /// Current referent of a reference object.
    #[inline]
    pub fn referent(self) -> Address {
        // SAFETY: reference objects always carry the referent word
        unsafe { self.referent_slot().load_ref() }
    }

    /// Next-discovered link of a reference object.
    #[inline]
    pub fn next_discovered(self) -> Address {
        // SAFETY: reference objects always carry the link word
        unsafe { self.0.add(NEXT_DISCOVERED_OFFSET).load_ref() }
    }

    /// Set the next-discovered link of a reference object.
    #[inline]
    pub fn set_next_discovered(self, next: Address) {
        // SAFETY: reference objects always carry the link word
        unsafe { self.0.add(NEXT_DISCOVERED_OFFSET).store_ref(next) }
    }

    /// Last-access timestamp of a reference object, in clock nanos.
    #[inline]
    pub fn timestamp(self) -> u64 {
        // SAFETY: reference objects always carry the timestamp word
        unsafe { self.0.add(TIMESTAMP_OFFSET).load_word() as u64 }
    }

    /// Set the last-access timestamp of a reference object.
    #[inline]
    pub fn set_timestamp(self, nanos: u64) {
        // SAFETY: reference objects always carry the timestamp word
        unsafe { self.0.add(TIMESTAMP_OFFSET).store_word(nanos as usize) }
    }

    /// Notification queue of a reference object (null when absent).
    #[inline]
    pub fn queue(self) -> Address {
        // SAFETY: reference objects always carry the queue word
        unsafe { self.0.add(QUEUE_OFFSET).load_ref() }
    }
}
