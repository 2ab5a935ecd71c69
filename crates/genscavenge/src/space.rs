//! Spaces: named partitions of the heap owning doubly linked chunk lists.

use std::fmt;

use crate::address::Address;
use crate::chunk::{ChunkKind, ChunkRef};

/// Identity of a space.
///
/// Survivor spaces come in from/to pairs indexed by age; the old generation
/// has a single from/to pair. To-spaces only hold chunks while a cycle runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SpaceId {
    /// Where the mutator allocates.
    Eden,
    /// Active survivor space of the given age.
    SurvivorFrom(u8),
    /// Survivor copy destination of the given age.
    SurvivorTo(u8),
    /// Active old generation space.
    OldFrom,
    /// Old generation copy destination.
    OldTo,
}

const SURVIVOR_BASE: u16 = 16;

impl SpaceId {
    /// Compact encoding stored in chunk headers.
    pub fn encode(self) -> u16 {
        match self {
            SpaceId::Eden => 0,
            SpaceId::OldFrom => 1,
            SpaceId::OldTo => 2,
            SpaceId::SurvivorFrom(age) => SURVIVOR_BASE + 2 * age as u16,
            SpaceId::SurvivorTo(age) => SURVIVOR_BASE + 2 * age as u16 + 1,
        }
    }

    /// Inverse of [`SpaceId::encode`].
    pub fn decode(value: u16) -> Option<Self> {
        match value {
            0 => Some(SpaceId::Eden),
            1 => Some(SpaceId::OldFrom),
            2 => Some(SpaceId::OldTo),
            v if v >= SURVIVOR_BASE => {
                let age = u8::try_from((v - SURVIVOR_BASE) / 2).ok()?;
                if (v - SURVIVOR_BASE) % 2 == 0 {
                    Some(SpaceId::SurvivorFrom(age))
                } else {
                    Some(SpaceId::SurvivorTo(age))
                }
            }
            _ => None,
        }
    }

    /// Whether the space belongs to the young generation.
    #[inline]
    pub fn is_young(self) -> bool {
        matches!(
            self,
            SpaceId::Eden | SpaceId::SurvivorFrom(_) | SpaceId::SurvivorTo(_)
        )
    }

    /// Whether the space is a copy destination.
    #[inline]
    pub fn is_to_space(self) -> bool {
        matches!(self, SpaceId::SurvivorTo(_) | SpaceId::OldTo)
    }
}

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpaceId::Eden => write!(f, "eden"),
            SpaceId::SurvivorFrom(age) => write!(f, "survivor-from-{age}"),
            SpaceId::SurvivorTo(age) => write!(f, "survivor-to-{age}"),
            SpaceId::OldFrom => write!(f, "old-from"),
            SpaceId::OldTo => write!(f, "old-to"),
        }
    }
}

/// A doubly linked list of chunks threaded through the chunk headers.
#[derive(Debug, Default)]
pub struct ChunkList {
    first: Option<ChunkRef>,
    last: Option<ChunkRef>,
    len: usize,
}

impl ChunkList {
    /// First chunk.
    pub fn first(&self) -> Option<ChunkRef> {
        self.first
    }

    /// Last chunk.
    pub fn last(&self) -> Option<ChunkRef> {
        self.last
    }

    /// Number of chunks.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the list holds no chunk.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate from first to last. The successor is read before a chunk is
    /// yielded, so the yielded chunk may be unlinked by the caller.
    pub fn iter(&self) -> ChunkIter {
        ChunkIter { next: self.first }
    }

    fn push_back(&mut self, chunk: ChunkRef) {
        chunk.set_prev(self.last);
        chunk.set_next(None);
        match self.last {
            Some(last) => last.set_next(Some(chunk)),
            None => self.first = Some(chunk),
        }
        self.last = Some(chunk);
        self.len += 1;
    }

    fn remove(&mut self, chunk: ChunkRef) {
        let prev = chunk.prev();
        let next = chunk.next();
        match prev {
            Some(prev) => prev.set_next(next),
            None => self.first = next,
        }
        match next {
            Some(next) => next.set_prev(prev),
            None => self.last = prev,
        }
        chunk.set_prev(None);
        chunk.set_next(None);
        self.len -= 1;
    }

    fn append(&mut self, other: ChunkList) {
        let Some(other_first) = other.first else {
            return;
        };
        match self.last {
            Some(last) => {
                last.set_next(Some(other_first));
                other_first.set_prev(Some(last));
            }
            None => self.first = Some(other_first),
        }
        self.last = other.last;
        self.len += other.len;
    }
}

/// Iterator over a [`ChunkList`].
pub struct ChunkIter {
    next: Option<ChunkRef>,
}

impl Iterator for ChunkIter {
    type Item = ChunkRef;

    fn next(&mut self) -> Option<ChunkRef> {
        let chunk = self.next?;
        self.next = chunk.next();
        Some(chunk)
    }
}

/// A space: aligned and unaligned chunk lists plus an identity that every
/// owned chunk records in its header.
#[derive(Debug)]
pub struct Space {
    id: SpaceId,
    aligned: ChunkList,
    unaligned: ChunkList,
}

impl Space {
    /// An empty space.
    pub fn new(id: SpaceId) -> Self {
        Self {
            id,
            aligned: ChunkList::default(),
            unaligned: ChunkList::default(),
        }
    }

    /// Identity.
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Aligned chunks in allocation order.
    pub fn aligned_chunks(&self) -> &ChunkList {
        &self.aligned
    }

    /// Unaligned chunks in promotion order.
    pub fn unaligned_chunks(&self) -> &ChunkList {
        &self.unaligned
    }

    /// All chunks, aligned first.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkRef> {
        self.aligned.iter().chain(self.unaligned.iter())
    }

    /// Whether the space owns no chunk.
    pub fn is_empty(&self) -> bool {
        self.aligned.is_empty() && self.unaligned.is_empty()
    }

    /// Link `chunk` at the end of the matching list and take ownership.
    pub fn append_chunk(&mut self, chunk: ChunkRef) {
        debug_assert!(chunk.space().is_none(), "chunk already owned");
        chunk.set_space(Some(self.id));
        match chunk.kind() {
            ChunkKind::Aligned => self.aligned.push_back(chunk),
            ChunkKind::Unaligned => self.unaligned.push_back(chunk),
        }
    }

    /// Unlink `chunk` from this space.
    pub fn extract_chunk(&mut self, chunk: ChunkRef) {
        debug_assert_eq!(chunk.space(), Some(self.id));
        match chunk.kind() {
            ChunkKind::Aligned => self.aligned.remove(chunk),
            ChunkKind::Unaligned => self.unaligned.remove(chunk),
        }
        chunk.set_space(None);
    }

    /// Take every chunk of `other`, re-tagging them with this space's id.
    pub fn absorb(&mut self, other: &mut Space) {
        for chunk in other.chunks() {
            chunk.set_space(Some(self.id));
        }
        self.aligned.append(std::mem::take(&mut other.aligned));
        self.unaligned.append(std::mem::take(&mut other.unaligned));
    }

    /// Detach all chunks, leaving the space empty. The chunks keep their
    /// links to each other but no longer belong to any space.
    pub fn take_chunks(&mut self) -> Vec<ChunkRef> {
        let chunks: Vec<ChunkRef> = self.chunks().collect();
        for chunk in &chunks {
            chunk.set_space(None);
            chunk.set_prev(None);
            chunk.set_next(None);
        }
        self.aligned = ChunkList::default();
        self.unaligned = ChunkList::default();
        chunks
    }

    /// Bump-allocate in the last aligned chunk.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        self.aligned.last()?.allocate(size)
    }

    /// Bytes reserved by the owned chunks.
    pub fn chunk_bytes(&self) -> usize {
        self.chunks().map(ChunkRef::size).sum()
    }

    /// Bytes occupied by objects.
    pub fn used_bytes(&self) -> usize {
        self.chunks().map(ChunkRef::used_bytes).sum()
    }
}
