//! Heap verifier.
//!
//! Read-only consistency checks run around a cycle. The verifier never
//! dereferences a pointer it has not first found among the object starts of
//! the heap, so a corrupted slot is reported instead of followed.

use std::fmt;

use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::address::Address;
use crate::chunk::{self, ChunkKind, ChunkRef};
use crate::generation::Generations;
use crate::object::{HeaderState, OBJECT_ALIGNMENT, Object, PREFIX_SIZE, REFERENCE_PREFIX_SIZE};
use crate::remembered_set::{self, CardFailure};
use crate::space::{ChunkList, Space, SpaceId};

/// One verification failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyFailure {
    /// `prev`/`next` links of neighbouring chunks disagree
    #[error("{space}: chunk {chunk} has inconsistent list links")]
    BrokenLink {
        /// Space being walked
        space: SpaceId,
        /// Offending chunk
        chunk: Address,
    },

    /// The list's length does not match its chunks
    #[error("{space}: list records {recorded} chunks but {counted} are linked")]
    ListLength {
        /// Space being walked
        space: SpaceId,
        /// Recorded length
        recorded: usize,
        /// Linked chunks
        counted: usize,
    },

    /// A chunk's owner field names another space
    #[error("{space}: chunk {chunk} records owner {recorded:#x}")]
    WrongOwner {
        /// Space whose list holds the chunk
        space: SpaceId,
        /// Offending chunk
        chunk: Address,
        /// Raw owner value in the chunk header
        recorded: u16,
    },

    /// An aligned chunk on the unaligned list or the reverse
    #[error("{space}: chunk {chunk} is on the wrong list for its kind")]
    WrongKind {
        /// Space being walked
        space: SpaceId,
        /// Offending chunk
        chunk: Address,
    },

    /// `objects_start <= top <= end` does not hold
    #[error("chunk {chunk}: top {top} outside [{start}, {end}]")]
    TopOutOfBounds {
        /// Offending chunk
        chunk: Address,
        /// Start of the object area
        start: Address,
        /// Allocation pointer
        top: Address,
        /// End of the object area
        end: Address,
    },

    /// Object start is not word aligned
    #[error("object {object} is not aligned")]
    Misaligned {
        /// Object address
        object: Address,
    },

    /// Size word is not plausible
    #[error("object {object} has invalid size {size}")]
    InvalidSize {
        /// Object address
        object: Address,
        /// Recorded size
        size: usize,
    },

    /// Forwarded or zapped header outside a cycle
    #[error("object {object} has in-flight header {header:#x}")]
    InFlightHeader {
        /// Object address
        object: Address,
        /// Raw header word
        header: usize,
    },

    /// Looking up the enclosing chunk of the object gives another chunk
    #[error("object {object}: enclosing chunk lookup gives {found}, expected {expected}")]
    EnclosingChunk {
        /// Object address
        object: Address,
        /// Chunk that holds the object
        expected: Address,
        /// Chunk found by the lookup
        found: Address,
    },

    /// A slot references something that is not an object start
    #[error("slot {slot} of object {holder} references {target}, which is not an object")]
    DanglingPointer {
        /// Object holding the slot
        holder: Address,
        /// Slot address
        slot: Address,
        /// Referenced address
        target: Address,
    },

    /// A root references something that is not an object start
    #[error("root references {target}, which is not an object")]
    DanglingRoot {
        /// Referenced address
        target: Address,
    },

    /// A to-space still owns chunks outside a cycle
    #[error("to-space {space} is not empty")]
    ToSpaceNotEmpty {
        /// Offending space
        space: SpaceId,
    },

    /// Card table invariant violation
    #[error("{0}")]
    Card(CardFailure),
}

/// Result of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Every failure found
    pub failures: Vec<VerifyFailure>,
    /// Chunks walked
    pub chunks: usize,
    /// Objects walked
    pub objects: usize,
}

impl VerifyReport {
    /// Whether the heap is consistent.
    pub fn is_ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, failure: VerifyFailure) {
        #[cfg(feature = "gc_logging")]
        tracing::error!(target: "genscavenge::gc", %failure, "Heap verification failure");
        self.failures.push(failure);
    }
}

impl fmt::Display for VerifyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failure(s) in {} chunks and {} objects",
            self.failures.len(),
            self.chunks,
            self.objects
        )?;
        if let Some(first) = self.failures.first() {
            write!(f, "; first: {first}")?;
        }
        Ok(())
    }
}

/// Verify the whole heap at a consistent point (no cycle running).
///
/// `roots` are the current values of every root slot, pinned object and
/// pending reference.
pub fn verify_heap(generations: &Generations, chunk_size: usize, roots: &[Address]) -> VerifyReport {
    let mut report = VerifyReport::default();
    let mut objects: FxHashMap<Address, SpaceId> = FxHashMap::default();

    for space in generations.spaces() {
        if space.id().is_to_space() && !space.is_empty() {
            report.fail(VerifyFailure::ToSpaceNotEmpty { space: space.id() });
        }
        verify_space(space, chunk_size, &mut objects, &mut report);
    }

    let is_young = |target: Address| objects.get(&target).is_some_and(|s| s.is_young());

    for space in generations.spaces() {
        for chunk in space.chunks() {
            for object in chunk.objects() {
                if !objects.contains_key(&object.address()) {
                    // Objects after a broken one were never registered.
                    break;
                }
                object.for_each_reference_slot(|slot| {
                    // SAFETY: registered objects have readable slots
                    let target = unsafe { slot.load_ref() };
                    if !target.is_null() && !objects.contains_key(&target) {
                        report.fail(VerifyFailure::DanglingPointer {
                            holder: object.address(),
                            slot,
                            target,
                        });
                    }
                });
            }
            if !space.id().is_young() {
                for failure in remembered_set::verify_chunk_cards(chunk, is_young) {
                    report.fail(VerifyFailure::Card(failure));
                }
            }
        }
    }

    for root in roots {
        if !root.is_null() && !objects.contains_key(root) {
            report.fail(VerifyFailure::DanglingRoot { target: *root });
        }
    }

    report.objects = objects.len();
    report
}

fn verify_space(
    space: &Space,
    chunk_size: usize,
    objects: &mut FxHashMap<Address, SpaceId>,
    report: &mut VerifyReport,
) {
    verify_list(space.id(), space.aligned_chunks(), ChunkKind::Aligned, report);
    verify_list(space.id(), space.unaligned_chunks(), ChunkKind::Unaligned, report);

    for chunk in space.chunks() {
        report.chunks += 1;
        if chunk.space() != Some(space.id()) {
            report.fail(VerifyFailure::WrongOwner {
                space: space.id(),
                chunk: chunk.base(),
                recorded: chunk.raw_space(),
            });
        }
        if chunk.top() < chunk.objects_start() || chunk.top() > chunk.end() {
            report.fail(VerifyFailure::TopOutOfBounds {
                chunk: chunk.base(),
                start: chunk.objects_start(),
                top: chunk.top(),
                end: chunk.end(),
            });
            continue;
        }
        verify_objects(space.id(), chunk, chunk_size, objects, report);
    }
}

fn verify_list(space: SpaceId, list: &ChunkList, kind: ChunkKind, report: &mut VerifyReport) {
    let mut previous: Option<ChunkRef> = None;
    let mut counted = 0;
    for chunk in list.iter() {
        counted += 1;
        if chunk.prev() != previous {
            report.fail(VerifyFailure::BrokenLink {
                space,
                chunk: chunk.base(),
            });
        }
        if chunk.kind() != kind {
            report.fail(VerifyFailure::WrongKind {
                space,
                chunk: chunk.base(),
            });
        }
        previous = Some(chunk);
        if counted > list.len() {
            break;
        }
    }
    if list.last() != previous {
        if let Some(last) = list.last() {
            report.fail(VerifyFailure::BrokenLink {
                space,
                chunk: last.base(),
            });
        }
    }
    if counted != list.len() {
        report.fail(VerifyFailure::ListLength {
            space,
            recorded: list.len(),
            counted,
        });
    }
}

fn verify_objects(
    space: SpaceId,
    chunk: ChunkRef,
    chunk_size: usize,
    objects: &mut FxHashMap<Address, SpaceId>,
    report: &mut VerifyReport,
) {
    let unaligned_chunk = chunk.kind() == ChunkKind::Unaligned;
    let mut cursor = chunk.objects_start();
    while cursor < chunk.top() {
        if !cursor.is_aligned_to(OBJECT_ALIGNMENT) {
            report.fail(VerifyFailure::Misaligned { object: cursor });
            return;
        }
        // SAFETY: cursor lies in the allocated area of a live chunk
        let object = unsafe { Object::new(cursor) };
        let kind = match object.header() {
            HeaderState::Normal { kind, unaligned } => {
                if unaligned != unaligned_chunk {
                    report.fail(VerifyFailure::EnclosingChunk {
                        object: cursor,
                        expected: chunk.base(),
                        found: Address::NULL,
                    });
                    return;
                }
                kind
            }
            HeaderState::Forwarded(_) | HeaderState::Zapped(_) => {
                report.fail(VerifyFailure::InFlightHeader {
                    object: cursor,
                    header: object.header_word(),
                });
                return;
            }
        };

        let size = object.size();
        let prefix = if kind.is_reference() {
            REFERENCE_PREFIX_SIZE
        } else {
            PREFIX_SIZE
        };
        let fits = size % OBJECT_ALIGNMENT == 0
            && size >= prefix
            && object.slot_count() <= (size - prefix) / OBJECT_ALIGNMENT
            && size <= chunk.top().offset_from(cursor);
        if !fits {
            report.fail(VerifyFailure::InvalidSize {
                object: cursor,
                size,
            });
            return;
        }

        // SAFETY: the object has a normal header and lies in this chunk
        let found = unsafe { chunk::enclosing_chunk(object, chunk_size) };
        if found != chunk {
            report.fail(VerifyFailure::EnclosingChunk {
                object: cursor,
                expected: chunk.base(),
                found: found.base(),
            });
        }

        objects.insert(cursor, space);
        cursor = cursor.add(size);
    }
}
