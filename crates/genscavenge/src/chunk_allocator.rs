//! Chunk allocator
//!
//! Produces and consumes heap chunks. Aligned chunks are recycled through a
//! lock-free free list; unaligned chunks always go straight to the memory
//! source.
//!
//! ## Free list
//!
//! Pops may race with each other (mutators producing chunks) but pushes only
//! happen while the collector has exclusive access to the heap, so a popped
//! head cannot be pushed back while another pop is still looking at it.

use std::alloc::Layout;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use crossbeam_utils::{Backoff, CachePadded};

use crate::chunk::{
    self, AlignedLayout, ChunkHeader, ChunkKind, ChunkRef, UNALIGNED_CHUNK_ALIGNMENT,
    UnalignedLayout,
};
use crate::config::HeapConfig;
use crate::error::{GcError, Result};

/// Where chunk memory comes from.
pub trait MemorySource: Send + Sync {
    /// Reserve zero-initialized memory satisfying `layout`.
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>>;

    /// Return memory obtained from [`MemorySource::reserve`].
    ///
    /// # Safety
    /// `ptr` must come from `reserve` on this source with the same `layout`.
    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout);
}

/// The global allocator.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemorySource for SystemMemory {
    fn reserve(&self, layout: Layout) -> Option<NonNull<u8>> {
        // SAFETY: chunk layouts are never zero-sized
        NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) })
    }

    unsafe fn release(&self, ptr: NonNull<u8>, layout: Layout) {
        // SAFETY: caller passes memory from `reserve` with its layout
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) }
    }
}

#[derive(Debug, Clone, Copy)]
struct ZapPatterns {
    produce: usize,
    consume: usize,
}

/// Produces and recycles chunks.
pub struct ChunkAllocator {
    source: Arc<dyn MemorySource>,
    layout: AlignedLayout,
    min_heap_size: usize,
    zap: Option<ZapPatterns>,
    /// Head of the free list
    free_list: CachePadded<AtomicPtr<ChunkHeader>>,
    free_chunks: AtomicUsize,
    /// Bytes held by all live chunks, including the free list
    committed: AtomicUsize,
}

// SAFETY: the free list is only manipulated through atomics; chunk memory is
// owned by the allocator until handed out.
unsafe impl Send for ChunkAllocator {}
unsafe impl Sync for ChunkAllocator {}

impl ChunkAllocator {
    /// Create an allocator for the chunk size and zapping settings of `config`.
    pub fn new(config: &HeapConfig, source: Arc<dyn MemorySource>) -> Self {
        Self {
            source,
            layout: AlignedLayout::new(config.aligned_chunk_size),
            min_heap_size: config.min_heap_size,
            zap: config.zap_chunks.then_some(ZapPatterns {
                produce: config.produce_zap_pattern,
                consume: config.consume_zap_pattern,
            }),
            free_list: CachePadded::new(AtomicPtr::new(ptr::null_mut())),
            free_chunks: AtomicUsize::new(0),
            committed: AtomicUsize::new(0),
        }
    }

    /// Layout of aligned chunks.
    pub fn aligned_layout(&self) -> &AlignedLayout {
        &self.layout
    }

    /// Bytes held by live chunks (in spaces or on the free list).
    pub fn committed_bytes(&self) -> usize {
        self.committed.load(Ordering::Relaxed)
    }

    /// Number of chunks waiting on the free list.
    pub fn free_chunk_count(&self) -> usize {
        self.free_chunks.load(Ordering::Relaxed)
    }

    fn aligned_memory_layout(&self) -> Result<Layout> {
        Layout::from_size_align(self.layout.chunk_size, self.layout.chunk_size).map_err(|_| {
            GcError::OutOfMemory {
                requested: self.layout.chunk_size,
            }
        })
    }

    /// Hand out a fresh aligned chunk owned by no space.
    pub fn produce_aligned_chunk(&self) -> Result<ChunkRef> {
        let chunk = match self.pop_free() {
            Some(chunk) => {
                chunk.reset();
                chunk
            }
            None => {
                let layout = self.aligned_memory_layout()?;
                let memory = self.source.reserve(layout).ok_or(GcError::OutOfMemory {
                    requested: layout.size(),
                })?;
                self.committed.fetch_add(layout.size(), Ordering::Relaxed);
                // SAFETY: fresh memory of the chunk size, aligned to it
                unsafe { chunk::initialize_aligned(memory, &self.layout) }
            }
        };
        if let Some(zap) = self.zap {
            chunk.zap_free_area(zap.produce);
        }

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "genscavenge::gc",
            chunk = %chunk.base(),
            committed = self.committed_bytes(),
            "Produced aligned chunk"
        );

        Ok(chunk)
    }

    /// Take back an aligned chunk that no space owns any more.
    ///
    /// Must only be called while the collector has exclusive heap access.
    pub fn consume_aligned_chunk(&self, chunk: ChunkRef) {
        debug_assert_eq!(chunk.kind(), ChunkKind::Aligned);
        debug_assert!(chunk.space().is_none());
        if let Some(zap) = self.zap {
            chunk.zap_all(zap.consume);
        }
        if self.committed_bytes() <= self.min_heap_size {
            chunk.reset();
            self.push_free(chunk);
        } else {
            self.release_aligned(chunk);
        }
    }

    /// Hand out an unaligned chunk sized for one object of `object_size` bytes.
    pub fn produce_unaligned_chunk(&self, object_size: usize) -> Result<ChunkRef> {
        let layout = UnalignedLayout::new(object_size).ok_or(GcError::OutOfMemory {
            requested: object_size,
        })?;
        let memory_layout = Layout::from_size_align(layout.chunk_size, UNALIGNED_CHUNK_ALIGNMENT)
            .map_err(|_| GcError::OutOfMemory {
                requested: object_size,
            })?;
        let memory = self
            .source
            .reserve(memory_layout)
            .ok_or(GcError::OutOfMemory {
                requested: memory_layout.size(),
            })?;
        self.committed
            .fetch_add(memory_layout.size(), Ordering::Relaxed);
        // SAFETY: fresh memory of the computed layout
        let chunk = unsafe { chunk::initialize_unaligned(memory, object_size, &layout) };

        #[cfg(feature = "gc_logging")]
        tracing::trace!(
            target: "genscavenge::gc",
            chunk = %chunk.base(),
            object_size,
            "Produced unaligned chunk"
        );

        Ok(chunk)
    }

    /// Release an unaligned chunk to the memory source.
    pub fn consume_unaligned_chunk(&self, chunk: ChunkRef) {
        debug_assert_eq!(chunk.kind(), ChunkKind::Unaligned);
        if let Some(zap) = self.zap {
            chunk.zap_all(zap.consume);
        }
        self.release_unaligned(chunk);
    }

    /// Take back either kind of chunk.
    pub fn consume_chunk(&self, chunk: ChunkRef) {
        match chunk.kind() {
            ChunkKind::Aligned => self.consume_aligned_chunk(chunk),
            ChunkKind::Unaligned => self.consume_unaligned_chunk(chunk),
        }
    }

    /// Release a chunk to the memory source without recycling.
    pub(crate) fn release_chunk(&self, chunk: ChunkRef) {
        match chunk.kind() {
            ChunkKind::Aligned => self.release_aligned(chunk),
            ChunkKind::Unaligned => self.release_unaligned(chunk),
        }
    }

    /// Release every chunk on the free list.
    pub fn release_free_list(&self) {
        while let Some(chunk) = self.pop_free() {
            self.release_aligned(chunk);
        }
    }

    fn release_aligned(&self, chunk: ChunkRef) {
        let size = chunk.size();
        let Ok(layout) = Layout::from_size_align(size, size) else {
            return;
        };
        self.committed.fetch_sub(size, Ordering::Relaxed);
        // SAFETY: aligned chunks are reserved with exactly this layout
        unsafe {
            self.source
                .release(NonNull::new_unchecked(chunk.as_ptr().cast()), layout)
        };
    }

    fn release_unaligned(&self, chunk: ChunkRef) {
        let size = chunk.size();
        let Ok(layout) = Layout::from_size_align(size, UNALIGNED_CHUNK_ALIGNMENT) else {
            return;
        };
        self.committed.fetch_sub(size, Ordering::Relaxed);
        // SAFETY: unaligned chunks are reserved with exactly this layout
        unsafe {
            self.source
                .release(NonNull::new_unchecked(chunk.as_ptr().cast()), layout)
        };
    }

    fn push_free(&self, chunk: ChunkRef) {
        let backoff = Backoff::new();
        let mut head = self.free_list.load(Ordering::Relaxed);
        loop {
            chunk.set_free_next(head);
            match self.free_list.compare_exchange_weak(
                head,
                chunk.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
        self.free_chunks.fetch_add(1, Ordering::Relaxed);
    }

    fn pop_free(&self) -> Option<ChunkRef> {
        let backoff = Backoff::new();
        let mut head = self.free_list.load(Ordering::Acquire);
        loop {
            // SAFETY: free-list entries are live chunks owned by the allocator
            let chunk = unsafe { ChunkRef::from_nullable(head) }?;
            let next = chunk.free_next();
            match self.free_list.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.free_chunks.fetch_sub(1, Ordering::Relaxed);
                    chunk.set_free_next(ptr::null_mut());
                    return Some(chunk);
                }
                Err(current) => {
                    head = current;
                    backoff.spin();
                }
            }
        }
    }
}

impl Drop for ChunkAllocator {
    fn drop(&mut self) {
        self.release_free_list();
    }
}

impl std::fmt::Debug for ChunkAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkAllocator")
            .field("chunk_size", &self.layout.chunk_size)
            .field("committed", &self.committed_bytes())
            .field("free_chunks", &self.free_chunk_count())
            .finish()
    }
}
