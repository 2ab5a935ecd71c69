//! Collection accounting: counts, times and generation sizes.

/// Bookkeeping consulted by the collection policy.
///
/// Sizes are chunk bytes, i.e. what the generations hold on to, not the bytes
/// occupied by live objects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Accounting {
    /// Completed incremental collections
    pub incremental_count: u64,
    /// Completed complete collections
    pub complete_count: u64,
    /// Cumulative time spent in incremental collections
    pub incremental_nanos: u64,
    /// Cumulative time spent in complete collections
    pub complete_nanos: u64,
    /// Young generation chunk bytes when the last cycle started
    pub young_chunk_bytes_before: usize,
    /// Young generation chunk bytes when the last cycle ended
    pub young_chunk_bytes_after: usize,
    /// Old generation chunk bytes when the last cycle started
    pub old_chunk_bytes_before: usize,
    /// Old generation chunk bytes when the last cycle ended
    pub old_chunk_bytes_after: usize,
    /// Bytes promoted into the old generation by the last cycle
    pub last_promoted_bytes: usize,
    /// Bytes copied within the young generation by the last cycle
    pub last_copied_bytes: usize,
    /// Chunk bytes released by the last cycle
    pub last_collected_bytes: usize,
    /// Bytes promoted over the heap's lifetime
    pub total_promoted_bytes: u64,
    /// Bytes copied over the heap's lifetime
    pub total_copied_bytes: u64,
    /// Chunk bytes released over the heap's lifetime
    pub total_collected_bytes: u64,
}

impl Accounting {
    /// Total completed collections.
    pub fn collection_count(&self) -> u64 {
        self.incremental_count + self.complete_count
    }

    /// Total collection time.
    pub fn collection_nanos(&self) -> u64 {
        self.incremental_nanos + self.complete_nanos
    }

    /// Record generation sizes at the start of a cycle.
    pub fn before_collection(&mut self, young_chunk_bytes: usize, old_chunk_bytes: usize) {
        self.young_chunk_bytes_before = young_chunk_bytes;
        self.old_chunk_bytes_before = old_chunk_bytes;
        self.last_promoted_bytes = 0;
        self.last_copied_bytes = 0;
        self.last_collected_bytes = 0;
    }

    /// Count promoted bytes of the running cycle.
    pub fn record_promoted(&mut self, bytes: usize) {
        self.last_promoted_bytes += bytes;
        self.total_promoted_bytes += bytes as u64;
    }

    /// Count copied (young to young) bytes of the running cycle.
    pub fn record_copied(&mut self, bytes: usize) {
        self.last_copied_bytes += bytes;
        self.total_copied_bytes += bytes as u64;
    }

    /// Record the outcome of one scavenge.
    pub fn after_collection(
        &mut self,
        complete: bool,
        nanos: u64,
        young_chunk_bytes: usize,
        old_chunk_bytes: usize,
    ) {
        if complete {
            self.complete_count += 1;
            self.complete_nanos += nanos;
        } else {
            self.incremental_count += 1;
            self.incremental_nanos += nanos;
        }
        self.young_chunk_bytes_after = young_chunk_bytes;
        self.old_chunk_bytes_after = old_chunk_bytes;
        let before = self.young_chunk_bytes_before + self.old_chunk_bytes_before;
        let after = young_chunk_bytes + old_chunk_bytes;
        self.last_collected_bytes = before.saturating_sub(after);
        self.total_collected_bytes += self.last_collected_bytes as u64;
    }
}
