//! The heap: allocation, release, resize, coalescing, and growth.
//!
//! A [`Heap`] owns everything one allocator instance needs (the backing
//! [`Segment`], the ten free-list heads, configuration, and counters) so
//! independent heaps can coexist and be tested in isolation. All block
//! bookkeeping lives inside the managed bytes themselves:
//!
//! ```text
//!  offset 0                                                     len-8
//!  ┌──────────┬──────────────────────────────────────────────┬──────────┐
//!  │ prologue │ blocks: [header][payload…][footer] …         │ epilogue │
//!  │ (8, a)   │                                              │ (0, a)   │
//!  └──────────┴──────────────────────────────────────────────┴──────────┘
//! ```
//!
//! The prologue (allocated, header only) and the zero-size epilogue bound
//! every neighbor lookup, so coalescing never needs an edge case: the word
//! before any block is either a footer or the prologue, the word after is
//! either a header or the epilogue, and both sentinels read as allocated.
//!
//! The heap is single-threaded by design: one logical caller drives it
//! through `&mut self`, operations run to completion, and each operation
//! observes the heap exactly as the previous one left it.

use std::fmt;

use log::{debug, trace};
use thiserror::Error;

use crate::check::{self, CheckReport};
use crate::config::HeapConfig;
use crate::free_list::{CLASS_COUNT, FreeListIndex, class_of};
use crate::layout::{
    BlockTag, MIN_BLOCK_SIZE, OVERHEAD, WORD, align_up, block_of, payload_of, read_tag, write_tag,
    write_footer,
};
use crate::segment::Segment;

/// Allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// The segment refused to grow; the heap is at its configured limit.
    #[error("out of memory: segment refused {requested} additional bytes")]
    OutOfMemory {
        /// Bytes the failed extension asked for.
        requested: usize,
    },
}

/// Operation counters for one heap instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful allocations.
    pub allocations: u64,
    /// Releases.
    pub releases: u64,
    /// Resizes.
    pub resizes: u64,
    /// Heap extensions performed.
    pub extensions: u64,
    /// Allocations that failed with out-of-memory.
    pub failed_allocations: u64,
}

/// A segregated-fit heap with boundary-tag coalescing.
pub struct Heap {
    segment: Segment,
    index: FreeListIndex,
    config: HeapConfig,
    stats: HeapStats,
}

impl Heap {
    /// Create a heap with the default configuration.
    ///
    /// Establishes the prologue, one free block spanning the initial
    /// range, and the epilogue. Fails when the initial range cannot be
    /// obtained within the configured limit.
    pub fn new() -> Result<Self, AllocError> {
        Self::with_config(HeapConfig::default())
    }

    /// Create a heap with the given configuration.
    ///
    /// `initial_size` is rounded up to 8 bytes and to the smallest viable
    /// heap (one minimum-size block plus the sentinels); use
    /// [`HeapConfig::validate`] to reject out-of-range values instead of
    /// normalizing them.
    pub fn with_config(config: HeapConfig) -> Result<Self, AllocError> {
        let initial = align_up(config.initial_size.max(MIN_BLOCK_SIZE + OVERHEAD));
        let mut segment = Segment::with_limit(config.limit);
        segment
            .extend(initial)
            .ok_or(AllocError::OutOfMemory { requested: initial })?;

        let bytes = segment.bytes_mut();
        write_tag(bytes, 0, BlockTag::new(WORD, true));

        let first = WORD;
        let tag = BlockTag::new(initial - OVERHEAD, false);
        write_tag(bytes, first, tag);
        write_footer(bytes, first, tag);
        write_tag(bytes, first + tag.size, BlockTag::new(0, true));

        let mut index = FreeListIndex::new();
        index.insert(bytes, first);

        debug!("heap initialized: {initial} bytes, limit {}", config.limit);
        Ok(Self {
            segment,
            index,
            config,
            stats: HeapStats::default(),
        })
    }

    /// Allocate `size` bytes and return the payload offset.
    ///
    /// A size of 0 is a benign no-op returning `Ok(None)`. The requested
    /// size is adjusted upward for tag overhead, 8-byte alignment, and the
    /// minimum block size; the returned payload offset is always a
    /// multiple of 8. `Err(OutOfMemory)` means no free block fit and the
    /// segment refused to grow.
    pub fn allocate(&mut self, size: usize) -> Result<Option<usize>, AllocError> {
        if size == 0 {
            return Ok(None);
        }

        // a request the segment could never hold fails fast, which also
        // keeps the size adjustment below from overflowing
        let asize = match size.checked_add(OVERHEAD) {
            Some(padded) if padded <= self.segment.limit() => {
                align_up(padded).max(MIN_BLOCK_SIZE)
            }
            _ => {
                self.stats.failed_allocations += 1;
                return Err(AllocError::OutOfMemory { requested: size });
            }
        };
        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => match self.extend_heap(asize) {
                Ok(block) => block,
                Err(err) => {
                    self.stats.failed_allocations += 1;
                    return Err(err);
                }
            },
        };

        self.place(block, asize);
        self.stats.allocations += 1;
        let payload = payload_of(block);
        trace!("allocate({size}) -> payload {payload} (block size {asize})");
        Ok(Some(payload))
    }

    /// Release the block owning `payload`.
    ///
    /// `payload` must be an offset previously returned by [`allocate`]
    /// (or [`resize`]) and not yet released. No double-release detection
    /// is performed; passing anything else silently corrupts the heap.
    ///
    /// [`allocate`]: Heap::allocate
    /// [`resize`]: Heap::resize
    pub fn release(&mut self, payload: usize) {
        let block = block_of(payload);
        let bytes = self.segment.bytes_mut();
        let old = read_tag(bytes, block);
        debug_assert!(old.allocated, "release of a block that is not allocated");

        let tag = BlockTag::new(old.size, false);
        write_tag(bytes, block, tag);
        write_footer(bytes, block, tag);
        self.index.insert(bytes, block);
        self.coalesce(block);
        self.stats.releases += 1;
        trace!("release(payload {payload}, block size {})", old.size);
    }

    /// Move the allocation at `payload` into a fresh block of `new_size`
    /// bytes, copying `min(new_size, old_block_size)` bytes of content,
    /// and release the old block. Returns the new payload offset.
    ///
    /// # Panics
    ///
    /// Failure to obtain the replacement block is fatal by policy: this
    /// method panics instead of returning an error, so callers never
    /// observe a partial-copy state. A resize to zero bytes yields no
    /// replacement block and is treated the same way.
    pub fn resize(&mut self, payload: usize, new_size: usize) -> usize {
        let old_block = block_of(payload);
        let old_size = read_tag(self.segment.bytes(), old_block).size;

        let new_payload = match self.allocate(new_size) {
            Ok(Some(new_payload)) => new_payload,
            Ok(None) => panic!("resize(payload {payload}) to zero bytes"),
            Err(err) => panic!("heap exhausted during resize(payload {payload}): {err}"),
        };

        let copy = new_size.min(old_size);
        self.segment
            .bytes_mut()
            .copy_within(payload..payload + copy, new_payload);
        self.release(payload);
        self.stats.resizes += 1;
        trace!("resize(payload {payload}, {new_size}) -> payload {new_payload}");
        new_payload
    }

    /// Run the consistency checker over the whole heap.
    ///
    /// Read-only and off the allocation fast path; `verbose` additionally
    /// records one entry per block walked. Violations are reported, never
    /// repaired; heap behavior after a detected corruption is undefined.
    pub fn check(&self, verbose: bool) -> CheckReport {
        check::check_heap(self, verbose)
    }

    /// First-fit search across the size classes.
    ///
    /// Classes are scanned from the smallest one whose bound covers
    /// `asize` upward, each head to tail; the unbounded class is always
    /// scanned last.
    fn find_fit(&self, asize: usize) -> Option<usize> {
        let bytes = self.segment.bytes();
        for class in class_of(asize)..CLASS_COUNT {
            for block in self.index.iter_class(bytes, class) {
                if read_tag(bytes, block).size >= asize {
                    return Some(block);
                }
            }
        }
        None
    }

    /// Carve `asize` bytes out of the free block at `block`.
    ///
    /// Splits when the remainder can stand as a block of its own;
    /// otherwise the whole block is allocated so no splinter below the
    /// minimum block size is ever produced. The block leaves its free
    /// list before its size field changes.
    fn place(&mut self, block: usize, asize: usize) {
        let size = read_tag(self.segment.bytes(), block).size;
        debug_assert!(size >= asize);
        self.index.remove(self.segment.bytes_mut(), block);

        let bytes = self.segment.bytes_mut();
        let remainder = size - asize;
        if remainder >= MIN_BLOCK_SIZE {
            let tag = BlockTag::new(asize, true);
            write_tag(bytes, block, tag);
            write_footer(bytes, block, tag);

            let rest = block + asize;
            let rest_tag = BlockTag::new(remainder, false);
            write_tag(bytes, rest, rest_tag);
            write_footer(bytes, rest, rest_tag);
            self.index.insert(bytes, rest);
        } else {
            let tag = BlockTag::new(size, true);
            write_tag(bytes, block, tag);
            write_footer(bytes, block, tag);
        }
    }

    /// Merge the free block at `block` with whichever neighbors are free,
    /// returning the resulting block's offset.
    ///
    /// The predecessor is found through its footer, the successor through
    /// its header, both in O(1); the sentinels make the heap edges read as
    /// allocated neighbors. Every participant leaves its free list before
    /// any size is rewritten.
    fn coalesce(&mut self, block: usize) -> usize {
        let bytes = self.segment.bytes();
        let tag = read_tag(bytes, block);
        let prev_tag = read_tag(bytes, block - WORD);
        let next_tag = read_tag(bytes, block + tag.size);

        match (prev_tag.allocated, next_tag.allocated) {
            (true, true) => block,
            (true, false) => {
                let next = block + tag.size;
                self.index.remove(self.segment.bytes_mut(), next);
                self.index.remove(self.segment.bytes_mut(), block);
                let merged = BlockTag::new(tag.size + next_tag.size, false);
                let bytes = self.segment.bytes_mut();
                write_tag(bytes, block, merged);
                write_footer(bytes, block, merged);
                self.index.insert(bytes, block);
                block
            }
            (false, true) => {
                let prev = block - prev_tag.size;
                self.index.remove(self.segment.bytes_mut(), block);
                self.index.remove(self.segment.bytes_mut(), prev);
                let merged = BlockTag::new(prev_tag.size + tag.size, false);
                let bytes = self.segment.bytes_mut();
                write_tag(bytes, prev, merged);
                write_footer(bytes, prev, merged);
                self.index.insert(bytes, prev);
                prev
            }
            (false, false) => {
                let next = block + tag.size;
                let prev = block - prev_tag.size;
                self.index.remove(self.segment.bytes_mut(), next);
                self.index.remove(self.segment.bytes_mut(), block);
                self.index.remove(self.segment.bytes_mut(), prev);
                let merged = BlockTag::new(prev_tag.size + tag.size + next_tag.size, false);
                let bytes = self.segment.bytes_mut();
                write_tag(bytes, prev, merged);
                write_footer(bytes, prev, merged);
                self.index.insert(bytes, prev);
                prev
            }
        }
    }

    /// Extend the heap when no existing free block fits.
    ///
    /// Requests `max(asize, growth_chunk)` bytes from the segment, reuses
    /// the old epilogue word as the new free block's header, appends a
    /// fresh epilogue, and immediately coalesces with a free block that
    /// may already sit at the old heap tail.
    fn extend_heap(&mut self, asize: usize) -> Result<usize, AllocError> {
        let grow = align_up(asize.max(self.config.growth_chunk));
        let old_len = self
            .segment
            .extend(grow)
            .ok_or(AllocError::OutOfMemory { requested: grow })?;

        let block = old_len - WORD;
        let bytes = self.segment.bytes_mut();
        let tag = BlockTag::new(grow, false);
        write_tag(bytes, block, tag);
        write_footer(bytes, block, tag);
        write_tag(bytes, block + grow, BlockTag::new(0, true));
        self.index.insert(bytes, block);

        self.stats.extensions += 1;
        debug!("heap extended by {grow} bytes to {}", self.segment.len());
        Ok(self.coalesce(block))
    }

    /// The caller-visible bytes of the allocated block owning `payload`.
    pub fn payload_slice(&self, payload: usize) -> &[u8] {
        let block = block_of(payload);
        let tag = read_tag(self.segment.bytes(), block);
        debug_assert!(tag.allocated, "payload access to a free block");
        &self.segment.bytes()[payload..block + tag.size - WORD]
    }

    /// The caller-visible bytes of the allocated block owning `payload`,
    /// mutably.
    pub fn payload_slice_mut(&mut self, payload: usize) -> &mut [u8] {
        let block = block_of(payload);
        let tag = read_tag(self.segment.bytes(), block);
        debug_assert!(tag.allocated, "payload access to a free block");
        &mut self.segment.bytes_mut()[payload..block + tag.size - WORD]
    }

    /// Iterate every block between the sentinels in address order.
    pub fn blocks(&self) -> Blocks<'_> {
        Blocks {
            bytes: self.segment.bytes(),
            offset: WORD,
        }
    }

    /// The backing segment.
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// The free-list index.
    pub fn free_lists(&self) -> &FreeListIndex {
        &self.index
    }

    /// This heap's configuration.
    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Operation counters.
    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    #[cfg(test)]
    pub(crate) fn raw_bytes_mut(&mut self) -> &mut [u8] {
        self.segment.bytes_mut()
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("len", &self.segment.len())
            .field("limit", &self.segment.limit())
            .field("stats", &self.stats)
            .finish()
    }
}

/// Address-order iterator over a heap's blocks, sentinels excluded.
pub struct Blocks<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl Iterator for Blocks<'_> {
    type Item = (usize, BlockTag);

    fn next(&mut self) -> Option<(usize, BlockTag)> {
        if self.offset + WORD > self.bytes.len() {
            return None;
        }
        let tag = read_tag(self.bytes, self.offset);
        if tag.size == 0 {
            return None;
        }
        let item = (self.offset, tag);
        self.offset += tag.size;
        Some(item)
    }
}
