//! Heap consistency checking.
//!
//! A read-only diagnostic pass over a whole [`Heap`], invoked on demand so
//! the allocation fast path stays untouched. The pass verifies:
//!
//! - sentinel shape: prologue of one allocated word, zero-size allocated
//!   epilogue in the final word,
//! - every block's header and footer agree and its payload is 8-byte
//!   aligned,
//! - the linear walk visits each block once and terminates exactly at the
//!   epilogue,
//! - no two adjacent blocks are both free,
//! - free-list membership in both directions: every list member is free
//!   and filed under its own size class, and every free block is reachable
//!   from exactly one bucket.
//!
//! Findings are collected as [`Violation`] values (all of them, never
//! stopping at the first) and nothing is repaired. Rendering the report
//! is the caller's concern; violations carry `Display` implementations
//! and the report is plain data.

use std::collections::BTreeMap;

use log::warn;
use thiserror::Error;

use crate::free_list::{CLASS_COUNT, class_of};
use crate::heap::Heap;
use crate::layout::{BlockTag, MIN_BLOCK_SIZE, WORD, footer_of, payload_of, read_tag};

/// A single consistency violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Violation {
    /// The prologue is not one allocated word.
    #[error("bad prologue header")]
    BadPrologue,
    /// The walk reached a zero-size tag that is not a well-formed epilogue
    /// in the final word.
    #[error("bad epilogue header at offset {offset}")]
    BadEpilogue {
        /// Where the zero-size tag was found.
        offset: usize,
    },
    /// A block size that cannot be walked over: unaligned, below the
    /// minimum, or running past the segment.
    #[error("block at offset {block} has unwalkable size {size}")]
    InvalidBlockSize {
        /// Block offset.
        block: usize,
        /// The offending size.
        size: usize,
    },
    /// Header and footer of one block disagree.
    #[error("header and footer disagree for block at offset {block}")]
    TagMismatch {
        /// Block offset.
        block: usize,
    },
    /// A payload address that is not a multiple of 8.
    #[error("payload at offset {payload} is not 8-byte aligned")]
    MisalignedPayload {
        /// Payload offset.
        payload: usize,
    },
    /// The linear walk ran off the segment without meeting the epilogue.
    #[error("heap walk left the segment at offset {offset}")]
    WalkEscaped {
        /// Offset at which the walk gave up.
        offset: usize,
    },
    /// Two neighboring blocks are both free; coalescing missed them.
    #[error("adjacent free blocks at offsets {first} and {second}")]
    AdjacentFree {
        /// Lower block offset.
        first: usize,
        /// Higher block offset.
        second: usize,
    },
    /// A free list holds a block whose allocated flag is set.
    #[error("allocated block at offset {block} found in size class {class}")]
    AllocatedInList {
        /// The class list the block was found in.
        class: usize,
        /// Block offset.
        block: usize,
    },
    /// A list member filed under a class its size does not map to.
    #[error("block at offset {block} classifies as {expected} but is linked into class {found}")]
    WrongClass {
        /// Block offset.
        block: usize,
        /// Class its size maps to.
        expected: usize,
        /// Class list it was found in.
        found: usize,
    },
    /// A list link pointing outside the segment.
    #[error("size class {class} links to offset {block} outside the heap")]
    StrayListEntry {
        /// The class with the stray link.
        class: usize,
        /// The out-of-range offset.
        block: usize,
    },
    /// A free list that never terminates.
    #[error("size class {class} list does not terminate")]
    ListCycle {
        /// The cyclic class.
        class: usize,
    },
    /// A free block in the heap that no bucket reaches.
    #[error("free block at offset {block} is missing from its size class list")]
    MissingFromList {
        /// Block offset.
        block: usize,
    },
    /// A block reachable from more than one list position.
    #[error("block at offset {block} appears {count} times across the size class lists")]
    DuplicateListEntry {
        /// Block offset.
        block: usize,
        /// How many list positions reach it.
        count: usize,
    },
}

/// Per-block detail recorded when checking verbosely.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Block offset.
    pub offset: usize,
    /// The block's header tag.
    pub tag: BlockTag,
    /// The block's footer tag, when it lies inside the segment.
    pub footer: Option<BlockTag>,
}

/// Outcome of one checker pass.
#[derive(Debug, Default)]
pub struct CheckReport {
    /// Every violation found, in discovery order.
    pub violations: Vec<Violation>,
    /// Per-block records; populated only for verbose checks.
    pub blocks: Vec<BlockInfo>,
    /// Free blocks seen on the linear walk.
    pub free_blocks: usize,
    /// Allocated blocks seen on the linear walk.
    pub allocated_blocks: usize,
}

impl CheckReport {
    /// Whether the pass found nothing wrong.
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Run the consistency pass over `heap`.
///
/// Never mutates, never repairs, never stops at the first finding.
pub fn check_heap(heap: &Heap, verbose: bool) -> CheckReport {
    let bytes = heap.segment().bytes();
    let len = bytes.len();
    let mut report = CheckReport::default();

    let prologue = read_tag(bytes, 0);
    if prologue.size != WORD || !prologue.allocated {
        report.violations.push(Violation::BadPrologue);
    }

    let free_offsets = walk_blocks(bytes, len, verbose, &mut report);
    check_free_lists(heap, bytes, len, &free_offsets, &mut report);

    if !report.violations.is_empty() {
        warn!("heap check found {} violation(s)", report.violations.len());
    }
    report
}

/// Linear walk from the prologue to the epilogue. Returns the offsets of
/// the free blocks encountered, for the membership cross-check.
fn walk_blocks(bytes: &[u8], len: usize, verbose: bool, report: &mut CheckReport) -> Vec<usize> {
    let mut free_offsets = Vec::new();
    let mut offset = WORD;
    let mut prev_free = false;
    let mut prev_offset = 0;

    while offset + WORD <= len {
        let tag = read_tag(bytes, offset);
        if tag.size == 0 {
            if !tag.allocated || offset != len - WORD {
                report.violations.push(Violation::BadEpilogue { offset });
            }
            return free_offsets;
        }

        let walkable =
            tag.size % WORD == 0 && tag.size >= MIN_BLOCK_SIZE && offset + tag.size + WORD <= len;
        let footer = if walkable {
            Some(read_tag(bytes, footer_of(offset, tag.size)))
        } else {
            None
        };
        if verbose {
            report.blocks.push(BlockInfo { offset, tag, footer });
        }
        if !walkable {
            report.violations.push(Violation::InvalidBlockSize {
                block: offset,
                size: tag.size,
            });
            return free_offsets;
        }

        if footer != Some(tag) {
            report.violations.push(Violation::TagMismatch { block: offset });
        }
        if payload_of(offset) % WORD != 0 {
            report.violations.push(Violation::MisalignedPayload {
                payload: payload_of(offset),
            });
        }
        if prev_free && !tag.allocated {
            report.violations.push(Violation::AdjacentFree {
                first: prev_offset,
                second: offset,
            });
        }

        if tag.allocated {
            report.allocated_blocks += 1;
        } else {
            report.free_blocks += 1;
            free_offsets.push(offset);
        }
        prev_free = !tag.allocated;
        prev_offset = offset;
        offset += tag.size;
    }

    report.violations.push(Violation::WalkEscaped { offset });
    free_offsets
}

/// Walk every bucket and cross-check membership against the free blocks
/// the linear walk found.
fn check_free_lists(
    heap: &Heap,
    bytes: &[u8],
    len: usize,
    free_offsets: &[usize],
    report: &mut CheckReport,
) {
    // a list longer than the heap can hold blocks must be cyclic
    let step_cap = len / MIN_BLOCK_SIZE + 1;
    let mut membership: BTreeMap<usize, usize> = BTreeMap::new();

    for class in 0..CLASS_COUNT {
        let mut steps = 0;
        for block in heap.free_lists().iter_class(bytes, class) {
            steps += 1;
            if steps > step_cap {
                report.violations.push(Violation::ListCycle { class });
                break;
            }
            if block < WORD || block + MIN_BLOCK_SIZE > len {
                report
                    .violations
                    .push(Violation::StrayListEntry { class, block });
                break;
            }

            let tag = read_tag(bytes, block);
            if tag.allocated {
                report
                    .violations
                    .push(Violation::AllocatedInList { class, block });
            }
            let expected = class_of(tag.size);
            if expected != class {
                report.violations.push(Violation::WrongClass {
                    block,
                    expected,
                    found: class,
                });
            }
            *membership.entry(block).or_insert(0) += 1;
        }
    }

    for &block in free_offsets {
        match membership.get(&block) {
            Some(&1) => {}
            None => report.violations.push(Violation::MissingFromList { block }),
            Some(&count) => report
                .violations
                .push(Violation::DuplicateListEntry { block, count }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HeapConfig;
    use crate::layout::{block_of, write_tag};

    fn heap_with_two_allocations() -> (Heap, usize, usize) {
        let config = HeapConfig::builder()
            .initial_size(4096)
            .growth_chunk(4096)
            .limit(1 << 20)
            .build()
            .unwrap();
        let mut heap = Heap::with_config(config).unwrap();
        let a = heap.allocate(100).unwrap().unwrap();
        let b = heap.allocate(200).unwrap().unwrap();
        (heap, a, b)
    }

    #[test]
    fn clean_heap_reports_no_violations() {
        let (heap, _, _) = heap_with_two_allocations();
        let report = heap.check(false);
        assert!(report.is_consistent());
        assert_eq!(report.allocated_blocks, 2);
        assert_eq!(report.free_blocks, 1);
        assert!(report.blocks.is_empty());
    }

    #[test]
    fn verbose_check_records_every_block() {
        let (heap, _, _) = heap_with_two_allocations();
        let report = heap.check(true);
        assert_eq!(report.blocks.len(), 3);
        assert!(report.blocks.iter().all(|info| info.footer == Some(info.tag)));
    }

    #[test]
    fn footer_corruption_is_reported() {
        let (mut heap, _, _) = heap_with_two_allocations();
        let (free_block, tag) = heap
            .blocks()
            .find(|(_, tag)| !tag.allocated)
            .unwrap();
        let footer = footer_of(free_block, tag.size);
        write_tag(heap.raw_bytes_mut(), footer, BlockTag::new(tag.size + 8, false));

        let report = heap.check(false);
        assert!(report
            .violations
            .contains(&Violation::TagMismatch { block: free_block }));
    }

    #[test]
    fn allocated_flag_inside_a_bucket_is_reported() {
        let (mut heap, _, _) = heap_with_two_allocations();
        let (free_block, tag) = heap
            .blocks()
            .find(|(_, tag)| !tag.allocated)
            .unwrap();
        // flip the flag without touching the list
        let flipped = BlockTag::new(tag.size, true);
        write_tag(heap.raw_bytes_mut(), free_block, flipped);
        write_tag(
            heap.raw_bytes_mut(),
            footer_of(free_block, tag.size),
            flipped,
        );

        let report = heap.check(false);
        assert!(report.violations.iter().any(|violation| matches!(
            violation,
            Violation::AllocatedInList { block, .. } if *block == free_block
        )));
    }

    #[test]
    fn clobbered_epilogue_is_reported() {
        let (mut heap, _, _) = heap_with_two_allocations();
        let epilogue = heap.segment().len() - WORD;
        write_tag(heap.raw_bytes_mut(), epilogue, BlockTag::new(0, false));

        let report = heap.check(false);
        assert!(report
            .violations
            .contains(&Violation::BadEpilogue { offset: epilogue }));
    }

    #[test]
    fn uncoalesced_neighbors_are_reported() {
        let (mut heap, a, b) = heap_with_two_allocations();
        // hand-mark both blocks free, bypassing release and the index
        for payload in [a, b] {
            let block = block_of(payload);
            let tag = read_tag(heap.segment().bytes(), block);
            let freed = BlockTag::new(tag.size, false);
            write_tag(heap.raw_bytes_mut(), block, freed);
            write_tag(heap.raw_bytes_mut(), footer_of(block, tag.size), freed);
        }

        let report = heap.check(false);
        assert!(report.violations.contains(&Violation::AdjacentFree {
            first: block_of(a),
            second: block_of(b),
        }));
        assert!(report
            .violations
            .contains(&Violation::MissingFromList { block: block_of(a) }));
    }

    #[test]
    fn corrupt_prologue_is_reported() {
        let (mut heap, _, _) = heap_with_two_allocations();
        write_tag(heap.raw_bytes_mut(), 0, BlockTag::new(WORD, false));
        let report = heap.check(false);
        assert!(report.violations.contains(&Violation::BadPrologue));
    }
}
