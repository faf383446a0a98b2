//! # tagheap
//!
//! A user-level dynamic memory allocator: segregated free lists, first-fit
//! placement, and boundary-tag coalescing over a single growable byte
//! range. No allocator underneath: block headers, footers, and free-list
//! links are all encoded inside the managed bytes themselves.
//!
//! ## Design
//!
//! - **Arena + offsets**: the heap is one indexable byte buffer and every
//!   "pointer" is a `usize` offset into it, so the whole crate is safe
//!   Rust and a corrupted heap can at worst fail a bounds check.
//! - **One context value**: a [`Heap`] owns the buffer, the ten size-class
//!   heads, configuration, and counters. Independent heaps coexist, and
//!   every operation is a method taking `&mut self`.
//! - **Tagged payload**: a free block's first two payload words are its
//!   intrusive `next`/`prev` links; once allocated the same bytes are
//!   caller data. The allocated flag alone switches the interpretation.
//!
//! ```text
//!            one block
//!   ┌────────┬─────────────────────────────┬────────┐
//!   │ header │ payload                     │ footer │
//!   │ size|a │ (free: next, prev, …)       │ size|a │
//!   └────────┴─────────────────────────────┴────────┘
//!    8 bytes                                8 bytes
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tagheap::Heap;
//!
//! let mut heap = Heap::new().expect("initial range");
//!
//! let payload = heap.allocate(100).expect("room").expect("non-zero size");
//! heap.payload_slice_mut(payload)[..4].copy_from_slice(b"data");
//!
//! let payload = heap.resize(payload, 400);
//! assert_eq!(&heap.payload_slice(payload)[..4], b"data");
//!
//! heap.release(payload);
//! assert!(heap.check(false).is_consistent());
//! ```
//!
//! ## Concurrency
//!
//! None, deliberately: one logical caller at a time drives a heap through
//! `&mut self`, operations never suspend, and each observes the state
//! exactly as the previous operation left it. Wrap a [`Heap`] in your own
//! lock if you need sharing.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod check;
pub mod config;
pub mod free_list;
pub mod heap;
pub mod layout;
pub mod segment;

// Re-exports
pub use check::{BlockInfo, CheckReport, Violation, check_heap};
pub use config::{ConfigError, HeapConfig, HeapConfigBuilder};
pub use free_list::{CLASS_COUNT, FreeListIndex, class_of};
pub use heap::{AllocError, Blocks, Heap, HeapStats};
pub use layout::{BlockTag, MIN_BLOCK_SIZE, OVERHEAD, WORD, align_up};
pub use segment::Segment;

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
