//! A best-fit heap with boundary tags and delayed coalescing.
//!
//! One region is mapped from the operating system when the heap is created
//! and carved into blocks for the rest of its life:
//!
//! ```text
//!   region start                                                region end
//!   ┌─────┬──────┬─────────────┬──────┬─────────────────┬──────┬─────┐
//!   │ pad │ hdr  │   payload   │ hdr  │  free   │ ftr   │  ... │ end │
//!   └─────┴──────┴─────────────┴──────┴─────────────────┴──────┴─────┘
//!     4 B   4 B                  4 B              4 B            4 B
//! ```
//!
//! The free list is implicit: allocation walks headers from the start of the
//! region and picks the smallest free block that fits, splitting off the
//! tail when there is room for another block. Freeing only flips status
//! bits; adjacent free blocks are merged when [`Heap::coalesce`] is called.
//!
//! ```rust,no_run
//! use tagheap::Heap;
//!
//! let mut heap = Heap::new(4096)?;
//! let ptr = heap.alloc(100)?;
//! heap.free(ptr.as_ptr())?;
//! heap.coalesce();
//! # Ok::<(), tagheap::HeapError>(())
//! ```
//!
//! The heap is not thread safe. [`global`] wraps a single process-wide heap
//! behind a lock for callers that want the init-once interface.

#![cfg_attr(not(test), no_std)]

mod block;
mod core;
mod dump;
pub mod global;
mod heap;
mod mmap;

pub use crate::block::{ALIGN, Header, MIN_BLOCK, WORD};
pub use crate::core::{Region, RegionProvider};
pub use crate::dump::{BlockInfo, Blocks, Dump, Usage};
pub use crate::heap::{Corruption, Heap, HeapError};
pub use crate::mmap::{Mmap, RegionError};
