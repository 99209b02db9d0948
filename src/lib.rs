//! # rmalloc - An Implicit Free List Allocator
//!
//! This crate provides a **boundary-tag allocator**: it manages one
//! contiguous, growable region of raw memory and serves allocate, free
//! and resize requests out of it, keeping all of its bookkeeping inside
//! the region itself.
//!
//! ## Overview
//!
//! The region is a sequence of variable-size blocks, each tagged as
//! allocated or free, fenced by two permanently allocated sentinels:
//!
//! ```text
//!   Heap Layout:
//!
//!   ┌──────────────────────────────────────────────────────────────────────┐
//!   │                          MANAGED REGION                              │
//!   │                                                                      │
//!   │  ┌───┬──────────┬────────────┬──────────┬──────────────────┬─────┐   │
//!   │  │pad│ prologue │  block A   │  block B │     block C      │ epi │   │
//!   │  │   │  (8|1)   │ allocated  │   free   │    allocated     │(0|1)│   │
//!   │  └───┴──────────┴────────────┴──────────┴──────────────────┴─────┘   │
//!   │  ▲                                                              ▲    │
//!   │  │                                                              │    │
//!   │  low bound                                               high bound  │
//!   │                                                      (grows via sbrk)│
//!   └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every block carries the same 4-byte tag at both ends, so both of its
//! neighbours can be reached in O(1):
//!
//! ```text
//!   Single Block:
//!   ┌──────────┬──────────────────────────────────────┬──────────┐
//!   │  header  │               payload                │  footer  │
//!   │ size | a │                                      │ size | a │
//!   └──────────┴──────────────────────────────────────┴──────────┘
//!              ▲
//!              └── Pointer returned to user (8-byte aligned)
//! ```
//!
//! ## Crate Structure
//!
//! ```text
//!   rmalloc
//!   ├── align      - Alignment macros (align!, align_to!)
//!   ├── block      - Boundary tags and block navigation (internal)
//!   ├── config     - HeapConfig debug switches
//!   ├── error      - AllocError, GrowError, HeapError
//!   ├── grow       - HeapGrower trait, ArenaHeap, SbrkHeap
//!   ├── heap       - Heap: init / allocate / free / resize / check
//!   └── locked     - LockedHeap, a Mutex-guarded GlobalAlloc
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use rmalloc::{ArenaHeap, Heap, HeapConfig};
//!
//! let mut heap = Heap::new(ArenaHeap::with_capacity(4096), HeapConfig::new());
//! heap.init().unwrap();
//!
//! let ptr = heap.allocate(16).unwrap();
//! unsafe {
//!     ptr.as_ptr().write_bytes(0xAB, 16);
//!
//!     let bigger = heap.resize(Some(ptr), 64).unwrap().unwrap();
//!     assert_eq!(*bigger.as_ptr(), 0xAB);
//!
//!     heap.free(bigger);
//! }
//!
//! heap.check().unwrap();
//! ```
//!
//! ## How It Works
//!
//! - **Allocate**: the request plus 8 bytes of tags is rounded up to 8
//!   (minimum 16). Blocks are scanned first-fit from the prologue; a block
//!   with at least 16 bytes to spare is split. When nothing fits, the heap
//!   grows, reusing a free block that already ends at the epilogue.
//! - **Free**: the block is tagged free and merged with free neighbours on
//!   both sides, so no two free blocks are ever adjacent.
//! - **Resize**: shrinks in place, grows in place by absorbing a free
//!   successor, and only otherwise allocates, copies and frees. The old
//!   block is released only after the new one exists.
//!
//! ## Limitations
//!
//! - **Single-threaded core**: `Heap` needs `&mut self`; wrap it in
//!   [`LockedHeap`] to share it
//! - **Never shrinks**: memory is never returned to the grower
//! - **Linear search**: allocation is O(number of blocks)
//! - **8-byte alignment only**: larger alignments are refused
//!
//! ## Safety
//!
//! `free` and `resize` trust their pointer argument. Enable
//! [`HeapConfig::validate_pointers`] (on by default in debug builds) to turn
//! double frees and foreign pointers into panics instead of corruption.

pub mod align;
mod block;
mod config;
mod error;
mod grow;
mod heap;
mod locked;

pub use block::{MIN_BLOCK_SIZE, OVERHEAD, Tag};
pub use config::{CHECK_HEAP_VAR, HeapConfig, VALIDATE_VAR};
pub use error::{AllocError, GrowError, HeapError};
pub use grow::{ArenaHeap, DEFAULT_ARENA_CAPACITY, HeapGrower, SbrkHeap};
pub use heap::{BlockInfo, Blocks, Heap, HeapStats};
pub use locked::LockedHeap;
