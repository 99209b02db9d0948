use std::io;

use thiserror::Error;

/// Failure of the growth primitive to extend the managed region.
#[derive(Debug, Error)]
pub enum GrowError {
  #[error("heap exhausted: requested {requested} bytes, {available} available")]
  Exhausted { requested: usize, available: usize },
  #[error("program break moved by someone else: expected {expected:#x}, found {found:#x}")]
  Discontiguous { expected: usize, found: usize },
  #[error("sbrk failed: {0}")]
  Os(#[from] io::Error),
}

/// Recoverable failures of [`Heap`](crate::Heap) operations.
///
/// When any of these is returned the heap is left exactly as it was
/// before the call.
#[derive(Debug, Error)]
pub enum AllocError {
  #[error("out of memory while requesting {requested} bytes")]
  OutOfMemory {
    requested: usize,
    #[source]
    source: GrowError,
  },
  #[error("request of {0} bytes does not fit in a block")]
  RequestTooLarge(usize),
  #[error("heap is not initialized")]
  Uninitialized,
  #[error("heap is already initialized")]
  AlreadyInitialized,
}

/// Broken heap invariant, reported by [`Heap::check`](crate::Heap::check)
/// and by pointer validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HeapError {
  #[error("heap is not initialized")]
  Uninitialized,
  #[error("bad prologue block")]
  BadPrologue,
  #[error("bad epilogue header at {addr:#x}")]
  BadEpilogue { addr: usize },
  #[error("block {addr:#x} is not aligned")]
  Misaligned { addr: usize },
  #[error("block {addr:#x}: header {header:#x} and footer {footer:#x} disagree")]
  TagMismatch { addr: usize, header: u32, footer: u32 },
  #[error("block {addr:#x} has invalid size {size}")]
  BadSize { addr: usize, size: usize },
  #[error("free blocks {addr:#x} and {next:#x} are adjacent")]
  AdjacentFree { addr: usize, next: usize },
  #[error("block {addr:#x} lies outside the heap")]
  OutOfBounds { addr: usize },
  #[error("{addr:#x} is not a live allocation")]
  NotLive { addr: usize },
}
