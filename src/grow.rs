use std::{
  alloc::{self, Layout},
  io,
  ptr::{self, NonNull},
};

use libc::{c_void, intptr_t, sbrk};
use log::debug;

use crate::{align, align::ALIGNMENT, error::GrowError};

/// Capacity of an [`ArenaHeap`] built with [`ArenaHeap::new`] (20 MiB).
pub const DEFAULT_ARENA_CAPACITY: usize = 20 * (1 << 20);

/// The primitive that extends the managed region.
///
/// # Safety
///
/// Implementors guarantee that every successful [`grow`](Self::grow)
/// returns the previous end of the region, that the region stays one
/// contiguous, writable byte range starting at a fixed, 8-aligned low
/// bound, and that nobody else reads or writes those bytes while the
/// grower is alive.
pub unsafe trait HeapGrower {
  /// Extends the region by `increment` bytes and returns the address
  /// where the new bytes start. Never shrinks.
  fn grow(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, GrowError>;

  /// Inclusive `(low, high)` bounds of the region. An empty region reports
  /// `high == low - 1`.
  fn bounds(&self) -> (*mut u8, *mut u8);

  /// Current size of the region in bytes.
  fn size(&self) -> usize {
    let (lo, hi) = self.bounds();
    (hi as usize).wrapping_add(1).wrapping_sub(lo as usize)
  }
}

/// A fixed-capacity region with a simulated break.
///
/// ```text
///   base                      base + brk                base + capacity
///   ┌─────────────────────────┬─────────────────────────┐
///   │      handed out         │        untouched        │
///   └─────────────────────────┴─────────────────────────┘
/// ```
pub struct ArenaHeap {
  base: NonNull<u8>,
  capacity: usize,
  brk: usize,
}

// The arena owns its buffer exclusively.
unsafe impl Send for ArenaHeap {}

impl ArenaHeap {
  pub fn new() -> Self {
    Self::with_capacity(DEFAULT_ARENA_CAPACITY)
  }

  /// Creates an arena of `capacity` bytes, rounded up to the alignment unit.
  ///
  /// # Panics
  ///
  /// Panics if `capacity` exceeds `isize::MAX`.
  pub fn with_capacity(capacity: usize) -> Self {
    let capacity = align!(capacity);

    let base = if capacity == 0 {
      NonNull::<u64>::dangling().cast()
    } else {
      let layout = Self::layout(capacity);
      let raw = unsafe { alloc::alloc_zeroed(layout) };
      NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout))
    };

    Self {
      base,
      capacity,
      brk: 0,
    }
  }

  fn layout(capacity: usize) -> Layout {
    match Layout::from_size_align(capacity, ALIGNMENT) {
      Ok(layout) => layout,
      Err(_) => panic!("arena capacity {capacity} is too large"),
    }
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn remaining(&self) -> usize {
    self.capacity - self.brk
  }
}

impl Default for ArenaHeap {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for ArenaHeap {
  fn drop(&mut self) {
    if self.capacity != 0 {
      unsafe { alloc::dealloc(self.base.as_ptr(), Self::layout(self.capacity)) };
    }
  }
}

unsafe impl HeapGrower for ArenaHeap {
  fn grow(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, GrowError> {
    let available = self.remaining();
    if increment > available {
      return Err(GrowError::Exhausted {
        requested: increment,
        available,
      });
    }

    let old = unsafe { self.base.add(self.brk) };
    self.brk += increment;
    Ok(old)
  }

  fn bounds(&self) -> (*mut u8, *mut u8) {
    let lo = self.base.as_ptr();
    (lo, lo.wrapping_add(self.brk).wrapping_sub(1))
  }
}

/// The process heap, grown by moving the program break with `sbrk(2)`.
///
/// The low bound is claimed on first growth, after padding the break to
/// the alignment unit. Growth that does not continue exactly where the
/// previous one ended is undone and refused.
pub struct SbrkHeap {
  lo: *mut u8,
  brk: *mut u8,
}

unsafe impl Send for SbrkHeap {}

impl SbrkHeap {
  pub const fn new() -> Self {
    Self {
      lo: ptr::null_mut(),
      brk: ptr::null_mut(),
    }
  }

  fn claim_break(&mut self) -> Result<(), GrowError> {
    let current = checked_sbrk(0)?;
    let pad = current.align_offset(ALIGNMENT);

    if pad != 0 {
      let old = checked_sbrk(pad as intptr_t)?;
      if old != current {
        unsafe { sbrk(-(pad as intptr_t)) };
        return Err(GrowError::Discontiguous {
          expected: current as usize,
          found: old as usize,
        });
      }
    }

    self.lo = current.wrapping_add(pad);
    self.brk = self.lo;
    debug!("claimed program break at {:?} (padding {})", self.lo, pad);
    Ok(())
  }
}

impl Default for SbrkHeap {
  fn default() -> Self {
    Self::new()
  }
}

unsafe impl HeapGrower for SbrkHeap {
  fn grow(
    &mut self,
    increment: usize,
  ) -> Result<NonNull<u8>, GrowError> {
    if self.lo.is_null() {
      self.claim_break()?;
    }

    let delta = intptr_t::try_from(increment).map_err(|_| GrowError::Exhausted {
      requested: increment,
      available: intptr_t::MAX as usize,
    })?;

    let old = checked_sbrk(delta)?;
    if old != self.brk {
      unsafe { sbrk(-delta) };
      return Err(GrowError::Discontiguous {
        expected: self.brk as usize,
        found: old as usize,
      });
    }

    self.brk = old.wrapping_add(increment);
    debug!("program break moved by {} to {:?}", increment, self.brk);

    NonNull::new(old).ok_or_else(|| io::Error::other("sbrk returned a null break").into())
  }

  fn bounds(&self) -> (*mut u8, *mut u8) {
    (self.lo, self.brk.wrapping_sub(1))
  }
}

fn checked_sbrk(delta: intptr_t) -> Result<*mut u8, GrowError> {
  let old = unsafe { sbrk(delta) };
  if old == usize::MAX as *mut c_void {
    return Err(io::Error::last_os_error().into());
  }
  Ok(old as *mut u8)
}
