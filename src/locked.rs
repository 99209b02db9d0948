use std::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull},
  sync::Mutex,
};

use log::error;

use crate::{align::ALIGNMENT, config::HeapConfig, grow::HeapGrower, heap::Heap};

/// A heap behind a single mutex, usable as a `#[global_allocator]`.
///
/// Every operation holds the lock from start to finish, so no thread can
/// observe a block whose header and footer are only half written. The
/// heap is initialized on first use.
///
/// When installed as the global allocator, keep the `log` level for this
/// crate below `trace` or use a logger that does not allocate: log calls
/// run while the lock is held.
///
/// ```rust,ignore
/// use rmalloc::{HeapConfig, LockedHeap, SbrkHeap};
///
/// #[global_allocator]
/// static ALLOCATOR: LockedHeap<SbrkHeap> = LockedHeap::new(SbrkHeap::new(), HeapConfig::unchecked());
/// ```
pub struct LockedHeap<G: HeapGrower>(Mutex<Heap<G>>);

impl<G: HeapGrower> LockedHeap<G> {
  pub const fn new(
    grower: G,
    config: HeapConfig,
  ) -> Self {
    Self(Mutex::new(Heap::new(grower, config)))
  }

  /// Runs `f` with exclusive access to the heap, initializing it first.
  /// Returns `None` if the heap cannot be initialized or a previous user
  /// panicked while holding the lock.
  pub fn with_heap<R>(
    &self,
    f: impl FnOnce(&mut Heap<G>) -> R,
  ) -> Option<R> {
    let mut heap = self.0.lock().ok()?;

    if !heap.is_initialized() {
      if let Err(err) = heap.init() {
        error!("cannot initialize heap: {}", err);
        return None;
      }
    }

    Some(f(&mut heap))
  }
}

unsafe impl<G: HeapGrower> GlobalAlloc for LockedHeap<G> {
  unsafe fn alloc(
    &self,
    layout: Layout,
  ) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return ptr::null_mut();
    }

    self
      .with_heap(|heap| heap.allocate(layout.size()).ok())
      .flatten()
      .map_or(ptr::null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(
    &self,
    ptr: *mut u8,
    _layout: Layout,
  ) {
    if let Some(ptr) = NonNull::new(ptr) {
      self.with_heap(|heap| unsafe { heap.free(ptr) });
    }
  }

  unsafe fn realloc(
    &self,
    ptr: *mut u8,
    layout: Layout,
    new_size: usize,
  ) -> *mut u8 {
    if layout.align() > ALIGNMENT {
      return ptr::null_mut();
    }

    self
      .with_heap(|heap| unsafe { heap.resize(NonNull::new(ptr), new_size) }.ok().flatten())
      .flatten()
      .map_or(ptr::null_mut(), NonNull::as_ptr)
  }
}
