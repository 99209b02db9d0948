use std::{
  fmt,
  marker::PhantomData,
  ptr::{self, NonNull},
};

use log::{debug, trace, warn};

use crate::{
  align::{ALIGNMENT, checked_align},
  block::{Block, DSIZE, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, OVERHEAD, Tag, WSIZE},
  config::HeapConfig,
  error::{AllocError, GrowError, HeapError},
  grow::HeapGrower,
};

/// Padding word, prologue header and footer, epilogue header.
const INITIAL_SIZE: usize = 4 * WSIZE;

/// Block size needed to serve a request of `size` payload bytes.
fn adjusted_size(size: usize) -> Result<usize, AllocError> {
  let asize = size
    .checked_add(OVERHEAD)
    .and_then(checked_align)
    .filter(|&asize| asize <= MAX_BLOCK_SIZE)
    .ok_or(AllocError::RequestTooLarge(size))?;

  Ok(asize.max(MIN_BLOCK_SIZE))
}

/// One block as seen by [`Heap::blocks`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Payload address.
  pub addr: usize,
  /// Total block size, metadata included.
  pub size: usize,
  pub allocated: bool,
  pub header: Tag,
  pub footer: Tag,
}

/// Totals gathered by [`Heap::check`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  pub heap_size: usize,
  pub blocks: usize,
  pub allocated_blocks: usize,
  pub free_blocks: usize,
  pub allocated_bytes: usize,
  pub free_bytes: usize,
  pub largest_free: usize,
}

/// An implicit-list heap: boundary-tagged blocks laid end to end between
/// a prologue and an epilogue sentinel, searched first-fit.
///
/// ```text
///   lo                                                              hi
///   ┌─────┬─────┬─────┬──────────────────────┬─────┬─────────┬─────┐
///   │ pad │ 8|1 │ 8|1 │ hdr   payload    ftr │ ... │ hdr ftr │ 0|1 │
///   └─────┴─────┴─────┴──────────────────────┴─────┴─────────┴─────┘
///          prologue     first block                            epilogue
/// ```
pub struct Heap<G: HeapGrower> {
  grower: G,
  config: HeapConfig,
  prologue: Option<Block>,
}

// The heap owns every byte the grower hands out.
unsafe impl<G: HeapGrower + Send> Send for Heap<G> {}

impl<G: HeapGrower> Heap<G> {
  pub const fn new(
    grower: G,
    config: HeapConfig,
  ) -> Self {
    Self {
      grower,
      config,
      prologue: None,
    }
  }

  pub fn grower(&self) -> &G {
    &self.grower
  }

  pub fn config(&self) -> HeapConfig {
    self.config
  }

  pub fn is_initialized(&self) -> bool {
    self.prologue.is_some()
  }

  /// Lays down the prologue and epilogue sentinels.
  pub fn init(&mut self) -> Result<(), AllocError> {
    if self.prologue.is_some() {
      return Err(AllocError::AlreadyInitialized);
    }

    let start = self
      .grower
      .grow(INITIAL_SIZE)
      .map_err(|source| AllocError::OutOfMemory {
        requested: INITIAL_SIZE,
        source,
      })?;

    unsafe {
      start.cast::<u32>().write(0);

      let prologue = Block::from_payload(start.add(DSIZE));
      prologue.set(Tag::new(DSIZE, true));
      prologue.next().set_header(Tag::new(0, true));

      self.prologue = Some(prologue);
    }

    debug!("heap initialized at {:p}", start);
    self.after_op("init");
    Ok(())
  }

  /// Allocates a block with at least `size` payload bytes.
  ///
  /// A zero-byte request still gets its own minimum-size block, so the
  /// returned pointer is distinct from every other live allocation and
  /// must be released like any other.
  pub fn allocate(
    &mut self,
    size: usize,
  ) -> Result<NonNull<u8>, AllocError> {
    let prologue = self.prologue.ok_or(AllocError::Uninitialized)?;
    let asize = adjusted_size(size)?;

    let block = match unsafe { self.find_fit(prologue, asize) } {
      Some(block) => block,
      None => unsafe { self.extend_heap(asize)? },
    };

    unsafe { self.split(block, asize) };
    trace!("allocate({}) -> {:p}", size, block.payload());

    self.after_op("allocate");
    Ok(block.payload())
  }

  /// Releases a block returned by [`allocate`](Self::allocate) or
  /// [`resize`](Self::resize).
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap. With
  /// `validate_pointers` enabled a violation panics instead of corrupting
  /// the heap.
  pub unsafe fn free(
    &mut self,
    ptr: NonNull<u8>,
  ) {
    let block = Block::from_payload(ptr);
    self.validate("free", block);

    unsafe {
      block.set(Tag::new(block.size(), false));
      self.coalesce(block);
    }
    trace!("free({:p})", ptr);

    self.after_op("free");
  }

  /// Changes the size of an allocation, moving it only when it can
  /// neither shrink in place nor absorb a free successor.
  ///
  /// `None` behaves like [`allocate`](Self::allocate); a size of zero
  /// frees the block and returns `Ok(None)`. On error the original
  /// allocation is untouched.
  ///
  /// # Safety
  ///
  /// `ptr`, when present, must be a live allocation of this heap.
  pub unsafe fn resize(
    &mut self,
    ptr: Option<NonNull<u8>>,
    size: usize,
  ) -> Result<Option<NonNull<u8>>, AllocError> {
    let Some(ptr) = ptr else {
      return self.allocate(size).map(Some);
    };

    if size == 0 {
      unsafe { self.free(ptr) };
      return Ok(None);
    }

    let block = Block::from_payload(ptr);
    self.validate("resize", block);

    let asize = adjusted_size(size)?;
    let old_size = unsafe { block.size() };

    if asize <= old_size {
      unsafe { self.shrink(block, asize) };
      trace!("resize({:p}, {}) shrunk in place", ptr, size);
      self.after_op("resize");
      return Ok(Some(ptr));
    }

    unsafe {
      let next = block.next();
      let combined = old_size + next.size();
      if !next.is_allocated() && combined >= asize {
        block.set(Tag::new(combined, true));
        self.shrink(block, asize);
        trace!("resize({:p}, {}) absorbed its successor", ptr, size);
        self.after_op("resize");
        return Ok(Some(ptr));
      }
    }

    // The old block stays live until the new one exists.
    let moved = self.allocate(size)?;
    unsafe {
      let keep = (old_size - OVERHEAD).min(size);
      ptr::copy_nonoverlapping(ptr.as_ptr(), moved.as_ptr(), keep);
      self.free(ptr);
    }
    trace!("resize({:p}, {}) moved to {:p}", ptr, size, moved);

    Ok(Some(moved))
  }

  /// Payload bytes available in a live allocation.
  ///
  /// # Safety
  ///
  /// `ptr` must be a live allocation of this heap.
  pub unsafe fn usable_size(
    &self,
    ptr: NonNull<u8>,
  ) -> usize {
    unsafe { Block::from_payload(ptr).size() - OVERHEAD }
  }

  /// Walks the blocks between the prologue and the epilogue.
  pub fn blocks(&self) -> Blocks<'_> {
    Blocks {
      next: self.prologue.map(|prologue| unsafe { prologue.next() }),
      _heap: PhantomData,
    }
  }

  /// Verifies every structural invariant of the heap.
  pub fn check(&self) -> Result<HeapStats, HeapError> {
    let prologue = self.prologue.ok_or(HeapError::Uninitialized)?;
    let (lo, _) = self.grower.bounds();
    let lo = lo as usize;
    let end = lo + self.grower.size();

    let mut stats = HeapStats {
      heap_size: end - lo,
      ..HeapStats::default()
    };

    unsafe {
      let tag = Tag::new(DSIZE, true);
      if prologue.addr() != lo + DSIZE || prologue.header() != tag || prologue.footer() != tag {
        return Err(HeapError::BadPrologue);
      }

      let mut block = prologue.next();
      let mut prev_free: Option<usize> = None;

      loop {
        let addr = block.addr();
        if addr % ALIGNMENT != 0 {
          return Err(HeapError::Misaligned { addr });
        }
        if addr > end {
          return Err(HeapError::OutOfBounds { addr });
        }

        let header = block.header();
        if header.size() == 0 {
          if addr != end || !header.is_allocated() || !header.is_well_formed() {
            return Err(HeapError::BadEpilogue { addr: addr - WSIZE });
          }
          break;
        }

        let size = header.size();
        if !header.is_well_formed() || size < MIN_BLOCK_SIZE {
          return Err(HeapError::BadSize { addr, size });
        }
        if addr + size > end {
          return Err(HeapError::OutOfBounds { addr });
        }

        let footer = block.footer();
        if footer != header {
          return Err(HeapError::TagMismatch {
            addr,
            header: header.raw(),
            footer: footer.raw(),
          });
        }

        stats.blocks += 1;
        if header.is_allocated() {
          stats.allocated_blocks += 1;
          stats.allocated_bytes += size;
          prev_free = None;
        } else {
          if let Some(prev) = prev_free {
            return Err(HeapError::AdjacentFree { addr: prev, next: addr });
          }
          stats.free_blocks += 1;
          stats.free_bytes += size;
          stats.largest_free = stats.largest_free.max(size);
          prev_free = Some(addr);
        }

        block = block.next();
      }
    }

    Ok(stats)
  }

  /// Checks that `block` is the start of a live allocation.
  fn validate_live(
    &self,
    target: Block,
  ) -> Result<(), HeapError> {
    let prologue = self.prologue.ok_or(HeapError::Uninitialized)?;
    let addr = target.addr();

    if addr % ALIGNMENT != 0 {
      return Err(HeapError::Misaligned { addr });
    }

    unsafe {
      let first = prologue.next();
      if target < first || target >= self.epilogue() {
        return Err(HeapError::OutOfBounds { addr });
      }

      let mut current = first;
      while current < target && current.size() != 0 {
        current = current.next();
      }

      if current != target || !target.is_allocated() {
        return Err(HeapError::NotLive { addr });
      }

      let (header, footer) = (target.header(), target.footer());
      if header != footer {
        return Err(HeapError::TagMismatch {
          addr,
          header: header.raw(),
          footer: footer.raw(),
        });
      }
    }

    Ok(())
  }

  fn validate(
    &self,
    op: &str,
    block: Block,
  ) {
    if !self.config.validate_pointers {
      return;
    }
    if let Err(err) = self.validate_live(block) {
      panic!("{}({:p}): {}", op, block.payload(), err);
    }
  }

  fn after_op(
    &self,
    op: &str,
  ) {
    if !self.config.check_heap {
      return;
    }
    if let Err(err) = self.check() {
      panic!("heap corrupted after {}: {}", op, err);
    }
  }

  /// The epilogue's header is the last word of the region.
  fn epilogue(&self) -> Block {
    let (_, hi) = self.grower.bounds();
    // Non-null: an initialized region spans at least the sentinels.
    Block::from_payload(unsafe { NonNull::new_unchecked(hi.wrapping_add(1)) })
  }

  /// First free block of at least `asize` bytes, in address order.
  unsafe fn find_fit(
    &self,
    prologue: Block,
    asize: usize,
  ) -> Option<Block> {
    unsafe {
      let mut current = prologue.next();

      while current.size() != 0 {
        if !current.is_allocated() && current.size() >= asize {
          return Some(current);
        }
        current = current.next();
      }

      None
    }
  }

  /// Marks `block` allocated with `asize` bytes. The excess becomes a new
  /// free block when it can stand on its own, otherwise it stays inside
  /// `block`.
  unsafe fn split(
    &mut self,
    block: Block,
    asize: usize,
  ) -> Option<Block> {
    unsafe {
      let size = block.size();

      if size - asize < MIN_BLOCK_SIZE {
        block.set(Tag::new(size, true));
        return None;
      }

      block.set(Tag::new(asize, true));
      let rest = block.next();
      rest.set(Tag::new(size - asize, false));
      trace!("split {:#x}: {} -> {} + {}", block.addr(), size, asize, size - asize);

      Some(rest)
    }
  }

  /// Splits an allocated block down to `asize`, merging the released tail
  /// with a free successor.
  unsafe fn shrink(
    &mut self,
    block: Block,
    asize: usize,
  ) {
    unsafe {
      if let Some(rest) = self.split(block, asize) {
        self.coalesce(rest);
      }
    }
  }

  /// Grows the heap so that a free block of at least `asize` bytes ends
  /// right before the epilogue, reusing a trailing free block.
  unsafe fn extend_heap(
    &mut self,
    asize: usize,
  ) -> Result<Block, AllocError> {
    let mut request = asize;

    unsafe {
      let last = self.epilogue().prev();
      if !last.is_allocated() {
        let last_size = last.size();
        assert!(last_size < asize, "first fit missed a trailing block of {} bytes", last_size);
        request -= last_size;
      }
    }

    let available = MAX_BLOCK_SIZE.saturating_sub(self.grower.size());
    let grown = if request > available {
      Err(GrowError::Exhausted {
        requested: request,
        available,
      })
    } else {
      self.grower.grow(request)
    };

    let start = grown.map_err(|source| {
      warn!("out of memory: cannot grow heap by {} bytes: {}", request, source);
      AllocError::OutOfMemory {
        requested: request,
        source,
      }
    })?;

    unsafe {
      // The old epilogue header becomes the new block's header.
      let block = Block::from_payload(start);
      block.set(Tag::new(request, false));
      block.next().set_header(Tag::new(0, true));
      debug!("heap grew by {} bytes to {}", request, self.grower.size());

      Ok(self.coalesce(block))
    }
  }

  /// Merges a free block with free neighbours on both sides.
  unsafe fn coalesce(
    &mut self,
    block: Block,
  ) -> Block {
    unsafe {
      let prev = block.prev();
      let next = block.next();
      let prev_free = !prev.is_allocated();
      let next_free = !next.is_allocated();

      let mut start = block;
      let mut size = block.size();

      if prev_free {
        start = prev;
        size += prev.size();
      }
      if next_free {
        size += next.size();
      }

      if prev_free || next_free {
        start.set(Tag::new(size, false));
        trace!("coalesced into {:#x} ({} bytes)", start.addr(), size);
      }

      start
    }
  }
}

impl<G: HeapGrower> fmt::Display for Heap<G> {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    writeln!(f, "===== HEAP DUMP =====")?;

    let Some(prologue) = self.prologue else {
      return write!(f, "(uninitialized)");
    };

    let (lo, hi) = self.grower.bounds();
    writeln!(f, "Heap {:p}..={:p} ({} bytes)", lo, hi, self.grower.size())?;
    writeln!(f, "Prologue {:#x}: {:?}", prologue.addr(), unsafe {
      prologue.header()
    })?;

    for block in self.blocks() {
      writeln!(
        f,
        "Block {:#x}: header {:?} footer {:?} {}",
        block.addr,
        block.header,
        block.footer,
        if block.allocated { "allocated" } else { "free" },
      )?;
    }

    writeln!(f, "Epilogue header at {:#x}", self.epilogue().addr() - WSIZE)?;
    write!(f, "=====================")
  }
}

/// Iterator returned by [`Heap::blocks`].
pub struct Blocks<'a> {
  next: Option<Block>,
  _heap: PhantomData<&'a ()>,
}

impl Iterator for Blocks<'_> {
  type Item = BlockInfo;

  fn next(&mut self) -> Option<BlockInfo> {
    let block = self.next?;

    unsafe {
      let header = block.header();
      if header.size() == 0 {
        self.next = None;
        return None;
      }

      self.next = Some(block.next());
      Some(BlockInfo {
        addr: block.addr(),
        size: header.size(),
        allocated: header.is_allocated(),
        header,
        footer: block.footer(),
      })
    }
  }
}

#[cfg(test)]
mod tests {
  use proptest::prelude::*;

  use super::*;
  use crate::grow::ArenaHeap;

  fn heap_with(
    capacity: usize,
    config: HeapConfig,
  ) -> Heap<ArenaHeap> {
    let _ = pretty_env_logger::try_init();

    let mut heap = Heap::new(ArenaHeap::with_capacity(capacity), config);
    heap.init().unwrap();
    heap
  }

  fn heap() -> Heap<ArenaHeap> {
    heap_with(4096, HeapConfig::paranoid())
  }

  fn layout(heap: &Heap<ArenaHeap>) -> Vec<(usize, bool)> {
    heap.blocks().map(|b| (b.size, b.allocated)).collect()
  }

  fn fill(
    ptr: NonNull<u8>,
    len: usize,
    byte: u8,
  ) {
    unsafe { ptr::write_bytes(ptr.as_ptr(), byte, len) };
  }

  fn holds(
    ptr: NonNull<u8>,
    len: usize,
    byte: u8,
  ) -> bool {
    unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
      .iter()
      .all(|&b| b == byte)
  }

  fn addr(ptr: NonNull<u8>) -> usize {
    ptr.as_ptr() as usize
  }

  #[test]
  fn test_adjusted_size() {
    assert_eq!(adjusted_size(0).unwrap(), MIN_BLOCK_SIZE);
    assert_eq!(adjusted_size(1).unwrap(), 16);
    assert_eq!(adjusted_size(8).unwrap(), 16);
    assert_eq!(adjusted_size(9).unwrap(), 24);
    assert_eq!(adjusted_size(16).unwrap(), 24);
    assert!(matches!(
      adjusted_size(usize::MAX),
      Err(AllocError::RequestTooLarge(_))
    ));
    assert!(matches!(
      adjusted_size(MAX_BLOCK_SIZE),
      Err(AllocError::RequestTooLarge(_))
    ));
  }

  #[test]
  fn test_init_layout() {
    let mut heap = heap();

    assert!(heap.is_initialized());
    assert_eq!(heap.grower().size(), INITIAL_SIZE);
    assert_eq!(heap.blocks().count(), 0);

    let stats = heap.check().unwrap();
    assert_eq!(stats.heap_size, 16);
    assert_eq!(stats.blocks, 0);

    assert!(matches!(heap.init(), Err(AllocError::AlreadyInitialized)));
  }

  #[test]
  fn test_init_failure() {
    let mut heap = Heap::new(ArenaHeap::with_capacity(8), HeapConfig::paranoid());

    assert!(matches!(
      heap.init(),
      Err(AllocError::OutOfMemory { requested: 16, .. })
    ));
    assert!(!heap.is_initialized());
    assert!(matches!(heap.allocate(8), Err(AllocError::Uninitialized)));
    assert_eq!(heap.check(), Err(HeapError::Uninitialized));
  }

  #[test]
  fn test_first_fit_reuse_then_growth() {
    let mut heap = heap();

    let p = heap.allocate(16).unwrap();
    assert_eq!(layout(&heap), vec![(24, true)]);
    assert_eq!(heap.grower().size(), 40);

    unsafe { heap.free(p) };
    assert_eq!(layout(&heap), vec![(24, false)]);

    // 24 - 16 leaves less than a minimum block, so no split.
    let q = heap.allocate(8).unwrap();
    assert_eq!(q, p);
    assert_eq!(layout(&heap), vec![(24, true)]);
    assert_eq!(heap.grower().size(), 40);

    let r = heap.allocate(8).unwrap();
    assert_eq!(addr(r), addr(p) + 24);
    assert_eq!(layout(&heap), vec![(24, true), (16, true)]);
    assert_eq!(heap.grower().size(), 56);
  }

  #[test]
  fn test_split_leaves_free_remainder() {
    let mut heap = heap();

    let a = heap.allocate(64).unwrap();
    unsafe { heap.free(a) };

    let b = heap.allocate(8).unwrap();
    assert_eq!(b, a);
    assert_eq!(layout(&heap), vec![(16, true), (56, false)]);

    let c = heap.allocate(40).unwrap();
    assert_eq!(addr(c), addr(a) + 16);
    assert_eq!(layout(&heap), vec![(16, true), (56, true)]);
  }

  #[test]
  fn test_coalesce_both_directions() {
    let mut heap = heap();

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    let c = heap.allocate(16).unwrap();
    let _guard = heap.allocate(16).unwrap();

    unsafe {
      heap.free(a);
      heap.free(c);
    }
    assert_eq!(
      layout(&heap),
      vec![(24, false), (24, true), (24, false), (24, true)]
    );

    unsafe { heap.free(b) };
    assert_eq!(layout(&heap), vec![(72, false), (24, true)]);

    let stats = heap.check().unwrap();
    assert_eq!(stats.free_blocks, 1);
    assert_eq!(stats.largest_free, 72);
  }

  #[test]
  fn test_coalesce_with_successor() {
    let mut heap = heap();

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    let _guard = heap.allocate(16).unwrap();

    unsafe {
      heap.free(b);
      heap.free(a);
    }
    assert_eq!(layout(&heap), vec![(48, false), (24, true)]);
  }

  #[test]
  fn test_growth_reuses_trailing_free_block() {
    let mut heap = heap();

    let _a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    unsafe { heap.free(b) };
    assert_eq!(heap.grower().size(), 64);

    let c = heap.allocate(40).unwrap();
    assert_eq!(c, b);
    assert_eq!(layout(&heap), vec![(24, true), (48, true)]);
    assert_eq!(heap.grower().size(), 88);
  }

  #[test]
  fn test_out_of_memory_leaves_heap_intact() {
    let mut heap = heap_with(128, HeapConfig::paranoid());

    let a = heap.allocate(16).unwrap();
    let _b = heap.allocate(32).unwrap();
    let before: Vec<BlockInfo> = heap.blocks().collect();
    let size = heap.grower().size();

    match heap.allocate(1000) {
      Err(AllocError::OutOfMemory { requested, .. }) => assert_eq!(requested, 1008),
      other => panic!("expected out of memory, got {:?}", other),
    }

    assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
    assert_eq!(heap.grower().size(), size);

    // The heap keeps working afterwards.
    unsafe { heap.free(a) };
    assert_eq!(heap.allocate(8).unwrap(), a);
  }

  #[test]
  fn test_request_too_large() {
    let mut heap = heap();

    assert!(matches!(
      heap.allocate(usize::MAX),
      Err(AllocError::RequestTooLarge(_))
    ));
    assert!(matches!(
      heap.allocate(u32::MAX as usize),
      Err(AllocError::RequestTooLarge(_))
    ));
    assert_eq!(heap.blocks().count(), 0);
  }

  #[test]
  fn test_zero_size_allocations_are_distinct() {
    let mut heap = heap();

    let p = heap.allocate(0).unwrap();
    let q = heap.allocate(0).unwrap();

    assert_ne!(p, q);
    assert_eq!(unsafe { heap.usable_size(p) }, 8);
    assert_eq!(layout(&heap), vec![(16, true), (16, true)]);

    unsafe {
      heap.free(p);
      heap.free(q);
    }
    assert_eq!(layout(&heap), vec![(32, false)]);
  }

  #[test]
  fn test_payloads_are_aligned() {
    let mut heap = heap_with(1 << 16, HeapConfig::paranoid());

    for size in 0..64 {
      let ptr = heap.allocate(size).unwrap();
      assert_eq!(addr(ptr) % ALIGNMENT, 0);
      assert!(unsafe { heap.usable_size(ptr) } >= size);
    }
  }

  #[test]
  fn test_payloads_do_not_overlap() {
    let mut heap = heap();

    let a = heap.allocate(24).unwrap();
    let b = heap.allocate(40).unwrap();
    fill(a, 24, 0xAA);
    fill(b, 40, 0xBB);

    let c = heap.allocate(8).unwrap();
    fill(c, 8, 0xCC);
    unsafe { heap.free(c) };
    let d = heap.allocate(100).unwrap();
    fill(d, 100, 0xDD);

    assert!(holds(a, 24, 0xAA));
    assert!(holds(b, 40, 0xBB));
  }

  #[test]
  fn test_resize_grows_into_free_successor() {
    let mut heap = heap();

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    let c = heap.allocate(16).unwrap();
    fill(a, 16, 0x11);
    fill(c, 16, 0x33);

    unsafe { heap.free(b) };
    let r = unsafe { heap.resize(Some(a), 40) }.unwrap().unwrap();

    assert_eq!(r, a);
    assert_eq!(layout(&heap), vec![(48, true), (24, true)]);
    assert!(holds(r, 16, 0x11));

    fill(r, 40, 0x22);
    assert!(holds(c, 16, 0x33));
  }

  #[test]
  fn test_resize_absorbs_successor_and_splits_excess() {
    let mut heap = heap();

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(64).unwrap();
    let _guard = heap.allocate(16).unwrap();

    unsafe { heap.free(b) };
    let r = unsafe { heap.resize(Some(a), 24) }.unwrap().unwrap();

    assert_eq!(r, a);
    assert_eq!(layout(&heap), vec![(32, true), (64, false), (24, true)]);
  }

  #[test]
  fn test_resize_shrinks_in_place() {
    let mut heap = heap();

    let a = heap.allocate(100).unwrap();
    let _guard = heap.allocate(8).unwrap();
    fill(a, 100, 0x5A);

    let r = unsafe { heap.resize(Some(a), 10) }.unwrap().unwrap();
    assert_eq!(r, a);
    assert_eq!(layout(&heap), vec![(24, true), (88, false), (16, true)]);
    assert!(holds(r, 10, 0x5A));

    // Too little excess to split: the block keeps its size.
    let r = unsafe { heap.resize(Some(r), 12) }.unwrap().unwrap();
    assert_eq!(r, a);
    assert_eq!(layout(&heap), vec![(24, true), (88, false), (16, true)]);
  }

  #[test]
  fn test_resize_shrink_merges_released_tail() {
    let mut heap = heap();

    let a = heap.allocate(100).unwrap();
    let b = heap.allocate(16).unwrap();
    let _guard = heap.allocate(8).unwrap();

    unsafe { heap.free(b) };
    let r = unsafe { heap.resize(Some(a), 10) }.unwrap().unwrap();

    assert_eq!(r, a);
    assert_eq!(layout(&heap), vec![(24, true), (112, false), (16, true)]);
  }

  #[test]
  fn test_resize_moves_and_copies() {
    let mut heap = heap();

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();
    fill(a, 16, 0x77);
    fill(b, 16, 0x88);

    let r = unsafe { heap.resize(Some(a), 64) }.unwrap().unwrap();

    assert_ne!(r, a);
    assert!(holds(r, 16, 0x77));
    assert!(holds(b, 16, 0x88));
    assert_eq!(layout(&heap), vec![(24, false), (24, true), (72, true)]);
  }

  #[test]
  fn test_resize_without_pointer_and_to_zero() {
    let mut heap = heap();

    let p = unsafe { heap.resize(None, 16) }.unwrap().unwrap();
    assert_eq!(layout(&heap), vec![(24, true)]);

    let gone = unsafe { heap.resize(Some(p), 0) }.unwrap();
    assert!(gone.is_none());
    assert_eq!(layout(&heap), vec![(24, false)]);
  }

  #[test]
  fn test_resize_out_of_memory_keeps_original() {
    let mut heap = heap_with(128, HeapConfig::paranoid());

    let a = heap.allocate(16).unwrap();
    let _b = heap.allocate(16).unwrap();
    fill(a, 16, 0x42);
    let before: Vec<BlockInfo> = heap.blocks().collect();

    let result = unsafe { heap.resize(Some(a), 4096) };
    assert!(matches!(result, Err(AllocError::OutOfMemory { .. })));

    assert!(holds(a, 16, 0x42));
    assert_eq!(heap.blocks().collect::<Vec<_>>(), before);
    unsafe { heap.free(a) };
  }

  #[test]
  fn test_check_detects_tag_mismatch() {
    let mut heap = heap_with(4096, HeapConfig::unchecked());

    let a = heap.allocate(16).unwrap();
    // Footer of a 24-byte block sits 16 bytes into the payload.
    unsafe { a.as_ptr().add(16).cast::<u32>().write(0) };

    assert_eq!(
      heap.check(),
      Err(HeapError::TagMismatch {
        addr: addr(a),
        header: 25,
        footer: 0,
      })
    );
  }

  #[test]
  fn test_check_detects_adjacent_free_blocks() {
    let mut heap = heap_with(4096, HeapConfig::unchecked());

    let a = heap.allocate(16).unwrap();
    let b = heap.allocate(16).unwrap();

    for ptr in [a, b] {
      unsafe {
        let block = Block::from_payload(ptr);
        block.set(Tag::new(24, false));
      }
    }

    assert_eq!(
      heap.check(),
      Err(HeapError::AdjacentFree {
        addr: addr(a),
        next: addr(b),
      })
    );
  }

  #[test]
  fn test_validate_live() {
    let mut heap = heap();

    let a = heap.allocate(16).unwrap();
    let inside = unsafe { a.add(8) };

    assert_eq!(heap.validate_live(Block::from_payload(a)), Ok(()));
    assert_eq!(
      heap.validate_live(Block::from_payload(inside)),
      Err(HeapError::NotLive { addr: addr(inside) })
    );
    assert!(matches!(
      heap.validate_live(Block::from_payload(unsafe { a.add(4) })),
      Err(HeapError::Misaligned { .. })
    ));

    unsafe { heap.free(a) };
    assert_eq!(
      heap.validate_live(Block::from_payload(a)),
      Err(HeapError::NotLive { addr: addr(a) })
    );
  }

  #[test]
  #[should_panic(expected = "not a live allocation")]
  fn test_double_free_panics() {
    let mut heap = heap();

    let a = heap.allocate(16).unwrap();
    let _guard = heap.allocate(16).unwrap();
    unsafe {
      heap.free(a);
      heap.free(a);
    }
  }

  #[test]
  fn test_dump() {
    let mut heap = heap();
    let _a = heap.allocate(16).unwrap();

    let dump = heap.to_string();
    assert!(dump.starts_with("===== HEAP DUMP ====="));
    assert!(dump.contains("header [24 | 1] footer [24 | 1] allocated"));
    assert!(dump.contains("Epilogue header at"));

    let empty = Heap::new(ArenaHeap::with_capacity(64), HeapConfig::new());
    assert!(empty.to_string().contains("(uninitialized)"));
  }

  #[test]
  fn test_stats() {
    let mut heap = heap();

    let a = heap.allocate(16).unwrap();
    let _b = heap.allocate(32).unwrap();
    unsafe { heap.free(a) };

    let stats = heap.check().unwrap();
    assert_eq!(
      stats,
      HeapStats {
        heap_size: 16 + 24 + 40,
        blocks: 2,
        allocated_blocks: 1,
        free_blocks: 1,
        allocated_bytes: 40,
        free_bytes: 24,
        largest_free: 24,
      }
    );
  }

  #[derive(Clone, Debug)]
  enum Op {
    Allocate(usize),
    Free(usize),
    Resize(usize, usize),
  }

  fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
      (0usize..300).prop_map(Op::Allocate),
      any::<usize>().prop_map(Op::Free),
      (any::<usize>(), 0usize..300).prop_map(|(i, size)| Op::Resize(i, size)),
    ]
  }

  proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_operations_keep_heap_consistent(ops in prop::collection::vec(op(), 1..120)) {
      let mut heap = heap_with(1 << 20, HeapConfig::unchecked());
      let mut live: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

      for (step, op) in ops.into_iter().enumerate() {
        let byte = step as u8;

        match op {
          Op::Allocate(size) => {
            let ptr = heap.allocate(size).unwrap();
            prop_assert_eq!(addr(ptr) % ALIGNMENT, 0);
            fill(ptr, size, byte);
            live.push((ptr, size, byte));
          }
          Op::Free(i) => {
            if live.is_empty() {
              continue;
            }
            let (ptr, _, _) = live.swap_remove(i % live.len());
            unsafe { heap.free(ptr) };
          }
          Op::Resize(i, size) => {
            if live.is_empty() {
              continue;
            }
            let idx = i % live.len();
            let (ptr, old, old_byte) = live[idx];

            match unsafe { heap.resize(Some(ptr), size) }.unwrap() {
              None => {
                live.swap_remove(idx);
              }
              Some(moved) => {
                prop_assert_eq!(addr(moved) % ALIGNMENT, 0);
                prop_assert!(holds(moved, old.min(size), old_byte));
                fill(moved, size, byte);
                live[idx] = (moved, size, byte);
              }
            }
          }
        }

        let stats = heap.check();
        prop_assert!(stats.is_ok(), "{:?}", stats);

        for &(ptr, size, byte) in &live {
          prop_assert!(holds(ptr, size, byte));
        }
      }
    }

    #[test]
    fn freeing_everything_leaves_one_free_block(sizes in prop::collection::vec(0usize..512, 1..40)) {
      let mut heap = heap_with(1 << 20, HeapConfig::paranoid());
      let ptrs: Vec<_> = sizes.iter().map(|&size| heap.allocate(size).unwrap()).collect();

      for ptr in ptrs.into_iter().rev().step_by(2) {
        unsafe { heap.free(ptr) };
      }
      let remaining: Vec<_> = heap.blocks().filter(|b| b.allocated).map(|b| b.addr).collect();
      for addr in remaining {
        unsafe { heap.free(NonNull::new(addr as *mut u8).unwrap()) };
      }

      let stats = heap.check().unwrap();
      prop_assert_eq!(stats.blocks, 1);
      prop_assert_eq!(stats.free_bytes, stats.heap_size - INITIAL_SIZE);
    }
  }
}
