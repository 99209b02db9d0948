use std::{fmt, ptr::NonNull};

use crate::align::ALIGNMENT;

/// Size of one boundary tag word.
pub const WSIZE: usize = 4;
/// Double word: one header plus one footer.
pub const DSIZE: usize = 8;
/// Metadata bytes carried by every block.
pub const OVERHEAD: usize = DSIZE;
/// Smallest block we ever create: header, footer and room for another
/// header/footer pair should it be split later.
pub const MIN_BLOCK_SIZE: usize = 2 * DSIZE;
/// Largest block size a tag word can encode.
pub const MAX_BLOCK_SIZE: usize = (u32::MAX as usize) & !(ALIGNMENT - 1);

const ALLOC_BIT: u32 = 0x1;
const SIZE_MASK: u32 = !0x7;

/// A boundary tag: block size packed with the allocated bit.
///
/// ```text
///   31                                  3   2   1   0
///   ┌───────────────────────────────────┬───┬───┬───┐
///   │              size                 │ 0 │ 0 │ a │
///   └───────────────────────────────────┴───┴───┴───┘
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tag(u32);

impl Tag {
  pub const fn new(
    size: usize,
    allocated: bool,
  ) -> Self {
    debug_assert!(size <= MAX_BLOCK_SIZE && size % ALIGNMENT == 0);
    Self(size as u32 | allocated as u32)
  }

  pub const fn from_raw(raw: u32) -> Self {
    Self(raw)
  }

  pub const fn raw(self) -> u32 {
    self.0
  }

  pub const fn size(self) -> usize {
    (self.0 & SIZE_MASK) as usize
  }

  pub const fn is_allocated(self) -> bool {
    self.0 & ALLOC_BIT != 0
  }

  /// Bits 1 and 2 must stay clear.
  pub const fn is_well_formed(self) -> bool {
    self.0 & 0x6 == 0
  }
}

impl fmt::Debug for Tag {
  fn fmt(
    &self,
    f: &mut fmt::Formatter<'_>,
  ) -> fmt::Result {
    write!(f, "[{} | {}]", self.size(), self.is_allocated() as u8)
  }
}

/// Handle on a block, addressed by its payload pointer.
///
/// The header sits one word before the payload, the footer is the last
/// word of the block. All accessors are O(1) and read the tags in place.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub(crate) struct Block(NonNull<u8>);

impl Block {
  pub fn from_payload(payload: NonNull<u8>) -> Self {
    Self(payload)
  }

  pub fn payload(self) -> NonNull<u8> {
    self.0
  }

  pub fn addr(self) -> usize {
    self.0.as_ptr() as usize
  }

  fn header_ptr(self) -> *mut u32 {
    self.0.as_ptr().wrapping_sub(WSIZE) as *mut u32
  }

  /// # Safety
  ///
  /// The block's header must lie inside the managed heap.
  pub unsafe fn header(self) -> Tag {
    Tag(unsafe { self.header_ptr().read() })
  }

  /// # Safety
  ///
  /// The header must be valid and the whole block must lie inside the heap.
  pub unsafe fn footer(self) -> Tag {
    unsafe { Tag(self.footer_ptr().read()) }
  }

  unsafe fn footer_ptr(self) -> *mut u32 {
    unsafe {
      let size = self.header().size();
      self.0.as_ptr().add(size).sub(DSIZE) as *mut u32
    }
  }

  pub unsafe fn size(self) -> usize {
    unsafe { self.header().size() }
  }

  pub unsafe fn is_allocated(self) -> bool {
    unsafe { self.header().is_allocated() }
  }

  /// Writes `tag` into the header and then into the footer the new size
  /// designates.
  ///
  /// # Safety
  ///
  /// `tag.size()` bytes starting at the header must belong to the heap.
  pub unsafe fn set(
    self,
    tag: Tag,
  ) {
    unsafe {
      self.header_ptr().write(tag.raw());
      self.footer_ptr().write(tag.raw());
    }
  }

  /// Writes only the header word. Used for the epilogue, which has no footer.
  pub unsafe fn set_header(
    self,
    tag: Tag,
  ) {
    unsafe { self.header_ptr().write(tag.raw()) }
  }

  /// The block that starts right after this one.
  pub unsafe fn next(self) -> Block {
    unsafe { Block(self.0.add(self.size())) }
  }

  /// The block that ends right before this one, found through its footer.
  ///
  /// # Safety
  ///
  /// There must be a block (at least the prologue) before this one.
  pub unsafe fn prev(self) -> Block {
    unsafe {
      let prev_footer = Tag(self.0.as_ptr().sub(DSIZE).cast::<u32>().read());
      Block(self.0.sub(prev_footer.size()))
    }
  }
}
