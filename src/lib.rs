//! A general-purpose `malloc` replacement built on the process break and
//! anonymous mappings.
//!
//! Every allocation is a block: a 16-byte aligned [`DESCRIPTOR_SIZE`]-byte
//! descriptor followed by the payload handed to the caller.
//!
//! ```text
//!   heap-growth block:   [ Descriptor | payload ............ ]
//!   mapped block:        [ pad | Descriptor | payload ...... | BoundaryTag ]
//!                                           ^
//!                                           +-- pointer returned to caller
//! ```
//!
//! Small and medium requests grow the break (`sbrk`) and are linked into one
//! address-ordered chain. Released blocks are indexed into size-segregated
//! free lists and merged with free address-neighbours. A block that ends
//! exactly at the current break is handed straight back to the OS instead.
//! Requests at or above the mmap threshold get their own mapping, which is
//! unmapped as soon as it is released.
//!
//! All state sits behind one process-wide lock.
//!
//! # Break ownership
//!
//! Reading the break and shrinking it are two separate system calls. If any
//! other code in the process moves the break in between (another allocator
//! calling `sbrk`, for instance), a direct release can cut memory that does
//! not belong to this heap. The lock cannot prevent that; the engine assumes
//! it is the only agent shrinking the break. What the engine does notice
//! (a break that moved mid-growth, a non-tail block ending at the break) is
//! handled without trimming, and stranded break bytes show up in
//! [`HeapStats::stranded_bytes`].

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::Cell,
  mem::size_of,
  ptr::{self, NonNull, null_mut},
  sync::atomic::{AtomicUsize, Ordering},
};
use std::ffi::CStr;

use log::{Level, debug, log_enabled, trace, warn};
use spin::{Mutex, Once};
use thiserror::Error;

// =============================================================================
// Constants
// =============================================================================

/// Alignment of every descriptor and every payload on the heap-growth path.
pub const ALIGNMENT: usize = 16;

/// Size of the metadata prefixed to every block.
pub const DESCRIPTOR_SIZE: usize = size_of::<Descriptor>();

/// Size of the trailing mirror on mapped blocks.
pub const TAG_SIZE: usize = size_of::<BoundaryTag>();

/// Number of segregated free-list buckets. The last one is a catch-all.
pub const FREE_LIST_BUCKETS: usize = 10;

/// Requests of at least this many bytes get their own mapping.
pub const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;

/// Guard value stamped into live descriptors.
const BLOCK_MAGIC: u32 = 0x4D45_4D41; // "MEMA"

/// Smallest payload a split-off remainder may have.
const MIN_SPLIT_PAYLOAD: usize = ALIGNMENT;

const FALLBACK_PAGE_SIZE: usize = 4096;

const LOG_TARGET: &str = "memalloc";

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(DESCRIPTOR_SIZE % ALIGNMENT == 0);
const _: () = assert!(TAG_SIZE % ALIGNMENT == 0);
const _: () = assert!(FREE_LIST_BUCKETS >= 2);
const _: () = assert!(DESCRIPTOR_SIZE == 48);

// =============================================================================
// Types
// =============================================================================

/// Which OS resource backs a block.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Origin {
  Heap = 0,
  Mapped = 1,
}

/// Block metadata. Sits immediately before every payload.
#[repr(C, align(16))]
struct Descriptor {
  /// Usable payload bytes, overhead excluded.
  size: usize,
  /// Address-chain links (heap blocks only).
  prev: *mut Descriptor,
  next: *mut Descriptor,
  /// Free-list bucket links (free heap blocks only).
  prev_free: *mut Descriptor,
  next_free: *mut Descriptor,
  magic: u32,
  is_free: bool,
  origin: Origin,
}

impl Descriptor {
  const fn new(size: usize, origin: Origin) -> Self {
    Self {
      size,
      prev: null_mut(),
      next: null_mut(),
      prev_free: null_mut(),
      next_free: null_mut(),
      magic: BLOCK_MAGIC,
      is_free: false,
      origin,
    }
  }
}

/// Trailing mirror of size and free flag, written on mapped blocks.
#[repr(C, align(16))]
#[derive(Clone, Copy)]
struct BoundaryTag {
  size: usize,
  is_free: bool,
}

/// Errors reported by the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
  /// Zero size, zero count or element size, size product overflow, or an
  /// unsupported alignment.
  #[error("invalid allocation argument")]
  InvalidArgument,
  /// The backend could not grow the break or create a mapping.
  #[error("out of memory")]
  OutOfMemory,
  /// The pointer is not preceded by a live descriptor of this heap.
  #[error("heap corruption detected at {0:#x}")]
  CorruptionDetected(usize),
}

impl AllocError {
  /// C `errno` value for this error.
  pub const fn errno(self) -> i32 {
    match self {
      AllocError::OutOfMemory => libc::ENOMEM,
      AllocError::InvalidArgument | AllocError::CorruptionDetected(_) => libc::EINVAL,
    }
  }
}

/// Tunables of a [`Heap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeapConfig {
  /// Requests of at least this many bytes (after rounding) are mapped.
  pub mmap_threshold: usize,
  /// Split reused free blocks and index the remainder.
  pub split_blocks: bool,
}

impl HeapConfig {
  pub const fn new() -> Self {
    Self {
      mmap_threshold: DEFAULT_MMAP_THRESHOLD,
      split_blocks: false,
    }
  }

  pub const fn mmap_threshold(mut self, bytes: usize) -> Self {
    self.mmap_threshold = bytes;
    self
  }

  pub const fn split_blocks(mut self, enabled: bool) -> Self {
    self.split_blocks = enabled;
    self
  }

  /// Defaults overridden by `MEMALLOC_MMAP_THRESHOLD` and `MEMALLOC_SPLIT`.
  ///
  /// Reads the environment through `getenv` so it can run while the
  /// allocator is bootstrapping.
  pub fn from_env() -> Self {
    let mut config = Self::new();
    if let Some(threshold) = env_var(c"MEMALLOC_MMAP_THRESHOLD", parse_size) {
      config.mmap_threshold = threshold;
    }
    if let Some(split) = env_var(c"MEMALLOC_SPLIT", parse_flag) {
      config.split_blocks = split;
    }
    config
  }
}

impl Default for HeapConfig {
  fn default() -> Self {
    Self::new()
  }
}

/// Point-in-time accounting of a [`Heap`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
  /// Blocks in the address chain, live or free.
  pub heap_blocks: usize,
  /// Free blocks in the address chain.
  pub free_blocks: usize,
  /// Chain bytes including descriptors.
  pub heap_bytes: usize,
  /// Payload bytes of free chain blocks.
  pub free_bytes: usize,
  pub mapped_blocks: usize,
  /// Mapped bytes including descriptors, tags and alignment padding.
  pub mapped_bytes: usize,
  /// Break bytes grown but left unusable because another agent moved the
  /// break mid-growth.
  pub stranded_bytes: usize,
}

/// One block of the address chain, as seen by [`Heap::for_each_block`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockInfo {
  /// Payload address.
  pub address: usize,
  pub size: usize,
  pub is_free: bool,
}

// =============================================================================
// Platform
// =============================================================================

/// Source of raw memory for a [`Heap`].
///
/// # Safety
///
/// `grow` must return the previous break, with `increment` writable bytes
/// starting there. `map` must return a page-aligned region of at least `len`
/// writable bytes that stays valid until passed to `unmap` with the same base
/// and length.
pub unsafe trait Backend {
  /// Granularity of mappings. Must be a power of two.
  fn page_size(&self) -> usize;

  /// Current end of the heap-growth region.
  fn current_break(&mut self) -> Option<NonNull<u8>>;

  /// Moves the break up by `increment` bytes, returning the old break.
  fn grow(&mut self, increment: usize) -> Option<NonNull<u8>>;

  /// Moves the break down by `decrement` bytes.
  ///
  /// # Safety
  ///
  /// The top `decrement` bytes below the break must be unused.
  unsafe fn shrink(&mut self, decrement: usize) -> bool;

  /// Creates an independent read/write region of `len` bytes.
  fn map(&mut self, len: usize) -> Option<NonNull<u8>>;

  /// Releases a region obtained from `map`.
  ///
  /// # Safety
  ///
  /// `base` and `len` must describe exactly one live mapping.
  unsafe fn unmap(&mut self, base: NonNull<u8>, len: usize);
}

/// The process break and anonymous `mmap`.
///
/// Assumes no one else in the process shrinks the break; see the crate
/// documentation.
#[derive(Clone, Copy, Debug, Default)]
pub struct System;

static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

unsafe impl Backend for System {
  fn page_size(&self) -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
      return cached;
    }
    let queried = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let page = if queried > 0 && (queried as usize).is_power_of_two() {
      queried as usize
    } else {
      FALLBACK_PAGE_SIZE
    };
    PAGE_SIZE.store(page, Ordering::Relaxed);
    page
  }

  fn current_break(&mut self) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { os_sbrk(0) })
  }

  fn grow(&mut self, increment: usize) -> Option<NonNull<u8>> {
    let increment = isize::try_from(increment).ok()?;
    NonNull::new(unsafe { os_sbrk(increment) })
  }

  unsafe fn shrink(&mut self, decrement: usize) -> bool {
    let Ok(decrement) = isize::try_from(decrement) else {
      return false;
    };
    !unsafe { os_sbrk(-decrement) }.is_null()
  }

  fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { os_mmap(len) })
  }

  unsafe fn unmap(&mut self, base: NonNull<u8>, len: usize) {
    unsafe { os_munmap(base.as_ptr(), len) };
  }
}

unsafe fn os_sbrk(increment: isize) -> *mut u8 {
  let ptr = unsafe { libc::sbrk(increment as libc::intptr_t) };
  if ptr as isize == -1 {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

fn env_var<T>(name: &CStr, parse: fn(&str) -> Option<T>) -> Option<T> {
  let value = unsafe { libc::getenv(name.as_ptr()) };
  if value.is_null() {
    return None;
  }
  unsafe { CStr::from_ptr(value) }.to_str().ok().and_then(parse)
}

fn parse_size(value: &str) -> Option<usize> {
  value.trim().parse().ok()
}

fn parse_flag(value: &str) -> Option<bool> {
  match value.trim() {
    "1" | "true" | "on" | "yes" => Some(true),
    "0" | "false" | "off" | "no" => Some(false),
    _ => None,
  }
}

// =============================================================================
// Segregated Free Lists
// =============================================================================

/// Bucket index for a block of `size` bytes: `floor(log2(size))`, clamped.
#[inline(always)]
pub const fn bucket_of(size: usize) -> usize {
  if size == 0 {
    return 0;
  }
  let log2 = (usize::BITS - 1 - size.leading_zeros()) as usize;
  if log2 < FREE_LIST_BUCKETS {
    log2
  } else {
    FREE_LIST_BUCKETS - 1
  }
}

/// Unordered, doubly linked free blocks per bucket.
struct FreeLists {
  heads: [*mut Descriptor; FREE_LIST_BUCKETS],
}

impl FreeLists {
  const fn new() -> Self {
    Self {
      heads: [null_mut(); FREE_LIST_BUCKETS],
    }
  }

  /// Push `block` onto the bucket of its current size.
  unsafe fn insert(&mut self, block: *mut Descriptor) {
    unsafe {
      let bucket = bucket_of((*block).size);
      let head = self.heads[bucket];
      (*block).prev_free = null_mut();
      (*block).next_free = head;
      if !head.is_null() {
        (*head).prev_free = block;
      }
      self.heads[bucket] = block;
    }
  }

  /// Unlink `block` from its bucket. Its size must not have changed since
  /// `insert`.
  unsafe fn remove(&mut self, block: *mut Descriptor) {
    unsafe {
      let prev = (*block).prev_free;
      let next = (*block).next_free;
      if prev.is_null() {
        let bucket = bucket_of((*block).size);
        debug_assert!(self.heads[bucket] == block, "remove: block {block:p} not a bucket head");
        self.heads[bucket] = next;
      } else {
        (*prev).next_free = next;
      }
      if !next.is_null() {
        (*next).prev_free = prev;
      }
      (*block).prev_free = null_mut();
      (*block).next_free = null_mut();
    }
  }

  /// First fit, scanning from the bucket of `size` upward.
  unsafe fn find(&self, size: usize) -> *mut Descriptor {
    for bucket in bucket_of(size)..FREE_LIST_BUCKETS {
      let mut curr = self.heads[bucket];
      while !curr.is_null() {
        if unsafe { (*curr).size } >= size {
          return curr;
        }
        curr = unsafe { (*curr).next_free };
      }
    }
    null_mut()
  }
}

// =============================================================================
// Engine
// =============================================================================

/// How an acquisition was satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
  Reused,
  Split { remainder: usize },
  Grown { bytes: usize },
  Mapped { bytes: usize },
}

/// How a release was carried out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Released {
  /// Block was at the break; the break moved down by `bytes`.
  Trimmed { bytes: usize },
  /// Block joined the free lists; `merged` neighbours were absorbed.
  Indexed { merged: usize },
  Unmapped { bytes: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Resized {
  InPlace,
  Moved { source: Source, released: Released },
}

struct Engine<B> {
  backend: B,
  config: HeapConfig,
  /// Address-ordered chain of heap-growth blocks.
  head: *mut Descriptor,
  tail: *mut Descriptor,
  free: FreeLists,
  mapped_blocks: usize,
  mapped_bytes: usize,
  stranded_bytes: usize,
}

// Raw pointers only ever reach memory owned by this engine.
unsafe impl<B: Send> Send for Engine<B> {}

impl<B: Backend> Engine<B> {
  const fn new(backend: B, config: HeapConfig) -> Self {
    Self {
      backend,
      config,
      head: null_mut(),
      tail: null_mut(),
      free: FreeLists::new(),
      mapped_blocks: 0,
      mapped_bytes: 0,
      stranded_bytes: 0,
    }
  }

  fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, Source), AllocError> {
    if size == 0 {
      return Err(AllocError::InvalidArgument);
    }
    let size = checked_align_up(size, ALIGNMENT).ok_or(AllocError::OutOfMemory)?;

    if let Some(found) = self.take_free(size) {
      return Ok(found);
    }

    if size >= self.config.mmap_threshold {
      self.map_block(size, ALIGNMENT)
    } else {
      self.grow_block(size)
    }
  }

  fn acquire_aligned(
    &mut self,
    size: usize,
    align: usize,
  ) -> Result<(NonNull<u8>, Source), AllocError> {
    if size == 0 || !align.is_power_of_two() || align > self.backend.page_size() {
      return Err(AllocError::InvalidArgument);
    }
    if align <= ALIGNMENT {
      return self.acquire(size);
    }
    let size = checked_align_up(size, ALIGNMENT).ok_or(AllocError::OutOfMemory)?;
    self.map_block(size, align)
  }

  fn take_free(&mut self, size: usize) -> Option<(NonNull<u8>, Source)> {
    let block = unsafe { self.free.find(size) };
    if block.is_null() {
      return None;
    }

    unsafe {
      self.free.remove(block);
      (*block).is_free = false;
      let source = match self.split(block, size) {
        Some(remainder) => Source::Split { remainder },
        None => Source::Reused,
      };
      Some((payload_of(block), source))
    }
  }

  /// Carve the tail of a just-reused block into a new free block.
  unsafe fn split(&mut self, block: *mut Descriptor, size: usize) -> Option<usize> {
    if !self.config.split_blocks {
      return None;
    }

    unsafe {
      let spare = (*block).size - size;
      if spare < DESCRIPTOR_SIZE + MIN_SPLIT_PAYLOAD {
        return None;
      }

      let rest = payload_of(block).as_ptr().add(size) as *mut Descriptor;
      let remainder = spare - DESCRIPTOR_SIZE;
      rest.write(Descriptor::new(remainder, Origin::Heap));
      (*rest).is_free = true;
      (*block).size = size;
      self.link_after(block, rest);
      self.free.insert(rest);
      Some(remainder)
    }
  }

  fn grow_block(&mut self, size: usize) -> Result<(NonNull<u8>, Source), AllocError> {
    let top = self
      .backend
      .current_break()
      .ok_or(AllocError::OutOfMemory)?;
    let pad = align_up(top.as_ptr() as usize, ALIGNMENT) - top.as_ptr() as usize;
    let total = pad
      .checked_add(DESCRIPTOR_SIZE)
      .and_then(|n| n.checked_add(size))
      .ok_or(AllocError::OutOfMemory)?;

    let raw = self.backend.grow(total).ok_or(AllocError::OutOfMemory)?;

    // Someone moved the break since we read it and the padding no longer
    // fits. Hand the bytes back if they are still on top, else strand them.
    let start = align_up(raw.as_ptr() as usize, ALIGNMENT);
    if start - raw.as_ptr() as usize > pad {
      let end = raw.as_ptr() as usize + total;
      let on_top = self
        .backend
        .current_break()
        .is_some_and(|top| top.as_ptr() as usize == end);
      if !(on_top && unsafe { self.backend.shrink(total) }) {
        self.stranded_bytes += total;
      }
      return Err(AllocError::OutOfMemory);
    }

    let block = start as *mut Descriptor;
    unsafe {
      block.write(Descriptor::new(size, Origin::Heap));
      self.append(block);
      Ok((payload_of(block), Source::Grown { bytes: total }))
    }
  }

  fn map_block(&mut self, size: usize, align: usize) -> Result<(NonNull<u8>, Source), AllocError> {
    let lead = checked_align_up(DESCRIPTOR_SIZE, align).ok_or(AllocError::OutOfMemory)?;
    let len = lead
      .checked_add(size)
      .and_then(|n| n.checked_add(TAG_SIZE))
      .ok_or(AllocError::OutOfMemory)?;

    let base = self.backend.map(len).ok_or(AllocError::OutOfMemory)?;

    unsafe {
      let payload = base.as_ptr().add(lead);
      let block = payload.sub(DESCRIPTOR_SIZE) as *mut Descriptor;
      block.write(Descriptor::new(size, Origin::Mapped));
      tag_of(block).write(BoundaryTag {
        size,
        is_free: false,
      });
      self.mapped_blocks += 1;
      self.mapped_bytes += len;
      Ok((NonNull::new_unchecked(payload), Source::Mapped { bytes: len }))
    }
  }

  /// Descriptor of a live block, or `CorruptionDetected`.
  unsafe fn live_block(&self, ptr: NonNull<u8>) -> Result<*mut Descriptor, AllocError> {
    let addr = ptr.as_ptr() as usize;
    if addr % ALIGNMENT != 0 || addr < DESCRIPTOR_SIZE {
      return Err(AllocError::CorruptionDetected(addr));
    }

    let block = descriptor_of(ptr);
    unsafe {
      if (*block).magic != BLOCK_MAGIC || (*block).is_free {
        return Err(AllocError::CorruptionDetected(addr));
      }
      if (*block).origin == Origin::Mapped {
        let tag = tag_of(block).read();
        if tag.size != (*block).size || tag.is_free {
          return Err(AllocError::CorruptionDetected(addr));
        }
      }
    }
    Ok(block)
  }

  unsafe fn release(&mut self, ptr: NonNull<u8>) -> Result<Released, AllocError> {
    let block = unsafe { self.live_block(ptr)? };
    Ok(unsafe { self.release_block(block) })
  }

  unsafe fn release_block(&mut self, block: *mut Descriptor) -> Released {
    unsafe {
      match (*block).origin {
        Origin::Mapped => self.unmap_block(block),
        Origin::Heap => self.release_heap(block),
      }
    }
  }

  unsafe fn release_heap(&mut self, block: *mut Descriptor) -> Released {
    unsafe {
      let size = (*block).size;
      let end = payload_of(block).as_ptr().add(size);

      // A non-tail block ending at the break means the break was moved
      // under us; such a block only takes the free-list path.
      if block == self.tail
        && self
          .backend
          .current_break()
          .is_some_and(|top| top.as_ptr() == end)
      {
        let bytes = DESCRIPTOR_SIZE + size;
        self.unlink(block);
        (*block).magic = 0;
        if self.backend.shrink(bytes) {
          return Released::Trimmed { bytes };
        }
        (*block).magic = BLOCK_MAGIC;
        self.append(block);
      }

      (*block).is_free = true;
      self.free.insert(block);
      Released::Indexed {
        merged: self.coalesce(),
      }
    }
  }

  /// Merge every run of contiguous free blocks along the chain.
  unsafe fn coalesce(&mut self) -> usize {
    let mut merged = 0;
    let mut curr = self.head;

    unsafe {
      while !curr.is_null() {
        let next = (*curr).next;
        if next.is_null() {
          break;
        }

        if (*curr).is_free && (*next).is_free && is_adjacent(curr, next) {
          self.free.remove(curr);
          self.free.remove(next);
          self.unlink(next);
          (*next).magic = 0;
          (*curr).size += DESCRIPTOR_SIZE + (*next).size;
          self.free.insert(curr);
          merged += 1;
        } else {
          curr = next;
        }
      }
    }

    merged
  }

  unsafe fn unmap_block(&mut self, block: *mut Descriptor) -> Released {
    unsafe {
      let page = self.backend.page_size();
      let base = align_down(block as usize, page);
      let end = payload_of(block).as_ptr() as usize + (*block).size + TAG_SIZE;
      let len = end - base;

      (*block).magic = 0;
      self.mapped_blocks = self.mapped_blocks.saturating_sub(1);
      self.mapped_bytes = self.mapped_bytes.saturating_sub(len);
      self
        .backend
        .unmap(NonNull::new_unchecked(base as *mut u8), len);
      Released::Unmapped { bytes: len }
    }
  }

  unsafe fn resize(
    &mut self,
    ptr: NonNull<u8>,
    new_size: usize,
  ) -> Result<(NonNull<u8>, Resized), AllocError> {
    let block = unsafe { self.live_block(ptr)? };
    let old_size = unsafe { (*block).size };
    if old_size >= new_size {
      return Ok((ptr, Resized::InPlace));
    }

    let (fresh, source) = self.acquire(new_size)?;
    unsafe {
      ptr::copy_nonoverlapping(ptr.as_ptr(), fresh.as_ptr(), old_size);
      let released = self.release_block(block);
      Ok((fresh, Resized::Moved { source, released }))
    }
  }

  unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
    match unsafe { self.live_block(ptr) } {
      Ok(block) => unsafe { (*block).size },
      Err(_) => 0,
    }
  }

  fn stats(&self) -> HeapStats {
    let mut stats = HeapStats {
      mapped_blocks: self.mapped_blocks,
      mapped_bytes: self.mapped_bytes,
      stranded_bytes: self.stranded_bytes,
      ..HeapStats::default()
    };
    self.walk(|info| {
      stats.heap_blocks += 1;
      stats.heap_bytes += DESCRIPTOR_SIZE + info.size;
      if info.is_free {
        stats.free_blocks += 1;
        stats.free_bytes += info.size;
      }
    });
    stats
  }

  fn walk(&self, mut f: impl FnMut(BlockInfo)) {
    let mut curr = self.head;
    while !curr.is_null() {
      unsafe {
        f(BlockInfo {
          address: payload_of(curr).as_ptr() as usize,
          size: (*curr).size,
          is_free: (*curr).is_free,
        });
        curr = (*curr).next;
      }
    }
  }

  // --- address chain ---------------------------------------------------------

  unsafe fn append(&mut self, block: *mut Descriptor) {
    unsafe {
      (*block).prev = self.tail;
      (*block).next = null_mut();
      if self.tail.is_null() {
        self.head = block;
      } else {
        (*self.tail).next = block;
      }
    }
    self.tail = block;
  }

  unsafe fn link_after(&mut self, block: *mut Descriptor, new: *mut Descriptor) {
    unsafe {
      let next = (*block).next;
      (*new).prev = block;
      (*new).next = next;
      (*block).next = new;
      if next.is_null() {
        self.tail = new;
      } else {
        (*next).prev = new;
      }
    }
  }

  /// Detach `block` from the chain. Its own links are left as they were.
  unsafe fn unlink(&mut self, block: *mut Descriptor) {
    unsafe {
      let prev = (*block).prev;
      let next = (*block).next;
      if prev.is_null() {
        self.head = next;
      } else {
        (*prev).next = next;
      }
      if next.is_null() {
        self.tail = prev;
      } else {
        (*next).prev = prev;
      }
    }
  }
}

#[inline(always)]
fn payload_of(block: *mut Descriptor) -> NonNull<u8> {
  unsafe { NonNull::new_unchecked((block as *mut u8).add(DESCRIPTOR_SIZE)) }
}

#[inline(always)]
fn descriptor_of(ptr: NonNull<u8>) -> *mut Descriptor {
  unsafe { ptr.as_ptr().sub(DESCRIPTOR_SIZE) as *mut Descriptor }
}

#[inline(always)]
unsafe fn tag_of(block: *mut Descriptor) -> *mut BoundaryTag {
  unsafe { payload_of(block).as_ptr().add((*block).size) as *mut BoundaryTag }
}

#[inline(always)]
unsafe fn is_adjacent(first: *mut Descriptor, second: *mut Descriptor) -> bool {
  unsafe { payload_of(first).as_ptr().add((*first).size) == second as *mut u8 }
}

// =============================================================================
// Heap
// =============================================================================

/// A lock-protected allocator engine over a [`Backend`].
pub struct Heap<B: Backend> {
  engine: Mutex<Engine<B>>,
}

impl<B: Backend> Heap<B> {
  pub const fn new(backend: B) -> Self {
    Self::with_config(backend, HeapConfig::new())
  }

  pub const fn with_config(backend: B, config: HeapConfig) -> Self {
    Self {
      engine: Mutex::new(Engine::new(backend, config)),
    }
  }

  pub fn config(&self) -> HeapConfig {
    self.engine.lock().config
  }

  /// Replace the configuration. Existing blocks keep their backing.
  pub fn configure(&self, config: HeapConfig) {
    self.engine.lock().config = config;
  }

  /// Acquire `size` bytes, 16-byte aligned.
  pub fn acquire(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let result = self.with_engine(|engine| engine.acquire(size));
    log_acquire("acquire", size, &result);
    result.map(|(ptr, _)| ptr)
  }

  /// Acquire `count * element_size` zeroed bytes.
  pub fn acquire_zeroed(&self, count: usize, element_size: usize) -> Result<NonNull<u8>, AllocError> {
    if count == 0 || element_size == 0 {
      return Err(AllocError::InvalidArgument);
    }
    let total = count
      .checked_mul(element_size)
      .ok_or(AllocError::InvalidArgument)?;

    let result = self.with_engine(|engine| {
      engine.acquire(total).inspect(|(ptr, _)| {
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
      })
    });
    log_acquire("acquire_zeroed", total, &result);
    result.map(|(ptr, _)| ptr)
  }

  /// Acquire `size` bytes aligned to `align`, a power of two no larger than
  /// the backend page size. Alignments above [`ALIGNMENT`] are always mapped.
  pub fn acquire_aligned(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
    let result = self.with_engine(|engine| engine.acquire_aligned(size, align));
    log_acquire("acquire_aligned", size, &result);
    result.map(|(ptr, _)| ptr)
  }

  /// Grow `ptr` to at least `new_size` bytes.
  ///
  /// A null `ptr` or a zero `new_size` is forwarded to [`Heap::acquire`];
  /// the latter therefore fails with `InvalidArgument` and leaves `ptr`
  /// alone. Blocks that already hold `new_size` bytes are returned as is. On
  /// failure the original block is untouched.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer obtained from this heap.
  pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, AllocError> {
    // A zero-size resize is a plain acquisition of zero bytes, not a release.
    let Some(ptr) = NonNull::new(ptr).filter(|_| new_size != 0) else {
      return self.acquire(new_size);
    };

    let result = self.with_engine(|engine| unsafe { engine.resize(ptr, new_size) });
    match &result {
      Ok((_, Resized::InPlace)) => emit(Level::Trace, || {
        trace!(target: LOG_TARGET, "resize: ptr={ptr:p} size={new_size} in place")
      }),
      Ok((fresh, Resized::Moved { source, released })) => {
        let fresh = *fresh;
        emit(Level::Trace, || {
          trace!(target: LOG_TARGET, "resize: {ptr:p} -> {fresh:p} size={new_size} via {source:?}")
        });
        log_source(*source);
        log_released(*released);
      }
      Err(err) => log_error("resize", ptr.as_ptr() as usize, *err),
    }
    result.map(|(ptr, _)| ptr)
  }

  /// Release a block. Null is a no-op.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or a live pointer obtained from this heap. The
  /// descriptor guard catches some misuse (double release, foreign or
  /// interior pointers) but not all of it.
  pub unsafe fn release(&self, ptr: *mut u8) -> Result<(), AllocError> {
    let Some(ptr) = NonNull::new(ptr) else {
      return Ok(());
    };

    let result = unsafe { self.engine.lock().release(ptr) };
    match result {
      Ok(released) => {
        emit(Level::Trace, || {
          trace!(target: LOG_TARGET, "release: ptr={ptr:p} {released:?}")
        });
        log_released(released);
        Ok(())
      }
      Err(err) => {
        log_error("release", ptr.as_ptr() as usize, err);
        Err(err)
      }
    }
  }

  /// Payload bytes of a live block; 0 for null or unrecognized pointers.
  ///
  /// # Safety
  ///
  /// `ptr` must be null or point into memory readable at `ptr - DESCRIPTOR_SIZE`.
  pub unsafe fn usable_size(&self, ptr: *mut u8) -> usize {
    match NonNull::new(ptr) {
      Some(ptr) => unsafe { self.engine.lock().usable_size(ptr) },
      None => 0,
    }
  }

  pub fn stats(&self) -> HeapStats {
    self.engine.lock().stats()
  }

  /// Visit the address chain in order, under the lock. `f` must not
  /// allocate from this heap.
  pub fn for_each_block(&self, f: impl FnMut(BlockInfo)) {
    self.engine.lock().walk(f);
  }

  /// Run `f` on the engine under the lock, then report any break it
  /// stranded once the lock is gone.
  fn with_engine<R>(&self, f: impl FnOnce(&mut Engine<B>) -> R) -> R {
    let (result, stranded) = {
      let mut engine = self.engine.lock();
      let before = engine.stranded_bytes;
      let result = f(&mut engine);
      (result, engine.stranded_bytes - before)
    };
    if stranded > 0 {
      emit(Level::Debug, || {
        debug!(target: LOG_TARGET, "stranded {stranded} bytes of break moved by another agent")
      });
    }
    result
  }

  /// Run `f` against the backend, under the lock.
  pub fn with_backend<R>(&self, f: impl FnOnce(&mut B) -> R) -> R {
    f(&mut self.engine.lock().backend)
  }
}

impl<B: Backend + Default> Default for Heap<B> {
  fn default() -> Self {
    Self::new(B::default())
  }
}

// =============================================================================
// Logging
// =============================================================================

thread_local! {
  static IN_LOG: Cell<bool> = const { Cell::new(false) };
}

/// Run `record` if a logger wants `level`, unless this thread is already
/// inside a record (a logger allocating through this heap).
fn emit(level: Level, record: impl FnOnce()) {
  if !log_enabled!(target: LOG_TARGET, level) {
    return;
  }
  let _ = IN_LOG.try_with(|flag| {
    if flag.replace(true) {
      return;
    }
    record();
    flag.set(false);
  });
}

fn log_acquire(op: &'static str, size: usize, result: &Result<(NonNull<u8>, Source), AllocError>) {
  match result {
    Ok((ptr, source)) => {
      let ptr = *ptr;
      emit(Level::Trace, || {
        trace!(target: LOG_TARGET, "{op}: size={size} ptr={ptr:p} via {source:?}")
      });
      log_source(*source);
    }
    Err(err) => log_error(op, size, *err),
  }
}

fn log_source(source: Source) {
  match source {
    Source::Grown { bytes } => emit(Level::Debug, || {
      debug!(target: LOG_TARGET, "grew break by {bytes} bytes")
    }),
    Source::Mapped { bytes } => emit(Level::Debug, || {
      debug!(target: LOG_TARGET, "mapped {bytes} bytes")
    }),
    Source::Split { remainder } => emit(Level::Debug, || {
      debug!(target: LOG_TARGET, "split off free remainder of {remainder} bytes")
    }),
    Source::Reused => {}
  }
}

fn log_released(released: Released) {
  match released {
    Released::Trimmed { bytes } => emit(Level::Debug, || {
      debug!(target: LOG_TARGET, "trimmed break by {bytes} bytes")
    }),
    Released::Unmapped { bytes } => emit(Level::Debug, || {
      debug!(target: LOG_TARGET, "unmapped {bytes} bytes")
    }),
    Released::Indexed { merged } if merged > 0 => emit(Level::Debug, || {
      debug!(target: LOG_TARGET, "coalesced {merged} free blocks")
    }),
    Released::Indexed { .. } => {}
  }
}

fn log_error(op: &'static str, value: usize, err: AllocError) {
  match err {
    AllocError::CorruptionDetected(addr) => emit(Level::Warn, || {
      warn!(target: LOG_TARGET, "{op}: rejected pointer {addr:#x}: {err}")
    }),
    _ => emit(Level::Debug, || {
      debug!(target: LOG_TARGET, "{op}({value}) failed: {err}")
    }),
  }
}

// =============================================================================
// Global Heap
// =============================================================================

static GLOBAL: Heap<System> = Heap::new(System);
static GLOBAL_CONFIG: Once = Once::new();

fn global() -> &'static Heap<System> {
  GLOBAL_CONFIG.call_once(|| GLOBAL.configure(HeapConfig::from_env()));
  &GLOBAL
}

/// [`Heap::acquire`] on the process heap.
pub fn acquire(size: usize) -> Result<NonNull<u8>, AllocError> {
  global().acquire(size)
}

/// [`Heap::acquire_zeroed`] on the process heap.
pub fn acquire_zeroed(count: usize, element_size: usize) -> Result<NonNull<u8>, AllocError> {
  global().acquire_zeroed(count, element_size)
}

/// [`Heap::acquire_aligned`] on the process heap.
pub fn acquire_aligned(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
  global().acquire_aligned(size, align)
}

/// [`Heap::resize`] on the process heap.
pub unsafe fn resize(ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>, AllocError> {
  unsafe { global().resize(ptr, new_size) }
}

/// [`Heap::release`] on the process heap.
pub unsafe fn release(ptr: *mut u8) -> Result<(), AllocError> {
  unsafe { global().release(ptr) }
}

/// [`Heap::usable_size`] on the process heap.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  unsafe { global().usable_size(ptr) }
}

/// [`Heap::stats`] on the process heap.
pub fn stats() -> HeapStats {
  global().stats()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// The process heap as a Rust global allocator.
pub struct Allocator;

unsafe impl GlobalAlloc for Allocator {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    let size = layout.size().max(1);
    global()
      .acquire_aligned(size, layout.align())
      .map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
    let _ = unsafe { global().release(ptr) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return unsafe { global().resize(ptr, new_size.max(1)) }.map_or(null_mut(), NonNull::as_ptr);
    }

    let new_ptr =
      unsafe { self.alloc(Layout::from_size_align_unchecked(new_size, layout.align())) };

    if !new_ptr.is_null() {
      unsafe { ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size)) };
      unsafe { self.dealloc(ptr, layout) };
    }

    new_ptr
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() <= ALIGNMENT {
      return global()
        .acquire_zeroed(1, layout.size().max(1))
        .map_or(null_mut(), NonNull::as_ptr);
    }

    let ptr = unsafe { self.alloc(layout) };
    if !ptr.is_null() {
      unsafe { ptr::write_bytes(ptr, 0, layout.size()) }
    }
    ptr
  }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
fn set_errno(code: i32) {
  #[cfg(target_os = "linux")]
  unsafe {
    *libc::__errno_location() = code;
  }
  #[cfg(not(target_os = "linux"))]
  let _ = code;
}

#[cfg(feature = "c_api")]
fn c_result(result: Result<NonNull<u8>, AllocError>) -> *mut u8 {
  match result {
    Ok(ptr) => ptr.as_ptr(),
    Err(err) => {
      set_errno(err.errno());
      null_mut()
    }
  }
}

/// Returns null for `size == 0`.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc(size: usize) -> *mut u8 {
  c_result(acquire(size))
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn free(ptr: *mut u8) {
  let _ = unsafe { release(ptr) };
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn calloc(nmemb: usize, size: usize) -> *mut u8 {
  c_result(acquire_zeroed(nmemb, size))
}

/// `realloc(ptr, 0)` behaves as `malloc(0)`: it returns null and leaves
/// `ptr` allocated.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
  c_result(unsafe { resize(ptr, size) })
}

/// Alignments above the page size are rejected with `EINVAL`.
#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn posix_memalign(
  memptr: *mut *mut u8,
  alignment: usize,
  size: usize,
) -> i32 {
  if !alignment.is_power_of_two() || alignment < size_of::<*mut u8>() {
    return libc::EINVAL;
  }

  match acquire_aligned(size.max(1), alignment) {
    Ok(ptr) => {
      unsafe { *memptr = ptr.as_ptr() };
      0
    }
    Err(err) => err.errno(),
  }
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn malloc_usable_size(ptr: *mut u8) -> usize {
  unsafe { usable_size(ptr) }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

#[inline(always)]
const fn checked_align_up(x: usize, align: usize) -> Option<usize> {
  let mask = align - 1;
  match x.checked_add(mask) {
    Some(v) => Some(v & !mask),
    None => None,
  }
}

#[inline(always)]
const fn align_down(x: usize, align: usize) -> usize {
  x & !(align - 1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bucket_of_is_floor_log2_clamped() {
    assert_eq!(bucket_of(0), 0);
    assert_eq!(bucket_of(1), 0);
    assert_eq!(bucket_of(2), 1);
    assert_eq!(bucket_of(3), 1);
    assert_eq!(bucket_of(16), 4);
    assert_eq!(bucket_of(31), 4);
    assert_eq!(bucket_of(32), 5);
    assert_eq!(bucket_of(511), 8);
    assert_eq!(bucket_of(512), 9);
    assert_eq!(bucket_of(1 << 20), FREE_LIST_BUCKETS - 1);
    assert_eq!(bucket_of(usize::MAX), FREE_LIST_BUCKETS - 1);
  }

  #[test]
  fn layout_keeps_payloads_aligned() {
    assert_eq!(DESCRIPTOR_SIZE, 48);
    assert_eq!(TAG_SIZE, 16);
    assert_eq!(core::mem::align_of::<Descriptor>(), ALIGNMENT);
    assert_eq!(core::mem::align_of::<BoundaryTag>(), ALIGNMENT);
  }

  #[test]
  fn alignment_helpers() {
    assert_eq!(align_up(0, 16), 0);
    assert_eq!(align_up(1, 16), 16);
    assert_eq!(align_up(16, 16), 16);
    assert_eq!(align_up(17, 16), 32);
    assert_eq!(align_down(4095, 4096), 0);
    assert_eq!(align_down(8193, 4096), 8192);
    assert_eq!(checked_align_up(50, 16), Some(64));
    assert_eq!(checked_align_up(usize::MAX, 16), None);
    assert_eq!(checked_align_up(DESCRIPTOR_SIZE, 256), Some(256));
  }

  #[test]
  fn free_lists_first_fit_scans_upward() {
    let mut blocks = [
      Descriptor::new(48, Origin::Heap),
      Descriptor::new(64, Origin::Heap),
      Descriptor::new(1024, Origin::Heap),
    ];
    let [small, medium, large] = blocks.each_mut().map(|b| b as *mut Descriptor);

    let mut lists = FreeLists::new();
    unsafe {
      lists.insert(small);
      lists.insert(medium);
      lists.insert(large);

      assert_eq!(lists.find(16), small);
      // 48 and 64 share no bucket; 60 skips bucket 5's 48-byte block.
      assert_eq!(lists.find(60), medium);
      assert_eq!(lists.find(65), large);
      assert!(lists.find(2048).is_null());

      lists.remove(medium);
      assert_eq!(lists.find(60), large);
      lists.remove(large);
      assert!(lists.find(60).is_null());
      assert_eq!(lists.find(48), small);
      lists.remove(small);
      assert!(lists.heads.iter().all(|head| head.is_null()));
    }
  }

  #[test]
  fn free_lists_remove_from_middle_of_bucket() {
    let mut blocks = [
      Descriptor::new(32, Origin::Heap),
      Descriptor::new(40, Origin::Heap),
      Descriptor::new(48, Origin::Heap),
    ];
    let [a, b, c] = blocks.each_mut().map(|d| d as *mut Descriptor);

    let mut lists = FreeLists::new();
    unsafe {
      lists.insert(a);
      lists.insert(b);
      lists.insert(c);
      // Bucket 5 is now c -> b -> a.
      lists.remove(b);
      assert_eq!((*c).next_free, a);
      assert_eq!((*a).prev_free, c);
      assert_eq!(lists.find(41), c);
      assert_eq!(lists.find(32), c);
    }
  }

  #[test]
  fn env_values_parse() {
    assert_eq!(parse_size(" 4096 "), Some(4096));
    assert_eq!(parse_size("-1"), None);
    assert_eq!(parse_size("lots"), None);
    assert_eq!(parse_flag("on"), Some(true));
    assert_eq!(parse_flag("0"), Some(false));
    assert_eq!(parse_flag("maybe"), None);
  }

  #[test]
  fn config_builder() {
    let config = HeapConfig::new().mmap_threshold(4096).split_blocks(true);
    assert_eq!(config.mmap_threshold, 4096);
    assert!(config.split_blocks);
    assert_eq!(HeapConfig::default(), HeapConfig::new());
    assert_eq!(HeapConfig::new().mmap_threshold, DEFAULT_MMAP_THRESHOLD);
  }

  #[test]
  fn errno_mapping() {
    assert_eq!(AllocError::OutOfMemory.errno(), libc::ENOMEM);
    assert_eq!(AllocError::InvalidArgument.errno(), libc::EINVAL);
    assert_eq!(AllocError::CorruptionDetected(16).errno(), libc::EINVAL);
  }
}
