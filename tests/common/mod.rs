#![allow(dead_code)]

use std::{
  alloc::{Layout, alloc, dealloc},
  collections::HashMap,
  ptr::NonNull,
};

use memalloc::{Backend, Heap, HeapConfig};

pub const PAGE: usize = 4096;

/// Snapshot of the OS calls a `FakeOs` has served.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Calls {
  pub grow: usize,
  pub shrink: usize,
  pub map: usize,
  pub unmap: usize,
}

/// A private break over one pre-reserved region plus tracked mappings.
pub struct FakeOs {
  region: NonNull<u8>,
  capacity: usize,
  brk: usize,
  maps: HashMap<usize, usize>,
  pub calls: Calls,
  pub fail_grow: bool,
  pub fail_shrink: bool,
  pub fail_map: bool,
  /// Bytes another agent grows the break by just before the next `grow`.
  pub race_next_grow: usize,
}

// The region and mappings are owned exclusively by this value.
unsafe impl Send for FakeOs {}

impl FakeOs {
  pub fn new(capacity: usize) -> Self {
    let layout = Layout::from_size_align(capacity, PAGE).unwrap();
    let region = NonNull::new(unsafe { alloc(layout) }).expect("reserve fake heap");
    Self {
      region,
      capacity,
      brk: 0,
      maps: HashMap::new(),
      calls: Calls::default(),
      fail_grow: false,
      fail_shrink: false,
      fail_map: false,
      race_next_grow: 0,
    }
  }

  /// Bytes between the region start and the break.
  pub fn brk_offset(&self) -> usize {
    self.brk
  }

  pub fn live_mappings(&self) -> usize {
    self.maps.len()
  }

  /// Moves the break without going through the heap, like a foreign `sbrk`.
  pub fn foreign_grow(&mut self, increment: usize) {
    assert!(self.brk + increment <= self.capacity);
    self.brk += increment;
  }

  /// Moves the break down without going through the heap.
  pub fn foreign_shrink(&mut self, decrement: usize) {
    assert!(decrement <= self.brk);
    self.brk -= decrement;
  }
}

impl Drop for FakeOs {
  fn drop(&mut self) {
    for (&base, &len) in &self.maps {
      unsafe { dealloc(base as *mut u8, Layout::from_size_align_unchecked(len, PAGE)) };
    }
    unsafe {
      dealloc(
        self.region.as_ptr(),
        Layout::from_size_align_unchecked(self.capacity, PAGE),
      )
    };
  }
}

unsafe impl Backend for FakeOs {
  fn page_size(&self) -> usize {
    PAGE
  }

  fn current_break(&mut self) -> Option<NonNull<u8>> {
    NonNull::new(unsafe { self.region.as_ptr().add(self.brk) })
  }

  fn grow(&mut self, increment: usize) -> Option<NonNull<u8>> {
    self.calls.grow += 1;
    let race = std::mem::take(&mut self.race_next_grow);
    self.foreign_grow(race);
    if self.fail_grow || increment > self.capacity - self.brk {
      return None;
    }
    let old = unsafe { self.region.as_ptr().add(self.brk) };
    self.brk += increment;
    NonNull::new(old)
  }

  unsafe fn shrink(&mut self, decrement: usize) -> bool {
    self.calls.shrink += 1;
    if self.fail_shrink || decrement > self.brk {
      return false;
    }
    self.brk -= decrement;
    true
  }

  fn map(&mut self, len: usize) -> Option<NonNull<u8>> {
    self.calls.map += 1;
    if self.fail_map || len == 0 {
      return None;
    }
    let layout = Layout::from_size_align(len, PAGE).ok()?;
    let base = NonNull::new(unsafe { alloc(layout) })?;
    self.maps.insert(base.as_ptr() as usize, len);
    Some(base)
  }

  unsafe fn unmap(&mut self, base: NonNull<u8>, len: usize) {
    self.calls.unmap += 1;
    let recorded = self
      .maps
      .remove(&(base.as_ptr() as usize))
      .expect("unmap of a region that was never mapped");
    assert_eq!(recorded, len, "unmap length differs from map length");
    unsafe { dealloc(base.as_ptr(), Layout::from_size_align_unchecked(len, PAGE)) };
  }
}

pub fn heap() -> Heap<FakeOs> {
  heap_with(HeapConfig::new())
}

pub fn heap_with(config: HeapConfig) -> Heap<FakeOs> {
  Heap::with_config(FakeOs::new(1 << 22), config)
}

pub fn calls(heap: &Heap<FakeOs>) -> Calls {
  heap.with_backend(|os| os.calls)
}

pub fn fill(ptr: NonNull<u8>, len: usize, byte: u8) {
  unsafe { ptr.as_ptr().write_bytes(byte, len) };
}

pub fn bytes<'a>(ptr: NonNull<u8>, len: usize) -> &'a [u8] {
  unsafe { std::slice::from_raw_parts(ptr.as_ptr(), len) }
}

pub fn is_filled(ptr: NonNull<u8>, len: usize, byte: u8) -> bool {
  bytes(ptr, len).iter().all(|&b| b == byte)
}
