// Copyright 2018-2025 the Deno authors. MIT license.

//! Native control blocks and the back-reference from a block to the Rust
//! object that owns it.
//!
//! Every handle and request owns one zeroed block allocated with `calloc`.
//! The first word of the block (libuv's `data` field) carries an opaque
//! token instead of a pointer. Tokens index a thread-local table of weak
//! owner references, so a completion callback can recover its owner, and an
//! owner that has gone away is simply not found.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::rc::Rc;
use std::rc::Weak;
use std::thread::ThreadId;

/// Implemented by every Rust object that owns a native block.
pub trait UvOwner: 'static {
  fn into_any(self: Rc<Self>) -> Rc<dyn Any>;

  /// Called on the loop thread once the close callback for the owner's
  /// handle has run and its block is freed.
  fn closed(&self) {}

  /// Tear the owner down. Used when a loop is shut down forcibly.
  fn dispose(&self) {}
}

struct Slot {
  owner: Weak<dyn UvOwner>,
  // Strong reference held while native code may call back into the owner.
  pin: Option<Rc<dyn UvOwner>>,
}

#[derive(Default)]
struct OwnerTable {
  next: usize,
  slots: HashMap<usize, Slot>,
}

thread_local! {
  static OWNERS: RefCell<OwnerTable> = RefCell::new(OwnerTable::default());
}

// The table may already be gone while thread-locals are torn down; owners
// dropped at that point simply find nothing.
fn with_table<R>(f: impl FnOnce(&mut OwnerTable) -> R) -> Option<R> {
  OWNERS.try_with(|table| f(&mut table.borrow_mut())).ok()
}

fn register(owner: Weak<dyn UvOwner>) -> usize {
  with_table(|table| {
    table.next += 1;
    let token = table.next;
    table.slots.insert(token, Slot { owner, pin: None });
    token
  })
  .unwrap_or(0)
}

fn lookup(token: usize) -> Option<Rc<dyn UvOwner>> {
  with_table(|table| {
    let slot = table.slots.get(&token)?;
    slot.pin.clone().or_else(|| slot.owner.upgrade())
  })
  .flatten()
}

fn remove(token: usize) -> Option<Rc<dyn UvOwner>> {
  // The pin is returned rather than dropped inside the borrow: dropping the
  // last reference can re-enter the table.
  with_table(|table| table.slots.remove(&token)?.pin).flatten()
}

/// Number of owners currently registered on this thread.
pub fn live_owner_count() -> usize {
  with_table(|table| table.slots.len()).unwrap_or(0)
}

/// Keep the owner behind `token` alive until [`unpin`] is called.
pub(crate) fn pin(token: usize, owner: Rc<dyn UvOwner>) {
  let previous = with_table(|table| {
    let slot = table.slots.get_mut(&token)?;
    debug_assert!(slot.pin.is_none(), "Owner is already pinned");
    slot.pin.replace(owner)
  });
  drop(previous);
}

pub(crate) fn unpin(token: usize) -> Option<Rc<dyn UvOwner>> {
  with_table(|table| table.slots.get_mut(&token)?.pin.take()).flatten()
}

pub(crate) fn is_pinned(token: usize) -> bool {
  with_table(|table| {
    table
      .slots
      .get(&token)
      .map(|slot| slot.pin.is_some())
      .unwrap_or(false)
  })
  .unwrap_or(false)
}

/// Read the owner token stamped into a native block.
///
/// # Safety
/// `ptr` must point to a live block allocated by [`UvMemory`].
pub(crate) unsafe fn token_of(ptr: *const c_void) -> usize {
  unsafe { *(ptr as *const usize) }
}

/// Recover the owner of a native block from a callback argument.
///
/// # Safety
/// `ptr` must point to a live block allocated by [`UvMemory`].
pub unsafe fn owner_of(ptr: *const c_void) -> Option<Rc<dyn UvOwner>> {
  if ptr.is_null() {
    return None;
  }
  lookup(unsafe { token_of(ptr) })
}

/// Recover the owner of a native block as its concrete type.
///
/// # Safety
/// `ptr` must point to a live block allocated by [`UvMemory`].
pub unsafe fn from_ptr<T: UvOwner>(ptr: *const c_void) -> Option<Rc<T>> {
  let owner = unsafe { owner_of(ptr) }?;
  owner.into_any().downcast::<T>().ok()
}

/// Free a block whose owner no longer holds it.
///
/// # Safety
/// `ptr` must come from [`UvMemory::take_ptr`] and must not be used again.
pub(crate) unsafe fn destroy_block(ptr: *mut c_void) {
  if !ptr.is_null() {
    unsafe { libc::free(ptr) };
  }
}

/// A native block plus the bookkeeping every handle and request shares: the
/// owner token, the creating thread and the open/closed flag.
pub struct UvMemory {
  ptr: Cell<*mut c_void>,
  token: usize,
  thread_id: ThreadId,
  closed: Cell<bool>,
}

impl UvMemory {
  /// Allocate `size` zeroed bytes and stamp `owner` into the first word.
  pub fn allocate(size: usize, owner: Weak<dyn UvOwner>) -> Self {
    let size = size.max(std::mem::size_of::<usize>());
    let ptr = unsafe { libc::calloc(1, size) };
    if ptr.is_null() {
      let layout = std::alloc::Layout::from_size_align(
        size,
        std::mem::align_of::<usize>(),
      )
      .unwrap_or_else(|_| std::alloc::Layout::new::<usize>());
      std::alloc::handle_alloc_error(layout);
    }
    let token = register(owner);
    unsafe { *(ptr as *mut usize) = token };
    Self {
      ptr: Cell::new(ptr),
      token,
      thread_id: std::thread::current().id(),
      closed: Cell::new(false),
    }
  }

  pub fn token(&self) -> usize {
    self.token
  }

  pub fn thread_id(&self) -> ThreadId {
    self.thread_id
  }

  pub fn is_closed(&self) -> bool {
    self.closed.get()
  }

  pub(crate) fn set_closed(&self) {
    self.closed.set(true);
  }

  /// Raw block address without any checks.
  pub fn raw_ptr(&self) -> *mut c_void {
    self.ptr.get()
  }

  /// Assert the open/closed state, a non-null block and the owning thread.
  pub fn validate(&self, expect_closed: bool) {
    if expect_closed {
      debug_assert!(self.closed.get(), "Handle must be closed");
    } else {
      debug_assert!(!self.closed.get(), "Handle is closed");
    }
    debug_assert!(!self.ptr.get().is_null(), "Handle is invalid");
    debug_assert_eq!(
      self.thread_id,
      std::thread::current().id(),
      "ThreadId is incorrect"
    );
  }

  /// The block address after validating that the block is open and used
  /// from its thread.
  pub fn ptr(&self) -> *mut c_void {
    self.validate(false);
    self.ptr.get()
  }

  /// Hand the block over to a close callback. Returns null when already
  /// released.
  pub(crate) fn take_ptr(&self) -> *mut c_void {
    self.ptr.replace(std::ptr::null_mut())
  }

  /// Free the block now. Safe to call more than once.
  pub fn release_block(&self) {
    let ptr = self.take_ptr();
    unsafe { destroy_block(ptr) };
  }
}

impl Drop for UvMemory {
  fn drop(&mut self) {
    self.release_block();
    let pin = remove(self.token);
    drop(pin);
  }
}

impl std::fmt::Debug for UvMemory {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UvMemory")
      .field("ptr", &self.ptr.get())
      .field("token", &self.token)
      .field("closed", &self.closed.get())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Owner {
    memory: UvMemory,
    closed: Cell<u32>,
  }

  impl UvOwner for Owner {
    fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
      self
    }

    fn closed(&self) {
      self.closed.set(self.closed.get() + 1);
    }
  }

  fn owner() -> Rc<Owner> {
    Rc::new_cyclic(|weak: &Weak<Owner>| Owner {
      memory: UvMemory::allocate(64, weak.clone()),
      closed: Cell::new(0),
    })
  }

  #[test]
  fn test_block_carries_token_in_first_word() {
    let owner = owner();
    let ptr = owner.memory.ptr();
    assert_eq!(unsafe { token_of(ptr) }, owner.memory.token());
    let recovered = unsafe { from_ptr::<Owner>(ptr) }.unwrap();
    assert!(Rc::ptr_eq(&recovered, &owner));
  }

  #[test]
  fn test_rest_of_block_is_zeroed() {
    let owner = owner();
    let bytes = unsafe {
      std::slice::from_raw_parts(owner.memory.ptr() as *const u8, 64)
    };
    assert!(bytes[std::mem::size_of::<usize>()..].iter().all(|b| *b == 0));
  }

  #[test]
  fn test_from_ptr_rejects_other_types() {
    struct Other;
    impl UvOwner for Other {
      fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
      }
    }
    let owner = owner();
    assert!(unsafe { from_ptr::<Other>(owner.memory.ptr()) }.is_none());
  }

  #[test]
  fn test_release_block_twice_is_a_no_op() {
    let owner = owner();
    owner.memory.release_block();
    assert!(owner.memory.raw_ptr().is_null());
    owner.memory.release_block();
    assert!(owner.memory.raw_ptr().is_null());
  }

  #[test]
  fn test_dropped_owner_is_not_found() {
    let owner = owner();
    let token = owner.memory.token();
    let before = live_owner_count();
    drop(owner);
    assert!(lookup(token).is_none());
    assert_eq!(live_owner_count(), before - 1);
  }

  #[test]
  fn test_pin_outlives_caller_reference() {
    let owner = owner();
    let token = owner.memory.token();
    let ptr = owner.memory.take_ptr();
    pin(token, owner.clone());
    assert!(is_pinned(token));
    drop(owner);

    let recovered = unsafe { from_ptr::<Owner>(ptr) }.unwrap();
    recovered.closed();
    assert_eq!(recovered.closed.get(), 1);
    drop(recovered);

    let pinned = unpin(token).unwrap();
    assert!(!is_pinned(token));
    drop(pinned);
    assert!(lookup(token).is_none());
    unsafe { destroy_block(ptr) };
  }

  #[test]
  fn test_wrong_thread_fails_validation() {
    let owner = owner();
    let memory_ptr = &owner.memory as *const UvMemory as usize;
    let result = std::thread::spawn(move || {
      let memory = unsafe { &*(memory_ptr as *const UvMemory) };
      std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        memory.validate(false);
      }))
    })
    .join()
    .unwrap();
    if cfg!(debug_assertions) {
      assert!(result.is_err());
    }
  }

  #[test]
  #[cfg_attr(debug_assertions, should_panic(expected = "Handle is closed"))]
  fn test_closed_block_fails_validation() {
    let owner = owner();
    owner.memory.set_closed();
    owner.memory.validate(false);
  }
}
