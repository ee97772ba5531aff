// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::RefCell;
use std::rc::Weak;
use std::sync::Arc;

use crate::error::UvError;
use crate::functions::UvFunctions;
use crate::loop_handle::UvLoopHandle;
use crate::memory;
use crate::memory::UvMemory;
use crate::memory::UvOwner;
use crate::uv::uv_handle_t;
use crate::uv::uv_handle_type;
use crate::uv::uv_os_fd_t;

type CloseCallback = Box<dyn FnOnce()>;

/// State shared by every handle kind: the native block, the loop it lives
/// on and an optional callback fired once the handle is fully closed.
///
/// Closing follows the libuv protocol: `uv_close` is issued, the owner is
/// kept alive by a pin, and the block is freed from the close callback.
pub struct HandleBase {
  memory: UvMemory,
  loop_: UvLoopHandle,
  on_close: RefCell<Option<CloseCallback>>,
}

impl HandleBase {
  pub(crate) fn new(
    loop_: &UvLoopHandle,
    handle_type: uv_handle_type,
    owner: Weak<dyn UvOwner>,
  ) -> Self {
    let size = loop_.functions().handle_size(handle_type);
    Self {
      memory: UvMemory::allocate(size, owner),
      loop_: loop_.clone(),
      on_close: RefCell::new(None),
    }
  }

  /// Mark a handle whose native init failed as closed and free its block
  /// directly; the loop never saw it.
  pub(crate) fn init_failed(&self) {
    self.memory.set_closed();
    self.memory.release_block();
    self.on_close.borrow_mut().take();
  }

  pub fn memory(&self) -> &UvMemory {
    &self.memory
  }

  pub fn loop_handle(&self) -> &UvLoopHandle {
    &self.loop_
  }

  pub fn functions(&self) -> &Arc<UvFunctions> {
    self.loop_.functions()
  }

  pub fn ptr(&self) -> *mut uv_handle_t {
    self.memory.ptr() as *mut uv_handle_t
  }

  pub fn is_closed(&self) -> bool {
    self.memory.is_closed()
  }

  pub fn set_on_close(&self, callback: impl FnOnce() + 'static) {
    *self.on_close.borrow_mut() = Some(Box::new(callback));
  }

  pub(crate) fn fire_on_close(&self) {
    let callback = self.on_close.borrow_mut().take();
    if let Some(callback) = callback {
      callback();
    }
  }

  /// Let the handle keep the loop alive again.
  pub fn reference(&self) {
    unsafe { self.functions().ref_(self.ptr()) }
  }

  /// Stop the handle from keeping the loop alive on its own.
  pub fn unreference(&self) {
    unsafe { self.functions().unref(self.ptr()) }
  }

  pub fn has_ref(&self) -> bool {
    unsafe { self.functions().has_ref(self.ptr()) }
  }

  pub fn is_active(&self) -> bool {
    unsafe { self.functions().is_active(self.ptr()) }
  }

  pub fn fileno(&self) -> Result<uv_os_fd_t, UvError> {
    unsafe { self.functions().fileno(self.ptr()) }
  }

  /// Start closing the handle. Later calls are no-ops.
  pub fn close(&self) {
    if self.memory.is_closed() {
      return;
    }
    self.memory.validate(false);
    self.memory.set_closed();
    let ptr = self.memory.take_ptr();
    if ptr.is_null() {
      return;
    }
    // From `Drop` the owner can no longer be upgraded; the close callback
    // then only frees the block.
    let token = self.memory.token();
    if let Some(owner) = unsafe { memory::owner_of(ptr) } {
      memory::pin(token, owner);
    }
    unsafe {
      self
        .functions()
        .close(ptr as *mut uv_handle_t, Some(on_handle_closed))
    };
  }
}

impl Drop for HandleBase {
  fn drop(&mut self) {
    self.close();
  }
}

unsafe extern "C" fn on_handle_closed(handle: *mut uv_handle_t) {
  let owner = unsafe { memory::unpin(memory::token_of(handle as *const _)) };
  unsafe { memory::destroy_block(handle as *mut _) };
  if let Some(owner) = owner {
    owner.closed();
  }
}
