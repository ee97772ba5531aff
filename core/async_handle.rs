// Copyright 2018-2025 the Deno authors. MIT license.

use std::any::Any;
use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::UvError;
use crate::functions::UvFunctions;
use crate::handle::HandleBase;
use crate::loop_handle::UvLoopHandle;
use crate::memory;
use crate::memory::UvOwner;
use crate::uv;
use crate::uv::uv_async_t;
use crate::uv::uv_handle_type;

struct AsyncPtr(*mut uv_async_t);

// SAFETY: only passed to `uv_async_send`, which is thread-safe, and only
// while the slot holding it is populated.
unsafe impl Send for AsyncPtr {}
unsafe impl Sync for AsyncPtr {}

/// Cross-thread doorbell for one loop.
///
/// `send` may be called from any thread. Sends issued before the loop
/// thread gets to the wakeup coalesce into one callback, so the callback
/// must drain all pending work rather than one item.
pub struct UvAsyncHandle {
  base: HandleBase,
  callback: RefCell<Box<dyn FnMut()>>,
  slot: Arc<RwLock<Option<AsyncPtr>>>,
}

impl UvAsyncHandle {
  pub fn init(
    loop_: &UvLoopHandle,
    callback: impl FnMut() + 'static,
  ) -> Result<Rc<Self>, UvError> {
    let handle = Rc::new_cyclic(|weak: &Weak<Self>| Self {
      base: HandleBase::new(loop_, uv_handle_type::UV_ASYNC, weak.clone()),
      callback: RefCell::new(Box::new(callback)),
      slot: Arc::new(RwLock::new(None)),
    });
    let ptr = handle.base.ptr() as *mut uv_async_t;
    if let Err(err) =
      unsafe { loop_.functions().async_init(loop_.ptr(), ptr, on_async) }
    {
      handle.base.init_failed();
      return Err(err);
    }
    *handle.slot.write() = Some(AsyncPtr(ptr));
    Ok(handle)
  }

  /// Wake the loop from any thread.
  pub fn send(&self) -> Result<(), UvError> {
    self.sender().send()
  }

  /// A `Send + Sync` handle for waking this loop from other threads. It
  /// fails with `EBADF` once the handle has started closing.
  pub fn sender(&self) -> AsyncSender {
    AsyncSender {
      functions: self.base.functions().clone(),
      slot: self.slot.clone(),
    }
  }

  pub fn close(&self) {
    // Senders must stop using the block before libuv starts tearing it down.
    self.slot.write().take();
    self.base.close();
  }
}

impl Deref for UvAsyncHandle {
  type Target = HandleBase;

  fn deref(&self) -> &HandleBase {
    &self.base
  }
}

impl Drop for UvAsyncHandle {
  fn drop(&mut self) {
    self.slot.write().take();
  }
}

impl UvOwner for UvAsyncHandle {
  fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
    self
  }

  fn closed(&self) {
    self.base.fire_on_close();
  }

  fn dispose(&self) {
    self.close();
  }
}

unsafe extern "C" fn on_async(handle: *mut uv_async_t) {
  let Some(this) = (unsafe { memory::from_ptr::<UvAsyncHandle>(handle as _) })
  else {
    return;
  };
  let mut callback = this.callback.borrow_mut();
  (*callback)();
}

#[derive(Clone)]
pub struct AsyncSender {
  functions: Arc<UvFunctions>,
  slot: Arc<RwLock<Option<AsyncPtr>>>,
}

impl AsyncSender {
  pub fn send(&self) -> Result<(), UvError> {
    let slot = self.slot.read();
    match slot.as_ref() {
      Some(ptr) => unsafe { self.functions.async_send(ptr.0) },
      None => Err(self.functions.error(uv::UV_EBADF)),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.slot.read().is_none()
  }
}

impl std::fmt::Debug for AsyncSender {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AsyncSender")
      .field("closed", &self.is_closed())
      .finish()
  }
}
