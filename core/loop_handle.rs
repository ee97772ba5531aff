// Copyright 2018-2025 the Deno authors. MIT license.

use std::any::Any;
use std::cell::Cell;
use std::ffi::c_int;
use std::ffi::c_void;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;

use crate::error::UvError;
use crate::functions::UvFunctions;
use crate::memory::UvMemory;
use crate::memory::UvOwner;
use crate::uv::uv_handle_t;
use crate::uv::uv_loop_t;
use crate::uv::uv_run_mode;

struct LoopInner {
  functions: Arc<UvFunctions>,
  memory: UvMemory,
  initialized: Cell<bool>,
}

impl UvOwner for LoopInner {
  fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
    self
  }
}

impl LoopInner {
  fn close(&self) -> Result<(), UvError> {
    if !self.initialized.get() || self.memory.is_closed() {
      return Ok(());
    }
    let ptr = self.memory.ptr() as *mut uv_loop_t;
    unsafe { self.functions.loop_close(ptr) }?;
    self.memory.set_closed();
    self.memory.release_block();
    Ok(())
  }
}

impl Drop for LoopInner {
  fn drop(&mut self) {
    if !self.initialized.get() || self.memory.is_closed() {
      return;
    }
    let ptr = self.memory.ptr() as *mut uv_loop_t;
    // Close callbacks of handles dropped just before the loop are still
    // queued.
    let _ = unsafe { self.functions.run(ptr, uv_run_mode::UV_RUN_NOWAIT) };
    if let Err(err) = self.close() {
      log::error!(
        target: "uv_transport",
        "Leaking event loop with live handles: {err}"
      );
      let _ = self.memory.take_ptr();
    }
  }
}

/// An event loop instance. Clones share the loop; the loop is closed when
/// the last clone goes away.
#[derive(Clone)]
pub struct UvLoopHandle(Rc<LoopInner>);

impl UvLoopHandle {
  /// Allocate and initialize a loop owned by the calling thread.
  pub fn init(functions: Arc<UvFunctions>) -> Result<Self, UvError> {
    let inner = Rc::new_cyclic(|weak: &Weak<LoopInner>| LoopInner {
      memory: UvMemory::allocate(functions.loop_size(), weak.clone()),
      functions,
      initialized: Cell::new(false),
    });
    let ptr = inner.memory.ptr() as *mut uv_loop_t;
    unsafe { inner.functions.loop_init(ptr) }?;
    inner.initialized.set(true);
    Ok(Self(inner))
  }

  pub fn functions(&self) -> &Arc<UvFunctions> {
    &self.0.functions
  }

  pub fn ptr(&self) -> *mut uv_loop_t {
    self.0.memory.ptr() as *mut uv_loop_t
  }

  pub fn is_closed(&self) -> bool {
    self.0.memory.is_closed()
  }

  /// Dispatch callbacks until the loop has no live handles or is stopped.
  /// Returns non-zero when live handles remain.
  pub fn run(&self, mode: uv_run_mode) -> Result<c_int, UvError> {
    unsafe { self.0.functions.run(self.ptr(), mode) }
  }

  /// Ask a running loop to return after the current iteration. Safe to call
  /// from inside a callback.
  pub fn stop(&self) {
    unsafe { self.0.functions.stop(self.ptr()) }
  }

  pub fn now(&self) -> u64 {
    unsafe { self.0.functions.now(self.ptr()) }
  }

  pub fn update_time(&self) {
    unsafe { self.0.functions.update_time(self.ptr()) }
  }

  /// Visit every handle that is not yet closed.
  pub fn walk<F>(&self, mut callback: F)
  where
    F: FnMut(*mut uv_handle_t),
  {
    unsafe extern "C" fn trampoline<F: FnMut(*mut uv_handle_t)>(
      handle: *mut uv_handle_t,
      arg: *mut c_void,
    ) {
      let callback = unsafe { &mut *(arg as *mut F) };
      callback(handle);
    }

    unsafe {
      self.0.functions.walk(
        self.ptr(),
        trampoline::<F>,
        &mut callback as *mut F as *mut c_void,
      )
    }
  }

  /// Close the loop now. Fails with `EBUSY` while handles are still open.
  pub fn close(&self) -> Result<(), UvError> {
    self.0.close()
  }
}

impl std::fmt::Debug for UvLoopHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("UvLoopHandle").field(&self.0.memory).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::uv;

  #[test]
  fn test_run_without_handles_returns_immediately() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    assert_eq!(loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap(), 0);
    assert_eq!(loop_.run(uv_run_mode::UV_RUN_NOWAIT).unwrap(), 0);
  }

  #[test]
  fn test_now_is_monotonic() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let before = loop_.now();
    std::thread::sleep(std::time::Duration::from_millis(5));
    loop_.update_time();
    assert!(loop_.now() >= before + 5);
  }

  #[test]
  fn test_close_is_idempotent() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    loop_.close().unwrap();
    assert!(loop_.is_closed());
    loop_.close().unwrap();
  }

  #[test]
  fn test_walk_visits_open_handles() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let timer = crate::UvTimerHandle::init(&loop_, None).unwrap();
    let mut seen = Vec::new();
    loop_.walk(|handle| seen.push(unsafe { (*handle).r#type }));
    assert_eq!(seen, vec![uv::uv_handle_type::UV_TIMER]);
    timer.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
    let mut count = 0;
    loop_.walk(|_| count += 1);
    assert_eq!(count, 0);
  }

  #[test]
  fn test_close_with_open_handle_is_busy() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let timer = crate::UvTimerHandle::init(&loop_, None).unwrap();
    let err = loop_.close().unwrap_err();
    assert_eq!(err.code(), uv::UV_EBUSY);
    timer.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
    loop_.close().unwrap();
  }
}
