// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::c_int;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use super::UV_EINVAL;
use super::UV_HANDLE_ACTIVE;
use super::UV_HANDLE_REF;
use super::event_loop::LoopSignal;
use super::event_loop::get_inner;
use super::init_handle_header;
use super::uv_async_cb;
use super::uv_async_t;
use super::uv_handle_t;
use super::uv_handle_type;
use super::uv_loop_t;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_async_init(
  loop_: *mut uv_loop_t,
  handle: *mut uv_async_t,
  async_cb: Option<uv_async_cb>,
) -> c_int {
  unsafe {
    use std::ptr::addr_of_mut;
    let signal = Arc::clone(&get_inner(loop_).signal);
    init_handle_header(
      handle as *mut uv_handle_t,
      loop_,
      uv_handle_type::UV_ASYNC,
      UV_HANDLE_REF | UV_HANDLE_ACTIVE,
    );
    addr_of_mut!((*handle).async_cb).write(async_cb);
    addr_of_mut!((*handle).pending).write(Default::default());
    addr_of_mut!((*handle).signal).write(Arc::into_raw(signal) as *const _);
  }
  0
}

/// Thread-safe. Sends that land before the loop thread picks up the wakeup
/// are coalesced into a single callback.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_async_send(handle: *mut uv_async_t) -> c_int {
  unsafe {
    let signal = (*handle).signal as *const LoopSignal;
    if signal.is_null() {
      return UV_EINVAL;
    }
    if (*handle).pending.swap(true, Ordering::AcqRel) {
      return 0;
    }
    (*signal).notify();
  }
  0
}

/// Called from the loop's async phase. Returns whether the callback ran.
pub(crate) unsafe fn dispatch(handle: *mut uv_async_t) -> bool {
  unsafe {
    if !(*handle).pending.swap(false, Ordering::AcqRel) {
      return false;
    }
    match (*handle).async_cb {
      Some(cb) => {
        cb(handle);
        true
      }
      None => false,
    }
  }
}

pub(crate) unsafe fn finish_close(handle: *mut uv_async_t) {
  unsafe {
    let signal = std::mem::replace(&mut (*handle).signal, std::ptr::null());
    if !signal.is_null() {
      drop(Arc::from_raw(signal as *const LoopSignal));
    }
  }
}
