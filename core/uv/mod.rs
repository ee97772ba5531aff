// Copyright 2018-2025 the Deno authors. MIT license.

// Pure-Rust event loop exposing the libuv C ABI. Drop-in replacement for the
// subset of libuv the transport drives: loop, async, timer, tcp and pipe
// handles, write/connect/shutdown requests.
//
// Functions are `#[unsafe(no_mangle)] extern "C"` so they can sit in the
// same function table as symbols resolved from a system libuv. Every struct
// starts with the `data` word, like libuv, and no init function touches it.
// The loop is driven by a per-loop tokio current-thread runtime: `uv_run`
// blocks inside the tokio driver between iterations.

#![allow(non_camel_case_types)]

use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_void;
use std::sync::atomic::AtomicBool;

mod async_handle;
mod errno;
mod event_loop;
mod pipe;
mod sockaddr;
mod stream;
mod tcp;
mod timer;

pub use async_handle::*;
pub use errno::*;
pub use event_loop::*;
pub use pipe::*;
pub use sockaddr::*;
pub use stream::*;
pub use tcp::*;
pub use timer::*;

use event_loop::get_inner;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum uv_handle_type {
  UV_UNKNOWN_HANDLE = 0,
  UV_ASYNC = 1,
  UV_NAMED_PIPE = 7,
  UV_TCP = 12,
  UV_TIMER = 13,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum uv_req_type {
  UV_UNKNOWN_REQ = 0,
  UV_REQ = 1,
  UV_CONNECT = 2,
  UV_WRITE = 3,
  UV_SHUTDOWN = 4,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum uv_run_mode {
  UV_RUN_DEFAULT = 0,
  UV_RUN_ONCE = 1,
  UV_RUN_NOWAIT = 2,
}

pub(crate) const UV_HANDLE_ACTIVE: u32 = 1 << 0;
pub(crate) const UV_HANDLE_REF: u32 = 1 << 1;
pub(crate) const UV_HANDLE_CLOSING: u32 = 1 << 2;
pub(crate) const UV_HANDLE_CLOSED: u32 = 1 << 3;

pub type uv_os_fd_t = c_int;
pub type uv_os_sock_t = c_int;
pub type uv_file = c_int;

#[repr(C)]
pub struct uv_loop_t {
  pub data: *mut c_void,
  pub(crate) internal: *mut c_void,
}

#[repr(C)]
pub struct uv_handle_t {
  pub data: *mut c_void,
  pub loop_: *mut uv_loop_t,
  pub r#type: uv_handle_type,
  pub flags: u32,
  pub(crate) close_cb: Option<uv_close_cb>,
}

#[repr(C)]
pub struct uv_stream_t {
  pub data: *mut c_void,
  pub loop_: *mut uv_loop_t,
  pub r#type: uv_handle_type,
  pub flags: u32,
  pub(crate) close_cb: Option<uv_close_cb>,
  pub(crate) internal: *mut c_void,
}

#[repr(C)]
pub struct uv_tcp_t {
  pub data: *mut c_void,
  pub loop_: *mut uv_loop_t,
  pub r#type: uv_handle_type,
  pub flags: u32,
  pub(crate) close_cb: Option<uv_close_cb>,
  pub(crate) internal: *mut c_void,
}

#[repr(C)]
pub struct uv_pipe_t {
  pub data: *mut c_void,
  pub loop_: *mut uv_loop_t,
  pub r#type: uv_handle_type,
  pub flags: u32,
  pub(crate) close_cb: Option<uv_close_cb>,
  pub(crate) internal: *mut c_void,
  pub ipc: c_int,
}

#[repr(C)]
pub struct uv_async_t {
  pub data: *mut c_void,
  pub loop_: *mut uv_loop_t,
  pub r#type: uv_handle_type,
  pub flags: u32,
  pub(crate) close_cb: Option<uv_close_cb>,
  pub(crate) async_cb: Option<uv_async_cb>,
  pub(crate) pending: AtomicBool,
  pub(crate) signal: *const c_void,
}

#[repr(C)]
pub struct uv_timer_t {
  pub data: *mut c_void,
  pub loop_: *mut uv_loop_t,
  pub r#type: uv_handle_type,
  pub flags: u32,
  pub(crate) close_cb: Option<uv_close_cb>,
  pub(crate) timer_cb: Option<uv_timer_cb>,
  pub(crate) timeout: u64,
  pub(crate) repeat: u64,
  pub(crate) timer_id: u64,
  pub(crate) deadline: u64,
}

#[repr(C)]
pub struct uv_req_t {
  pub data: *mut c_void,
  pub r#type: uv_req_type,
}

#[repr(C)]
pub struct uv_write_t {
  pub data: *mut c_void,
  pub r#type: uv_req_type,
  pub handle: *mut uv_stream_t,
}

#[repr(C)]
pub struct uv_connect_t {
  pub data: *mut c_void,
  pub r#type: uv_req_type,
  pub handle: *mut uv_stream_t,
}

#[repr(C)]
pub struct uv_shutdown_t {
  pub data: *mut c_void,
  pub r#type: uv_req_type,
  pub handle: *mut uv_stream_t,
}

/// I/O buffer descriptor matching libuv's `uv_buf_t`: `{base, len}` on
/// unix (same as `struct iovec`), `{len, base}` on windows.
#[cfg(unix)]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct uv_buf_t {
  pub base: *mut c_char,
  pub len: usize,
}

#[cfg(windows)]
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct uv_buf_t {
  pub len: u32,
  pub base: *mut c_char,
}

impl uv_buf_t {
  pub const fn empty() -> Self {
    Self::new(std::ptr::null_mut(), 0)
  }

  #[cfg(unix)]
  pub const fn new(base: *mut c_char, len: usize) -> Self {
    Self { base, len }
  }

  #[cfg(windows)]
  pub const fn new(base: *mut c_char, len: usize) -> Self {
    Self {
      len: len as u32,
      base,
    }
  }

  pub fn len(&self) -> usize {
    self.len as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0 || self.base.is_null()
  }

  /// # Safety
  /// `base` must point to `len` readable bytes for the returned lifetime.
  pub(crate) unsafe fn as_slice<'a>(&self) -> &'a [u8] {
    if self.is_empty() {
      return &[];
    }
    unsafe { std::slice::from_raw_parts(self.base as *const u8, self.len()) }
  }
}

pub type uv_close_cb = unsafe extern "C" fn(*mut uv_handle_t);
pub type uv_walk_cb = unsafe extern "C" fn(*mut uv_handle_t, *mut c_void);
pub type uv_async_cb = unsafe extern "C" fn(*mut uv_async_t);
pub type uv_timer_cb = unsafe extern "C" fn(*mut uv_timer_t);
pub type uv_write_cb = unsafe extern "C" fn(*mut uv_write_t, c_int);
pub type uv_alloc_cb =
  unsafe extern "C" fn(*mut uv_handle_t, usize, *mut uv_buf_t);
pub type uv_read_cb =
  unsafe extern "C" fn(*mut uv_stream_t, isize, *const uv_buf_t);
pub type uv_connection_cb = unsafe extern "C" fn(*mut uv_stream_t, c_int);
pub type uv_connect_cb = unsafe extern "C" fn(*mut uv_connect_t, c_int);
pub type uv_shutdown_cb = unsafe extern "C" fn(*mut uv_shutdown_t, c_int);

// Stream-level code reaches the state of tcp and pipe handles through
// `uv_stream_t`, so the shared prefix must line up.
static_assertions::const_assert_eq!(
  std::mem::offset_of!(uv_tcp_t, internal),
  std::mem::offset_of!(uv_stream_t, internal)
);
static_assertions::const_assert_eq!(
  std::mem::offset_of!(uv_pipe_t, internal),
  std::mem::offset_of!(uv_stream_t, internal)
);
static_assertions::const_assert_eq!(
  std::mem::offset_of!(uv_async_t, close_cb),
  std::mem::offset_of!(uv_handle_t, close_cb)
);
static_assertions::const_assert_eq!(
  std::mem::offset_of!(uv_timer_t, close_cb),
  std::mem::offset_of!(uv_handle_t, close_cb)
);
static_assertions::const_assert_eq!(std::mem::offset_of!(uv_loop_t, data), 0);
static_assertions::const_assert_eq!(std::mem::offset_of!(uv_handle_t, data), 0);
static_assertions::const_assert_eq!(std::mem::offset_of!(uv_write_t, data), 0);

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_close(
  handle: *mut uv_handle_t,
  close_cb: Option<uv_close_cb>,
) {
  unsafe {
    if (*handle).flags & (UV_HANDLE_CLOSING | UV_HANDLE_CLOSED) != 0 {
      return;
    }
    (*handle).flags |= UV_HANDLE_CLOSING;
    (*handle).flags &= !UV_HANDLE_ACTIVE;
    (*handle).close_cb = close_cb;

    let inner = get_inner((*handle).loop_);
    match (*handle).r#type {
      uv_handle_type::UV_TIMER => {
        inner.stop_timer(handle as *mut uv_timer_t);
      }
      uv_handle_type::UV_TCP | uv_handle_type::UV_NAMED_PIPE => {
        stream::stop_io(handle as *mut uv_stream_t);
      }
      _ => {}
    }

    inner.closing_handles.borrow_mut().push_back(handle);
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_ref(handle: *mut uv_handle_t) {
  unsafe {
    (*handle).flags |= UV_HANDLE_REF;
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_unref(handle: *mut uv_handle_t) {
  unsafe {
    (*handle).flags &= !UV_HANDLE_REF;
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_has_ref(handle: *const uv_handle_t) -> c_int {
  unsafe { ((*handle).flags & UV_HANDLE_REF != 0) as c_int }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_is_active(handle: *const uv_handle_t) -> c_int {
  unsafe { ((*handle).flags & UV_HANDLE_ACTIVE != 0) as c_int }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_is_closing(handle: *const uv_handle_t) -> c_int {
  unsafe {
    ((*handle).flags & (UV_HANDLE_CLOSING | UV_HANDLE_CLOSED) != 0) as c_int
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_handle_size(r#type: uv_handle_type) -> usize {
  match r#type {
    uv_handle_type::UV_ASYNC => std::mem::size_of::<uv_async_t>(),
    uv_handle_type::UV_NAMED_PIPE => std::mem::size_of::<uv_pipe_t>(),
    uv_handle_type::UV_TCP => std::mem::size_of::<uv_tcp_t>(),
    uv_handle_type::UV_TIMER => std::mem::size_of::<uv_timer_t>(),
    uv_handle_type::UV_UNKNOWN_HANDLE => usize::MAX,
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_req_size(r#type: uv_req_type) -> usize {
  match r#type {
    uv_req_type::UV_REQ => std::mem::size_of::<uv_req_t>(),
    uv_req_type::UV_CONNECT => std::mem::size_of::<uv_connect_t>(),
    uv_req_type::UV_WRITE => std::mem::size_of::<uv_write_t>(),
    uv_req_type::UV_SHUTDOWN => std::mem::size_of::<uv_shutdown_t>(),
    uv_req_type::UV_UNKNOWN_REQ => usize::MAX,
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_fileno(
  handle: *const uv_handle_t,
  fd: *mut uv_os_fd_t,
) -> c_int {
  unsafe {
    if (*handle).flags & (UV_HANDLE_CLOSING | UV_HANDLE_CLOSED) != 0 {
      return UV_EBADF;
    }
    match (*handle).r#type {
      uv_handle_type::UV_TCP | uv_handle_type::UV_NAMED_PIPE => {
        match stream::raw_fd(handle as *mut uv_stream_t) {
          Some(raw) => {
            *fd = raw;
            0
          }
          None => UV_EBADF,
        }
      }
      _ => UV_EINVAL,
    }
  }
}

/// Common header write shared by every `*_init` function. `data` is left
/// untouched.
pub(crate) unsafe fn init_handle_header(
  handle: *mut uv_handle_t,
  loop_: *mut uv_loop_t,
  r#type: uv_handle_type,
  flags: u32,
) {
  unsafe {
    use std::ptr::addr_of_mut;
    use std::ptr::write;
    write(addr_of_mut!((*handle).loop_), loop_);
    write(addr_of_mut!((*handle).r#type), r#type);
    write(addr_of_mut!((*handle).flags), flags);
    write(addr_of_mut!((*handle).close_cb), None);
    get_inner(loop_).handles.borrow_mut().push(handle);
  }
}

#[inline]
pub(crate) unsafe fn is_closing(handle: *const uv_handle_t) -> bool {
  unsafe { (*handle).flags & (UV_HANDLE_CLOSING | UV_HANDLE_CLOSED) != 0 }
}

#[cfg(test)]
pub(crate) mod test_util {
  use super::*;
  use std::mem::MaybeUninit;

  pub unsafe fn make_loop() -> *mut uv_loop_t {
    let loop_ = Box::into_raw(Box::new(MaybeUninit::<uv_loop_t>::zeroed()))
      as *mut uv_loop_t;
    assert_eq!(unsafe { uv_loop_init(loop_) }, 0);
    loop_
  }

  pub unsafe fn destroy_loop(loop_: *mut uv_loop_t) {
    unsafe {
      assert_eq!(uv_loop_close(loop_), 0);
      drop(Box::from_raw(loop_));
    }
  }

  /// Zeroed heap block for a handle or request, like the wrapper layer's
  /// `calloc`.
  pub fn alloc<T>() -> *mut T {
    Box::into_raw(Box::new(MaybeUninit::<T>::zeroed())) as *mut T
  }

  pub unsafe fn free<T>(ptr: *mut T) {
    unsafe { drop(Box::from_raw(ptr as *mut MaybeUninit<T>)) };
  }
}
