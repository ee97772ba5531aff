// Copyright 2018-2025 the Deno authors. MIT license.

//! Typed table over the libuv entry points the transport uses.
//!
//! The table is either bound to the vendored loop in [`crate::uv`] or
//! resolved symbol by symbol from a system libuv. Either way it is complete:
//! a library missing a single symbol is rejected at load time.

use std::ffi::CStr;
use std::ffi::CString;
use std::ffi::c_char;
use std::ffi::c_int;
use std::ffi::c_uint;
use std::ffi::c_void;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;

use crate::error::UvError;
use crate::error::UvLoadError;
use crate::uv;
use crate::uv::uv_alloc_cb;
use crate::uv::uv_async_cb;
use crate::uv::uv_async_t;
use crate::uv::uv_buf_t;
use crate::uv::uv_close_cb;
use crate::uv::uv_connect_cb;
use crate::uv::uv_connect_t;
use crate::uv::uv_connection_cb;
use crate::uv::uv_file;
use crate::uv::uv_handle_t;
use crate::uv::uv_handle_type;
use crate::uv::uv_loop_t;
use crate::uv::uv_os_fd_t;
use crate::uv::uv_os_sock_t;
use crate::uv::uv_pipe_t;
use crate::uv::uv_read_cb;
use crate::uv::uv_req_type;
use crate::uv::uv_run_mode;
use crate::uv::uv_shutdown_cb;
use crate::uv::uv_shutdown_t;
use crate::uv::uv_stream_t;
use crate::uv::uv_tcp_t;
use crate::uv::uv_timer_cb;
use crate::uv::uv_timer_t;
use crate::uv::uv_walk_cb;
use crate::uv::uv_write_cb;
use crate::uv::uv_write_t;

macro_rules! uv_functions {
  ($($name:ident: fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
    pub struct UvFunctions {
      $($name: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
      // Keeps the resolved symbols valid.
      _library: Option<libloading::Library>,
    }

    impl UvFunctions {
      fn vendored() -> Self {
        Self {
          $($name: uv::$name,)*
          _library: None,
        }
      }

      /// # Safety
      /// The library must export the libuv ABI for every listed symbol.
      unsafe fn from_library(
        library: libloading::Library,
        path: &str,
      ) -> Result<Self, UvLoadError> {
        $(
          let $name = unsafe {
            *library
              .get::<unsafe extern "C" fn($($arg),*) $(-> $ret)?>(
                concat!(stringify!($name), "\0").as_bytes(),
              )
              .map_err(|source| UvLoadError::MissingSymbol {
                name: stringify!($name),
                path: path.to_string(),
                source,
              })?
          };
        )*
        Ok(Self {
          $($name,)*
          _library: Some(library),
        })
      }
    }
  };
}

uv_functions! {
  uv_loop_init: fn(*mut uv_loop_t) -> c_int;
  uv_loop_close: fn(*mut uv_loop_t) -> c_int;
  uv_loop_size: fn() -> usize;
  uv_run: fn(*mut uv_loop_t, uv_run_mode) -> c_int;
  uv_stop: fn(*mut uv_loop_t);
  uv_now: fn(*const uv_loop_t) -> u64;
  uv_update_time: fn(*mut uv_loop_t);
  uv_walk: fn(*mut uv_loop_t, uv_walk_cb, *mut c_void);
  uv_close: fn(*mut uv_handle_t, Option<uv_close_cb>);
  uv_ref: fn(*mut uv_handle_t);
  uv_unref: fn(*mut uv_handle_t);
  uv_has_ref: fn(*const uv_handle_t) -> c_int;
  uv_is_active: fn(*const uv_handle_t) -> c_int;
  uv_is_closing: fn(*const uv_handle_t) -> c_int;
  uv_handle_size: fn(uv_handle_type) -> usize;
  uv_req_size: fn(uv_req_type) -> usize;
  uv_fileno: fn(*const uv_handle_t, *mut uv_os_fd_t) -> c_int;
  uv_async_init: fn(*mut uv_loop_t, *mut uv_async_t, Option<uv_async_cb>) -> c_int;
  uv_async_send: fn(*mut uv_async_t) -> c_int;
  uv_timer_init: fn(*mut uv_loop_t, *mut uv_timer_t) -> c_int;
  uv_timer_start: fn(*mut uv_timer_t, uv_timer_cb, u64, u64) -> c_int;
  uv_timer_stop: fn(*mut uv_timer_t) -> c_int;
  uv_timer_again: fn(*mut uv_timer_t) -> c_int;
  uv_timer_get_repeat: fn(*const uv_timer_t) -> u64;
  uv_timer_set_repeat: fn(*mut uv_timer_t, u64);
  uv_listen: fn(*mut uv_stream_t, c_int, uv_connection_cb) -> c_int;
  uv_accept: fn(*mut uv_stream_t, *mut uv_stream_t) -> c_int;
  uv_read_start: fn(*mut uv_stream_t, uv_alloc_cb, uv_read_cb) -> c_int;
  uv_read_stop: fn(*mut uv_stream_t) -> c_int;
  uv_write: fn(*mut uv_write_t, *mut uv_stream_t, *const uv_buf_t, c_uint, Option<uv_write_cb>) -> c_int;
  uv_try_write: fn(*mut uv_stream_t, *const uv_buf_t, c_uint) -> c_int;
  uv_shutdown: fn(*mut uv_shutdown_t, *mut uv_stream_t, Option<uv_shutdown_cb>) -> c_int;
  uv_stream_get_write_queue_size: fn(*const uv_stream_t) -> usize;
  uv_tcp_init: fn(*mut uv_loop_t, *mut uv_tcp_t) -> c_int;
  uv_tcp_open: fn(*mut uv_tcp_t, uv_os_sock_t) -> c_int;
  uv_tcp_nodelay: fn(*mut uv_tcp_t, c_int) -> c_int;
  uv_tcp_bind: fn(*mut uv_tcp_t, *const libc::sockaddr, c_uint) -> c_int;
  uv_tcp_connect: fn(*mut uv_connect_t, *mut uv_tcp_t, *const libc::sockaddr, Option<uv_connect_cb>) -> c_int;
  uv_tcp_getsockname: fn(*const uv_tcp_t, *mut libc::sockaddr, *mut c_int) -> c_int;
  uv_tcp_getpeername: fn(*const uv_tcp_t, *mut libc::sockaddr, *mut c_int) -> c_int;
  uv_pipe_init: fn(*mut uv_loop_t, *mut uv_pipe_t, c_int) -> c_int;
  uv_pipe_open: fn(*mut uv_pipe_t, uv_file) -> c_int;
  uv_pipe_bind: fn(*mut uv_pipe_t, *const c_char) -> c_int;
  uv_pipe_connect: fn(*mut uv_connect_t, *mut uv_pipe_t, *const c_char, Option<uv_connect_cb>);
  uv_pipe_pending_count: fn(*mut uv_pipe_t) -> c_int;
  uv_ip4_addr: fn(*const c_char, c_int, *mut libc::sockaddr_in) -> c_int;
  uv_ip6_addr: fn(*const c_char, c_int, *mut libc::sockaddr_in6) -> c_int;
  uv_err_name: fn(c_int) -> *const c_char;
  uv_strerror: fn(c_int) -> *const c_char;
}

// SAFETY: the table holds plain function pointers and the library handle.
unsafe impl Send for UvFunctions {}
unsafe impl Sync for UvFunctions {}

impl std::fmt::Debug for UvFunctions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UvFunctions")
      .field("dynamic", &self._library.is_some())
      .finish()
  }
}

impl UvFunctions {
  /// The table over the vendored loop, created once per process.
  pub fn builtin() -> Arc<UvFunctions> {
    static BUILTIN: OnceLock<Arc<UvFunctions>> = OnceLock::new();
    BUILTIN
      .get_or_init(|| Arc::new(UvFunctions::vendored()))
      .clone()
  }

  /// Resolve every entry point from the shared library at `path`.
  ///
  /// # Safety
  /// Loading runs the library's initializers, and the library must implement
  /// the libuv ABI for the symbols it exports.
  pub unsafe fn load(path: impl AsRef<Path>) -> Result<Self, UvLoadError> {
    let path = path.as_ref();
    let display = path.display().to_string();
    let library = unsafe { libloading::Library::new(path) }.map_err(|source| {
      UvLoadError::Library {
        path: display.clone(),
        source,
      }
    })?;
    let functions = unsafe { Self::from_library(library, &display)? };
    log::debug!(target: "uv_transport", "loaded libuv from {display}");
    Ok(functions)
  }

  pub fn is_dynamic(&self) -> bool {
    self._library.is_some()
  }

  pub fn is_windows(&self) -> bool {
    cfg!(windows)
  }

  /// Pass non-negative statuses through; turn negative ones into errors.
  pub fn check(&self, code: c_int) -> Result<c_int, UvError> {
    if code < 0 {
      Err(self.error(code))
    } else {
      Ok(code)
    }
  }

  pub fn error(&self, code: c_int) -> UvError {
    let (name, description) = unsafe {
      (
        CStr::from_ptr((self.uv_err_name)(code)),
        CStr::from_ptr((self.uv_strerror)(code)),
      )
    };
    UvError::new(
      code,
      name.to_string_lossy(),
      description.to_string_lossy(),
    )
  }

  pub fn buf_init(&self, base: *mut u8, len: usize) -> uv_buf_t {
    uv_buf_t::new(base as *mut c_char, len)
  }

  pub fn loop_size(&self) -> usize {
    unsafe { (self.uv_loop_size)() }
  }

  pub fn handle_size(&self, handle_type: uv_handle_type) -> usize {
    unsafe { (self.uv_handle_size)(handle_type) }
  }

  pub fn req_size(&self, req_type: uv_req_type) -> usize {
    unsafe { (self.uv_req_size)(req_type) }
  }

  pub fn err_name(&self, code: c_int) -> String {
    self.error(code).name().to_string()
  }

  /// Parse a textual IP address, IPv4 first. When both parses fail the IPv4
  /// error is reported.
  pub fn ip_addr(&self, ip: &str, port: u16) -> Result<SocketAddr, UvError> {
    let Ok(c_ip) = CString::new(ip) else {
      return Err(self.error(uv::UV_EINVAL));
    };
    unsafe {
      let mut v4: libc::sockaddr_in = std::mem::zeroed();
      let v4_status = (self.uv_ip4_addr)(c_ip.as_ptr(), port as c_int, &mut v4);
      if v4_status == 0 {
        return Ok(SocketAddr::from((
          std::net::Ipv4Addr::from(u32::from_be(v4.sin_addr.s_addr)),
          port,
        )));
      }
      let mut v6: libc::sockaddr_in6 = std::mem::zeroed();
      let v6_status = (self.uv_ip6_addr)(c_ip.as_ptr(), port as c_int, &mut v6);
      if v6_status == 0 {
        return Ok(SocketAddr::V6(std::net::SocketAddrV6::new(
          std::net::Ipv6Addr::from(v6.sin6_addr.s6_addr),
          port,
          0,
          v6.sin6_scope_id,
        )));
      }
      Err(self.error(v4_status))
    }
  }
}

/// Status-checking wrappers, one per entry point. Pointers must reference
/// live blocks of the right kind and size, on the loop's thread unless noted.
#[allow(clippy::missing_safety_doc)]
impl UvFunctions {
  pub unsafe fn loop_init(&self, loop_: *mut uv_loop_t) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_loop_init)(loop_) }).map(drop)
  }

  pub unsafe fn loop_close(&self, loop_: *mut uv_loop_t) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_loop_close)(loop_) }).map(drop)
  }

  pub unsafe fn run(
    &self,
    loop_: *mut uv_loop_t,
    mode: uv_run_mode,
  ) -> Result<c_int, UvError> {
    self.check(unsafe { (self.uv_run)(loop_, mode) })
  }

  pub unsafe fn stop(&self, loop_: *mut uv_loop_t) {
    unsafe { (self.uv_stop)(loop_) }
  }

  pub unsafe fn now(&self, loop_: *const uv_loop_t) -> u64 {
    unsafe { (self.uv_now)(loop_) }
  }

  pub unsafe fn update_time(&self, loop_: *mut uv_loop_t) {
    unsafe { (self.uv_update_time)(loop_) }
  }

  pub unsafe fn walk(
    &self,
    loop_: *mut uv_loop_t,
    walk_cb: uv_walk_cb,
    arg: *mut c_void,
  ) {
    unsafe { (self.uv_walk)(loop_, walk_cb, arg) }
  }

  pub unsafe fn close(
    &self,
    handle: *mut uv_handle_t,
    close_cb: Option<uv_close_cb>,
  ) {
    unsafe { (self.uv_close)(handle, close_cb) }
  }

  pub unsafe fn ref_(&self, handle: *mut uv_handle_t) {
    unsafe { (self.uv_ref)(handle) }
  }

  pub unsafe fn unref(&self, handle: *mut uv_handle_t) {
    unsafe { (self.uv_unref)(handle) }
  }

  pub unsafe fn has_ref(&self, handle: *const uv_handle_t) -> bool {
    unsafe { (self.uv_has_ref)(handle) != 0 }
  }

  pub unsafe fn is_active(&self, handle: *const uv_handle_t) -> bool {
    unsafe { (self.uv_is_active)(handle) != 0 }
  }

  pub unsafe fn is_closing(&self, handle: *const uv_handle_t) -> bool {
    unsafe { (self.uv_is_closing)(handle) != 0 }
  }

  pub unsafe fn fileno(
    &self,
    handle: *const uv_handle_t,
  ) -> Result<uv_os_fd_t, UvError> {
    let mut fd: uv_os_fd_t = -1;
    self.check(unsafe { (self.uv_fileno)(handle, &mut fd) })?;
    Ok(fd)
  }

  pub unsafe fn async_init(
    &self,
    loop_: *mut uv_loop_t,
    handle: *mut uv_async_t,
    cb: uv_async_cb,
  ) -> Result<(), UvError> {
    self
      .check(unsafe { (self.uv_async_init)(loop_, handle, Some(cb)) })
      .map(drop)
  }

  /// Safe to call from any thread while the handle is open.
  pub unsafe fn async_send(&self, handle: *mut uv_async_t) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_async_send)(handle) }).map(drop)
  }

  pub unsafe fn timer_init(
    &self,
    loop_: *mut uv_loop_t,
    handle: *mut uv_timer_t,
  ) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_timer_init)(loop_, handle) }).map(drop)
  }

  pub unsafe fn timer_start(
    &self,
    handle: *mut uv_timer_t,
    cb: uv_timer_cb,
    timeout: u64,
    repeat: u64,
  ) -> Result<(), UvError> {
    self
      .check(unsafe { (self.uv_timer_start)(handle, cb, timeout, repeat) })
      .map(drop)
  }

  pub unsafe fn timer_stop(&self, handle: *mut uv_timer_t) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_timer_stop)(handle) }).map(drop)
  }

  pub unsafe fn timer_again(
    &self,
    handle: *mut uv_timer_t,
  ) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_timer_again)(handle) }).map(drop)
  }

  pub unsafe fn timer_get_repeat(&self, handle: *const uv_timer_t) -> u64 {
    unsafe { (self.uv_timer_get_repeat)(handle) }
  }

  pub unsafe fn timer_set_repeat(&self, handle: *mut uv_timer_t, repeat: u64) {
    unsafe { (self.uv_timer_set_repeat)(handle, repeat) }
  }

  pub unsafe fn listen(
    &self,
    stream: *mut uv_stream_t,
    backlog: c_int,
    cb: uv_connection_cb,
  ) -> Result<(), UvError> {
    self
      .check(unsafe { (self.uv_listen)(stream, backlog, cb) })
      .map(drop)
  }

  pub unsafe fn accept(
    &self,
    server: *mut uv_stream_t,
    client: *mut uv_stream_t,
  ) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_accept)(server, client) }).map(drop)
  }

  pub unsafe fn read_start(
    &self,
    stream: *mut uv_stream_t,
    alloc_cb: uv_alloc_cb,
    read_cb: uv_read_cb,
  ) -> Result<(), UvError> {
    self
      .check(unsafe { (self.uv_read_start)(stream, alloc_cb, read_cb) })
      .map(drop)
  }

  pub unsafe fn read_stop(&self, stream: *mut uv_stream_t) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_read_stop)(stream) }).map(drop)
  }

  pub unsafe fn write(
    &self,
    req: *mut uv_write_t,
    stream: *mut uv_stream_t,
    bufs: *const uv_buf_t,
    nbufs: usize,
    cb: uv_write_cb,
  ) -> Result<(), UvError> {
    self
      .check(unsafe {
        (self.uv_write)(req, stream, bufs, nbufs as c_uint, Some(cb))
      })
      .map(drop)
  }

  pub unsafe fn try_write(
    &self,
    stream: *mut uv_stream_t,
    bufs: *const uv_buf_t,
    nbufs: usize,
  ) -> Result<usize, UvError> {
    self
      .check(unsafe { (self.uv_try_write)(stream, bufs, nbufs as c_uint) })
      .map(|n| n as usize)
  }

  pub unsafe fn shutdown(
    &self,
    req: *mut uv_shutdown_t,
    stream: *mut uv_stream_t,
    cb: uv_shutdown_cb,
  ) -> Result<(), UvError> {
    self
      .check(unsafe { (self.uv_shutdown)(req, stream, Some(cb)) })
      .map(drop)
  }

  pub unsafe fn write_queue_size(&self, stream: *const uv_stream_t) -> usize {
    unsafe { (self.uv_stream_get_write_queue_size)(stream) }
  }

  pub unsafe fn tcp_init(
    &self,
    loop_: *mut uv_loop_t,
    handle: *mut uv_tcp_t,
  ) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_tcp_init)(loop_, handle) }).map(drop)
  }

  pub unsafe fn tcp_open(
    &self,
    handle: *mut uv_tcp_t,
    sock: uv_os_sock_t,
  ) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_tcp_open)(handle, sock) }).map(drop)
  }

  pub unsafe fn tcp_nodelay(
    &self,
    handle: *mut uv_tcp_t,
    enable: bool,
  ) -> Result<(), UvError> {
    self
      .check(unsafe { (self.uv_tcp_nodelay)(handle, enable as c_int) })
      .map(drop)
  }

  pub unsafe fn tcp_bind(
    &self,
    handle: *mut uv_tcp_t,
    addr: &SocketAddr,
  ) -> Result<(), UvError> {
    let addr = socket2::SockAddr::from(*addr);
    self
      .check(unsafe { (self.uv_tcp_bind)(handle, addr.as_ptr(), 0) })
      .map(drop)
  }

  pub unsafe fn tcp_connect(
    &self,
    req: *mut uv_connect_t,
    handle: *mut uv_tcp_t,
    addr: &SocketAddr,
    cb: uv_connect_cb,
  ) -> Result<(), UvError> {
    let addr = socket2::SockAddr::from(*addr);
    self
      .check(unsafe {
        (self.uv_tcp_connect)(req, handle, addr.as_ptr(), Some(cb))
      })
      .map(drop)
  }

  pub unsafe fn tcp_getsockname(
    &self,
    handle: *const uv_tcp_t,
  ) -> Result<SocketAddr, UvError> {
    unsafe { self.tcp_name(handle, self.uv_tcp_getsockname) }
  }

  pub unsafe fn tcp_getpeername(
    &self,
    handle: *const uv_tcp_t,
  ) -> Result<SocketAddr, UvError> {
    unsafe { self.tcp_name(handle, self.uv_tcp_getpeername) }
  }

  unsafe fn tcp_name(
    &self,
    handle: *const uv_tcp_t,
    f: unsafe extern "C" fn(
      *const uv_tcp_t,
      *mut libc::sockaddr,
      *mut c_int,
    ) -> c_int,
  ) -> Result<SocketAddr, UvError> {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_storage>() as c_int;
    self.check(unsafe {
      f(
        handle,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
      )
    })?;
    unsafe { uv::sockaddr_to_std(&storage as *const _ as *const libc::sockaddr) }
      .ok_or_else(|| self.error(uv::UV_EAFNOSUPPORT))
  }

  pub unsafe fn pipe_init(
    &self,
    loop_: *mut uv_loop_t,
    handle: *mut uv_pipe_t,
    ipc: bool,
  ) -> Result<(), UvError> {
    self
      .check(unsafe { (self.uv_pipe_init)(loop_, handle, ipc as c_int) })
      .map(drop)
  }

  pub unsafe fn pipe_open(
    &self,
    handle: *mut uv_pipe_t,
    file: uv_file,
  ) -> Result<(), UvError> {
    self.check(unsafe { (self.uv_pipe_open)(handle, file) }).map(drop)
  }

  pub unsafe fn pipe_bind(
    &self,
    handle: *mut uv_pipe_t,
    name: &str,
  ) -> Result<(), UvError> {
    let Ok(name) = CString::new(name) else {
      return Err(self.error(uv::UV_EINVAL));
    };
    self
      .check(unsafe { (self.uv_pipe_bind)(handle, name.as_ptr()) })
      .map(drop)
  }

  /// Failures, including an unusable name, arrive through `cb`.
  pub unsafe fn pipe_connect(
    &self,
    req: *mut uv_connect_t,
    handle: *mut uv_pipe_t,
    name: &CStr,
    cb: uv_connect_cb,
  ) {
    unsafe { (self.uv_pipe_connect)(req, handle, name.as_ptr(), Some(cb)) }
  }

  pub unsafe fn pipe_pending_count(&self, handle: *mut uv_pipe_t) -> c_int {
    unsafe { (self.uv_pipe_pending_count)(handle) }
  }
}
