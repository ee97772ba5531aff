// Copyright 2018-2025 the Deno authors. MIT license.

use std::net::SocketAddr;
use std::ops::Deref;
use std::rc::Rc;

use crate::error::UvError;
use crate::loop_handle::UvLoopHandle;
use crate::stream_handle::UvStreamHandle;
use crate::uv::uv_handle_type;
use crate::uv::uv_os_sock_t;
use crate::uv::uv_tcp_t;

/// A TCP socket handle.
#[derive(Clone, Debug)]
pub struct UvTcpHandle(Rc<UvStreamHandle>);

impl UvTcpHandle {
  pub fn init(loop_: &UvLoopHandle) -> Result<Self, UvError> {
    let stream = UvStreamHandle::new(loop_, uv_handle_type::UV_TCP);
    let ptr = stream.stream_ptr() as *mut uv_tcp_t;
    if let Err(err) = unsafe { loop_.functions().tcp_init(loop_.ptr(), ptr) } {
      stream.init_failed();
      return Err(err);
    }
    Ok(Self(stream))
  }

  fn ptr(&self) -> *mut uv_tcp_t {
    self.0.stream_ptr() as *mut uv_tcp_t
  }

  pub fn stream(&self) -> &Rc<UvStreamHandle> {
    &self.0
  }

  /// Bind to `host:port`. `host` is parsed as IPv4 first and IPv6 second;
  /// when neither parses, the IPv4 error is returned.
  pub fn bind(&self, host: &str, port: u16) -> Result<(), UvError> {
    let addr = self.functions().ip_addr(host, port)?;
    self.bind_endpoint(addr)
  }

  pub fn bind_endpoint(&self, addr: SocketAddr) -> Result<(), UvError> {
    unsafe { self.functions().tcp_bind(self.ptr(), &addr) }
  }

  /// Adopt an existing OS socket. The handle takes ownership of `sock`.
  pub fn open(&self, sock: uv_os_sock_t) -> Result<(), UvError> {
    unsafe { self.functions().tcp_open(self.ptr(), sock) }
  }

  pub fn no_delay(&self, enable: bool) -> Result<(), UvError> {
    unsafe { self.functions().tcp_nodelay(self.ptr(), enable) }
  }

  pub fn sock_endpoint(&self) -> Result<SocketAddr, UvError> {
    unsafe { self.functions().tcp_getsockname(self.ptr()) }
  }

  pub fn peer_endpoint(&self) -> Result<SocketAddr, UvError> {
    unsafe { self.functions().tcp_getpeername(self.ptr()) }
  }
}

impl Deref for UvTcpHandle {
  type Target = UvStreamHandle;

  fn deref(&self) -> &UvStreamHandle {
    &self.0
  }
}
