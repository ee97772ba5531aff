// Copyright 2018-2025 the Deno authors. MIT license.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::CString;
use std::ffi::c_int;
use std::future::Future;
use std::net::SocketAddr;
use std::rc::Rc;
use std::rc::Weak;

use futures::channel::oneshot;

use crate::error::UvError;
use crate::loop_handle::UvLoopHandle;
use crate::memory::UvOwner;
use crate::pipe_handle::UvPipeHandle;
use crate::request;
use crate::request::RequestBase;
use crate::tcp_handle::UvTcpHandle;
use crate::uv;
use crate::uv::uv_connect_t;
use crate::uv::uv_req_type;
use crate::uv::uv_tcp_t;

type ConnectCallback = Box<dyn FnOnce(&UvConnectReq, Result<(), UvError>)>;

/// Establishes an outbound connection on a pipe or TCP handle.
pub struct UvConnectReq {
  base: RequestBase,
  callback: RefCell<Option<ConnectCallback>>,
}

impl UvConnectReq {
  pub fn init(loop_: &UvLoopHandle) -> Rc<Self> {
    let size = loop_.functions().req_size(uv_req_type::UV_CONNECT);
    Rc::new_cyclic(|weak: &Weak<Self>| Self {
      base: RequestBase::new(loop_, size, weak.clone()),
      callback: RefCell::new(None),
    })
  }

  fn ptr(&self) -> *mut uv_connect_t {
    self.base.ptr() as *mut uv_connect_t
  }

  pub fn is_in_flight(&self) -> bool {
    self.base.is_in_flight()
  }

  /// Connect `pipe` to the socket at `path`. Apart from a path that cannot
  /// be passed to libuv, failures arrive through `callback`.
  pub fn connect_pipe(
    self: &Rc<Self>,
    pipe: &UvPipeHandle,
    path: &str,
    callback: impl FnOnce(&UvConnectReq, Result<(), UvError>) + 'static,
  ) -> Result<(), UvError> {
    let Ok(path) = CString::new(path) else {
      return Err(self.base.functions().error(uv::UV_EINVAL));
    };
    self.base.pin(self.clone());
    *self.callback.borrow_mut() = Some(Box::new(callback));
    unsafe {
      self
        .base
        .functions()
        .pipe_connect(self.ptr(), pipe.ptr(), &path, on_connect)
    };
    Ok(())
  }

  pub fn connect_tcp(
    self: &Rc<Self>,
    tcp: &UvTcpHandle,
    addr: SocketAddr,
    callback: impl FnOnce(&UvConnectReq, Result<(), UvError>) + 'static,
  ) -> Result<(), UvError> {
    self.base.pin(self.clone());
    *self.callback.borrow_mut() = Some(Box::new(callback));
    let result = unsafe {
      self.base.functions().tcp_connect(
        self.ptr(),
        tcp.stream_ptr() as *mut uv_tcp_t,
        &addr,
        on_connect,
      )
    };
    if result.is_err() {
      let callback = self.callback.borrow_mut().take();
      drop(callback);
      let pin = self.base.unpin();
      drop(pin);
    }
    result
  }

  pub fn connect_pipe_async(
    self: &Rc<Self>,
    pipe: &UvPipeHandle,
    path: &str,
  ) -> impl Future<Output = Result<(), UvError>> + use<> {
    let (tx, rx) = oneshot::channel();
    let submitted = self
      .connect_pipe(pipe, path, move |_, result| {
        let _ = tx.send(result);
      })
      .map(|()| rx);
    request::completion(self.base.functions().clone(), submitted)
  }

  pub fn connect_tcp_async(
    self: &Rc<Self>,
    tcp: &UvTcpHandle,
    addr: SocketAddr,
  ) -> impl Future<Output = Result<(), UvError>> + use<> {
    let (tx, rx) = oneshot::channel();
    let submitted = self
      .connect_tcp(tcp, addr, move |_, result| {
        let _ = tx.send(result);
      })
      .map(|()| rx);
    request::completion(self.base.functions().clone(), submitted)
  }
}

impl UvOwner for UvConnectReq {
  fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
    self
  }
}

unsafe extern "C" fn on_connect(req: *mut uv_connect_t, status: c_int) {
  let Some(this) = (unsafe { request::complete::<UvConnectReq>(req as _) })
  else {
    return;
  };
  let callback = this.callback.borrow_mut().take();
  let result = this.base.functions().check(status).map(drop);
  if let Some(callback) = callback {
    callback(this.as_ref(), result);
  }
}
