// Copyright 2018-2025 the Deno authors. MIT license.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::c_int;
use std::future::Future;
use std::rc::Rc;
use std::rc::Weak;

use futures::channel::oneshot;

use crate::error::UvError;
use crate::loop_handle::UvLoopHandle;
use crate::memory::UvOwner;
use crate::request;
use crate::request::RequestBase;
use crate::stream_handle::UvStreamHandle;
use crate::uv::uv_req_type;
use crate::uv::uv_shutdown_t;

type ShutdownCallback = Box<dyn FnOnce(&UvShutdownReq, Result<(), UvError>)>;

/// Half-closes a stream once its queued writes have been flushed.
pub struct UvShutdownReq {
  base: RequestBase,
  callback: RefCell<Option<ShutdownCallback>>,
}

impl UvShutdownReq {
  pub fn init(loop_: &UvLoopHandle) -> Rc<Self> {
    let size = loop_.functions().req_size(uv_req_type::UV_SHUTDOWN);
    Rc::new_cyclic(|weak: &Weak<Self>| Self {
      base: RequestBase::new(loop_, size, weak.clone()),
      callback: RefCell::new(None),
    })
  }

  pub fn is_in_flight(&self) -> bool {
    self.base.is_in_flight()
  }

  pub fn shutdown(
    self: &Rc<Self>,
    stream: &UvStreamHandle,
    callback: impl FnOnce(&UvShutdownReq, Result<(), UvError>) + 'static,
  ) -> Result<(), UvError> {
    self.base.pin(self.clone());
    *self.callback.borrow_mut() = Some(Box::new(callback));
    let result = unsafe {
      self.base.functions().shutdown(
        self.base.ptr() as *mut uv_shutdown_t,
        stream.stream_ptr(),
        on_shutdown,
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

  pub fn shutdown_async(
    self: &Rc<Self>,
    stream: &UvStreamHandle,
  ) -> impl Future<Output = Result<(), UvError>> + use<> {
    let (tx, rx) = oneshot::channel();
    let submitted = self
      .shutdown(stream, move |_, result| {
        let _ = tx.send(result);
      })
      .map(|()| rx);
    request::completion(self.base.functions().clone(), submitted)
  }
}

impl UvOwner for UvShutdownReq {
  fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
    self
  }
}

unsafe extern "C" fn on_shutdown(req: *mut uv_shutdown_t, status: c_int) {
  let Some(this) = (unsafe { request::complete::<UvShutdownReq>(req as _) })
  else {
    return;
  };
  let callback = this.callback.borrow_mut().take();
  let result = this.base.functions().check(status).map(drop);
  if let Some(callback) = callback {
    callback(this.as_ref(), result);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;
  use std::io::Read;

  use bytes::Bytes;

  use crate::functions::UvFunctions;
  use crate::tcp_handle::UvTcpHandle;
  use crate::uv;
  use crate::uv::uv_run_mode;
  use crate::write_req::UvWriteReq;

  #[test]
  fn test_shutdown_after_write_half_closes() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let stream =
      std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (mut peer, _) = listener.accept().unwrap();
    let tcp = UvTcpHandle::init(&loop_).unwrap();
    tcp.open(std::os::fd::IntoRawFd::into_raw_fd(stream)).unwrap();

    let write = UvWriteReq::init(&loop_);
    write
      .write(&tcp, [Bytes::from_static(b"bye")], |_, result| {
        result.unwrap()
      })
      .unwrap();
    let shutdown = UvShutdownReq::init(&loop_);
    let done = Rc::new(Cell::new(0));
    shutdown
      .shutdown(&tcp, {
        let done = done.clone();
        move |req, result| {
          assert!(result.is_ok());
          assert!(!req.is_in_flight());
          done.set(done.get() + 1);
        }
      })
      .unwrap();
    assert!(shutdown.is_in_flight());
    while done.get() == 0 {
      loop_.run(uv_run_mode::UV_RUN_ONCE).unwrap();
    }
    assert_eq!(done.get(), 1);

    let mut received = Vec::new();
    peer.read_to_end(&mut received).unwrap();
    assert_eq!(received, b"bye");

    tcp.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
    assert_eq!(done.get(), 1);
  }

  #[test]
  fn test_shutdown_unconnected_fails_synchronously() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let tcp = UvTcpHandle::init(&loop_).unwrap();
    let shutdown = UvShutdownReq::init(&loop_);
    let called = Rc::new(Cell::new(false));
    let err = shutdown
      .shutdown(&tcp, {
        let called = called.clone();
        move |_, _| called.set(true)
      })
      .unwrap_err();
    assert_eq!(err.code(), uv::UV_ENOTCONN);
    assert!(!shutdown.is_in_flight());
    tcp.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
    assert!(!called.get());
  }
}
