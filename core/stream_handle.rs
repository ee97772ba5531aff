// Copyright 2018-2025 the Deno authors. MIT license.

use std::any::Any;
use std::cell::Cell;
use std::cell::RefCell;
use std::ffi::c_int;
use std::ops::Deref;
use std::rc::Rc;
use std::rc::Weak;

use bytes::Bytes;
use bytes::BytesMut;

use crate::error::UvError;
use crate::handle::HandleBase;
use crate::loop_handle::UvLoopHandle;
use crate::memory;
use crate::memory::UvOwner;
use crate::uv;
use crate::uv::uv_buf_t;
use crate::uv::uv_handle_t;
use crate::uv::uv_handle_type;
use crate::uv::uv_stream_t;

/// Outcome of one successful read callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStatus {
  Data(Bytes),
  /// The peer closed its side cleanly.
  Eof,
}

type ConnectionCallback = Box<dyn FnMut(&UvStreamHandle, Result<(), UvError>)>;
type ReadCallback =
  Box<dyn FnMut(&UvStreamHandle, Result<ReadStatus, UvError>)>;

/// A connection-oriented handle: the shared part of TCP and pipe handles.
pub struct UvStreamHandle {
  base: HandleBase,
  kind: uv_handle_type,
  connection_cb: RefCell<Option<ConnectionCallback>>,
  read_cb: RefCell<Option<ReadCallback>>,
  reading: Cell<bool>,
  read_buffer: RefCell<BytesMut>,
  max_read_size: Cell<Option<usize>>,
}

impl UvStreamHandle {
  pub(crate) fn new(loop_: &UvLoopHandle, kind: uv_handle_type) -> Rc<Self> {
    Rc::new_cyclic(|weak: &Weak<Self>| Self {
      base: HandleBase::new(loop_, kind, weak.clone()),
      kind,
      connection_cb: RefCell::new(None),
      read_cb: RefCell::new(None),
      reading: Cell::new(false),
      read_buffer: RefCell::new(BytesMut::new()),
      max_read_size: Cell::new(None),
    })
  }

  pub(crate) fn init_failed(&self) {
    self.base.init_failed();
  }

  pub fn kind(&self) -> uv_handle_type {
    self.kind
  }

  pub fn stream_ptr(&self) -> *mut uv_stream_t {
    self.base.ptr() as *mut uv_stream_t
  }

  /// Start listening. `on_connection` runs once per incoming connection and
  /// must call [`UvStreamHandle::accept`] before returning.
  pub fn listen(
    &self,
    backlog: i32,
    on_connection: impl FnMut(&UvStreamHandle, Result<(), UvError>) + 'static,
  ) -> Result<(), UvError> {
    *self.connection_cb.borrow_mut() = Some(Box::new(on_connection));
    let result = unsafe {
      self.functions().listen(
        self.stream_ptr(),
        backlog as c_int,
        on_connection_cb,
      )
    };
    if result.is_err() {
      self.connection_cb.borrow_mut().take();
    }
    result
  }

  /// Accept a pending connection into an initialized `client` handle on the
  /// same loop.
  pub fn accept(&self, client: &UvStreamHandle) -> Result<(), UvError> {
    unsafe {
      self
        .functions()
        .accept(self.stream_ptr(), client.stream_ptr())
    }
  }

  /// Deliver incoming data to `on_read` until stopped, end of stream or an
  /// error. Errors do not close the handle.
  pub fn read_start(
    &self,
    on_read: impl FnMut(&UvStreamHandle, Result<ReadStatus, UvError>) + 'static,
  ) -> Result<(), UvError> {
    *self.read_cb.borrow_mut() = Some(Box::new(on_read));
    let result = unsafe {
      self
        .functions()
        .read_start(self.stream_ptr(), on_alloc, on_read_cb)
    };
    match result {
      Ok(()) => self.reading.set(true),
      Err(_) => {
        self.read_cb.borrow_mut().take();
      }
    }
    result
  }

  pub fn read_stop(&self) -> Result<(), UvError> {
    self.reading.set(false);
    self.read_cb.borrow_mut().take();
    unsafe { self.functions().read_stop(self.stream_ptr()) }
  }

  pub fn is_reading(&self) -> bool {
    self.reading.get()
  }

  /// Cap the bytes a single read may deliver. `None` accepts whatever size
  /// libuv suggests.
  pub fn set_max_read_size(&self, max: Option<usize>) {
    self.max_read_size.set(max.map(|max| max.max(1)));
  }

  pub fn max_read_size(&self) -> Option<usize> {
    self.max_read_size.get()
  }

  /// Write as much of `data` as the socket takes right now, without
  /// queueing. Fails with `EAGAIN` when nothing could be written.
  pub fn try_write(&self, data: &[u8]) -> Result<usize, UvError> {
    let buf = self
      .functions()
      .buf_init(data.as_ptr() as *mut u8, data.len());
    unsafe { self.functions().try_write(self.stream_ptr(), &buf, 1) }
  }

  /// Bytes queued by in-flight write requests.
  pub fn write_queue_size(&self) -> usize {
    unsafe { self.functions().write_queue_size(self.stream_ptr()) }
  }

  fn dispatch_read(&self, status: Result<ReadStatus, UvError>) {
    if matches!(status, Ok(ReadStatus::Eof) | Err(_)) {
      self.reading.set(false);
    }
    let callback = self.read_cb.borrow_mut().take();
    if let Some(mut callback) = callback {
      callback(self, status);
      let mut slot = self.read_cb.borrow_mut();
      if slot.is_none() && self.reading.get() && !self.is_closed() {
        *slot = Some(callback);
      }
    }
  }
}

impl Deref for UvStreamHandle {
  type Target = HandleBase;

  fn deref(&self) -> &HandleBase {
    &self.base
  }
}

impl UvOwner for UvStreamHandle {
  fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
    self
  }

  fn closed(&self) {
    self.connection_cb.borrow_mut().take();
    self.read_cb.borrow_mut().take();
    self.reading.set(false);
    self.base.fire_on_close();
  }

  fn dispose(&self) {
    self.close();
  }
}

impl std::fmt::Debug for UvStreamHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("UvStreamHandle")
      .field("kind", &self.kind)
      .field("closed", &self.is_closed())
      .field("reading", &self.reading.get())
      .finish()
  }
}

unsafe extern "C" fn on_connection_cb(server: *mut uv_stream_t, status: c_int) {
  let Some(this) =
    (unsafe { memory::from_ptr::<UvStreamHandle>(server as _) })
  else {
    return;
  };
  let result = this.functions().check(status).map(drop);
  let callback = this.connection_cb.borrow_mut().take();
  if let Some(mut callback) = callback {
    callback(this.as_ref(), result);
    let mut slot = this.connection_cb.borrow_mut();
    if slot.is_none() && !this.is_closed() {
      *slot = Some(callback);
    }
  }
}

unsafe extern "C" fn on_alloc(
  handle: *mut uv_handle_t,
  suggested_size: usize,
  buf: *mut uv_buf_t,
) {
  let Some(this) =
    (unsafe { memory::from_ptr::<UvStreamHandle>(handle as _) })
  else {
    unsafe { *buf = uv_buf_t::empty() };
    return;
  };
  let size = match this.max_read_size.get() {
    Some(max) => suggested_size.min(max),
    None => suggested_size,
  };
  let mut buffer = this.read_buffer.borrow_mut();
  buffer.reserve(size);
  let spare = buffer.spare_capacity_mut();
  let len = spare.len().min(size);
  unsafe {
    *buf = this.functions().buf_init(spare.as_mut_ptr() as *mut u8, len);
  }
}

unsafe extern "C" fn on_read_cb(
  stream: *mut uv_stream_t,
  nread: isize,
  _buf: *const uv_buf_t,
) {
  let Some(this) =
    (unsafe { memory::from_ptr::<UvStreamHandle>(stream as _) })
  else {
    return;
  };
  let status = if nread > 0 {
    let data = {
      let mut buffer = this.read_buffer.borrow_mut();
      let len = buffer.len();
      // SAFETY: libuv filled `nread` bytes of the spare capacity handed out
      // by `on_alloc`.
      unsafe { buffer.set_len(len + nread as usize) };
      buffer.split().freeze()
    };
    Ok(ReadStatus::Data(data))
  } else if nread == 0 {
    // Nothing read this time (EAGAIN).
    return;
  } else if nread as c_int == uv::UV_EOF {
    Ok(ReadStatus::Eof)
  } else {
    Err(this.functions().error(nread as c_int))
  };
  this.dispatch_read(status);
}

