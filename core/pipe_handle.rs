// Copyright 2018-2025 the Deno authors. MIT license.

use std::ops::Deref;
use std::rc::Rc;

use crate::error::UvError;
use crate::loop_handle::UvLoopHandle;
use crate::stream_handle::UvStreamHandle;
use crate::uv::uv_file;
use crate::uv::uv_handle_type;
use crate::uv::uv_pipe_t;

/// A named pipe (unix domain socket) handle.
#[derive(Clone, Debug)]
pub struct UvPipeHandle(Rc<UvStreamHandle>);

impl UvPipeHandle {
  pub fn init(loop_: &UvLoopHandle, ipc: bool) -> Result<Self, UvError> {
    let stream = UvStreamHandle::new(loop_, uv_handle_type::UV_NAMED_PIPE);
    let ptr = stream.stream_ptr() as *mut uv_pipe_t;
    if let Err(err) =
      unsafe { loop_.functions().pipe_init(loop_.ptr(), ptr, ipc) }
    {
      stream.init_failed();
      return Err(err);
    }
    Ok(Self(stream))
  }

  pub(crate) fn ptr(&self) -> *mut uv_pipe_t {
    self.0.stream_ptr() as *mut uv_pipe_t
  }

  pub fn stream(&self) -> &Rc<UvStreamHandle> {
    &self.0
  }

  pub fn bind(&self, name: &str) -> Result<(), UvError> {
    unsafe { self.functions().pipe_bind(self.ptr(), name) }
  }

  /// Adopt an existing file descriptor. The handle takes ownership of it.
  pub fn open(&self, file: uv_file) -> Result<(), UvError> {
    unsafe { self.functions().pipe_open(self.ptr(), file) }
  }

  /// Number of handles received over an IPC pipe and not yet accepted.
  pub fn pending_count(&self) -> usize {
    unsafe { self.functions().pipe_pending_count(self.ptr()) }.max(0) as usize
  }
}

impl Deref for UvPipeHandle {
  type Target = UvStreamHandle;

  fn deref(&self) -> &UvStreamHandle {
    &self.0
  }
}
