// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::c_void;
use std::future::Future;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;

use futures::channel::oneshot;

use crate::error::UvError;
use crate::functions::UvFunctions;
use crate::loop_handle::UvLoopHandle;
use crate::memory;
use crate::memory::UvMemory;
use crate::memory::UvOwner;
use crate::uv;

/// State shared by write, shutdown and connect requests.
///
/// While a request is in flight its owner is pinned in the owner table, so
/// the completion callback can always recover it even if every other
/// reference was dropped.
pub(crate) struct RequestBase {
  memory: UvMemory,
  functions: Arc<UvFunctions>,
}

impl RequestBase {
  pub(crate) fn new(
    loop_: &UvLoopHandle,
    size: usize,
    owner: Weak<dyn UvOwner>,
  ) -> Self {
    Self {
      memory: UvMemory::allocate(size, owner),
      functions: loop_.functions().clone(),
    }
  }

  pub(crate) fn ptr(&self) -> *mut c_void {
    self.memory.ptr()
  }

  pub(crate) fn functions(&self) -> &Arc<UvFunctions> {
    &self.functions
  }

  pub(crate) fn is_in_flight(&self) -> bool {
    memory::is_pinned(self.memory.token())
  }

  pub(crate) fn pin(&self, owner: Rc<dyn UvOwner>) {
    self.memory.validate(false);
    assert!(!self.is_in_flight(), "Request is already in flight");
    memory::pin(self.memory.token(), owner);
  }

  pub(crate) fn unpin(&self) -> Option<Rc<dyn UvOwner>> {
    memory::unpin(self.memory.token())
  }
}

/// Release the pin taken at submission and recover the request.
///
/// # Safety
/// `req` must be the block of a request submitted through [`RequestBase`].
pub(crate) unsafe fn complete<T: UvOwner>(req: *mut c_void) -> Option<Rc<T>> {
  let owner = memory::unpin(unsafe { memory::token_of(req) })?;
  owner.into_any().downcast::<T>().ok()
}

/// Resolve a callback-based submission as a future. A completion that is
/// dropped without firing resolves to `ECANCELED`.
pub(crate) fn completion<T>(
  functions: Arc<UvFunctions>,
  submitted: Result<oneshot::Receiver<Result<T, UvError>>, UvError>,
) -> impl Future<Output = Result<T, UvError>> + 'static
where
  T: 'static,
{
  async move {
    match submitted?.await {
      Ok(result) => result,
      Err(oneshot::Canceled) => Err(functions.error(uv::UV_ECANCELED)),
    }
  }
}
