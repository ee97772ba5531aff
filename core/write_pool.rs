// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use crate::loop_handle::UvLoopHandle;
use crate::write_req::UvWriteReq;

/// Requests kept for reuse per loop thread.
pub const MAX_POOLED_WRITE_REQS: usize = 1024;

/// Reusable write requests for one loop.
pub struct WriteReqPool {
  loop_: UvLoopHandle,
  pool: RefCell<Vec<Rc<UvWriteReq>>>,
  disposed: Cell<bool>,
}

impl WriteReqPool {
  pub fn new(loop_: &UvLoopHandle) -> Self {
    Self {
      loop_: loop_.clone(),
      pool: RefCell::new(Vec::new()),
      disposed: Cell::new(false),
    }
  }

  pub fn allocate(&self) -> Rc<UvWriteReq> {
    let pooled = if self.disposed.get() {
      None
    } else {
      self.pool.borrow_mut().pop()
    };
    pooled.unwrap_or_else(|| UvWriteReq::init(&self.loop_))
  }

  /// Return a finished request. It is dropped when the pool is full or
  /// disposed.
  pub fn give_back(&self, req: Rc<UvWriteReq>) {
    debug_assert!(!req.is_in_flight(), "Write request is still in flight");
    let mut pool = self.pool.borrow_mut();
    if !self.disposed.get() && pool.len() < MAX_POOLED_WRITE_REQS {
      pool.push(req);
    }
  }

  pub fn len(&self) -> usize {
    self.pool.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn dispose(&self) {
    self.disposed.set(true);
    let pooled = std::mem::take(&mut *self.pool.borrow_mut());
    drop(pooled);
  }
}
