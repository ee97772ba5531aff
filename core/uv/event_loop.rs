// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::ffi::c_int;
use std::ffi::c_void;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::task::Poll;
use std::time::Duration;
use std::time::Instant;

use futures::task::AtomicWaker;

use super::UV_EBUSY;
use super::UV_HANDLE_ACTIVE;
use super::UV_HANDLE_CLOSED;
use super::UV_HANDLE_CLOSING;
use super::UV_HANDLE_REF;
use super::errno::io_error_code;
use super::uv_handle_t;
use super::uv_handle_type;
use super::uv_loop_t;
use super::uv_run_mode;
use super::uv_stream_t;
use super::uv_timer_t;
use super::uv_walk_cb;

/// Cross-thread doorbell of a loop. Async handles hold a reference to it so
/// `uv_async_send` never has to touch loop state from a foreign thread.
#[derive(Default)]
pub(crate) struct LoopSignal {
  pending: AtomicBool,
  waker: AtomicWaker,
}

impl LoopSignal {
  pub(crate) fn notify(&self) {
    self.pending.store(true, Ordering::SeqCst);
    self.waker.wake();
  }

  fn take_pending(&self) -> bool {
    self.pending.swap(false, Ordering::SeqCst)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct TimerKey {
  pub(crate) deadline_ms: u64,
  pub(crate) id: u64,
}

pub(crate) struct UvLoopInner {
  pub(crate) signal: Arc<LoopSignal>,
  /// Every initialized handle that has not finished closing, in init order.
  pub(crate) handles: RefCell<Vec<*mut uv_handle_t>>,
  pub(crate) timers: RefCell<BTreeSet<TimerKey>>,
  next_timer_id: Cell<u64>,
  pub(crate) timer_handles: RefCell<HashMap<u64, *mut uv_timer_t>>,
  pub(crate) closing_handles: RefCell<VecDeque<*mut uv_handle_t>>,
  /// In-flight write/connect/shutdown requests.
  pub(crate) active_reqs: Cell<usize>,
  /// Set when a stream has queued work the I/O phase has not seen yet.
  pub(crate) io_pending: Cell<bool>,
  stop_flag: Cell<bool>,
  running: Cell<bool>,
  time_origin: Instant,
  now: Cell<u64>,
  sleep: RefCell<Option<Pin<Box<tokio::time::Sleep>>>>,
  // Dropped last: sockets and the sleep above deregister from its driver.
  runtime: tokio::runtime::Runtime,
}

impl UvLoopInner {
  fn new(runtime: tokio::runtime::Runtime) -> Self {
    Self {
      signal: Arc::new(LoopSignal::default()),
      handles: RefCell::new(Vec::with_capacity(16)),
      timers: RefCell::new(BTreeSet::new()),
      next_timer_id: Cell::new(1),
      timer_handles: RefCell::new(HashMap::with_capacity(16)),
      closing_handles: RefCell::new(VecDeque::with_capacity(16)),
      active_reqs: Cell::new(0),
      io_pending: Cell::new(false),
      stop_flag: Cell::new(false),
      running: Cell::new(false),
      time_origin: Instant::now(),
      now: Cell::new(0),
      sleep: RefCell::new(None),
      runtime,
    }
  }

  /// Enter the loop's tokio context, needed to register sockets created
  /// outside `uv_run`.
  pub(crate) fn enter(&self) -> tokio::runtime::EnterGuard<'_> {
    self.runtime.enter()
  }

  #[inline]
  pub(crate) fn alloc_timer_id(&self) -> u64 {
    let id = self.next_timer_id.get();
    self.next_timer_id.set(id + 1);
    id
  }

  #[inline]
  pub(crate) fn now_ms(&self) -> u64 {
    self.now.get()
  }

  fn update_time(&self) {
    let elapsed = Instant::now().duration_since(self.time_origin);
    self.now.set(elapsed.as_millis() as u64);
  }

  pub(crate) fn req_started(&self) {
    self.active_reqs.set(self.active_reqs.get() + 1);
    self.io_pending.set(true);
  }

  pub(crate) fn req_finished(&self) {
    self.active_reqs.set(self.active_reqs.get().saturating_sub(1));
  }

  pub(crate) fn has_alive_handles(&self) -> bool {
    if self.active_reqs.get() > 0 || !self.closing_handles.borrow().is_empty()
    {
      return true;
    }
    self.handles.borrow().iter().any(|&handle_ptr| {
      let flags = unsafe { (*handle_ptr).flags };
      flags & UV_HANDLE_ACTIVE != 0
        && flags & UV_HANDLE_REF != 0
        && flags & UV_HANDLE_CLOSING == 0
    })
  }

  fn next_timer_deadline_ms(&self) -> Option<u64> {
    self.timers.borrow().iter().next().map(|k| k.deadline_ms)
  }

  /// One loop iteration: timers, async wakeups, stream I/O, close callbacks.
  /// Returns whether any callback ran.
  unsafe fn tick(&self, cx: &mut Context) -> bool {
    unsafe {
      let mut did_work = self.run_timers();
      did_work |= self.run_async();
      did_work |= self.run_io(cx);
      did_work |= self.run_close();
      did_work
    }
  }

  fn poll_run(&self, mode: uv_run_mode, cx: &mut Context) -> Poll<()> {
    self.signal.waker.register(cx.waker());
    self.update_time();
    let did_work = unsafe { self.tick(cx) };

    if self.stop_flag.get() || !self.has_alive_handles() {
      return Poll::Ready(());
    }
    match mode {
      uv_run_mode::UV_RUN_NOWAIT => return Poll::Ready(()),
      uv_run_mode::UV_RUN_ONCE if did_work => return Poll::Ready(()),
      _ => {}
    }

    if did_work
      || self.io_pending.get()
      || !self.closing_handles.borrow().is_empty()
      || self.signal.pending.load(Ordering::SeqCst)
    {
      // Let the tokio driver process readiness before the next iteration.
      cx.waker().wake_by_ref();
      return Poll::Pending;
    }

    if let Some(deadline) = self.next_timer_deadline_ms() {
      let when = tokio::time::Instant::from_std(
        self.time_origin + Duration::from_millis(deadline),
      );
      let mut slot = self.sleep.borrow_mut();
      let sleep =
        slot.get_or_insert_with(|| Box::pin(tokio::time::sleep_until(when)));
      sleep.as_mut().reset(when);
      if sleep.as_mut().poll(cx).is_ready() {
        cx.waker().wake_by_ref();
      }
    }
    Poll::Pending
  }

  pub(crate) unsafe fn run_timers(&self) -> bool {
    let now = self.now_ms();
    let mut expired = Vec::new();
    {
      let timers = self.timers.borrow();
      for key in timers.iter() {
        if key.deadline_ms > now {
          break;
        }
        expired.push(*key);
      }
    }

    let mut fired = false;
    for key in expired {
      if !self.timers.borrow_mut().remove(&key) {
        // Stopped or restarted by an earlier callback in this batch.
        continue;
      }
      let handle_ptr = match self.timer_handles.borrow().get(&key.id).copied()
      {
        Some(h) => h,
        None => continue,
      };
      let handle = unsafe { &mut *handle_ptr };
      if handle.flags & UV_HANDLE_ACTIVE == 0 {
        self.timer_handles.borrow_mut().remove(&key.id);
        continue;
      }
      let cb = handle.timer_cb;

      if handle.repeat > 0 {
        let new_deadline = now + handle.repeat;
        handle.deadline = new_deadline;
        self.timers.borrow_mut().insert(TimerKey {
          deadline_ms: new_deadline,
          id: key.id,
        });
      } else {
        handle.flags &= !UV_HANDLE_ACTIVE;
        handle.timer_id = 0;
        self.timer_handles.borrow_mut().remove(&key.id);
      }

      if let Some(cb) = cb {
        fired = true;
        unsafe { cb(handle_ptr) };
      }
    }
    fired
  }

  unsafe fn run_async(&self) -> bool {
    if !self.signal.take_pending() {
      return false;
    }
    let mut fired = false;
    let mut i = 0;
    loop {
      let handle_ptr = {
        let handles = self.handles.borrow();
        if i >= handles.len() {
          break;
        }
        handles[i]
      };
      i += 1;
      unsafe {
        if (*handle_ptr).r#type == uv_handle_type::UV_ASYNC
          && !super::is_closing(handle_ptr)
        {
          fired |= super::async_handle::dispatch(handle_ptr as *mut _);
        }
      }
    }
    fired
  }

  /// Poll every stream for connect completion, pending accepts, readable
  /// data, queued writes and shutdowns.
  ///
  /// Multiple passes: callbacks frequently queue more I/O (a read answered
  /// with a write), so re-poll up to 16 times within one iteration.
  unsafe fn run_io(&self, cx: &mut Context) -> bool {
    let mut did_any_work = false;

    for _pass in 0..16 {
      self.io_pending.set(false);
      let mut any_work = false;

      let mut i = 0;
      loop {
        let handle_ptr = {
          let handles = self.handles.borrow();
          if i >= handles.len() {
            break;
          }
          handles[i]
        };
        i += 1;
        unsafe {
          match (*handle_ptr).r#type {
            uv_handle_type::UV_TCP | uv_handle_type::UV_NAMED_PIPE => {
              if !super::is_closing(handle_ptr) {
                any_work |=
                  super::stream::poll_stream(self, handle_ptr as *mut _, cx);
              }
            }
            _ => {}
          }
        }
      }

      if !any_work && !self.io_pending.get() {
        break;
      }
      did_any_work |= any_work;
    }

    did_any_work
  }

  unsafe fn run_close(&self) -> bool {
    let snapshot: Vec<_> = self.closing_handles.borrow_mut().drain(..).collect();
    let did_work = !snapshot.is_empty();
    for handle_ptr in snapshot {
      unsafe {
        match (*handle_ptr).r#type {
          uv_handle_type::UV_TCP | uv_handle_type::UV_NAMED_PIPE => {
            super::stream::finish_close(self, handle_ptr as *mut uv_stream_t);
          }
          uv_handle_type::UV_ASYNC => {
            super::async_handle::finish_close(handle_ptr as *mut _);
          }
          _ => {}
        }
        self
          .handles
          .borrow_mut()
          .retain(|&h| !std::ptr::eq(h, handle_ptr));
        (*handle_ptr).flags &= !UV_HANDLE_CLOSING;
        (*handle_ptr).flags |= UV_HANDLE_CLOSED;
        if let Some(cb) = (*handle_ptr).close_cb.take() {
          cb(handle_ptr);
        }
      }
    }
    did_work
  }

  pub(crate) unsafe fn stop_timer(&self, handle: *mut uv_timer_t) {
    let handle_ref = unsafe { &mut *handle };
    let id = handle_ref.timer_id;
    if id != 0 {
      let key = TimerKey {
        deadline_ms: handle_ref.deadline,
        id,
      };
      self.timers.borrow_mut().remove(&key);
      self.timer_handles.borrow_mut().remove(&id);
      handle_ref.timer_id = 0;
    }
    handle_ref.flags &= !UV_HANDLE_ACTIVE;
  }
}

#[inline]
pub(crate) unsafe fn get_inner(loop_: *mut uv_loop_t) -> &'static UvLoopInner {
  unsafe { &*((*loop_).internal as *const UvLoopInner) }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_loop_init(loop_: *mut uv_loop_t) -> c_int {
  let runtime = match tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()
  {
    Ok(runtime) => runtime,
    Err(err) => return io_error_code(&err),
  };
  let inner = Box::new(UvLoopInner::new(runtime));
  unsafe {
    std::ptr::addr_of_mut!((*loop_).internal)
      .write(Box::into_raw(inner) as *mut c_void);
  }
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_loop_close(loop_: *mut uv_loop_t) -> c_int {
  unsafe {
    let internal = (*loop_).internal;
    if internal.is_null() {
      return 0;
    }
    let inner = &*(internal as *const UvLoopInner);
    if inner.running.get()
      || !inner.handles.borrow().is_empty()
      || !inner.closing_handles.borrow().is_empty()
    {
      return UV_EBUSY;
    }
    drop(Box::from_raw(internal as *mut UvLoopInner));
    (*loop_).internal = std::ptr::null_mut();
  }
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_loop_size() -> usize {
  std::mem::size_of::<uv_loop_t>()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_stop(loop_: *mut uv_loop_t) {
  let inner = unsafe { get_inner(loop_) };
  inner.stop_flag.set(true);
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_now(loop_: *const uv_loop_t) -> u64 {
  let inner = unsafe { get_inner(loop_ as *mut uv_loop_t) };
  inner.now_ms()
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_update_time(loop_: *mut uv_loop_t) {
  let inner = unsafe { get_inner(loop_) };
  inner.update_time();
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_walk(
  loop_: *mut uv_loop_t,
  walk_cb: uv_walk_cb,
  arg: *mut c_void,
) {
  let inner = unsafe { get_inner(loop_) };
  // Handles closed by the callback stay allocated until the close phase,
  // so the snapshot stays valid for the whole walk.
  let snapshot = inner.handles.borrow().clone();
  for handle_ptr in snapshot {
    unsafe {
      if (*handle_ptr).flags & UV_HANDLE_CLOSED == 0 {
        walk_cb(handle_ptr, arg);
      }
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_run(
  loop_: *mut uv_loop_t,
  mode: uv_run_mode,
) -> c_int {
  let inner = unsafe { get_inner(loop_) };
  if inner.running.get() {
    return UV_EBUSY;
  }
  inner.running.set(true);

  inner
    .runtime
    .block_on(std::future::poll_fn(|cx| inner.poll_run(mode, cx)));

  inner.running.set(false);
  inner.stop_flag.set(false);
  inner.has_alive_handles() as c_int
}
