// Copyright 2018-2025 the Deno authors. MIT license.

use std::any::Any;
use std::cell::RefCell;
use std::ops::Deref;
use std::rc::Rc;
use std::rc::Weak;

use crate::error::UvError;
use crate::handle::HandleBase;
use crate::loop_handle::UvLoopHandle;
use crate::memory;
use crate::memory::UvOwner;
use crate::uv::uv_handle_type;
use crate::uv::uv_timer_t;

pub struct UvTimerHandle {
  base: HandleBase,
  callback: RefCell<Option<Box<dyn FnMut(&UvTimerHandle)>>>,
}

impl UvTimerHandle {
  pub fn init(
    loop_: &UvLoopHandle,
    on_close: Option<Box<dyn FnOnce()>>,
  ) -> Result<Rc<Self>, UvError> {
    let handle = Rc::new_cyclic(|weak: &Weak<Self>| Self {
      base: HandleBase::new(loop_, uv_handle_type::UV_TIMER, weak.clone()),
      callback: RefCell::new(None),
    });
    if let Err(err) =
      unsafe { loop_.functions().timer_init(loop_.ptr(), handle.ptr()) }
    {
      handle.base.init_failed();
      return Err(err);
    }
    if let Some(on_close) = on_close {
      handle.base.set_on_close(on_close);
    }
    Ok(handle)
  }

  fn ptr(&self) -> *mut uv_timer_t {
    self.base.ptr() as *mut uv_timer_t
  }

  /// Fire `callback` after `timeout` ms, then every `repeat` ms if non-zero.
  /// Restarting replaces the previous callback.
  pub fn start(
    &self,
    callback: impl FnMut(&UvTimerHandle) + 'static,
    timeout: u64,
    repeat: u64,
  ) -> Result<(), UvError> {
    *self.callback.borrow_mut() = Some(Box::new(callback));
    unsafe {
      self
        .functions()
        .timer_start(self.ptr(), on_timer, timeout, repeat)
    }
  }

  pub fn stop(&self) -> Result<(), UvError> {
    unsafe { self.functions().timer_stop(self.ptr()) }
  }

  pub fn again(&self) -> Result<(), UvError> {
    unsafe { self.functions().timer_again(self.ptr()) }
  }

  pub fn repeat(&self) -> u64 {
    unsafe { self.functions().timer_get_repeat(self.ptr()) }
  }

  pub fn set_repeat(&self, repeat: u64) {
    unsafe { self.functions().timer_set_repeat(self.ptr(), repeat) }
  }
}

impl Deref for UvTimerHandle {
  type Target = HandleBase;

  fn deref(&self) -> &HandleBase {
    &self.base
  }
}

impl UvOwner for UvTimerHandle {
  fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
    self
  }

  fn closed(&self) {
    self.callback.borrow_mut().take();
    self.base.fire_on_close();
  }

  fn dispose(&self) {
    self.close();
  }
}

unsafe extern "C" fn on_timer(handle: *mut uv_timer_t) {
  let Some(this) = (unsafe { memory::from_ptr::<UvTimerHandle>(handle as _) })
  else {
    return;
  };
  let callback = this.callback.borrow_mut().take();
  if let Some(mut callback) = callback {
    callback(this.as_ref());
    let mut slot = this.callback.borrow_mut();
    if slot.is_none() && !this.is_closed() {
      *slot = Some(callback);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;

  use crate::functions::UvFunctions;
  use crate::uv::uv_run_mode;

  #[test]
  fn test_one_shot_timer() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let closed = Rc::new(Cell::new(false));
    let timer = UvTimerHandle::init(
      &loop_,
      Some(Box::new({
        let closed = closed.clone();
        move || closed.set(true)
      })),
    )
    .unwrap();
    let fired = Rc::new(Cell::new(0));
    timer
      .start(
        {
          let fired = fired.clone();
          move |timer| {
            fired.set(fired.get() + 1);
            timer.close();
          }
        },
        5,
        0,
      )
      .unwrap();
    let started = loop_.now();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
    assert_eq!(fired.get(), 1);
    assert!(closed.get());
    assert!(loop_.now() >= started + 5);
  }

  #[test]
  fn test_repeating_timer_stops_itself() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let timer = UvTimerHandle::init(&loop_, None).unwrap();
    let fired = Rc::new(Cell::new(0));
    timer
      .start(
        {
          let fired = fired.clone();
          move |timer| {
            fired.set(fired.get() + 1);
            if fired.get() == 3 {
              timer.stop().unwrap();
            }
          }
        },
        1,
        1,
      )
      .unwrap();
    assert_eq!(timer.repeat(), 1);
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
    assert_eq!(fired.get(), 3);
    assert!(!timer.is_active());
    timer.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
  }

  #[test]
  fn test_unreferenced_timer_does_not_keep_loop_alive() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let timer = UvTimerHandle::init(&loop_, None).unwrap();
    let fired = Rc::new(Cell::new(false));
    timer
      .start(
        {
          let fired = fired.clone();
          move |_| fired.set(true)
        },
        60_000,
        0,
      )
      .unwrap();
    timer.unreference();
    assert_eq!(loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap(), 0);
    assert!(!fired.get());
    timer.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
  }
}
