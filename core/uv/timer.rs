// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::c_int;

use super::UV_EINVAL;
use super::UV_HANDLE_ACTIVE;
use super::UV_HANDLE_REF;
use super::event_loop::TimerKey;
use super::event_loop::get_inner;
use super::init_handle_header;
use super::uv_handle_t;
use super::uv_handle_type;
use super::uv_loop_t;
use super::uv_timer_cb;
use super::uv_timer_t;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_timer_init(
  loop_: *mut uv_loop_t,
  handle: *mut uv_timer_t,
) -> c_int {
  unsafe {
    use std::ptr::addr_of_mut;
    init_handle_header(
      handle as *mut uv_handle_t,
      loop_,
      uv_handle_type::UV_TIMER,
      UV_HANDLE_REF,
    );
    addr_of_mut!((*handle).timer_cb).write(None);
    addr_of_mut!((*handle).timeout).write(0);
    addr_of_mut!((*handle).repeat).write(0);
    addr_of_mut!((*handle).timer_id).write(0);
    addr_of_mut!((*handle).deadline).write(0);
  }
  0
}

unsafe fn arm(handle: *mut uv_timer_t, timeout: u64) {
  unsafe {
    let inner = get_inner((*handle).loop_);
    let id = inner.alloc_timer_id();
    let deadline = inner.now_ms() + timeout;

    (*handle).timer_id = id;
    (*handle).deadline = deadline;
    (*handle).flags |= UV_HANDLE_ACTIVE;

    inner.timers.borrow_mut().insert(TimerKey {
      deadline_ms: deadline,
      id,
    });
    inner.timer_handles.borrow_mut().insert(id, handle);
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_timer_start(
  handle: *mut uv_timer_t,
  cb: uv_timer_cb,
  timeout: u64,
  repeat: u64,
) -> c_int {
  unsafe {
    if super::is_closing(handle as *const uv_handle_t) {
      return UV_EINVAL;
    }
    let inner = get_inner((*handle).loop_);
    inner.stop_timer(handle);

    (*handle).timer_cb = Some(cb);
    (*handle).timeout = timeout;
    (*handle).repeat = repeat;
    arm(handle, timeout);
  }
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_timer_stop(handle: *mut uv_timer_t) -> c_int {
  unsafe {
    let loop_ = (*handle).loop_;
    if loop_.is_null() || (*loop_).internal.is_null() {
      (*handle).flags &= !UV_HANDLE_ACTIVE;
      return 0;
    }
    get_inner(loop_).stop_timer(handle);
  }
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_timer_again(handle: *mut uv_timer_t) -> c_int {
  unsafe {
    if (*handle).timer_cb.is_none() {
      return UV_EINVAL;
    }
    let repeat = (*handle).repeat;
    if repeat == 0 {
      return 0;
    }
    get_inner((*handle).loop_).stop_timer(handle);
    arm(handle, repeat);
  }
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_timer_get_repeat(handle: *const uv_timer_t) -> u64 {
  unsafe { (*handle).repeat }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_timer_set_repeat(
  handle: *mut uv_timer_t,
  repeat: u64,
) {
  unsafe {
    (*handle).repeat = repeat;
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_util::*;
  use super::super::*;
  use std::sync::atomic::AtomicBool;
  use std::sync::atomic::AtomicU32;
  use std::sync::atomic::Ordering;

  #[test]
  fn test_timer_fires() {
    unsafe {
      let loop_ = make_loop();
      let timer = alloc::<uv_timer_t>();
      uv_timer_init(loop_, timer);

      static FIRED: AtomicBool = AtomicBool::new(false);
      unsafe extern "C" fn timer_cb(_handle: *mut uv_timer_t) {
        FIRED.store(true, Ordering::Relaxed);
      }

      uv_timer_start(timer, timer_cb, 10, 0);
      assert_eq!(uv_is_active(timer as *mut uv_handle_t), 1);

      uv_run(loop_, uv_run_mode::UV_RUN_ONCE);
      assert!(FIRED.load(Ordering::Relaxed));
      assert_eq!(uv_is_active(timer as *mut uv_handle_t), 0);

      uv_close(timer as *mut uv_handle_t, None);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      destroy_loop(loop_);
      free(timer);
    }
  }

  #[test]
  fn test_repeat_timer() {
    unsafe {
      let loop_ = make_loop();
      let timer = alloc::<uv_timer_t>();
      uv_timer_init(loop_, timer);

      static COUNT: AtomicU32 = AtomicU32::new(0);
      unsafe extern "C" fn timer_cb(handle: *mut uv_timer_t) {
        let c = COUNT.fetch_add(1, Ordering::Relaxed) + 1;
        if c >= 3 {
          unsafe { uv_timer_stop(handle) };
        }
      }

      uv_timer_start(timer, timer_cb, 5, 5);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      assert_eq!(COUNT.load(Ordering::Relaxed), 3);

      uv_close(timer as *mut uv_handle_t, None);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      destroy_loop(loop_);
      free(timer);
    }
  }

  #[test]
  fn test_timer_again() {
    unsafe {
      let loop_ = make_loop();
      let timer = alloc::<uv_timer_t>();
      uv_timer_init(loop_, timer);

      assert_eq!(uv_timer_again(timer), UV_EINVAL);

      static AGAIN_FIRED: AtomicBool = AtomicBool::new(false);
      unsafe extern "C" fn timer_cb(handle: *mut uv_timer_t) {
        AGAIN_FIRED.store(true, Ordering::Relaxed);
        unsafe { uv_timer_stop(handle) };
      }

      uv_timer_start(timer, timer_cb, 60_000, 10);
      uv_timer_stop(timer);
      uv_timer_again(timer);

      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      assert!(AGAIN_FIRED.load(Ordering::Relaxed));

      uv_close(timer as *mut uv_handle_t, None);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      destroy_loop(loop_);
      free(timer);
    }
  }

  #[test]
  fn test_timer_get_set_repeat() {
    unsafe {
      let loop_ = make_loop();
      let timer = alloc::<uv_timer_t>();
      uv_timer_init(loop_, timer);

      assert_eq!(uv_timer_get_repeat(timer), 0);
      uv_timer_set_repeat(timer, 42);
      assert_eq!(uv_timer_get_repeat(timer), 42);

      uv_close(timer as *mut uv_handle_t, None);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      destroy_loop(loop_);
      free(timer);
    }
  }
}
