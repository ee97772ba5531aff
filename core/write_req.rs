// Copyright 2018-2025 the Deno authors. MIT license.

use std::any::Any;
use std::cell::RefCell;
use std::ffi::c_int;
use std::future::Future;
use std::rc::Rc;
use std::rc::Weak;

use bytes::Bytes;
use futures::channel::oneshot;
use smallvec::SmallVec;

use crate::error::UvError;
use crate::loop_handle::UvLoopHandle;
use crate::memory::UvOwner;
use crate::request;
use crate::request::RequestBase;
use crate::stream_handle::UvStreamHandle;
use crate::uv::uv_buf_t;
use crate::uv::uv_req_type;
use crate::uv::uv_write_t;

/// Buffer descriptors stored inside the request block itself. Longer chains
/// use a heap array.
pub const INLINE_BUFFERS: usize = 4;

type WriteCallback = Box<dyn FnOnce(&UvWriteReq, Result<(), UvError>)>;

/// One in-flight write of a chain of buffers.
///
/// The segments are held by the request from submission until the
/// completion callback, so their memory stays put while libuv writes from
/// it. A request can be submitted again once its callback has fired.
pub struct UvWriteReq {
  base: RequestBase,
  buffers_offset: usize,
  heap_buffers: RefCell<Vec<uv_buf_t>>,
  segments: RefCell<SmallVec<[Bytes; INLINE_BUFFERS]>>,
  callback: RefCell<Option<WriteCallback>>,
}

impl UvWriteReq {
  pub fn init(loop_: &UvLoopHandle) -> Rc<Self> {
    let req_size = loop_.functions().req_size(uv_req_type::UV_WRITE);
    let align = std::mem::align_of::<uv_buf_t>();
    let buffers_offset = req_size.div_ceil(align) * align;
    let size =
      buffers_offset + INLINE_BUFFERS * std::mem::size_of::<uv_buf_t>();
    Rc::new_cyclic(|weak: &Weak<Self>| Self {
      base: RequestBase::new(loop_, size, weak.clone()),
      buffers_offset,
      heap_buffers: RefCell::new(Vec::new()),
      segments: RefCell::new(SmallVec::new()),
      callback: RefCell::new(None),
    })
  }

  fn ptr(&self) -> *mut uv_write_t {
    self.base.ptr() as *mut uv_write_t
  }

  /// Number of buffer segments currently held for an in-flight write.
  pub fn pinned_segments(&self) -> usize {
    self.segments.borrow().len()
  }

  pub fn is_in_flight(&self) -> bool {
    self.base.is_in_flight()
  }

  /// Submit `segments` to `stream`. `callback` fires exactly once if this
  /// returns `Ok`, and never if it returns `Err`.
  pub fn write(
    self: &Rc<Self>,
    stream: &UvStreamHandle,
    segments: impl IntoIterator<Item = Bytes>,
    callback: impl FnOnce(&UvWriteReq, Result<(), UvError>) + 'static,
  ) -> Result<(), UvError> {
    self.base.pin(self.clone());
    let functions = self.base.functions().clone();

    let (bufs, count) = {
      let mut pinned = self.segments.borrow_mut();
      pinned.extend(segments);
      let descriptors = pinned.iter().map(|segment| {
        functions.buf_init(segment.as_ptr() as *mut u8, segment.len())
      });
      let bufs = if pinned.len() > INLINE_BUFFERS {
        let mut heap = self.heap_buffers.borrow_mut();
        heap.extend(descriptors);
        heap.as_mut_ptr()
      } else {
        // SAFETY: the block was sized for `INLINE_BUFFERS` descriptors past
        // `buffers_offset`.
        unsafe {
          let inline =
            (self.ptr() as *mut u8).add(self.buffers_offset) as *mut uv_buf_t;
          for (index, descriptor) in descriptors.enumerate() {
            inline.add(index).write(descriptor);
          }
          inline
        }
      };
      (bufs, pinned.len())
    };
    *self.callback.borrow_mut() = Some(Box::new(callback));

    let result = unsafe {
      functions.write(self.ptr(), stream.stream_ptr(), bufs, count, on_write)
    };
    if let Err(err) = result {
      let callback = self.release();
      drop(callback);
      let pin = self.base.unpin();
      drop(pin);
      return Err(err);
    }
    Ok(())
  }

  /// Like [`UvWriteReq::write`], resolving once the write completed.
  pub fn write_async<I>(
    self: &Rc<Self>,
    stream: &UvStreamHandle,
    segments: I,
  ) -> impl Future<Output = Result<(), UvError>> + use<I>
  where
    I: IntoIterator<Item = Bytes>,
  {
    let (tx, rx) = oneshot::channel();
    let submitted = self
      .write(stream, segments, move |_, result| {
        let _ = tx.send(result);
      })
      .map(|()| rx);
    request::completion(self.base.functions().clone(), submitted)
  }

  /// Drop the segments and descriptors of the finished write.
  fn release(&self) -> Option<WriteCallback> {
    self.segments.borrow_mut().clear();
    self.heap_buffers.borrow_mut().clear();
    self.callback.borrow_mut().take()
  }
}

impl UvOwner for UvWriteReq {
  fn into_any(self: Rc<Self>) -> Rc<dyn Any> {
    self
  }
}

unsafe extern "C" fn on_write(req: *mut uv_write_t, status: c_int) {
  let Some(this) = (unsafe { request::complete::<UvWriteReq>(req as _) })
  else {
    return;
  };
  let callback = this.release();
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

  use crate::functions::UvFunctions;
  use crate::tcp_handle::UvTcpHandle;
  use crate::uv;
  use crate::uv::uv_run_mode;

  fn connected_pair(
    loop_: &UvLoopHandle,
  ) -> (UvTcpHandle, std::net::TcpStream) {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let stream =
      std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (peer, _) = listener.accept().unwrap();
    let tcp = UvTcpHandle::init(loop_).unwrap();
    tcp.open(std::os::fd::IntoRawFd::into_raw_fd(stream)).unwrap();
    (tcp, peer)
  }

  #[test]
  fn test_three_segments_complete_once_and_unpin() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let (tcp, mut peer) = connected_pair(&loop_);
    let segments = [
      Bytes::from(vec![b'a'; 100]),
      Bytes::from(vec![b'b'; 100]),
      Bytes::from(vec![b'c'; 100]),
    ];
    let req = UvWriteReq::init(&loop_);
    let completions = Rc::new(Cell::new(0));
    let pinned_in_callback = Rc::new(Cell::new(usize::MAX));
    req
      .write(&tcp, segments.iter().cloned(), {
        let completions = completions.clone();
        let pinned_in_callback = pinned_in_callback.clone();
        move |req, result| {
          assert!(result.is_ok());
          completions.set(completions.get() + 1);
          pinned_in_callback.set(req.pinned_segments());
        }
      })
      .unwrap();
    assert_eq!(req.pinned_segments(), 3);
    assert!(req.is_in_flight());

    loop_.run(uv_run_mode::UV_RUN_NOWAIT).unwrap();
    while completions.get() == 0 {
      loop_.run(uv_run_mode::UV_RUN_ONCE).unwrap();
    }
    assert_eq!(completions.get(), 1);
    assert_eq!(pinned_in_callback.get(), 0);
    assert_eq!(req.pinned_segments(), 0);
    assert!(!req.is_in_flight());
    // Only the caller's references to the segments remain.
    assert!(segments.iter().all(|segment| segment.is_unique()));

    let mut received = vec![0u8; 300];
    peer.read_exact(&mut received).unwrap();
    assert_eq!(&received[..100], &[b'a'; 100][..]);
    assert_eq!(&received[200..], &[b'c'; 100][..]);

    tcp.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
  }

  #[test]
  fn test_long_chain_uses_heap_descriptors() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let (tcp, mut peer) = connected_pair(&loop_);
    let segments: Vec<Bytes> = (0..(INLINE_BUFFERS as u8 * 3))
      .map(|i| Bytes::from(vec![b'0' + i; 10]))
      .collect();
    let expected: Vec<u8> = segments.iter().flatten().copied().collect();
    let req = UvWriteReq::init(&loop_);
    let done = Rc::new(Cell::new(false));
    req
      .write(&tcp, segments, {
        let done = done.clone();
        move |_, result| {
          result.unwrap();
          done.set(true);
        }
      })
      .unwrap();
    while !done.get() {
      loop_.run(uv_run_mode::UV_RUN_ONCE).unwrap();
    }
    let mut received = vec![0u8; expected.len()];
    peer.read_exact(&mut received).unwrap();
    assert_eq!(received, expected);
    tcp.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
  }

  #[test]
  fn test_sync_failure_unpins_and_never_calls_back() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let tcp = UvTcpHandle::init(&loop_).unwrap();
    let req = UvWriteReq::init(&loop_);
    let segment = Bytes::from(vec![1u8; 16]);
    let called = Rc::new(Cell::new(false));
    let err = req
      .write(&tcp, [segment.clone(), segment.clone()], {
        let called = called.clone();
        move |_, _| called.set(true)
      })
      .unwrap_err();
    assert!(err.code() == uv::UV_EBADF || err.code() == uv::UV_EPIPE);
    assert_eq!(req.pinned_segments(), 0);
    assert!(!req.is_in_flight());
    assert!(segment.is_unique());

    tcp.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
    assert!(!called.get());
  }

  #[test]
  fn test_empty_chain_is_rejected() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let (tcp, _peer) = connected_pair(&loop_);
    let req = UvWriteReq::init(&loop_);
    let err = req.write(&tcp, std::iter::empty(), |_, _| {}).unwrap_err();
    assert_eq!(err.code(), uv::UV_EINVAL);
    tcp.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
  }

  #[test]
  fn test_request_is_reusable_after_completion() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let (tcp, mut peer) = connected_pair(&loop_);
    let req = UvWriteReq::init(&loop_);
    for chunk in [&b"first"[..], &b"second"[..]] {
      let write = req.write_async(&tcp, [Bytes::copy_from_slice(chunk)]);
      let mut write = Box::pin(write);
      let waker = futures::task::noop_waker();
      let mut cx = std::task::Context::from_waker(&waker);
      loop {
        if let std::task::Poll::Ready(result) = write.as_mut().poll(&mut cx) {
          result.unwrap();
          break;
        }
        loop_.run(uv_run_mode::UV_RUN_ONCE).unwrap();
      }
    }
    let mut received = vec![0u8; 11];
    peer.read_exact(&mut received).unwrap();
    assert_eq!(received, b"firstsecond");
    tcp.close();
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
  }

  #[test]
  fn test_close_cancels_pending_write() {
    let loop_ = UvLoopHandle::init(UvFunctions::builtin()).unwrap();
    let (tcp, _peer) = connected_pair(&loop_);
    let req = UvWriteReq::init(&loop_);
    let status = Rc::new(RefCell::new(None));
    req
      .write(&tcp, [Bytes::from_static(b"never sent")], {
        let status = status.clone();
        move |_, result| *status.borrow_mut() = Some(result)
      })
      .unwrap();
    tcp.close();
    drop(req);
    loop_.run(uv_run_mode::UV_RUN_DEFAULT).unwrap();
    let status = status.borrow_mut().take().unwrap();
    match status {
      Ok(()) => {}
      Err(err) => assert!(err.is_canceled()),
    }
  }
}
