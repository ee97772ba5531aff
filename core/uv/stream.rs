// Copyright 2018-2025 the Deno authors. MIT license.

use std::collections::VecDeque;
use std::ffi::c_int;
use std::ffi::c_uint;
use std::ffi::c_void;
use std::future::Future;
use std::io;
use std::io::IoSlice;
use std::os::fd::AsRawFd;
use std::os::fd::OwnedFd;
use std::pin::Pin;
use std::ptr::addr_of_mut;
use std::task::Context;
use std::task::Poll;

use smallvec::SmallVec;

use super::UV_EAGAIN;
use super::UV_EALREADY;
use super::UV_EBADF;
use super::UV_ECANCELED;
use super::UV_EINVAL;
use super::UV_EISCONN;
use super::UV_ENOBUFS;
use super::UV_ENOTCONN;
use super::UV_EOF;
use super::UV_EPIPE;
use super::UV_HANDLE_ACTIVE;
use super::errno::io_error_code;
use super::event_loop::UvLoopInner;
use super::event_loop::get_inner;
use super::is_closing;
use super::uv_alloc_cb;
use super::uv_buf_t;
use super::uv_connect_cb;
use super::uv_connect_t;
use super::uv_connection_cb;
use super::uv_handle_t;
use super::uv_handle_type;
use super::uv_read_cb;
use super::uv_req_type;
use super::uv_shutdown_cb;
use super::uv_shutdown_t;
use super::uv_stream_t;
use super::uv_write_cb;
use super::uv_write_t;

const SUGGESTED_READ_SIZE: usize = 64 * 1024;
const READ_BATCH: usize = 32;
const ACCEPT_BATCH: usize = 32;

pub(crate) enum StreamIo {
  Tcp(tokio::net::TcpStream),
  Pipe(tokio::net::UnixStream),
}

impl StreamIo {
  fn poll_read_ready(&self, cx: &mut Context) -> Poll<io::Result<()>> {
    match self {
      Self::Tcp(s) => s.poll_read_ready(cx),
      Self::Pipe(s) => s.poll_read_ready(cx),
    }
  }

  fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
    match self {
      Self::Tcp(s) => s.try_read(buf),
      Self::Pipe(s) => s.try_read(buf),
    }
  }

  fn poll_write_ready(&self, cx: &mut Context) -> Poll<io::Result<()>> {
    match self {
      Self::Tcp(s) => s.poll_write_ready(cx),
      Self::Pipe(s) => s.poll_write_ready(cx),
    }
  }

  fn try_write_vectored(&self, bufs: &[IoSlice]) -> io::Result<usize> {
    match self {
      Self::Tcp(s) => s.try_write_vectored(bufs),
      Self::Pipe(s) => s.try_write_vectored(bufs),
    }
  }

  /// Sends directly on the socket without consulting reactor readiness.
  fn send_vectored(&self, bufs: &[IoSlice]) -> io::Result<usize> {
    match self {
      Self::Tcp(s) => socket2::SockRef::from(s).send_vectored(bufs),
      Self::Pipe(s) => socket2::SockRef::from(s).send_vectored(bufs),
    }
  }

  fn shutdown_write(&self) -> io::Result<()> {
    match self {
      Self::Tcp(s) => socket2::SockRef::from(s).shutdown(std::net::Shutdown::Write),
      Self::Pipe(s) => {
        socket2::SockRef::from(s).shutdown(std::net::Shutdown::Write)
      }
    }
  }

  pub(crate) fn set_nodelay(&self, enable: bool) -> io::Result<()> {
    match self {
      Self::Tcp(s) => s.set_nodelay(enable),
      Self::Pipe(_) => Ok(()),
    }
  }

  fn raw_fd(&self) -> c_int {
    match self {
      Self::Tcp(s) => s.as_raw_fd(),
      Self::Pipe(s) => s.as_raw_fd(),
    }
  }
}

pub(crate) enum ListenerIo {
  Tcp(tokio::net::TcpListener),
  Pipe(tokio::net::UnixListener),
}

impl ListenerIo {
  fn poll_accept(&self, cx: &mut Context) -> Poll<io::Result<StreamIo>> {
    match self {
      Self::Tcp(l) => l.poll_accept(cx).map_ok(|(s, _)| StreamIo::Tcp(s)),
      Self::Pipe(l) => l.poll_accept(cx).map_ok(|(s, _)| StreamIo::Pipe(s)),
    }
  }

  fn raw_fd(&self) -> c_int {
    match self {
      Self::Tcp(l) => l.as_raw_fd(),
      Self::Pipe(l) => l.as_raw_fd(),
    }
  }
}

pub(crate) type ConnectFuture =
  Pin<Box<dyn Future<Output = io::Result<StreamIo>>>>;

struct ConnectPending {
  future: ConnectFuture,
  req: *mut uv_connect_t,
  cb: Option<uv_connect_cb>,
}

struct WritePending {
  req: *mut uv_write_t,
  cb: Option<uv_write_cb>,
  bufs: SmallVec<[uv_buf_t; 4]>,
  index: usize,
  offset: usize,
}

impl WritePending {
  fn remaining(&self) -> usize {
    let total: usize = self.bufs[self.index..].iter().map(|b| b.len()).sum();
    total - self.offset
  }

  fn advance(&mut self, mut n: usize) {
    while n > 0 && self.index < self.bufs.len() {
      let left = self.bufs[self.index].len() - self.offset;
      if n < left {
        self.offset += n;
        return;
      }
      n -= left;
      self.index += 1;
      self.offset = 0;
    }
  }

  fn io_slices(&self) -> SmallVec<[IoSlice<'_>; 8]> {
    let mut slices = SmallVec::new();
    for (i, buf) in self.bufs[self.index..].iter().enumerate() {
      let bytes = unsafe { buf.as_slice() };
      let bytes = if i == 0 { &bytes[self.offset..] } else { bytes };
      if !bytes.is_empty() {
        slices.push(IoSlice::new(bytes));
      }
    }
    slices
  }
}

struct ShutdownPending {
  req: *mut uv_shutdown_t,
  cb: Option<uv_shutdown_cb>,
}

/// Per-stream state behind `uv_stream_t::internal`, shared by tcp and pipe
/// handles.
#[derive(Default)]
pub(crate) struct StreamState {
  pub(crate) io: Option<StreamIo>,
  /// Bound but not yet listening or connecting.
  pub(crate) bound: Option<socket2::Socket>,
  pub(crate) listener: Option<ListenerIo>,
  pub(crate) nodelay: bool,
  connection_cb: Option<uv_connection_cb>,
  accepted: VecDeque<StreamIo>,
  alloc_cb: Option<uv_alloc_cb>,
  read_cb: Option<uv_read_cb>,
  reading: bool,
  connect: Option<ConnectPending>,
  writes: VecDeque<WritePending>,
  shutdown: Option<ShutdownPending>,
  write_closed: bool,
}

impl StreamState {
  pub(crate) fn is_unused(&self) -> bool {
    self.io.is_none()
      && self.bound.is_none()
      && self.listener.is_none()
      && self.connect.is_none()
  }
}

pub(crate) unsafe fn init_stream(stream: *mut uv_stream_t) {
  let state = Box::new(StreamState::default());
  unsafe {
    addr_of_mut!((*stream).internal).write(Box::into_raw(state) as *mut c_void);
  }
}

pub(crate) unsafe fn state<'a>(
  stream: *mut uv_stream_t,
) -> Option<&'a mut StreamState> {
  unsafe { ((*stream).internal as *mut StreamState).as_mut() }
}

/// State of a stream that is not closing. Callbacks may close the stream,
/// so every phase re-fetches through this after calling out.
unsafe fn live<'a>(stream: *mut uv_stream_t) -> Option<&'a mut StreamState> {
  unsafe {
    if is_closing(stream as *const uv_handle_t) {
      return None;
    }
    state(stream)
  }
}

unsafe fn update_active(stream: *mut uv_stream_t, state: &StreamState) {
  unsafe {
    if is_closing(stream as *const uv_handle_t) {
      return;
    }
    if state.reading || state.listener.is_some() {
      (*stream).flags |= UV_HANDLE_ACTIVE;
    } else {
      (*stream).flags &= !UV_HANDLE_ACTIVE;
    }
  }
}

unsafe fn stop_reading(stream: *mut uv_stream_t, state: &mut StreamState) {
  state.reading = false;
  unsafe { update_active(stream, state) };
}

pub(crate) unsafe fn stop_io(stream: *mut uv_stream_t) {
  unsafe {
    if let Some(state) = state(stream) {
      state.reading = false;
      state.connection_cb = None;
      state.listener = None;
      state.accepted.clear();
    }
  }
}

pub(crate) unsafe fn raw_fd(stream: *mut uv_stream_t) -> Option<c_int> {
  let state = unsafe { state(stream)? };
  if let Some(io) = &state.io {
    return Some(io.raw_fd());
  }
  if let Some(listener) = &state.listener {
    return Some(listener.raw_fd());
  }
  state.bound.as_ref().map(|s| s.as_raw_fd())
}

/// Release the stream state and cancel every request still attached to it.
/// Runs from the close phase, before the handle's close callback.
pub(crate) unsafe fn finish_close(
  inner: &UvLoopInner,
  stream: *mut uv_stream_t,
) {
  unsafe {
    let internal =
      std::mem::replace(&mut (*stream).internal, std::ptr::null_mut());
    if internal.is_null() {
      return;
    }
    let mut state = Box::from_raw(internal as *mut StreamState);
    let connect = state.connect.take();
    let writes = std::mem::take(&mut state.writes);
    let shutdown = state.shutdown.take();
    drop(state);

    if let Some(pending) = connect {
      inner.req_finished();
      if let Some(cb) = pending.cb {
        cb(pending.req, UV_ECANCELED);
      }
    }
    for pending in writes {
      inner.req_finished();
      if let Some(cb) = pending.cb {
        cb(pending.req, UV_ECANCELED);
      }
    }
    if let Some(pending) = shutdown {
      inner.req_finished();
      if let Some(cb) = pending.cb {
        cb(pending.req, UV_ECANCELED);
      }
    }
  }
}

/// One I/O pass over a stream: connect, accept, read, write, shutdown.
/// Returns whether any callback ran.
pub(crate) unsafe fn poll_stream(
  inner: &UvLoopInner,
  stream: *mut uv_stream_t,
  cx: &mut Context,
) -> bool {
  unsafe {
    let mut did_work = poll_connect(inner, stream, cx);
    did_work |= poll_accept(inner, stream, cx);
    did_work |= poll_read(inner, stream, cx);
    did_work |= poll_write(inner, stream, cx);
    did_work |= poll_shutdown(inner, stream);
    did_work
  }
}

unsafe fn poll_connect(
  inner: &UvLoopInner,
  stream: *mut uv_stream_t,
  cx: &mut Context,
) -> bool {
  unsafe {
    let Some(state) = live(stream) else {
      return false;
    };
    let Some(pending) = state.connect.as_mut() else {
      return false;
    };
    let Poll::Ready(result) = pending.future.as_mut().poll(cx) else {
      return false;
    };
    let Some(ConnectPending { req, cb, .. }) = state.connect.take() else {
      return false;
    };
    let status = match result {
      Ok(io) => {
        if state.nodelay {
          let _ = io.set_nodelay(true);
        }
        state.io = Some(io);
        0
      }
      Err(err) => io_error_code(&err),
    };
    let orphaned = if status != 0 {
      std::mem::take(&mut state.writes)
    } else {
      VecDeque::new()
    };

    inner.req_finished();
    if let Some(cb) = cb {
      cb(req, status);
    }
    for pending in orphaned {
      inner.req_finished();
      if let Some(cb) = pending.cb {
        cb(pending.req, UV_ECANCELED);
      }
    }
    true
  }
}

unsafe fn poll_accept(
  inner: &UvLoopInner,
  stream: *mut uv_stream_t,
  cx: &mut Context,
) -> bool {
  let mut did_work = false;
  let mut remaining = ACCEPT_BATCH;
  loop {
    let Some(state) = (unsafe { live(stream) }) else {
      break;
    };
    // An unclaimed connection pauses accepting until uv_accept takes it.
    if !state.accepted.is_empty() {
      break;
    }
    let (Some(listener), Some(cb)) =
      (state.listener.as_ref(), state.connection_cb)
    else {
      break;
    };
    if remaining == 0 {
      inner.io_pending.set(true);
      break;
    }
    remaining -= 1;
    let status = match listener.poll_accept(cx) {
      Poll::Pending => break,
      Poll::Ready(Ok(io)) => {
        state.accepted.push_back(io);
        0
      }
      Poll::Ready(Err(err)) => io_error_code(&err),
    };
    did_work = true;
    unsafe { cb(stream, status) };
    if status != 0 {
      break;
    }
  }
  did_work
}

unsafe fn poll_read(
  inner: &UvLoopInner,
  stream: *mut uv_stream_t,
  cx: &mut Context,
) -> bool {
  let mut did_work = false;
  let mut remaining = READ_BATCH;
  loop {
    let Some(state) = (unsafe { live(stream) }) else {
      break;
    };
    if !state.reading {
      break;
    }
    let (Some(alloc_cb), Some(read_cb)) = (state.alloc_cb, state.read_cb)
    else {
      break;
    };
    let Some(io) = state.io.as_ref() else {
      break;
    };
    if remaining == 0 {
      inner.io_pending.set(true);
      break;
    }
    match io.poll_read_ready(cx) {
      Poll::Pending => break,
      Poll::Ready(Ok(())) => {}
      Poll::Ready(Err(err)) => {
        unsafe { stop_reading(stream, state) };
        let buf = uv_buf_t::empty();
        unsafe { read_cb(stream, io_error_code(&err) as isize, &buf) };
        did_work = true;
        break;
      }
    }
    remaining -= 1;
    did_work = true;

    let mut buf = uv_buf_t::empty();
    unsafe {
      alloc_cb(stream as *mut uv_handle_t, SUGGESTED_READ_SIZE, &mut buf)
    };
    if buf.is_empty() {
      unsafe { read_cb(stream, UV_ENOBUFS as isize, &buf) };
      break;
    }
    // The allocator may have stopped or closed the stream. Hand the buffer
    // back untouched.
    let Some(state) = (unsafe { live(stream) }) else {
      unsafe { read_cb(stream, 0, &buf) };
      break;
    };
    let Some(io) = state.io.as_ref().filter(|_| state.reading) else {
      unsafe { read_cb(stream, 0, &buf) };
      break;
    };

    let slice =
      unsafe { std::slice::from_raw_parts_mut(buf.base as *mut u8, buf.len()) };
    match io.try_read(slice) {
      Ok(0) => {
        unsafe {
          stop_reading(stream, state);
          read_cb(stream, UV_EOF as isize, &buf);
        }
        break;
      }
      Ok(n) => unsafe { read_cb(stream, n as isize, &buf) },
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
        // Readiness was stale. The next poll_read_ready re-arms the waker.
        unsafe { read_cb(stream, 0, &buf) };
      }
      Err(err) => {
        unsafe {
          stop_reading(stream, state);
          read_cb(stream, io_error_code(&err) as isize, &buf);
        }
        break;
      }
    }
  }
  did_work
}

unsafe fn poll_write(
  inner: &UvLoopInner,
  stream: *mut uv_stream_t,
  cx: &mut Context,
) -> bool {
  let mut did_work = false;
  loop {
    let Some(state) = (unsafe { live(stream) }) else {
      break;
    };
    let Some(io) = state.io.as_ref() else {
      break;
    };
    let Some(front) = state.writes.front_mut() else {
      break;
    };

    let status = match io.poll_write_ready(cx) {
      Poll::Pending => break,
      Poll::Ready(Err(err)) => io_error_code(&err),
      Poll::Ready(Ok(())) => {
        let slices = front.io_slices();
        let result = if slices.is_empty() {
          Ok(0)
        } else {
          io.try_write_vectored(&slices)
        };
        drop(slices);
        match result {
          Ok(0) if front.remaining() > 0 => super::UV_EIO,
          Ok(n) => {
            front.advance(n);
            if front.remaining() > 0 {
              continue;
            }
            0
          }
          Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
          Err(err) => io_error_code(&err),
        }
      }
    };

    let Some(done) = state.writes.pop_front() else {
      break;
    };
    inner.req_finished();
    did_work = true;
    if let Some(cb) = done.cb {
      unsafe { cb(done.req, status) };
    }
  }
  did_work
}

unsafe fn poll_shutdown(inner: &UvLoopInner, stream: *mut uv_stream_t) -> bool {
  unsafe {
    let Some(state) = live(stream) else {
      return false;
    };
    if state.shutdown.is_none()
      || !state.writes.is_empty()
      || state.connect.is_some()
    {
      return false;
    }
    let status = match state.io.as_ref() {
      Some(io) => match io.shutdown_write() {
        Ok(()) => 0,
        Err(err) => io_error_code(&err),
      },
      None => UV_ENOTCONN,
    };
    state.write_closed = true;
    let Some(pending) = state.shutdown.take() else {
      return false;
    };
    inner.req_finished();
    if let Some(cb) = pending.cb {
      cb(pending.req, status);
    }
    true
  }
}

/// Queue a connect request. `make_future` runs only once the stream is
/// known to be idle and may consume its bound socket.
pub(crate) unsafe fn start_connect<F>(
  req: *mut uv_connect_t,
  stream: *mut uv_stream_t,
  cb: Option<uv_connect_cb>,
  make_future: F,
) -> c_int
where
  F: FnOnce(&mut StreamState) -> io::Result<ConnectFuture>,
{
  unsafe {
    let Some(state) = live(stream) else {
      return UV_EINVAL;
    };
    if state.connect.is_some() {
      return UV_EALREADY;
    }
    if state.io.is_some() || state.listener.is_some() {
      return UV_EISCONN;
    }
    let future = match make_future(state) {
      Ok(future) => future,
      Err(err) => return io_error_code(&err),
    };
    addr_of_mut!((*req).r#type).write(uv_req_type::UV_CONNECT);
    addr_of_mut!((*req).handle).write(stream);
    state.connect = Some(ConnectPending { future, req, cb });
    get_inner((*stream).loop_).req_started();
  }
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_listen(
  stream: *mut uv_stream_t,
  backlog: c_int,
  cb: uv_connection_cb,
) -> c_int {
  unsafe {
    let Some(state) = live(stream) else {
      return UV_EINVAL;
    };
    if state.listener.is_some() {
      state.connection_cb = Some(cb);
      return 0;
    }
    let Some(socket) = state.bound.take() else {
      return UV_EINVAL;
    };
    if let Err(err) = socket.listen(backlog) {
      state.bound = Some(socket);
      return io_error_code(&err);
    }

    let inner = get_inner((*stream).loop_);
    let _guard = inner.enter();
    let listener = match (*stream).r#type {
      uv_handle_type::UV_TCP => {
        tokio::net::TcpListener::from_std(std::net::TcpListener::from(socket))
          .map(ListenerIo::Tcp)
      }
      _ => {
        let std_listener =
          std::os::unix::net::UnixListener::from(OwnedFd::from(socket));
        tokio::net::UnixListener::from_std(std_listener).map(ListenerIo::Pipe)
      }
    };
    match listener {
      Ok(listener) => {
        state.listener = Some(listener);
        state.connection_cb = Some(cb);
        update_active(stream, state);
        inner.io_pending.set(true);
        0
      }
      Err(err) => io_error_code(&err),
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_accept(
  server: *mut uv_stream_t,
  client: *mut uv_stream_t,
) -> c_int {
  unsafe {
    if (*server).r#type != (*client).r#type {
      return UV_EINVAL;
    }
    let (Some(server_state), Some(client_state)) = (live(server), live(client))
    else {
      return UV_EINVAL;
    };
    if !client_state.is_unused() {
      return UV_EISCONN;
    }
    let Some(io) = server_state.accepted.pop_front() else {
      return UV_EAGAIN;
    };
    if client_state.nodelay {
      let _ = io.set_nodelay(true);
    }
    client_state.io = Some(io);
    // Accepting resumes once the backlog is claimed.
    get_inner((*server).loop_).io_pending.set(true);
  }
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_read_start(
  stream: *mut uv_stream_t,
  alloc_cb: uv_alloc_cb,
  read_cb: uv_read_cb,
) -> c_int {
  unsafe {
    let Some(state) = live(stream) else {
      return UV_EINVAL;
    };
    if state.io.is_none() {
      return UV_ENOTCONN;
    }
    state.alloc_cb = Some(alloc_cb);
    state.read_cb = Some(read_cb);
    state.reading = true;
    update_active(stream, state);
    get_inner((*stream).loop_).io_pending.set(true);
  }
  0
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_read_stop(stream: *mut uv_stream_t) -> c_int {
  unsafe {
    if let Some(state) = state(stream) {
      stop_reading(stream, state);
    }
  }
  0
}

/// Queue `nbufs` descriptors for writing. The descriptors are copied; the
/// bytes they point at must stay valid until the callback runs. The callback
/// always runs from a later loop phase, never from inside this call.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_write(
  req: *mut uv_write_t,
  handle: *mut uv_stream_t,
  bufs: *const uv_buf_t,
  nbufs: c_uint,
  cb: Option<uv_write_cb>,
) -> c_int {
  unsafe {
    if bufs.is_null() || nbufs == 0 {
      return UV_EINVAL;
    }
    let Some(state) = live(handle) else {
      return UV_EBADF;
    };
    if state.io.is_none() && state.connect.is_none() {
      return UV_EBADF;
    }
    if state.write_closed || state.shutdown.is_some() {
      return UV_EPIPE;
    }
    let descriptors = std::slice::from_raw_parts(bufs, nbufs as usize);
    if descriptors.iter().any(|b| b.base.is_null() && b.len() > 0) {
      return UV_EINVAL;
    }

    addr_of_mut!((*req).r#type).write(uv_req_type::UV_WRITE);
    addr_of_mut!((*req).handle).write(handle);
    state.writes.push_back(WritePending {
      req,
      cb,
      bufs: descriptors.iter().copied().collect(),
      index: 0,
      offset: 0,
    });
    get_inner((*handle).loop_).req_started();
  }
  0
}

/// Write as much as the socket takes right now. Returns the byte count or a
/// negative status; `UV_EAGAIN` while queued writes are outstanding.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_try_write(
  handle: *mut uv_stream_t,
  bufs: *const uv_buf_t,
  nbufs: c_uint,
) -> c_int {
  unsafe {
    if bufs.is_null() || nbufs == 0 {
      return UV_EINVAL;
    }
    let Some(state) = live(handle) else {
      return UV_EBADF;
    };
    if !state.writes.is_empty() || state.connect.is_some() {
      return UV_EAGAIN;
    }
    let Some(io) = state.io.as_ref() else {
      return UV_EBADF;
    };
    if state.write_closed || state.shutdown.is_some() {
      return UV_EPIPE;
    }
    let descriptors = std::slice::from_raw_parts(bufs, nbufs as usize);
    let slices: SmallVec<[IoSlice; 8]> = descriptors
      .iter()
      .map(|b| IoSlice::new(b.as_slice()))
      .collect();
    match io.send_vectored(&slices) {
      Ok(n) => n.min(c_int::MAX as usize) as c_int,
      Err(err) if err.kind() == io::ErrorKind::WouldBlock => UV_EAGAIN,
      Err(err) => io_error_code(&err),
    }
  }
}

/// Half-close the write side once every queued write has completed.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_shutdown(
  req: *mut uv_shutdown_t,
  handle: *mut uv_stream_t,
  cb: Option<uv_shutdown_cb>,
) -> c_int {
  unsafe {
    let Some(state) = live(handle) else {
      return UV_ENOTCONN;
    };
    if (state.io.is_none() && state.connect.is_none())
      || state.write_closed
      || state.shutdown.is_some()
    {
      return UV_ENOTCONN;
    }
    addr_of_mut!((*req).r#type).write(uv_req_type::UV_SHUTDOWN);
    addr_of_mut!((*req).handle).write(handle);
    state.shutdown = Some(ShutdownPending { req, cb });
    get_inner((*handle).loop_).req_started();
  }
  0
}

/// Bytes queued by `uv_write` that the socket has not taken yet.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_stream_get_write_queue_size(
  handle: *const uv_stream_t,
) -> usize {
  unsafe {
    match state(handle as *mut uv_stream_t) {
      Some(state) => state.writes.iter().map(WritePending::remaining).sum(),
      None => 0,
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_is_readable(handle: *const uv_stream_t) -> c_int {
  unsafe {
    match live(handle as *mut uv_stream_t) {
      Some(state) => state.io.is_some() as c_int,
      None => 0,
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_is_writable(handle: *const uv_stream_t) -> c_int {
  unsafe {
    match live(handle as *mut uv_stream_t) {
      Some(state) => {
        (state.io.is_some() && !state.write_closed && state.shutdown.is_none())
          as c_int
      }
      None => 0,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn buf(bytes: &'static [u8]) -> uv_buf_t {
    uv_buf_t::new(bytes.as_ptr() as *mut _, bytes.len())
  }

  #[test]
  fn test_write_pending_advance_across_buffers() {
    let mut pending = WritePending {
      req: std::ptr::null_mut(),
      cb: None,
      bufs: [buf(b"abc"), buf(b""), buf(b"defg")].into_iter().collect(),
      index: 0,
      offset: 0,
    };
    assert_eq!(pending.remaining(), 7);

    pending.advance(2);
    assert_eq!(pending.remaining(), 5);
    let slices = pending.io_slices();
    assert_eq!(slices.len(), 2);
    assert_eq!(&*slices[0], b"c");
    assert_eq!(&*slices[1], b"defg");
    drop(slices);

    pending.advance(3);
    assert_eq!(pending.index, 2);
    assert_eq!(pending.offset, 2);
    assert_eq!(pending.remaining(), 2);

    pending.advance(2);
    assert_eq!(pending.remaining(), 0);
    assert!(pending.io_slices().is_empty());
  }
}
