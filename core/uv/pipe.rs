// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::CStr;
use std::ffi::OsStr;
use std::ffi::c_char;
use std::ffi::c_int;
use std::os::fd::FromRawFd;
use std::os::fd::IntoRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use super::UV_EBUSY;
use super::UV_EINVAL;
use super::UV_HANDLE_REF;
use super::errno::io_error_code;
use super::event_loop::get_inner;
use super::init_handle_header;
use super::stream;
use super::stream::ConnectFuture;
use super::stream::StreamIo;
use super::uv_connect_cb;
use super::uv_connect_t;
use super::uv_file;
use super::uv_handle_t;
use super::uv_handle_type;
use super::uv_loop_t;
use super::uv_pipe_t;
use super::uv_stream_t;

unsafe fn path_from_c(name: *const c_char) -> Option<PathBuf> {
  if name.is_null() {
    return None;
  }
  let bytes = unsafe { CStr::from_ptr(name) }.to_bytes();
  if bytes.is_empty() {
    return None;
  }
  Some(PathBuf::from(OsStr::from_bytes(bytes)))
}

/// `ipc` is recorded but handle passing is not supported: the pending count
/// stays at zero.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_pipe_init(
  loop_: *mut uv_loop_t,
  pipe: *mut uv_pipe_t,
  ipc: c_int,
) -> c_int {
  unsafe {
    init_handle_header(
      pipe as *mut uv_handle_t,
      loop_,
      uv_handle_type::UV_NAMED_PIPE,
      UV_HANDLE_REF,
    );
    stream::init_stream(pipe as *mut uv_stream_t);
    std::ptr::addr_of_mut!((*pipe).ipc).write(ipc);
  }
  0
}

/// Adopt an existing descriptor. The descriptor is left open on failure.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_pipe_open(pipe: *mut uv_pipe_t, file: uv_file) -> c_int {
  unsafe {
    let Some(state) = stream::state(pipe as *mut uv_stream_t) else {
      return UV_EINVAL;
    };
    if !state.is_unused() {
      return UV_EBUSY;
    }
    let socket = socket2::Socket::from_raw_fd(file);
    if let Err(err) = socket.set_nonblocking(true) {
      let _ = socket.into_raw_fd();
      return io_error_code(&err);
    }
    if socket.peer_addr().is_err() {
      state.bound = Some(socket);
      return 0;
    }

    let inner = get_inner((*pipe).loop_);
    let _guard = inner.enter();
    let registered = socket.try_clone().and_then(|duplicate| {
      tokio::net::UnixStream::from_std(std::os::unix::net::UnixStream::from(
        std::os::fd::OwnedFd::from(duplicate),
      ))
    });
    match registered {
      Ok(io) => {
        drop(socket);
        state.io = Some(StreamIo::Pipe(io));
        inner.io_pending.set(true);
        0
      }
      Err(err) => {
        let _ = socket.into_raw_fd();
        io_error_code(&err)
      }
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_pipe_bind(
  pipe: *mut uv_pipe_t,
  name: *const c_char,
) -> c_int {
  unsafe {
    let Some(path) = path_from_c(name) else {
      return UV_EINVAL;
    };
    let Some(state) = stream::state(pipe as *mut uv_stream_t) else {
      return UV_EINVAL;
    };
    if !state.is_unused() {
      return UV_EINVAL;
    }
    let bind = || -> std::io::Result<socket2::Socket> {
      let addr = socket2::SockAddr::unix(&path)?;
      let socket =
        socket2::Socket::new(socket2::Domain::UNIX, socket2::Type::STREAM, None)?;
      socket.set_nonblocking(true)?;
      socket.bind(&addr)?;
      Ok(socket)
    };
    match bind() {
      Ok(socket) => {
        state.bound = Some(socket);
        0
      }
      Err(err) => io_error_code(&err),
    }
  }
}

/// Errors, including an invalid name, are reported through `cb` from the
/// loop rather than returned.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_pipe_connect(
  req: *mut uv_connect_t,
  pipe: *mut uv_pipe_t,
  name: *const c_char,
  cb: Option<uv_connect_cb>,
) {
  unsafe {
    let path = path_from_c(name);
    let status =
      stream::start_connect(req, pipe as *mut uv_stream_t, cb, move |_| {
        let future: ConnectFuture = match path {
          Some(path) => Box::pin(async move {
            tokio::net::UnixStream::connect(path).await.map(StreamIo::Pipe)
          }),
          None => Box::pin(std::future::ready(Err(
            std::io::Error::from_raw_os_error(libc::EINVAL),
          ))),
        };
        Ok(future)
      });
    if status != 0
      && let Some(cb) = cb
    {
      cb(req, status);
    }
  }
}

/// Always 0: handles are never passed over pipes since `uv_write2` is not
/// provided.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_pipe_pending_count(_pipe: *mut uv_pipe_t) -> c_int {
  0
}

#[cfg(test)]
mod tests {
  use super::super::test_util::*;
  use super::super::*;
  use std::cell::RefCell;
  use std::ffi::CString;
  use std::ffi::c_int;
  use std::io::Read;
  use std::io::Write;
  use std::sync::atomic::AtomicUsize;
  use std::sync::atomic::Ordering;

  fn socket_path(tag: &str) -> std::path::PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    std::env::temp_dir().join(format!(
      "uv_transport_{}_{}_{}.sock",
      tag,
      std::process::id(),
      n
    ))
  }

  fn c_path(path: &std::path::Path) -> CString {
    CString::new(path.as_os_str().as_encoded_bytes()).unwrap()
  }

  struct PipeCtx {
    client: *mut uv_pipe_t,
    scratch: Vec<u8>,
    received: Vec<u8>,
  }

  thread_local! {
    static CTX: RefCell<Option<*mut PipeCtx>> = const { RefCell::new(None) };
  }

  unsafe fn ctx<'a>() -> &'a mut PipeCtx {
    let ptr = CTX.with(|c| c.borrow().unwrap());
    unsafe { &mut *ptr }
  }

  unsafe extern "C" fn on_connection(server: *mut uv_stream_t, status: c_int) {
    assert_eq!(status, 0);
    unsafe {
      let client = ctx().client as *mut uv_stream_t;
      assert_eq!(uv_accept(server, client), 0);
      assert_eq!(uv_read_start(client, on_alloc, on_read), 0);
      uv_close(server as *mut uv_handle_t, None);
    }
  }

  unsafe extern "C" fn on_alloc(
    _handle: *mut uv_handle_t,
    _suggested: usize,
    buf: *mut uv_buf_t,
  ) {
    unsafe {
      let ctx = ctx();
      // Small buffer so a message spans several reads.
      ctx.scratch.resize(4, 0);
      *buf = uv_buf_t::new(ctx.scratch.as_mut_ptr() as *mut _, 4);
    }
  }

  unsafe extern "C" fn on_read(
    stream: *mut uv_stream_t,
    nread: isize,
    _buf: *const uv_buf_t,
  ) {
    unsafe {
      let ctx = ctx();
      if nread > 0 {
        let chunk = ctx.scratch[..nread as usize].to_vec();
        ctx.received.extend_from_slice(&chunk);
      } else if nread < 0 {
        assert_eq!(nread as c_int, UV_EOF);
        uv_close(stream as *mut uv_handle_t, None);
      }
    }
  }

  #[test]
  fn test_pipe_server_reads_until_eof() {
    unsafe {
      let loop_ = make_loop();
      let server = alloc::<uv_pipe_t>();
      let client = alloc::<uv_pipe_t>();
      let mut ctx = Box::new(PipeCtx {
        client,
        scratch: Vec::new(),
        received: Vec::new(),
      });
      CTX.with(|c| *c.borrow_mut() = Some(&mut *ctx as *mut PipeCtx));

      uv_pipe_init(loop_, server, 0);
      uv_pipe_init(loop_, client, 0);
      let path = socket_path("server");
      let name = c_path(&path);
      assert_eq!(uv_pipe_bind(server, name.as_ptr()), 0);
      assert_eq!(uv_pipe_bind(server, name.as_ptr()), UV_EINVAL);
      assert_eq!(uv_listen(server as *mut uv_stream_t, 8, on_connection), 0);
      assert_eq!(uv_pipe_pending_count(server), 0);

      let peer_path = path.clone();
      let peer = std::thread::spawn(move || {
        let mut socket =
          std::os::unix::net::UnixStream::connect(&peer_path).unwrap();
        socket.write_all(b"over a unix socket").unwrap();
      });

      assert_eq!(uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT), 0);
      peer.join().unwrap();
      assert_eq!(ctx.received, b"over a unix socket");

      CTX.with(|c| *c.borrow_mut() = None);
      destroy_loop(loop_);
      free(server);
      free(client);
      let _ = std::fs::remove_file(&path);
    }
  }

  #[test]
  fn test_pipe_connect_and_write() {
    unsafe {
      let loop_ = make_loop();
      let pipe = alloc::<uv_pipe_t>();
      let connect_req = alloc::<uv_connect_t>();
      let write_req = alloc::<uv_write_t>();
      uv_pipe_init(loop_, pipe, 0);

      let path = socket_path("connect");
      let listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
      let reader = std::thread::spawn(move || {
        let (mut socket, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        socket.read_to_end(&mut received).unwrap();
        received
      });

      static PAYLOAD: &[u8] = b"ping";
      unsafe extern "C" fn on_connect(req: *mut uv_connect_t, status: c_int) {
        assert_eq!(status, 0);
        unsafe {
          let stream = (*req).handle;
          let write_req = (*req).data as *mut uv_write_t;
          let buf = uv_buf_t::new(PAYLOAD.as_ptr() as *mut _, PAYLOAD.len());
          assert_eq!(uv_write(write_req, stream, &buf, 1, Some(on_write)), 0);
        }
      }
      unsafe extern "C" fn on_write(req: *mut uv_write_t, status: c_int) {
        assert_eq!(status, 0);
        unsafe { uv_close((*req).handle as *mut uv_handle_t, None) };
      }

      (*connect_req).data = write_req as *mut _;
      let name = c_path(&path);
      uv_pipe_connect(connect_req, pipe, name.as_ptr(), Some(on_connect));
      // Initializing the request leaves user data alone.
      assert_eq!((*connect_req).data, write_req as *mut _);

      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      assert_eq!(reader.join().unwrap(), PAYLOAD);

      destroy_loop(loop_);
      free(connect_req);
      free(write_req);
      free(pipe);
      let _ = std::fs::remove_file(&path);
    }
  }

  #[test]
  fn test_pipe_connect_error_is_async() {
    unsafe {
      let loop_ = make_loop();
      let pipe = alloc::<uv_pipe_t>();
      let req = alloc::<uv_connect_t>();
      uv_pipe_init(loop_, pipe, 0);

      static STATUS: std::sync::atomic::AtomicI32 =
        std::sync::atomic::AtomicI32::new(1);
      unsafe extern "C" fn on_connect(req: *mut uv_connect_t, status: c_int) {
        STATUS.store(status, Ordering::SeqCst);
        unsafe { uv_close((*req).handle as *mut uv_handle_t, None) };
      }

      let missing = c_path(&socket_path("missing"));
      uv_pipe_connect(req, pipe, missing.as_ptr(), Some(on_connect));
      assert_eq!(STATUS.load(Ordering::SeqCst), 1);

      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      assert_eq!(STATUS.load(Ordering::SeqCst), UV_ENOENT);

      destroy_loop(loop_);
      free(req);
      free(pipe);
    }
  }

  #[test]
  fn test_pipe_bind_missing_directory() {
    unsafe {
      let loop_ = make_loop();
      let pipe = alloc::<uv_pipe_t>();
      uv_pipe_init(loop_, pipe, 1);
      assert_eq!((*pipe).ipc, 1);

      let name = c"/nonexistent-uv-transport-dir/sock";
      assert_eq!(uv_pipe_bind(pipe, name.as_ptr()), UV_ENOENT);
      assert_eq!(uv_pipe_bind(pipe, std::ptr::null()), UV_EINVAL);

      uv_close(pipe as *mut uv_handle_t, None);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      destroy_loop(loop_);
      free(pipe);
    }
  }
}
