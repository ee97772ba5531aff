// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::c_int;
use std::ffi::c_uint;
use std::net::SocketAddr;
use std::os::fd::FromRawFd;
use std::os::fd::IntoRawFd;

use super::UV_EBADF;
use super::UV_EBUSY;
use super::UV_EINVAL;
use super::UV_ENOTCONN;
use super::UV_HANDLE_REF;
use super::errno::io_error_code;
use super::event_loop::get_inner;
use super::init_handle_header;
use super::sockaddr::sockaddr_to_std;
use super::sockaddr::std_to_sockaddr;
use super::stream;
use super::stream::ConnectFuture;
use super::stream::ListenerIo;
use super::stream::StreamIo;
use super::uv_connect_cb;
use super::uv_connect_t;
use super::uv_handle_t;
use super::uv_handle_type;
use super::uv_loop_t;
use super::uv_os_sock_t;
use super::uv_stream_t;
use super::uv_tcp_t;

/// `uv_tcp_bind` flag: refuse IPv4-mapped addresses on an IPv6 socket.
pub const UV_TCP_IPV6ONLY: c_uint = 1;

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_tcp_init(
  loop_: *mut uv_loop_t,
  tcp: *mut uv_tcp_t,
) -> c_int {
  unsafe {
    init_handle_header(
      tcp as *mut uv_handle_t,
      loop_,
      uv_handle_type::UV_TCP,
      UV_HANDLE_REF,
    );
    stream::init_stream(tcp as *mut uv_stream_t);
  }
  0
}

/// Adopt an existing socket. A connected socket becomes the stream's
/// transport; anything else is kept as a bound socket ready for
/// `uv_listen`. The descriptor is left open on failure. A connected socket
/// is registered through a duplicate, so `uv_fileno` may report a
/// different number than `sock`.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_tcp_open(
  tcp: *mut uv_tcp_t,
  sock: uv_os_sock_t,
) -> c_int {
  unsafe {
    let stream = tcp as *mut uv_stream_t;
    let Some(state) = stream::state(stream) else {
      return UV_EINVAL;
    };
    if !state.is_unused() {
      return UV_EBUSY;
    }
    let socket = socket2::Socket::from_raw_fd(sock);
    if let Err(err) = socket.set_nonblocking(true) {
      let _ = socket.into_raw_fd();
      return io_error_code(&err);
    }
    if socket.peer_addr().is_err() {
      state.bound = Some(socket);
      return 0;
    }

    let inner = get_inner((*tcp).loop_);
    let _guard = inner.enter();
    let registered = socket.try_clone().and_then(|duplicate| {
      tokio::net::TcpStream::from_std(std::net::TcpStream::from(duplicate))
    });
    match registered {
      Ok(io) => {
        drop(socket);
        if state.nodelay {
          let _ = io.set_nodelay(true);
        }
        state.io = Some(StreamIo::Tcp(io));
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
pub unsafe extern "C" fn uv_tcp_nodelay(
  tcp: *mut uv_tcp_t,
  enable: c_int,
) -> c_int {
  unsafe {
    let Some(state) = stream::state(tcp as *mut uv_stream_t) else {
      return UV_EINVAL;
    };
    let enable = enable != 0;
    state.nodelay = enable;
    let result = if let Some(io) = &state.io {
      io.set_nodelay(enable)
    } else if let Some(bound) = &state.bound {
      bound.set_nodelay(enable)
    } else {
      Ok(())
    };
    match result {
      Ok(()) => 0,
      Err(err) => io_error_code(&err),
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_tcp_bind(
  tcp: *mut uv_tcp_t,
  addr: *const libc::sockaddr,
  flags: c_uint,
) -> c_int {
  unsafe {
    let Some(addr) = sockaddr_to_std(addr) else {
      return UV_EINVAL;
    };
    let Some(state) = stream::state(tcp as *mut uv_stream_t) else {
      return UV_EINVAL;
    };
    if !state.is_unused() {
      return UV_EINVAL;
    }
    match bind_socket(addr, flags, state.nodelay) {
      Ok(socket) => {
        state.bound = Some(socket);
        0
      }
      Err(err) => io_error_code(&err),
    }
  }
}

fn bind_socket(
  addr: SocketAddr,
  flags: c_uint,
  nodelay: bool,
) -> std::io::Result<socket2::Socket> {
  let socket = socket2::Socket::new(
    socket2::Domain::for_address(addr),
    socket2::Type::STREAM,
    Some(socket2::Protocol::TCP),
  )?;
  socket.set_reuse_address(true)?;
  if addr.is_ipv6() && flags & UV_TCP_IPV6ONLY != 0 {
    socket.set_only_v6(true)?;
  }
  if nodelay {
    socket.set_nodelay(true)?;
  }
  socket.set_nonblocking(true)?;
  socket.bind(&addr.into())?;
  Ok(socket)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_tcp_connect(
  req: *mut uv_connect_t,
  tcp: *mut uv_tcp_t,
  addr: *const libc::sockaddr,
  cb: Option<uv_connect_cb>,
) -> c_int {
  unsafe {
    let Some(addr) = sockaddr_to_std(addr) else {
      return UV_EINVAL;
    };
    stream::start_connect(req, tcp as *mut uv_stream_t, cb, move |state| {
      let socket = match state.bound.take() {
        Some(bound) => tokio::net::TcpSocket::from_std_stream(bound.into()),
        None if addr.is_ipv4() => tokio::net::TcpSocket::new_v4()?,
        None => tokio::net::TcpSocket::new_v6()?,
      };
      let future: ConnectFuture =
        Box::pin(async move { socket.connect(addr).await.map(StreamIo::Tcp) });
      Ok(future)
    })
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_tcp_getsockname(
  tcp: *const uv_tcp_t,
  name: *mut libc::sockaddr,
  namelen: *mut c_int,
) -> c_int {
  unsafe {
    let Some(state) = stream::state(tcp as *mut uv_stream_t) else {
      return UV_EBADF;
    };
    let result = if let Some(StreamIo::Tcp(io)) = &state.io {
      io.local_addr()
    } else if let Some(ListenerIo::Tcp(listener)) = &state.listener {
      listener.local_addr()
    } else if let Some(bound) = &state.bound {
      bound.local_addr().and_then(|addr| {
        addr
          .as_socket()
          .ok_or_else(|| std::io::Error::from_raw_os_error(libc::EINVAL))
      })
    } else {
      return UV_EBADF;
    };
    match result {
      Ok(addr) => {
        std_to_sockaddr(addr, name, namelen);
        0
      }
      Err(err) => io_error_code(&err),
    }
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_tcp_getpeername(
  tcp: *const uv_tcp_t,
  name: *mut libc::sockaddr,
  namelen: *mut c_int,
) -> c_int {
  unsafe {
    let Some(state) = stream::state(tcp as *mut uv_stream_t) else {
      return UV_EBADF;
    };
    let Some(StreamIo::Tcp(io)) = &state.io else {
      return UV_ENOTCONN;
    };
    match io.peer_addr() {
      Ok(addr) => {
        std_to_sockaddr(addr, name, namelen);
        0
      }
      Err(err) => io_error_code(&err),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::super::test_util::*;
  use super::super::*;
  use std::cell::RefCell;
  use std::ffi::c_int;
  use std::io::Read;
  use std::io::Write;

  unsafe fn bind_loopback(tcp: *mut uv_tcp_t) -> u16 {
    unsafe {
      let mut addr: libc::sockaddr_in = std::mem::zeroed();
      assert_eq!(uv_ip4_addr(c"127.0.0.1".as_ptr(), 0, &mut addr), 0);
      assert_eq!(
        uv_tcp_bind(tcp, &addr as *const _ as *const libc::sockaddr, 0),
        0
      );
      let mut storage: libc::sockaddr_storage = std::mem::zeroed();
      let mut len = std::mem::size_of_val(&storage) as c_int;
      assert_eq!(
        uv_tcp_getsockname(
          tcp,
          &mut storage as *mut _ as *mut libc::sockaddr,
          &mut len,
        ),
        0
      );
      let bound =
        super::sockaddr_to_std(&storage as *const _ as *const libc::sockaddr);
      bound.unwrap().port()
    }
  }

  struct EchoCtx {
    client: *mut uv_tcp_t,
    write_req: *mut uv_write_t,
    shutdown_req: *mut uv_shutdown_t,
    scratch: Vec<u8>,
    received: Vec<u8>,
    events: Vec<&'static str>,
  }

  thread_local! {
    static ECHO: RefCell<Option<*mut EchoCtx>> = const { RefCell::new(None) };
  }

  unsafe fn echo_ctx<'a>() -> &'a mut EchoCtx {
    let ptr = ECHO.with(|c| c.borrow().unwrap());
    unsafe { &mut *ptr }
  }

  unsafe extern "C" fn on_connection(server: *mut uv_stream_t, status: c_int) {
    assert_eq!(status, 0);
    unsafe {
      let ctx = echo_ctx();
      let client = ctx.client as *mut uv_stream_t;
      assert_eq!(uv_accept(server, client), 0);
      assert_eq!(uv_accept(server, client), UV_EISCONN);
      assert_eq!(uv_read_start(client, on_alloc, on_read), 0);
      assert_eq!(uv_is_active(client as *mut uv_handle_t), 1);
      uv_close(server as *mut uv_handle_t, None);
    }
  }

  unsafe extern "C" fn on_alloc(
    _handle: *mut uv_handle_t,
    suggested: usize,
    buf: *mut uv_buf_t,
  ) {
    unsafe {
      let ctx = echo_ctx();
      ctx.scratch.resize(suggested, 0);
      *buf = uv_buf_t::new(ctx.scratch.as_mut_ptr() as *mut _, suggested);
    }
  }

  unsafe extern "C" fn on_read(
    stream: *mut uv_stream_t,
    nread: isize,
    _buf: *const uv_buf_t,
  ) {
    unsafe {
      let ctx = echo_ctx();
      if nread > 0 {
        let data = ctx.scratch[..nread as usize].to_vec();
        ctx.received.extend_from_slice(&data);
        return;
      }
      if nread as c_int == UV_EOF {
        ctx.events.push("eof");
        assert_eq!(uv_is_active(stream as *mut uv_handle_t), 0);
        let out = uv_buf_t::new(
          ctx.received.as_mut_ptr() as *mut _,
          ctx.received.len(),
        );
        assert_eq!(uv_write(ctx.write_req, stream, &out, 1, Some(on_write)), 0);
        assert_eq!(uv_shutdown(ctx.shutdown_req, stream, Some(on_shutdown)), 0);
        assert_eq!(uv_write(ctx.write_req, stream, &out, 1, None), UV_EPIPE);
      }
    }
  }

  unsafe extern "C" fn on_write(req: *mut uv_write_t, status: c_int) {
    assert_eq!(status, 0);
    unsafe {
      let ctx = echo_ctx();
      assert_eq!((*req).r#type, uv_req_type::UV_WRITE);
      ctx.events.push("write");
    }
  }

  unsafe extern "C" fn on_shutdown(req: *mut uv_shutdown_t, status: c_int) {
    assert_eq!(status, 0);
    unsafe {
      let ctx = echo_ctx();
      ctx.events.push("shutdown");
      uv_close((*req).handle as *mut uv_handle_t, None);
    }
  }

  #[test]
  fn test_tcp_echo_with_half_close() {
    unsafe {
      let loop_ = make_loop();
      let server = alloc::<uv_tcp_t>();
      let client = alloc::<uv_tcp_t>();
      let mut ctx = Box::new(EchoCtx {
        client,
        write_req: alloc::<uv_write_t>(),
        shutdown_req: alloc::<uv_shutdown_t>(),
        scratch: Vec::new(),
        received: Vec::new(),
        events: Vec::new(),
      });
      ECHO.with(|c| *c.borrow_mut() = Some(&mut *ctx as *mut EchoCtx));

      uv_tcp_init(loop_, server);
      uv_tcp_init(loop_, client);
      let port = bind_loopback(server);
      assert_eq!(uv_listen(server as *mut uv_stream_t, 128, on_connection), 0);

      let peer = std::thread::spawn(move || {
        let mut socket = std::net::TcpStream::connect(("127.0.0.1", port))
          .expect("connect");
        socket.write_all(b"hello world").unwrap();
        socket.shutdown(std::net::Shutdown::Write).unwrap();
        let mut echoed = Vec::new();
        socket.read_to_end(&mut echoed).unwrap();
        echoed
      });

      assert_eq!(uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT), 0);
      let echoed = peer.join().unwrap();

      assert_eq!(echoed, b"hello world");
      assert_eq!(ctx.events, vec!["eof", "write", "shutdown"]);

      ECHO.with(|c| *c.borrow_mut() = None);
      destroy_loop(loop_);
      free(ctx.write_req);
      free(ctx.shutdown_req);
      free(server);
      free(client);
    }
  }

  thread_local! {
    static STATUSES: RefCell<Vec<(&'static str, c_int)>> =
      const { RefCell::new(Vec::new()) };
  }

  unsafe extern "C" fn record_connect(_req: *mut uv_connect_t, status: c_int) {
    STATUSES.with(|s| s.borrow_mut().push(("connect", status)));
  }

  unsafe extern "C" fn record_write(_req: *mut uv_write_t, status: c_int) {
    STATUSES.with(|s| s.borrow_mut().push(("write", status)));
  }

  unsafe extern "C" fn record_close(_handle: *mut uv_handle_t) {
    STATUSES.with(|s| s.borrow_mut().push(("close", 0)));
  }

  #[test]
  fn test_close_cancels_pending_requests() {
    unsafe {
      let loop_ = make_loop();
      let tcp = alloc::<uv_tcp_t>();
      let connect_req = alloc::<uv_connect_t>();
      let write_req = alloc::<uv_write_t>();
      uv_tcp_init(loop_, tcp);

      let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      let mut addr: libc::sockaddr_in = std::mem::zeroed();
      let port = listener.local_addr().unwrap().port() as c_int;
      uv_ip4_addr(c"127.0.0.1".as_ptr(), port, &mut addr);

      assert_eq!(
        uv_tcp_connect(
          connect_req,
          tcp,
          &addr as *const _ as *const libc::sockaddr,
          Some(record_connect),
        ),
        0
      );
      assert_eq!(
        uv_tcp_connect(
          connect_req,
          tcp,
          &addr as *const _ as *const libc::sockaddr,
          Some(record_connect),
        ),
        UV_EALREADY
      );

      static PAYLOAD: &[u8] = b"queued before connect";
      let buf = uv_buf_t::new(PAYLOAD.as_ptr() as *mut _, PAYLOAD.len());
      let stream = tcp as *mut uv_stream_t;
      assert_eq!(uv_write(write_req, stream, &buf, 1, Some(record_write)), 0);
      assert_eq!(uv_try_write(stream, &buf, 1), UV_EAGAIN);
      assert_eq!(uv_stream_get_write_queue_size(stream), PAYLOAD.len());

      uv_close(tcp as *mut uv_handle_t, Some(record_close));
      assert_eq!(uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT), 0);

      let statuses = STATUSES.with(|s| s.borrow().clone());
      assert_eq!(
        statuses,
        vec![
          ("connect", UV_ECANCELED),
          ("write", UV_ECANCELED),
          ("close", 0),
        ]
      );

      drop(listener);
      destroy_loop(loop_);
      free(connect_req);
      free(write_req);
      free(tcp);
    }
  }

  #[test]
  fn test_connect_refused() {
    unsafe {
      let loop_ = make_loop();
      let tcp = alloc::<uv_tcp_t>();
      let req = alloc::<uv_connect_t>();
      uv_tcp_init(loop_, tcp);

      let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
      };
      let mut addr: libc::sockaddr_in = std::mem::zeroed();
      uv_ip4_addr(c"127.0.0.1".as_ptr(), port as c_int, &mut addr);

      static STATUS: std::sync::atomic::AtomicI32 =
        std::sync::atomic::AtomicI32::new(1);
      unsafe extern "C" fn on_connect(req: *mut uv_connect_t, status: c_int) {
        STATUS.store(status, std::sync::atomic::Ordering::SeqCst);
        unsafe { uv_close((*req).handle as *mut uv_handle_t, None) };
      }

      assert_eq!(
        uv_tcp_connect(
          req,
          tcp,
          &addr as *const _ as *const libc::sockaddr,
          Some(on_connect),
        ),
        0
      );
      assert_eq!((*req).r#type, uv_req_type::UV_CONNECT);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      assert_eq!(
        STATUS.load(std::sync::atomic::Ordering::SeqCst),
        UV_ECONNREFUSED
      );

      destroy_loop(loop_);
      free(req);
      free(tcp);
    }
  }

  #[test]
  fn test_unconnected_stream_errors() {
    unsafe {
      let loop_ = make_loop();
      let tcp = alloc::<uv_tcp_t>();
      let other = alloc::<uv_tcp_t>();
      let write_req = alloc::<uv_write_t>();
      let shutdown_req = alloc::<uv_shutdown_t>();
      uv_tcp_init(loop_, tcp);
      uv_tcp_init(loop_, other);
      let stream = tcp as *mut uv_stream_t;

      unsafe extern "C" fn noop_alloc(
        _: *mut uv_handle_t,
        _: usize,
        _: *mut uv_buf_t,
      ) {
      }
      unsafe extern "C" fn noop_read(
        _: *mut uv_stream_t,
        _: isize,
        _: *const uv_buf_t,
      ) {
      }
      unsafe extern "C" fn noop_connection(_: *mut uv_stream_t, _: c_int) {}

      let buf = uv_buf_t::new(b"x".as_ptr() as *mut _, 1);
      assert_eq!(uv_write(write_req, stream, &buf, 0, None), UV_EINVAL);
      assert_eq!(uv_write(write_req, stream, &buf, 1, None), UV_EBADF);
      assert_eq!(uv_try_write(stream, &buf, 1), UV_EBADF);
      assert_eq!(uv_shutdown(shutdown_req, stream, None), UV_ENOTCONN);
      assert_eq!(uv_read_start(stream, noop_alloc, noop_read), UV_ENOTCONN);
      assert_eq!(uv_listen(stream, 16, noop_connection), UV_EINVAL);
      assert_eq!(uv_accept(stream, other as *mut uv_stream_t), UV_EAGAIN);
      assert_eq!(
        uv_tcp_getpeername(tcp, std::ptr::null_mut(), std::ptr::null_mut()),
        UV_ENOTCONN
      );

      let mut fd = -1;
      assert_eq!(uv_fileno(tcp as *mut uv_handle_t, &mut fd), UV_EBADF);
      bind_loopback(tcp);
      assert_eq!(uv_fileno(tcp as *mut uv_handle_t, &mut fd), 0);
      assert!(fd >= 0);
      assert_eq!(uv_tcp_nodelay(tcp, 1), 0);

      uv_close(tcp as *mut uv_handle_t, None);
      uv_close(other as *mut uv_handle_t, None);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      destroy_loop(loop_);
      free(write_req);
      free(shutdown_req);
      free(tcp);
      free(other);
    }
  }

  #[test]
  fn test_tcp_open_adopts_connected_socket() {
    unsafe {
      let loop_ = make_loop();
      let tcp = alloc::<uv_tcp_t>();
      uv_tcp_init(loop_, tcp);

      let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      let socket =
        std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
      let (mut accepted, _) = listener.accept().unwrap();
      let expected_peer = socket.peer_addr().unwrap();

      use std::os::fd::IntoRawFd;
      assert_eq!(uv_tcp_open(tcp, socket.into_raw_fd()), 0);

      let mut storage: libc::sockaddr_storage = std::mem::zeroed();
      let mut len = 0;
      assert_eq!(
        uv_tcp_getpeername(
          tcp,
          &mut storage as *mut _ as *mut libc::sockaddr,
          &mut len,
        ),
        0
      );
      let peer =
        super::sockaddr_to_std(&storage as *const _ as *const libc::sockaddr);
      assert_eq!(peer, Some(expected_peer));

      static DATA: &[u8] = b"through an adopted fd";
      let req = alloc::<uv_write_t>();
      let buf = uv_buf_t::new(DATA.as_ptr() as *mut _, DATA.len());
      assert_eq!(uv_write(req, tcp as *mut uv_stream_t, &buf, 1, None), 0);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);

      let mut received = vec![0u8; DATA.len()];
      accepted.read_exact(&mut received).unwrap();
      assert_eq!(received, DATA);

      uv_close(tcp as *mut uv_handle_t, None);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      destroy_loop(loop_);
      free(req);
      free(tcp);
    }
  }

  #[test]
  fn test_tcp_open_failure_leaves_descriptor_open() {
    use std::os::fd::FromRawFd;
    use std::os::fd::IntoRawFd;
    unsafe {
      let loop_ = make_loop();
      let tcp = alloc::<uv_tcp_t>();
      uv_tcp_init(loop_, tcp);

      let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
      let addr = listener.local_addr().unwrap();
      let first = std::net::TcpStream::connect(addr).unwrap();
      let second = std::net::TcpStream::connect(addr).unwrap();
      let _accepted = (listener.accept().unwrap(), listener.accept().unwrap());

      assert_eq!(uv_tcp_open(tcp, first.into_raw_fd()), 0);
      let fd = second.into_raw_fd();
      assert_eq!(uv_tcp_open(tcp, fd), UV_EBUSY);
      assert!(libc::fcntl(fd, libc::F_GETFD) >= 0);
      let second = std::net::TcpStream::from_raw_fd(fd);
      assert!(second.peer_addr().is_ok());
      drop(second);

      uv_close(tcp as *mut uv_handle_t, None);
      uv_run(loop_, uv_run_mode::UV_RUN_DEFAULT);
      destroy_loop(loop_);
      free(tcp);
    }
  }
}
