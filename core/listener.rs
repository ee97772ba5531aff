// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::Cell;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;
use std::os::fd::BorrowedFd;
use std::os::fd::IntoRawFd;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::connection::ConnectionHandler;
use crate::connection::LibuvConnection;
use crate::error::ThreadError;
use crate::error::UvError;
use crate::stream_handle::UvStreamHandle;
use crate::tcp_handle::UvTcpHandle;
use crate::thread::LibuvThread;
use crate::thread::ThreadContext;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// A listening TCP socket. It lives on the first thread, which accepts every
/// connection and hands them round-robin to all threads.
#[derive(Debug)]
pub struct Listener {
  id: u64,
  endpoint: SocketAddr,
  thread: LibuvThread,
}

impl Listener {
  /// Bind `endpoint` and start accepting. Port 0 binds an ephemeral port;
  /// [`Listener::endpoint`] reports the one chosen.
  pub async fn start(
    endpoint: SocketAddr,
    threads: Vec<LibuvThread>,
    handler: Arc<dyn ConnectionHandler>,
  ) -> Result<Self, ThreadError> {
    let Some(primary) = threads.first().cloned() else {
      return Err(ThreadError::NoThreads);
    };
    let id = NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed);
    let backlog = primary.options().listen_backlog;
    let bound = primary
      .post_async(move |context| {
        listen(context, id, endpoint, backlog, threads, handler)
      })
      .await??;
    log::info!(target: "uv_transport", "Listening on {bound}");
    Ok(Self {
      id,
      endpoint: bound,
      thread: primary,
    })
  }

  pub fn endpoint(&self) -> SocketAddr {
    self.endpoint
  }

  /// Close the listening socket. Accepted connections stay open.
  pub async fn dispose(&self) -> Result<(), ThreadError> {
    let id = self.id;
    self
      .thread
      .post_async(move |context| {
        if let Some(handle) = context.remove_listener(id) {
          handle.close();
        }
      })
      .await
  }
}

fn listen(
  context: &ThreadContext,
  id: u64,
  endpoint: SocketAddr,
  backlog: i32,
  threads: Vec<LibuvThread>,
  handler: Arc<dyn ConnectionHandler>,
) -> Result<SocketAddr, UvError> {
  let handle = UvTcpHandle::init(context.loop_handle())?;
  handle.bind_endpoint(endpoint)?;
  let bound = handle.sock_endpoint()?;
  let context_weak = context.weak();
  let next = Cell::new(0usize);
  handle.listen(backlog, move |server, status| {
    let Some(context) = context_weak.upgrade() else {
      return;
    };
    if let Err(err) = status {
      log::error!(target: "uv_transport", "Listener failed to accept: {err}");
      return;
    }
    let index = next.get() % threads.len();
    next.set(next.get().wrapping_add(1));
    if let Err(err) = accept(&context, server, &threads[index], index, &handler)
    {
      log::error!(
        target: "uv_transport",
        "Failed to dispatch connection to {}: {err}",
        threads[index].name()
      );
    }
  })?;
  context.add_listener(id, handle);
  Ok(bound)
}

fn accept(
  context: &ThreadContext,
  server: &UvStreamHandle,
  target: &LibuvThread,
  index: usize,
  handler: &Arc<dyn ConnectionHandler>,
) -> Result<(), ThreadError> {
  let client = UvTcpHandle::init(context.loop_handle())?;
  server.accept(&client)?;
  if index == 0 {
    LibuvConnection::start(context, client, handler.clone());
    return Ok(());
  }

  // The accepted handle belongs to this loop; the target loop adopts a
  // duplicate of its socket.
  let fd = client.fileno()?;
  // SAFETY: `fd` stays open until `client` is closed below.
  let duplicate = unsafe { BorrowedFd::borrow_raw(fd) }.try_clone_to_owned();
  client.close();
  let duplicate = duplicate.map_err(|err| {
    let errno = err.raw_os_error().unwrap_or(libc::EBADF);
    context.loop_handle().functions().error(-errno)
  })?;
  let handler = handler.clone();
  target.post(move |context| adopt(context, duplicate, handler))
}

fn adopt(
  context: &ThreadContext,
  sock: OwnedFd,
  handler: Arc<dyn ConnectionHandler>,
) {
  let client = match UvTcpHandle::init(context.loop_handle()) {
    Ok(client) => client,
    Err(err) => {
      log::error!(target: "uv_transport", "Failed to adopt connection: {err}");
      return;
    }
  };
  if let Err(err) = client.open(sock.as_raw_fd()) {
    log::error!(target: "uv_transport", "Failed to adopt connection: {err}");
    client.close();
    return;
  }
  // The handle owns the descriptor now.
  let _ = sock.into_raw_fd();
  LibuvConnection::start(context, client, handler);
}
