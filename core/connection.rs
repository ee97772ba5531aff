// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::Cell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use bytes::Bytes;

use crate::error::UvError;
use crate::shutdown_req::UvShutdownReq;
use crate::stream_handle::ReadStatus;
use crate::tcp_handle::UvTcpHandle;
use crate::thread::ThreadContext;
use crate::uv;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Application callbacks for accepted connections. They run on the loop
/// thread that owns the connection.
pub trait ConnectionHandler: Send + Sync + 'static {
  fn on_connection(&self, _connection: &LibuvConnection) {}

  fn on_read(&self, connection: &LibuvConnection, data: &[u8]);

  /// The peer finished sending.
  fn on_read_fin(&self, _connection: &LibuvConnection) {}

  /// The connection failed and is being closed.
  fn on_error(&self, _connection: &LibuvConnection, _error: &UvError) {}
}

/// One accepted TCP connection on a loop thread.
pub struct LibuvConnection {
  id: u64,
  this: Weak<LibuvConnection>,
  context: Weak<ThreadContext>,
  socket: UvTcpHandle,
  handler: Arc<dyn ConnectionHandler>,
  remote: Option<SocketAddr>,
  local: Option<SocketAddr>,
  pending_write_bytes: Cell<usize>,
  max_write_bytes: Option<usize>,
  paused: Cell<bool>,
  backpressure: Cell<bool>,
  read_fin: Cell<bool>,
  write_fin: Cell<bool>,
  shutdown_requested: Cell<bool>,
  closed: Cell<bool>,
}

impl LibuvConnection {
  /// Take over `socket`, register with the loop context and start reading.
  pub fn start(
    context: &ThreadContext,
    socket: UvTcpHandle,
    handler: Arc<dyn ConnectionHandler>,
  ) -> Rc<Self> {
    let options = context.options();
    if let Err(err) = socket.no_delay(options.no_delay) {
      log::debug!(target: "uv_transport", "Failed to set TCP_NODELAY: {err}");
    }
    socket.set_max_read_size(options.max_read_buffer_size);

    let connection = Rc::new_cyclic(|this: &Weak<Self>| Self {
      id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
      this: this.clone(),
      context: context.weak(),
      remote: socket.peer_endpoint().ok(),
      local: socket.sock_endpoint().ok(),
      socket,
      handler,
      pending_write_bytes: Cell::new(0),
      max_write_bytes: options.max_write_buffer_size,
      paused: Cell::new(false),
      backpressure: Cell::new(false),
      read_fin: Cell::new(false),
      write_fin: Cell::new(false),
      shutdown_requested: Cell::new(false),
      closed: Cell::new(false),
    });

    connection.socket.set_on_close({
      let this = connection.this.clone();
      let context = connection.context.clone();
      move || {
        if let Some(this) = this.upgrade() {
          this.closed.set(true);
          if let Some(context) = context.upgrade() {
            context.trace().connection_stop(this.id);
            context.remove_connection(this.id);
          }
        }
      }
    });
    context.add_connection(connection.clone());
    context.trace().connection_start(connection.id);

    connection.handler.on_connection(&connection);
    if !connection.closed.get() {
      connection.start_reading();
    }
    connection
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn remote_endpoint(&self) -> Option<SocketAddr> {
    self.remote
  }

  pub fn local_endpoint(&self) -> Option<SocketAddr> {
    self.local
  }

  pub fn socket(&self) -> &UvTcpHandle {
    &self.socket
  }

  pub fn is_closed(&self) -> bool {
    self.closed.get() || self.socket.is_closed()
  }

  pub fn is_reading(&self) -> bool {
    self.socket.is_reading()
  }

  /// Bytes handed to `write` whose completion has not been seen yet.
  pub fn pending_write_bytes(&self) -> usize {
    self.pending_write_bytes.get()
  }

  /// Queue `data` for sending. Reading pauses while more than
  /// `max_write_buffer_size` bytes are in flight.
  pub fn write(&self, data: Bytes) -> Result<(), UvError> {
    let functions = self.socket.functions();
    if self.is_closed() || self.shutdown_requested.get() {
      return Err(functions.error(uv::UV_EPIPE));
    }
    if data.is_empty() {
      return Ok(());
    }
    let Some(context) = self.context.upgrade() else {
      return Err(functions.error(uv::UV_ECANCELED));
    };

    let len = data.len();
    let req = context.write_pool().allocate();
    context.trace().connection_write(self.id, len);
    self.pending_write_bytes.set(self.pending_write_bytes.get() + len);
    let submitted = req.write(&self.socket, [data], {
      let id = self.id;
      let this = self.this.clone();
      let context = self.context.clone();
      let req = req.clone();
      move |_, result| {
        if let Some(context) = context.upgrade() {
          let status = result.as_ref().map_or_else(|err| err.code(), |()| 0);
          context.trace().connection_write_callback(id, status);
          context.write_pool().give_back(req);
        }
        if let Some(this) = this.upgrade() {
          this.on_write_complete(len, result);
        }
      }
    });
    if let Err(err) = submitted {
      self
        .pending_write_bytes
        .set(self.pending_write_bytes.get() - len);
      context.write_pool().give_back(req);
      return Err(err);
    }

    if let Some(max) = self.max_write_bytes
      && self.pending_write_bytes.get() > max
      && !self.backpressure.get()
    {
      self.backpressure.set(true);
      context.trace().connection_pause(self.id);
      self.stop_reading();
    }
    Ok(())
  }

  /// Send FIN once queued writes have flushed. The connection closes when
  /// both directions are finished.
  pub fn shutdown(&self) -> Result<(), UvError> {
    if self.shutdown_requested.get() || self.is_closed() {
      return Ok(());
    }
    let Some(context) = self.context.upgrade() else {
      return Err(self.socket.functions().error(uv::UV_ECANCELED));
    };
    self.shutdown_requested.set(true);
    context.trace().connection_write_fin(self.id);
    let req = UvShutdownReq::init(context.loop_handle());
    let this = self.this.clone();
    let submitted = req.shutdown(&self.socket, move |_, result| {
      if let Some(this) = this.upgrade() {
        match result {
          Ok(()) => {
            this.write_fin.set(true);
            this.close_if_finished();
          }
          Err(err) => this.fail(err),
        }
      }
    });
    if let Err(err) = submitted {
      self.fail(err.clone());
      return Err(err);
    }
    Ok(())
  }

  /// Stop delivering reads until [`LibuvConnection::resume`].
  pub fn pause(&self) {
    if self.paused.replace(true) {
      return;
    }
    if let Some(context) = self.context.upgrade() {
      context.trace().connection_pause(self.id);
    }
    self.stop_reading();
  }

  pub fn resume(&self) {
    if !self.paused.replace(false) {
      return;
    }
    if let Some(context) = self.context.upgrade() {
      context.trace().connection_resume(self.id);
    }
    self.start_reading();
  }

  pub fn close(&self) {
    if self.closed.replace(true) {
      return;
    }
    self.socket.close();
  }

  fn can_read(&self) -> bool {
    !self.paused.get()
      && !self.backpressure.get()
      && !self.read_fin.get()
      && !self.is_closed()
  }

  fn start_reading(&self) {
    if !self.can_read() || self.socket.is_reading() {
      return;
    }
    let this = self.this.clone();
    let started = self.socket.read_start(move |_, status| {
      if let Some(this) = this.upgrade() {
        this.on_read(status);
      }
    });
    if let Err(err) = started {
      self.fail(err);
    }
  }

  fn stop_reading(&self) {
    if !self.socket.is_reading() || self.socket.is_closed() {
      return;
    }
    if let Err(err) = self.socket.read_stop() {
      self.fail(err);
    }
  }

  fn on_read(&self, status: Result<ReadStatus, UvError>) {
    let context = self.context.upgrade();
    match status {
      Ok(ReadStatus::Data(data)) => {
        if let Some(context) = &context {
          context.trace().connection_read(self.id, data.len());
        }
        self.handler.on_read(self, &data);
      }
      Ok(ReadStatus::Eof) => {
        self.read_fin.set(true);
        if let Some(context) = &context {
          context.trace().connection_read_fin(self.id);
        }
        self.handler.on_read_fin(self);
        self.close_if_finished();
      }
      Err(err) => self.fail(err),
    }
  }

  fn on_write_complete(&self, len: usize, result: Result<(), UvError>) {
    self
      .pending_write_bytes
      .set(self.pending_write_bytes.get().saturating_sub(len));
    if let Err(err) = result {
      self.fail(err);
      return;
    }
    if self.backpressure.get()
      && self
        .max_write_bytes
        .is_none_or(|max| self.pending_write_bytes.get() <= max)
    {
      self.backpressure.set(false);
      if let Some(context) = self.context.upgrade() {
        context.trace().connection_resume(self.id);
      }
      self.start_reading();
    }
  }

  fn close_if_finished(&self) {
    if self.read_fin.get() && self.write_fin.get() {
      self.close();
    }
  }

  fn fail(&self, err: UvError) {
    if self.is_closed() {
      return;
    }
    if !err.is_canceled()
      && let Some(context) = self.context.upgrade()
    {
      if err.is_connection_reset() {
        context.trace().connection_reset(self.id);
      } else {
        context.trace().connection_error(self.id, &err);
      }
    }
    self.handler.on_error(self, &err);
    self.close();
  }
}

impl std::fmt::Debug for LibuvConnection {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LibuvConnection")
      .field("id", &self.id)
      .field("remote", &self.remote)
      .field("local", &self.local)
      .field("closed", &self.is_closed())
      .finish()
  }
}
