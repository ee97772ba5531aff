// Copyright 2018-2025 the Deno authors. MIT license.

//! A dedicated OS thread hosting one event loop.
//!
//! Other threads hand work to the loop with [`LibuvThread::post`]. Work is
//! queued under a lock and the loop is woken through an async handle; the
//! async callback drains the whole queue, since wakeups coalesce.

use std::any::Any;
use std::cell::OnceCell;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::rc::Rc;
use std::rc::Weak;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use futures::channel::oneshot;
use parking_lot::Condvar;
use parking_lot::Mutex;

use crate::async_handle::AsyncSender;
use crate::async_handle::UvAsyncHandle;
use crate::connection::LibuvConnection;
use crate::error::ThreadError;
use crate::error::UvError;
use crate::functions::UvFunctions;
use crate::loop_handle::UvLoopHandle;
use crate::memory;
use crate::options::LibuvTransportOptions;
use crate::tcp_handle::UvTcpHandle;
use crate::trace::LibuvTrace;
use crate::uv::uv_handle_t;
use crate::uv::uv_run_mode;
use crate::write_pool::WriteReqPool;

type Work = Box<dyn FnOnce(&ThreadContext) + Send>;

#[derive(Default)]
struct WorkQueue {
  items: Vec<Work>,
  closed: bool,
}

struct Shared {
  name: String,
  queue: Mutex<WorkQueue>,
  waker: Mutex<Option<AsyncSender>>,
  fatal: Mutex<Option<String>>,
  exited: Mutex<bool>,
  exited_cv: Condvar,
}

impl Shared {
  fn record_fatal(&self, message: String) {
    log::error!(
      target: "uv_transport",
      "Fatal error on libuv thread {}: {message}",
      self.name
    );
    let mut fatal = self.fatal.lock();
    if fatal.is_none() {
      *fatal = Some(message);
    }
  }

  /// Refuse further work and hand back whatever was still queued.
  fn close_queue(&self) -> Vec<Work> {
    self.waker.lock().take();
    let mut queue = self.queue.lock();
    queue.closed = true;
    std::mem::take(&mut queue.items)
  }

  fn mark_exited(&self) {
    *self.exited.lock() = true;
    self.exited_cv.notify_all();
  }

  fn wait_exited(&self, timeout: Duration) -> bool {
    let mut exited = self.exited.lock();
    if !*exited {
      self
        .exited_cv
        .wait_while_for(&mut exited, |exited| !*exited, timeout);
    }
    *exited
  }
}

struct ThreadInner {
  shared: Arc<Shared>,
  functions: Arc<UvFunctions>,
  options: Arc<LibuvTransportOptions>,
  join: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to a running loop thread. Clones refer to the same thread.
#[derive(Clone)]
pub struct LibuvThread {
  inner: Arc<ThreadInner>,
}

impl LibuvThread {
  /// Spawn the thread and wait until its loop is up. Loop initialization
  /// failures are returned here.
  pub fn start(
    name: impl Into<String>,
    functions: Arc<UvFunctions>,
    options: Arc<LibuvTransportOptions>,
  ) -> Result<Self, ThreadError> {
    let name = name.into();
    let shared = Arc::new(Shared {
      name: name.clone(),
      queue: Mutex::new(WorkQueue::default()),
      waker: Mutex::new(None),
      fatal: Mutex::new(None),
      exited: Mutex::new(false),
      exited_cv: Condvar::new(),
    });
    let (ready_tx, ready_rx) = mpsc::channel();
    let join = std::thread::Builder::new().name(name.clone()).spawn({
      let shared = shared.clone();
      let functions = functions.clone();
      let options = options.clone();
      move || thread_main(shared, functions, options, ready_tx)
    })?;

    match ready_rx.recv() {
      Ok(Ok(())) => {}
      Ok(Err(err)) => {
        let _ = join.join();
        return Err(err.into());
      }
      Err(mpsc::RecvError) => {
        let _ = join.join();
        return Err(
          shared
            .fatal
            .lock()
            .clone()
            .map(ThreadError::Fatal)
            .unwrap_or(ThreadError::Stopped),
        );
      }
    }
    log::debug!(target: "uv_transport", "Started libuv thread {name}");

    Ok(Self {
      inner: Arc::new(ThreadInner {
        shared,
        functions,
        options,
        join: Mutex::new(Some(join)),
      }),
    })
  }

  pub fn name(&self) -> &str {
    &self.inner.shared.name
  }

  pub fn functions(&self) -> &Arc<UvFunctions> {
    &self.inner.functions
  }

  pub fn options(&self) -> &Arc<LibuvTransportOptions> {
    &self.inner.options
  }

  pub fn is_running(&self) -> bool {
    !*self.inner.shared.exited.lock()
  }

  /// The first panic or loop failure seen on the thread, if any.
  pub fn fatal_error(&self) -> Option<String> {
    self.inner.shared.fatal.lock().clone()
  }

  /// Queue `work` to run on the loop thread. Fails once the thread is
  /// stopping.
  pub fn post(
    &self,
    work: impl FnOnce(&ThreadContext) + Send + 'static,
  ) -> Result<(), ThreadError> {
    let shared = &self.inner.shared;
    {
      let mut queue = shared.queue.lock();
      if queue.closed {
        return Err(ThreadError::Stopped);
      }
      queue.items.push(Box::new(work));
    }
    let waker = shared.waker.lock().clone();
    match waker {
      Some(waker) => waker.send().map_err(|_| ThreadError::Stopped),
      None => Err(ThreadError::Stopped),
    }
  }

  /// Like [`LibuvThread::post`], resolving to the value `work` returns.
  /// Work dropped without running resolves to [`ThreadError::Canceled`].
  pub fn post_async<R, F>(
    &self,
    work: F,
  ) -> impl Future<Output = Result<R, ThreadError>> + Send + use<R, F>
  where
    R: Send + 'static,
    F: FnOnce(&ThreadContext) -> R + Send + 'static,
  {
    let (tx, rx) = oneshot::channel();
    let posted = self.post(move |context| {
      let _ = tx.send(work(context));
    });
    async move {
      posted?;
      Ok(rx.await?)
    }
  }

  /// Stop the loop, escalating each time the thread has not exited within
  /// `timeout`: first let the loop run dry, then dispose every handle, then
  /// stop the loop outright. Must not be called from the loop thread.
  pub fn stop(&self, timeout: Duration) -> Result<(), ThreadError> {
    let shared = &self.inner.shared;
    let steps: [fn(&ThreadContext); 3] = [
      ThreadContext::allow_stop,
      ThreadContext::dispose_handles,
      ThreadContext::stop_loop,
    ];
    let mut exited = shared.wait_exited(Duration::ZERO);
    for step in steps {
      if exited {
        break;
      }
      let _ = self.post(step);
      exited = shared.wait_exited(timeout);
    }
    if !exited {
      return Err(ThreadError::Fatal(format!(
        "libuv thread {} did not stop within {timeout:?}",
        shared.name
      )));
    }

    let join = self.inner.join.lock().take();
    if let Some(join) = join
      && join.join().is_err()
    {
      return Err(ThreadError::Fatal(format!(
        "libuv thread {} panicked",
        shared.name
      )));
    }
    log::debug!(target: "uv_transport", "Stopped libuv thread {}", shared.name);
    match self.fatal_error() {
      Some(message) => Err(ThreadError::Fatal(message)),
      None => Ok(()),
    }
  }
}

impl std::fmt::Debug for LibuvThread {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("LibuvThread")
      .field("name", &self.name())
      .field("running", &self.is_running())
      .finish()
  }
}

/// Loop-thread state handed to posted work.
pub struct ThreadContext {
  this: Weak<ThreadContext>,
  loop_: UvLoopHandle,
  post: Rc<UvAsyncHandle>,
  write_pool: WriteReqPool,
  trace: LibuvTrace,
  options: Arc<LibuvTransportOptions>,
  connections: RefCell<HashMap<u64, Rc<LibuvConnection>>>,
  listeners: RefCell<HashMap<u64, UvTcpHandle>>,
}

impl ThreadContext {
  pub fn loop_handle(&self) -> &UvLoopHandle {
    &self.loop_
  }

  pub fn write_pool(&self) -> &WriteReqPool {
    &self.write_pool
  }

  pub fn trace(&self) -> &LibuvTrace {
    &self.trace
  }

  pub fn options(&self) -> &LibuvTransportOptions {
    &self.options
  }

  pub fn connection_count(&self) -> usize {
    self.connections.borrow().len()
  }

  pub fn connection(&self, id: u64) -> Option<Rc<LibuvConnection>> {
    self.connections.borrow().get(&id).cloned()
  }

  /// Visit every open handle on this loop.
  pub fn walk(&self, callback: impl FnMut(*mut uv_handle_t)) {
    self.loop_.walk(callback);
  }

  pub(crate) fn weak(&self) -> Weak<ThreadContext> {
    self.this.clone()
  }

  pub(crate) fn add_connection(&self, connection: Rc<LibuvConnection>) {
    self
      .connections
      .borrow_mut()
      .insert(connection.id(), connection);
  }

  pub(crate) fn remove_connection(&self, id: u64) {
    let removed = self.connections.borrow_mut().remove(&id);
    drop(removed);
  }

  pub(crate) fn add_listener(&self, id: u64, handle: UvTcpHandle) {
    self.listeners.borrow_mut().insert(id, handle);
  }

  pub(crate) fn remove_listener(&self, id: u64) -> Option<UvTcpHandle> {
    self.listeners.borrow_mut().remove(&id)
  }

  fn run_posted(&self, shared: &Shared) {
    let work = std::mem::take(&mut shared.queue.lock().items);
    let mut work = work.into_iter();
    for item in work.by_ref() {
      if let Err(panic) =
        std::panic::catch_unwind(AssertUnwindSafe(|| item(self)))
      {
        shared.record_fatal(panic_message(&*panic));
        self.loop_.stop();
        break;
      }
    }
    drop(work);
  }

  /// Let the loop exit once nothing but the post handle is alive.
  fn allow_stop(&self) {
    self.post.unreference();
  }

  fn dispose_handles(&self) {
    self.dispose_owners(false);
  }

  fn stop_loop(&self) {
    self.loop_.stop();
  }

  fn dispose_owners(&self, include_post: bool) {
    let post = self.post.memory().raw_ptr() as *mut uv_handle_t;
    let mut owners = Vec::new();
    self.loop_.walk(|handle| {
      if (include_post || handle != post)
        && let Some(owner) = unsafe { memory::owner_of(handle as *const _) }
      {
        owners.push(owner);
      }
    });
    for owner in owners {
      owner.dispose();
    }
  }

  /// Close everything still open on the loop after it has returned.
  fn teardown(&self) {
    let listeners: Vec<_> =
      self.listeners.borrow_mut().drain().map(|(_, l)| l).collect();
    for listener in &listeners {
      listener.close();
    }
    let connections: Vec<_> = self
      .connections
      .borrow_mut()
      .drain()
      .map(|(_, c)| c)
      .collect();
    for connection in &connections {
      connection.close();
    }
    self.dispose_owners(true);
    self.post.close();
    self.write_pool.dispose();
  }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
  if let Some(message) = panic.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}

fn thread_main(
  shared: Arc<Shared>,
  functions: Arc<UvFunctions>,
  options: Arc<LibuvTransportOptions>,
  ready: mpsc::Sender<Result<(), UvError>>,
) {
  let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
    run_thread(&shared, functions, options, ready)
  }));
  if let Err(panic) = result {
    shared.record_fatal(panic_message(&*panic));
  }
  drop(shared.close_queue());
  shared.mark_exited();
}

fn run_thread(
  shared: &Arc<Shared>,
  functions: Arc<UvFunctions>,
  options: Arc<LibuvTransportOptions>,
  ready: mpsc::Sender<Result<(), UvError>>,
) {
  let loop_ = match UvLoopHandle::init(functions) {
    Ok(loop_) => loop_,
    Err(err) => {
      let _ = ready.send(Err(err));
      return;
    }
  };
  let context_cell: Rc<OnceCell<Weak<ThreadContext>>> = Rc::new(OnceCell::new());
  let post = match UvAsyncHandle::init(&loop_, {
    let context_cell = context_cell.clone();
    let shared = shared.clone();
    move || {
      if let Some(context) = context_cell.get().and_then(Weak::upgrade) {
        context.run_posted(&shared);
      }
    }
  }) {
    Ok(post) => post,
    Err(err) => {
      let _ = ready.send(Err(err));
      return;
    }
  };
  let context = Rc::new_cyclic(|this: &Weak<ThreadContext>| ThreadContext {
    this: this.clone(),
    write_pool: WriteReqPool::new(&loop_),
    loop_: loop_.clone(),
    post,
    trace: LibuvTrace,
    options,
    connections: RefCell::new(HashMap::new()),
    listeners: RefCell::new(HashMap::new()),
  });
  let _ = context_cell.set(Rc::downgrade(&context));
  *shared.waker.lock() = Some(context.post.sender());
  let _ = ready.send(Ok(()));
  drop(ready);

  if let Err(err) = loop_.run(uv_run_mode::UV_RUN_DEFAULT) {
    shared.record_fatal(err.to_string());
  }

  drop(shared.close_queue());
  context.teardown();
  if let Err(err) = loop_.run(uv_run_mode::UV_RUN_DEFAULT) {
    shared.record_fatal(err.to_string());
  }
  drop(context);
  if let Err(err) = loop_.close() {
    shared.record_fatal(err.to_string());
  }
}
