// Copyright 2018-2025 the Deno authors. MIT license.
#![doc = include_str!("README.md")]
#![deny(clippy::unnecessary_wraps)]
#![cfg(unix)]

pub mod uv;

mod async_handle;
mod connect_req;
mod connection;
mod error;
mod functions;
mod handle;
mod listener;
mod loop_handle;
pub mod memory;
mod options;
mod pipe_handle;
mod request;
mod shutdown_req;
mod stream_handle;
mod tcp_handle;
mod thread;
mod timer_handle;
mod trace;
mod write_pool;
mod write_req;

// Re-exports
pub use bytes;
pub use futures;

pub use crate::async_handle::AsyncSender;
pub use crate::async_handle::UvAsyncHandle;
pub use crate::connect_req::UvConnectReq;
pub use crate::connection::ConnectionHandler;
pub use crate::connection::LibuvConnection;
pub use crate::error::ThreadError;
pub use crate::error::UvError;
pub use crate::error::UvLoadError;
pub use crate::functions::UvFunctions;
pub use crate::handle::HandleBase;
pub use crate::listener::Listener;
pub use crate::loop_handle::UvLoopHandle;
pub use crate::memory::UvMemory;
pub use crate::memory::UvOwner;
pub use crate::options::DEFAULT_LISTEN_BACKLOG;
pub use crate::options::DEFAULT_MAX_BUFFER_SIZE;
pub use crate::options::LibuvTransportOptions;
pub use crate::pipe_handle::UvPipeHandle;
pub use crate::shutdown_req::UvShutdownReq;
pub use crate::stream_handle::ReadStatus;
pub use crate::stream_handle::UvStreamHandle;
pub use crate::tcp_handle::UvTcpHandle;
pub use crate::thread::LibuvThread;
pub use crate::thread::ThreadContext;
pub use crate::timer_handle::UvTimerHandle;
pub use crate::trace::LibuvTrace;
pub use crate::write_pool::MAX_POOLED_WRITE_REQS;
pub use crate::write_pool::WriteReqPool;
pub use crate::write_req::INLINE_BUFFERS;
pub use crate::write_req::UvWriteReq;
