// Copyright 2018-2025 the Deno authors. MIT license.

/// Default cap for buffered read and write bytes per connection.
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 1024 * 1024;
pub const DEFAULT_LISTEN_BACKLOG: i32 = 128;
const MAX_DEFAULT_THREADS: usize = 16;

/// Settings shared by the loop threads, listeners and connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibuvTransportOptions {
  /// Number of loop threads accepted connections are spread over.
  pub thread_count: usize,
  /// Set `TCP_NODELAY` on accepted connections.
  pub no_delay: bool,
  pub listen_backlog: i32,
  /// Largest chunk a single read may deliver. `None` leaves the size to
  /// libuv.
  pub max_read_buffer_size: Option<usize>,
  /// Reading pauses while more than this many written bytes are in flight.
  /// `None` disables the limit.
  pub max_write_buffer_size: Option<usize>,
}

impl LibuvTransportOptions {
  pub fn default_thread_count() -> usize {
    std::thread::available_parallelism()
      .map(|count| count.get())
      .unwrap_or(1)
      .clamp(1, MAX_DEFAULT_THREADS)
  }
}

impl Default for LibuvTransportOptions {
  fn default() -> Self {
    Self {
      thread_count: Self::default_thread_count(),
      no_delay: true,
      listen_backlog: DEFAULT_LISTEN_BACKLOG,
      max_read_buffer_size: Some(DEFAULT_MAX_BUFFER_SIZE),
      max_write_buffer_size: Some(DEFAULT_MAX_BUFFER_SIZE),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let options = LibuvTransportOptions::default();
    assert!((1..=16).contains(&options.thread_count));
    assert!(options.no_delay);
    assert_eq!(options.listen_backlog, 128);
    assert_eq!(options.max_write_buffer_size, Some(1024 * 1024));
  }
}
