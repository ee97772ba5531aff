// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::c_int;

use crate::uv;

/// A negative status returned by a libuv entry point, with the symbolic name
/// and description the library itself reports for it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Error {code} {name} {description}")]
pub struct UvError {
  code: c_int,
  name: String,
  description: String,
}

impl UvError {
  pub fn new(
    code: c_int,
    name: impl Into<String>,
    description: impl Into<String>,
  ) -> Self {
    Self {
      code,
      name: name.into(),
      description: description.into(),
    }
  }

  pub fn code(&self) -> c_int {
    self.code
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn is_canceled(&self) -> bool {
    self.code == uv::UV_ECANCELED
  }

  /// Errors that mean the peer went away rather than something failing
  /// locally.
  pub fn is_connection_reset(&self) -> bool {
    matches!(
      self.code,
      uv::UV_ECONNRESET | uv::UV_EPIPE | uv::UV_ENOTCONN | uv::UV_EINVAL
    )
  }
}

#[derive(Debug, thiserror::Error)]
pub enum UvLoadError {
  #[error("Failed to load libuv from {path}")]
  Library {
    path: String,
    #[source]
    source: libloading::Error,
  },
  #[error("Symbol {name} is missing from {path}")]
  MissingSymbol {
    name: &'static str,
    path: String,
    #[source]
    source: libloading::Error,
  },
}

#[derive(Debug, thiserror::Error)]
pub enum ThreadError {
  #[error("The libuv thread is not running")]
  Stopped,
  #[error("No libuv threads to run on")]
  NoThreads,
  #[error("Failed to spawn the libuv thread")]
  Spawn(#[from] std::io::Error),
  #[error(transparent)]
  Uv(#[from] UvError),
  #[error("Fatal error on the libuv thread: {0}")]
  Fatal(String),
  #[error(transparent)]
  Canceled(#[from] futures::channel::oneshot::Canceled),
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  #[test]
  fn test_display_carries_code_name_and_description() {
    let err = UvError::new(uv::UV_ECONNRESET, "ECONNRESET", "connection reset");
    assert_eq!(
      err.to_string(),
      format!("Error {} ECONNRESET connection reset", uv::UV_ECONNRESET)
    );
  }

  #[rstest]
  #[case(uv::UV_ECONNRESET, true)]
  #[case(uv::UV_EPIPE, true)]
  #[case(uv::UV_ENOTCONN, true)]
  #[case(uv::UV_EINVAL, true)]
  #[case(uv::UV_ETIMEDOUT, false)]
  #[case(uv::UV_ECANCELED, false)]
  fn test_connection_reset_classification(
    #[case] code: c_int,
    #[case] reset: bool,
  ) {
    assert_eq!(UvError::new(code, "", "").is_connection_reset(), reset);
  }
}
