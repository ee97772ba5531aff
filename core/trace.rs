// Copyright 2018-2025 the Deno authors. MIT license.

use crate::error::UvError;

const TARGET: &str = "uv_transport";

/// Connection lifecycle events, logged under the `uv_transport` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct LibuvTrace;

impl LibuvTrace {
  pub fn connection_start(&self, id: u64) {
    log::debug!(target: TARGET, "Connection id \"{id}\" started.");
  }

  pub fn connection_stop(&self, id: u64) {
    log::debug!(target: TARGET, "Connection id \"{id}\" stopped.");
  }

  pub fn connection_read(&self, id: u64, count: usize) {
    log::trace!(target: TARGET, "Connection id \"{id}\" recv {count} bytes.");
  }

  pub fn connection_read_fin(&self, id: u64) {
    log::debug!(target: TARGET, "Connection id \"{id}\" received FIN.");
  }

  pub fn connection_write(&self, id: u64, count: usize) {
    log::trace!(target: TARGET, "Connection id \"{id}\" writing {count} bytes.");
  }

  pub fn connection_write_callback(&self, id: u64, status: i32) {
    log::trace!(
      target: TARGET,
      "Connection id \"{id}\" write callback status {status}."
    );
  }

  pub fn connection_write_fin(&self, id: u64) {
    log::debug!(target: TARGET, "Connection id \"{id}\" sending FIN.");
  }

  pub fn connection_error(&self, id: u64, error: &UvError) {
    log::error!(
      target: TARGET,
      "Connection id \"{id}\" communication error: {error}"
    );
  }

  pub fn connection_reset(&self, id: u64) {
    log::info!(target: TARGET, "Connection id \"{id}\" reset.");
  }

  pub fn connection_pause(&self, id: u64) {
    log::debug!(target: TARGET, "Connection id \"{id}\" paused.");
  }

  pub fn connection_resume(&self, id: u64) {
    log::debug!(target: TARGET, "Connection id \"{id}\" resumed.");
  }
}
