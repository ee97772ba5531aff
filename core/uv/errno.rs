// Copyright 2018-2025 the Deno authors. MIT license.

//! libuv-compatible error codes: negative errno values on unix, libuv's
//! fixed values on windows.

use std::ffi::c_char;
use std::ffi::c_int;

macro_rules! uv_errno {
  ($name:ident, $unix:expr, $win:expr) => {
    #[cfg(unix)]
    pub const $name: c_int = -($unix);
    #[cfg(windows)]
    pub const $name: c_int = $win;
  };
}

macro_rules! uv_errors {
  ($( $const:ident = $name:literal, $unix:expr, $win:expr, $msg:literal; )*) => {
    $( uv_errno!($const, $unix, $win); )*

    static ERROR_TABLE: &[(c_int, &str, &str)] = &[
      $( ($const, concat!($name, "\0"), concat!($msg, "\0")), )*
      (UV_EOF, "EOF\0", "end of file\0"),
    ];
  };
}

pub const UV_EOF: c_int = -4095;

uv_errors! {
  UV_EACCES = "EACCES", libc::EACCES, -4092, "permission denied";
  UV_EADDRINUSE = "EADDRINUSE", libc::EADDRINUSE, -4091, "address already in use";
  UV_EADDRNOTAVAIL = "EADDRNOTAVAIL", libc::EADDRNOTAVAIL, -4090, "address not available";
  UV_EAFNOSUPPORT = "EAFNOSUPPORT", libc::EAFNOSUPPORT, -4089, "address family not supported";
  UV_EAGAIN = "EAGAIN", libc::EAGAIN, -4088, "resource temporarily unavailable";
  UV_EALREADY = "EALREADY", libc::EALREADY, -4084, "connection already in progress";
  UV_EBADF = "EBADF", libc::EBADF, -4083, "bad file descriptor";
  UV_EBUSY = "EBUSY", libc::EBUSY, -4082, "resource busy or locked";
  UV_ECANCELED = "ECANCELED", libc::ECANCELED, -4081, "operation canceled";
  UV_ECONNABORTED = "ECONNABORTED", libc::ECONNABORTED, -4079, "software caused connection abort";
  UV_ECONNREFUSED = "ECONNREFUSED", libc::ECONNREFUSED, -4078, "connection refused";
  UV_ECONNRESET = "ECONNRESET", libc::ECONNRESET, -4077, "connection reset by peer";
  UV_EINVAL = "EINVAL", libc::EINVAL, -4071, "invalid argument";
  UV_EIO = "EIO", libc::EIO, -4070, "i/o error";
  UV_EISCONN = "EISCONN", libc::EISCONN, -4069, "socket is already connected";
  UV_EMFILE = "EMFILE", libc::EMFILE, -4066, "too many open files";
  UV_ENOBUFS = "ENOBUFS", libc::ENOBUFS, -4060, "no buffer space available";
  UV_ENOENT = "ENOENT", libc::ENOENT, -4058, "no such file or directory";
  UV_ENOMEM = "ENOMEM", libc::ENOMEM, -4057, "not enough memory";
  UV_ENOTCONN = "ENOTCONN", libc::ENOTCONN, -4053, "socket is not connected";
  UV_ENOTSOCK = "ENOTSOCK", libc::ENOTSOCK, -4050, "socket operation on non-socket";
  UV_ENOTSUP = "ENOTSUP", libc::ENOTSUP, -4049, "operation not supported on socket";
  UV_EPIPE = "EPIPE", libc::EPIPE, -4047, "broken pipe";
  UV_ETIMEDOUT = "ETIMEDOUT", libc::ETIMEDOUT, -4039, "connection timed out";
}

/// Translate an I/O error into the matching negative status code.
pub(crate) fn io_error_code(err: &std::io::Error) -> c_int {
  #[cfg(unix)]
  if let Some(errno) = err.raw_os_error() {
    return -errno;
  }
  use std::io::ErrorKind;
  match err.kind() {
    ErrorKind::ConnectionRefused => UV_ECONNREFUSED,
    ErrorKind::ConnectionReset => UV_ECONNRESET,
    ErrorKind::ConnectionAborted => UV_ECONNABORTED,
    ErrorKind::NotConnected => UV_ENOTCONN,
    ErrorKind::AddrInUse => UV_EADDRINUSE,
    ErrorKind::AddrNotAvailable => UV_EADDRNOTAVAIL,
    ErrorKind::BrokenPipe => UV_EPIPE,
    ErrorKind::WouldBlock => UV_EAGAIN,
    ErrorKind::InvalidInput => UV_EINVAL,
    ErrorKind::TimedOut => UV_ETIMEDOUT,
    ErrorKind::PermissionDenied => UV_EACCES,
    ErrorKind::NotFound => UV_ENOENT,
    ErrorKind::OutOfMemory => UV_ENOMEM,
    _ => UV_EIO,
  }
}

fn lookup(err: c_int) -> Option<&'static (c_int, &'static str, &'static str)> {
  ERROR_TABLE.iter().find(|(code, _, _)| *code == err)
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_err_name(err: c_int) -> *const c_char {
  match lookup(err) {
    Some((_, name, _)) => name.as_ptr() as *const c_char,
    None => c"UNKNOWN".as_ptr(),
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_strerror(err: c_int) -> *const c_char {
  match lookup(err) {
    Some((_, _, msg)) => msg.as_ptr() as *const c_char,
    None => c"unknown error".as_ptr(),
  }
}
