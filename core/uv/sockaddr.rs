// Copyright 2018-2025 the Deno authors. MIT license.

use std::ffi::CStr;
use std::ffi::c_char;
use std::ffi::c_int;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use std::net::SocketAddr;

use super::UV_EINVAL;

/// Decode an IPv4 or IPv6 `sockaddr`; other families yield `None`.
pub(crate) unsafe fn sockaddr_to_std(
  addr: *const libc::sockaddr,
) -> Option<SocketAddr> {
  if addr.is_null() {
    return None;
  }
  let len = match unsafe { (*addr).sa_family } as c_int {
    libc::AF_INET => std::mem::size_of::<libc::sockaddr_in>(),
    libc::AF_INET6 => std::mem::size_of::<libc::sockaddr_in6>(),
    _ => return None,
  };
  let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
  // SAFETY: a sockaddr of the matched family spans `len` readable bytes.
  unsafe {
    std::ptr::copy_nonoverlapping(
      addr as *const u8,
      &mut storage as *mut libc::sockaddr_storage as *mut u8,
      len,
    );
  }
  let decoded =
    unsafe { socket2::SockAddr::new(storage, len as libc::socklen_t) };
  decoded.as_socket()
}

pub(crate) unsafe fn std_to_sockaddr(
  addr: SocketAddr,
  out: *mut libc::sockaddr,
  len: *mut c_int,
) {
  match addr {
    SocketAddr::V4(v4) => {
      let sin = out as *mut libc::sockaddr_in;
      unsafe {
        write_sockaddr_in(sin, *v4.ip(), v4.port());
        if !len.is_null() {
          *len = std::mem::size_of::<libc::sockaddr_in>() as c_int;
        }
      }
    }
    SocketAddr::V6(v6) => {
      let sin6 = out as *mut libc::sockaddr_in6;
      unsafe {
        write_sockaddr_in6(sin6, *v6.ip(), v6.port(), v6.scope_id());
        (*sin6).sin6_flowinfo = v6.flowinfo().to_be();
        if !len.is_null() {
          *len = std::mem::size_of::<libc::sockaddr_in6>() as c_int;
        }
      }
    }
  }
}

unsafe fn write_sockaddr_in(
  sin: *mut libc::sockaddr_in,
  ip: Ipv4Addr,
  port: u16,
) {
  unsafe {
    std::ptr::write_bytes(sin, 0, 1);
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    {
      (*sin).sin_len = std::mem::size_of::<libc::sockaddr_in>() as u8;
    }
    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
    (*sin).sin_port = port.to_be();
    (*sin).sin_addr.s_addr = u32::from(ip).to_be();
  }
}

unsafe fn write_sockaddr_in6(
  sin6: *mut libc::sockaddr_in6,
  ip: Ipv6Addr,
  port: u16,
  scope_id: u32,
) {
  unsafe {
    std::ptr::write_bytes(sin6, 0, 1);
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    {
      (*sin6).sin6_len = std::mem::size_of::<libc::sockaddr_in6>() as u8;
    }
    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
    (*sin6).sin6_port = port.to_be();
    (*sin6).sin6_addr.s6_addr = ip.octets();
    (*sin6).sin6_scope_id = scope_id;
  }
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_ip4_addr(
  ip: *const c_char,
  port: c_int,
  addr: *mut libc::sockaddr_in,
) -> c_int {
  if ip.is_null() {
    return UV_EINVAL;
  }
  let c_str = unsafe { CStr::from_ptr(ip) };
  let Ok(s) = c_str.to_str() else {
    return UV_EINVAL;
  };
  let Ok(ip_addr) = s.parse::<Ipv4Addr>() else {
    return UV_EINVAL;
  };
  unsafe { write_sockaddr_in(addr, ip_addr, port as u16) };
  0
}

/// Accepts an optional `%<zone>` suffix, either numeric or an interface
/// name.
#[unsafe(no_mangle)]
pub unsafe extern "C" fn uv_ip6_addr(
  ip: *const c_char,
  port: c_int,
  addr: *mut libc::sockaddr_in6,
) -> c_int {
  if ip.is_null() {
    return UV_EINVAL;
  }
  let c_str = unsafe { CStr::from_ptr(ip) };
  let Ok(s) = c_str.to_str() else {
    return UV_EINVAL;
  };
  let (host, zone) = match s.split_once('%') {
    Some((host, zone)) => (host, Some(zone)),
    None => (s, None),
  };
  let Ok(ip_addr) = host.parse::<Ipv6Addr>() else {
    return UV_EINVAL;
  };
  let scope_id = match zone {
    None => 0,
    Some(zone) => match zone.parse::<u32>() {
      Ok(id) => id,
      Err(_) => match std::ffi::CString::new(zone) {
        Ok(name) => unsafe { libc::if_nametoindex(name.as_ptr()) },
        Err(_) => return UV_EINVAL,
      },
    },
  };
  unsafe { write_sockaddr_in6(addr, ip_addr, port as u16, scope_id) };
  0
}

#[cfg(test)]
mod tests {
  use super::*;
  use rstest::rstest;

  #[rstest]
  #[case(c"127.0.0.1", true)]
  #[case(c"0.0.0.0", true)]
  #[case(c"::1", false)]
  #[case(c"not-an-address", false)]
  #[case(c"256.1.1.1", false)]
  fn test_ip4_addr(#[case] input: &CStr, #[case] valid: bool) {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let rc = unsafe { uv_ip4_addr(input.as_ptr(), 8080, &mut addr) };
    if valid {
      assert_eq!(rc, 0);
      let std = unsafe {
        sockaddr_to_std(&addr as *const _ as *const libc::sockaddr)
      };
      assert_eq!(std.unwrap().port(), 8080);
    } else {
      assert_eq!(rc, UV_EINVAL);
    }
  }

  #[test]
  fn test_ip6_addr_with_numeric_scope() {
    let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let rc = unsafe { uv_ip6_addr(c"fe80::1%3".as_ptr(), 443, &mut addr) };
    assert_eq!(rc, 0);
    let std =
      unsafe { sockaddr_to_std(&addr as *const _ as *const libc::sockaddr) };
    match std.unwrap() {
      SocketAddr::V6(v6) => {
        assert_eq!(v6.scope_id(), 3);
        assert_eq!(v6.port(), 443);
      }
      other => panic!("unexpected {other}"),
    }
  }

  #[test]
  fn test_std_sockaddr_roundtrip_v6() {
    let addr: SocketAddr = "[::1]:9000".parse().unwrap();
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let mut len = 0;
    unsafe {
      std_to_sockaddr(
        addr,
        &mut storage as *mut _ as *mut libc::sockaddr,
        &mut len,
      );
    }
    assert_eq!(len as usize, std::mem::size_of::<libc::sockaddr_in6>());
    let back = unsafe {
      sockaddr_to_std(&storage as *const _ as *const libc::sockaddr)
    };
    assert_eq!(back, Some(addr));
  }
}
