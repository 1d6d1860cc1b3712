// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Endpoint addresses and raw sockaddr conversions.
//!
//! Addresses are `std::net::SocketAddr`, tagged by family. Constructors
//! accept numeric notation only — no resolver on the hot path.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::{Error, Result};

/// Parse a numeric IPv4 address plus port.
pub fn addr4(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip: Ipv4Addr = ip.parse().map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a numeric IPv4 address: {ip:?}"),
        ))
    })?;
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Parse a numeric IPv6 address plus port.
pub fn addr6(ip: &str, port: u16) -> Result<SocketAddr> {
    let ip: Ipv6Addr = ip.parse().map_err(|_| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("not a numeric IPv6 address: {ip:?}"),
        ))
    })?;
    Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
}

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub(crate) fn to_raw(self) -> libc::c_int {
        match self {
            Family::V4 => libc::AF_INET,
            Family::V6 => libc::AF_INET6,
        }
    }
}

/// Encode a `SocketAddr` into sockaddr_storage for the kernel.
pub(crate) fn to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from(*v4.ip()).to_be(),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in) = sin;
            }
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: v6.ip().octets(),
                },
                sin6_scope_id: v6.scope_id(),
            };
            unsafe {
                *(&mut storage as *mut _ as *mut libc::sockaddr_in6) = sin6;
            }
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
    }
}

/// Decode a kernel-filled sockaddr_storage. Unknown families decode to
/// the unspecified IPv4 address.
pub(crate) fn from_raw(storage: &libc::sockaddr_storage) -> SocketAddr {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            ))
        }
        _ => SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v4() {
        let addr = addr4("127.0.0.1", 8080).unwrap();
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn parse_v6() {
        let addr = addr6("::1", 443).unwrap();
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 443);
    }

    #[test]
    fn reject_hostnames() {
        assert!(addr4("localhost", 80).is_err());
        assert!(addr6("example.com", 80).is_err());
    }

    #[test]
    fn raw_round_trip_v4() {
        let addr = addr4("192.0.2.7", 42422).unwrap();
        let (storage, _) = to_raw(&addr);
        assert_eq!(from_raw(&storage), addr);
    }

    #[test]
    fn raw_round_trip_v6() {
        let addr = addr6("2001:db8::1", 7).unwrap();
        let (storage, _) = to_raw(&addr);
        assert_eq!(from_raw(&storage), addr);
    }
}
