// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Socket class dispatch.
//!
//! A class specializes the raw I/O of a socket variant — TCP, UDP, or
//! an embedder-defined layer that wraps another class and delegates
//! (TLS over TCP, test doubles). Blocking policy stays in the core:
//! class methods issue one non-blocking syscall and report `WouldBlock`
//! through the normal `io::Error` kind.

use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use crate::addr;

fn cvt(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// Capability table for a socket variant.
pub trait SocketClass: Send + Sync {
    /// SOCK_STREAM or SOCK_DGRAM; drives `open` and listen behavior.
    fn sock_type(&self) -> libc::c_int;

    /// Create the fd, non-blocking and close-on-exec.
    fn open(&self, family: libc::c_int) -> io::Result<RawFd> {
        let fd = unsafe {
            libc::socket(
                family,
                self.sock_type() | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(fd)
    }

    fn close(&self, fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn dup(&self, fd: RawFd) -> io::Result<RawFd> {
        let new_fd = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if new_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(new_fd)
    }

    fn read(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
        cvt(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
    }

    fn recvfrom(&self, fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n = cvt(unsafe {
            libc::recvfrom(
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        })?;
        Ok((n, addr::from_raw(&storage)))
    }

    fn write(&self, fd: RawFd, buf: &[u8]) -> io::Result<usize> {
        cvt(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
    }

    fn writev(&self, fd: RawFd, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        // IoSlice is ABI-compatible with iovec.
        cvt(unsafe {
            libc::writev(
                fd,
                bufs.as_ptr() as *const libc::iovec,
                bufs.len().min(libc::c_int::MAX as usize) as libc::c_int,
            )
        })
    }

    fn sendto(&self, fd: RawFd, buf: &[u8], dst: &SocketAddr) -> io::Result<usize> {
        let (storage, len) = addr::to_raw(dst);
        cvt(unsafe {
            libc::sendto(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        })
    }

    fn sendfile(
        &self,
        fd: RawFd,
        in_fd: RawFd,
        offset: &mut libc::off_t,
        count: usize,
    ) -> io::Result<usize> {
        cvt(unsafe { libc::sendfile(fd, in_fd, offset, count) })
    }
}

/// Stream sockets delegating straight to kernel syscalls.
pub struct TcpClass;

impl SocketClass for TcpClass {
    fn sock_type(&self) -> libc::c_int {
        libc::SOCK_STREAM
    }
}

/// Datagram sockets delegating straight to kernel syscalls.
pub struct UdpClass;

impl SocketClass for UdpClass {
    fn sock_type(&self) -> libc::c_int {
        libc::SOCK_DGRAM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fd_is_nonblocking(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        flags >= 0 && flags & libc::O_NONBLOCK != 0
    }

    #[test]
    fn tcp_open_is_nonblocking() {
        let class = TcpClass;
        let fd = class.open(libc::AF_INET).unwrap();
        assert!(fd_is_nonblocking(fd));
        class.close(fd);
    }

    #[test]
    fn udp_open_is_nonblocking() {
        let class = UdpClass;
        let fd = class.open(libc::AF_INET).unwrap();
        assert!(fd_is_nonblocking(fd));
        class.close(fd);
    }

    #[test]
    fn dup_produces_distinct_fd() {
        let class = TcpClass;
        let fd = class.open(libc::AF_INET).unwrap();
        let dup = class.dup(fd).unwrap();
        assert_ne!(fd, dup);
        class.close(dup);
        class.close(fd);
    }

    #[test]
    fn read_on_fresh_socket_would_block() {
        let class = UdpClass;
        let fd = class.open(libc::AF_INET).unwrap();
        // Unbound datagram socket: nothing to read, must not block.
        let mut buf = [0u8; 8];
        let err = class.read(fd, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        class.close(fd);
    }
}
