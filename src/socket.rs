// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative socket I/O.
//!
//! Every blocking operation follows the same suspension protocol: issue
//! the syscall non-blockingly; on `WouldBlock` park the task on the
//! socket's fd with the needed interest (arming a deadline when a
//! timeout is pending); on resume branch on the wake cause — ready
//! means retry, timeout and cancelled unwind. A retry counter caps how
//! many ready-wakes one logical operation may consume without a byte of
//! progress before it yields to the run-queue tail, so a hot socket
//! cannot starve its peers.

pub mod class;

use std::io::{self, IoSlice};
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use tracing::trace;

use crate::addr::{self, Family};
use crate::error::{Error, Result};
use crate::poller::Interest;
use crate::scheduler::{IoWait, Scheduler};
use crate::socket::class::{SocketClass, TcpClass, UdpClass};
use crate::task::WaitCell;
use crate::timer::deadline_after;
use crate::Buffer;

/// Ready-wake retries one logical operation may burn without progress
/// before yielding.
pub const MAX_IO_CALLS: u32 = 10;

/// Read granularity for the buffer-appending operations.
const READB_CHUNK: usize = 4096;

/// A non-blocking fd bound to one scheduler for life.
pub struct Socket {
    fd: RawFd,
    sched: Scheduler,
    cell: Arc<WaitCell>,
    class: Arc<dyn SocketClass>,
    io_calls: u32,
    /// One-shot timeout in ms, consumed by the next blocking op.
    timeout_ms: Option<u64>,
    /// Listener fd this socket was accepted from. Accounting only.
    parent: Option<RawFd>,
    closed: bool,
}

impl Socket {
    /// Open a socket of the given class and family on `sched`.
    pub fn with_class(
        sched: &Scheduler,
        class: Arc<dyn SocketClass>,
        family: Family,
    ) -> Result<Self> {
        let fd = class.open(family.to_raw())?;
        trace!(fd, "socket opened");
        Ok(Self::from_fd(sched, class, fd, None))
    }

    pub fn tcp(sched: &Scheduler) -> Result<Self> {
        Self::with_class(sched, Arc::new(TcpClass), Family::V4)
    }

    pub fn tcp6(sched: &Scheduler) -> Result<Self> {
        Self::with_class(sched, Arc::new(TcpClass), Family::V6)
    }

    pub fn udp(sched: &Scheduler) -> Result<Self> {
        Self::with_class(sched, Arc::new(UdpClass), Family::V4)
    }

    pub fn udp6(sched: &Scheduler) -> Result<Self> {
        Self::with_class(sched, Arc::new(UdpClass), Family::V6)
    }

    fn from_fd(
        sched: &Scheduler,
        class: Arc<dyn SocketClass>,
        fd: RawFd,
        parent: Option<RawFd>,
    ) -> Self {
        Self {
            fd,
            sched: sched.clone(),
            cell: WaitCell::new(),
            class,
            io_calls: 0,
            timeout_ms: None,
            parent,
            closed: false,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Listener this socket was accepted from, if any.
    pub fn parent(&self) -> Option<RawFd> {
        self.parent
    }

    /// Duplicate the fd onto `dest` (which may be another scheduler).
    /// The duplicate carries no parent, timeout, or pending wait.
    pub fn dup(&self, dest: &Scheduler) -> Result<Socket> {
        let fd = self.class.dup(self.fd)?;
        Ok(Self::from_fd(dest, self.class.clone(), fd, None))
    }

    /// Arm a timeout for the next blocking operation. `0` disables.
    pub fn set_timeout(&mut self, ms: u64) {
        self.timeout_ms = if ms == 0 { None } else { Some(ms) };
    }

    /// Unregister from the poller and timers, then release the fd.
    /// Idempotent; also runs on drop.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let core = self.sched.core();
        if let Some(entry) = core.poller.remove(self.fd) {
            if let Some(key) = entry.timer {
                core.timers.lock().unwrap().cancel(key);
            }
        }
        trace!(fd = self.fd, "socket closed");
        self.class.close(self.fd);
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(self.fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        Ok(addr::from_raw(&storage))
    }

    /// Bind to `addr`; stream sockets also start listening with
    /// `backlog`. Never blocks.
    pub fn bind(&mut self, addr: &SocketAddr, backlog: i32) -> Result<()> {
        let one: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let (storage, len) = addr::to_raw(addr);
        let ret =
            unsafe { libc::bind(self.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if self.class.sock_type() == libc::SOCK_STREAM {
            let ret = unsafe { libc::listen(self.fd, backlog) };
            if ret < 0 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
        }
        Ok(())
    }

    /// Connect to `addr`, parking on writability until the handshake
    /// resolves. A refused connection surfaces with its errno class.
    pub async fn connect(&mut self, addr: &SocketAddr) -> Result<()> {
        let deadline = self.take_deadline();
        let (storage, len) = addr::to_raw(addr);
        let ret =
            unsafe { libc::connect(self.fd, &storage as *const _ as *const libc::sockaddr, len) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(Error::Io(err));
        }

        self.wait_io(Interest::Out, deadline).await?;

        let mut so_error: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut so_error as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(Error::Io(io::Error::last_os_error()));
        }
        if so_error != 0 {
            return Err(Error::Io(io::Error::from_raw_os_error(so_error)));
        }
        Ok(())
    }

    /// Accept one connection. The new socket lives on the same
    /// scheduler and records this listener as its parent.
    pub async fn accept(&mut self) -> Result<(Socket, SocketAddr)> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    self.fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd >= 0 {
                let sock = Self::from_fd(&self.sched, self.class.clone(), fd, Some(self.fd));
                return Ok((sock, addr::from_raw(&storage)));
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::In, deadline).await?;
                    self.after_ready().await?;
                }
                io::ErrorKind::Interrupted => {}
                _ => return Err(Error::Io(err)),
            }
        }
    }

    /// Read up to `buf.len()` bytes. `Ok(0)` means the peer closed.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        loop {
            match self.class.read(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::In, deadline).await?;
                    self.after_ready().await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Datagram receive with the sender's address.
    pub async fn recvfrom(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        loop {
            match self.class.recvfrom(self.fd, buf) {
                Ok(res) => return Ok(res),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::In, deadline).await?;
                    self.after_ready().await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Write once; may be short. A broken pipe surfaces with its errno
    /// class.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        loop {
            match self.class.write(self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::Out, deadline).await?;
                    self.after_ready().await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Datagram send to `dst`.
    pub async fn sendto(&mut self, buf: &[u8], dst: &SocketAddr) -> Result<usize> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        loop {
            match self.class.sendto(self.fd, buf, dst) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::Out, deadline).await?;
                    self.after_ready().await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Write an ordered sequence of buffers, re-parking on short writes
    /// until every byte is drained. Returns the total written.
    pub async fn writev(&mut self, bufs: &[&Buffer]) -> Result<usize> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let mut written = 0;
        while written < total {
            let mut slices = Vec::with_capacity(bufs.len());
            let mut skip = written;
            for buf in bufs {
                let data = buf.as_slice();
                if skip >= data.len() {
                    skip -= data.len();
                    continue;
                }
                slices.push(IoSlice::new(&data[skip..]));
                skip = 0;
            }
            match self.class.writev(self.fd, &slices) {
                Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    written += n;
                    self.io_calls = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::Out, deadline).await?;
                    self.after_ready().await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(total)
    }

    /// Write the whole buffer, re-parking on short writes.
    pub async fn writeb(&mut self, buf: &Buffer) -> Result<usize> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        let data = buf.as_slice();
        let mut written = 0;
        while written < data.len() {
            match self.class.write(self.fd, &data[written..]) {
                Ok(0) => return Err(Error::Io(io::ErrorKind::WriteZero.into())),
                Ok(n) => {
                    written += n;
                    self.io_calls = 0;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::Out, deadline).await?;
                    self.after_ready().await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(written)
    }

    /// Read into `buf`, growing it by its policy. Returns bytes
    /// appended; `Ok(0)` means the peer closed.
    pub async fn readb(&mut self, buf: &mut Buffer) -> Result<usize> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        self.readb_capped(buf, READB_CHUNK, deadline).await
    }

    /// One readb round with the read size capped (shared by `readline`
    /// and `expect`, which must not overshoot their limits by much).
    async fn readb_capped(
        &mut self,
        buf: &mut Buffer,
        cap: usize,
        deadline: Option<u64>,
    ) -> Result<usize> {
        let class = self.class.clone();
        let fd = self.fd;
        loop {
            let res = buf.append_with(cap, |spare| {
                let want = cap.min(spare.len());
                class.read(fd, &mut spare[..want]).map_err(Error::Io)
            });
            match res {
                Ok(n) => return Ok(n),
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::In, deadline).await?;
                    self.after_ready().await?;
                }
                Err(Error::Io(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Accumulate into `buf` until `delim` appears, scanning only the
    /// bytes each round adds. Returns the line length including the
    /// delimiter, or `0` on EOF. Fails with `Overflow` once `buf` holds
    /// `max` bytes with no delimiter.
    pub async fn readline(&mut self, buf: &mut Buffer, delim: &[u8], max: usize) -> Result<usize> {
        assert!(!delim.is_empty(), "empty delimiter");
        let deadline = self.take_deadline();
        self.io_calls = 0;
        let mut scanned: usize = 0;
        loop {
            // Re-scan the tail overlap in case the delimiter straddles
            // two reads.
            let from = scanned.saturating_sub(delim.len() - 1);
            if let Some(pos) = find(&buf.as_slice()[from..], delim) {
                return Ok(from + pos + delim.len());
            }
            scanned = buf.len();
            if buf.len() >= max {
                return Err(Error::Overflow { max });
            }
            let cap = (max - buf.len()).min(READB_CHUNK);
            let n = self.readb_capped(buf, cap, deadline).await?;
            if n == 0 {
                return Ok(0);
            }
        }
    }

    /// Read and compare against `expected`, byte by byte. Returns the
    /// number of bytes consumed on a full match; fails with `Mismatch`
    /// at the first differing byte, or `Closed` if the peer ends early.
    pub async fn expect(&mut self, buf: &mut Buffer, expected: &[u8]) -> Result<usize> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        let mut checked = 0;
        loop {
            let data = buf.as_slice();
            while checked < data.len() && checked < expected.len() {
                if data[checked] != expected[checked] {
                    return Err(Error::Mismatch {
                        offset: checked,
                        got: data[checked],
                        expected: expected[checked],
                    });
                }
                checked += 1;
            }
            if checked == expected.len() {
                return Ok(checked);
            }
            let cap = expected.len() - buf.len();
            let n = self.readb_capped(buf, cap, deadline).await?;
            if n == 0 {
                return Err(Error::Closed);
            }
        }
    }

    /// Feed `count` bytes from `in_fd` at `offset` to the socket.
    /// Returns the bytes the kernel moved in one successful call.
    pub async fn sendfile(&mut self, in_fd: RawFd, offset: i64, count: usize) -> Result<usize> {
        let deadline = self.take_deadline();
        self.io_calls = 0;
        let mut off: libc::off_t = offset;
        loop {
            match self.class.sendfile(self.fd, in_fd, &mut off, count) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.wait_io(Interest::Out, deadline).await?;
                    self.after_ready().await?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    fn take_deadline(&mut self) -> Option<u64> {
        self.timeout_ms.take().map(deadline_after)
    }

    fn wait_io(&self, interest: Interest, deadline: Option<u64>) -> IoWait {
        IoWait::new(
            self.sched.core().clone(),
            self.cell.clone(),
            self.fd,
            interest,
            deadline,
        )
    }

    /// Starvation guard, called after each ready-wake. Multi-round
    /// operations reset the counter whenever a syscall moves bytes.
    async fn after_ready(&mut self) -> Result<()> {
        self.io_calls += 1;
        if self.io_calls >= MAX_IO_CALLS {
            self.io_calls = 0;
            self.sched.yield_now().await?;
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("fd", &self.fd)
            .field("parent", &self.parent)
            .field("closed", &self.closed)
            .finish()
    }
}

/// First occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
