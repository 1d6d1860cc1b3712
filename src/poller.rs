// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Kernel readiness interface: a level-triggered epoll wrapper.
//!
//! The scheduler unregisters a node whenever it wakes its owner, and
//! every park re-registers, so a registration always stands for exactly
//! one parked operation. An internal eventfd interrupts `wait` for
//! cross-thread stop requests.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::task::WaitCell;
use crate::timer::TimerKey;

/// Event kinds a node can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Readable (`in`).
    In,
    /// Writable (`out`).
    Out,
    /// Both directions.
    Both,
}

impl Interest {
    fn to_epoll(self) -> u32 {
        match self {
            Interest::In => libc::EPOLLIN as u32,
            Interest::Out => libc::EPOLLOUT as u32,
            Interest::Both => (libc::EPOLLIN | libc::EPOLLOUT) as u32,
        }
    }

    fn from_epoll(events: u32) -> Self {
        // Error and hangup conditions wake both directions so the retry
        // syscall can surface the failure.
        let err = events & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0;
        let readable = err || events & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0;
        let writable = err || events & libc::EPOLLOUT as u32 != 0;
        match (readable, writable) {
            (true, true) => Interest::Both,
            (false, true) => Interest::Out,
            _ => Interest::In,
        }
    }
}

/// Registration payload: the cell to fire and the deadline armed with it.
#[derive(Clone)]
pub(crate) struct PollEntry {
    pub cell: Arc<WaitCell>,
    pub interest: Interest,
    pub timer: Option<TimerKey>,
}

/// One readiness report from `wait`.
pub(crate) struct Ready {
    pub fd: RawFd,
    pub entry: PollEntry,
    pub events: Interest,
}

/// Level-triggered epoll instance plus its registration table.
pub(crate) struct Poller {
    epoll_fd: RawFd,
    /// Eventfd registered with epoll so another thread can interrupt `wait`.
    wake_fd: RawFd,
    registrations: Mutex<HashMap<RawFd, PollEntry>>,
}

impl Poller {
    pub fn new() -> io::Result<Self> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(err);
        }

        let mut ev = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: wake_fd as u64,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut ev) } < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(err);
        }

        Ok(Self {
            epoll_fd,
            wake_fd,
            registrations: Mutex::new(HashMap::new()),
        })
    }

    /// Begin watching `fd`. Fails if the fd is already registered.
    pub fn add(&self, fd: RawFd, entry: PollEntry) -> io::Result<()> {
        let mut regs = self.registrations.lock().unwrap();
        if regs.contains_key(&fd) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "fd already registered with poller",
            ));
        }
        let mut ev = libc::epoll_event {
            events: entry.interest.to_epoll(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut ev) } < 0 {
            return Err(io::Error::last_os_error());
        }
        regs.insert(fd, entry);
        Ok(())
    }

    /// Change the watched event set. Idempotent when equal.
    pub fn modify(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut regs = self.registrations.lock().unwrap();
        let Some(entry) = regs.get_mut(&fd) else {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                "fd not registered with poller",
            ));
        };
        if entry.interest == interest {
            return Ok(());
        }
        let mut ev = libc::epoll_event {
            events: interest.to_epoll(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut ev) } < 0 {
            return Err(io::Error::last_os_error());
        }
        entry.interest = interest;
        Ok(())
    }

    /// Stop watching `fd`. Safe in any state; returns the entry if one
    /// was registered.
    pub fn remove(&self, fd: RawFd) -> Option<PollEntry> {
        let entry = self.registrations.lock().unwrap().remove(&fd);
        if entry.is_some() {
            let ret = unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut())
            };
            if ret < 0 {
                let err = io::Error::last_os_error();
                // ENOENT / EBADF are expected when the fd already closed.
                debug_assert!(
                    matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)),
                    "epoll deregister failed: {err}"
                );
            }
        }
        entry
    }

    /// Block up to `timeout_ms` (`0` = non-blocking, negative = forever)
    /// for readiness. Each registered fd appears at most once.
    pub fn wait(&self, timeout_ms: i32) -> io::Result<Vec<Ready>> {
        const MAX_EVENTS: usize = 64;
        let mut events: [libc::epoll_event; MAX_EVENTS] =
            [libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        let n = unsafe {
            libc::epoll_wait(self.epoll_fd, events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(Vec::new());
            }
            return Err(err);
        }

        let regs = self.registrations.lock().unwrap();
        let mut ready = Vec::with_capacity(n as usize);
        for ev in &events[..n as usize] {
            let fd = ev.u64 as RawFd;
            if fd == self.wake_fd {
                let mut buf = [0u8; 8];
                unsafe {
                    libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, 8);
                }
                continue;
            }
            if let Some(entry) = regs.get(&fd) {
                ready.push(Ready {
                    fd,
                    entry: entry.clone(),
                    events: Interest::from_epoll(ev.events),
                });
            }
        }
        Ok(ready)
    }

    /// Interrupt a blocked `wait` from any thread.
    pub fn wake(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Remove and return every registration (shutdown path).
    pub fn drain_all(&self) -> Vec<(RawFd, PollEntry)> {
        let drained: Vec<(RawFd, PollEntry)> =
            self.registrations.lock().unwrap().drain().collect();
        for (fd, _) in &drained {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, *fd, std::ptr::null_mut());
            }
        }
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.lock().unwrap().is_empty()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        let regs = self.registrations.lock().unwrap();
        for &fd in regs.keys() {
            unsafe {
                libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
        drop(regs);
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::WakeCause;

    fn entry() -> PollEntry {
        PollEntry {
            cell: WaitCell::new(),
            interest: Interest::In,
            timer: None,
        }
    }

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    #[test]
    fn pipe_readiness() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe();

        poller.add(read_fd, entry()).unwrap();
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }

        let ready = poller.wait(100).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, read_fd);

        poller.remove(read_fd);
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn add_twice_fails() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe();
        poller.add(read_fd, entry()).unwrap();
        let err = poller.add(read_fd, entry()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        poller.remove(read_fd);
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn modify_is_idempotent_when_equal() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe();
        poller.add(read_fd, entry()).unwrap();
        poller.modify(read_fd, Interest::In).unwrap();
        poller.modify(read_fd, Interest::In).unwrap();
        poller.modify(read_fd, Interest::Both).unwrap();
        poller.remove(read_fd);
        close(read_fd);
        close(write_fd);
    }

    #[test]
    fn remove_is_safe_in_any_state() {
        let poller = Poller::new().unwrap();
        assert!(poller.remove(12345).is_none());

        let (read_fd, write_fd) = pipe();
        poller.add(read_fd, entry()).unwrap();
        // Close before removal: deregister must tolerate the dead fd.
        close(read_fd);
        assert!(poller.remove(read_fd).is_some());
        assert!(poller.remove(read_fd).is_none());
        close(write_fd);
    }

    #[test]
    fn wake_interrupts_wait() {
        let poller = Arc::new(Poller::new().unwrap());
        let waker = poller.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            waker.wake();
        });
        let start = std::time::Instant::now();
        let ready = poller.wait(5000).unwrap();
        assert!(ready.is_empty());
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
        handle.join().unwrap();
    }

    #[test]
    fn timeout_with_no_events() {
        let poller = Poller::new().unwrap();
        let ready = poller.wait(1).unwrap();
        assert!(ready.is_empty());
    }

    #[test]
    fn fired_cell_carries_cause() {
        let poller = Poller::new().unwrap();
        let (read_fd, write_fd) = pipe();
        let e = entry();
        let cell = e.cell.clone();
        poller.add(read_fd, e).unwrap();
        unsafe {
            libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1);
        }
        let ready = poller.wait(100).unwrap();
        ready[0].entry.cell.fire(WakeCause::IoReady);
        assert_eq!(cell.take_cause(), WakeCause::IoReady);
        poller.remove(read_fd);
        close(read_fd);
        close(write_fd);
    }
}
