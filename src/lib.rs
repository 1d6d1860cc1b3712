// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! weft — a single-threaded cooperative networking runtime.
//!
//! Many I/O-bound tasks multiplexed onto one OS thread by a
//! readiness-driven loop: a FIFO run queue, a timer wheel, and an epoll
//! poller. Socket operations look blocking but park the calling task
//! and resume it on readiness, deadline, or shutdown. A fixed pool of
//! peer schedulers covers multiple cores without sharing any mutable
//! runtime state.
//!
//! Components:
//! - `timer`     — ordered deadline set and the monotonic clock
//! - `poller`    — epoll readiness interface
//! - `task`      — task state machine and wake-cause plumbing
//! - `scheduler` — run queue and driver loop; sleep/yield/stop
//! - `spawn`     — peer scheduler pool
//! - `socket`    — cooperative socket I/O and class dispatch
//! - `buffer`    — growable buffer with pluggable growth policy
//! - `addr`      — endpoint parsing and sockaddr conversions

pub mod addr;
pub mod buffer;
pub mod error;
mod poller;
pub mod scheduler;
pub mod socket;
pub mod spawn;
mod task;
pub mod timer;

pub use addr::{addr4, addr6, Family};
pub use buffer::{b64decode, b64encode, Buffer, BufferClass};
pub use error::{Error, Result};
pub use scheduler::Scheduler;
pub use socket::class::{SocketClass, TcpClass, UdpClass};
pub use socket::{Socket, MAX_IO_CALLS};
pub use spawn::Peers;
