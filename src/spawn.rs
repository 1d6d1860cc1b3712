// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fixed pool of peer schedulers, one per OS thread.
//!
//! Peers share no mutable runtime state: every task and socket belongs
//! to exactly one scheduler for its whole life. Cross-peer
//! communication, if any, goes through OS-level primitives treated as
//! external I/O.

use std::thread::{self, JoinHandle};

use tracing::debug;

use crate::error::Result;
use crate::scheduler::Scheduler;

/// A set of peer schedulers and the threads driving them.
pub struct Peers {
    scheds: Vec<Scheduler>,
    threads: Vec<JoinHandle<()>>,
}

impl Peers {
    /// Create `count` schedulers. Their loops do not run until `start`;
    /// tasks may be pre-loaded onto any peer via `get` in between.
    pub fn new(count: usize) -> Result<Self> {
        let scheds = (0..count)
            .map(|_| Scheduler::new())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            scheds,
            threads: Vec::new(),
        })
    }

    pub fn count(&self) -> usize {
        self.scheds.len()
    }

    /// Handle to peer `id`.
    pub fn get(&self, id: usize) -> Option<&Scheduler> {
        self.scheds.get(id)
    }

    /// Launch one named thread per peer, each driving its own loop.
    pub fn start(&mut self) -> Result<()> {
        assert!(self.threads.is_empty(), "peer pool already started");
        for (id, sched) in self.scheds.iter().enumerate() {
            let sched = sched.clone();
            let handle = thread::Builder::new()
                .name(format!("weft-peer-{id}"))
                .spawn(move || sched.run())
                .map_err(crate::error::Error::Io)?;
            self.threads.push(handle);
        }
        debug!(peers = self.scheds.len(), "peer pool started");
        Ok(())
    }

    /// Signal every peer to stop; parked tasks resume with `cancelled`.
    pub fn stop(&self) {
        for sched in &self.scheds {
            sched.stop();
        }
    }

    /// Wait for every peer thread to exit its loop.
    pub fn join(&mut self) {
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        debug!("peer pool joined");
    }
}

impl Drop for Peers {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
            self.join();
        }
    }
}
