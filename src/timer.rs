// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer wheel: an ordered set of absolute-millisecond deadlines.
//!
//! Backed by a `BTreeMap` keyed `(deadline, seq)` — insert, cancel and
//! pop-due are all logarithmic, and the monotone `seq` breaks deadline
//! ties in insertion order.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Instant;

/// Milliseconds on the process-local monotonic clock.
pub fn mono_ms() -> u64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    let anchor = *ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_millis() as u64
}

/// Absolute deadline at least `ms` milliseconds away. The current
/// millisecond is rounded up, so a sleeper can never wake before its
/// full duration has elapsed.
pub fn deadline_after(ms: u64) -> u64 {
    mono_ms() + ms + 1
}

/// Handle for cancelling an armed timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    deadline: u64,
    seq: u64,
}

impl TimerKey {
    pub fn deadline(&self) -> u64 {
        self.deadline
    }
}

/// Ordered deadline set. `T` is whatever the owner wants woken — the
/// scheduler stores wait cells here.
pub struct TimerWheel<T> {
    entries: BTreeMap<(u64, u64), T>,
    next_seq: u64,
}

impl<T> TimerWheel<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Arm a timer at an absolute deadline. Returns the cancel handle.
    pub fn insert(&mut self, deadline: u64, value: T) -> TimerKey {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((deadline, seq), value);
        TimerKey { deadline, seq }
    }

    /// Disarm. Returns the stored value, or `None` when the timer already
    /// fired or was cancelled.
    pub fn cancel(&mut self, key: TimerKey) -> Option<T> {
        self.entries.remove(&(key.deadline, key.seq))
    }

    /// Smallest armed deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Remove and return every entry with `deadline <= now`, ascending by
    /// deadline and insertion order within a deadline.
    pub fn pop_due(&mut self, now: u64) -> Vec<(TimerKey, T)> {
        let mut due = Vec::new();
        while let Some(&(deadline, seq)) = self.entries.keys().next() {
            if deadline > now {
                break;
            }
            let value = self.entries.remove(&(deadline, seq)).unwrap();
            due.push((TimerKey { deadline, seq }, value));
        }
        due
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Drain every entry regardless of deadline (shutdown path).
    pub fn drain_all(&mut self) -> Vec<T> {
        let entries = std::mem::take(&mut self.entries);
        entries.into_values().collect()
    }
}

impl<T> Default for TimerWheel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_due_ascending() {
        let mut wheel = TimerWheel::new();
        wheel.insert(30, "c");
        wheel.insert(10, "a");
        wheel.insert(20, "b");
        let due: Vec<_> = wheel.pop_due(25).into_iter().map(|(_, v)| v).collect();
        assert_eq!(due, vec!["a", "b"]);
        assert_eq!(wheel.next_deadline(), Some(30));
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut wheel = TimerWheel::new();
        wheel.insert(10, "first");
        wheel.insert(10, "second");
        wheel.insert(10, "third");
        let due: Vec<_> = wheel.pop_due(10).into_iter().map(|(_, v)| v).collect();
        assert_eq!(due, vec!["first", "second", "third"]);
    }

    #[test]
    fn cancel_leaves_others_alone() {
        let mut wheel = TimerWheel::new();
        let a = wheel.insert(10, "a");
        wheel.insert(10, "b");
        assert_eq!(wheel.cancel(a), Some("a"));
        assert_eq!(wheel.cancel(a), None);
        let due: Vec<_> = wheel.pop_due(10).into_iter().map(|(_, v)| v).collect();
        assert_eq!(due, vec!["b"]);
    }

    #[test]
    fn boundary_is_inclusive() {
        let mut wheel = TimerWheel::new();
        wheel.insert(10, "x");
        assert!(wheel.pop_due(9).is_empty());
        assert_eq!(wheel.pop_due(10).len(), 1);
    }

    #[test]
    fn empty_wheel_has_no_deadline() {
        let wheel: TimerWheel<()> = TimerWheel::new();
        assert_eq!(wheel.next_deadline(), None);
        assert!(wheel.is_empty());
    }

    #[test]
    fn mono_ms_is_monotonic() {
        let a = mono_ms();
        let b = mono_ms();
        assert!(b >= a);
    }
}
