// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-threaded cooperative scheduler.
//!
//! One scheduler drives one OS thread: a FIFO run queue of tasks, a
//! timer wheel, and a poller. Each loop iteration drains due timers,
//! runs exactly one task, and otherwise blocks in the poller until the
//! nearest deadline or a readiness event. Timers fire before poll
//! results within an iteration, so deadline semantics stay
//! deterministic when both happen at once.

use std::collections::VecDeque;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::poller::{Interest, PollEntry, Poller};
use crate::task::{BoxFuture, RawTask, TaskState, WaitCell, WakeCause};
use crate::timer::{deadline_after, mono_ms, TimerKey, TimerWheel};

/// What a timer wakes: the parked cell, plus the fd to unregister when
/// the deadline beats readiness.
pub(crate) struct TimerSlot {
    pub cell: Arc<WaitCell>,
    pub fd: Option<RawFd>,
}

pub(crate) struct SchedCore {
    run_queue: Mutex<VecDeque<Arc<RawTask>>>,
    pub(crate) timers: Mutex<TimerWheel<TimerSlot>>,
    pub(crate) poller: Poller,
    stopping: AtomicBool,
    live_tasks: AtomicUsize,
}

impl SchedCore {
    /// Hand a runnable task to the driver. Wakes the poller in case the
    /// driver is currently blocked in `wait`.
    pub(crate) fn enqueue(&self, task: Arc<RawTask>) {
        if task.task_state() == TaskState::Complete {
            return;
        }
        self.run_queue.lock().unwrap().push_back(task);
        self.poller.wake();
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }
}

/// Cheap cloneable handle to a scheduler. The loop itself runs wherever
/// `run` is called; handles may spawn tasks from any thread until then.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<SchedCore>,
}

impl Scheduler {
    /// Create a scheduler with a fresh poller instance.
    pub fn new() -> Result<Self> {
        let poller = Poller::new()?;
        debug!("scheduler created");
        Ok(Self {
            core: Arc::new(SchedCore {
                run_queue: Mutex::new(VecDeque::new()),
                timers: Mutex::new(TimerWheel::new()),
                poller,
                stopping: AtomicBool::new(false),
                live_tasks: AtomicUsize::new(0),
            }),
        })
    }

    pub(crate) fn core(&self) -> &Arc<SchedCore> {
        &self.core
    }

    /// Spawn a task: box the future, enqueue it runnable, return before
    /// it runs. Fails with `Cancelled` once the scheduler is stopping.
    pub fn spawn<F>(&self, future: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.core.is_stopping() {
            return Err(Error::Cancelled);
        }
        let task = RawTask::new(Box::pin(future) as BoxFuture);
        let weak = Arc::downgrade(&self.core);
        *task.schedule.lock().unwrap() = Some(Arc::new(move |t: Arc<RawTask>| {
            if let Some(core) = weak.upgrade() {
                core.enqueue(t);
            }
        }));
        self.core.live_tasks.fetch_add(1, Ordering::AcqRel);
        self.core.enqueue(task);
        Ok(())
    }

    /// Number of spawned tasks that have not yet finished.
    pub fn live_tasks(&self) -> usize {
        self.core.live_tasks.load(Ordering::Acquire)
    }

    /// Suspend the calling task for at least `ms` monotonic
    /// milliseconds. `ms = 0` yields to the tail of the run queue.
    /// Returns `Cancelled` when woken by `stop`.
    pub fn sleep(&self, ms: u64) -> Sleep {
        Sleep {
            core: self.core.clone(),
            cell: WaitCell::new(),
            ms,
            state: ParkState::Init,
            timer: None,
        }
    }

    /// Yield to the tail of the run queue.
    pub fn yield_now(&self) -> Sleep {
        self.sleep(0)
    }

    /// Mark stopping and resume every parked task with `cancelled`.
    /// Runnable tasks keep running, but any new blocking operation
    /// returns `Cancelled` immediately. Callable from any thread;
    /// idempotent.
    pub fn stop(&self) {
        if self.core.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("scheduler stopping");
        let slots = self.core.timers.lock().unwrap().drain_all();
        for slot in slots {
            if let Some(fd) = slot.fd {
                self.core.poller.remove(fd);
            }
            slot.cell.fire(WakeCause::Cancelled);
        }
        for (_fd, entry) in self.core.poller.drain_all() {
            entry.cell.fire(WakeCause::Cancelled);
        }
        self.core.poller.wake();
    }

    /// Drive the loop until no task is queued, no timer armed, and no fd
    /// registered. Also the way out after `stop`, once cancelled tasks
    /// unwind.
    pub fn run(&self) {
        loop {
            let now = mono_ms();

            // Due timers first: deterministic deadline semantics even
            // when readiness arrives in the same iteration.
            let due = self.core.timers.lock().unwrap().pop_due(now);
            for (key, slot) in due {
                trace!(deadline = key.deadline(), "timer fired");
                if let Some(fd) = slot.fd {
                    self.core.poller.remove(fd);
                }
                slot.cell.fire(WakeCause::Timeout);
            }

            // One task per iteration; wakeups it causes are observed on
            // the next pass.
            let task = self.core.run_queue.lock().unwrap().pop_front();
            if let Some(task) = task {
                self.run_task(task);
                continue;
            }

            let next_deadline = self.core.timers.lock().unwrap().next_deadline();
            if next_deadline.is_none()
                && self.core.poller.is_empty()
                && self.core.run_queue.lock().unwrap().is_empty()
            {
                debug!("scheduler idle, loop exiting");
                return;
            }

            let timeout = match next_deadline {
                Some(deadline) => deadline.saturating_sub(now).min(i32::MAX as u64) as i32,
                None => -1,
            };
            match self.core.poller.wait(timeout) {
                Ok(ready) => {
                    for r in ready {
                        trace!(fd = r.fd, events = ?r.events, "fd ready");
                        // Unregister-on-wake: the park owns re-adding.
                        self.core.poller.remove(r.fd);
                        if let Some(key) = r.entry.timer {
                            self.core.timers.lock().unwrap().cancel(key);
                        }
                        r.entry.cell.fire(WakeCause::IoReady);
                    }
                }
                Err(e) => warn!(error = %e, "poller wait failed"),
            }
        }
    }

    /// Poll a single task, handling completion and the wake-during-poll
    /// race.
    fn run_task(&self, task: Arc<RawTask>) {
        if task.task_state() == TaskState::Complete {
            return;
        }
        task.state.store(TaskState::Running as u8, Ordering::Release);

        if task.poll() {
            task.mark_complete();
            self.core.live_tasks.fetch_sub(1, Ordering::AcqRel);
            trace!(live = self.live_tasks(), "task finished");
            return;
        }

        // Pending: CAS Running→Waiting. A waker that fired during poll
        // flipped the state to Ready, so the CAS fails and the task goes
        // straight back on the queue instead of being lost.
        if task
            .state
            .compare_exchange(
                TaskState::Running as u8,
                TaskState::Waiting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            self.core.enqueue(task);
        }
    }
}

enum ParkState {
    Init,
    Parked,
    Done,
}

/// Timer-parked suspension: `sleep` and `yield_now`.
pub struct Sleep {
    core: Arc<SchedCore>,
    cell: Arc<WaitCell>,
    ms: u64,
    state: ParkState,
    timer: Option<TimerKey>,
}

impl Future for Sleep {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.state {
            ParkState::Init => {
                if self.core.is_stopping() {
                    self.state = ParkState::Done;
                    return Poll::Ready(Err(Error::Cancelled));
                }
                if self.ms == 0 {
                    // Pure queue yield: wake immediately so the driver
                    // re-enqueues this task at the tail.
                    self.state = ParkState::Done;
                    cx.waker().wake_by_ref();
                    return Poll::Pending;
                }
                self.cell.arm(cx.waker());
                let deadline = deadline_after(self.ms);
                let key = self.core.timers.lock().unwrap().insert(
                    deadline,
                    TimerSlot {
                        cell: self.cell.clone(),
                        fd: None,
                    },
                );
                self.timer = Some(key);
                self.state = ParkState::Parked;
                // stop() may have drained the wheel between the first
                // stopping check and the insert above.
                if self.core.is_stopping() {
                    self.core.timers.lock().unwrap().cancel(key);
                    self.state = ParkState::Done;
                    return Poll::Ready(Err(Error::Cancelled));
                }
                Poll::Pending
            }
            ParkState::Parked => match self.cell.take_cause() {
                WakeCause::Timeout => {
                    self.timer = None;
                    self.state = ParkState::Done;
                    Poll::Ready(Ok(()))
                }
                WakeCause::Cancelled => {
                    self.timer = None;
                    self.state = ParkState::Done;
                    Poll::Ready(Err(Error::Cancelled))
                }
                _ => {
                    self.cell.update_waker(cx.waker());
                    Poll::Pending
                }
            },
            ParkState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let (ParkState::Parked, Some(key)) = (&self.state, self.timer) {
            self.core.timers.lock().unwrap().cancel(key);
        }
    }
}

/// I/O-parked suspension used by socket operations: registers the fd
/// with the poller (arming a deadline when one is pending) and resolves
/// with the wake cause.
pub(crate) struct IoWait {
    core: Arc<SchedCore>,
    cell: Arc<WaitCell>,
    fd: RawFd,
    interest: Interest,
    /// Absolute deadline, if the socket had a pending timeout.
    deadline: Option<u64>,
    state: ParkState,
    timer: Option<TimerKey>,
}

impl IoWait {
    pub(crate) fn new(
        core: Arc<SchedCore>,
        cell: Arc<WaitCell>,
        fd: RawFd,
        interest: Interest,
        deadline: Option<u64>,
    ) -> Self {
        Self {
            core,
            cell,
            fd,
            interest,
            deadline,
            state: ParkState::Init,
            timer: None,
        }
    }
}

impl Future for IoWait {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.state {
            ParkState::Init => {
                if self.core.is_stopping() {
                    self.state = ParkState::Done;
                    return Poll::Ready(Err(Error::Cancelled));
                }
                self.cell.arm(cx.waker());
                let timer = self.deadline.map(|deadline| {
                    self.core.timers.lock().unwrap().insert(
                        deadline,
                        TimerSlot {
                            cell: self.cell.clone(),
                            fd: Some(self.fd),
                        },
                    )
                });
                let entry = PollEntry {
                    cell: self.cell.clone(),
                    interest: self.interest,
                    timer,
                };
                if let Err(e) = self.core.poller.add(self.fd, entry) {
                    // Leave the socket usable: disarm and surface the error.
                    if let Some(key) = timer {
                        self.core.timers.lock().unwrap().cancel(key);
                    }
                    self.state = ParkState::Done;
                    return Poll::Ready(Err(Error::Io(e)));
                }
                self.timer = timer;
                self.state = ParkState::Parked;
                // stop() may have drained the poller between the first
                // stopping check and the add above.
                if self.core.is_stopping() {
                    self.core.poller.remove(self.fd);
                    if let Some(key) = timer {
                        self.core.timers.lock().unwrap().cancel(key);
                    }
                    self.state = ParkState::Done;
                    return Poll::Ready(Err(Error::Cancelled));
                }
                Poll::Pending
            }
            ParkState::Parked => match self.cell.take_cause() {
                // The driver already unregistered the fd and cancelled
                // the paired timer/registration for every cause below.
                WakeCause::IoReady => {
                    self.state = ParkState::Done;
                    Poll::Ready(Ok(()))
                }
                WakeCause::Timeout => {
                    self.state = ParkState::Done;
                    Poll::Ready(Err(Error::Timeout))
                }
                WakeCause::Cancelled => {
                    self.state = ParkState::Done;
                    Poll::Ready(Err(Error::Cancelled))
                }
                WakeCause::None => {
                    self.cell.update_waker(cx.waker());
                    Poll::Pending
                }
            },
            ParkState::Done => Poll::Ready(Ok(())),
        }
    }
}

impl Drop for IoWait {
    fn drop(&mut self) {
        if matches!(self.state, ParkState::Parked) {
            self.core.poller.remove(self.fd);
            if let Some(key) = self.timer {
                self.core.timers.lock().unwrap().cancel(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    #[test]
    fn spawned_tasks_run_to_completion() {
        let sched = Scheduler::new().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let c = counter.clone();
            sched
                .spawn(async move {
                    c.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
        }
        sched.run();
        assert_eq!(counter.load(Ordering::Relaxed), 10);
        assert_eq!(sched.live_tasks(), 0);
    }

    #[test]
    fn run_returns_immediately_when_empty() {
        let sched = Scheduler::new().unwrap();
        sched.run();
    }

    #[test]
    fn fifo_spawn_order() {
        let sched = Scheduler::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            sched
                .spawn(async move {
                    order.lock().unwrap().push(i);
                })
                .unwrap();
        }
        sched.run();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn yield_goes_to_queue_tail() {
        let sched = Scheduler::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let o = order.clone();
        let s = sched.clone();
        sched
            .spawn(async move {
                o.lock().unwrap().push(1);
                s.yield_now().await.unwrap();
                o.lock().unwrap().push(3);
            })
            .unwrap();

        let o = order.clone();
        sched
            .spawn(async move {
                o.lock().unwrap().push(2);
            })
            .unwrap();

        sched.run();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn sleep_waits_at_least_requested() {
        let sched = Scheduler::new().unwrap();
        let elapsed = Arc::new(Mutex::new(None));

        let e = elapsed.clone();
        let s = sched.clone();
        sched
            .spawn(async move {
                let start = Instant::now();
                s.sleep(30).await.unwrap();
                *e.lock().unwrap() = Some(start.elapsed());
            })
            .unwrap();

        sched.run();
        let elapsed = elapsed.lock().unwrap().unwrap();
        assert!(elapsed.as_millis() >= 30, "woke early: {elapsed:?}");
    }

    #[test]
    fn sleepers_resume_in_deadline_order() {
        let sched = Scheduler::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (ms, tag) in [(40u64, "late"), (10, "early"), (25, "middle")] {
            let order = order.clone();
            let s = sched.clone();
            sched
                .spawn(async move {
                    s.sleep(ms).await.unwrap();
                    order.lock().unwrap().push(tag);
                })
                .unwrap();
        }
        sched.run();
        assert_eq!(*order.lock().unwrap(), vec!["early", "middle", "late"]);
    }

    #[test]
    fn stop_cancels_parked_sleeper() {
        let sched = Scheduler::new().unwrap();
        let outcome = Arc::new(Mutex::new(None));

        let o = outcome.clone();
        let s = sched.clone();
        sched
            .spawn(async move {
                *o.lock().unwrap() = Some(s.sleep(10_000).await);
            })
            .unwrap();

        let s = sched.clone();
        sched
            .spawn(async move {
                s.sleep(50).await.unwrap();
                s.stop();
            })
            .unwrap();

        let start = Instant::now();
        sched.run();
        assert!(start.elapsed().as_millis() < 5_000);
        match outcome.lock().unwrap().take().unwrap() {
            Err(Error::Cancelled) => {}
            other => panic!("expected Cancelled, got {:?}", other),
        };
    }

    #[test]
    fn spawn_after_stop_is_rejected() {
        let sched = Scheduler::new().unwrap();
        sched.stop();
        assert!(matches!(sched.spawn(async {}), Err(Error::Cancelled)));
    }

    #[test]
    fn sleep_while_stopping_is_cancelled() {
        let sched = Scheduler::new().unwrap();
        let s = sched.clone();
        let outcome = Arc::new(Mutex::new(None));
        let o = outcome.clone();
        sched
            .spawn(async move {
                s.stop();
                *o.lock().unwrap() = Some(s.sleep(0).await);
            })
            .unwrap();
        sched.run();
        assert!(matches!(
            outcome.lock().unwrap().take().unwrap(),
            Err(Error::Cancelled)
        ));
    }

    #[test]
    fn stop_is_idempotent() {
        let sched = Scheduler::new().unwrap();
        sched.stop();
        sched.stop();
        sched.run();
    }
}
