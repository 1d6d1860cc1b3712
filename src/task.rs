// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative task representation.
//!
//! Stackless coroutine tasks: a boxed future plus an atomic state word.
//! The scheduler owns the polling loop; the waker re-enqueues a parked
//! task through the schedule callback installed at spawn time.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

/// Task lifecycle states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Queued, waiting to be polled.
    Ready = 0,
    /// Currently being polled.
    Running = 1,
    /// Parked on I/O or a deadline — waiting for its cell to fire.
    Waiting = 2,
    /// Finished.
    Complete = 3,
}

impl TaskState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Ready,
            1 => Self::Running,
            2 => Self::Waiting,
            _ => Self::Complete,
        }
    }
}

/// Why a parked task was re-enqueued.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    None = 0,
    /// The awaited fd became ready.
    IoReady = 1,
    /// The armed deadline fired.
    Timeout = 2,
    /// The scheduler is stopping; unwind without new blocking ops.
    Cancelled = 3,
}

impl WakeCause {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::IoReady,
            2 => Self::Timeout,
            3 => Self::Cancelled,
            _ => Self::None,
        }
    }
}

/// Rendezvous between one parked operation and the scheduler.
///
/// The parking future stores its waker here; whoever observes the event
/// (readiness, deadline, shutdown) fires the cell exactly once with a
/// cause. The first cause wins — a later fire still wakes but does not
/// overwrite it.
pub(crate) struct WaitCell {
    waker: Mutex<Option<Waker>>,
    cause: AtomicU8,
}

impl WaitCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            waker: Mutex::new(None),
            cause: AtomicU8::new(WakeCause::None as u8),
        })
    }

    /// Arm the cell for a fresh park: clear the cause, store the waker.
    pub fn arm(&self, waker: &Waker) {
        self.cause.store(WakeCause::None as u8, Ordering::Release);
        *self.waker.lock().unwrap() = Some(waker.clone());
    }

    /// Refresh the waker without clearing the cause (spurious poll).
    pub fn update_waker(&self, waker: &Waker) {
        *self.waker.lock().unwrap() = Some(waker.clone());
    }

    /// Record `cause` and wake the parked task. Keeps the first cause if
    /// two events race.
    pub fn fire(&self, cause: WakeCause) {
        let _ = self.cause.compare_exchange(
            WakeCause::None as u8,
            cause as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        let waker = self.waker.lock().unwrap().take();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Consume the recorded cause, resetting the cell to `None`.
    pub fn take_cause(&self) -> WakeCause {
        WakeCause::from_u8(self.cause.swap(WakeCause::None as u8, Ordering::AcqRel))
    }
}

/// Type-erased future for the scheduler. Tasks produce `()`; results, if
/// any, travel through whatever the future captured.
pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Callback the waker uses to hand a woken task back to its scheduler.
pub(crate) type ScheduleFn = Arc<dyn Fn(Arc<RawTask>) + Send + Sync>;

/// The task object owned by the scheduler.
pub(crate) struct RawTask {
    pub state: AtomicU8,
    /// Re-enqueue callback, installed by the scheduler at spawn.
    pub schedule: Mutex<Option<ScheduleFn>>,
    future: Mutex<Option<BoxFuture>>,
}

impl std::fmt::Debug for RawTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawTask").field("state", &self.task_state()).finish()
    }
}

impl RawTask {
    pub fn new(future: BoxFuture) -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(TaskState::Ready as u8),
            schedule: Mutex::new(None),
            future: Mutex::new(Some(future)),
        })
    }

    pub fn task_state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn mark_complete(&self) {
        self.state.store(TaskState::Complete as u8, Ordering::Release);
    }

    /// Poll the future once. Returns true if the task completed.
    pub fn poll(self: &Arc<Self>) -> bool {
        let waker = Waker::from(Arc::new(TaskWaker { task: self.clone() }));
        let mut cx = Context::from_waker(&waker);

        let mut slot = self.future.lock().unwrap();
        let Some(fut) = slot.as_mut() else {
            return true;
        };
        match fut.as_mut().poll(&mut cx) {
            Poll::Ready(()) => {
                *slot = None;
                true
            }
            Poll::Pending => false,
        }
    }
}

/// Waker that re-enqueues a task with its scheduler.
struct TaskWaker {
    task: Arc<RawTask>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.wake_by_ref();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        loop {
            let state = self.task.state.load(Ordering::Acquire);
            match TaskState::from_u8(state) {
                TaskState::Waiting => {
                    // Parked: transition to Ready and re-enqueue.
                    if self
                        .task
                        .state
                        .compare_exchange(
                            TaskState::Waiting as u8,
                            TaskState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    let schedule = self.task.schedule.lock().unwrap().clone();
                    if let Some(f) = schedule {
                        f(self.task.clone());
                    }
                    return;
                }
                TaskState::Running => {
                    // Wake landed during poll(). Flip Running→Ready so the
                    // driver's Running→Waiting CAS fails and re-enqueues.
                    if self
                        .task
                        .state
                        .compare_exchange(
                            TaskState::Running as u8,
                            TaskState::Ready as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_err()
                    {
                        continue;
                    }
                    return;
                }
                TaskState::Ready | TaskState::Complete => return,
            }
        }
    }
}
