//! Upper bound on concurrent per-request tasks.
//!
//! Each listener owns a [`TaskLimiter`]. A datagram or connection is only
//! handed to a new task after [`TaskLimiter::try_acquire`] hands out a
//! [`TaskGuard`]; the guard moves into the task and frees the slot on drop.
//! When the limiter is full the request is shed instead of queued.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared counter of in-flight tasks with a fixed ceiling.
#[derive(Debug, Clone)]
pub struct TaskLimiter {
    max_tasks: usize,
    active: Arc<AtomicUsize>,
}

impl TaskLimiter {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            max_tasks,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a slot, or `None` if `max_tasks` are already running.
    pub fn try_acquire(&self) -> Option<TaskGuard> {
        let mut current = self.active.load(Ordering::Relaxed);
        loop {
            if current >= self.max_tasks {
                return None;
            }
            match self.active.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(TaskGuard {
                        counter: self.active.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Approximate number of running tasks, for logging.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }
}

/// RAII guard that releases its slot on drop.
/// Owns an `Arc<AtomicUsize>` so it is `Send` and can be moved into spawned tasks.
#[derive(Debug)]
pub struct TaskGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
