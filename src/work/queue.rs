//! Per-vCPU queue access with held-lock tracking.
//!
//! Synchronous dispatch sleeps on a vCPU's condition variable, so it must
//! never be entered while the caller holds any per-vCPU work lock. That rule
//! is protocol, not something the borrow checker can see across call sites,
//! so every acquisition goes through a guard that maintains a thread-local
//! depth counter and [`no_work_lock_held`] asserts on it.

use parking_lot::{Condvar, MutexGuard};
use std::cell::Cell;
use std::collections::VecDeque;

use crate::work::item::WorkItem;
use crate::vcpu::Vcpu;

thread_local! {
    static WORK_LOCKS_HELD: Cell<usize> = Cell::new(0);
}

/// Whether the calling thread holds no per-vCPU work lock.
pub(crate) fn no_work_lock_held() -> bool {
    WORK_LOCKS_HELD.with(|depth| depth.get() == 0)
}

/// Tracked guard over a vCPU's work queue.
pub(crate) struct WorkQueueGuard<'a> {
    inner: MutexGuard<'a, VecDeque<WorkItem>>,
}

impl WorkQueueGuard<'_> {
    #[inline]
    pub(crate) fn push_back(&mut self, item: WorkItem) {
        self.inner.push_back(item);
    }

    #[inline]
    pub(crate) fn pop_front(&mut self) -> Option<WorkItem> {
        self.inner.pop_front()
    }

    /// Block on `cond`, releasing the queue lock while asleep.
    #[inline]
    pub(crate) fn wait(&mut self, cond: &Condvar) {
        cond.wait(&mut self.inner);
    }
}

impl Drop for WorkQueueGuard<'_> {
    fn drop(&mut self) {
        WORK_LOCKS_HELD.with(|depth| depth.set(depth.get() - 1));
    }
}

impl Vcpu {
    /// Acquire this vCPU's work lock through the tracked guard.
    pub(crate) fn lock_work(&self) -> WorkQueueGuard<'_> {
        WORK_LOCKS_HELD.with(|depth| depth.set(depth.get() + 1));
        WorkQueueGuard {
            inner: self.work.lock(),
        }
    }

    /// Append a work item and kick the executor before returning, so the
    /// target notices it even if currently blocked in a wait.
    pub(crate) fn queue_work(&self, item: WorkItem) {
        let mut queue = self.lock_work();
        queue.push_back(item);
        self.kick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::item::{WorkContext, WorkItem};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_lock_tracking_depth() {
        let cpu = Vcpu::new(|| {});
        assert!(no_work_lock_held());
        {
            let _queue = cpu.lock_work();
            assert!(!no_work_lock_held());
        }
        assert!(no_work_lock_held());
    }

    #[test]
    fn test_queue_work_kicks_executor() {
        let kicks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&kicks);
        let cpu = Vcpu::new(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        });

        cpu.queue_work(WorkItem::owned(WorkContext::WithBql, Box::new(|_| {})));
        cpu.queue_work(WorkItem::owned(WorkContext::WithBql, Box::new(|_| {})));
        assert_eq!(kicks.load(Ordering::Relaxed), 2);
    }
}
