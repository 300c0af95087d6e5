//! Work dispatch onto vCPU threads.
//!
//! Four submission flavors with distinct lock contracts:
//!
//! | Operation                | Waits | Runs under            |
//! |--------------------------|-------|-----------------------|
//! | `run_on_cpu`             | yes   | BQL                   |
//! | `async_run_on_cpu`       | no    | BQL                   |
//! | `async_run_on_cpu_no_bql`| no    | no BQL                |
//! | `async_safe_run_on_cpu`  | no    | exclusive section     |
//!
//! The drain side (`drain_work`) adapts each item to the lock state
//! its executor entered with, acquiring or shedding the BQL per item. The
//! BQL is never held across a sleep in here: the synchronous path releases
//! it before waiting, and exclusive items shed it before entering the
//! barrier handshake.

use std::sync::Arc;
use tracing::trace;

use crate::bql::{self, BqlGuard};
use crate::registry::CpuRegistry;
use crate::vcpu::{current_cpu, set_current_cpu, Vcpu};
use crate::work::item::{WorkContext, WorkItem, WorkOwnership};
use crate::work::queue;

impl CpuRegistry {
    /// Run `func` on `cpu`'s thread with the BQL held, blocking until it
    /// has returned.
    ///
    /// On the target's own thread the callback runs inline, taking the BQL
    /// only if not already held. Otherwise the item is queued and the caller
    /// sleeps on the vCPU's completion condition; a held BQL is released
    /// across the sleep and reacquired before returning.
    ///
    /// # Panics
    ///
    /// Panics if the caller holds a per-vCPU work lock; sleeping there would
    /// deadlock the drain.
    pub fn run_on_cpu(&self, cpu: &Arc<Vcpu>, func: impl FnOnce(&Arc<Vcpu>) + Send + 'static) {
        assert!(
            queue::no_work_lock_held(),
            "run_on_cpu called with a per-cpu work lock held"
        );
        let has_bql = bql::is_held();

        if cpu.is_current() {
            self.stats.record_inline();
            if has_bql {
                func(cpu);
            } else {
                let _bql = BqlGuard::lock();
                func(cpu);
            }
            return;
        }

        // About to sleep on the vCPU's condition variable; the BQL must not
        // be held across that.
        if has_bql {
            bql::unlock();
        }

        let (item, completion) = WorkItem::tracked(WorkContext::WithBql, Box::new(func));
        self.stats.record_submitted();
        {
            let mut work = cpu.lock_work();
            work.push_back(item);
            cpu.kick();
            while !completion.is_done() {
                // The wait shares the target's condition variable with
                // nested events that may rebind the thread-local; restore
                // it after every wakeup.
                let self_cpu = current_cpu();
                work.wait(&cpu.work_cond);
                set_current_cpu(self_cpu);
            }
        }

        if has_bql {
            bql::lock();
        }
    }

    /// Queue `func` to run on `cpu`'s thread with the BQL held.
    pub fn async_run_on_cpu(&self, cpu: &Arc<Vcpu>, func: impl FnOnce(&Arc<Vcpu>) + Send + 'static) {
        self.stats.record_submitted();
        cpu.queue_work(WorkItem::owned(WorkContext::WithBql, Box::new(func)));
    }

    /// Queue `func` to run on `cpu`'s thread without the BQL.
    pub fn async_run_on_cpu_no_bql(
        &self,
        cpu: &Arc<Vcpu>,
        func: impl FnOnce(&Arc<Vcpu>) + Send + 'static,
    ) {
        self.stats.record_submitted();
        cpu.queue_work(WorkItem::owned(WorkContext::NoBql, Box::new(func)));
    }

    /// Queue `func` to run on `cpu`'s thread inside an exclusive section,
    /// with every other vCPU halted.
    pub fn async_safe_run_on_cpu(
        &self,
        cpu: &Arc<Vcpu>,
        func: impl FnOnce(&Arc<Vcpu>) + Send + 'static,
    ) {
        self.stats.record_submitted();
        cpu.queue_work(WorkItem::owned(WorkContext::Exclusive, Box::new(func)));
    }

    /// Drain `cpu`'s work queue. Called by the executor thread at safe
    /// points, outside any execution window.
    ///
    /// The queue lock is released around each callback, so items may enqueue
    /// further work (including onto this same vCPU); the drain continues
    /// until the queue is empty. Completion is broadcast after every item so
    /// synchronous submitters wake as soon as their item finishes.
    pub fn drain_work(&self, cpu: &Arc<Vcpu>) {
        let has_bql = bql::is_held();

        let mut work = cpu.lock_work();
        while let Some(item) = work.pop_front() {
            drop(work);
            trace!(index = ?cpu.index(), "running queued work");
            match item.context {
                WorkContext::Exclusive => {
                    // Holding the BQL through the barrier handshake deadlocks
                    // against an initiator that owns it; shed it first.
                    if has_bql {
                        bql::unlock();
                    }
                    {
                        let _exclusive = self.exclusive();
                        (item.func)(cpu);
                    }
                    if has_bql {
                        bql::lock();
                    }
                }
                WorkContext::WithBql => {
                    if has_bql {
                        (item.func)(cpu);
                    } else {
                        let _bql = BqlGuard::lock();
                        (item.func)(cpu);
                    }
                }
                WorkContext::NoBql => {
                    if has_bql {
                        bql::unlock();
                        (item.func)(cpu);
                        bql::lock();
                    } else {
                        (item.func)(cpu);
                    }
                }
            }
            self.stats.record_drained();

            work = cpu.lock_work();
            if let WorkOwnership::Tracked(completion) = item.ownership {
                completion.finish();
            }
            cpu.work_cond.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_run_on_cpu_inline_on_own_thread() {
        let registry = CpuRegistry::new();
        let cpu = Vcpu::new(|| {});
        registry.add(&cpu);
        set_current_cpu(Some(Arc::clone(&cpu)));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        registry.run_on_cpu(&cpu, move |_| {
            assert!(bql::is_held());
            flag.store(true, Ordering::Relaxed);
        });

        assert!(ran.load(Ordering::Relaxed));
        assert!(!bql::is_held());
        assert_eq!(registry.stats().work_inline(), 1);
        assert_eq!(registry.stats().work_submitted(), 0);

        set_current_cpu(None);
    }

    #[test]
    fn test_run_on_cpu_inline_keeps_existing_bql() {
        let registry = CpuRegistry::new();
        let cpu = Vcpu::new(|| {});
        registry.add(&cpu);
        set_current_cpu(Some(Arc::clone(&cpu)));

        bql::lock();
        registry.run_on_cpu(&cpu, |_| assert!(bql::is_held()));
        assert!(bql::is_held());
        bql::unlock();

        set_current_cpu(None);
    }

    #[test]
    fn test_drain_runs_bql_item_with_lock() {
        let registry = CpuRegistry::new();
        let cpu = Vcpu::new(|| {});
        registry.add(&cpu);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        registry.async_run_on_cpu(&cpu, move |_| {
            assert!(bql::is_held());
            flag.store(true, Ordering::Relaxed);
        });

        assert!(!ran.load(Ordering::Relaxed));
        registry.drain_work(&cpu);
        assert!(ran.load(Ordering::Relaxed));
        assert!(!bql::is_held());
        assert_eq!(registry.stats().work_drained(), 1);
    }

    #[test]
    fn test_drain_sheds_bql_for_no_bql_item() {
        let registry = CpuRegistry::new();
        let cpu = Vcpu::new(|| {});
        registry.add(&cpu);

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        registry.async_run_on_cpu_no_bql(&cpu, move |_| {
            assert!(!bql::is_held());
            flag.store(true, Ordering::Relaxed);
        });

        bql::lock();
        registry.drain_work(&cpu);
        // The drain restored the caller's lock state.
        assert!(bql::is_held());
        bql::unlock();
        assert!(ran.load(Ordering::Relaxed));
    }

    #[test]
    fn test_drain_runs_exclusive_item_inside_barrier() {
        let registry = Arc::new(CpuRegistry::new());
        let cpu = Vcpu::new(|| {});
        registry.add(&cpu);
        set_current_cpu(Some(Arc::clone(&cpu)));

        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        registry.async_safe_run_on_cpu(&cpu, move |cpu| {
            assert!(!bql::is_held());
            assert!(cpu.in_exclusive_context());
            flag.store(true, Ordering::Relaxed);
        });

        registry.drain_work(&cpu);
        assert!(ran.load(Ordering::Relaxed));
        assert!(!cpu.in_exclusive_context());
        assert_eq!(registry.stats().exclusive_sections(), 1);

        set_current_cpu(None);
    }

    #[test]
    fn test_drain_preserves_fifo_order() {
        let registry = CpuRegistry::new();
        let cpu = Vcpu::new(|| {});
        registry.add(&cpu);

        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..8 {
            let order = Arc::clone(&order);
            registry.async_run_on_cpu(&cpu, move |_| order.lock().push(i));
        }

        registry.drain_work(&cpu);
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_drain_tolerates_reentrant_enqueue() {
        let registry = Arc::new(CpuRegistry::new());
        let cpu = Vcpu::new(|| {});
        registry.add(&cpu);

        let ran_nested = Arc::new(AtomicBool::new(false));
        let nested = Arc::clone(&ran_nested);
        let inner_registry = Arc::clone(&registry);
        registry.async_run_on_cpu(&cpu, move |cpu| {
            inner_registry.async_run_on_cpu(cpu, move |_| {
                nested.store(true, Ordering::Relaxed);
            });
        });

        registry.drain_work(&cpu);
        assert!(ran_nested.load(Ordering::Relaxed));
    }
}
