//! The exclusive execution barrier.
//!
//! One thread (the initiator) halts every vCPU so it can mutate shared
//! machine state with nothing else in flight. vCPUs publish their execution
//! windows through the `running` flag; the initiator publishes its intent
//! through `pending_cpus`. A full fence separates each side's store from its
//! load of the other side's flag, so at least one of the two always observes
//! the other:
//!
//! - the vCPU stores `running = true`, then loads `pending_cpus`
//! - the initiator stores `pending_cpus`, then loads each `running`
//!
//! Without the fences both could read stale values and a vCPU would execute
//! guest code inside the critical section.
//!
//! `pending_cpus` states: 0 (idle) → 1 (announcing) → 1+N (counting, one per
//! running vCPU) → 1 (all counted vCPUs yielded; initiator runs) → 0 (idle).

use std::sync::atomic::{fence, Ordering};
use tracing::debug;

use crate::registry::CpuRegistry;
use crate::vcpu::{current_cpu, Vcpu};

impl CpuRegistry {
    /// Begin an exclusive section, returning when no vCPU is executing
    /// guest code.
    ///
    /// Blocks behind any barrier already in progress, then waits for every
    /// vCPU that was inside an execution window to reach `exec_end` or park
    /// itself in `exec_start`. Must not be called from inside an execution
    /// window.
    pub fn start_exclusive(&self) {
        let mut list = self.list.lock();
        while self.pending_cpus.load(Ordering::Relaxed) != 0 {
            self.resume_cond.wait(&mut list);
        }

        // Announce before scanning. Publish pending_cpus ahead of the
        // running loads; pairs with the fence in exec_start.
        self.pending_cpus.store(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let mut waiting = 0;
        for other in &list.cpus {
            if other.running.load(Ordering::Relaxed) {
                other.has_waiter.store(true, Ordering::Relaxed);
                waiting += 1;
                other.kick();
            }
        }

        self.pending_cpus.store(1 + waiting, Ordering::Relaxed);
        while self.pending_cpus.load(Ordering::Relaxed) > 1 {
            self.exclusive_cond.wait(&mut list);
        }
        drop(list);

        // pending_cpus stays at 1 until end_exclusive, which alone blocks
        // new barriers and new execution windows; the mutex is not needed
        // across the critical section.
        if let Some(cpu) = current_cpu() {
            cpu.in_exclusive_context.store(true, Ordering::Relaxed);
        }
        self.stats.record_exclusive();
        debug!(stopped = waiting, "exclusive section entered");
    }

    /// End an exclusive section and release every waiting thread.
    pub fn end_exclusive(&self) {
        if let Some(cpu) = current_cpu() {
            cpu.in_exclusive_context.store(false, Ordering::Relaxed);
        }

        let _list = self.list.lock();
        self.pending_cpus.store(0, Ordering::Relaxed);
        self.resume_cond.notify_all();
        debug!("exclusive section left");
    }

    /// Run an exclusive section scoped to a guard; dropping the guard runs
    /// [`end_exclusive`](Self::end_exclusive) on every exit path.
    pub fn exclusive(&self) -> ExclusiveGuard<'_> {
        self.start_exclusive();
        ExclusiveGuard { registry: self }
    }

    /// Enter a guest execution window, waiting out any exclusive section.
    ///
    /// Called by the vCPU's executor thread. After this returns, guest code
    /// may run until the matching [`exec_end`](Self::exec_end).
    pub fn exec_start(&self, cpu: &Vcpu) {
        cpu.running.store(true, Ordering::Relaxed);

        // Publish running ahead of the pending_cpus load; pairs with the
        // fence in start_exclusive.
        fence(Ordering::SeqCst);

        // Three possible races with start_exclusive:
        // 1. It saw running == true: we are counted (has_waiter set) and it
        //    is waiting for our exec_end. Proceed; the kick keeps the window
        //    short.
        // 2. It saw running == false but pending_cpus is already nonzero:
        //    we arrived after the scan. Uncount ourselves and park until the
        //    section finishes.
        // 3. pending_cpus == 0: any later initiator will see running == true
        //    and count us.
        if self.pending_cpus.load(Ordering::Relaxed) != 0 {
            let mut list = self.list.lock();
            if !cpu.has_waiter.load(Ordering::Relaxed) {
                cpu.running.store(false, Ordering::Relaxed);
                self.stats.record_resume_wait();
                while self.pending_cpus.load(Ordering::Relaxed) != 0 {
                    self.resume_cond.wait(&mut list);
                }
                // The lock is held: no new barrier can scan between the
                // pending_cpus check and this store.
                cpu.running.store(true, Ordering::Relaxed);
            }
        }
    }

    /// Leave a guest execution window, releasing a waiting initiator.
    pub fn exec_end(&self, cpu: &Vcpu) {
        cpu.running.store(false, Ordering::Relaxed);

        // Publish running ahead of the pending_cpus load; pairs with the
        // fence in start_exclusive.
        fence(Ordering::SeqCst);

        // If a barrier counted us (has_waiter), we owe it a decrement. If
        // pending_cpus is nonzero but has_waiter is false, the initiator
        // never counted us; the next exec_start parks if still needed.
        if self.pending_cpus.load(Ordering::Relaxed) != 0 {
            let _list = self.list.lock();
            if cpu.has_waiter.load(Ordering::Relaxed) {
                cpu.has_waiter.store(false, Ordering::Relaxed);
                let remaining = self.pending_cpus.load(Ordering::Relaxed) - 1;
                self.pending_cpus.store(remaining, Ordering::Relaxed);
                if remaining == 1 {
                    self.exclusive_cond.notify_one();
                }
            }
        }
    }
}

// =============================================================================
// ExclusiveGuard
// =============================================================================

/// Keeps the exclusive section open until dropped.
pub struct ExclusiveGuard<'a> {
    registry: &'a CpuRegistry,
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        self.registry.end_exclusive();
    }
}
