//! vCPU execution context.
//!
//! A [`Vcpu`] is created by the host, registered with the [`CpuRegistry`],
//! and driven by exactly one dedicated executor thread. The coordination
//! core stores shared back-references (`Arc<Vcpu>`); it never owns the
//! executor thread itself.
//!
//! [`CpuRegistry`]: crate::registry::CpuRegistry

use parking_lot::{Condvar, Mutex};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::work::item::WorkItem;

/// Index value of a vCPU that is not registered.
pub(crate) const UNASSIGNED_INDEX: usize = usize::MAX;

/// A guest CPU execution context.
///
/// Holds the per-CPU work queue, the flags the exclusive barrier handshakes
/// on, and the host-supplied kick callback that nudges the executor thread
/// out of any blocking wait.
pub struct Vcpu {
    /// Registry index; `UNASSIGNED_INDEX` before/after registration.
    /// Written only under the registry lock.
    pub(crate) index: AtomicUsize,

    /// True while the executor is inside an exec_start/exec_end window.
    pub(crate) running: AtomicBool,

    /// True when an in-progress exclusive barrier has counted this vCPU
    /// and expects a decrement at exec_end. Mutated only under the
    /// registry lock.
    pub(crate) has_waiter: AtomicBool,

    /// True on the thread that currently holds the exclusive barrier.
    pub(crate) in_exclusive_context: AtomicBool,

    /// Queued work items, drained by the executor at safe points.
    pub(crate) work: Mutex<VecDeque<WorkItem>>,

    /// Signalled as queued items complete; synchronous submitters wait here.
    pub(crate) work_cond: Condvar,

    /// Host callback that wakes the executor thread. Must be non-blocking
    /// and idempotent; it is invoked with locks held.
    kick_fn: Box<dyn Fn() + Send + Sync>,
}

impl Vcpu {
    /// Create a vCPU whose index will be assigned at registration.
    pub fn new(kick: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Self::build(UNASSIGNED_INDEX, kick)
    }

    /// Create a vCPU with a caller-chosen index.
    ///
    /// Explicit and automatic indices cannot be mixed within one registry;
    /// registration asserts this.
    pub fn with_index(index: usize, kick: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        assert!(index != UNASSIGNED_INDEX, "reserved cpu index");
        Self::build(index, kick)
    }

    fn build(index: usize, kick: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Vcpu {
            index: AtomicUsize::new(index),
            running: AtomicBool::new(false),
            has_waiter: AtomicBool::new(false),
            in_exclusive_context: AtomicBool::new(false),
            work: Mutex::new(VecDeque::new()),
            work_cond: Condvar::new(),
            kick_fn: Box::new(kick),
        })
    }

    /// The registry index, or `None` when unregistered.
    #[inline]
    pub fn index(&self) -> Option<usize> {
        match self.index.load(Ordering::Relaxed) {
            UNASSIGNED_INDEX => None,
            index => Some(index),
        }
    }

    /// Whether the calling thread holds the exclusive barrier via this vCPU.
    #[inline]
    pub fn in_exclusive_context(&self) -> bool {
        self.in_exclusive_context.load(Ordering::Relaxed)
    }

    /// Whether the calling thread is this vCPU's executor thread.
    #[inline]
    pub fn is_current(&self) -> bool {
        current_cpu().is_some_and(|cpu| std::ptr::eq(Arc::as_ptr(&cpu), self))
    }

    /// Wake the executor thread out of any blocking wait.
    #[inline]
    pub(crate) fn kick(&self) {
        (self.kick_fn)()
    }
}

impl fmt::Debug for Vcpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vcpu")
            .field("index", &self.index())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Thread-Local Current CPU
// =============================================================================

thread_local! {
    static CURRENT_CPU: RefCell<Option<Arc<Vcpu>>> = RefCell::new(None);
}

/// The vCPU bound to the calling thread, if any.
///
/// Executor threads bind themselves with [`set_current_cpu`] before entering
/// their main loop; host threads have no current vCPU.
pub fn current_cpu() -> Option<Arc<Vcpu>> {
    CURRENT_CPU.with(|cpu| cpu.borrow().clone())
}

/// Bind or unbind the calling thread's vCPU.
pub fn set_current_cpu(cpu: Option<Arc<Vcpu>>) {
    CURRENT_CPU.with(|slot| *slot.borrow_mut() = cpu);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_vcpu_is_unassigned() {
        let cpu = Vcpu::new(|| {});
        assert_eq!(cpu.index(), None);
        assert!(!cpu.in_exclusive_context());
    }

    #[test]
    fn test_with_index_presets_index() {
        let cpu = Vcpu::with_index(7, || {});
        assert_eq!(cpu.index(), Some(7));
    }

    #[test]
    #[should_panic(expected = "reserved cpu index")]
    fn test_with_index_rejects_sentinel() {
        let _ = Vcpu::with_index(UNASSIGNED_INDEX, || {});
    }

    #[test]
    fn test_current_cpu_binding() {
        assert!(current_cpu().is_none());
        let cpu = Vcpu::new(|| {});
        set_current_cpu(Some(Arc::clone(&cpu)));
        assert!(cpu.is_current());

        let other = Vcpu::new(|| {});
        assert!(!other.is_current());

        set_current_cpu(None);
        assert!(!cpu.is_current());
    }

    #[test]
    fn test_debug_format_names_index() {
        let cpu = Vcpu::with_index(3, || {});
        let rendered = format!("{cpu:?}");
        assert!(rendered.contains("index: Some(3)"));
    }
}
