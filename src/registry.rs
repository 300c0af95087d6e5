//! Registry of live vCPUs.
//!
//! The registry owns the ordered list of registered vCPUs and the shared
//! barrier state (`pending_cpus` plus its condition variables), all guarded
//! by a single mutex. Index assignment is monotonic: an automatic index is
//! one greater than the largest index ever live, never a reused gap, which
//! keeps host-side debugging identifiers stable.
//!
//! One registry exists per emulated machine. Membership is mutated only
//! under the registry mutex; read-side iteration either takes the mutex
//! ([`CpuRegistry::lock`]) or clones the `Arc` list ([`CpuRegistry::snapshot`])
//! and walks it unlocked.

use parking_lot::{Condvar, Mutex, MutexGuard};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

use crate::stats::CoordStats;
use crate::vcpu::{Vcpu, UNASSIGNED_INDEX};

/// How indices have been assigned so far. The mode is sticky: the first
/// registration fixes it, and mixing modes is a fatal API misuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IndexMode {
    Auto,
    Explicit,
}

pub(crate) struct CpuList {
    /// Registration-ordered list of live vCPUs.
    pub(crate) cpus: Vec<Arc<Vcpu>>,
    /// Index lookup for host debugging identifiers.
    by_index: FxHashMap<usize, Arc<Vcpu>>,
    index_mode: Option<IndexMode>,
}

impl CpuList {
    /// Smallest index strictly greater than every live index (max+1, not
    /// gap-filling), starting at 0.
    fn free_index(&mut self) -> usize {
        self.index_mode = Some(IndexMode::Auto);
        self.cpus
            .iter()
            .filter_map(|cpu| cpu.index())
            .max()
            .map_or(0, |max| max + 1)
    }
}

/// Registry of live vCPUs plus the exclusive-barrier state they handshake on.
pub struct CpuRegistry {
    pub(crate) list: Mutex<CpuList>,

    /// 0 when no exclusive barrier is in progress; during a barrier,
    /// 1 + the number of vCPUs the initiator is still waiting on.
    /// Written only under `list`; read with atomic loads outside it.
    pub(crate) pending_cpus: AtomicUsize,

    /// The initiator waits here for `pending_cpus` to drop to 1.
    pub(crate) exclusive_cond: Condvar,

    /// Everyone else waits here for `pending_cpus` to return to 0.
    pub(crate) resume_cond: Condvar,

    pub(crate) stats: CoordStats,
}

impl CpuRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        CpuRegistry {
            list: Mutex::new(CpuList {
                cpus: Vec::new(),
                by_index: FxHashMap::default(),
                index_mode: None,
            }),
            pending_cpus: AtomicUsize::new(0),
            exclusive_cond: Condvar::new(),
            resume_cond: Condvar::new(),
            stats: CoordStats::new(),
        }
    }

    /// Reset barrier state to quiescent.
    ///
    /// Safe to call in a post-fork child: whatever barrier the parent had in
    /// flight, the child starts with `pending_cpus == 0` and no vCPU owing a
    /// decrement. Registry membership survives.
    pub fn init(&self) {
        let list = self.list.lock();
        self.pending_cpus.store(0, Ordering::Relaxed);
        for cpu in &list.cpus {
            cpu.has_waiter.store(false, Ordering::Relaxed);
        }
    }

    /// Register a vCPU, assigning its index if unassigned.
    ///
    /// # Panics
    ///
    /// Panics if automatic and explicit indices are mixed, or if an explicit
    /// index collides with a live one.
    pub fn add(&self, cpu: &Arc<Vcpu>) {
        let mut list = self.list.lock();
        if cpu.index.load(Ordering::Relaxed) == UNASSIGNED_INDEX {
            assert!(
                list.index_mode != Some(IndexMode::Explicit),
                "automatic cpu index requested after explicit assignment"
            );
            let index = list.free_index();
            cpu.index.store(index, Ordering::Relaxed);
        } else {
            assert!(
                list.index_mode != Some(IndexMode::Auto),
                "explicit cpu index after automatic assignment"
            );
            list.index_mode = Some(IndexMode::Explicit);
        }

        let index = cpu.index.load(Ordering::Relaxed);
        let displaced = list.by_index.insert(index, Arc::clone(cpu));
        assert!(displaced.is_none(), "duplicate cpu index {index}");
        list.cpus.push(Arc::clone(cpu));
        debug!(index, "cpu registered");
    }

    /// Unregister a vCPU and reset its index. No-op if not registered.
    pub fn remove(&self, cpu: &Arc<Vcpu>) {
        let mut list = self.list.lock();
        if let Some(pos) = list.cpus.iter().position(|c| Arc::ptr_eq(c, cpu)) {
            list.cpus.remove(pos);
            let index = cpu.index.swap(UNASSIGNED_INDEX, Ordering::Relaxed);
            list.by_index.remove(&index);
            debug!(index, "cpu unregistered");
        }
    }

    /// Serialize against membership changes; the guard exposes iteration.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            inner: self.list.lock(),
        }
    }

    /// Clone the live list for unlocked read-side iteration.
    ///
    /// The `Arc`s keep each vCPU alive even if it is concurrently removed,
    /// so a snapshot walk never observes a dangling context.
    pub fn snapshot(&self) -> Vec<Arc<Vcpu>> {
        self.list.lock().cpus.clone()
    }

    /// Look up a vCPU by index.
    pub fn get(&self, index: usize) -> Option<Arc<Vcpu>> {
        self.list.lock().by_index.get(&index).cloned()
    }

    /// Number of registered vCPUs.
    pub fn len(&self) -> usize {
        self.list.lock().cpus.len()
    }

    /// Whether no vCPU is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coordination counters for this registry.
    #[inline]
    pub fn stats(&self) -> &CoordStats {
        &self.stats
    }
}

impl Default for CpuRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// RegistryGuard
// =============================================================================

/// Holds the registry mutex; iteration through this guard cannot race a
/// concurrent `add` or `remove`.
pub struct RegistryGuard<'a> {
    inner: MutexGuard<'a, CpuList>,
}

impl RegistryGuard<'_> {
    /// The registered vCPUs in registration order.
    pub fn cpus(&self) -> &[Arc<Vcpu>] {
        &self.inner.cpus
    }
}
