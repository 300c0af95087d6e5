//! Queued work items.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::vcpu::Vcpu;

pub(crate) type WorkFn = Box<dyn FnOnce(&Arc<Vcpu>) + Send + 'static>;

/// Lock environment a work item runs under.
///
/// The exclusive case carries no BQL variant: an exclusive item taking the
/// big lock would deadlock against an initiator holding it, so the illegal
/// combination is unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkContext {
    /// Run with the big emulator lock held.
    WithBql,
    /// Run without the big emulator lock.
    NoBql,
    /// Run inside an exclusive section, without the big emulator lock.
    Exclusive,
}

/// Completion flag shared between a synchronous submitter and the drain.
pub(crate) struct Completion {
    done: AtomicBool,
}

impl Completion {
    fn new() -> Self {
        Completion {
            done: AtomicBool::new(false),
        }
    }

    /// Publish completion; pairs with the acquire in [`is_done`](Self::is_done)
    /// so the submitter observes every effect of the callback.
    #[inline]
    pub(crate) fn finish(&self) {
        self.done.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

/// Who owns a queued item once it has run.
pub(crate) enum WorkOwnership {
    /// The core owns the item and drops it after execution.
    Owned,
    /// The submitter is blocked on completion and observes `done`.
    Tracked(Arc<Completion>),
}

pub(crate) struct WorkItem {
    pub(crate) func: WorkFn,
    pub(crate) context: WorkContext,
    pub(crate) ownership: WorkOwnership,
}

impl WorkItem {
    /// Fire-and-forget item; the queue drops it after execution.
    pub(crate) fn owned(context: WorkContext, func: WorkFn) -> Self {
        WorkItem {
            func,
            context,
            ownership: WorkOwnership::Owned,
        }
    }

    /// Item whose completion the submitter waits on.
    pub(crate) fn tracked(context: WorkContext, func: WorkFn) -> (Self, Arc<Completion>) {
        let completion = Arc::new(Completion::new());
        let item = WorkItem {
            func,
            context,
            ownership: WorkOwnership::Tracked(Arc::clone(&completion)),
        };
        (item, completion)
    }
}
