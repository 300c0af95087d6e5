//! The big emulator lock (BQL).
//!
//! A single process-wide mutex held by most host callbacks. The lock itself
//! lives here so the dispatch rules can acquire and release it at their
//! boundaries; the main loop that owns it lives outside this crate.
//!
//! The lock is deliberately not recursive: [`lock`] asserts the calling
//! thread does not already hold it. Dispatch code releases and reacquires
//! the BQL in different scopes, so the raw lock/unlock edges are exposed
//! alongside the scoped [`BqlGuard`].

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::cell::Cell;
use std::marker::PhantomData;

static BQL: RawMutex = RawMutex::INIT;

thread_local! {
    static BQL_HELD: Cell<bool> = Cell::new(false);
}

/// Acquire the big emulator lock.
///
/// # Panics
///
/// Panics if the calling thread already holds the BQL.
pub fn lock() {
    assert!(!is_held(), "big emulator lock is not recursive");
    BQL.lock();
    BQL_HELD.with(|held| held.set(true));
}

/// Release the big emulator lock.
///
/// # Panics
///
/// Panics if the calling thread does not hold the BQL.
pub fn unlock() {
    assert!(is_held(), "big emulator lock not held by this thread");
    BQL_HELD.with(|held| held.set(false));
    // The held flag guarantees this thread is the owner.
    unsafe { BQL.unlock() };
}

/// Whether the calling thread holds the big emulator lock.
#[inline]
pub fn is_held() -> bool {
    BQL_HELD.with(Cell::get)
}

/// RAII acquisition of the big emulator lock.
///
/// Releases the lock when dropped, on every exit path.
pub struct BqlGuard {
    // Unlocking must happen on the acquiring thread.
    _not_send: PhantomData<*mut ()>,
}

impl BqlGuard {
    /// Acquire the BQL for the current scope.
    pub fn lock() -> Self {
        lock();
        BqlGuard {
            _not_send: PhantomData,
        }
    }
}

impl Drop for BqlGuard {
    fn drop(&mut self) {
        unlock();
    }
}
