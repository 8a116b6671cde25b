//! Pluggable raw locks for readiness state shared between transmitters and pools.
//!
//! Membership and pool routing are generic over a `lock_api::RawMutex`. The
//! default is `parking_lot::RawMutex`. Single-threaded deployments can plug in
//! [`NoLock`], which never blocks.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::lock_api::{GuardSend, RawMutex};

pub type DefaultLock = parking_lot::RawMutex;

/// A lock for state that is only ever touched from one thread at a time.
///
/// Acquiring it is a single uncontended atomic swap. Contention means the
/// single-thread assumption was broken, and `lock` panics rather than spin.
pub struct NoLock {
    held: AtomicBool,
}

unsafe impl RawMutex for NoLock {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: NoLock = NoLock {
        held: AtomicBool::new(false),
    };

    type GuardMarker = GuardSend;

    fn lock(&self) {
        if !self.try_lock() {
            panic!("NoLock acquired concurrently; use DefaultLock for shared pools");
        }
    }

    fn try_lock(&self) -> bool {
        self.held
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    unsafe fn unlock(&self) {
        self.held.store(false, Ordering::Release);
    }

    fn is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}
