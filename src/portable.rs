use core::mem::ManuallyDrop;
use core::ptr::NonNull;
use std::sync::{Arc, OnceLock, Weak};

use crate::backend::Backend;
use crate::base::{Adoption, Retainer};
use crate::bridge;
use crate::Shareable;

/// Bridges `std::sync::Arc` through its public API only.
///
/// No layout assumptions: a manual retain is a conditional acquire
/// (`Weak::upgrade`) whose handle is immediately forgotten, and a manual
/// release rebuilds one forgotten handle (`Arc::from_raw`) and drops it, so
/// finalization rides the runtime's own release path.
///
/// The trade-off is the fetched count: the runtime exposes no combined
/// update-and-fetch, so the values returned by retain/release are read
/// separately and are exact only in the absence of concurrent updates. The
/// zero transition itself — who finalizes, and that it happens once — is
/// still linearized by the runtime. Prefer [`ArcBackend`](crate::ArcBackend)
/// when exact fetched counts matter under contention.
pub enum PortableBackend {}

/// Borrows the weak reference represented by a payload pointer for the
/// duration of the returned guard, without consuming it.
///
/// Safety: `cb` must be the payload pointer of a live inner record with at
/// least one outstanding weak reference (the adoption slot holds one).
unsafe fn borrow_weak(cb: NonNull<Retainer>) -> ManuallyDrop<Weak<Retainer>> {
    ManuallyDrop::new(unsafe { Weak::from_raw(cb.as_ptr().cast_const()) })
}

unsafe impl Backend for PortableBackend {
    type RawShared = Arc<Retainer>;
    type RawWeak = Weak<Retainer>;
    type ControlBlock = Retainer;
    type Slot = OnceLock<Adoption<PortableBackend>>;

    fn materialize(retainer: Retainer) -> (Arc<Retainer>, Weak<Retainer>) {
        let shared = Arc::new(retainer);
        let weak = Arc::downgrade(&shared);
        (shared, weak)
    }

    fn control_block(weak: &Weak<Retainer>) -> NonNull<Retainer> {
        // The payload pointer stands in for the control block; every
        // primitive below reconstructs the handle it needs from it.
        unsafe { NonNull::new_unchecked(weak.as_ptr() as *mut Retainer) }
    }

    fn upgrade(weak: &Weak<Retainer>) -> Option<Arc<Retainer>> {
        weak.upgrade()
    }

    fn display_count_of(shared: &Arc<Retainer>) -> usize {
        Arc::strong_count(shared)
    }

    unsafe fn increment_and_fetch(cb: NonNull<Retainer>) -> usize {
        let weak = unsafe { borrow_weak(cb) };
        let Some(shared) = weak.upgrade() else {
            // The caller vouched for a live owner; a failed conditional
            // acquire means the count already hit zero underneath them.
            bridge::misuse("retain on an object that is already finalizing");
        };
        let n = Arc::strong_count(&shared);
        Self::forget_shared(shared);
        n
    }

    unsafe fn decrement_and_fetch(cb: NonNull<Retainer>) -> usize {
        // Rebuild the forgotten handle that represents the caller's hold.
        let held = unsafe { Arc::from_raw(cb.as_ptr().cast_const()) };
        let n = Arc::strong_count(&held) - 1;
        // Dropping it releases through the runtime, which also finalizes if
        // this was the last owner.
        drop(held);
        n
    }

    unsafe fn query_display_count(cb: NonNull<Retainer>) -> usize {
        unsafe { borrow_weak(cb) }.strong_count()
    }

    unsafe fn finalize(_cb: NonNull<Retainer>) {
        // The release in `decrement_and_fetch` already went through the
        // runtime's own destruction path.
    }
}

unsafe impl<T: Send + Sync + 'static> Shareable<PortableBackend> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
    use std::sync::Arc as StdArc;

    struct Probe {
        drops: StdArc<AtomicUsize>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn counts_round_trip_through_the_public_api() {
        let drops = StdArc::new(AtomicUsize::new(0));
        let value = NonNull::from(Box::leak(Box::new(Probe { drops: drops.clone() })));
        let (shared, weak) = PortableBackend::materialize(Retainer::for_value(value));
        let cb = PortableBackend::control_block(&weak);

        PortableBackend::forget_shared(shared);
        assert_eq!(unsafe { PortableBackend::query_display_count(cb) }, 1);
        assert_eq!(unsafe { PortableBackend::increment_and_fetch(cb) }, 2);
        assert_eq!(unsafe { PortableBackend::decrement_and_fetch(cb) }, 1);
        assert_eq!(drops.load(Relaxed), 0);

        assert_eq!(unsafe { PortableBackend::decrement_and_fetch(cb) }, 0);
        assert_eq!(drops.load(Relaxed), 1);
        assert!(weak.upgrade().is_none());
    }
}
