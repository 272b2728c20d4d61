// The count layout and ordering discipline here mirror the standard library
// Arc; the mirror struct below is pinned against its inner record.

use core::mem;
use core::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicUsize};
use std::sync::{Arc, OnceLock, Weak};

use static_assertions::{assert_eq_size, const_assert, const_assert_eq};

use crate::backend::Backend;
use crate::base::{Adoption, Retainer};
use crate::bridge;
use crate::offset::FieldOffset;
use crate::Shareable;

/// A soft limit on the number of owners an object may have.
///
/// Going above this limit aborts the program; the runtime applies the same
/// cap to its own handles.
const MAX_REFCOUNT: usize = isize::MAX as usize;

/// Mirror of the inner record behind `Arc<Retainer>` / `Weak<Retainer>`:
/// two counters followed by the payload, laid out `#[repr(C)]` as the
/// runtime declares its own record. `Weak::as_ptr` hands out the payload
/// address, and the offsets below walk from there to the counters.
#[repr(C)]
pub struct ArcInnerRepr {
    strong: AtomicUsize,
    weak: AtomicUsize,
    value: Retainer,
}

const STRONG: FieldOffset<ArcInnerRepr, AtomicUsize> =
    unsafe { FieldOffset::new(mem::offset_of!(ArcInnerRepr, strong)) };
const VALUE: FieldOffset<ArcInnerRepr, Retainer> =
    unsafe { FieldOffset::new(mem::offset_of!(ArcInnerRepr, value)) };

// Pin the assumptions the mirror rests on. The cross-check in `materialize`
// additionally catches a reordered runtime record at first use in debug
// builds.
const_assert_eq!(mem::offset_of!(ArcInnerRepr, strong), 0);
const_assert!(mem::align_of::<Retainer>() <= mem::align_of::<usize>());
assert_eq_size!(Arc<Retainer>, *const Retainer);
assert_eq_size!(Weak<Retainer>, *const Retainer);

/// Bridges the `std::sync::Arc` runtime through its raw count field.
///
/// Increments and decrements are single atomic read-modify-writes on the
/// runtime's own counter, so the values returned by the manual operations
/// are exact even under contention.
pub enum ArcBackend {}

#[inline]
fn strong_of(cb: NonNull<ArcInnerRepr>) -> *const AtomicUsize {
    STRONG.project(cb.as_ptr().cast_const())
}

unsafe impl Backend for ArcBackend {
    type RawShared = Arc<Retainer>;
    type RawWeak = Weak<Retainer>;
    type ControlBlock = ArcInnerRepr;
    type Slot = OnceLock<Adoption<ArcBackend>>;

    fn materialize(retainer: Retainer) -> (Arc<Retainer>, Weak<Retainer>) {
        let shared = Arc::new(retainer);
        let weak = Arc::downgrade(&shared);
        // First-use layout cross-check: a raw read through the mirror must
        // agree with the runtime's own owner query.
        debug_assert_eq!(
            unsafe { Self::query_display_count(Self::control_block(&weak)) },
            Arc::strong_count(&shared),
        );
        (shared, weak)
    }

    fn control_block(weak: &Weak<Retainer>) -> NonNull<ArcInnerRepr> {
        let value = weak.as_ptr();
        // The weak came from `materialize`, so it points at a real payload
        // inside a live inner record, never at the dangling sentinel.
        unsafe { NonNull::new_unchecked(VALUE.enclosing(value) as *mut ArcInnerRepr) }
    }

    fn upgrade(weak: &Weak<Retainer>) -> Option<Arc<Retainer>> {
        weak.upgrade()
    }

    fn display_count_of(shared: &Arc<Retainer>) -> usize {
        Arc::strong_count(shared)
    }

    unsafe fn increment_and_fetch(cb: NonNull<ArcInnerRepr>) -> usize {
        // Relaxed suffices: a new owner can only be minted by a caller who
        // already guarantees the object stays alive, and that guarantee
        // carries the required synchronization.
        let old = unsafe { &*strong_of(cb) }.fetch_add(1, Relaxed);
        if old > MAX_REFCOUNT {
            bridge::misuse("reference count overflow");
        }
        old + 1
    }

    unsafe fn decrement_and_fetch(cb: NonNull<ArcInnerRepr>) -> usize {
        let old = unsafe { &*strong_of(cb) }.fetch_sub(1, Release);
        if old == 0 {
            // The counter was already zero and has now wrapped: a release
            // beyond the last owner.
            bridge::misuse("release of an object whose count was already zero");
        }
        old - 1
    }

    unsafe fn query_display_count(cb: NonNull<ArcInnerRepr>) -> usize {
        unsafe { &*strong_of(cb) }.load(Relaxed)
    }

    unsafe fn finalize(cb: NonNull<ArcInnerRepr>) {
        // Synchronizes with the Release decrements of every former owner, so
        // all their accesses happen before the destruction below.
        fence(Acquire);
        let value = VALUE.project_mut(cb.as_ptr());
        // The count stays at zero throughout, so a concurrent weak upgrade
        // can never resurrect the object mid-destruction.
        unsafe { ptr::drop_in_place(value) };
        // The strong owners collectively hold one weak reference; releasing
        // it lets the runtime reclaim the record once the last weak handle
        // is gone.
        drop(unsafe { Weak::from_raw(value.cast_const()) });
    }
}

unsafe impl<T: Send + Sync + 'static> Shareable<ArcBackend> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as Counter;
    use std::sync::Arc as StdArc;

    fn tracked_cell() -> (Arc<Retainer>, Weak<Retainer>) {
        let value = NonNull::from(Box::leak(Box::new(7u32)));
        ArcBackend::materialize(Retainer::for_value(value))
    }

    #[test]
    fn raw_count_tracks_the_runtime_count() {
        let (shared, weak) = tracked_cell();
        let cb = ArcBackend::control_block(&weak);

        assert_eq!(unsafe { ArcBackend::query_display_count(cb) }, 1);

        let second = shared.clone();
        assert_eq!(
            unsafe { ArcBackend::query_display_count(cb) },
            Arc::strong_count(&shared),
        );
        assert_eq!(unsafe { ArcBackend::query_display_count(cb) }, 2);

        drop(second);
        assert_eq!(unsafe { ArcBackend::query_display_count(cb) }, 1);

        drop(shared);
        // The weak handle keeps the record readable after the last owner.
        assert_eq!(unsafe { ArcBackend::query_display_count(cb) }, 0);
        assert!(weak.upgrade().is_none());
    }

    #[test]
    fn manual_updates_are_visible_to_the_runtime() {
        let (shared, weak) = tracked_cell();
        let cb = ArcBackend::control_block(&weak);

        assert_eq!(unsafe { ArcBackend::increment_and_fetch(cb) }, 2);
        assert_eq!(Arc::strong_count(&shared), 2);
        assert_eq!(unsafe { ArcBackend::decrement_and_fetch(cb) }, 1);
        assert_eq!(Arc::strong_count(&shared), 1);
    }

    struct Probe {
        drops: StdArc<Counter>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Relaxed);
        }
    }

    #[test]
    fn manual_finalize_runs_the_retainer_exactly_once() {
        let drops = StdArc::new(Counter::new(0));
        let value = NonNull::from(Box::leak(Box::new(Probe { drops: drops.clone() })));
        let (shared, weak) = ArcBackend::materialize(Retainer::for_value(value));
        let cb = ArcBackend::control_block(&weak);

        // Convert the bootstrap handle into a manual hold, then release it.
        ArcBackend::forget_shared(shared);
        assert_eq!(unsafe { ArcBackend::decrement_and_fetch(cb) }, 0);
        unsafe { ArcBackend::finalize(cb) };

        assert_eq!(drops.load(Relaxed), 1);
        assert!(weak.upgrade().is_none());
    }
}
