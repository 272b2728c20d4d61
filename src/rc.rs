// The count layout here mirrors the standard library Rc; the mirror struct
// below is pinned against its inner record.

use core::cell::Cell;
use core::mem;
use core::ptr::{self, NonNull};
use std::cell::OnceCell;
use std::rc::{Rc, Weak};

use static_assertions::{assert_eq_size, const_assert, const_assert_eq};

use crate::backend::Backend;
use crate::base::{Adoption, Retainer};
use crate::bridge;
use crate::offset::FieldOffset;
use crate::Shareable;

/// Mirror of the inner record behind `Rc<Retainer>` / `Weak<Retainer>`:
/// the same shape as the thread-safe runtime's record, with plain cells for
/// the counters.
#[repr(C)]
pub struct RcInnerRepr {
    strong: Cell<usize>,
    weak: Cell<usize>,
    value: Retainer,
}

const STRONG: FieldOffset<RcInnerRepr, Cell<usize>> =
    unsafe { FieldOffset::new(mem::offset_of!(RcInnerRepr, strong)) };
const VALUE: FieldOffset<RcInnerRepr, Retainer> =
    unsafe { FieldOffset::new(mem::offset_of!(RcInnerRepr, value)) };

const_assert_eq!(mem::offset_of!(RcInnerRepr, strong), 0);
const_assert!(mem::align_of::<Retainer>() <= mem::align_of::<usize>());
assert_eq_size!(Rc<Retainer>, *const Retainer);
assert_eq_size!(Weak<Retainer>, *const Retainer);

/// Bridges the single-threaded `std::rc::Rc` runtime.
///
/// Everything it touches is `!Send`/`!Sync`, so the plain cell arithmetic
/// below is never raced.
pub enum RcBackend {}

#[inline]
fn strong_of(cb: NonNull<RcInnerRepr>) -> *const Cell<usize> {
    STRONG.project(cb.as_ptr().cast_const())
}

unsafe impl Backend for RcBackend {
    type RawShared = Rc<Retainer>;
    type RawWeak = Weak<Retainer>;
    type ControlBlock = RcInnerRepr;
    type Slot = OnceCell<Adoption<RcBackend>>;

    fn materialize(retainer: Retainer) -> (Rc<Retainer>, Weak<Retainer>) {
        let shared = Rc::new(retainer);
        let weak = Rc::downgrade(&shared);
        // First-use layout cross-check against the runtime's own query.
        debug_assert_eq!(
            unsafe { Self::query_display_count(Self::control_block(&weak)) },
            Rc::strong_count(&shared),
        );
        (shared, weak)
    }

    fn control_block(weak: &Weak<Retainer>) -> NonNull<RcInnerRepr> {
        let value = weak.as_ptr();
        // The weak came from `materialize`, so it points at a real payload
        // inside a live inner record, never at the dangling sentinel.
        unsafe { NonNull::new_unchecked(VALUE.enclosing(value) as *mut RcInnerRepr) }
    }

    fn upgrade(weak: &Weak<Retainer>) -> Option<Rc<Retainer>> {
        weak.upgrade()
    }

    fn display_count_of(shared: &Rc<Retainer>) -> usize {
        Rc::strong_count(shared)
    }

    unsafe fn increment_and_fetch(cb: NonNull<RcInnerRepr>) -> usize {
        let strong = unsafe { &*strong_of(cb) };
        let n = strong.get();
        // The count is never zero when a new owner is minted, and saturating
        // at the top would let later owners observe a wrapped count.
        if n == 0 || n == usize::MAX {
            bridge::misuse("reference count out of range on increment");
        }
        strong.set(n + 1);
        n + 1
    }

    unsafe fn decrement_and_fetch(cb: NonNull<RcInnerRepr>) -> usize {
        let strong = unsafe { &*strong_of(cb) };
        let n = strong.get();
        if n == 0 {
            bridge::misuse("release of an object whose count was already zero");
        }
        strong.set(n - 1);
        n - 1
    }

    unsafe fn query_display_count(cb: NonNull<RcInnerRepr>) -> usize {
        unsafe { &*strong_of(cb) }.get()
    }

    unsafe fn finalize(cb: NonNull<RcInnerRepr>) {
        let value = VALUE.project_mut(cb.as_ptr());
        unsafe { ptr::drop_in_place(value) };
        // Release the weak reference the strong owners collectively held.
        drop(unsafe { Weak::from_raw(value.cast_const()) });
    }
}

unsafe impl<T: 'static> Shareable<RcBackend> for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell as Flag;
    use std::rc::Rc as StdRc;

    #[test]
    fn raw_count_tracks_the_runtime_count() {
        let value = NonNull::from(Box::leak(Box::new(5u8)));
        let (shared, weak) = RcBackend::materialize(Retainer::for_value(value));
        let cb = RcBackend::control_block(&weak);

        assert_eq!(unsafe { RcBackend::query_display_count(cb) }, 1);
        let second = shared.clone();
        assert_eq!(
            unsafe { RcBackend::query_display_count(cb) },
            Rc::strong_count(&shared),
        );
        drop(second);
        drop(shared);
        assert_eq!(unsafe { RcBackend::query_display_count(cb) }, 0);
        assert!(weak.upgrade().is_none());
    }

    struct Probe {
        dropped: StdRc<Flag<bool>>,
    }

    impl Drop for Probe {
        fn drop(&mut self) {
            self.dropped.set(true);
        }
    }

    #[test]
    fn manual_finalize_runs_the_retainer() {
        let dropped = StdRc::new(Flag::new(false));
        let value = NonNull::from(Box::leak(Box::new(Probe { dropped: dropped.clone() })));
        let (shared, weak) = RcBackend::materialize(Retainer::for_value(value));
        let cb = RcBackend::control_block(&weak);

        RcBackend::forget_shared(shared);
        assert_eq!(unsafe { RcBackend::increment_and_fetch(cb) }, 2);
        assert_eq!(unsafe { RcBackend::decrement_and_fetch(cb) }, 1);
        assert_eq!(unsafe { RcBackend::decrement_and_fetch(cb) }, 0);
        unsafe { RcBackend::finalize(cb) };

        assert!(dropped.get());
        assert!(weak.upgrade().is_none());
    }
}
