use core::mem;
use core::ptr::NonNull;
use std::cell::OnceCell;
use std::sync::OnceLock;

use crate::base::{Adoption, Retainer};

/// A bridged shared-ownership runtime.
///
/// One implementation exists per runtime representation (`std::sync::Arc`,
/// `std::rc::Rc`, ...). A backend declares the concrete handle types involved
/// and supplies the primitive operations the counting façade is written
/// against: locating the control block behind a weak handle, atomically
/// adjusting the raw count, reading the displayed count, and finalizing the
/// object once the count reaches zero.
///
/// Backends are strategy types: they are never instantiated, and exactly one
/// of them is the process-wide [`DefaultBackend`](crate::DefaultBackend),
/// picked at build time by cargo features.
///
/// Safety: an implementation must uphold the counting contract. In
/// particular, `increment_and_fetch`/`decrement_and_fetch` must be atomic
/// with respect to each other and to the runtime's own handle operations on
/// the same control block, their return value must be the count as
/// [`normalize`](Backend::normalize)d (so a lone owner reads 1, never 0 on a
/// live object), and the transition to zero must be observable by exactly one
/// caller across both protocols.
pub unsafe trait Backend: Sized + 'static {
    /// The runtime's strong handle to a control block's payload.
    type RawShared: Clone;
    /// The runtime's weak handle, stored as the object's self back-reference.
    type RawWeak: Clone;
    /// The runtime's control block, as far as this backend can see it.
    type ControlBlock;
    /// Storage for the once-written adoption record inside the object.
    type Slot: AdoptionSlot<Self>;

    /// Creates the control block for `retainer` and the weak back-reference
    /// that will be stored in the object. The returned strong handle is the
    /// first owner.
    fn materialize(retainer: Retainer) -> (Self::RawShared, Self::RawWeak);

    /// Locates the control block behind a populated back-reference.
    ///
    /// `weak` must come from [`materialize`](Backend::materialize); emptiness
    /// is handled a level up, by the adoption slot being unset.
    fn control_block(weak: &Self::RawWeak) -> NonNull<Self::ControlBlock>;

    /// Conditionally acquires a strong handle: fails once the count has
    /// reached zero, otherwise counts as one new owner.
    fn upgrade(weak: &Self::RawWeak) -> Option<Self::RawShared>;

    /// Converts a strong handle into a bare count contribution. The owner it
    /// represented lives on until a matching manual release.
    fn forget_shared(shared: Self::RawShared) {
        mem::forget(shared);
    }

    /// The count a handle's own owner query would report for `shared`.
    fn display_count_of(shared: &Self::RawShared) -> usize;

    /// Atomically adds one owner and returns the new raw count, adjusted the
    /// same way [`normalize`](Backend::normalize) expects. The count is never
    /// zero when this is called, so this never returns 1.
    ///
    /// Safety: `cb` must point at the live control block of an object with at
    /// least one current owner.
    unsafe fn increment_and_fetch(cb: NonNull<Self::ControlBlock>) -> usize;

    /// Atomically removes one owner and returns the new raw count. A return
    /// of zero transfers the duty (and sole right) to call
    /// [`finalize`](Backend::finalize) to this caller.
    ///
    /// Safety: as for `increment_and_fetch`.
    unsafe fn decrement_and_fetch(cb: NonNull<Self::ControlBlock>) -> usize;

    /// Relaxed, non-mutating read of the current owner count. May be stale
    /// relative to concurrent updates; informational only.
    ///
    /// Safety: `cb` must point at a control block whose allocation is still
    /// live (weak handles keep it so even after the count reaches zero).
    unsafe fn query_display_count(cb: NonNull<Self::ControlBlock>) -> usize;

    /// Converts a raw fetched count into the canonical number of live owners.
    /// Representations that bias their stored count correct the fixed offset
    /// here; the runtimes bridged by the built-in backends store the owner
    /// count directly.
    fn normalize(raw: usize) -> usize {
        raw
    }

    /// Runs the destruction path after the count reached zero, without going
    /// through a handle's destructor.
    ///
    /// Safety: must be called exactly once per control block, by the caller
    /// that observed `decrement_and_fetch` return zero.
    unsafe fn finalize(cb: NonNull<Self::ControlBlock>);
}

/// Once-writable storage for an object's adoption record.
///
/// The slot serializes control-block creation: however many threads race the
/// first materialization, exactly one initializer runs and every caller
/// observes the same record afterwards. Thread-safe backends use
/// [`OnceLock`], single-threaded ones [`OnceCell`].
pub trait AdoptionSlot<B: Backend>: Default {
    /// The record, if the object has been adopted.
    fn get(&self) -> Option<&Adoption<B>>;

    /// Returns the record, running `adopt` to create it if the slot is still
    /// empty. Losers of a creation race observe the winner's record and their
    /// closure is never run.
    fn get_or_adopt(&self, adopt: impl FnOnce() -> Adoption<B>) -> &Adoption<B>;
}

impl<B: Backend> AdoptionSlot<B> for OnceLock<Adoption<B>> {
    #[inline]
    fn get(&self) -> Option<&Adoption<B>> {
        OnceLock::get(self)
    }

    #[inline]
    fn get_or_adopt(&self, adopt: impl FnOnce() -> Adoption<B>) -> &Adoption<B> {
        self.get_or_init(adopt)
    }
}

impl<B: Backend> AdoptionSlot<B> for OnceCell<Adoption<B>> {
    #[inline]
    fn get(&self) -> Option<&Adoption<B>> {
        OnceCell::get(self)
    }

    #[inline]
    fn get_or_adopt(&self, adopt: impl FnOnce() -> Adoption<B>) -> &Adoption<B> {
        self.get_or_init(adopt)
    }
}
