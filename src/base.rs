use core::any::TypeId;
use core::fmt;
use core::ptr::NonNull;

use crate::backend::{AdoptionSlot, Backend};
use crate::bridge;
use crate::handle::{AnyHandle, AnyWeakHandle};
use crate::DefaultBackend;

/// The payload stored in a bridged control block: the tracked object's
/// address and the hook that frees its storage.
///
/// When the combined owner count reaches zero the runtime (or the manual
/// finalize path) drops the retainer, which drops and deallocates the object.
/// The control block's own bookkeeping is reclaimed by the runtime once the
/// last weak handle goes away.
pub struct Retainer {
    obj: NonNull<()>,
    drop_obj: unsafe fn(NonNull<()>),
}

unsafe fn drop_boxed<T>(obj: NonNull<()>) {
    // Undoes the Box::leak performed when the tracked allocation was created.
    drop(unsafe { Box::from_raw(obj.cast::<T>().as_ptr()) });
}

impl Retainer {
    /// Hooks `obj` up for destruction through `Box::from_raw`. `obj` must be
    /// a leaked `Box<T>` allocation.
    pub(crate) fn for_value<T>(obj: NonNull<T>) -> Retainer {
        Retainer { obj: obj.cast(), drop_obj: drop_boxed::<T> }
    }
}

impl Drop for Retainer {
    fn drop(&mut self) {
        unsafe { (self.drop_obj)(self.obj) };
    }
}

impl fmt::Debug for Retainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retainer").field("obj", &self.obj).finish()
    }
}

// A retainer only ever exists for objects admitted under the backend's
// Shareable bound, which is what actually licenses moving it across threads.
unsafe impl Send for Retainer {}
unsafe impl Sync for Retainer {}

/// The once-written adoption record held inside a [`SelfCounter`]: the
/// object's erased address, its concrete type, and the backend's weak
/// back-reference to the control block.
pub struct Adoption<B: Backend> {
    pub(crate) obj: NonNull<()>,
    pub(crate) ty: TypeId,
    pub(crate) weak: B::RawWeak,
}

// Same licensing as Retainer: the pointee was admitted under Shareable.
unsafe impl<B: Backend> Send for Adoption<B> where B::RawWeak: Send {}
unsafe impl<B: Backend> Sync for Adoption<B> where B::RawWeak: Sync {}

/// The self-reference base: a field embedded in every tracked object.
///
/// The counter starts empty and is populated exactly once, the first time a
/// handle is materialized for the object or a manual retain bootstraps the
/// control block. It is the storage behind
/// [`weak_self`](crate::CountedExt::weak_self) and the anchor every manual
/// operation goes through.
///
/// This type is deliberately untyped: it can be used directly when the
/// concrete object type is not known at the use site (see the erased
/// operations below and [`AnyHandle`]), and the typed surface of
/// [`CountedExt`](crate::CountedExt) is a thin layer over it.
///
/// Tracked object types embed one and point [`Counted`](crate::Counted) at
/// it, most conveniently via [`impl_counted!`](crate::impl_counted):
///
/// ```
/// use ref_counted_self::{impl_counted, SelfCounter};
///
/// struct Gadget {
///     label: String,
///     counter: SelfCounter,
/// }
/// impl_counted!(Gadget { counter });
/// ```
pub struct SelfCounter<B: Backend = DefaultBackend> {
    pub(crate) slot: B::Slot,
}

impl<B: Backend> SelfCounter<B> {
    /// An empty counter; the object it sits in has no owners yet.
    pub fn new() -> SelfCounter<B> {
        SelfCounter { slot: Default::default() }
    }

    /// Whether a control block has been materialized for the object.
    pub fn is_shared(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Adds one owner to an already-shared object and returns the new count.
    ///
    /// Unlike the typed [`retain`](crate::CountedExt::retain), the erased
    /// counter has no way to create the control block (it does not know the
    /// object's address or type), so calling this before the object was ever
    /// shared is misuse and aborts the process.
    ///
    /// Safety: same contract as [`retain`](crate::CountedExt::retain).
    pub unsafe fn retain(&self) -> usize {
        unsafe { bridge::erased_retain::<B>(self) }
    }

    /// Removes one owner, finalizing the object if it was the last one.
    /// Returns the remaining count.
    ///
    /// Takes a raw pointer because the final release destroys the object the
    /// counter lives in.
    ///
    /// Safety: same contract as [`release`](crate::CountedExt::release).
    pub unsafe fn release(this: *const SelfCounter<B>) -> usize {
        unsafe { bridge::erased_release::<B>(this) }
    }

    /// The current owner count; zero before the first owner and after the
    /// last release. Informational only under concurrent mutation.
    pub fn strong_count(&self) -> usize {
        match self.slot.get() {
            Some(adoption) => {
                let cb = B::control_block(&adoption.weak);
                // The weak reference in the slot keeps the control block's
                // allocation alive, so the read is in bounds even at count 0.
                B::normalize(unsafe { B::query_display_count(cb) })
            }
            None => 0,
        }
    }

    /// The stored back-reference as an erased weak handle, if the object has
    /// ever been shared.
    pub fn weak_any(&self) -> Option<AnyWeakHandle<B>> {
        let adoption = self.slot.get()?;
        Some(AnyWeakHandle::from_adoption(adoption))
    }

    /// An erased owning handle to the object, if it currently has owners.
    pub fn shared_any(&self) -> Option<AnyHandle<B>> {
        let adoption = self.slot.get()?;
        let owner = B::upgrade(&adoption.weak)?;
        Some(AnyHandle::from_adoption(adoption, owner))
    }
}

impl<B: Backend> Default for SelfCounter<B> {
    fn default() -> SelfCounter<B> {
        SelfCounter::new()
    }
}

impl<B: Backend> Clone for SelfCounter<B> {
    /// Cloning a tracked object must not alias its identity: the copy starts
    /// with a fresh, empty counter.
    fn clone(&self) -> SelfCounter<B> {
        SelfCounter::new()
    }
}

impl<B: Backend> fmt::Debug for SelfCounter<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfCounter")
            .field("shared", &self.is_shared())
            .field("strong_count", &self.strong_count())
            .finish()
    }
}
