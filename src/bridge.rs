use core::any::{type_name, TypeId};
use core::mem;
use core::ptr::NonNull;

use crate::backend::{AdoptionSlot, Backend};
use crate::base::{Adoption, Retainer, SelfCounter};
use crate::handle::{Handle, WeakHandle};
use crate::{Counted, Shareable};

/// Unconditional exit for count misuse.
///
/// A broken count means a double release or a release-after-free already
/// happened; unwinding would run destructors over state that can no longer be
/// trusted, so the process stops here.
pub(crate) fn misuse(what: &str) -> ! {
    log::error!("{what}; aborting");
    std::process::abort()
}

/// Fetches the object's counter and, in debug builds, checks the contract of
/// [`Counted`]: the counter must be a field of the object itself.
fn counter_of<T: Counted>(obj: &T) -> &SelfCounter<T::Backend> {
    let counter = obj.self_counter();
    debug_assert!(
        {
            let o = obj as *const T as usize;
            let c = counter as *const SelfCounter<T::Backend> as usize;
            c >= o && c + mem::size_of::<SelfCounter<T::Backend>>() <= o + mem::size_of::<T>()
        },
        "Counted::self_counter must return a counter embedded in the object itself",
    );
    counter
}

/// Builds the adoption record for `obj`, stashing the first strong handle in
/// `fresh` so the caller can decide what becomes of the bootstrap owner.
fn adoption_for<T, B>(obj: &T, fresh: &mut Option<B::RawShared>) -> Adoption<B>
where
    B: Backend,
    T: Counted<Backend = B>,
{
    let ptr = NonNull::from(obj);
    let (shared, weak) = B::materialize(Retainer::for_value(ptr));
    log::trace!("materialized control block for {}", type_name::<T>());
    *fresh = Some(shared);
    Adoption { obj: ptr.cast(), ty: TypeId::of::<T>(), weak }
}

pub(crate) unsafe fn retain<T, B>(obj: &T) -> usize
where
    B: Backend,
    T: Counted<Backend = B> + Shareable<B>,
{
    let counter = counter_of(obj);
    let mut fresh = None;
    let adoption = counter.slot.get_or_adopt(|| adoption_for(obj, &mut fresh));
    match fresh {
        // First owner ever: the bootstrap handle simply becomes the caller's
        // hold, so the count moves 0 -> 1 with no transient excursion.
        Some(shared) => {
            B::forget_shared(shared);
            1
        }
        None => {
            let cb = B::control_block(&adoption.weak);
            B::normalize(unsafe { B::increment_and_fetch(cb) })
        }
    }
}

pub(crate) unsafe fn release<T: Counted>(this: *const T) -> usize {
    let counter: *const SelfCounter<T::Backend> = unsafe { (*this).self_counter() };
    unsafe { erased_release::<T::Backend>(counter) }
}

pub(crate) fn strong_count<T: Counted>(obj: &T) -> usize {
    counter_of(obj).strong_count()
}

pub(crate) fn weak_self<T, B>(obj: &T) -> Option<WeakHandle<T>>
where
    B: Backend,
    T: Counted<Backend = B>,
{
    let adoption = counter_of(obj).slot.get()?;
    debug_assert_eq!(adoption.obj.as_ptr(), obj as *const T as *mut ());
    Some(WeakHandle::from_parts(NonNull::from(obj), adoption.weak.clone()))
}

pub(crate) fn shared_self<T, B>(obj: &T) -> Option<Handle<T>>
where
    B: Backend,
    T: Counted<Backend = B>,
{
    let adoption = counter_of(obj).slot.get()?;
    let owner = B::upgrade(&adoption.weak)?;
    Some(Handle::from_parts(NonNull::from(obj), owner))
}

/// Materializes (or joins) the control block and returns one strong handle,
/// for handle-first construction.
pub(crate) fn materialize_owner<T, B>(obj: &T) -> B::RawShared
where
    B: Backend,
    T: Counted<Backend = B> + Shareable<B>,
{
    let counter = counter_of(obj);
    let mut fresh = None;
    let adoption = counter.slot.get_or_adopt(|| adoption_for(obj, &mut fresh));
    match fresh {
        Some(shared) => shared,
        None => match B::upgrade(&adoption.weak) {
            Some(shared) => shared,
            None => misuse("handle materialization on an object that is already finalizing"),
        },
    }
}

pub(crate) unsafe fn erased_retain<B: Backend>(counter: &SelfCounter<B>) -> usize {
    let Some(adoption) = counter.slot.get() else {
        // The erased counter knows neither the object's address nor its
        // type, so it cannot create the control block; only join one.
        misuse("erased retain on an object that has never been shared")
    };
    let cb = B::control_block(&adoption.weak);
    B::normalize(unsafe { B::increment_and_fetch(cb) })
}

pub(crate) unsafe fn erased_release<B: Backend>(this: *const SelfCounter<B>) -> usize {
    let Some(adoption) = (unsafe { &*this }).slot.get() else {
        misuse("release of an object that has never been shared")
    };
    // Locate the control block before decrementing: the adoption record lives
    // inside the object, and the object may be gone one line later.
    let cb = B::control_block(&adoption.weak);
    let remaining = B::normalize(unsafe { B::decrement_and_fetch(cb) });
    if remaining == 0 {
        log::trace!("owner count reached zero; finalizing");
        unsafe { B::finalize(cb) };
        return 0;
    }
    remaining
}

/// Manual counting operations, available on every registered
/// ([`Counted`]) type.
///
/// These adjust the same counter the [`Handle`](crate::Handle)s of the object
/// use: a manual [`retain`](CountedExt::retain) keeps the object alive
/// exactly like a cloned handle would, and whichever protocol performs the
/// final release destroys the object, exactly once.
pub trait CountedExt: Counted {
    /// Adds one owner and returns the new owner count.
    ///
    /// If the object has never been shared, this creates its control block
    /// on the spot: the very first `retain` on a fresh
    /// [`Unshared`](crate::Unshared) allocation returns 1.
    ///
    /// # Safety
    ///
    /// The object must live in a tracked allocation (created through
    /// [`Unshared::new`](crate::Unshared::new) or
    /// [`Handle::new`](crate::Handle::new)), and every `retain` must
    /// eventually be balanced by exactly one [`release`](CountedExt::release).
    unsafe fn retain(&self) -> usize;

    /// Removes one owner and returns the remaining owner count. When the
    /// count reaches zero the object is destroyed and its storage freed
    /// before this returns 0.
    ///
    /// Takes a raw pointer, like
    /// [`Arc::decrement_strong_count`](std::sync::Arc::decrement_strong_count),
    /// because the final release destroys the referent.
    ///
    /// Releasing an object that has never been shared, or releasing more
    /// times than the object was retained, is misuse and aborts the process.
    ///
    /// # Safety
    ///
    /// The caller must own one count (from [`retain`](CountedExt::retain) or
    /// a forgotten handle), and nothing may use the object afterwards unless
    /// some other owner is known to still exist. Any
    /// [`Unshared`](crate::Unshared) value for this object must have been
    /// consumed or leaked before the final release.
    unsafe fn release(this: *const Self) -> usize;

    /// The current owner count: 0 before the first owner and after the final
    /// release, the number of live holds otherwise. Relaxed; informational
    /// only under concurrent mutation.
    fn strong_count(&self) -> usize;

    /// The object's stored back-reference. `None` if no owner ever existed;
    /// materializes nothing.
    fn weak_self(&self) -> Option<WeakHandle<Self>>;

    /// An owning handle to the object, if it currently has owners. Increases
    /// the owner count by one on success.
    fn shared_self(&self) -> Option<Handle<Self>>;
}

impl<T> CountedExt for T
where
    T: Counted + Shareable<T::Backend>,
{
    unsafe fn retain(&self) -> usize {
        unsafe { retain(self) }
    }

    unsafe fn release(this: *const Self) -> usize {
        unsafe { release(this) }
    }

    fn strong_count(&self) -> usize {
        strong_count(self)
    }

    fn weak_self(&self) -> Option<WeakHandle<Self>> {
        weak_self(self)
    }

    fn shared_self(&self) -> Option<Handle<Self>> {
        shared_self(self)
    }
}
