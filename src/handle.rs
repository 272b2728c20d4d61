use core::any::TypeId;
use core::borrow;
use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::mem;
use core::ops::Deref;
use core::ptr::NonNull;

use crate::backend::{AdoptionSlot, Backend};
use crate::base::Adoption;
use crate::bridge;
use crate::{Counted, RawShared, RawWeak, Shareable};

/// A unique handle to a tracked allocation that has no owners yet.
///
/// This is the entry point of a tracked object's lifetime: the storage is
/// heap-allocated, the owner count is 0, and no control block exists. The
/// control block is created the first time the object is shared, either by
/// [`into_handle`](Unshared::into_handle) or by a bootstrapping manual
/// [`retain`](crate::CountedExt::retain) through a reference to the object.
///
/// While the object is unshared, `Unshared` behaves like a `Box`: it frees
/// the allocation on drop and offers guarded mutable access through
/// [`get_mut`](Unshared::get_mut). Once the object has been adopted by the
/// counting system the `Unshared` value is a mere bystander: dropping it does
/// nothing, and it must not outlive the final release (see
/// [`release`](crate::CountedExt::release)).
pub struct Unshared<T: Counted> {
    ptr: NonNull<T>,
}

unsafe impl<T: Counted + Send> Send for Unshared<T> {}
unsafe impl<T: Counted + Sync> Sync for Unshared<T> {}

impl<T: Counted> Unshared<T> {
    /// Moves `value` into a fresh tracked allocation with zero owners.
    pub fn new(value: T) -> Unshared<T> {
        Unshared { ptr: NonNull::from(Box::leak(Box::new(value))) }
    }

    fn is_adopted(&self) -> bool {
        unsafe { self.ptr.as_ref() }.self_counter().slot.get().is_some()
    }

    /// Mutable access to the object, as long as it is still unshared.
    /// Returns `None` once a control block exists, since other holders may
    /// be reading through it.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.is_adopted() {
            None
        } else {
            Some(unsafe { self.ptr.as_mut() })
        }
    }

    /// Shares the object, consuming the unique stage: materializes the
    /// control block if none exists yet and returns an owning handle.
    pub fn into_handle(self) -> Handle<T>
    where
        T: Shareable<T::Backend>,
    {
        let ptr = self.ptr;
        mem::forget(self);
        let owner = bridge::materialize_owner(unsafe { ptr.as_ref() });
        Handle::from_parts(ptr, owner)
    }

    /// Releases the unique stage without freeing the allocation, returning
    /// the raw object pointer. The object is afterwards exactly as manual
    /// callers expect it: zero owners until something retains it.
    pub fn into_raw(self) -> *mut T {
        let ptr = self.ptr.as_ptr();
        mem::forget(self);
        ptr
    }

    /// Rebuilds an `Unshared` from [`into_raw`](Unshared::into_raw).
    ///
    /// Safety: `ptr` must come from `into_raw`, and the unique stage must
    /// not have been re-entered by another `from_raw` in the meantime.
    pub unsafe fn from_raw(ptr: *mut T) -> Unshared<T> {
        Unshared { ptr: unsafe { NonNull::new_unchecked(ptr) } }
    }
}

impl<T: Counted> Drop for Unshared<T> {
    fn drop(&mut self) {
        // Once adopted, the storage belongs to the owner count; before that,
        // this is the sole owner of the allocation.
        if !self.is_adopted() {
            drop(unsafe { Box::from_raw(self.ptr.as_ptr()) });
        }
    }
}

impl<T: Counted> Deref for Unshared<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: Counted> borrow::Borrow<T> for Unshared<T> {
    fn borrow(&self) -> &T {
        &**self
    }
}

impl<T: Counted> AsRef<T> for Unshared<T> {
    fn as_ref(&self) -> &T {
        &**self
    }
}

impl<T: Counted + fmt::Debug> fmt::Debug for Unshared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

/// A shared-ownership handle to a tracked object.
///
/// A `Handle` is one owner: cloning it increments the shared counter and
/// dropping it decrements it, and the same counter is what the manual
/// [`retain`](crate::CountedExt::retain)/[`release`](crate::CountedExt::release)
/// operations adjust. Whichever of the two protocols removes the last owner
/// destroys the object, exactly once.
pub struct Handle<T: Counted> {
    obj: NonNull<T>,
    owner: RawShared<T>,
}

unsafe impl<T> Send for Handle<T>
where
    T: Counted + Send + Sync,
    RawShared<T>: Send,
{
}
unsafe impl<T> Sync for Handle<T>
where
    T: Counted + Send + Sync,
    RawShared<T>: Sync,
{
}

impl<T: Counted> Handle<T> {
    /// Moves `value` into a tracked allocation and returns the first handle
    /// to it. The owner count starts at 1.
    pub fn new(value: T) -> Handle<T>
    where
        T: Shareable<T::Backend>,
    {
        Unshared::new(value).into_handle()
    }

    pub(crate) fn from_parts(obj: NonNull<T>, owner: RawShared<T>) -> Handle<T> {
        Handle { obj, owner }
    }

    /// The current owner count of the object this handle shares.
    pub fn strong_count(this: &Handle<T>) -> usize {
        <T::Backend as Backend>::display_count_of(&this.owner)
    }

    /// Whether two handles share the same object.
    pub fn ptr_eq(this: &Handle<T>, other: &Handle<T>) -> bool {
        this.obj == other.obj
    }

    /// A non-owning handle to the same object.
    pub fn downgrade(this: &Handle<T>) -> WeakHandle<T> {
        match unsafe { this.obj.as_ref() }.self_counter().slot.get() {
            Some(adoption) => WeakHandle::from_parts(this.obj, adoption.weak.clone()),
            None => unreachable!("live handle without an adoption record"),
        }
    }

    /// Erases the object's type, keeping the hold. The concrete type can be
    /// recovered with [`AnyHandle::downcast`].
    pub fn erase(this: Handle<T>) -> AnyHandle<T::Backend> {
        let Handle { obj, owner } = this;
        AnyHandle { obj: obj.cast(), ty: TypeId::of::<T>(), owner }
    }
}

impl<T: Counted> Clone for Handle<T> {
    /// Makes another owner of the same object, increasing the shared counter.
    #[inline]
    fn clone(&self) -> Handle<T> {
        Handle { obj: self.obj, owner: self.owner.clone() }
    }
}

impl<T: Counted> Deref for Handle<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        // The owner field keeps the object alive for as long as this handle
        // exists.
        unsafe { self.obj.as_ref() }
    }
}

impl<T: Counted> borrow::Borrow<T> for Handle<T> {
    fn borrow(&self) -> &T {
        &**self
    }
}

impl<T: Counted> AsRef<T> for Handle<T> {
    fn as_ref(&self) -> &T {
        &**self
    }
}

impl<T: Counted + fmt::Display> fmt::Display for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&**self, f)
    }
}

impl<T: Counted + fmt::Debug> fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

impl<T: Counted> fmt::Pointer for Handle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Pointer::fmt(&(&**self as *const T), f)
    }
}

impl<T: Counted + PartialEq> PartialEq for Handle<T> {
    /// Equality for two `Handle`s.
    ///
    /// Two `Handle`s are equal if their inner values are equal. This
    /// implementation does not check for pointer equality; see
    /// [`ptr_eq`](Handle::ptr_eq) for that.
    #[inline]
    fn eq(&self, other: &Handle<T>) -> bool {
        (**self).eq(&**other)
    }
}

impl<T: Counted + Eq> Eq for Handle<T> {}

impl<T: Counted + PartialOrd> PartialOrd for Handle<T> {
    /// Partial comparison for two `Handle`s, by their inner values.
    fn partial_cmp(&self, other: &Handle<T>) -> Option<Ordering> {
        (**self).partial_cmp(&**other)
    }
}

impl<T: Counted + Ord> Ord for Handle<T> {
    /// Comparison for two `Handle`s, by their inner values.
    fn cmp(&self, other: &Handle<T>) -> Ordering {
        (**self).cmp(&**other)
    }
}

impl<T: Counted + Hash> Hash for Handle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (**self).hash(state)
    }
}

/// A non-owning handle to a tracked object.
///
/// Observes the object without keeping it alive; [`upgrade`](WeakHandle::upgrade)
/// re-acquires an owning [`Handle`] as long as at least one owner remains.
pub struct WeakHandle<T: Counted> {
    obj: NonNull<T>,
    owner: RawWeak<T>,
}

unsafe impl<T> Send for WeakHandle<T>
where
    T: Counted + Send + Sync,
    RawWeak<T>: Send,
{
}
unsafe impl<T> Sync for WeakHandle<T>
where
    T: Counted + Send + Sync,
    RawWeak<T>: Sync,
{
}

impl<T: Counted> WeakHandle<T> {
    pub(crate) fn from_parts(obj: NonNull<T>, owner: RawWeak<T>) -> WeakHandle<T> {
        WeakHandle { obj, owner }
    }

    /// Attempts to re-acquire an owning handle. Fails once the owner count
    /// has reached zero; counts as one new owner on success.
    pub fn upgrade(&self) -> Option<Handle<T>> {
        let owner = <T::Backend as Backend>::upgrade(&self.owner)?;
        Some(Handle::from_parts(self.obj, owner))
    }

    /// The current owner count of the referenced object; 0 once it has been
    /// finalized.
    pub fn strong_count(&self) -> usize {
        let cb = <T::Backend as Backend>::control_block(&self.owner);
        // The weak reference keeps the control block's allocation alive.
        <T::Backend as Backend>::normalize(unsafe {
            <T::Backend as Backend>::query_display_count(cb)
        })
    }

    /// Whether two weak handles reference the same object.
    pub fn ptr_eq(this: &WeakHandle<T>, other: &WeakHandle<T>) -> bool {
        this.obj == other.obj
    }

    /// Erases the object's type; see [`AnyWeakHandle::downcast`].
    pub fn erase(this: WeakHandle<T>) -> AnyWeakHandle<T::Backend> {
        let WeakHandle { obj, owner } = this;
        AnyWeakHandle { obj: obj.cast(), ty: TypeId::of::<T>(), owner }
    }
}

impl<T: Counted> Clone for WeakHandle<T> {
    fn clone(&self) -> WeakHandle<T> {
        WeakHandle { obj: self.obj, owner: self.owner.clone() }
    }
}

impl<T: Counted> fmt::Debug for WeakHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(WeakHandle)")
    }
}

/// An owning handle whose object type has been erased.
///
/// Useful for heterogeneous collections of tracked objects. The concrete
/// type is recorded at erasure and checked again by
/// [`downcast`](AnyHandle::downcast).
pub struct AnyHandle<B: Backend> {
    obj: NonNull<()>,
    ty: TypeId,
    owner: B::RawShared,
}

// Erased handles only ever exist for objects admitted under the backend's
// Shareable bound, so the owner's own thread-safety is the deciding factor.
unsafe impl<B: Backend> Send for AnyHandle<B> where B::RawShared: Send {}
unsafe impl<B: Backend> Sync for AnyHandle<B> where B::RawShared: Sync {}

impl<B: Backend> AnyHandle<B> {
    pub(crate) fn from_adoption(adoption: &Adoption<B>, owner: B::RawShared) -> AnyHandle<B> {
        AnyHandle { obj: adoption.obj, ty: adoption.ty, owner }
    }

    /// The recorded concrete type of the referenced object.
    pub fn type_id(this: &AnyHandle<B>) -> TypeId {
        this.ty
    }

    /// The current owner count of the referenced object.
    pub fn strong_count(this: &AnyHandle<B>) -> usize {
        B::display_count_of(&this.owner)
    }

    /// Whether two erased handles share the same object.
    pub fn ptr_eq(this: &AnyHandle<B>, other: &AnyHandle<B>) -> bool {
        this.obj == other.obj
    }

    /// Recovers the typed handle, if `T` is the recorded concrete type.
    /// On mismatch the erased handle is returned unchanged, hold included.
    pub fn downcast<T>(self) -> Result<Handle<T>, AnyHandle<B>>
    where
        T: Counted<Backend = B>,
    {
        if self.ty == TypeId::of::<T>() {
            let AnyHandle { obj, owner, .. } = self;
            Ok(Handle::from_parts(obj.cast(), owner))
        } else {
            Err(self)
        }
    }
}

impl<B: Backend> Clone for AnyHandle<B> {
    /// Makes another owner of the same object, increasing the shared counter.
    fn clone(&self) -> AnyHandle<B> {
        AnyHandle { obj: self.obj, ty: self.ty, owner: self.owner.clone() }
    }
}

impl<B: Backend> fmt::Debug for AnyHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyHandle")
            .field("type_id", &self.ty)
            .field("strong_count", &AnyHandle::strong_count(self))
            .finish()
    }
}

/// The non-owning counterpart of [`AnyHandle`].
pub struct AnyWeakHandle<B: Backend> {
    obj: NonNull<()>,
    ty: TypeId,
    owner: B::RawWeak,
}

unsafe impl<B: Backend> Send for AnyWeakHandle<B> where B::RawWeak: Send {}
unsafe impl<B: Backend> Sync for AnyWeakHandle<B> where B::RawWeak: Sync {}

impl<B: Backend> AnyWeakHandle<B> {
    pub(crate) fn from_adoption(adoption: &Adoption<B>) -> AnyWeakHandle<B> {
        AnyWeakHandle { obj: adoption.obj, ty: adoption.ty, owner: adoption.weak.clone() }
    }

    /// The recorded concrete type of the referenced object.
    pub fn type_id(this: &AnyWeakHandle<B>) -> TypeId {
        this.ty
    }

    /// Attempts to acquire an erased owning handle; fails once the owner
    /// count has reached zero.
    pub fn upgrade(&self) -> Option<AnyHandle<B>> {
        let owner = B::upgrade(&self.owner)?;
        Some(AnyHandle { obj: self.obj, ty: self.ty, owner })
    }

    /// Recovers the typed weak handle, if `T` is the recorded concrete type.
    pub fn downcast<T>(self) -> Result<WeakHandle<T>, AnyWeakHandle<B>>
    where
        T: Counted<Backend = B>,
    {
        if self.ty == TypeId::of::<T>() {
            let AnyWeakHandle { obj, owner, .. } = self;
            Ok(WeakHandle::from_parts(obj.cast(), owner))
        } else {
            Err(self)
        }
    }
}

impl<B: Backend> Clone for AnyWeakHandle<B> {
    fn clone(&self) -> AnyWeakHandle<B> {
        AnyWeakHandle { obj: self.obj, ty: self.ty, owner: self.owner.clone() }
    }
}

impl<B: Backend> fmt::Debug for AnyWeakHandle<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(AnyWeakHandle)")
    }
}
