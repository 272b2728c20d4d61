//! Manual reference counting for objects that are otherwise managed by
//! ordinary shared-ownership handles.
//!
//! A tracked object carries a [`SelfCounter`] field and registers it through
//! the [`Counted`] trait (usually via [`impl_counted!`]). From then on two
//! protocols coexist over one shared counter:
//!
//! * [`Handle`]s — reference-counted pointers that increment on clone and
//!   decrement on drop, like any shared-ownership handle;
//! * the manual operations of [`CountedExt`] —
//!   [`retain`](CountedExt::retain) / [`release`](CountedExt::release) /
//!   [`strong_count`](CountedExt::strong_count), invoked directly on the
//!   object by callers who hold no handle.
//!
//! Because both paths read and write the same counter, the object is
//! destroyed exactly once, precisely when the combined count reaches zero,
//! regardless of which protocol performed the final release.
//!
//! The runtimes being bridged do not expose their counters: each enabled
//! backend (see [`Backend`]) reaches the private control block of one
//! runtime representation, either through a pinned layout mirror
//! ([`ArcBackend`], [`RcBackend`]) or through the runtime's public
//! conditional-acquire operations ([`PortableBackend`]). Exactly one of them
//! is the process-wide [`DefaultBackend`], chosen at build time by cargo
//! features; individual types may override it at registration.
//!
//! ```
//! use ref_counted_self::{impl_counted, CountedExt, Handle, SelfCounter, Unshared};
//!
//! struct Gadget {
//!     label: &'static str,
//!     counter: SelfCounter,
//! }
//! impl_counted!(Gadget { counter });
//!
//! // Objects start with zero owners and no control block...
//! let gadget = Unshared::new(Gadget { label: "sprocket", counter: SelfCounter::new() });
//! assert_eq!(gadget.strong_count(), 0);
//!
//! // ...until a handle (or a bootstrapping manual retain) shares them.
//! let shared: Handle<Gadget> = gadget.into_handle();
//! assert_eq!(Handle::strong_count(&shared), 1);
//!
//! // Manual holds and handles move the same counter.
//! unsafe {
//!     assert_eq!(shared.retain(), 2);
//!     let weak = shared.weak_self().unwrap();
//!     drop(shared);
//!     assert_eq!(weak.strong_count(), 1);
//!
//!     let reacquired = weak.upgrade().unwrap();
//!     assert_eq!(Gadget::release(&*reacquired as *const Gadget), 1);
//!     // `reacquired` is now the only owner; dropping it destroys the
//!     // gadget and frees its storage.
//! }
//! ```
#![warn(unsafe_op_in_unsafe_fn)]

mod backend;
mod base;
mod bridge;
mod handle;
pub mod offset;

pub use backend::{AdoptionSlot, Backend};
pub use base::{Adoption, Retainer, SelfCounter};
pub use bridge::CountedExt;
pub use handle::{AnyHandle, AnyWeakHandle, Handle, Unshared, WeakHandle};
pub use offset::FieldOffset;

#[cfg(feature = "arc")]
mod arc;
#[cfg(feature = "arc")]
pub use arc::ArcBackend;

#[cfg(feature = "rc")]
mod rc;
#[cfg(feature = "rc")]
pub use rc::RcBackend;

#[cfg(feature = "portable")]
mod portable;
#[cfg(feature = "portable")]
pub use portable::PortableBackend;

/// The process-wide backend, selected at build time.
///
/// Exactly one shared-ownership runtime representation is in play per build;
/// the features rank `arc` over `rc` over `portable`. Types that need a
/// different runtime can still name a backend explicitly when registering
/// (`impl_counted!(Ty { field }, backend = ...)`).
#[cfg(feature = "arc")]
pub type DefaultBackend = ArcBackend;

#[cfg(all(feature = "rc", not(feature = "arc")))]
pub type DefaultBackend = RcBackend;

#[cfg(all(feature = "portable", not(feature = "arc"), not(feature = "rc")))]
pub type DefaultBackend = PortableBackend;

#[cfg(not(any(feature = "arc", feature = "rc", feature = "portable")))]
compile_error!(
    "ref-counted-self: enable at least one backend feature (`arc`, `rc` or `portable`)"
);

pub(crate) type RawShared<T> = <<T as Counted>::Backend as Backend>::RawShared;
pub(crate) type RawWeak<T> = <<T as Counted>::Backend as Backend>::RawWeak;

/// Registration of a tracked object type: names the backend and points at the
/// embedded [`SelfCounter`].
///
/// Implementing this trait is the one-time declaration a type must make
/// before any of the manual operations work on it; a type without the impl
/// simply has no such operations (the mistake is caught at build time). The
/// [`impl_counted!`] macro writes the impl.
///
/// # Safety
///
/// `self_counter` must return a reference to a counter stored inside `*self`
/// — the whole mechanism converts "a reference to the object" into "a handle
/// to exactly that object" through it. Handing out another object's counter
/// ties this object's lifetime to storage it does not own.
pub unsafe trait Counted: Sized + 'static {
    /// The bridged runtime managing this type's control block.
    type Backend: Backend;

    /// The counter field embedded in this object.
    fn self_counter(&self) -> &SelfCounter<Self::Backend>;
}

/// Marker for types that may be shared under backend `B`.
///
/// The thread-safe backends require `Send + Sync` of the objects they manage
/// (a handle or erased handle may hop threads and run the destructor there);
/// the single-threaded `rc` backend accepts any type. Blanket impls in the
/// backend modules cover every eligible type, so this trait is never
/// implemented by hand.
///
/// # Safety
///
/// An impl asserts that objects of the implementing type may be owned, and
/// eventually destroyed, from any thread backend `B`'s handles can reach.
pub unsafe trait Shareable<B: Backend> {}

/// Registers a type as tracked: writes its [`Counted`] impl.
///
/// ```
/// use ref_counted_self::{impl_counted, SelfCounter};
///
/// struct Widget {
///     counter: SelfCounter,
/// }
/// impl_counted!(Widget { counter });
/// ```
///
/// A backend other than [`DefaultBackend`] can be named explicitly:
///
/// ```
/// use ref_counted_self::{impl_counted, RcBackend, SelfCounter};
///
/// struct LocalWidget {
///     counter: SelfCounter<RcBackend>,
/// }
/// impl_counted!(LocalWidget { counter }, backend = RcBackend);
/// ```
#[macro_export]
macro_rules! impl_counted {
    ($ty:ty { $field:ident }) => {
        $crate::impl_counted!($ty { $field }, backend = $crate::DefaultBackend);
    };
    ($ty:ty { $field:ident }, backend = $backend:ty) => {
        unsafe impl $crate::Counted for $ty {
            type Backend = $backend;

            #[inline]
            fn self_counter(&self) -> &$crate::SelfCounter<$backend> {
                &self.$field
            }
        }
    };
}
