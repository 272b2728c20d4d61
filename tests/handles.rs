//! Handle surface: the unique pre-sharing stage and the trait ladder.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use ref_counted_self::{impl_counted, CountedExt, Handle, SelfCounter, Unshared};

struct Score {
    value: i32,
    counter: SelfCounter,
}
impl_counted!(Score { counter });

impl Score {
    fn new(value: i32) -> Score {
        Score { value, counter: SelfCounter::new() }
    }
}

impl PartialEq for Score {
    fn eq(&self, other: &Score) -> bool {
        self.value == other.value
    }
}
impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Score) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Score {
    fn cmp(&self, other: &Score) -> std::cmp::Ordering {
        self.value.cmp(&other.value)
    }
}

impl Hash for Score {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

impl fmt::Debug for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Score({})", self.value)
    }
}

#[test]
fn unshared_behaves_like_a_unique_box_until_adopted() {
    let mut unshared = Unshared::new(Score::new(1));
    assert_eq!(unshared.value, 1);
    assert_eq!(unshared.strong_count(), 0);

    // Unique stage: mutation is allowed.
    unshared.get_mut().expect("not yet shared").value = 5;
    assert_eq!(unshared.value, 5);

    // A bootstrapping retain adopts the storage out from under the unique
    // stage; mutable access closes.
    unsafe {
        assert_eq!(unshared.retain(), 1);
    }
    assert!(unshared.get_mut().is_none());

    // Documented hand-off: consume the unique stage before the final
    // release.
    let obj = unshared.into_raw();
    unsafe {
        assert_eq!(Score::release(obj), 0);
    }
}

#[test]
fn dropping_an_unshared_object_frees_it_without_a_count() {
    // No control block is ever created; Unshared itself owns the storage.
    let unshared = Unshared::new(Score::new(3));
    assert_eq!(unshared.strong_count(), 0);
    drop(unshared);
}

#[test]
fn into_handle_carries_the_unique_value_over() {
    let mut unshared = Unshared::new(Score::new(2));
    unshared.get_mut().unwrap().value = 9;

    let handle = unshared.into_handle();
    assert_eq!(Handle::strong_count(&handle), 1);
    assert_eq!(handle.value, 9);
}

#[test]
fn handles_compare_hash_and_print_by_value() {
    let a = Handle::new(Score::new(10));
    let b = Handle::new(Score::new(10));
    let c = Handle::new(Score::new(11));

    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a < c);
    assert!(!Handle::ptr_eq(&a, &b), "equal values, distinct objects");

    let hash_of = |h: &Handle<Score>| {
        let mut hasher = DefaultHasher::new();
        h.hash(&mut hasher);
        hasher.finish()
    };
    assert_eq!(hash_of(&a), hash_of(&b));

    assert_eq!(format!("{a}"), "10");
    assert_eq!(format!("{a:?}"), "Score(10)");
    assert_eq!(format!("{:?}", Handle::downgrade(&a)), "(WeakHandle)");
}

#[test]
fn downgrade_and_weak_self_reference_the_same_object() {
    let handle = Handle::new(Score::new(4));
    let from_handle = Handle::downgrade(&handle);
    let from_object = handle.weak_self().expect("shared object");

    assert!(ref_counted_self::WeakHandle::ptr_eq(&from_handle, &from_object));
    assert_eq!(from_handle.strong_count(), 1);
}

#[test]
fn cloning_the_object_does_not_clone_its_identity() {
    #[derive(Clone)]
    struct Tag {
        name: &'static str,
        counter: SelfCounter,
    }
    impl_counted!(Tag { counter });

    let original = Handle::new(Tag { name: "original", counter: SelfCounter::new() });
    assert_eq!(Handle::strong_count(&original), 1);

    // The copy starts life unshared: a fresh counter, zero owners.
    let copy = Tag::clone(&original);
    assert_eq!(copy.strong_count(), 0);
    assert_eq!(copy.name, "original");
    assert_eq!(Handle::strong_count(&original), 1);
}
