//! The two ownership protocols against one counter, on the default backend.

use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;

use ref_counted_self::{impl_counted, CountedExt, Handle, SelfCounter, Unshared};

struct Probe {
    drops: Arc<AtomicUsize>,
    counter: SelfCounter,
}
impl_counted!(Probe { counter });

impl Probe {
    fn new(drops: &Arc<AtomicUsize>) -> Probe {
        Probe { drops: drops.clone(), counter: SelfCounter::new() }
    }
}

impl Drop for Probe {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Relaxed);
    }
}

#[test]
fn manual_holds_and_handles_share_one_counter() {
    let _ = env_logger::builder().is_test(true).try_init();
    let drops = Arc::new(AtomicUsize::new(0));

    let obj = Unshared::new(Probe::new(&drops)).into_raw();
    let probe = unsafe { &*obj };

    // Zero owners, no control block.
    assert_eq!(probe.strong_count(), 0);
    assert!(probe.weak_self().is_none());
    assert!(probe.shared_self().is_none());

    unsafe {
        assert_eq!(probe.retain(), 1);
        assert_eq!(probe.strong_count(), 1);
        assert_eq!(probe.retain(), 2);

        // One handle constructed externally on top of the manual holds.
        let handle = probe.shared_self().expect("object has owners");
        assert_eq!(probe.strong_count(), 3);
        drop(handle);
        assert_eq!(probe.strong_count(), 2);

        assert_eq!(Probe::release(obj), 1);
        assert_eq!(drops.load(Relaxed), 0, "an owner remains, no destruction");
        assert_eq!(Probe::release(obj), 0);
    }

    assert_eq!(drops.load(Relaxed), 1, "final release destroys exactly once");
}

#[test]
fn bootstrap_retain_creates_the_control_block_exactly_once() {
    let drops = Arc::new(AtomicUsize::new(0));
    let obj = Unshared::new(Probe::new(&drops)).into_raw();
    let probe = unsafe { &*obj };

    unsafe {
        // The first retain materializes; the weak back-reference appears.
        assert_eq!(probe.retain(), 1);
        let weak = probe.weak_self().expect("control block exists now");
        assert_eq!(weak.strong_count(), 1);

        // A later retain joins the same control block.
        assert_eq!(probe.retain(), 2);
        assert_eq!(weak.strong_count(), 2);

        assert_eq!(Probe::release(obj), 1);
        assert_eq!(Probe::release(obj), 0);
        assert_eq!(weak.strong_count(), 0);
        assert!(weak.upgrade().is_none());
    }
    assert_eq!(drops.load(Relaxed), 1);
}

#[test]
fn handle_only_lifecycle_counts_from_one_to_zero() {
    let drops = Arc::new(AtomicUsize::new(0));

    let handle = Handle::new(Probe::new(&drops));
    assert_eq!(Handle::strong_count(&handle), 1);

    let second = handle.clone();
    assert_eq!(Handle::strong_count(&handle), 2);
    assert_eq!(handle.strong_count(), 2, "manual query sees handle owners");

    let weak = handle.weak_self().expect("shared object");
    drop(second);
    assert_eq!(weak.strong_count(), 1);

    drop(handle);
    assert_eq!(weak.strong_count(), 0);
    assert_eq!(drops.load(Relaxed), 1);
}

#[test]
fn mixed_interleaving_matches_net_outstanding_holds() {
    let drops = Arc::new(AtomicUsize::new(0));
    let obj = Unshared::new(Probe::new(&drops)).into_raw();
    let probe = unsafe { &*obj };

    unsafe {
        let mut expected = 0usize;
        let mut handles = Vec::new();

        for round in 0..4 {
            assert_eq!(probe.retain(), expected + 1);
            expected += 1;

            let handle = probe.shared_self().unwrap();
            expected += 1;
            assert_eq!(probe.strong_count(), expected);
            handles.push(handle);

            if round % 2 == 0 {
                handles.pop();
                expected -= 1;
                assert_eq!(probe.strong_count(), expected);
            }
        }

        // expected = 4 manual holds + 2 surviving handles.
        assert_eq!(expected, 6);
        drop(handles);
        assert_eq!(probe.strong_count(), 4);

        for remaining in (0..4).rev() {
            assert_eq!(Probe::release(obj), remaining);
        }
    }
    assert_eq!(drops.load(Relaxed), 1);
}

#[test]
fn weak_round_trip_reacquires_the_same_object() {
    let drops = Arc::new(AtomicUsize::new(0));

    let handle = Handle::new(Probe::new(&drops));
    let weak = handle.weak_self().expect("shared object");

    let reacquired = weak.upgrade().expect("still owned");
    assert_eq!(Handle::strong_count(&handle), 2, "upgrade added one owner");
    assert!(Handle::ptr_eq(&handle, &reacquired));

    drop(handle);
    drop(reacquired);
    assert_eq!(drops.load(Relaxed), 1);
    assert!(weak.upgrade().is_none(), "no resurrection after the last owner");
}
