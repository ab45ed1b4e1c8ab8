mod common;

use std::sync::Arc;
use std::thread;

use common::{init_logger, Calls, Probe};
use rand::Rng;
use refbase::{HistoryTracker, RefObject, Sp, TrackOp, Wp};

const THREADS: usize = 6;
const OPS: usize = 2_000;

/// Each thread shuffles its own strong and weak pointers to one shared object.
fn churn(owner: &Sp<Probe>) {
    let mut rng = rand::thread_rng();
    let mut strong = vec![owner.clone()];
    let mut weak: Vec<Wp<Probe>> = Vec::new();
    for _ in 0..OPS {
        match rng.gen_range(0..6) {
            0 => {
                if let Some(sp) = strong.first() {
                    strong.push(sp.clone());
                }
            }
            1 => {
                if strong.len() > 1 {
                    let i = rng.gen_range(0..strong.len());
                    strong.swap_remove(i);
                }
            }
            2 => {
                if let Some(sp) = strong.last() {
                    weak.push(Sp::downgrade(sp));
                }
            }
            3 => {
                if let Some(wp) = weak.last() {
                    weak.push(wp.clone());
                }
            }
            4 => {
                if !weak.is_empty() {
                    let i = rng.gen_range(0..weak.len());
                    weak.swap_remove(i);
                }
            }
            _ => {
                if let Some(wp) = weak.first() {
                    let sp = wp.promote().expect("the object still has owners");
                    assert_eq!(sp.value, 42);
                    strong.push(sp);
                }
            }
        }
    }
}

fn run(extended: bool) {
    init_logger();
    let tracker = Arc::new(HistoryTracker::with_capacity(1 << 22));
    let calls = Arc::new(Calls::default());
    let probe = if extended {
        Probe::extended(&tracker, &calls)
    } else {
        Probe::new(&tracker, &calls)
    };
    let owner = Sp::new(probe);
    let observer = Sp::downgrade(&owner);

    thread::scope(|s| {
        for _ in 0..THREADS {
            s.spawn(|| churn(&owner));
        }
    });
    assert_eq!(calls.drops(), 0);
    assert_eq!(Sp::strong_count(&owner), 1);
    assert_eq!(owner.ref_base().get_wptr_ref_count(), 2);

    drop(owner);
    assert_eq!(calls.first(), 1);
    if extended {
        assert_eq!(calls.drops(), 0);
        let revived = observer.promote().unwrap();
        drop(revived);
        assert_eq!(calls.last(), 2);
    } else {
        assert_eq!(calls.drops(), 1);
        assert!(observer.promote().is_none());
    }
    drop(observer);

    assert_eq!(calls.drops(), 1);
    assert_eq!(tracker.count(TrackOp::Destroy), 1);
    assert_eq!(tracker.count(TrackOp::Free), 1);
    assert_eq!(tracker.verify(), Ok(()));
}

#[test]
fn churn_normal_lifetime() {
    run(false);
}

#[test]
fn churn_extended_lifetime() {
    run(true);
}

#[test]
fn racing_promotion_and_release() {
    init_logger();
    for _ in 0..200 {
        let tracker = Arc::new(HistoryTracker::new());
        let calls = Arc::new(Calls::default());
        let owner = Sp::new(Probe::new(&tracker, &calls));
        let weak = Sp::downgrade(&owner);
        let promoted = thread::scope(|s| {
            let promoter = s.spawn(|| weak.promote());
            drop(owner);
            promoter.join().unwrap()
        });
        match promoted {
            Some(sp) => {
                assert_eq!(calls.drops(), 0);
                drop(sp);
            }
            None => assert!(weak.is_expired()),
        }
        assert_eq!(calls.drops(), 1);
        drop(weak);
        assert_eq!(tracker.count(TrackOp::Destroy), 1);
        assert_eq!(tracker.count(TrackOp::Free), 1);
    }
}
