//! Randomized accounting properties.

use memtrack_mem::Tracker;
use proptest::prelude::*;
use std::sync::Arc;
use std::thread;

#[derive(Debug, Clone, Copy)]
enum Op {
    Alloc(i64),
    Free(i64),
    Realloc(i64, i64),
}

impl Op {
    fn delta(self) -> i64 {
        match self {
            Op::Alloc(n) => n,
            Op::Free(n) => -n,
            Op::Realloc(old, new) => new - old,
        }
    }

    fn apply(self, tracker: &Tracker) {
        match self {
            Op::Alloc(n) => tracker.alloc(n).unwrap(),
            Op::Free(n) => tracker.free(n),
            Op::Realloc(old, new) => tracker.realloc(old, new).unwrap(),
        }
    }
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0i64..1 << 20).prop_map(Op::Alloc),
        (0i64..1 << 20).prop_map(Op::Free),
        (0i64..1 << 20, 0i64..1 << 20).prop_map(|(a, b)| Op::Realloc(a, b)),
    ]
}

fn unlimited() -> Tracker {
    let mut t = Tracker::new();
    t.set_metric(None);
    t.set_log_peak_on_drop(false);
    t
}

proptest! {
    #[test]
    fn sequential_amount_and_peak_are_exact(ops in prop::collection::vec(op(), 0..200)) {
        let tracker = unlimited();
        let mut sum = 0i64;
        let mut max_prefix = 0i64;
        for op in &ops {
            op.apply(&tracker);
            sum += op.delta();
            max_prefix = max_prefix.max(sum);
        }
        prop_assert_eq!(tracker.get(), sum);
        prop_assert_eq!(tracker.peak(), max_prefix);
    }

    #[test]
    fn concurrent_amount_converges(
        per_thread in prop::collection::vec(prop::collection::vec(op(), 0..100), 1..6)
    ) {
        let root = Arc::new(unlimited());
        let mut leaf = unlimited();
        leaf.set_next(Some(Arc::clone(&root)));
        let leaf = Arc::new(leaf);

        let handles: Vec<_> = per_thread
            .iter()
            .cloned()
            .map(|ops| {
                let leaf = Arc::clone(&leaf);
                thread::spawn(move || {
                    for op in ops {
                        op.apply(&leaf);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("Thread panicked");
        }

        let total: i64 = per_thread.iter().flatten().map(|op| op.delta()).sum();
        let upper: i64 = per_thread
            .iter()
            .flatten()
            .map(|op| op.delta().max(0))
            .sum();

        prop_assert_eq!(leaf.get(), total);
        prop_assert_eq!(root.get(), total);
        prop_assert!(leaf.peak() >= total);
        prop_assert!(leaf.peak() <= upper);
    }
}
