//! Property tests for the clock-vector algebra: merge computes a
//! componentwise maximum, and happens-before behaves like a partial order.

use c11check::ClockVector;
use proptest::prelude::*;

/// Build a clock vector with the given components.
fn cv_from(components: &[u64]) -> ClockVector {
    let mut cv = ClockVector::new(None, 0, 0);
    for (tid, &c) in components.iter().enumerate() {
        cv.merge(&ClockVector::new(None, tid, c));
    }
    cv
}

fn components() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..50, 1..6)
}

/// Componentwise equality over the union of tracked threads; vectors may
/// differ in trailing zeros.
fn same_knowledge(a: &ClockVector, b: &ClockVector) -> bool {
    (0..a.len().max(b.len())).all(|tid| a.get(tid) == b.get(tid))
}

proptest! {
    #[test]
    fn merge_is_componentwise_max(a in components(), b in components()) {
        let mut merged = cv_from(&a);
        merged.merge(&cv_from(&b));
        for tid in 0..a.len().max(b.len()) {
            let expect = a.get(tid).copied().unwrap_or(0).max(b.get(tid).copied().unwrap_or(0));
            prop_assert_eq!(merged.get(tid), expect);
        }
    }

    #[test]
    fn merge_result_is_order_independent(a in components(), b in components()) {
        let mut ab = cv_from(&a);
        ab.merge(&cv_from(&b));
        let mut ba = cv_from(&b);
        ba.merge(&cv_from(&a));
        prop_assert!(same_knowledge(&ab, &ba));
    }

    #[test]
    fn merge_reports_growth_iff_not_dominated(a in components(), b in components()) {
        let target = cv_from(&a);
        let other = cv_from(&b);
        let mut merged = target.clone();
        let grew = merged.merge(&other);
        prop_assert_eq!(grew, !other.happens_before(&target));
    }

    #[test]
    fn merge_is_idempotent(a in components(), b in components()) {
        let mut merged = cv_from(&a);
        let other = cv_from(&b);
        merged.merge(&other);
        prop_assert!(!merged.merge(&other));
    }

    #[test]
    fn other_happens_before_merge_result(a in components(), b in components()) {
        let other = cv_from(&b);
        let mut merged = cv_from(&a);
        merged.merge(&other);
        prop_assert!(other.happens_before(&merged));
        prop_assert!(cv_from(&a).happens_before(&merged));
    }

    #[test]
    fn happens_before_is_reflexive(a in components()) {
        let cv = cv_from(&a);
        prop_assert!(cv.happens_before(&cv));
    }

    #[test]
    fn happens_before_is_antisymmetric(a in components(), b in components()) {
        let x = cv_from(&a);
        let y = cv_from(&b);
        if x.happens_before(&y) && y.happens_before(&x) {
            prop_assert!(same_knowledge(&x, &y));
        }
    }

    #[test]
    fn happens_before_is_transitive(a in components(), b in components(), c in components()) {
        let x = cv_from(&a);
        let mut y = cv_from(&b);
        y.merge(&x); // force x <= y
        let mut z = cv_from(&c);
        z.merge(&y); // force y <= z
        prop_assert!(x.happens_before(&z));
    }

    #[test]
    fn synchronized_since_matches_components(a in components(), tid in 0usize..6, seq in 0u64..60) {
        let cv = cv_from(&a);
        prop_assert_eq!(cv.synchronized_since(tid, seq), seq <= cv.get(tid));
    }
}
