use otsync::ot::OTSystem;
use proptest::prelude::*;

mod util;
use util::*;

/// `(is_add, value)` pairs turned into a valid sequence starting at `state`.
fn ops_from(state: i64, specs: &[(bool, i64)]) -> Vec<TestOp> {
    let mut value = state;
    let mut ops = Vec::with_capacity(specs.len());
    for &(is_add, x) in specs {
        let op = match is_add {
            true => add(x),
            false => set(value, x),
        };
        value = apply_all(value, std::slice::from_ref(&op));
        ops.push(op);
    }
    ops
}

fn specs() -> impl Strategy<Value = Vec<(bool, i64)>> {
    prop::collection::vec((any::<bool>(), -50i64..50), 0..6)
}

proptest! {
    #[test]
    fn squash_keeps_the_effect(state in -50i64..50, specs in specs()) {
        let ops = ops_from(state, &specs);
        let squashed = TestOpSystem.squash(&ops);
        prop_assert_eq!(apply_all(state, &squashed), apply_all(state, &ops));
        prop_assert!(squashed.iter().all(|op| !TestOpSystem.is_empty(op)));
    }

    #[test]
    fn squash_is_idempotent(state in -50i64..50, specs in specs()) {
        let squashed = TestOpSystem.squash(&ops_from(state, &specs));
        prop_assert_eq!(TestOpSystem.squash(&squashed), squashed);
    }

    #[test]
    fn invert_undoes(state in -50i64..50, specs in specs()) {
        let ops = ops_from(state, &specs);
        let after = apply_all(state, &ops);
        prop_assert_eq!(apply_all(after, &TestOpSystem.invert(&ops)), state);
    }

    #[test]
    fn transform_converges(state in -50i64..50, left in specs(), right in specs()) {
        let left = ops_from(state, &left);
        let right = ops_from(state, &right);
        let result = TestOpSystem.transform(&left, &right).expect("transform");
        let via_left = apply_all(apply_all(state, &left), &result.right);
        let via_right = apply_all(apply_all(state, &right), &result.left);
        prop_assert_eq!(via_left, via_right);
    }
}

#[test]
fn empty_operations_vanish() {
    assert!(TestOpSystem.squash(&[add(0), set(3, 3)]).is_empty());
    assert_eq!(TestOpSystem.squash(&[add(2), add(-2), add(5)]), vec![add(5)]);
    assert!(TestOpSystem.is_empty_seq(&[add(0)]));
}
