//! Offset invariants of the compiler over randomly shaped compositions.

use proptest::prelude::*;
use serde_json::{json, Value};

use baton::{compile, AstNode, State};

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(json!({"type": "action", "name": "a"})),
        Just(json!({"type": "function", "exec": {"code": "params"}})),
        Just(json!({"type": "dynamic"})),
        Just(json!({"type": "empty"})),
    ]
}

fn composition() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 48, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4)
                .prop_map(|c| json!({"type": "sequence", "components": c})),
            inner
                .clone()
                .prop_map(|b| json!({"type": "async", "body": b})),
            inner.clone().prop_map(|b| json!({"type": "map", "body": b})),
            (inner.clone(), inner.clone())
                .prop_map(|(b, h)| json!({"type": "try", "body": b, "handler": h})),
            (inner.clone(), inner.clone())
                .prop_map(|(b, f)| json!({"type": "finally", "body": b, "finalizer": f})),
            (inner.clone(), inner.clone(), inner.clone()).prop_map(|(t, c, a)| {
                json!({"type": "if_nosave", "test": t, "consequent": c, "alternate": a})
            }),
            (inner.clone(), inner.clone())
                .prop_map(|(t, b)| json!({"type": "while_nosave", "test": t, "body": b})),
            (inner.clone(), inner.clone())
                .prop_map(|(b, t)| json!({"type": "dowhile_nosave", "body": b, "test": t})),
            inner.clone().prop_map(
                |b| json!({"type": "let", "declarations": {"x": 1}, "components": [b]})
            ),
            inner
                .clone()
                .prop_map(|b| json!({"type": "mask", "components": [b]})),
            prop::collection::vec(inner, 1..4)
                .prop_map(|c| json!({"type": "parallel", "components": c})),
        ]
    })
}

/// Every explicit jump in the compiled list must land on a real state.
fn check_offsets(fsm: &[State]) {
    let len = fsm.len() as i64;
    let check = |index: usize, offset: i64, field: &str| {
        let target = index as i64 + offset;
        assert!(
            (0..len).contains(&target),
            "{field} at state {index} jumps to {target} outside 0..{len}"
        );
    };
    for (index, state) in fsm.iter().enumerate() {
        if let Some(next) = state.next {
            check(index, next, "next");
        }
        if let Some(then) = state.then {
            check(index, then, "then");
        }
        if let Some(alt) = state.alt {
            check(index, alt, "else");
        }
        if let Some(handler) = state.handler {
            check(index, handler, "catch");
        }
        if let Some(resume) = state.resume {
            check(index, resume, "return");
        }
        for offset in state.tasks.iter().flatten() {
            check(index, *offset, "task");
        }
    }
}

proptest! {
    #[test]
    fn compiled_jumps_stay_in_range(composition in composition()) {
        let node = AstNode::from_value(composition).expect("generated composition parses");
        let fsm = compile(&node).expect("generated composition compiles");
        prop_assert!(!fsm.is_empty());
        check_offsets(&fsm);
    }

    #[test]
    fn compiled_lists_end_on_a_default_next(composition in composition()) {
        let node = AstNode::from_value(composition).expect("generated composition parses");
        let fsm = compile(&node).expect("generated composition compiles");
        let tail = fsm.last().expect("non-empty");
        prop_assert!(tail.next.is_none(), "tail state has an explicit next");
    }
}
