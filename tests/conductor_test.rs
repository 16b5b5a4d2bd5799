//! End-to-end composition runs on the local platform.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use baton::{action, ActionCallable, AstNode, LocalPlatform};

fn platform(composition: Value, actions: Vec<(&str, ActionCallable)>) -> LocalPlatform {
    let ast = AstNode::from_value(composition).expect("composition should parse");
    let actions: HashMap<String, ActionCallable> = actions
        .into_iter()
        .map(|(name, callable)| (name.to_owned(), callable))
        .collect();
    LocalPlatform::new(&ast, actions).expect("composition should compile")
}

fn returns(value: Value) -> ActionCallable {
    action(move |_| Ok(value.clone()))
}

#[tokio::test]
async fn sequence_runs_a_single_action() {
    let platform = platform(
        json!({
            "type": "sequence",
            "components": [{"type": "action", "name": "A"}],
        }),
        vec![("A", returns(json!({"x": 2})))],
    );
    let result = platform.run(json!({"x": 1})).await;
    assert_eq!(result, json!({"params": {"x": 2}}));
}

#[tokio::test]
async fn actions_receive_the_previous_result() {
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let record = {
        let seen = seen.clone();
        action(move |params| {
            seen.lock().expect("lock").push(params.clone());
            let x = params["x"].as_i64().unwrap_or(0);
            Ok(json!({"x": x + 1}))
        })
    };
    let platform = platform(
        json!({
            "type": "sequence",
            "components": [
                {"type": "action", "name": "Inc"},
                {"type": "action", "name": "Inc"},
            ],
        }),
        vec![("Inc", record)],
    );
    let result = platform.run(json!({"x": 0})).await;
    assert_eq!(result, json!({"params": {"x": 2}}));
    assert_eq!(
        *seen.lock().expect("lock"),
        vec![json!({"x": 0}), json!({"x": 1})]
    );
}

#[tokio::test]
async fn if_takes_the_consequent_on_a_true_test() {
    let alternate_ran = Arc::new(AtomicBool::new(false));
    let never = {
        let flag = alternate_ran.clone();
        action(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(json!({"ran": "N"}))
        })
    };
    let platform = platform(
        json!({
            "type": "if_nosave",
            "test": {"type": "action", "name": "T"},
            "consequent": {"type": "action", "name": "Y"},
            "alternate": {"type": "action", "name": "N"},
        }),
        vec![
            ("T", returns(json!({"value": true}))),
            ("Y", returns(json!({"ran": "Y"}))),
            ("N", never),
        ],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"ran": "Y"}}));
    assert!(!alternate_ran.load(Ordering::SeqCst));
}

#[tokio::test]
async fn if_takes_the_alternate_on_a_false_test() {
    let platform = platform(
        json!({
            "type": "if_nosave",
            "test": {"type": "action", "name": "T"},
            "consequent": {"type": "action", "name": "Y"},
            "alternate": {"type": "action", "name": "N"},
        }),
        vec![
            ("T", returns(json!({"value": 0}))),
            ("Y", returns(json!({"ran": "Y"}))),
            ("N", returns(json!({"ran": "N"}))),
        ],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"ran": "N"}}));
}

#[tokio::test]
async fn try_routes_the_error_to_the_handler() {
    let handler_input = Arc::new(Mutex::new(None::<Value>));
    let handler = {
        let input = handler_input.clone();
        action(move |params| {
            *input.lock().expect("lock") = Some(params);
            Ok(json!({"recovered": true}))
        })
    };
    let platform = platform(
        json!({
            "type": "try",
            "body": {"type": "action", "name": "F"},
            "handler": {"type": "action", "name": "H"},
        }),
        vec![("F", returns(json!({"error": "e"}))), ("H", handler)],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"recovered": true}}));
    assert_eq!(
        *handler_input.lock().expect("lock"),
        Some(json!({"error": "e"}))
    );
}

#[tokio::test]
async fn error_skips_the_rest_of_the_try_body() {
    let skipped = Arc::new(AtomicBool::new(false));
    let never = {
        let flag = skipped.clone();
        action(move |_| {
            flag.store(true, Ordering::SeqCst);
            Ok(json!({}))
        })
    };
    let platform = platform(
        json!({
            "type": "try",
            "body": {
                "type": "sequence",
                "components": [
                    {"type": "action", "name": "F"},
                    {"type": "action", "name": "Never"},
                ],
            },
            "handler": {"type": "action", "name": "H"},
        }),
        vec![
            ("F", returns(json!({"error": "boom", "partial": 1}))),
            ("Never", never),
            ("H", returns(json!({"handled": true}))),
        ],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"handled": true}}));
    assert!(!skipped.load(Ordering::SeqCst));
}

#[tokio::test]
async fn uncaught_errors_become_the_final_result() {
    let platform = platform(
        json!({
            "type": "sequence",
            "components": [{"type": "action", "name": "F"}],
        }),
        vec![("F", returns(json!({"error": "boom", "detail": "x"})))],
    );
    let result = platform.run(json!({})).await;
    // siblings are dropped with the error
    assert_eq!(result, json!({"error": "boom"}));
}

#[tokio::test]
async fn finally_runs_the_finalizer_on_both_paths() {
    let finalizer_input = Arc::new(Mutex::new(Vec::<Value>::new()));
    let finalizer = {
        let input = finalizer_input.clone();
        action(move |params| {
            input.lock().expect("lock").push(params.clone());
            Ok(json!({"cleaned": true}))
        })
    };

    let failing = platform(
        json!({
            "type": "finally",
            "body": {"type": "action", "name": "F"},
            "finalizer": {"type": "action", "name": "Fin"},
        }),
        vec![("F", returns(json!({"error": "e"}))), ("Fin", finalizer.clone())],
    );
    let result = failing.run(json!({})).await;
    assert_eq!(result, json!({"params": {"cleaned": true}}));

    let succeeding = platform(
        json!({
            "type": "finally",
            "body": {"type": "action", "name": "F"},
            "finalizer": {"type": "action", "name": "Fin"},
        }),
        vec![("F", returns(json!({"x": 1}))), ("Fin", finalizer)],
    );
    succeeding.run(json!({})).await;

    assert_eq!(
        *finalizer_input.lock().expect("lock"),
        vec![json!({"error": "e"}), json!({"x": 1})]
    );
}

#[tokio::test]
async fn let_scopes_function_mutations() {
    let platform = platform(
        json!({
            "type": "let",
            "declarations": {"x": 1},
            "components": [
                {"type": "function", "exec": {"code": "x = x + 1"}},
                {"type": "function", "exec": {"code": "x"}},
            ],
        }),
        vec![],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"value": 2}}));
}

#[tokio::test]
async fn let_bindings_survive_action_round_trips() {
    let platform = platform(
        json!({
            "type": "let",
            "declarations": {"n": 1},
            "components": [
                {"type": "function", "exec": {"code": "n = n + params.x; params"}},
                {"type": "action", "name": "A"},
                {"type": "function", "exec": {"code": "n"}},
            ],
        }),
        vec![("A", returns(json!({"x": 100})))],
    );
    let result = platform.run(json!({"x": 2})).await;
    assert_eq!(result, json!({"params": {"value": 3}}));
}

#[tokio::test]
async fn mask_hides_the_inner_binding() {
    let platform = platform(
        json!({
            "type": "let",
            "declarations": {"x": "outer"},
            "components": [{
                "type": "let",
                "declarations": {"x": "inner"},
                "components": [{
                    "type": "mask",
                    "components": [{"type": "function", "exec": {"code": "x"}}],
                }],
            }],
        }),
        vec![],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"value": "outer"}}));
}

#[tokio::test]
async fn while_loops_until_the_test_fails() {
    let platform = platform(
        json!({
            "type": "let",
            "declarations": {"i": 0},
            "components": [
                {
                    "type": "while_nosave",
                    "test": {"type": "function", "exec": {"code": "{value: i < 3}"}},
                    "body": {"type": "function", "exec": {"code": "i = i + 1"}},
                },
                {"type": "function", "exec": {"code": "i"}},
            ],
        }),
        vec![],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"value": 3}}));
}

#[tokio::test]
async fn dowhile_runs_the_body_at_least_once() {
    let platform = platform(
        json!({
            "type": "let",
            "declarations": {"i": 0},
            "components": [
                {
                    "type": "dowhile_nosave",
                    "body": {"type": "function", "exec": {"code": "i = i + 1"}},
                    "test": {"type": "function", "exec": {"code": "{value: false}"}},
                },
                {"type": "function", "exec": {"code": "i"}},
            ],
        }),
        vec![],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"value": 1}}));
}

#[tokio::test]
async fn function_errors_unwind_to_the_handler() {
    let platform = platform(
        json!({
            "type": "try",
            "body": {"type": "function", "exec": {"code": "{error: 'from function'}"}},
            "handler": {"type": "function", "exec": {"code": "{caught: params.error}"}},
        }),
        vec![],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"caught": "from function"}}));
}

#[tokio::test]
async fn function_returning_a_function_is_an_error() {
    let platform = platform(
        json!({
            "type": "function",
            "exec": {"code": "len"},
        }),
        vec![],
    );
    let result = platform.run(json!({})).await;
    let message = result["error"].as_str().expect("error message");
    assert!(message.contains("function value"), "got: {message}");
}

#[tokio::test]
async fn dynamic_invokes_the_named_action() {
    let platform = platform(
        json!({"type": "dynamic"}),
        vec![("D", returns(json!({"ok": true})))],
    );
    let result = platform
        .run(json!({"type": "action", "name": "D", "params": {"q": 1}}))
        .await;
    assert_eq!(result, json!({"params": {"ok": true}}));
}

#[tokio::test]
async fn dynamic_rejects_malformed_requests() {
    let platform = platform(json!({"type": "dynamic"}), vec![]);
    let result = platform.run(json!({"name": "D"})).await;
    let message = result["error"].as_str().expect("error message");
    assert!(message.contains("dynamic"), "got: {message}");
}

#[tokio::test]
async fn unknown_actions_surface_as_errors() {
    let platform = platform(
        json!({
            "type": "try",
            "body": {"type": "action", "name": "Ghost"},
            "handler": {"type": "function", "exec": {"code": "{caught: params.error}"}},
        }),
        vec![],
    );
    let result = platform.run(json!({})).await;
    let caught = result["params"]["caught"].as_str().expect("caught message");
    assert!(caught.contains("Ghost"), "got: {caught}");
}

#[tokio::test]
async fn scalar_action_results_are_wrapped() {
    let platform = platform(
        json!({
            "type": "sequence",
            "components": [{"type": "action", "name": "Scalar"}],
        }),
        vec![("Scalar", returns(json!(41)))],
    );
    let result = platform.run(json!({})).await;
    assert_eq!(result, json!({"params": {"value": 41}}));
}
