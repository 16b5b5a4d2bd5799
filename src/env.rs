//! Lexical environment for function bodies.
//!
//! The interpreter stack holds `let` frames (bindings) and mask frames
//! (`bindings: None`). A body sees the *collapsed view* of that stack: a
//! mask hides the innermost binding frame beneath it. Assignments to names
//! declared by a visible frame are written back to the nearest declaring
//! frame; all other assignments are local to the body.

use serde_json::Value;

use crate::continuation::{Execution, Frame};
use crate::evaluator::{run_source, EvalError, EvalValue, Scope};

/// Name the current composition value is bound to inside a body.
pub const PARAMS_BINDING: &str = "params";

/// Evaluate a function body against the execution's collapsed lexical view
/// and write mutated bindings back to their frames.
pub fn run_body(code: &str, exec: &mut Execution) -> Result<EvalValue, EvalError> {
    let view = visible_frames(&exec.cont.stack);

    let mut scope = Scope::new();
    for &index in view.iter().rev() {
        if let Frame::Let {
            bindings: Some(bindings),
        } = &exec.cont.stack[index]
        {
            for (name, value) in bindings {
                scope.insert(name.clone(), value.clone());
            }
        }
    }
    scope.insert(PARAMS_BINDING.to_owned(), exec.params.clone());

    let result = run_source(code, &mut scope)?;

    for (name, value) in &scope {
        write_back(&mut exec.cont.stack, &view, name, value);
    }
    Ok(result)
}

/// Indexes of binding frames visible through masks, nearest first.
fn visible_frames(stack: &[Frame]) -> Vec<usize> {
    let mut hidden = 0usize;
    let mut view = Vec::new();
    for (index, frame) in stack.iter().enumerate() {
        if let Frame::Let { bindings } = frame {
            match bindings {
                None => hidden += 1,
                Some(_) => {
                    if hidden == 0 {
                        view.push(index);
                    } else {
                        hidden -= 1;
                    }
                }
            }
        }
    }
    view
}

fn write_back(stack: &mut [Frame], view: &[usize], name: &str, value: &Value) {
    for &index in view {
        if let Frame::Let {
            bindings: Some(bindings),
        } = &mut stack[index]
        {
            if bindings.contains_key(name) {
                bindings.insert(name.to_owned(), value.clone());
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::continuation::Continuation;
    use serde_json::{json, Map};

    fn let_frame(entries: &[(&str, Value)]) -> Frame {
        let mut bindings = Map::new();
        for (name, value) in entries {
            bindings.insert((*name).to_owned(), value.clone());
        }
        Frame::Let {
            bindings: Some(bindings),
        }
    }

    fn execution(stack: Vec<Frame>, params: Value) -> Execution {
        let mut cont = Continuation::fresh("sess");
        cont.stack = stack;
        Execution::new(params, cont)
    }

    #[test]
    fn reads_nearest_binding_first() {
        let mut exec = execution(
            vec![
                let_frame(&[("x", json!(2))]),
                let_frame(&[("x", json!(1)), ("y", json!(10))]),
            ],
            json!({}),
        );
        let result = run_body("x + y", &mut exec).expect("eval");
        assert_eq!(result, EvalValue::Json(json!(12)));
    }

    #[test]
    fn mask_hides_the_innermost_binding() {
        let mut exec = execution(
            vec![
                Frame::Let { bindings: None },
                let_frame(&[("x", json!(2))]),
                let_frame(&[("x", json!(1))]),
            ],
            json!({}),
        );
        let result = run_body("x", &mut exec).expect("eval");
        assert_eq!(result, EvalValue::Json(json!(1)));
    }

    #[test]
    fn writes_back_to_the_nearest_declaring_frame() {
        let mut exec = execution(
            vec![
                let_frame(&[("x", json!(1))]),
                let_frame(&[("x", json!(5)), ("y", json!(0))]),
            ],
            json!({}),
        );
        run_body("x = 7; y = 3", &mut exec).expect("eval");
        assert_eq!(
            exec.cont.stack[0],
            let_frame(&[("x", json!(7))]),
        );
        assert_eq!(
            exec.cont.stack[1],
            let_frame(&[("x", json!(5)), ("y", json!(3))]),
        );
    }

    #[test]
    fn unrelated_assignments_stay_local() {
        let mut exec = execution(vec![let_frame(&[("x", json!(1))])], json!({}));
        run_body("temp = 9; x = temp", &mut exec).expect("eval");
        assert_eq!(exec.cont.stack[0], let_frame(&[("x", json!(9))]));
    }

    #[test]
    fn params_is_bound_but_not_written_back() {
        let mut exec = execution(vec![let_frame(&[("x", json!(0))])], json!({"n": 4}));
        let result = run_body("x = params.n; params", &mut exec).expect("eval");
        assert_eq!(result, EvalValue::Json(json!({"n": 4})));
        assert_eq!(exec.cont.stack[0], let_frame(&[("x", json!(4))]));
        assert_eq!(exec.params, json!({"n": 4}));
    }

    #[test]
    fn masked_frame_is_not_written_back() {
        let mut exec = execution(
            vec![
                Frame::Let { bindings: None },
                let_frame(&[("x", json!(1))]),
            ],
            json!({}),
        );
        run_body("x = 2", &mut exec).expect("assignment stays local");
        assert_eq!(exec.cont.stack[1], let_frame(&[("x", json!(1))]));
        let err = run_body("x", &mut exec).expect_err("x is hidden from reads");
        assert!(matches!(err, EvalError::UndefinedVariable(_)));
    }
}
