//! Tree-walking evaluator for inline function bodies.
//!
//! Evaluates parsed statements against a flat variable scope of JSON
//! values. Coercions follow the host language the composer targets:
//! truthiness is value-based, `&&`/`||` return an operand, `+` concatenates
//! when either side is a string.

use std::collections::HashMap;

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::parser::{parse, BinaryOp, Expr, ParseError, Program, Stmt, UnaryOp};

/// Variable scope a body is evaluated against.
pub type Scope = HashMap<String, Value>;

/// Errors raised while evaluating a function body.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{0} is not defined")]
    UndefinedVariable(String),

    #[error("{0} is not a function")]
    UndefinedFunction(String),

    #[error("{0}")]
    Evaluation(String),
}

/// Result of evaluating a body: no value, a JSON value, or a bare builtin
/// function reference.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalValue {
    Undefined,
    Json(Value),
    Function(&'static str),
}

const BUILTINS: &[&str] = &["abs", "concat", "keys", "len", "max", "min", "values"];

/// Parse and evaluate a body against `scope`, mutating it in place.
pub fn run_source(source: &str, scope: &mut Scope) -> Result<EvalValue, EvalError> {
    let program = parse(source)?;
    eval_program(&program, scope)
}

/// Evaluate a parsed body. The body's value is its last expression
/// statement's value; assignments yield no value.
pub fn eval_program(program: &Program, scope: &mut Scope) -> Result<EvalValue, EvalError> {
    let mut last = EvalValue::Undefined;
    for statement in program {
        match statement {
            Stmt::Assign { name, expr } => {
                let value = eval_json(expr, scope)?;
                scope.insert(name.clone(), value);
                last = EvalValue::Undefined;
            }
            Stmt::Expr(expr) => {
                last = eval(expr, scope)?;
            }
        }
    }
    Ok(last)
}

/// Truthiness of a JSON value: null, false, zero, and the empty string are
/// falsy; arrays and objects are always truthy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn eval(expr: &Expr, scope: &mut Scope) -> Result<EvalValue, EvalError> {
    match expr {
        Expr::Ident(name) => match scope.get(name) {
            Some(value) => Ok(EvalValue::Json(value.clone())),
            None => BUILTINS
                .iter()
                .copied()
                .find(|b| *b == name.as_str())
                .map(EvalValue::Function)
                .ok_or_else(|| EvalError::UndefinedVariable(name.clone())),
        },
        _ => eval_json(expr, scope).map(EvalValue::Json),
    }
}

fn eval_json(expr: &Expr, scope: &mut Scope) -> Result<Value, EvalError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Ident(name) => match eval(expr, scope)? {
            EvalValue::Json(value) => Ok(value),
            _ => Err(EvalError::Evaluation(format!(
                "{name} is a function, not a value"
            ))),
        },
        Expr::Array(elements) => {
            let mut values = Vec::with_capacity(elements.len());
            for element in elements {
                values.push(eval_json(element, scope)?);
            }
            Ok(Value::Array(values))
        }
        Expr::Object(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval_json(value, scope)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Unary { op, operand } => {
            let value = eval_json(operand, scope)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!is_truthy(&value))),
                UnaryOp::Neg => match &value {
                    Value::Number(n) if n.is_i64() => {
                        Ok(Value::from(-n.as_i64().expect("checked i64")))
                    }
                    Value::Number(n) => n
                        .as_f64()
                        .and_then(|f| Number::from_f64(-f))
                        .map(Value::Number)
                        .ok_or_else(|| {
                            EvalError::Evaluation("cannot negate value".to_owned())
                        }),
                    _ => Err(EvalError::Evaluation(
                        "cannot negate a non-numeric value".to_owned(),
                    )),
                },
            }
        }
        Expr::Binary { op, left, right } => eval_binary(*op, left, right, scope),
        Expr::Ternary {
            test,
            consequent,
            alternate,
        } => {
            let test = eval_json(test, scope)?;
            if is_truthy(&test) {
                eval_json(consequent, scope)
            } else {
                eval_json(alternate, scope)
            }
        }
        Expr::Member { object, name } => {
            let object = eval_json(object, scope)?;
            Ok(object.get(name).cloned().unwrap_or(Value::Null))
        }
        Expr::Index { object, index } => {
            let object = eval_json(object, scope)?;
            let index = eval_json(index, scope)?;
            match (&object, &index) {
                (Value::Array(items), Value::Number(n)) => {
                    let i = n.as_u64().ok_or_else(|| {
                        EvalError::Evaluation("array index must be a non-negative integer".into())
                    })? as usize;
                    Ok(items.get(i).cloned().unwrap_or(Value::Null))
                }
                (Value::Object(map), Value::String(key)) => {
                    Ok(map.get(key).cloned().unwrap_or(Value::Null))
                }
                (Value::String(s), Value::Number(n)) => Ok(n
                    .as_u64()
                    .and_then(|i| s.chars().nth(i as usize))
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or(Value::Null)),
                _ => Err(EvalError::Evaluation(
                    "value cannot be indexed with that key".to_owned(),
                )),
            }
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_json(arg, scope)?);
            }
            call_builtin(name, &values)
        }
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    scope: &mut Scope,
) -> Result<Value, EvalError> {
    // && and || short-circuit and return an operand
    if op == BinaryOp::And {
        let left = eval_json(left, scope)?;
        return if is_truthy(&left) {
            eval_json(right, scope)
        } else {
            Ok(left)
        };
    }
    if op == BinaryOp::Or {
        let left = eval_json(left, scope)?;
        return if is_truthy(&left) {
            Ok(left)
        } else {
            eval_json(right, scope)
        };
    }

    let left = eval_json(left, scope)?;
    let right = eval_json(right, scope)?;
    match op {
        BinaryOp::Add => apply_add(&left, &right),
        BinaryOp::Sub => numeric(op, &left, &right, |a, b| a - b, |a, b| a.checked_sub(b)),
        BinaryOp::Mul => numeric(op, &left, &right, |a, b| a * b, |a, b| a.checked_mul(b)),
        BinaryOp::Div => apply_div(&left, &right),
        BinaryOp::Rem => numeric(op, &left, &right, |a, b| a % b, |a, b| a.checked_rem(b)),
        BinaryOp::Eq => Ok(Value::Bool(loose_eq(&left, &right))),
        BinaryOp::Ne => Ok(Value::Bool(!loose_eq(&left, &right))),
        BinaryOp::Lt => compare(&left, &right, |ord| ord == std::cmp::Ordering::Less),
        BinaryOp::Le => compare(&left, &right, |ord| ord != std::cmp::Ordering::Greater),
        BinaryOp::Gt => compare(&left, &right, |ord| ord == std::cmp::Ordering::Greater),
        BinaryOp::Ge => compare(&left, &right, |ord| ord != std::cmp::Ordering::Less),
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn apply_add(left: &Value, right: &Value) -> Result<Value, EvalError> {
    if let (Value::String(_), _) | (_, Value::String(_)) = (left, right) {
        return Ok(Value::String(format!(
            "{}{}",
            stringify(left),
            stringify(right)
        )));
    }
    numeric(
        BinaryOp::Add,
        left,
        right,
        |a, b| a + b,
        |a, b| a.checked_add(b),
    )
}

fn apply_div(left: &Value, right: &Value) -> Result<Value, EvalError> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        if b != 0 && a % b == 0 {
            return Ok(Value::from(a / b));
        }
    }
    let (a, b) = both_f64(left, right)
        .ok_or_else(|| EvalError::Evaluation("arithmetic on non-numeric values".to_owned()))?;
    if b == 0.0 {
        return Err(EvalError::Evaluation("division by zero".to_owned()));
    }
    Number::from_f64(a / b)
        .map(Value::Number)
        .ok_or_else(|| EvalError::Evaluation("division produced a non-finite value".to_owned()))
}

fn numeric(
    op: BinaryOp,
    left: &Value,
    right: &Value,
    float_op: fn(f64, f64) -> f64,
    int_op: fn(i64, i64) -> Option<i64>,
) -> Result<Value, EvalError> {
    if let (Some(a), Some(b)) = (left.as_i64(), right.as_i64()) {
        if let Some(result) = int_op(a, b) {
            return Ok(Value::from(result));
        }
    }
    let (a, b) = both_f64(left, right).ok_or_else(|| {
        EvalError::Evaluation(format!("{op:?} requires numeric operands"))
    })?;
    Number::from_f64(float_op(a, b))
        .map(Value::Number)
        .ok_or_else(|| EvalError::Evaluation("arithmetic produced a non-finite value".to_owned()))
}

fn both_f64(left: &Value, right: &Value) -> Option<(f64, f64)> {
    Some((left.as_f64()?, right.as_f64()?))
}

fn loose_eq(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a == b;
    }
    left == right
}

fn compare(
    left: &Value,
    right: &Value,
    accept: fn(std::cmp::Ordering) -> bool,
) -> Result<Value, EvalError> {
    let ordering = if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        a.partial_cmp(&b)
    } else if let (Value::String(a), Value::String(b)) = (left, right) {
        Some(a.cmp(b))
    } else {
        None
    };
    ordering
        .map(|ord| Value::Bool(accept(ord)))
        .ok_or_else(|| EvalError::Evaluation("values are not comparable".to_owned()))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn call_builtin(name: &str, args: &[Value]) -> Result<Value, EvalError> {
    match name {
        "len" => {
            let [value] = args else {
                return Err(arity(name, 1));
            };
            let len = match value {
                Value::Array(items) => items.len(),
                Value::String(s) => s.chars().count(),
                Value::Object(map) => map.len(),
                _ => {
                    return Err(EvalError::Evaluation(
                        "len expects an array, string, or object".to_owned(),
                    ))
                }
            };
            Ok(Value::from(len))
        }
        "keys" => {
            let [Value::Object(map)] = args else {
                return Err(EvalError::Evaluation("keys expects an object".to_owned()));
            };
            Ok(Value::Array(
                map.keys().cloned().map(Value::String).collect(),
            ))
        }
        "values" => {
            let [Value::Object(map)] = args else {
                return Err(EvalError::Evaluation("values expects an object".to_owned()));
            };
            Ok(Value::Array(map.values().cloned().collect()))
        }
        "min" | "max" => {
            let [a, b] = args else {
                return Err(arity(name, 2));
            };
            let (x, y) = both_f64(a, b).ok_or_else(|| {
                EvalError::Evaluation(format!("{name} expects numeric arguments"))
            })?;
            let pick_first = if name == "min" { x <= y } else { x >= y };
            Ok(if pick_first { a.clone() } else { b.clone() })
        }
        "abs" => {
            let [value] = args else {
                return Err(arity(name, 1));
            };
            match value {
                Value::Number(n) if n.is_i64() => {
                    Ok(Value::from(n.as_i64().expect("checked i64").abs()))
                }
                Value::Number(n) => n
                    .as_f64()
                    .and_then(|f| Number::from_f64(f.abs()))
                    .map(Value::Number)
                    .ok_or_else(|| EvalError::Evaluation("abs expects a number".to_owned())),
                _ => Err(EvalError::Evaluation("abs expects a number".to_owned())),
            }
        }
        "concat" => {
            let [a, b] = args else {
                return Err(arity(name, 2));
            };
            match (a, b) {
                (Value::Array(x), Value::Array(y)) => {
                    let mut out = x.clone();
                    out.extend(y.iter().cloned());
                    Ok(Value::Array(out))
                }
                _ => Ok(Value::String(format!("{}{}", stringify(a), stringify(b)))),
            }
        }
        _ => Err(EvalError::UndefinedFunction(name.to_owned())),
    }
}

fn arity(name: &str, expected: usize) -> EvalError {
    EvalError::Evaluation(format!("{name} expects {expected} argument(s)"))
}
