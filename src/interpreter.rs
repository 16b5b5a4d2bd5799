//! Step loop advancing an execution through the compiled FSM.
//!
//! Each state handler either mutates the execution and lets the loop
//! continue, emits an outcome for the platform (a continuation or a final
//! result), or forks into the barrier. Internal failures reject the step
//! future; the entry shim normalizes them into an error result.

use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::continuation::{Continuation, Execution, Frame, COMPOSER_KEY};
use crate::env;
use crate::evaluator::{is_truthy, EvalValue};
use crate::fsm::{Op, State};
use crate::store::StoreError;

use crate::conductor::Conductor;

/// What one conductor activation hands back to the platform.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// The composition finished; the value carries `params` or `error`.
    Complete(Value),
    /// Invoke `action` with `params`, then re-enter with the result and
    /// the saved continuation.
    Action {
        action: String,
        params: Value,
        state: Continuation,
    },
    /// A barrier branch terminated and recorded its result.
    Join {
        session: String,
        barrier_id: String,
        position: usize,
    },
}

impl Outcome {
    /// Wire encoding handed to the platform.
    pub fn into_value(self) -> Value {
        match self {
            Outcome::Complete(value) => value,
            Outcome::Action {
                action,
                params,
                state,
            } => json!({
                "method": "action",
                "action": action,
                "params": params,
                "state": { (COMPOSER_KEY): state },
            }),
            Outcome::Join {
                session,
                barrier_id,
                position,
            } => json!({
                "method": "join",
                "sessionId": session,
                "barrierId": barrier_id,
                "position": position,
            }),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConductorError {
    #[error("malformed state at index {index}: {reason}")]
    MalformedState { index: i64, reason: &'static str },

    #[error("exit state at index {index} found an empty stack")]
    EmptyStack { index: i64 },

    #[error("continuation could not be encoded: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub(crate) fn malformed(index: i64, reason: &'static str) -> ConductorError {
    ConductorError::MalformedState { index, reason }
}

/// Normalize `params` and, on error, unwind to the nearest handler.
///
/// Non-objects are wrapped as `{value}`. A present `error` key drops its
/// siblings, aborts the execution, and pops frames until a catch frame
/// redirects the state; a marker frame stops the unwind so branch errors
/// never escape their fork.
pub fn inspect(exec: &mut Execution) {
    if !exec.params.is_object() {
        let value = std::mem::take(&mut exec.params);
        exec.params = json!({ "value": value });
    }
    if let Some(error) = exec.params.get("error").cloned() {
        exec.params = json!({ "error": error });
        exec.cont.state = -1;
        while let Some(top) = exec.cont.stack.first() {
            if matches!(top, Frame::Marker) {
                break;
            }
            if let Frame::Catch { state } = exec.cont.stack.remove(0) {
                exec.cont.state = state;
                break;
            }
        }
    }
}

impl Conductor {
    pub(crate) async fn step_loop(
        &self,
        exec: &mut Execution,
    ) -> Result<Outcome, ConductorError> {
        loop {
            let current = exec.cont.state;
            if current < 0 || current >= self.fsm().len() as i64 {
                return self.finish(exec).await;
            }
            let node = self.fsm()[current as usize].clone();
            if let Some(path) = &node.path {
                debug!(path = %path, state = current, "entering composition");
            }
            exec.cont.state = current + node.next.unwrap_or(1);

            match node.op {
                Op::Pass => {}
                Op::Empty => inspect(exec),
                Op::Stop => exec.cont.state = -1,
                Op::Choice => {
                    let then = node
                        .then
                        .ok_or_else(|| malformed(current, "choice is missing 'then'"))?;
                    let alt = node
                        .alt
                        .ok_or_else(|| malformed(current, "choice is missing 'else'"))?;
                    let value = exec.params.get("value").cloned().unwrap_or(Value::Null);
                    exec.cont.state = current + if is_truthy(&value) { then } else { alt };
                }
                Op::Try => {
                    let offset = node
                        .handler
                        .ok_or_else(|| malformed(current, "try is missing 'catch'"))?;
                    exec.cont.stack.insert(
                        0,
                        Frame::Catch {
                            state: current + offset,
                        },
                    );
                }
                Op::Let => {
                    let bindings = node
                        .bindings
                        .clone()
                        .ok_or_else(|| malformed(current, "let is missing its bindings"))?;
                    exec.cont.stack.insert(0, Frame::Let { bindings });
                }
                Op::Exit => {
                    if exec.cont.stack.is_empty() {
                        return Err(ConductorError::EmptyStack { index: current });
                    }
                    exec.cont.stack.remove(0);
                }
                Op::Action => {
                    let name = node
                        .name
                        .clone()
                        .ok_or_else(|| malformed(current, "action is missing 'name'"))?;
                    let params = exec.params.clone();
                    return Ok(self.action_outcome(exec, name, params));
                }
                Op::Dynamic => match dynamic_target(&exec.params) {
                    Some((name, params)) => {
                        return Ok(self.action_outcome(exec, name, params));
                    }
                    None => {
                        exec.params = json!({
                            "error": format!(
                                "Invalid argument to dynamic invocation{}",
                                at_path(&node)
                            ),
                        });
                        inspect(exec);
                    }
                },
                Op::Function => {
                    let body = node
                        .exec
                        .clone()
                        .ok_or_else(|| malformed(current, "function is missing 'exec'"))?;
                    self.apply_function(exec, &body.code, &node);
                }
                Op::Async => self.spawn_async(exec, current, &node).await?,
                Op::Parallel | Op::Map => {
                    if let Some(outcome) = self.fork(exec, current, &node).await? {
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Continuation handed back when an external action must run. The
    /// saved state is marked `resuming` so re-entry inspects the result.
    fn action_outcome(&self, exec: &Execution, action: String, params: Value) -> Outcome {
        let mut state = exec.cont.clone();
        state.resuming = true;
        Outcome::Action {
            action,
            params,
            state,
        }
    }

    fn apply_function(&self, exec: &mut Execution, code: &str, node: &State) {
        match env::run_body(code, exec) {
            Ok(EvalValue::Undefined) => {}
            Ok(EvalValue::Json(value)) => exec.params = value,
            Ok(EvalValue::Function(_)) => {
                exec.params = json!({
                    "error": format!("Function{} returned a function value", at_path(node)),
                });
            }
            Err(err) => {
                warn!(error = %err, "function body raised");
                exec.params = json!({
                    "error": format!(
                        "An exception was raised by the function{}: {err}",
                        at_path(node)
                    ),
                });
            }
        }
        inspect(exec);
    }

    /// Spawn the async body as an independent activation; the parent keeps
    /// stepping with the activation receipt as its value.
    async fn spawn_async(
        &self,
        exec: &mut Execution,
        current: i64,
        node: &State,
    ) -> Result<(), ConductorError> {
        let resume = node
            .resume
            .ok_or_else(|| malformed(current, "async is missing 'return'"))?;
        let child = exec.cont.spawned(current + 1);
        exec.cont.state = current + resume;

        let mut child_params = exec.params.clone();
        if !child_params.is_object() {
            child_params = json!({ "value": child_params });
        }
        child_params
            .as_object_mut()
            .expect("child params are an object")
            .insert(COMPOSER_KEY.to_owned(), serde_json::to_value(&child)?);

        match self
            .invoker()
            .invoke(self.action_name(), child_params)
            .await
        {
            Ok(activation) => {
                exec.params = json!({
                    "method": "async",
                    "activationId": activation.activation_id,
                    "sessionId": exec.cont.session.clone(),
                });
            }
            Err(err) => {
                warn!(error = %err, "async spawn failed");
                exec.params = json!({
                    "error": format!(
                        "Failed to spawn child activation{}: {err}",
                        at_path(node)
                    ),
                });
            }
        }
        inspect(exec);
        Ok(())
    }

    async fn finish(&self, exec: &mut Execution) -> Result<Outcome, ConductorError> {
        if exec.cont.join.is_some() {
            return self.finish_branch(exec).await;
        }
        Ok(Outcome::Complete(final_result(exec)))
    }
}

/// Final activation result: the error object itself, or `{params}`.
pub(crate) fn final_result(exec: &Execution) -> Value {
    if exec.has_error() {
        exec.params.clone()
    } else {
        json!({ "params": exec.params })
    }
}

/// A `dynamic` state requires `{type: "action", name, params: object}`.
fn dynamic_target(params: &Value) -> Option<(String, Value)> {
    let object = params.as_object()?;
    if object.get("type")?.as_str()? != "action" {
        return None;
    }
    let name = object.get("name")?.as_str()?.to_owned();
    let inner = object.get("params")?;
    if !inner.is_object() {
        return None;
    }
    Some((name, inner.clone()))
}

pub(crate) fn at_path(node: &State) -> String {
    match node.parent.as_deref() {
        Some(path) => format!(" at '{path}'"),
        None => String::new(),
    }
}
