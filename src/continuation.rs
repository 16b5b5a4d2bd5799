//! Serialized execution state carried between activations.
//!
//! The `$composer` value is the conductor's continuation: the FSM index to
//! resume at, the frame stack, the session id, and the opaque client
//! configurations. It must stay a plain JSON value tree so the platform
//! can round-trip it untouched.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::store::StoreConfig;

/// Key under which the continuation travels inside action parameters.
pub const COMPOSER_KEY: &str = "$composer";

/// One frame of the interpreter stack. Top of stack is index 0.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// Fork boundary; error unwinding stops here.
    Marker,
    /// `try` handler frame holding an absolute FSM index.
    Catch { state: i64 },
    /// Lexical bindings; `None` masks the innermost visible binding frame.
    Let { bindings: Option<Map<String, Value>> },
}

/// Barrier membership of a branch activation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinSpec {
    pub barrier_id: String,
    pub position: usize,
    pub count: usize,
}

/// The serializable slice of an execution (`P.s`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Continuation {
    #[serde(default)]
    pub state: i64,
    #[serde(default)]
    pub stack: Vec<Frame>,
    #[serde(default)]
    pub session: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<StoreConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub openwhisk: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join: Option<JoinSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collect: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub resuming: bool,
}

impl Continuation {
    /// Continuation for a fresh execution starting at state 0.
    pub fn fresh(session: impl Into<String>) -> Self {
        Continuation {
            state: 0,
            stack: Vec::new(),
            session: session.into(),
            redis: None,
            openwhisk: None,
            join: None,
            collect: None,
            resuming: false,
        }
    }

    /// Continuation for a spawned activation: same session and configs,
    /// a marker-bottomed copy of the stack, and its own entry state.
    pub fn spawned(&self, state: i64) -> Self {
        let mut stack = Vec::with_capacity(self.stack.len() + 1);
        stack.push(Frame::Marker);
        stack.extend(self.stack.iter().cloned());
        Continuation {
            state,
            stack,
            session: self.session.clone(),
            redis: self.redis.clone(),
            openwhisk: self.openwhisk.clone(),
            join: None,
            collect: None,
            resuming: false,
        }
    }
}

/// An in-flight execution: the value flowing through the composition plus
/// its serializable continuation.
#[derive(Clone, Debug)]
pub struct Execution {
    pub params: Value,
    pub cont: Continuation,
}

impl Execution {
    pub fn new(params: Value, cont: Continuation) -> Self {
        Execution { params, cont }
    }

    /// Whether `params` carries an error marker. A present `error` key
    /// counts even when its value is null.
    pub fn has_error(&self) -> bool {
        self.params
            .as_object()
            .map(|map| map.contains_key("error"))
            .unwrap_or(false)
    }
}
