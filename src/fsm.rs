//! Compiled finite-state-machine records.
//!
//! A composition compiles to a flat, ordered list of state records. All
//! jump fields (`next`, `then`, `else`, `catch`, `return`, `tasks`) are
//! offsets relative to the state's own index, so any compiled sub-list is
//! position independent and may be concatenated by an enclosing rule.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ast::FunctionExec;

/// Opcode of a compiled state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Pass,
    Action,
    Function,
    Async,
    Stop,
    Empty,
    Choice,
    Try,
    Let,
    Exit,
    Parallel,
    Map,
    Dynamic,
}

/// One compiled state record.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct State {
    #[serde(rename = "type")]
    pub op: Op,
    /// Path of the composition node this state was compiled from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Stamped on a combinator's head state only; drives entry logging.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<FunctionExec>,
    /// Relative jump taken after this state; defaults to `+1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub then: Option<i64>,
    #[serde(rename = "else", default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<i64>,
    #[serde(rename = "catch", default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<i64>,
    #[serde(rename = "return", default, skip_serializing_if = "Option::is_none")]
    pub resume: Option<i64>,
    /// Bindings introduced by a `let` state; `Some(None)` encodes a mask.
    #[serde(
        rename = "let",
        default,
        skip_serializing_if = "Option::is_none",
        with = "nullable_bindings"
    )]
    pub bindings: Option<Option<Map<String, Value>>>,
    /// Branch entry offsets of a `parallel` state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<i64>>,
}

impl State {
    pub fn new(op: Op) -> Self {
        State {
            op,
            parent: None,
            path: None,
            name: None,
            exec: None,
            next: None,
            then: None,
            alt: None,
            handler: None,
            resume: None,
            bindings: None,
            tasks: None,
        }
    }
}

/// Serde shim distinguishing an absent `let` field from `let: null`.
mod nullable_bindings {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Option<Map<String, Value>>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Option<Map<String, Value>>>, D::Error> {
        Ok(Some(Option::<Map<String, Value>>::deserialize(
            deserializer,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mask_state_round_trips_with_null_bindings() {
        let mut state = State::new(Op::Let);
        state.bindings = Some(None);
        let encoded = serde_json::to_value(&state).expect("encode");
        assert_eq!(encoded, json!({"type": "let", "let": null}));
        let decoded: State = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded.bindings, Some(None));
    }

    #[test]
    fn jump_fields_use_wire_names() {
        let mut state = State::new(Op::Choice);
        state.then = Some(1);
        state.alt = Some(3);
        let encoded = serde_json::to_value(&state).expect("encode");
        assert_eq!(encoded, json!({"type": "choice", "then": 1, "else": 3}));
    }
}
