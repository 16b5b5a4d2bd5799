//! Composition AST as produced by the composer front end.
//!
//! Compositions arrive as opaque JSON trees. Each node carries a `type`
//! discriminator, combinator-specific children, and an optional dotted
//! `path` into the tree used for diagnostics and entry logging.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Combinator discriminator for a composition node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AstKind {
    Sequence,
    Action,
    Async,
    Function,
    Finally,
    Let,
    Mask,
    Try,
    IfNosave,
    WhileNosave,
    DowhileNosave,
    Parallel,
    Map,
    Dynamic,
    Empty,
}

/// Executable body of a `function` node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FunctionExec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub code: String,
}

/// One node of a composition tree.
///
/// Children are all optional; which ones a combinator requires is checked
/// by the compiler, not by deserialization, so that malformed compositions
/// produce a compile error naming the offending path rather than an opaque
/// serde failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AstNode {
    #[serde(rename = "type")]
    pub kind: AstKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<FunctionExec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<AstNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Box<AstNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<Box<AstNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalizer: Option<Box<AstNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<Box<AstNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consequent: Option<Box<AstNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate: Option<Box<AstNode>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub declarations: Option<Map<String, Value>>,
}

impl AstNode {
    /// Parse a composition from its JSON encoding.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Path of this node, or an empty string when the composer omitted it.
    pub fn path_or_empty(&self) -> &str {
        self.path.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserializes_nested_composition() {
        let node = AstNode::from_value(json!({
            "type": "sequence",
            "path": "",
            "components": [
                {"type": "action", "name": "greet", "path": ".components.0"},
                {"type": "function", "exec": {"code": "params"}, "path": ".components.1"},
            ],
        }))
        .expect("composition should parse");

        assert_eq!(node.kind, AstKind::Sequence);
        let components = node.components.expect("components");
        assert_eq!(components.len(), 2);
        assert_eq!(components[0].kind, AstKind::Action);
        assert_eq!(components[0].name.as_deref(), Some("greet"));
        assert_eq!(components[1].kind, AstKind::Function);
    }

    #[test]
    fn unknown_combinator_is_rejected() {
        let result = AstNode::from_value(json!({"type": "teleport"}));
        assert!(result.is_err());
    }
}
