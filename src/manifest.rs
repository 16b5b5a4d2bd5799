//! Deployable action descriptors.
//!
//! A composition ships as a single platform action whose code is the
//! packaged conductor and whose annotations embed the composition itself.

use serde_json::{json, Value};

use crate::ast::AstNode;

pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_RUNTIME_KIND: &str = "nodejs:default";

/// Version of this conductor, stamped into descriptors.
pub const CONDUCTOR_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone, Debug)]
pub struct DescriptorOptions {
    /// Activation time limit in milliseconds.
    pub timeout_ms: u64,
    /// Runtime kind of the generated action.
    pub kind: String,
    /// Version of the composer that produced the AST, when known.
    pub composer_version: Option<String>,
}

impl Default for DescriptorOptions {
    fn default() -> Self {
        DescriptorOptions {
            timeout_ms: DEFAULT_TIMEOUT_MS,
            kind: DEFAULT_RUNTIME_KIND.to_owned(),
            composer_version: None,
        }
    }
}

/// Build the deployable descriptor for `composition`, embedding `code`
/// (the packaged conductor) as the action body.
pub fn action_descriptor(
    name: &str,
    composition: &AstNode,
    code: &str,
    options: &DescriptorOptions,
) -> Value {
    json!({
        "name": name,
        "action": {
            "exec": { "kind": options.kind, "code": code },
            "annotations": [
                { "key": "conductor", "value": composition },
                { "key": "composerVersion", "value": options.composer_version },
                { "key": "conductorVersion", "value": CONDUCTOR_VERSION },
                { "key": "provide-api-key", "value": true },
            ],
            "limits": { "timeout": options.timeout_ms },
        },
    })
}
