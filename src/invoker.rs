//! Action invocation interface.
//!
//! The conductor never talks to the platform's API directly; it asks an
//! injected `ActionInvoker` to fire actions. Spawning a child activation of
//! the conductor itself is just an invoke of its own action name, which
//! keeps local testing a matter of providing a different implementation.

use futures::future::BoxFuture;
use serde_json::Value;

/// Receipt for a fired activation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Activation {
    pub activation_id: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct InvokeError {
    pub kind: String,
    pub message: String,
}

impl InvokeError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        InvokeError {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// Fire-and-forget invocation of a named action.
pub trait ActionInvoker: Send + Sync {
    fn invoke<'a>(
        &'a self,
        name: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Activation, InvokeError>>;
}
