//! Entry and resume shim.
//!
//! An activation carries `{…params, $composer?}`. The shim rebuilds the
//! execution from the continuation (or starts a fresh one), re-runs error
//! inspection when resuming from a child, re-enters a pending collect, and
//! otherwise hands off to the step loop. Internal failures are normalized
//! into a final `{error: "Internal error: …"}` result.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::error;

use crate::ast::AstNode;
use crate::compiler::{compile, CompileError};
use crate::config::Config;
use crate::continuation::{Continuation, Execution, COMPOSER_KEY};
use crate::fsm::State;
use crate::interpreter::{inspect, malformed, ConductorError, Outcome};
use crate::invoker::ActionInvoker;
use crate::store::StoreConnector;

/// Collect wait when the platform supplied no deadline.
const DEFAULT_COLLECT_WAIT: Duration = Duration::from_secs(55);

/// A compiled composition bound to its platform clients.
pub struct Conductor {
    fsm: Vec<State>,
    config: Config,
    invoker: Arc<dyn ActionInvoker>,
    connector: Arc<dyn StoreConnector>,
}

impl Conductor {
    /// Compile `composition` and bind it to the given clients.
    pub fn new(
        composition: &AstNode,
        config: Config,
        invoker: Arc<dyn ActionInvoker>,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self, CompileError> {
        Ok(Self::from_fsm(
            compile(composition)?,
            config,
            invoker,
            connector,
        ))
    }

    /// Bind an already-compiled FSM.
    pub fn from_fsm(
        fsm: Vec<State>,
        config: Config,
        invoker: Arc<dyn ActionInvoker>,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        Conductor {
            fsm,
            config,
            invoker,
            connector,
        }
    }

    pub fn fsm(&self) -> &[State] {
        &self.fsm
    }

    pub(crate) fn invoker(&self) -> &dyn ActionInvoker {
        self.invoker.as_ref()
    }

    pub(crate) fn connector(&self) -> &dyn StoreConnector {
        self.connector.as_ref()
    }

    pub(crate) fn action_name(&self) -> &str {
        &self.config.action_name
    }

    pub(crate) fn heartbeat_action(&self) -> &str {
        &self.config.heartbeat_action
    }

    /// Time left for a blocking collect: five seconds short of the
    /// activation deadline, never below one second.
    pub(crate) fn collect_timeout(&self) -> Duration {
        match self.config.deadline {
            Some(deadline) => {
                let secs = ((deadline - Utc::now()).num_seconds() - 5).max(1);
                Duration::from_secs(secs as u64)
            }
            None => DEFAULT_COLLECT_WAIT,
        }
    }

    /// Run one activation and encode the outcome for the platform.
    pub async fn invoke(&self, input: Value) -> Value {
        match self.run(input).await {
            Ok(outcome) => outcome.into_value(),
            Err(err) => {
                error!(error = %err, "activation failed");
                json!({ "error": format!("Internal error: {err}") })
            }
        }
    }

    /// Run one activation, returning the structured outcome.
    pub async fn run(&self, input: Value) -> Result<Outcome, ConductorError> {
        let mut exec = self.rebuild(input)?;

        if exec.cont.resuming {
            exec.cont.resuming = false;
            inspect(&mut exec);
        }

        if let Some(barrier_id) = exec.cont.collect.clone() {
            if exec.has_error() {
                // the heartbeat itself failed; give up on the barrier
                exec.cont.collect = None;
            } else {
                let config = exec.cont.redis.clone().ok_or_else(|| {
                    malformed(exec.cont.state, "collect without a store configuration")
                })?;
                let store = self.connector.connect(&config)?;
                if let Some(outcome) =
                    self.collect(&mut exec, store.as_ref(), &barrier_id).await?
                {
                    return Ok(outcome);
                }
            }
        }

        self.step_loop(&mut exec).await
    }

    /// Rebuild the execution from activation input. A fresh entry starts
    /// at state 0 with the entry's activation id as session.
    fn rebuild(&self, input: Value) -> Result<Execution, ConductorError> {
        let mut params = if input.is_object() {
            input
        } else {
            json!({ "value": input })
        };
        let composer = params
            .as_object_mut()
            .expect("activation params are an object")
            .remove(COMPOSER_KEY)
            .unwrap_or_else(|| json!({}));
        let mut cont: Continuation = serde_json::from_value(composer)?;
        if cont.session.is_empty() {
            cont.session = self.config.activation_id.clone();
        }
        Ok(Execution::new(params, cont))
    }
}
