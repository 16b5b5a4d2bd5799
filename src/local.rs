//! In-process platform for tests and smoke runs.
//!
//! Faithful to the activation model: every conductor entry is a fresh
//! `invoke`, action continuations are re-entered with the action result
//! plus the saved `$composer`, and spawned children run as independent
//! tasks against one shared in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tracing::warn;
use uuid::Uuid;

use crate::ast::AstNode;
use crate::compiler::CompileError;
use crate::conductor::Conductor;
use crate::config::{Config, DEFAULT_HEARTBEAT_ACTION};
use crate::continuation::COMPOSER_KEY;
use crate::invoker::{ActionInvoker, Activation, InvokeError};
use crate::store::{MemoryConnector, MemoryStore, StoreConfig};

/// Name the composition action is registered under locally.
pub const LOCAL_ACTION_NAME: &str = "composition";

/// An action stub executed in process.
pub type ActionCallable =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, InvokeError>> + Send + Sync>;

/// Wrap a synchronous closure as an [`ActionCallable`].
pub fn action(
    handler: impl Fn(Value) -> Result<Value, InvokeError> + Send + Sync + 'static,
) -> ActionCallable {
    Arc::new(
        move |params| -> BoxFuture<'static, Result<Value, InvokeError>> {
            let result = handler(params);
            Box::pin(async move { result })
        },
    )
}

#[derive(Clone, Debug)]
pub struct LocalOptions {
    /// Activation deadline handed to the conductor; bounds collect waits.
    pub deadline: Option<DateTime<Utc>>,
    pub heartbeat_action: String,
}

impl Default for LocalOptions {
    fn default() -> Self {
        LocalOptions {
            deadline: None,
            heartbeat_action: DEFAULT_HEARTBEAT_ACTION.to_owned(),
        }
    }
}

struct PlatformInner {
    actions: HashMap<String, ActionCallable>,
    heartbeat_action: String,
    store_config: StoreConfig,
    conductor: OnceLock<Arc<Conductor>>,
    results: Mutex<HashMap<String, Value>>,
    results_changed: Notify,
}

impl PlatformInner {
    fn conductor(&self) -> Arc<Conductor> {
        self.conductor.get().expect("conductor is bound").clone()
    }

    async fn run_action(&self, name: &str, params: Value) -> Value {
        if let Some(handler) = self.actions.get(name) {
            match handler(params).await {
                Ok(value) => value,
                Err(err) => json!({ "error": format!("{err}") }),
            }
        } else if name == self.heartbeat_action {
            // platform echo
            params
        } else {
            json!({ "error": format!("Unknown action: {name}") })
        }
    }
}

/// Drive one activation chain to its final (or join) result, re-entering
/// the conductor after every action continuation.
async fn drive(inner: Arc<PlatformInner>, mut input: Value) -> Value {
    let conductor = inner.conductor();
    loop {
        let outcome = conductor.invoke(input).await;
        if outcome.get("method").and_then(Value::as_str) != Some("action") {
            return outcome;
        }
        let name = outcome["action"].as_str().unwrap_or_default().to_owned();
        let params = outcome["params"].clone();
        let state = outcome["state"][COMPOSER_KEY].clone();

        let result = inner.run_action(&name, params).await;
        let mut next = if result.is_object() {
            result
        } else {
            json!({ "value": result })
        };
        next.as_object_mut()
            .expect("re-entry params are an object")
            .insert(COMPOSER_KEY.to_owned(), state);
        input = next;
    }
}

/// Spawns child activations as tasks, recording their final results.
struct SpawnInvoker {
    inner: Weak<PlatformInner>,
}

impl ActionInvoker for SpawnInvoker {
    fn invoke<'a>(
        &'a self,
        name: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Activation, InvokeError>> {
        Box::pin(async move {
            let inner = self.inner.upgrade().ok_or_else(|| {
                InvokeError::new("LocalPlatformError", "platform has shut down")
            })?;
            if name != LOCAL_ACTION_NAME {
                return Err(InvokeError::new(
                    "LocalPlatformError",
                    format!("cannot spawn unknown action: {name}"),
                ));
            }
            let activation_id = Uuid::new_v4().to_string();
            let record_id = activation_id.clone();
            tokio::spawn(async move {
                let result = drive(inner.clone(), params).await;
                inner
                    .results
                    .lock()
                    .expect("results lock poisoned")
                    .insert(record_id, result);
                inner.results_changed.notify_waiters();
            });
            Ok(Activation { activation_id })
        })
    }
}

/// One composition plus its stubbed actions, runnable end to end.
pub struct LocalPlatform {
    inner: Arc<PlatformInner>,
}

impl LocalPlatform {
    pub fn new(
        composition: &AstNode,
        actions: HashMap<String, ActionCallable>,
    ) -> Result<Self, CompileError> {
        Self::with_options(composition, actions, LocalOptions::default())
    }

    pub fn with_options(
        composition: &AstNode,
        actions: HashMap<String, ActionCallable>,
        options: LocalOptions,
    ) -> Result<Self, CompileError> {
        let inner = Arc::new(PlatformInner {
            actions,
            heartbeat_action: options.heartbeat_action.clone(),
            store_config: StoreConfig::new("memory://local"),
            conductor: OnceLock::new(),
            results: Mutex::new(HashMap::new()),
            results_changed: Notify::new(),
        });

        let mut config = Config::local(LOCAL_ACTION_NAME);
        config.deadline = options.deadline;
        config.heartbeat_action = options.heartbeat_action;

        let store = Arc::new(MemoryStore::new());
        let conductor = Conductor::new(
            composition,
            config,
            Arc::new(SpawnInvoker {
                inner: Arc::downgrade(&inner),
            }),
            Arc::new(MemoryConnector::new(store)),
        )?;
        if inner.conductor.set(Arc::new(conductor)).is_err() {
            warn!("conductor was already bound");
        }
        Ok(LocalPlatform { inner })
    }

    /// Run the composition from fresh params to its final result.
    pub async fn run(&self, params: Value) -> Value {
        let mut input = if params.is_object() {
            params
        } else {
            json!({ "value": params })
        };
        input
            .as_object_mut()
            .expect("entry params are an object")
            .insert(
                COMPOSER_KEY.to_owned(),
                json!({ "redis": self.inner.store_config.clone() }),
            );
        drive(self.inner.clone(), input).await
    }

    /// Wait up to `wait` for a spawned activation's final result.
    pub async fn activation_result(&self, activation_id: &str, wait: Duration) -> Option<Value> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.inner.results_changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self
                .inner
                .results
                .lock()
                .expect("results lock poisoned")
                .get(activation_id)
                .cloned()
            {
                return Some(result);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(remaining) => return None,
            }
        }
    }
}
