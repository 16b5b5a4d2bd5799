//! Fork/join barrier over the external store.
//!
//! A fork pushes a sentinel onto `live/<id>`, spawns one activation per
//! branch, and waits on `done/<id>`. Each terminating branch appends its
//! result with a push-only-if-exists; the push that brings the list past
//! the branch count atomically renames `live` to `done`, waking the
//! parent. Renaming first makes completion idempotent: late pushes find no
//! `live` key and are rejected.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conductor::Conductor;
use crate::continuation::{Execution, JoinSpec, COMPOSER_KEY};
use crate::fsm::{Op, State};
use crate::interpreter::{at_path, inspect, malformed, ConductorError, Outcome};
use crate::store::BarrierStore;

/// First element pushed onto a live barrier list.
const SENTINEL: &str = "42";

/// Orphaned barriers self-reap after a day.
const BARRIER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

fn live_key(barrier_id: &str) -> String {
    format!("live/{barrier_id}")
}

fn done_key(barrier_id: &str) -> String {
    format!("done/{barrier_id}")
}

/// One branch's contribution to the barrier list.
#[derive(Debug, Serialize, Deserialize)]
struct BranchRecord {
    position: usize,
    params: Value,
}

/// Map items become `{value: item}` unless already a plain object.
fn wrap_item(item: Value) -> Value {
    if item.is_object() {
        item
    } else {
        json!({ "value": item })
    }
}

/// Inverse of [`wrap_item`] applied when folding branch results: a bare
/// `{value: x}` carries a plain value, anything else is a real object.
fn unwrap_result(params: Value) -> Value {
    match &params {
        Value::Object(map) if map.len() == 1 && map.contains_key("value") => map["value"].clone(),
        _ => params,
    }
}

impl Conductor {
    /// Fork a `parallel` or `map` state into branch activations, then
    /// collect. Returns an outcome when the parent must leave the step
    /// loop; `None` resumes stepping (results gathered, or fork mapped to
    /// a user error).
    pub(crate) async fn fork(
        &self,
        exec: &mut Execution,
        current: i64,
        node: &State,
    ) -> Result<Option<Outcome>, ConductorError> {
        let resume = node
            .resume
            .ok_or_else(|| malformed(current, "fork is missing 'return'"))?;

        let saved = std::mem::replace(&mut exec.params, json!({ "value": [] }));
        exec.cont.state = current + resume;

        let branches: Vec<(i64, Value)> = match node.op {
            Op::Parallel => {
                let tasks = node
                    .tasks
                    .as_ref()
                    .ok_or_else(|| malformed(current, "parallel is missing 'tasks'"))?;
                tasks
                    .iter()
                    .map(|offset| (current + offset, saved.clone()))
                    .collect()
            }
            Op::Map => {
                let items = saved
                    .get("value")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                items
                    .into_iter()
                    .map(|item| (current + 1, wrap_item(item)))
                    .collect()
            }
            _ => return Err(malformed(current, "fork on a non-fork state")),
        };

        let Some(config) = exec.cont.redis.clone() else {
            exec.params = json!({
                "error": format!("Missing store configuration{}", at_path(node)),
            });
            inspect(exec);
            return Ok(None);
        };
        let store = match self.connector().connect(&config) {
            Ok(store) => store,
            Err(err) => {
                warn!(error = %err, "store connect failed before fork");
                exec.params = json!({
                    "error": format!("Invalid store configuration{}: {err}", at_path(node)),
                });
                inspect(exec);
                return Ok(None);
            }
        };

        // Nothing to rendezvous on; the empty accumulator is the result.
        if branches.is_empty() {
            return Ok(None);
        }

        let barrier_id = Uuid::new_v4().to_string();
        let live = live_key(&barrier_id);
        let count = branches.len();
        debug!(barrier = %barrier_id, branches = count, "forking");

        let spawned: Result<(), String> = async {
            store
                .push(&live, SENTINEL)
                .await
                .map_err(|err| err.to_string())?;
            store
                .expire(&live, BARRIER_TTL)
                .await
                .map_err(|err| err.to_string())?;
            for (position, (entry, params)) in branches.into_iter().enumerate() {
                let mut child = exec.cont.spawned(entry);
                child.join = Some(JoinSpec {
                    barrier_id: barrier_id.clone(),
                    position,
                    count,
                });
                let mut child_params = if params.is_object() {
                    params
                } else {
                    json!({ "value": params })
                };
                child_params
                    .as_object_mut()
                    .expect("branch params are an object")
                    .insert(
                        COMPOSER_KEY.to_owned(),
                        serde_json::to_value(&child).map_err(|err| err.to_string())?,
                    );
                self.invoker()
                    .invoke(self.action_name(), child_params)
                    .await
                    .map_err(|err| err.to_string())?;
            }
            Ok(())
        }
        .await;

        if let Err(message) = spawned {
            warn!(barrier = %barrier_id, error = %message, "fork spawn failed");
            let keys = [live, done_key(&barrier_id)];
            if let Err(err) = store.delete(&keys).await {
                warn!(error = %err, "barrier cleanup failed");
            }
            exec.params = json!({
                "error": format!("Failed to fork{}: {message}", at_path(node)),
            });
            inspect(exec);
            return Ok(None);
        }

        self.collect(exec, store.as_ref(), &barrier_id).await
    }

    /// Wait for the barrier to flip, then fold the branch results into the
    /// accumulator in spawn order. A timed-out wait re-enqueues the parent
    /// through the heartbeat action instead of overrunning the activation
    /// deadline.
    pub(crate) async fn collect(
        &self,
        exec: &mut Execution,
        store: &dyn BarrierStore,
        barrier_id: &str,
    ) -> Result<Option<Outcome>, ConductorError> {
        let done = done_key(barrier_id);
        let timeout = self.collect_timeout();
        debug!(barrier = %barrier_id, timeout_secs = timeout.as_secs(), "collecting");

        match store.pop_back(&done, timeout).await? {
            Some(_sentinel) => {
                let entries = store.range(&done).await?;
                let mut results = vec![Value::Null; entries.len()];
                for raw in &entries {
                    let record: BranchRecord = serde_json::from_str(raw)?;
                    if record.position >= results.len() {
                        results.resize(record.position + 1, Value::Null);
                    }
                    results[record.position] = unwrap_result(record.params);
                }
                store.delete(&[live_key(barrier_id), done]).await?;
                exec.cont.collect = None;
                exec.params = json!({ "value": results });
                inspect(exec);
                Ok(None)
            }
            None => {
                exec.cont.collect = Some(barrier_id.to_owned());
                let mut state = exec.cont.clone();
                state.resuming = true;
                Ok(Some(Outcome::Action {
                    action: self.heartbeat_action().to_owned(),
                    params: exec.params.clone(),
                    state,
                }))
            }
        }
    }

    /// A branch reached a terminal state: record its result against the
    /// barrier and flip it if this was the last one in.
    pub(crate) async fn finish_branch(
        &self,
        exec: &mut Execution,
    ) -> Result<Outcome, ConductorError> {
        let Some(join) = exec.cont.join.clone() else {
            return Err(malformed(exec.cont.state, "branch finish without a join"));
        };
        let Some(config) = exec.cont.redis.clone() else {
            return Err(malformed(
                exec.cont.state,
                "branch is missing its store configuration",
            ));
        };
        let store = self.connector().connect(&config)?;

        let record = serde_json::to_string(&BranchRecord {
            position: join.position,
            params: exec.params.clone(),
        })?;
        let live = live_key(&join.barrier_id);
        let count = store.push_existing(&live, &record).await?;
        debug!(
            barrier = %join.barrier_id,
            position = join.position,
            count,
            "branch recorded"
        );
        if count > join.count {
            store.rename(&live, &done_key(&join.barrier_id)).await?;
        }
        Ok(Outcome::Join {
            session: exec.cont.session.clone(),
            barrier_id: join.barrier_id,
            position: join.position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn items_wrap_unless_plain_objects() {
        assert_eq!(wrap_item(json!(3)), json!({"value": 3}));
        assert_eq!(wrap_item(json!([1])), json!({"value": [1]}));
        assert_eq!(wrap_item(json!(null)), json!({"value": null}));
        assert_eq!(wrap_item(json!({"x": 1})), json!({"x": 1}));
    }

    #[test]
    fn only_bare_value_wrappers_unwrap() {
        assert_eq!(unwrap_result(json!({"value": 3})), json!(3));
        assert_eq!(
            unwrap_result(json!({"value": 3, "unit": "s"})),
            json!({"value": 3, "unit": "s"})
        );
        assert_eq!(unwrap_result(json!({"error": "e"})), json!({"error": "e"}));
    }

    #[test]
    fn barrier_keys_are_namespaced_by_phase() {
        assert_eq!(live_key("abc"), "live/abc");
        assert_eq!(done_key("abc"), "done/abc");
    }
}
