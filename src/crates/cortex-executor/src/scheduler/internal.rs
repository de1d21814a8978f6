//! Internal action dispatch
//!
//! Actions of kind `internal` never leave the scheduler: they mutate
//! execution-scoped state (variables and context feeds) and take effect
//! immediately upon completion, visible to every later `$name` resolution.
//!
//! `set_variable` with the name `goal_achieved` doubles as the
//! goal-achieved termination signal read by the iteration controller.

use crate::invoker::InvokeOutcome;
use cortex_core::store::{FeedKind, ResultStore};
use serde_json::{json, Value};
use tracing::debug;

/// Dispatch one internal action against the store.
pub fn dispatch(target: &str, parameters: &Value, store: &ResultStore) -> InvokeOutcome {
    match target {
        "set_variable" => {
            let Some(name) = str_param(parameters, "name") else {
                return missing_param(target, "name");
            };
            let value = parameters.get("value").cloned().unwrap_or(Value::Null);
            debug!(variable = name, "set_variable");
            store.set_variable(name, value);
            InvokeOutcome::ok(Value::Null)
        }
        "delete_variable" => {
            let Some(name) = str_param(parameters, "name") else {
                return missing_param(target, "name");
            };
            let existed = store.delete_variable(name);
            InvokeOutcome::ok(json!({ "deleted": existed }))
        }
        "add_context_feed" => {
            let Some(id) = feed_id(parameters) else {
                return missing_param(target, "id");
            };
            let kind = match str_param(parameters, "kind") {
                None | Some("on_demand") => FeedKind::OnDemand,
                Some("periodic") => FeedKind::Periodic {
                    refresh_interval_ms: parameters
                        .get("refresh_interval_ms")
                        .and_then(Value::as_u64)
                        .unwrap_or(60_000),
                },
                Some(other) => {
                    return InvokeOutcome::error(
                        "invalid_parameters",
                        format!("unknown feed kind '{}'", other),
                    );
                }
            };
            store.add_feed(id, kind, parameters.get("value").cloned());
            InvokeOutcome::ok(Value::Null)
        }
        "update_context_feed" => {
            let Some(id) = feed_id(parameters) else {
                return missing_param(target, "id");
            };
            let Some(value) = parameters.get("value") else {
                return missing_param(target, "value");
            };
            store.update_feed(id, value.clone());
            InvokeOutcome::ok(Value::Null)
        }
        "remove_context_feed" => {
            let Some(id) = feed_id(parameters) else {
                return missing_param(target, "id");
            };
            let existed = store.remove_feed(id);
            InvokeOutcome::ok(json!({ "removed": existed }))
        }
        "clear_context" => {
            store.clear_context();
            InvokeOutcome::ok(Value::Null)
        }
        "list_context_feeds" => InvokeOutcome::ok(json!(store.list_feeds())),
        other => InvokeOutcome::error(
            "unknown_internal",
            format!("no internal action named '{}'", other),
        ),
    }
}

fn str_param<'a>(parameters: &'a Value, key: &str) -> Option<&'a str> {
    parameters.get(key).and_then(Value::as_str)
}

/// `id` with `name` accepted as an alias.
fn feed_id(parameters: &Value) -> Option<&str> {
    str_param(parameters, "id").or_else(|| str_param(parameters, "name"))
}

fn missing_param(target: &str, key: &str) -> InvokeOutcome {
    InvokeOutcome::error(
        "invalid_parameters",
        format!("{} requires a '{}' parameter", target, key),
    )
}
