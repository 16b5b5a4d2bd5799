//! Conductor configuration loaded from the activation environment.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;

/// Echo action used to re-enqueue a parent whose collect timed out.
pub const DEFAULT_HEARTBEAT_ACTION: &str = "/whisk.system/utils/echo";

/// Per-activation configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// The conductor's own action name; spawns re-invoke it.
    pub action_name: String,

    /// Activation id of the current entry; becomes the session id for a
    /// fresh execution.
    pub activation_id: String,

    /// Hard deadline of the current activation, when the platform set one.
    pub deadline: Option<DateTime<Utc>>,

    /// Action invoked to self-extend past the activation deadline.
    pub heartbeat_action: String,

    /// Invocation options smuggled through `DEBUG=needle<{…}>`.
    pub invoke_overrides: Option<Value>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let action_name = std::env::var("__OW_ACTION_NAME")
            .map_err(|_| anyhow::anyhow!("__OW_ACTION_NAME must be set"))?;

        let activation_id = std::env::var("__OW_ACTIVATION_ID")
            .unwrap_or_else(|_| uuid::Uuid::new_v4().to_string());

        let deadline = std::env::var("__OW_DEADLINE")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());

        let heartbeat_action = std::env::var("BATON_HEARTBEAT_ACTION")
            .unwrap_or_else(|_| DEFAULT_HEARTBEAT_ACTION.to_string());

        let invoke_overrides = std::env::var("DEBUG")
            .ok()
            .and_then(|debug| parse_needle(&debug));

        Ok(Config {
            action_name,
            activation_id,
            deadline,
            heartbeat_action,
            invoke_overrides,
        })
    }

    /// Configuration for in-process runs, with no platform environment.
    pub fn local(action_name: impl Into<String>) -> Self {
        Config {
            action_name: action_name.into(),
            activation_id: uuid::Uuid::new_v4().to_string(),
            deadline: None,
            heartbeat_action: DEFAULT_HEARTBEAT_ACTION.to_string(),
            invoke_overrides: None,
        }
    }
}

/// Extract invoke overrides from a `DEBUG` value containing
/// `needle<{…json…}>`.
fn parse_needle(debug: &str) -> Option<Value> {
    let start = debug.find("needle<")? + "needle<".len();
    let end = debug[start..].rfind('>')? + start;
    serde_json::from_str(&debug[start..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn needle_overrides_are_extracted() {
        let overrides = parse_needle("composer:*,needle<{\"proxy\":\"http://localhost:8080\"}>");
        assert_eq!(overrides, Some(json!({"proxy": "http://localhost:8080"})));
    }

    #[test]
    fn needle_handles_nested_angle_brackets() {
        let overrides = parse_needle("needle<{\"agent\":\"a<b>\"}>");
        assert_eq!(overrides, Some(json!({"agent": "a<b>"})));
    }

    #[test]
    fn absent_or_malformed_needle_is_ignored() {
        assert_eq!(parse_needle("composer:*"), None);
        assert_eq!(parse_needle("needle<not-json>"), None);
    }
}
