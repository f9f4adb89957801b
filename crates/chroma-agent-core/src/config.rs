//! Agent tunables and their layering.
//!
//! Values are resolved lowest to highest precedence: compiled defaults, the
//! `settings/agent` object from the persisted store, then an optional TOML
//! file. Durations are expressed in seconds in both sources.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("settings/agent must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    #[error("invalid agent config: {0}")]
    Invalid(String),
}

/// Shortest accepted period for anything that drives a loop.
pub const MIN_PERIOD: Duration = Duration::from_millis(100);
/// Longest accepted value of any duration setting.
pub const MAX_DURATION: Duration = Duration::from_secs(24 * 60 * 60);
/// Smallest accepted `max_bytes_per_post`.
pub const MIN_POST_BYTES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Device plugin poll period.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// Maximum +/- offset applied to each poll period.
    #[serde(with = "secs")]
    pub poll_jitter: Duration,
    /// Consecutive empty polls before the last snapshot is resent.
    pub failsafe_threshold: u32,
    /// Per-session buffer ceiling, in messages.
    pub session_buffer_limit: usize,
    pub batch_size: usize,
    pub max_bytes_per_post: usize,
    /// Empty POST period while the writer has nothing to send.
    #[serde(with = "secs")]
    pub keepalive: Duration,
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    pub action_workers: usize,
    #[serde(with = "secs")]
    pub session_backoff_min: Duration,
    #[serde(with = "secs")]
    pub session_backoff_max: Duration,
    #[serde(with = "secs")]
    pub backoff_initial: Duration,
    #[serde(with = "secs")]
    pub backoff_max: Duration,
    /// Relative jitter applied to transport backoff delays (0.2 = +/-20%).
    pub backoff_jitter: f64,
    #[serde(with = "secs")]
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            poll_jitter: Duration::from_secs(1),
            failsafe_threshold: 10,
            session_buffer_limit: 1000,
            batch_size: 100,
            max_bytes_per_post: 8 * 1024 * 1024,
            keepalive: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            action_workers: 4,
            session_backoff_min: Duration::from_secs(10),
            session_backoff_max: Duration::from_secs(60),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            backoff_jitter: 0.2,
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl AgentConfig {
    /// Resolve the effective config from the persisted `settings/agent`
    /// object and the contents of an optional TOML file.
    pub fn layered(stored: Option<&Value>, toml_text: Option<&str>) -> Result<Self, ConfigError> {
        let mut merged = match serde_json::to_value(Self::default()) {
            Ok(Value::Object(map)) => map,
            _ => return Err(ConfigError::Invalid("defaults did not serialize".into())),
        };

        if let Some(stored) = stored {
            match stored {
                Value::Object(map) => overlay(&mut merged, map),
                Value::Null => {}
                other => return Err(ConfigError::NotAnObject(json_type(other))),
            }
        }

        if let Some(text) = toml_text {
            let table: toml::Table = toml::from_str(text)?;
            let value = serde_json::to_value(table)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if let Value::Object(map) = value {
                overlay(&mut merged, &map);
            }
        }

        let config: AgentConfig = serde_json::from_value(Value::Object(merged))
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let periods = [
            ("poll_interval", self.poll_interval),
            ("keepalive", self.keepalive),
            ("request_timeout", self.request_timeout),
            ("session_backoff_min", self.session_backoff_min),
            ("backoff_initial", self.backoff_initial),
        ];
        for (name, value) in periods {
            if value < MIN_PERIOD {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at least {MIN_PERIOD:?}"
                )));
            }
        }
        let others = [
            ("poll_jitter", self.poll_jitter),
            ("session_backoff_max", self.session_backoff_max),
            ("backoff_max", self.backoff_max),
            ("shutdown_grace", self.shutdown_grace),
        ];
        for (name, value) in periods.into_iter().chain(others) {
            if value > MAX_DURATION {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be at most {MAX_DURATION:?}"
                )));
            }
        }
        if self.poll_jitter >= self.poll_interval {
            return Err(ConfigError::Invalid(
                "poll_jitter must be shorter than poll_interval".into(),
            ));
        }
        if self.max_bytes_per_post < MIN_POST_BYTES {
            return Err(ConfigError::Invalid(format!(
                "max_bytes_per_post must be at least {MIN_POST_BYTES}"
            )));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if self.action_workers == 0 {
            return Err(ConfigError::Invalid("action_workers must be at least 1".into()));
        }
        if self.session_buffer_limit == 0 {
            return Err(ConfigError::Invalid(
                "session_buffer_limit must be at least 1".into(),
            ));
        }
        if self.failsafe_threshold == 0 {
            return Err(ConfigError::Invalid(
                "failsafe_threshold must be at least 1".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::Invalid(
                "backoff_jitter must be in [0, 1)".into(),
            ));
        }
        if self.session_backoff_min > self.session_backoff_max
            || self.backoff_initial > self.backoff_max
        {
            return Err(ConfigError::Invalid(
                "backoff minimum exceeds its maximum".into(),
            ));
        }
        Ok(())
    }
}

fn overlay(base: &mut Map<String, Value>, layer: &Map<String, Value>) {
    for (key, value) in layer {
        base.insert(key.clone(), value.clone());
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Durations as fractional seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_valid() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.poll_interval, Duration::from_secs(10));
        assert_eq!(config.action_workers, 4);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
    }

    #[test]
    fn no_layers_yields_defaults() {
        let config = AgentConfig::layered(None, None).unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn stored_settings_override_defaults() {
        let stored = json!({"poll_interval": 2.5, "batch_size": 10});
        let config = AgentConfig::layered(Some(&stored), None).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(2500));
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.keepalive, Duration::from_secs(30));
    }

    #[test]
    fn toml_file_wins_over_store() {
        let stored = json!({"batch_size": 10, "action_workers": 2});
        let toml_text = r#"
batch_size = 50
keepalive = 5
"#;
        let config = AgentConfig::layered(Some(&stored), Some(toml_text)).unwrap();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.action_workers, 2);
        assert_eq!(config.keepalive, Duration::from_secs(5));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let stored = json!({"pol_interval": 3});
        let err = AgentConfig::layered(Some(&stored), None).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn loop_periods_have_a_floor() {
        for key in ["keepalive", "poll_interval", "request_timeout", "backoff_initial"] {
            let stored = json!({ key: 0 });
            let err = AgentConfig::layered(Some(&stored), None).unwrap_err();
            assert!(err.to_string().contains(key), "{key}: {err}");
        }
        let stored = json!({"keepalive": 0.05});
        assert!(AgentConfig::layered(Some(&stored), None).is_err());
    }

    #[test]
    fn durations_have_a_ceiling() {
        let stored = json!({"keepalive": 1e15});
        let err = AgentConfig::layered(Some(&stored), None).unwrap_err();
        assert!(err.to_string().contains("keepalive"));

        let toml_text = "shutdown_grace = 90000\n";
        assert!(AgentConfig::layered(None, Some(toml_text)).is_err());

        let stored = json!({"keepalive": 86400, "backoff_max": 86400});
        AgentConfig::layered(Some(&stored), None).unwrap();
    }

    #[test]
    fn jitter_and_post_size_are_bounded() {
        let stored = json!({"poll_interval": 1, "poll_jitter": 1});
        assert!(AgentConfig::layered(Some(&stored), None).is_err());

        let stored = json!({"max_bytes_per_post": 100});
        let err = AgentConfig::layered(Some(&stored), None).unwrap_err();
        assert!(err.to_string().contains("max_bytes_per_post"));
    }

    #[test]
    fn zero_workers_is_invalid() {
        let err = AgentConfig::layered(None, Some("action_workers = 0")).unwrap_err();
        assert!(err.to_string().contains("action_workers"));
    }

    #[test]
    fn stored_settings_must_be_an_object() {
        let err = AgentConfig::layered(Some(&json!([1, 2])), None).unwrap_err();
        assert!(matches!(err, ConfigError::NotAnObject("an array")));
    }

    #[test]
    fn malformed_toml_is_reported() {
        let err = AgentConfig::layered(None, Some("batch_size = ")).unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }
}
