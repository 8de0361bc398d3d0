//! Configuration management for the rate limit plugin.
//!
//! The host platform owns the persisted configuration; this module describes
//! its shape, loads it from a file plus environment overrides, and converts the
//! compact `"id:count"` override lists into typed maps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{RateLimitError, Result};

/// Prefix for environment variable overrides, e.g. `LLM_RATELIMIT__MAX_REQUESTS=3`.
pub const ENV_PREFIX: &str = "LLM_RATELIMIT";

/// Plugin configuration as stored by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginConfig {
    /// Maximum requests per user within the time window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Length of the sliding window in seconds
    #[serde(default = "default_time_window")]
    pub time_window_seconds: f64,

    /// Users exempt from limiting
    #[serde(default)]
    pub whitelist: Vec<String>,

    /// Rejection template with `{cooldown}`, `{max}` and `{window}` placeholders
    #[serde(default = "default_tip_message")]
    pub tip_message: String,

    /// Per-user overrides as `"user_id:count"`
    #[serde(default)]
    pub user_limits: Vec<String>,

    /// Per-group overrides of each member's limit as `"group_id:count"`
    #[serde(default)]
    pub group_limits: Vec<String>,

    /// Shared budgets for whole groups as `"group_id:count"`
    #[serde(default)]
    pub group_total_limits: Vec<String>,

    /// What to do when evaluation hits an internal fault
    #[serde(default)]
    pub fail_policy: FailPolicy,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            time_window_seconds: default_time_window(),
            whitelist: Vec::new(),
            tip_message: default_tip_message(),
            user_limits: Vec::new(),
            group_limits: Vec::new(),
            group_total_limits: Vec::new(),
            fail_policy: FailPolicy::default(),
        }
    }
}

fn default_max_requests() -> u64 {
    6
}

fn default_time_window() -> f64 {
    60.0
}

pub(crate) fn default_tip_message() -> String {
    "⚠️ Too many requests, please retry in {cooldown}s. (limit: {max} per {window}s)".to_string()
}

/// Behavior of the plugin boundary when the limiter faults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Admit the request
    #[default]
    FailOpen,
    /// Reject the request
    FailClosed,
}

impl PluginConfig {
    /// Load configuration from an optional file, layered with environment overrides.
    ///
    /// Lists can be overridden with comma separated values, for example
    /// `LLM_RATELIMIT__WHITELIST=alice,bob`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading rate limit configuration");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: PluginConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("whitelist")
                    .with_list_parse_key("user_limits")
                    .with_list_parse_key("group_limits")
                    .with_list_parse_key("group_total_limits"),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: PluginConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateLimitError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize the configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| RateLimitError::Config(e.to_string()))
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<()> {
        window_duration(self.time_window_seconds).map(|_| ())
    }

    /// Typed view of `user_limits`.
    pub fn user_limit_map(&self) -> BTreeMap<String, u64> {
        parse_limit_list(&self.user_limits)
    }

    /// Typed view of `group_limits`.
    pub fn group_limit_map(&self) -> BTreeMap<String, u64> {
        parse_limit_list(&self.group_limits)
    }

    /// Typed view of `group_total_limits`.
    pub fn group_total_limit_map(&self) -> BTreeMap<String, u64> {
        parse_limit_list(&self.group_total_limits)
    }
}

/// Convert a window length in seconds, rejecting zero, negative and unrepresentable values.
pub(crate) fn window_duration(seconds: f64) -> Result<Duration> {
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(RateLimitError::invalid(
            "time_window_seconds",
            format!("must be a positive number of seconds, got {}", seconds),
        ));
    }
    let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
        RateLimitError::invalid("time_window_seconds", format!("{} seconds is too large", seconds))
    })?;
    if duration.is_zero() {
        return Err(RateLimitError::invalid(
            "time_window_seconds",
            format!("{} seconds is shorter than one nanosecond", seconds),
        ));
    }
    Ok(duration)
}

/// Parse `["id:count", ...]` into a map. Malformed entries are skipped.
pub fn parse_limit_list(raw: &[String]) -> BTreeMap<String, u64> {
    let mut limits = BTreeMap::new();

    for entry in raw {
        let entry = entry.trim();
        let Some((id, count)) = entry.split_once(':') else {
            warn!(entry = %entry, "Skipping limit entry without ':' separator");
            continue;
        };

        let id = id.trim();
        match count.trim().parse::<u64>() {
            Ok(count) if !id.is_empty() => {
                limits.insert(id.to_string(), count);
            }
            _ => warn!(entry = %entry, "Skipping malformed limit entry"),
        }
    }

    limits
}

/// Serialize a limit map back into `["id:count", ...]`.
pub fn dump_limit_list(limits: &BTreeMap<String, u64>) -> Vec<String> {
    limits
        .iter()
        .map(|(id, count)| format!("{}:{}", id, count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PluginConfig::default();
        assert_eq!(config.max_requests, 6);
        assert_eq!(config.time_window_seconds, 60.0);
        assert!(config.whitelist.is_empty());
        assert!(config.tip_message.contains("{cooldown}"));
        assert_eq!(config.fail_policy, FailPolicy::FailOpen);
    }

    #[test]
    fn test_parse_partial_yaml_uses_defaults() {
        let yaml = r#"
max_requests: 3
whitelist:
  - bob
"#;
        let config = PluginConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.max_requests, 3);
        assert_eq!(config.time_window_seconds, 60.0);
        assert_eq!(config.whitelist, vec!["bob".to_string()]);
        assert_eq!(config.tip_message, default_tip_message());
    }

    #[test]
    fn test_parse_full_yaml() {
        let yaml = r#"
max_requests: 10
time_window_seconds: 30.5
tip_message: "slow down, {cooldown}s left"
user_limits: ["slow:2"]
group_limits: ["vip:7"]
group_total_limits: ["lobby:20"]
fail_policy: fail_closed
"#;
        let config = PluginConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.time_window_seconds, 30.5);
        assert_eq!(config.fail_policy, FailPolicy::FailClosed);
        assert_eq!(config.user_limit_map().get("slow"), Some(&2));
        assert_eq!(config.group_limit_map().get("vip"), Some(&7));
        assert_eq!(config.group_total_limit_map().get("lobby"), Some(&20));
    }

    #[test]
    fn test_zero_window_rejected() {
        let result = PluginConfig::from_yaml("time_window_seconds: 0");
        assert!(matches!(
            result,
            Err(RateLimitError::InvalidConfig {
                field: "time_window_seconds",
                ..
            })
        ));
    }

    #[test]
    fn test_sub_nanosecond_window_rejected() {
        let result = PluginConfig::from_yaml("time_window_seconds: 0.0000000001");
        assert!(matches!(
            result,
            Err(RateLimitError::InvalidConfig {
                field: "time_window_seconds",
                ..
            })
        ));
        assert!(window_duration(1e-10).is_err());
        assert_eq!(window_duration(1e-9).unwrap(), Duration::from_nanos(1));
    }

    #[test]
    fn test_parse_limit_list_skips_malformed() {
        let raw = vec![
            "alice:3".to_string(),
            " bob : 4 ".to_string(),
            "no_separator".to_string(),
            "carol:lots".to_string(),
            ":5".to_string(),
        ];
        let limits = parse_limit_list(&raw);
        assert_eq!(limits.len(), 2);
        assert_eq!(limits["alice"], 3);
        assert_eq!(limits["bob"], 4);
    }

    #[test]
    fn test_dump_limit_list() {
        let mut limits = BTreeMap::new();
        limits.insert("g2".to_string(), 9);
        limits.insert("g1".to_string(), 4);
        assert_eq!(dump_limit_list(&limits), vec!["g1:4", "g2:9"]);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!(
            "llm-ratelimit-config-{}.yaml",
            std::process::id()
        ));
        std::fs::write(&path, "max_requests: 4\ntime_window_seconds: 15\n").unwrap();

        let config = PluginConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_requests, 4);
        assert_eq!(config.time_window_seconds, 15.0);

        std::fs::remove_file(&path).unwrap();
    }
}
