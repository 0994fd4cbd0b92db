// Copyright 2025 Sushanth (https://github.com/sushanthpy)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Engine configuration.

use crate::error::ConfigError;
use crate::event::EventKind;
use serde::{Deserialize, Serialize};

/// Configuration for a [`DispatchEngine`](crate::engine::DispatchEngine).
///
/// # Example TOML Configuration
///
/// ```toml
/// mismatch_policy = "warn"
/// self_call_barrier = false
///
/// [event_pool]
/// enabled = true
/// min_idle_per_kind = 50
/// max_idle_per_kind = 100
/// max_total_per_kind = 2000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Event pool settings.
    #[serde(default)]
    pub event_pool: EventPoolConfig,

    /// What to do when the process-stack check fails.
    #[serde(default)]
    pub mismatch_policy: MismatchPolicy,

    /// Answer `Proceed` to invocation notifications raised while this engine is
    /// already dispatching on the same thread.
    #[serde(default)]
    pub self_call_barrier: bool,

    /// First invoke id handed out.
    #[serde(default = "default_initial_invoke_id")]
    pub initial_invoke_id: u64,
}

fn default_initial_invoke_id() -> u64 {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_pool: EventPoolConfig::default(),
            mismatch_policy: MismatchPolicy::default(),
            self_call_barrier: false,
            initial_invoke_id: default_initial_invoke_id(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(toml_str).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_invoke_id == 0 {
            return Err(ConfigError::InvalidValue {
                field: "initial_invoke_id",
                reason: "0 is reserved for unassigned events".to_string(),
            });
        }
        self.event_pool.validate()
    }

    pub fn with_event_pool(mut self, event_pool: EventPoolConfig) -> Self {
        self.event_pool = event_pool;
        self
    }

    pub fn with_mismatch_policy(mut self, policy: MismatchPolicy) -> Self {
        self.mismatch_policy = policy;
        self
    }

    pub fn with_self_call_barrier(mut self, enabled: bool) -> Self {
        self.self_call_barrier = enabled;
        self
    }

    pub fn with_initial_invoke_id(mut self, id: u64) -> Self {
        self.initial_invoke_id = id;
        self
    }
}

/// Reaction to a process-stack mismatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MismatchPolicy {
    /// Log a warning and carry on.
    #[default]
    Warn,
    /// Fail the notification with `DispatchError::StackMismatch`.
    Strict,
}

/// Event pool settings. Limits apply per event kind unless noted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPoolConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Slots pre-allocated at construction.
    #[serde(default = "default_min_idle")]
    pub min_idle_per_kind: usize,

    /// Idle slots kept for reuse; extra returns are dropped.
    #[serde(default = "default_max_idle")]
    pub max_idle_per_kind: usize,

    /// Events of one kind that may be in flight from the pool at once.
    #[serde(default = "default_max_total_per_kind")]
    pub max_total_per_kind: usize,

    /// Events of all kinds in flight at once. Defaults to `max_total_per_kind` times
    /// the number of kinds.
    #[serde(default)]
    pub max_total: Option<usize>,
}

fn default_enabled() -> bool {
    true
}

fn default_min_idle() -> usize {
    50
}

fn default_max_idle() -> usize {
    100
}

fn default_max_total_per_kind() -> usize {
    2000
}

impl Default for EventPoolConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            min_idle_per_kind: default_min_idle(),
            max_idle_per_kind: default_max_idle(),
            max_total_per_kind: default_max_total_per_kind(),
            max_total: None,
        }
    }
}

impl EventPoolConfig {
    /// Pooling switched off: every borrow allocates.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn effective_max_total(&self) -> usize {
        self.max_total
            .unwrap_or(self.max_total_per_kind.saturating_mul(EventKind::COUNT))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_idle_per_kind > self.max_idle_per_kind {
            return Err(ConfigError::InvalidValue {
                field: "event_pool.min_idle_per_kind",
                reason: format!(
                    "{} exceeds max_idle_per_kind {}",
                    self.min_idle_per_kind, self.max_idle_per_kind
                ),
            });
        }
        if self.max_idle_per_kind > self.max_total_per_kind {
            return Err(ConfigError::InvalidValue {
                field: "event_pool.max_idle_per_kind",
                reason: format!(
                    "{} exceeds max_total_per_kind {}",
                    self.max_idle_per_kind, self.max_total_per_kind
                ),
            });
        }
        if self.enabled && self.max_total_per_kind == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_pool.max_total_per_kind",
                reason: "must be positive when pooling is enabled".to_string(),
            });
        }
        Ok(())
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_min_idle_per_kind(mut self, n: usize) -> Self {
        self.min_idle_per_kind = n;
        self
    }

    pub fn with_max_idle_per_kind(mut self, n: usize) -> Self {
        self.max_idle_per_kind = n;
        self
    }

    pub fn with_max_total_per_kind(mut self, n: usize) -> Self {
        self.max_total_per_kind = n;
        self
    }

    pub fn with_max_total(mut self, n: usize) -> Self {
        self.max_total = Some(n);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.event_pool.enabled);
        assert_eq!(config.event_pool.min_idle_per_kind, 50);
        assert_eq!(config.event_pool.max_idle_per_kind, 100);
        assert_eq!(config.event_pool.effective_max_total(), 2000 * 9);
        assert_eq!(config.mismatch_policy, MismatchPolicy::Warn);
        assert_eq!(config.initial_invoke_id, 1000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_json() {
        let json = r#"{
            "mismatch_policy": "strict",
            "event_pool": {"enabled": false}
        }"#;

        let config = EngineConfig::from_json(json).unwrap();
        assert_eq!(config.mismatch_policy, MismatchPolicy::Strict);
        assert!(!config.event_pool.enabled);
        assert_eq!(config.event_pool.max_idle_per_kind, 100);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
self_call_barrier = true

[event_pool]
min_idle_per_kind = 4
max_idle_per_kind = 8
max_total_per_kind = 16
max_total = 32
"#;

        let config = EngineConfig::from_toml(toml_str).unwrap();
        assert!(config.self_call_barrier);
        assert_eq!(config.event_pool.min_idle_per_kind, 4);
        assert_eq!(config.event_pool.effective_max_total(), 32);
    }

    #[test]
    fn test_validate_rejects_inverted_limits() {
        let config = EngineConfig::default().with_event_pool(
            EventPoolConfig::default()
                .with_min_idle_per_kind(10)
                .with_max_idle_per_kind(5),
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "event_pool.min_idle_per_kind", .. })
        ));

        let config = EngineConfig::default().with_initial_invoke_id(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_input_is_parse_error() {
        assert!(matches!(
            EngineConfig::from_json("{ not json"),
            Err(ConfigError::ParseError(_))
        ));
    }
}
