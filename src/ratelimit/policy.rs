//! Rate limit policy configuration and validation.
//!
//! A policy is immutable once built: the limit, the window length, the key
//! prefix that namespaces its buckets, and what to do when the counter store
//! cannot be reached.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{InkgateError, Result};

/// Time unit shorthand for policy windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of one unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// What a limiter decides when the counter store fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Admit the request. Keeps the protected surface available during a store outage.
    #[default]
    Open,
    /// Reject the request. For security-sensitive policies such as login attempts.
    Closed,
}

/// A policy as written in configuration.
///
/// The window is given either as `window_secs` or as a `unit`; when both are
/// present `window_secs` wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Maximum admitted requests per window
    pub limit: u64,
    /// Window length in seconds
    #[serde(default)]
    pub window_secs: Option<u64>,
    /// Window length as a time unit
    #[serde(default)]
    pub unit: Option<TimeUnit>,
    /// Bucket key prefix, defaults to the policy name
    #[serde(default)]
    pub key_prefix: Option<String>,
    /// Behaviour when the store is unavailable
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl PolicyConfig {
    pub fn per(limit: u64, unit: TimeUnit) -> Self {
        Self {
            limit,
            window_secs: None,
            unit: Some(unit),
            key_prefix: None,
            failure_mode: FailureMode::Open,
        }
    }

    fn window(&self) -> Option<Duration> {
        match (self.window_secs, self.unit) {
            (Some(secs), _) => Some(Duration::from_secs(secs)),
            (None, Some(unit)) => Some(unit.duration()),
            (None, None) => None,
        }
    }

    /// Build a validated policy named `name`.
    pub fn build(&self, name: &str) -> Result<Policy> {
        let window = self.window().ok_or_else(|| InkgateError::Misconfiguration {
            policy: name.to_string(),
            reason: "either window_secs or unit is required".to_string(),
        })?;
        let key_prefix = self.key_prefix.clone().unwrap_or_else(|| name.to_string());

        Policy::new(name, self.limit, window, key_prefix)
            .map(|policy| policy.with_failure_mode(self.failure_mode))
    }
}

/// A validated rate limit policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    name: String,
    limit: u64,
    window: Duration,
    key_prefix: String,
    failure_mode: FailureMode,
}

impl Policy {
    /// Create a fail-open policy, refusing non-positive limits or windows.
    pub fn new(
        name: impl Into<String>,
        limit: u64,
        window: Duration,
        key_prefix: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let key_prefix = key_prefix.into();

        let reason = if limit == 0 {
            Some("limit must be positive")
        } else if window.is_zero() {
            Some("window must be positive")
        } else if key_prefix.trim().is_empty() {
            Some("key prefix must not be empty")
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(InkgateError::Misconfiguration {
                policy: name,
                reason: reason.to_string(),
            });
        }

        Ok(Self {
            name,
            limit,
            window,
            key_prefix,
            failure_mode: FailureMode::Open,
        })
    }

    pub fn with_failure_mode(mut self, failure_mode: FailureMode) -> Self {
        self.failure_mode = failure_mode;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }
}

/// The per-action limits of the writing platform.
pub fn default_policies() -> BTreeMap<String, PolicyConfig> {
    let mut policies = BTreeMap::new();
    policies.insert("margin".to_string(), PolicyConfig::per(20, TimeUnit::Hour));
    policies.insert("btl_invite".to_string(), PolicyConfig::per(3, TimeUnit::Day));
    policies.insert("muse_prompt".to_string(), PolicyConfig::per(10, TimeUnit::Hour));
    policies.insert("muse_rewrite".to_string(), PolicyConfig::per(15, TimeUnit::Hour));
    policies.insert("muse_cover".to_string(), PolicyConfig::per(5, TimeUnit::Day));
    policies
}
