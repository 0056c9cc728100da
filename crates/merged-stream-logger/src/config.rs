// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt::Display;
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use serde_json::Value;

pub const DEFAULT_MAX_FAILURES: u32 = 5;
pub const DEFAULT_BACKOFF_RESET_MS: u64 = 60_000;
pub const MIN_BACKOFF_RESET_MS: u64 = 100;

const ENV_MAX_FAILURES: &str = "STREAM_LOGGER_MAX_FAILURES";
const ENV_BACKOFF_RESET_MS: &str = "STREAM_LOGGER_BACKOFF_RESET_MS";
const ENV_LOG_RECOVERY_EVENTS: &str = "STREAM_LOGGER_LOG_RECOVERY_EVENTS";
const ENV_WARN_ON_MISSING_MAPPERS: &str = "STREAM_LOGGER_WARN_ON_MISSING_MAPPERS";

/// One caller-supplied option value. Input of the wrong type is kept as
/// `Invalid` with its raw text so validation can report it without
/// discarding the other options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setting<T> {
    Value(T),
    Invalid(String),
}

/// Types a [`Setting`] can hold.
pub trait SettingValue: Sized {
    fn from_json(value: &Value) -> Option<Self>;

    fn from_text(text: &str) -> Option<Self>;
}

impl SettingValue for i64 {
    fn from_json(value: &Value) -> Option<Self> {
        value
            .as_i64()
            .or_else(|| value.as_str().and_then(Self::from_text))
    }

    fn from_text(text: &str) -> Option<Self> {
        text.trim().parse().ok()
    }
}

impl SettingValue for bool {
    fn from_json(value: &Value) -> Option<Self> {
        value
            .as_bool()
            .or_else(|| value.as_str().and_then(Self::from_text))
    }

    fn from_text(text: &str) -> Option<Self> {
        match text.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        }
    }
}

impl<T: SettingValue> Setting<T> {
    fn parse_text(raw: &str) -> Self {
        T::from_text(raw).map_or_else(|| Setting::Invalid(raw.to_string()), Setting::Value)
    }
}

// Never fails: anything that is not a `T` becomes `Invalid`.
impl<'de, T: SettingValue> Deserialize<'de> for Setting<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        Ok(match T::from_json(&value) {
            Some(parsed) => Setting::Value(parsed),
            None => match value {
                Value::String(raw) => Setting::Invalid(raw),
                other => Setting::Invalid(other.to_string()),
            },
        })
    }
}

/// Caller-supplied options. Every field is optional, numbers are kept signed
/// and mistyped values are kept as [`Setting::Invalid`], so a bad field is
/// reported by [`validate`](Self::validate) instead of failing the whole
/// object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamLoggerOptions {
    #[serde(alias = "maxFailures")]
    pub max_failures: Option<Setting<i64>>,
    #[serde(alias = "backoffResetMs")]
    pub backoff_reset_ms: Option<Setting<i64>>,
    #[serde(alias = "logRecoveryEvents")]
    pub log_recovery_events: Option<Setting<bool>>,
    #[serde(alias = "warnOnMissingMappers")]
    pub warn_on_missing_mappers: Option<Setting<bool>>,
}

impl StreamLoggerOptions {
    /// Reads options from `STREAM_LOGGER_*` environment variables. Unset or
    /// blank variables stay `None`; unparsable ones are kept as invalid.
    pub fn from_env() -> Self {
        Self {
            max_failures: read_env(ENV_MAX_FAILURES),
            backoff_reset_ms: read_env(ENV_BACKOFF_RESET_MS),
            log_recovery_events: read_env(ENV_LOG_RECOVERY_EVENTS),
            warn_on_missing_mappers: read_env(ENV_WARN_ON_MISSING_MAPPERS),
        }
    }

    #[must_use]
    pub fn with_max_failures(mut self, value: i64) -> Self {
        self.max_failures = Some(Setting::Value(value));
        self
    }

    #[must_use]
    pub fn with_backoff_reset_ms(mut self, value: i64) -> Self {
        self.backoff_reset_ms = Some(Setting::Value(value));
        self
    }

    #[must_use]
    pub fn with_log_recovery_events(mut self, value: bool) -> Self {
        self.log_recovery_events = Some(Setting::Value(value));
        self
    }

    #[must_use]
    pub fn with_warn_on_missing_mappers(mut self, value: bool) -> Self {
        self.warn_on_missing_mappers = Some(Setting::Value(value));
        self
    }

    /// Validates field by field. A bad field falls back to its default and is
    /// reported in the returned list; the other fields are kept.
    pub fn validate(&self) -> (StreamLoggerConfig, Vec<RejectedOption>) {
        let defaults = StreamLoggerConfig::default();
        let mut rejected = Vec::new();

        let max_failures = checked(
            "maxFailures",
            self.max_failures.as_ref(),
            "must be an integer >= 1",
            DEFAULT_MAX_FAILURES,
            |value| u32::try_from(value).ok().filter(|valid| *valid >= 1),
            &mut rejected,
        );
        let backoff_reset_ms = checked(
            "backoffResetMs",
            self.backoff_reset_ms.as_ref(),
            "must be an integer >= 100",
            DEFAULT_BACKOFF_RESET_MS,
            |value| {
                u64::try_from(value)
                    .ok()
                    .filter(|valid| *valid >= MIN_BACKOFF_RESET_MS)
            },
            &mut rejected,
        );
        let log_recovery_events = checked(
            "logRecoveryEvents",
            self.log_recovery_events.as_ref(),
            "must be a boolean",
            defaults.log_recovery_events,
            Some,
            &mut rejected,
        );
        let warn_on_missing_mappers = checked(
            "warnOnMissingMappers",
            self.warn_on_missing_mappers.as_ref(),
            "must be a boolean",
            defaults.warn_on_missing_mappers,
            Some,
            &mut rejected,
        );

        let config = StreamLoggerConfig {
            max_failures,
            backoff_reset: Duration::from_millis(backoff_reset_ms),
            log_recovery_events,
            warn_on_missing_mappers,
        };
        (config, rejected)
    }
}

fn checked<T, U>(
    field: &'static str,
    setting: Option<&Setting<T>>,
    requirement: &'static str,
    fallback: U,
    accept: impl Fn(T) -> Option<U>,
    rejected: &mut Vec<RejectedOption>,
) -> U
where
    T: Copy + Display,
    U: Display,
{
    let raw = match setting {
        None => return fallback,
        Some(Setting::Value(value)) => match accept(*value) {
            Some(valid) => return valid,
            None => value.to_string(),
        },
        Some(Setting::Invalid(raw)) => raw.clone(),
    };
    rejected.push(RejectedOption {
        field,
        value: raw,
        requirement,
        fallback: fallback.to_string(),
    });
    fallback
}

fn read_env<T: SettingValue>(name: &str) -> Option<Setting<T>> {
    let raw = env::var(name).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(Setting::parse_text(trimmed))
}

/// An option value that failed validation and was replaced by its default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOption {
    pub field: &'static str,
    pub value: String,
    pub requirement: &'static str,
    pub fallback: String,
}

impl std::fmt::Display for RejectedOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid {} value {} ({}), using default {}",
            self.field, self.value, self.requirement, self.fallback
        )
    }
}

/// Effective, validated configuration of the aggregator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamLoggerConfig {
    /// Failures per subscription logged at error level before throttling.
    pub max_failures: u32,
    /// Idle time after the last failure before a subscription's count resets.
    pub backoff_reset: Duration,
    pub log_recovery_events: bool,
    pub warn_on_missing_mappers: bool,
}

impl Default for StreamLoggerConfig {
    fn default() -> Self {
        Self {
            max_failures: DEFAULT_MAX_FAILURES,
            backoff_reset: Duration::from_millis(DEFAULT_BACKOFF_RESET_MS),
            log_recovery_events: true,
            warn_on_missing_mappers: true,
        }
    }
}
