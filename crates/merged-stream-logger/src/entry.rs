// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unified log entry every transformer produces.
//!
//! Producers publish events of any shape; once a transformer has normalized
//! them they all become a [`UnifiedLogEntry`]. Only `level` and `message` are
//! mandatory. `context` and `timestamp` are filled in by the aggregator when a
//! transformer leaves them empty.

use std::time::SystemTime;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Severity of a unified log entry.
///
/// `Log` is the plain, unlevelled channel and is also where anything
/// unrecognized ends up.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Verbose,
    Debug,
    Info,
    Warn,
    Error,
    #[default]
    Log,
}

impl LogLevel {
    /// Case-insensitive, never fails. `trace` is accepted as an alias of
    /// `verbose`, `warning` of `warn`, `fatal` of `error`.
    #[must_use]
    pub fn parse_lenient(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "verbose" | "trace" => LogLevel::Verbose,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" | "fatal" => LogLevel::Error,
            _ => LogLevel::Log,
        }
    }
}

impl AsRef<str> for LogLevel {
    fn as_ref(&self) -> &str {
        match self {
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Log => "log",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        LogLevel::parse_lenient(s)
    }
}

// Lenient: unknown strings and non-string values both map to `Log`.
impl<'de> Deserialize<'de> for LogLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::String(s) => Ok(LogLevel::parse_lenient(&s)),
            _ => Ok(LogLevel::Log),
        }
    }
}

/// Where an entry originated. Informational only, never used for routing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    #[default]
    Log,
    StateChange,
    RepositoryEvent,
    Custom,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnifiedLogEntry {
    pub source: LogSource,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<SystemTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl UnifiedLogEntry {
    #[must_use]
    pub fn new(source: LogSource, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            source,
            level,
            message: message.into(),
            context: None,
            timestamp: None,
            data: None,
        }
    }

    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Fills the fields a transformer may leave empty. Values already set by
    /// the transformer are kept.
    pub(crate) fn fill_defaults(&mut self, context: &str, now: SystemTime) {
        if self.context.is_none() {
            self.context = Some(context.to_string());
        }
        if self.timestamp.is_none() {
            self.timestamp = Some(now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_parse_lenient_known_levels() {
        assert_eq!(LogLevel::parse_lenient("ERROR"), LogLevel::Error);
        assert_eq!(LogLevel::parse_lenient("warn"), LogLevel::Warn);
        assert_eq!(LogLevel::parse_lenient("Warning"), LogLevel::Warn);
        assert_eq!(LogLevel::parse_lenient("info"), LogLevel::Info);
        assert_eq!(LogLevel::parse_lenient(" debug "), LogLevel::Debug);
        assert_eq!(LogLevel::parse_lenient("trace"), LogLevel::Verbose);
        assert_eq!(LogLevel::parse_lenient("verbose"), LogLevel::Verbose);
    }

    #[test]
    fn test_parse_lenient_unknown_falls_back_to_log() {
        assert_eq!(LogLevel::parse_lenient("loud"), LogLevel::Log);
        assert_eq!(LogLevel::parse_lenient(""), LogLevel::Log);
    }

    #[test]
    fn test_level_deserialize_is_lenient() {
        let level: LogLevel = serde_json::from_value(json!("info")).unwrap();
        assert_eq!(level, LogLevel::Info);

        let level: LogLevel = serde_json::from_value(json!("nonsense")).unwrap();
        assert_eq!(level, LogLevel::Log);

        let level: LogLevel = serde_json::from_value(json!(42)).unwrap();
        assert_eq!(level, LogLevel::Log);
    }

    #[test]
    fn test_level_serializes_lowercase() {
        assert_eq!(serde_json::to_value(LogLevel::Warn).unwrap(), json!("warn"));
        assert_eq!(LogLevel::Verbose.to_string(), "verbose");
    }

    #[test]
    fn test_fill_defaults_only_fills_missing_fields() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let earlier = SystemTime::UNIX_EPOCH + Duration::from_secs(1_600_000_000);

        let mut entry = UnifiedLogEntry::new(LogSource::Log, LogLevel::Info, "hello");
        entry.fill_defaults("WorkoutRepository", now);
        assert_eq!(entry.context.as_deref(), Some("WorkoutRepository"));
        assert_eq!(entry.timestamp, Some(now));

        let mut entry = UnifiedLogEntry::new(LogSource::Log, LogLevel::Info, "hello")
            .with_context("Explicit")
            .with_timestamp(earlier);
        entry.fill_defaults("WorkoutRepository", now);
        assert_eq!(entry.context.as_deref(), Some("Explicit"));
        assert_eq!(entry.timestamp, Some(earlier));
    }

    #[test]
    fn test_entry_serialization_skips_empty_fields() {
        let entry = UnifiedLogEntry::new(LogSource::StateChange, LogLevel::Info, "changed")
            .with_data(json!({"state": "IDLE"}));
        let value = serde_json::to_value(&entry).unwrap();
        assert_eq!(value["source"], json!("state_change"));
        assert_eq!(value["level"], json!("info"));
        assert_eq!(value["data"]["state"], json!("IDLE"));
        assert!(value.get("context").is_none());
        assert!(value.get("timestamp").is_none());
    }
}
