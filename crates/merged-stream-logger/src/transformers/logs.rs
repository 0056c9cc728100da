// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::{Duration, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::{LogLevel, LogSource, UnifiedLogEntry};
use crate::error::TransformError;
use crate::transformer::{StreamTransformer, TransformOutput};

pub const LOGS_STREAM_KIND: &str = "logs";

/// Raw event published on a `logs` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(default)]
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, alias = "timestampMs", skip_serializing_if = "Option::is_none")]
    pub timestamp_ms: Option<u64>,
}

/// Passes log events through, keeping their level, context, payload and
/// timestamp. A bare string is accepted as a `log`-level message.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStreamTransformer;

impl StreamTransformer for LogStreamTransformer {
    fn stream_kind(&self) -> &str {
        LOGS_STREAM_KIND
    }

    fn transform(
        &self,
        event: &Value,
        context: Option<&str>,
    ) -> Result<TransformOutput, TransformError> {
        if let Value::String(message) = event {
            let mut entry = UnifiedLogEntry::new(LogSource::Log, LogLevel::Log, message.clone());
            entry.context = context.map(str::to_string);
            return Ok(entry.into());
        }

        let event = LogEvent::deserialize(event)?;
        let mut entry = UnifiedLogEntry::new(LogSource::Log, event.level, event.message);
        entry.context = event.context.or_else(|| context.map(str::to_string));
        entry.data = event.data;
        entry.timestamp = event
            .timestamp_ms
            .map(|millis| UNIX_EPOCH + Duration::from_millis(millis));

        Ok(entry.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn single(output: TransformOutput) -> UnifiedLogEntry {
        match output {
            TransformOutput::Single(entry) => entry,
            TransformOutput::Many(_) => panic!("expected a single entry"),
        }
    }

    #[test]
    fn test_full_log_event() {
        let event = json!({
            "level": "warn",
            "message": "slow query",
            "context": "WorkoutRepository",
            "data": {"ms": 812},
            "timestamp_ms": 1_700_000_000_000u64,
        });

        let entry = single(LogStreamTransformer.transform(&event, Some("Other")).unwrap());
        assert_eq!(entry.source, LogSource::Log);
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "slow query");
        assert_eq!(entry.context.as_deref(), Some("WorkoutRepository"));
        assert_eq!(entry.data, Some(json!({"ms": 812})));
        assert_eq!(
            entry.timestamp,
            Some(UNIX_EPOCH + Duration::from_millis(1_700_000_000_000))
        );
    }

    #[test]
    fn test_minimal_log_event_uses_producer_context() {
        let event = json!({"message": "hello"});
        let entry = single(LogStreamTransformer.transform(&event, Some("Gateway")).unwrap());
        assert_eq!(entry.level, LogLevel::Log);
        assert_eq!(entry.context.as_deref(), Some("Gateway"));
        assert!(entry.timestamp.is_none());
    }

    #[test]
    fn test_bare_string_event() {
        let entry = single(
            LogStreamTransformer
                .transform(&json!("plain line"), None)
                .unwrap(),
        );
        assert_eq!(entry.level, LogLevel::Log);
        assert_eq!(entry.message, "plain line");
        assert!(entry.context.is_none());
    }

    #[test]
    fn test_missing_message_is_invalid_payload() {
        let result = LogStreamTransformer.transform(&json!({"level": "info"}), None);
        assert!(matches!(result, Err(TransformError::InvalidPayload(_))));
    }

    #[test]
    fn test_round_trip_with_camel_case_timestamp() {
        let event = json!({"message": "m", "timestampMs": 5});
        let entry = single(LogStreamTransformer.transform(&event, None).unwrap());
        assert_eq!(entry.timestamp, Some(UNIX_EPOCH + Duration::from_millis(5)));
    }
}
