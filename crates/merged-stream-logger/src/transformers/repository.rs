// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use serde_json::Value;

use crate::entry::{LogLevel, LogSource, UnifiedLogEntry};
use crate::error::TransformError;
use crate::transformer::{StreamTransformer, TransformOutput};

pub const REPOSITORY_STREAM_KIND: &str = "repository";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RepositoryEvent {
    operation: String,
    entity: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default, alias = "duration_ms")]
    duration_ms: Option<u64>,
    #[serde(default)]
    error: Option<Value>,
}

/// Persistence operations become debug entries; operations carrying an
/// `error` become error entries with the error as payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct RepositoryEventTransformer;

impl StreamTransformer for RepositoryEventTransformer {
    fn stream_kind(&self) -> &str {
        REPOSITORY_STREAM_KIND
    }

    fn transform(
        &self,
        event: &Value,
        context: Option<&str>,
    ) -> Result<TransformOutput, TransformError> {
        let event = RepositoryEvent::deserialize(event)?;
        if event.operation.is_empty() {
            return Err(TransformError::MissingField("operation"));
        }

        let mut message = format!("{} {}", event.operation, event.entity);
        match &event.id {
            Some(Value::String(id)) => message.push_str(&format!(" #{id}")),
            Some(Value::Null) | None => {}
            Some(id) => message.push_str(&format!(" #{id}")),
        }
        if let Some(duration) = event.duration_ms {
            message.push_str(&format!(" ({duration}ms)"));
        }

        let mut entry = match event.error {
            Some(error) => {
                let reason = match &error {
                    Value::String(s) => s.clone(),
                    Value::Object(map) => map
                        .get("message")
                        .and_then(Value::as_str)
                        .map_or_else(|| error.to_string(), str::to_string),
                    other => other.to_string(),
                };
                UnifiedLogEntry::new(
                    LogSource::RepositoryEvent,
                    LogLevel::Error,
                    format!("{message} failed: {reason}"),
                )
                .with_data(error)
            }
            None => UnifiedLogEntry::new(LogSource::RepositoryEvent, LogLevel::Debug, message),
        };

        entry.context = context.map(str::to_string);
        Ok(entry.into())
    }
}
