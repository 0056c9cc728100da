// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde::Deserialize;
use serde_json::Value;

use crate::entry::{LogLevel, LogSource, UnifiedLogEntry};
use crate::error::TransformError;
use crate::transformer::{StreamTransformer, TransformOutput};

pub const STATE_STREAM_KIND: &str = "state";

#[derive(Debug, Deserialize)]
struct StateChange {
    state: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default, alias = "previousState")]
    previous: Option<String>,
}

/// Turns `{state, reason?, previous?}` transitions into info entries such as
/// `State changed to DEGRADED: slow`. The raw event is kept as `data`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StateChangeTransformer;

impl StreamTransformer for StateChangeTransformer {
    fn stream_kind(&self) -> &str {
        STATE_STREAM_KIND
    }

    fn transform(
        &self,
        event: &Value,
        context: Option<&str>,
    ) -> Result<TransformOutput, TransformError> {
        let change = StateChange::deserialize(event)?;
        if change.state.trim().is_empty() {
            return Err(TransformError::MissingField("state"));
        }

        let mut message = match &change.previous {
            Some(previous) => format!("State changed from {} to {}", previous, change.state),
            None => format!("State changed to {}", change.state),
        };
        if let Some(reason) = change.reason.as_deref().filter(|r| !r.is_empty()) {
            message.push_str(": ");
            message.push_str(reason);
        }

        let mut entry = UnifiedLogEntry::new(LogSource::StateChange, LogLevel::Info, message)
            .with_data(event.clone());
        entry.context = context.map(str::to_string);
        Ok(entry.into())
    }
}
