// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use serde_json::Value;

use crate::entry::UnifiedLogEntry;
use crate::error::TransformError;

/// Maps the raw events of one stream kind onto unified log entries.
///
/// Implementations must only shape data. Any error they return, and any
/// panic they raise, is caught by the aggregator and counted against the
/// subscription that delivered the event.
pub trait StreamTransformer: Send + Sync {
    /// Stream kind this transformer handles, e.g. `"state"`.
    fn stream_kind(&self) -> &str;

    /// `context` is the name of the producer the event came from.
    fn transform(
        &self,
        event: &Value,
        context: Option<&str>,
    ) -> Result<TransformOutput, TransformError>;
}

/// One event may become one entry or several.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformOutput {
    Single(UnifiedLogEntry),
    Many(Vec<UnifiedLogEntry>),
}

impl TransformOutput {
    #[must_use]
    pub fn into_entries(self) -> Vec<UnifiedLogEntry> {
        match self {
            TransformOutput::Single(entry) => vec![entry],
            TransformOutput::Many(entries) => entries,
        }
    }
}

impl From<UnifiedLogEntry> for TransformOutput {
    fn from(entry: UnifiedLogEntry) -> Self {
        TransformOutput::Single(entry)
    }
}

impl From<Vec<UnifiedLogEntry>> for TransformOutput {
    fn from(entries: Vec<UnifiedLogEntry>) -> Self {
        TransformOutput::Many(entries)
    }
}
