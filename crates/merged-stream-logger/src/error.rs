// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors a transformer can report for a single source event.
///
/// None of these ever leave the aggregator: they are counted by the failure
/// tracker and surfaced through the sink's error channel.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error("missing field '{0}'")]
    MissingField(&'static str),

    #[error("{0}")]
    Rejected(String),

    #[error("transformer panicked: {0}")]
    Panicked(String),
}

impl TransformError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// Failure of a producer stream itself, as opposed to one of its events.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct StreamError {
    message: String,
}

impl StreamError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubscribeError {
    #[error("stream has already terminated")]
    Terminated,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_error_display() {
        let error = TransformError::MissingField("state");
        assert_eq!(error.to_string(), "missing field 'state'");

        let error = TransformError::rejected("bad shape");
        assert_eq!(error.to_string(), "bad shape");
    }

    #[test]
    fn test_transform_error_from_serde() {
        let parse_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let error: TransformError = parse_error.into();
        assert!(error.to_string().starts_with("invalid payload:"));
    }

    #[test]
    fn test_stream_error_message() {
        let error = StreamError::new("socket closed");
        assert_eq!(error.message(), "socket closed");
        assert_eq!(error.to_string(), "socket closed");
    }
}
