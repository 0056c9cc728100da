// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer side of the pipeline.
//!
//! Any component that wants its events merged into the log implements
//! [`StreamProducer`] and exposes its streams by kind. Components that only
//! need plain logging hold a [`LogEmitter`] instead of inheriting a logging
//! base type.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::warn;

use crate::entry::LogLevel;
use crate::stream::EventStream;
use crate::transformers::logs::{LogEvent, LOGS_STREAM_KIND};

/// A component exposing named event streams to the aggregator.
pub trait StreamProducer: Send + Sync {
    /// Streams keyed by stream kind.
    fn streams(&self) -> HashMap<String, EventStream>;

    /// Identity used for subscription bookkeeping when the descriptor does
    /// not override it. Defaults to the implementing type's name.
    fn producer_name(&self) -> Option<String> {
        let name = short_type_name(std::any::type_name::<Self>());
        (!name.is_empty()).then(|| name.to_string())
    }
}

/// `my_app::repo::WorkoutRepository<Pg>` -> `WorkoutRepository`
pub(crate) fn short_type_name(full: &str) -> &str {
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
        .trim()
}

/// Logging capability owned by a component.
///
/// Publishes [`LogEvent`]s on a `logs` stream that the built-in
/// [`LogStreamTransformer`](crate::transformers::LogStreamTransformer)
/// understands.
#[derive(Clone, Debug)]
pub struct LogEmitter {
    name: String,
    stream: EventStream,
}

impl LogEmitter {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stream: EventStream::new(LOGS_STREAM_KIND),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stream(&self) -> &EventStream {
        &self.stream
    }

    /// Publishes an arbitrary raw event on the logs stream.
    pub fn publish(&self, value: Value) -> usize {
        self.stream.emit(value)
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>, data: Option<Value>) -> usize {
        let event = LogEvent {
            level,
            message: message.into(),
            context: Some(self.name.clone()),
            data,
            timestamp_ms: unix_millis(SystemTime::now()),
        };
        match serde_json::to_value(&event) {
            Ok(value) => self.stream.emit(value),
            Err(e) => {
                warn!("Failed to serialize log event from '{}': {}", self.name, e);
                0
            }
        }
    }

    pub fn error(&self, message: impl Into<String>, data: Option<Value>) -> usize {
        self.log(LogLevel::Error, message, data)
    }

    pub fn warn(&self, message: impl Into<String>) -> usize {
        self.log(LogLevel::Warn, message, None)
    }

    pub fn info(&self, message: impl Into<String>) -> usize {
        self.log(LogLevel::Info, message, None)
    }

    pub fn debug(&self, message: impl Into<String>) -> usize {
        self.log(LogLevel::Debug, message, None)
    }

    pub fn verbose(&self, message: impl Into<String>, data: Option<Value>) -> usize {
        self.log(LogLevel::Verbose, message, data)
    }

    /// Ends the logs stream; subscribers see a normal completion.
    pub fn close(&self) {
        self.stream.complete();
    }
}

impl StreamProducer for LogEmitter {
    fn streams(&self) -> HashMap<String, EventStream> {
        HashMap::from([(LOGS_STREAM_KIND.to_string(), self.stream.clone())])
    }

    fn producer_name(&self) -> Option<String> {
        Some(self.name.clone())
    }
}

pub(crate) fn unix_millis(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| u64::try_from(elapsed.as_millis()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StreamError;
    use crate::stream::StreamObserver;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Capture {
        values: Mutex<Vec<Value>>,
    }

    impl StreamObserver for Capture {
        fn on_next(&self, value: &Value) {
            self.values.lock().unwrap().push(value.clone());
        }

        fn on_error(&self, _error: &StreamError) {}
    }

    struct WorkoutRepository;

    impl StreamProducer for WorkoutRepository {
        fn streams(&self) -> HashMap<String, EventStream> {
            HashMap::new()
        }
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name("a::b::WorkoutRepository"), "WorkoutRepository");
        assert_eq!(short_type_name("a::b::Repo<c::Pg>"), "Repo");
        assert_eq!(short_type_name("Plain"), "Plain");
    }

    #[test]
    fn test_default_producer_name_is_type_name() {
        let producer = WorkoutRepository;
        assert_eq!(producer.producer_name().as_deref(), Some("WorkoutRepository"));

        let boxed: Arc<dyn StreamProducer> = Arc::new(WorkoutRepository);
        assert_eq!(boxed.producer_name().as_deref(), Some("WorkoutRepository"));
    }

    #[test]
    fn test_log_emitter_publishes_log_events() {
        let emitter = LogEmitter::new("SessionController");
        let capture = Arc::new(Capture::default());
        let _subscription = emitter.stream().subscribe(capture.clone()).unwrap();

        assert_eq!(emitter.info("session started"), 1);
        assert_eq!(emitter.error("session failed", Some(json!({"code": 7}))), 1);

        let values = capture.values.lock().unwrap();
        assert_eq!(values.len(), 2);
        assert_eq!(values[0]["level"], json!("info"));
        assert_eq!(values[0]["message"], json!("session started"));
        assert_eq!(values[0]["context"], json!("SessionController"));
        assert!(values[0]["timestamp_ms"].is_u64());
        assert_eq!(values[1]["level"], json!("error"));
        assert_eq!(values[1]["data"]["code"], json!(7));
    }

    #[test]
    fn test_log_emitter_as_producer() {
        let emitter = LogEmitter::new("SessionController");
        let streams = emitter.streams();
        assert_eq!(streams.len(), 1);
        assert!(streams.contains_key(LOGS_STREAM_KIND));
        assert_eq!(emitter.producer_name().as_deref(), Some("SessionController"));
    }

    #[test]
    fn test_close_terminates_stream() {
        let emitter = LogEmitter::new("SessionController");
        emitter.close();
        assert!(emitter.stream().is_terminated());
        assert_eq!(emitter.info("ignored"), 0);
    }
}
