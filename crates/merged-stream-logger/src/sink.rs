// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Downstream destination for finished log entries.
//!
//! The aggregator only depends on the [`LogSink`] write contract. Two
//! implementations ship with the crate:
//!
//! - [`TracingSink`]: forwards every call to the `tracing` macros, so the
//!   merged log ends up wherever the process's subscriber writes
//! - [`MemorySink`]: keeps every call in memory, for tests and for callers
//!   that drain entries themselves
//!
//! [`dispatch`] selects the sink method from an entry's level.

use std::sync::{Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::entry::{LogLevel, UnifiedLogEntry};

/// Write contract of the downstream logger. Calls must be fast and must not
/// block; nothing they return is consumed.
pub trait LogSink: Send + Sync {
    fn error(&self, message: &str, data: Option<&Value>, context: Option<&str>);

    fn warn(&self, message: &str, context: Option<&str>);

    fn info(&self, message: &str, context: Option<&str>);

    fn debug(&self, message: &str, context: Option<&str>);

    fn verbose(&self, message: &str, context: Option<&str>);

    fn log(&self, message: &str, context: Option<&str>);
}

/// Routes `entry` to exactly one sink method according to its level.
///
/// Only the error channel carries `data` as a separate argument; verbose
/// entries get their payload appended to the message as compact JSON. Other
/// levels drop the payload.
pub fn dispatch(sink: &dyn LogSink, entry: &UnifiedLogEntry) {
    let context = entry.context.as_deref();
    match entry.level {
        LogLevel::Error => sink.error(&entry.message, entry.data.as_ref(), context),
        LogLevel::Warn => sink.warn(&entry.message, context),
        LogLevel::Info => sink.info(&entry.message, context),
        LogLevel::Debug => sink.debug(&entry.message, context),
        LogLevel::Verbose => match &entry.data {
            Some(data) => sink.verbose(&format!("{} {}", entry.message, data), context),
            None => sink.verbose(&entry.message, context),
        },
        LogLevel::Log => sink.log(&entry.message, context),
    }
}

/// Sink writing through `tracing`. `verbose` maps to `TRACE` and `log` to
/// `INFO`; the producer context is attached as the `context` field.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn error(&self, message: &str, data: Option<&Value>, context: Option<&str>) {
        let context = context.unwrap_or_default();
        match data {
            Some(data) => error!(context, data = %data, "{}", message),
            None => error!(context, "{}", message),
        }
    }

    fn warn(&self, message: &str, context: Option<&str>) {
        warn!(context = context.unwrap_or_default(), "{}", message);
    }

    fn info(&self, message: &str, context: Option<&str>) {
        info!(context = context.unwrap_or_default(), "{}", message);
    }

    fn debug(&self, message: &str, context: Option<&str>) {
        debug!(context = context.unwrap_or_default(), "{}", message);
    }

    fn verbose(&self, message: &str, context: Option<&str>) {
        trace!(context = context.unwrap_or_default(), "{}", message);
    }

    fn log(&self, message: &str, context: Option<&str>) {
        info!(context = context.unwrap_or_default(), "{}", message);
    }
}

/// Which sink method received a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkMethod {
    Error,
    Warn,
    Info,
    Debug,
    Verbose,
    Log,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SinkRecord {
    pub method: SinkMethod,
    pub message: String,
    pub data: Option<Value>,
    pub context: Option<String>,
}

/// Sink that records every call.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<SinkRecord>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<SinkRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, method: SinkMethod, message: &str, data: Option<&Value>, context: Option<&str>) {
        self.lock().push(SinkRecord {
            method,
            message: message.to_string(),
            data: data.cloned(),
            context: context.map(str::to_string),
        });
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.lock().clone()
    }

    /// Returns the recorded calls and clears the sink.
    pub fn take(&self) -> Vec<SinkRecord> {
        std::mem::take(&mut *self.lock())
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn count(&self, method: SinkMethod) -> usize {
        self.lock().iter().filter(|r| r.method == method).count()
    }

    /// Messages received by `method`, in call order.
    pub fn messages(&self, method: SinkMethod) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|r| r.method == method)
            .map(|r| r.message.clone())
            .collect()
    }
}

impl LogSink for MemorySink {
    fn error(&self, message: &str, data: Option<&Value>, context: Option<&str>) {
        self.push(SinkMethod::Error, message, data, context);
    }

    fn warn(&self, message: &str, context: Option<&str>) {
        self.push(SinkMethod::Warn, message, None, context);
    }

    fn info(&self, message: &str, context: Option<&str>) {
        self.push(SinkMethod::Info, message, None, context);
    }

    fn debug(&self, message: &str, context: Option<&str>) {
        self.push(SinkMethod::Debug, message, None, context);
    }

    fn verbose(&self, message: &str, context: Option<&str>) {
        self.push(SinkMethod::Verbose, message, None, context);
    }

    fn log(&self, message: &str, context: Option<&str>) {
        self.push(SinkMethod::Log, message, None, context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::LogSource;
    use serde_json::json;
    use tracing_test::traced_test;

    fn entry(level: LogLevel) -> UnifiedLogEntry {
        UnifiedLogEntry::new(LogSource::Custom, level, format!("{level} message"))
            .with_context("GoalService")
    }

    #[test]
    fn test_dispatch_routes_each_level_once() {
        let sink = MemorySink::new();
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Verbose,
            LogLevel::Log,
        ] {
            dispatch(&sink, &entry(level));
        }

        let methods: Vec<SinkMethod> = sink.records().iter().map(|r| r.method).collect();
        assert_eq!(
            methods,
            vec![
                SinkMethod::Error,
                SinkMethod::Warn,
                SinkMethod::Info,
                SinkMethod::Debug,
                SinkMethod::Verbose,
                SinkMethod::Log,
            ]
        );
        assert!(sink
            .records()
            .iter()
            .all(|r| r.context.as_deref() == Some("GoalService")));
    }

    #[test]
    fn test_dispatch_error_passes_data() {
        let sink = MemorySink::new();
        dispatch(&sink, &entry(LogLevel::Error).with_data(json!({"code": 500})));

        let records = sink.records();
        assert_eq!(records[0].data, Some(json!({"code": 500})));
    }

    #[test]
    fn test_dispatch_verbose_appends_json_data() {
        let sink = MemorySink::new();
        dispatch(&sink, &entry(LogLevel::Verbose).with_data(json!({"reps": 12})));
        dispatch(&sink, &entry(LogLevel::Verbose));

        assert_eq!(
            sink.messages(SinkMethod::Verbose),
            vec![
                "verbose message {\"reps\":12}".to_string(),
                "verbose message".to_string(),
            ]
        );
    }

    #[test]
    fn test_dispatch_without_context_or_data() {
        let sink = MemorySink::new();
        let bare = UnifiedLogEntry::new(LogSource::Log, LogLevel::Error, "bare");
        dispatch(&sink, &bare);

        let records = sink.take();
        assert_eq!(records.len(), 1);
        assert!(records[0].data.is_none());
        assert!(records[0].context.is_none());
        assert!(sink.is_empty());
    }

    #[test]
    #[traced_test]
    fn test_tracing_sink_writes_through_tracing() {
        let sink = TracingSink;
        sink.error("mapper exploded", Some(&json!({"kind": "state"})), Some("Aggregator"));
        sink.warn("frequency reduced", None);
        sink.info("state changed", Some("SyncStateMachine"));

        assert!(logs_contain("mapper exploded"));
        assert!(logs_contain("frequency reduced"));
        assert!(logs_contain("state changed"));
        assert!(logs_contain("SyncStateMachine"));
    }
}
