// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process aggregation of many producer event streams into one log.
//!
//! Producers expose named [`EventStream`]s through [`StreamProducer`]. The
//! [`MergedStreamLogger`] subscribes to them, converts each event into one or
//! more [`UnifiedLogEntry`] values with the [`StreamTransformer`] registered
//! for the stream kind, and writes the result to a [`LogSink`].
//!
//! Transformer failures are isolated per subscription and reported with a
//! throttled error policy; see [`failure_tracker`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use merged_stream_logger::{
//!     LogEmitter, MergedStreamLogger, StreamDescriptor, StreamLoggerOptions, TracingSink,
//! };
//!
//! let logger = MergedStreamLogger::new(Arc::new(TracingSink), StreamLoggerOptions::default());
//! let emitter = Arc::new(LogEmitter::new("GoalService"));
//! logger.attach([StreamDescriptor::new("logs", emitter.clone())]);
//! emitter.info("goal created");
//! ```

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod config;
pub mod emitter;
pub mod entry;
pub mod error;
pub mod failure_tracker;
pub mod registry;
pub mod sink;
pub mod stream;
pub mod transformer;
pub mod transformers;

pub use aggregator::{
    MergedStreamLogger, MergedStreamLoggerBuilder, StreamDescriptor, SubscriptionKey,
};
pub use config::{RejectedOption, Setting, StreamLoggerConfig, StreamLoggerOptions};
pub use emitter::{LogEmitter, StreamProducer};
pub use entry::{LogLevel, LogSource, UnifiedLogEntry};
pub use error::{StreamError, SubscribeError, TransformError};
pub use registry::TransformerRegistry;
pub use sink::{LogSink, MemorySink, TracingSink};
pub use stream::{EventStream, StreamObserver, Subscription};
pub use transformer::{StreamTransformer, TransformOutput};
