// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use serde_json::json;
use tokio::time::{sleep, Duration};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use merged_stream_logger::{
    EventStream, LogEmitter, MergedStreamLogger, StreamDescriptor, StreamError,
    StreamLoggerOptions, StreamProducer, TracingSink,
};

struct SyncStateMachine {
    state: EventStream,
}

impl StreamProducer for SyncStateMachine {
    fn streams(&self) -> HashMap<String, EventStream> {
        HashMap::from([("state".to_string(), self.state.clone())])
    }
}

struct WorkoutRepository {
    events: EventStream,
    logs: LogEmitter,
}

impl StreamProducer for WorkoutRepository {
    fn streams(&self) -> HashMap<String, EventStream> {
        let mut streams = self.logs.streams();
        streams.insert("repository".to_string(), self.events.clone());
        streams
    }
}

#[tokio::main]
pub async fn main() {
    let log_level = env::var("STREAM_LOGGER_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = match EnvFilter::try_new(&log_level) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Invalid STREAM_LOGGER_LOG_LEVEL '{log_level}': {e}, using info");
            EnvFilter::new("info")
        }
    };

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(env_filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Setting default subscriber failed: {e}");
        return;
    }

    debug!("Logging subsystem enabled");

    let options = StreamLoggerOptions::from_env();
    let logger = MergedStreamLogger::new(Arc::new(TracingSink), options);
    info!("Effective configuration: {:?}", logger.config());

    let goals = Arc::new(LogEmitter::new("GoalService"));
    let sync = Arc::new(SyncStateMachine {
        state: EventStream::new("state"),
    });
    let workouts = Arc::new(WorkoutRepository {
        events: EventStream::new("repository"),
        logs: LogEmitter::new("WorkoutRepository"),
    });

    let attached = logger.attach([
        StreamDescriptor::new("logs", goals.clone()),
        StreamDescriptor::new("state", sync.clone()),
        StreamDescriptor::new("repository", workouts.clone()),
        StreamDescriptor::new("logs", workouts.clone()),
        StreamDescriptor::new("metrics", workouts.clone()),
    ]);
    info!("Attached {} subscriptions", attached.len());

    goals.info("Goal 'run 5k' created for tenant acme");
    goals.verbose("Goal progress recomputed", Some(json!({"progress": 0.4})));
    sync.state.emit(json!({"state": "SYNCING", "previousState": "IDLE"}));
    workouts.events.emit(json!({
        "operation": "insert",
        "entity": "workout",
        "id": "w-42",
        "durationMs": 7,
    }));

    // Malformed repository events exercise failure throttling and recovery.
    for _ in 0..4 {
        workouts.events.emit(json!({"entity": "workout"}));
    }
    workouts.events.emit(json!({"operation": "find", "entity": "workout", "id": "w-42"}));

    sync.state.emit(json!({"state": "DEGRADED", "reason": "slow"}));
    sync.state.error(StreamError::new("upstream closed"));

    logger.detach("GoalService");
    goals.info("Not forwarded after detach");

    sleep(Duration::from_millis(10)).await;
    logger.detach_all();
    debug!("Demo finished");
}
