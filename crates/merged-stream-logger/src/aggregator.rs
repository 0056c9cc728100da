// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The merged stream logger.
//!
//! [`MergedStreamLogger`] subscribes to named streams of many producers,
//! turns their events into
//! [`UnifiedLogEntry`](crate::entry::UnifiedLogEntry) values with the
//! transformer registered for each stream kind, and writes the entries to
//! one [`LogSink`].
//!
//! ```text
//!   producer.streams()[kind]
//!            │ emit(value)
//!            ▼
//!   SubscriptionObserver ── transform ──> entries ── dispatch ──> LogSink
//!            │ Err / panic
//!            ▼
//!   FailureTracker ── throttled error/warn notices ──────────────> LogSink
//! ```
//!
//! Subscriptions are bookkept per producer key and stream kind. A failing
//! transformer only ever affects its own subscription.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::SystemTime;

use serde_json::{json, Value};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{StreamLoggerConfig, StreamLoggerOptions};
use crate::emitter::StreamProducer;
use crate::error::{StreamError, TransformError};
use crate::failure_tracker::{FailurePolicy, FailureTracker};
use crate::registry::TransformerRegistry;
use crate::sink::{dispatch, LogSink, TracingSink};
use crate::stream::{StreamObserver, Subscription};
use crate::transformer::{StreamTransformer, TransformOutput};

/// Context attached to the logger's own sink calls.
pub const LOGGER_CONTEXT: &str = "MergedStreamLogger";

/// Identity of one subscription: a producer key and one of its stream kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    producer: String,
    stream_kind: String,
}

impl SubscriptionKey {
    pub fn new(producer: impl Into<String>, stream_kind: impl Into<String>) -> Self {
        Self {
            producer: producer.into(),
            stream_kind: stream_kind.into(),
        }
    }

    pub fn producer(&self) -> &str {
        &self.producer
    }

    pub fn stream_kind(&self) -> &str {
        &self.stream_kind
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.producer, self.stream_kind)
    }
}

/// What to attach: one stream kind of one producer.
#[derive(Clone)]
pub struct StreamDescriptor {
    pub stream_kind: String,
    pub producer: Option<Arc<dyn StreamProducer>>,
    /// Overrides the producer name as bookkeeping identity.
    pub subscription_key: Option<String>,
}

impl StreamDescriptor {
    pub fn new(stream_kind: impl Into<String>, producer: Arc<dyn StreamProducer>) -> Self {
        Self {
            stream_kind: stream_kind.into(),
            producer: Some(producer),
            subscription_key: None,
        }
    }

    /// A descriptor whose producer is not available.
    pub fn without_producer(stream_kind: impl Into<String>) -> Self {
        Self {
            stream_kind: stream_kind.into(),
            producer: None,
            subscription_key: None,
        }
    }

    #[must_use]
    pub fn with_subscription_key(mut self, key: impl Into<String>) -> Self {
        self.subscription_key = Some(key.into());
        self
    }
}

impl std::fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("stream_kind", &self.stream_kind)
            .field(
                "producer",
                &self.producer.as_ref().map(|p| p.producer_name()),
            )
            .field("subscription_key", &self.subscription_key)
            .finish()
    }
}

struct SubscriptionRecord {
    subscription: Subscription,
    cancel: CancellationToken,
}

impl SubscriptionRecord {
    fn close(self) {
        self.cancel.cancel();
        self.subscription.unsubscribe();
    }
}

/// producer key -> stream kind -> record
type Subscriptions = HashMap<String, HashMap<String, SubscriptionRecord>>;

struct Shared {
    sink: Arc<dyn LogSink>,
    tracker: FailureTracker,
    subscriptions: Mutex<Subscriptions>,
}

impl Shared {
    fn subscriptions(&self) -> MutexGuard<'_, Subscriptions> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn warn(&self, message: &str) {
        self.sink.warn(message, Some(LOGGER_CONTEXT));
    }

    fn close_records(&self, producer: &str, records: HashMap<String, SubscriptionRecord>) {
        for (kind, record) in records {
            record.close();
            let key = SubscriptionKey::new(producer, kind);
            self.tracker.forget(&key);
            debug!("Detached subscription {}", key);
        }
    }
}

/// Observer installed on one producer stream.
struct SubscriptionObserver {
    key: SubscriptionKey,
    transformer: Arc<dyn StreamTransformer>,
    cancel: CancellationToken,
    shared: Weak<Shared>,
}

impl SubscriptionObserver {
    fn live_state(&self) -> Option<Arc<Shared>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.shared.upgrade()
    }
}

impl StreamObserver for SubscriptionObserver {
    fn on_next(&self, value: &Value) {
        let Some(shared) = self.live_state() else {
            trace!("Ignoring event for detached subscription {}", self.key);
            return;
        };

        match run_transform(self.transformer.as_ref(), value, self.key.producer()) {
            Ok(output) => {
                shared.tracker.record_recovery(&self.key);
                let now = SystemTime::now();
                for mut entry in output.into_entries() {
                    entry.fill_defaults(self.key.producer(), now);
                    dispatch(shared.sink.as_ref(), &entry);
                }
            }
            Err(error) => {
                shared
                    .tracker
                    .record_failure(&self.key, &error.to_string(), Some(&self.cancel));
            }
        }
    }

    fn on_error(&self, error: &StreamError) {
        let Some(shared) = self.live_state() else {
            return;
        };
        shared.sink.error(
            &format!(
                "Stream error in '{}' stream of '{}': {}",
                self.key.stream_kind(),
                self.key.producer(),
                error.message()
            ),
            Some(&json!({ "subscription": self.key.to_string() })),
            Some(LOGGER_CONTEXT),
        );
    }

    fn on_complete(&self) {
        debug!("Stream completed for subscription {}", self.key);
    }
}

/// Runs a transformer, turning a panic into an ordinary transform failure.
fn run_transform(
    transformer: &dyn StreamTransformer,
    event: &Value,
    context: &str,
) -> Result<TransformOutput, TransformError> {
    panic::catch_unwind(AssertUnwindSafe(|| transformer.transform(event, Some(context))))
        .unwrap_or_else(|payload| Err(TransformError::Panicked(panic_message(&*payload))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

enum AttachOutcome {
    Attached,
    AlreadyAttached,
    Terminated,
}

/// Aggregates the streams of many producers into one sink.
///
/// Dropping the logger detaches every subscription and cancels every pending
/// backoff timer.
pub struct MergedStreamLogger {
    shared: Arc<Shared>,
    registry: Arc<TransformerRegistry>,
    config: StreamLoggerConfig,
}

impl MergedStreamLogger {
    /// A logger with the built-in transformers, validated `options` and the
    /// current tokio runtime (if any) for backoff timers.
    pub fn new(sink: Arc<dyn LogSink>, options: StreamLoggerOptions) -> Self {
        Self::builder().sink(sink).options(options).build()
    }

    #[must_use]
    pub fn builder() -> MergedStreamLoggerBuilder {
        MergedStreamLoggerBuilder::default()
    }

    pub fn config(&self) -> &StreamLoggerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<TransformerRegistry> {
        &self.registry
    }

    /// Registers `transformer` for its stream kind. Existing subscriptions
    /// keep the transformer they were attached with.
    pub fn register_transformer(
        &self,
        transformer: Arc<dyn StreamTransformer>,
    ) -> Option<Arc<dyn StreamTransformer>> {
        self.registry.register(transformer)
    }

    /// Subscribes to every descriptor that can be attached and returns the
    /// keys of the subscriptions created by this call. Descriptors that
    /// cannot be attached are skipped with a warning; already attached ones
    /// are left alone.
    pub fn attach<I>(&self, descriptors: I) -> Vec<SubscriptionKey>
    where
        I: IntoIterator<Item = StreamDescriptor>,
    {
        descriptors
            .into_iter()
            .filter_map(|descriptor| self.attach_one(&descriptor))
            .collect()
    }

    fn attach_one(&self, descriptor: &StreamDescriptor) -> Option<SubscriptionKey> {
        let kind = descriptor.stream_kind.as_str();
        let Some(producer) = descriptor.producer.as_ref() else {
            self.shared
                .warn(&format!("No producer provided for stream kind '{kind}'"));
            return None;
        };

        let producer_name = producer
            .producer_name()
            .filter(|name| !name.trim().is_empty());
        let Some(stream) = producer
            .streams()
            .remove(kind)
            .filter(|stream| !stream.is_terminated())
        else {
            self.shared.warn(&format!(
                "No valid stream found at '{}' on producer '{}'",
                kind,
                producer_name.as_deref().unwrap_or("<unnamed>")
            ));
            return None;
        };

        let explicit_key = descriptor
            .subscription_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        let Some(producer_key) = explicit_key.or(producer_name) else {
            self.shared.warn(&format!(
                "Could not determine a subscription key for stream kind '{kind}'"
            ));
            return None;
        };
        let key = SubscriptionKey::new(producer_key, kind);

        let Some(transformer) = self.registry.lookup(kind) else {
            if self.config.warn_on_missing_mappers {
                self.shared.warn(&format!(
                    "No mapper registered for stream kind '{kind}' (subscription '{key}')"
                ));
            } else {
                debug!("No mapper registered for {}, skipping", key);
            }
            return None;
        };

        let outcome = {
            let mut subscriptions = self.shared.subscriptions();
            let attached = subscriptions
                .get(key.producer())
                .is_some_and(|kinds| kinds.contains_key(kind));
            if attached {
                AttachOutcome::AlreadyAttached
            } else {
                let cancel = CancellationToken::new();
                let observer = Arc::new(SubscriptionObserver {
                    key: key.clone(),
                    transformer,
                    cancel: cancel.clone(),
                    shared: Arc::downgrade(&self.shared),
                });
                match stream.subscribe(observer) {
                    Ok(subscription) => {
                        self.shared.tracker.forget(&key);
                        subscriptions
                            .entry(key.producer().to_string())
                            .or_default()
                            .insert(
                                kind.to_string(),
                                SubscriptionRecord {
                                    subscription,
                                    cancel,
                                },
                            );
                        AttachOutcome::Attached
                    }
                    Err(_) => AttachOutcome::Terminated,
                }
            }
        };

        match outcome {
            AttachOutcome::Attached => {
                debug!("Attached subscription {}", key);
                Some(key)
            }
            AttachOutcome::AlreadyAttached => {
                trace!("Subscription {} already attached", key);
                None
            }
            AttachOutcome::Terminated => {
                self.shared.warn(&format!(
                    "No valid stream found at '{}' on producer '{}'",
                    kind,
                    key.producer()
                ));
                None
            }
        }
    }

    /// Detaches every stream attached under `producer_key`. Returns `false`
    /// if nothing was attached under it.
    pub fn detach(&self, producer_key: &str) -> bool {
        let removed = self.shared.subscriptions().remove(producer_key);
        match removed {
            Some(records) => {
                self.shared.close_records(producer_key, records);
                true
            }
            None => false,
        }
    }

    /// Detaches every stream of `producer`, keyed by its producer name.
    pub fn detach_producer(&self, producer: &dyn StreamProducer) -> bool {
        producer
            .producer_name()
            .is_some_and(|name| self.detach(&name))
    }

    /// Detaches a single subscription.
    pub fn detach_stream(&self, key: &SubscriptionKey) -> bool {
        let removed = {
            let mut subscriptions = self.shared.subscriptions();
            let Some(kinds) = subscriptions.get_mut(key.producer()) else {
                return false;
            };
            let record = kinds.remove(key.stream_kind());
            if kinds.is_empty() {
                subscriptions.remove(key.producer());
            }
            record
        };

        match removed {
            Some(record) => {
                let records = HashMap::from([(key.stream_kind().to_string(), record)]);
                self.shared.close_records(key.producer(), records);
                true
            }
            None => false,
        }
    }

    pub fn detach_all(&self) {
        let all = std::mem::take(&mut *self.shared.subscriptions());
        for (producer, records) in all {
            self.shared.close_records(&producer, records);
        }
        self.shared.tracker.forget_all();
    }

    /// Live subscription keys, sorted.
    pub fn subscription_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self
            .shared
            .subscriptions()
            .iter()
            .flat_map(|(producer, kinds)| {
                kinds
                    .keys()
                    .map(move |kind| SubscriptionKey::new(producer.clone(), kind.clone()))
            })
            .collect();
        keys.sort();
        keys
    }

    pub fn is_attached(&self, key: &SubscriptionKey) -> bool {
        self.shared
            .subscriptions()
            .get(key.producer())
            .is_some_and(|kinds| kinds.contains_key(key.stream_kind()))
    }

    /// Current consecutive failure count of a subscription; 0 when unknown.
    pub fn failure_count(&self, key: &SubscriptionKey) -> u32 {
        self.shared.tracker.failure_count(key)
    }
}

impl Drop for MergedStreamLogger {
    fn drop(&mut self) {
        self.detach_all();
    }
}

impl std::fmt::Debug for MergedStreamLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergedStreamLogger")
            .field("config", &self.config)
            .field("registry", &self.registry)
            .field("subscriptions", &self.subscription_keys())
            .field("tracker", &self.shared.tracker)
            .finish()
    }
}

/// Builder for [`MergedStreamLogger`].
#[derive(Default)]
pub struct MergedStreamLoggerBuilder {
    sink: Option<Arc<dyn LogSink>>,
    options: StreamLoggerOptions,
    registry: Option<Arc<TransformerRegistry>>,
    without_builtins: bool,
    transformers: Vec<Arc<dyn StreamTransformer>>,
    runtime: Option<Handle>,
}

impl MergedStreamLoggerBuilder {
    /// Defaults to [`TracingSink`].
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn options(mut self, options: StreamLoggerOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses a shared registry as is; built-ins are not added to it.
    #[must_use]
    pub fn registry(mut self, registry: Arc<TransformerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    #[must_use]
    pub fn without_builtins(mut self) -> Self {
        self.without_builtins = true;
        self
    }

    #[must_use]
    pub fn transformer(mut self, transformer: Arc<dyn StreamTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    /// Runtime for backoff timers. Defaults to the runtime `build` runs in.
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> MergedStreamLogger {
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));

        let (config, rejected) = self.options.validate();
        for option in &rejected {
            sink.warn(&option.to_string(), Some(LOGGER_CONTEXT));
        }

        let registry = self.registry.unwrap_or_else(|| {
            Arc::new(if self.without_builtins {
                TransformerRegistry::new()
            } else {
                TransformerRegistry::with_builtins()
            })
        });
        for transformer in self.transformers {
            registry.register(transformer);
        }

        let runtime = self.runtime.or_else(|| Handle::try_current().ok());
        if runtime.is_none() {
            warn!("No tokio runtime available, failure counts will only reset on recovery");
        }

        let tracker = FailureTracker::new(FailurePolicy::from(&config), Arc::clone(&sink), runtime);
        debug!(
            "Merged stream logger ready: max_failures={}, backoff_reset={:?}",
            config.max_failures, config.backoff_reset
        );

        MergedStreamLogger {
            shared: Arc::new(Shared {
                sink,
                tracker,
                subscriptions: Mutex::new(HashMap::new()),
            }),
            registry,
            config,
        }
    }
}
