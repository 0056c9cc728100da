// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-subscription transformer failure accounting.
//!
//! Each subscription key carries a failure count and at most one backoff
//! timer. The count drives how loudly failures are reported: every failure up
//! to `max_failures` is an error, the first one past it is a single warning,
//! and after that only every tenth failure is reported. A success after
//! failures, or a quiet backoff window, resets the count.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::json;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::aggregator::{SubscriptionKey, LOGGER_CONTEXT};
use crate::config::StreamLoggerConfig;
use crate::entry::{LogLevel, LogSource, UnifiedLogEntry};
use crate::sink::{dispatch, LogSink};

/// Failure runs shorter than this recover silently.
pub const RECOVERY_LOG_THRESHOLD: u32 = 3;

/// Failures past `max_failures` are only reported on multiples of this.
const SUMMARY_INTERVAL: u32 = 10;

/// Failures that also get a "monitoring continues" note.
const MONITORING_NOTE_LIMIT: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailurePolicy {
    pub max_failures: u32,
    pub backoff_reset: Duration,
    pub log_recovery_events: bool,
}

impl From<&StreamLoggerConfig> for FailurePolicy {
    fn from(config: &StreamLoggerConfig) -> Self {
        Self {
            max_failures: config.max_failures,
            backoff_reset: config.backoff_reset,
            log_recovery_events: config.log_recovery_events,
        }
    }
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::from(&StreamLoggerConfig::default())
    }
}

fn notice(level: LogLevel, message: String) -> UnifiedLogEntry {
    UnifiedLogEntry::new(LogSource::Log, level, message).with_context(LOGGER_CONTEXT)
}

/// Entries to report for the `count`-th consecutive failure of `key`.
pub fn failure_notices(
    policy: &FailurePolicy,
    key: &SubscriptionKey,
    count: u32,
    reason: &str,
) -> Vec<UnifiedLogEntry> {
    let kind = key.stream_kind();
    let max = policy.max_failures;
    let mut notices = Vec::new();

    if count <= max {
        notices.push(
            notice(
                LogLevel::Error,
                format!("Error in stream mapper for '{kind}' (failure {count}/{max}): {reason}"),
            )
            .with_data(json!({
                "subscription": key.to_string(),
                "failureCount": count,
            })),
        );
        if count <= MONITORING_NOTE_LIMIT {
            notices.push(notice(
                LogLevel::Info,
                format!("Monitoring continues for '{kind}' stream; the failed event was skipped"),
            ));
        }
    } else if count == max.saturating_add(1) {
        notices.push(notice(
            LogLevel::Warn,
            format!(
                "Stream mapper for '{kind}' exceeded {max} failures; reducing error log frequency"
            ),
        ));
    } else if count % SUMMARY_INTERVAL == 0 {
        notices.push(notice(
            LogLevel::Warn,
            format!("Stream mapper for '{kind}' has failed {count} times"),
        ));
    }

    notices
}

struct BackoffTimer {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct FailureState {
    count: u32,
    backoff: Option<BackoffTimer>,
}

impl FailureState {
    fn cancel_backoff(&mut self) {
        if let Some(timer) = self.backoff.take() {
            timer.task.abort();
        }
    }
}

type States = HashMap<SubscriptionKey, FailureState>;

fn lock(states: &Mutex<States>) -> MutexGuard<'_, States> {
    states.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Failure counts and backoff timers for every live subscription.
///
/// Reports go to the sink after the state lock is released. Backoff timers
/// are tasks on `runtime`; without one, counts only reset on recovery.
pub struct FailureTracker {
    policy: FailurePolicy,
    sink: Arc<dyn LogSink>,
    runtime: Option<Handle>,
    states: Arc<Mutex<States>>,
    generation: AtomicU64,
}

impl FailureTracker {
    pub fn new(policy: FailurePolicy, sink: Arc<dyn LogSink>, runtime: Option<Handle>) -> Self {
        Self {
            policy,
            sink,
            runtime,
            states: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &FailurePolicy {
        &self.policy
    }

    /// Counts one failure for `key`, arms its backoff timer if none is
    /// pending and reports per the policy. The window therefore runs from the
    /// first failure of a run. Nothing is recorded once `gate` is cancelled;
    /// the gate is checked under the state lock so a concurrent detach cannot
    /// leave a timer behind. Returns the new count.
    pub fn record_failure(
        &self,
        key: &SubscriptionKey,
        reason: &str,
        gate: Option<&CancellationToken>,
    ) -> Option<u32> {
        let count = {
            let mut states = lock(&self.states);
            if gate.is_some_and(CancellationToken::is_cancelled) {
                trace!("Dropping failure for detached subscription {}", key);
                return None;
            }
            let state = states.entry(key.clone()).or_default();
            state.count = state.count.saturating_add(1);
            self.arm_backoff(key, state);
            state.count
        };

        for entry in failure_notices(&self.policy, key, count, reason) {
            dispatch(self.sink.as_ref(), &entry);
        }
        Some(count)
    }

    /// Clears the failure run of `key` and returns its length. Runs of at
    /// least [`RECOVERY_LOG_THRESHOLD`] are reported when recovery events are
    /// enabled.
    pub fn record_recovery(&self, key: &SubscriptionKey) -> u32 {
        let previous = match lock(&self.states).remove(key) {
            Some(mut state) => {
                state.cancel_backoff();
                state.count
            }
            None => 0,
        };

        if previous >= RECOVERY_LOG_THRESHOLD && self.policy.log_recovery_events {
            self.sink.info(
                &format!(
                    "Stream mapper for '{}' recovered after {} failures",
                    key.stream_kind(),
                    previous
                ),
                Some(LOGGER_CONTEXT),
            );
        } else if previous > 0 {
            debug!("Subscription {} recovered after {} failures", key, previous);
        }
        previous
    }

    pub fn failure_count(&self, key: &SubscriptionKey) -> u32 {
        lock(&self.states).get(key).map_or(0, |state| state.count)
    }

    pub fn has_pending_reset(&self, key: &SubscriptionKey) -> bool {
        lock(&self.states)
            .get(key)
            .is_some_and(|state| state.backoff.is_some())
    }

    /// Drops all state of `key`, aborting its timer.
    pub fn forget(&self, key: &SubscriptionKey) {
        if let Some(mut state) = lock(&self.states).remove(key) {
            state.cancel_backoff();
        }
    }

    pub fn forget_all(&self) {
        for (_, mut state) in lock(&self.states).drain() {
            state.cancel_backoff();
        }
    }

    fn arm_backoff(&self, key: &SubscriptionKey, state: &mut FailureState) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        if state.backoff.is_some() {
            return;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let states = Arc::downgrade(&self.states);
        let sink = Arc::clone(&self.sink);
        let key = key.clone();
        let delay = self.policy.backoff_reset;
        let task = runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(states) = states.upgrade() {
                expire(&states, sink.as_ref(), &key, generation);
            }
        });
        state.backoff = Some(BackoffTimer { generation, task });
    }
}

/// Backoff firing. A timer that was cancelled after it woke up no longer
/// matches the stored generation and does nothing.
fn expire(states: &Mutex<States>, sink: &dyn LogSink, key: &SubscriptionKey, generation: u64) {
    let cleared = {
        let mut states = lock(states);
        let current = states
            .get(key)
            .and_then(|state| state.backoff.as_ref())
            .is_some_and(|timer| timer.generation == generation);
        if !current {
            return;
        }
        states.remove(key).map_or(0, |state| state.count)
    };

    debug!("Backoff window elapsed for {}", key);
    sink.debug(
        &format!("Reset failure count for '{key}' after backoff window ({cleared} failures cleared)"),
        Some(LOGGER_CONTEXT),
    );
}

impl Drop for FailureTracker {
    fn drop(&mut self) {
        self.forget_all();
    }
}

impl std::fmt::Debug for FailureTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailureTracker")
            .field("policy", &self.policy)
            .field("tracked", &lock(&self.states).len())
            .field("timers", &self.runtime.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{MemorySink, SinkMethod};
    use proptest::prelude::*;

    fn key() -> SubscriptionKey {
        SubscriptionKey::new("WorkoutRepository", "repository")
    }

    fn policy(max_failures: u32) -> FailurePolicy {
        FailurePolicy {
            max_failures,
            backoff_reset: Duration::from_millis(100),
            log_recovery_events: true,
        }
    }

    fn tracker(policy: FailurePolicy, runtime: Option<Handle>) -> (FailureTracker, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let tracker = FailureTracker::new(policy, sink.clone(), runtime);
        (tracker, sink)
    }

    fn levels(notices: &[UnifiedLogEntry]) -> Vec<LogLevel> {
        notices.iter().map(|n| n.level).collect()
    }

    #[test]
    fn test_first_failures_log_error_and_monitoring_note() {
        let policy = policy(5);
        let first = failure_notices(&policy, &key(), 1, "boom");
        assert_eq!(levels(&first), vec![LogLevel::Error, LogLevel::Info]);
        assert_eq!(
            first[0].message,
            "Error in stream mapper for 'repository' (failure 1/5): boom"
        );
        assert_eq!(first[0].context.as_deref(), Some(LOGGER_CONTEXT));

        let third = failure_notices(&policy, &key(), 3, "boom");
        assert_eq!(levels(&third), vec![LogLevel::Error]);
    }

    #[test]
    fn test_threshold_warning_then_silence() {
        let policy = policy(5);
        let warning = failure_notices(&policy, &key(), 6, "boom");
        assert_eq!(levels(&warning), vec![LogLevel::Warn]);
        assert!(warning[0].message.contains("reducing error log frequency"));

        assert!(failure_notices(&policy, &key(), 7, "boom").is_empty());
        assert!(failure_notices(&policy, &key(), 9, "boom").is_empty());

        let summary = failure_notices(&policy, &key(), 20, "boom");
        assert_eq!(summary[0].message, "Stream mapper for 'repository' has failed 20 times");
    }

    #[test]
    fn test_unknown_key_counts_as_zero() {
        let (tracker, sink) = tracker(policy(5), None);
        assert_eq!(tracker.failure_count(&key()), 0);
        assert_eq!(tracker.record_recovery(&key()), 0);
        tracker.forget(&key());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_recovery_after_significant_run_is_reported() {
        let (tracker, sink) = tracker(policy(5), None);
        for _ in 0..3 {
            tracker.record_failure(&key(), "boom", None);
        }
        sink.clear();

        assert_eq!(tracker.record_recovery(&key()), 3);
        assert_eq!(
            sink.messages(SinkMethod::Info),
            vec!["Stream mapper for 'repository' recovered after 3 failures".to_string()]
        );
        assert_eq!(tracker.failure_count(&key()), 0);
    }

    #[test]
    fn test_short_run_recovers_silently() {
        let (tracker, sink) = tracker(policy(5), None);
        tracker.record_failure(&key(), "boom", None);
        tracker.record_failure(&key(), "boom", None);
        sink.clear();

        assert_eq!(tracker.record_recovery(&key()), 2);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_recovery_report_can_be_disabled() {
        let mut quiet = policy(5);
        quiet.log_recovery_events = false;
        let (tracker, sink) = tracker(quiet, None);
        for _ in 0..4 {
            tracker.record_failure(&key(), "boom", None);
        }
        sink.clear();

        assert_eq!(tracker.record_recovery(&key()), 4);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_policy_follows_config() {
        let config = StreamLoggerConfig {
            max_failures: 3,
            backoff_reset: Duration::from_millis(250),
            log_recovery_events: false,
            warn_on_missing_mappers: true,
        };
        let (tracker, _sink) = tracker(FailurePolicy::from(&config), None);

        assert_eq!(
            *tracker.policy(),
            FailurePolicy {
                max_failures: 3,
                backoff_reset: Duration::from_millis(250),
                log_recovery_events: false,
            }
        );
        assert_eq!(FailurePolicy::default().max_failures, 5);
    }

    #[test]
    fn test_cancelled_gate_records_nothing() {
        let (tracker, sink) = tracker(policy(5), None);
        let gate = CancellationToken::new();
        gate.cancel();

        assert_eq!(tracker.record_failure(&key(), "boom", Some(&gate)), None);
        assert_eq!(tracker.failure_count(&key()), 0);
        assert!(sink.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_count() {
        let (tracker, sink) = tracker(policy(5), Some(Handle::current()));
        tracker.record_failure(&key(), "boom", None);
        tracker.record_failure(&key(), "boom", None);
        assert!(tracker.has_pending_reset(&key()));

        tokio::time::sleep(Duration::from_millis(101)).await;

        assert_eq!(tracker.failure_count(&key()), 0);
        assert!(!tracker.has_pending_reset(&key()));
        assert_eq!(sink.count(SinkMethod::Debug), 1);
        assert!(sink.messages(SinkMethod::Debug)[0].contains("2 failures cleared"));

        sink.clear();
        tracker.record_failure(&key(), "boom", None);
        assert!(sink.messages(SinkMethod::Error)[0].contains("(failure 1/5)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_window_starts_at_first_failure() {
        let (tracker, sink) = tracker(policy(5), Some(Handle::current()));
        tracker.record_failure(&key(), "boom", None);
        tokio::time::sleep(Duration::from_millis(60)).await;
        tracker.record_failure(&key(), "boom", None);
        assert_eq!(tracker.failure_count(&key()), 2);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(tracker.failure_count(&key()), 0);
        assert!(!tracker.has_pending_reset(&key()));

        sink.clear();
        tracker.record_failure(&key(), "boom", None);
        assert_eq!(tracker.failure_count(&key()), 1);
        assert!(sink.messages(SinkMethod::Error)[0].contains("(failure 1/5)"));
        assert!(tracker.has_pending_reset(&key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_failures_reset_every_window() {
        let (tracker, sink) = tracker(policy(2), Some(Handle::current()));
        for _ in 0..12 {
            tracker.record_failure(&key(), "boom", None);
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        // Windows close at 100, 220 and 340 ms, so the count never passes 4
        // and every window starts over at error level.
        let errors = sink.messages(SinkMethod::Error);
        assert_eq!(
            errors
                .iter()
                .filter(|m| m.contains("(failure 1/2)"))
                .count(),
            3
        );
        assert!(tracker.failure_count(&key()) <= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forget_cancels_backoff() {
        let (tracker, sink) = tracker(policy(5), Some(Handle::current()));
        tracker.record_failure(&key(), "boom", None);
        tracker.forget(&key());
        sink.clear();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(sink.is_empty());
    }

    proptest! {
        #[test]
        fn test_failure_reporting_volume(max in 1u32..20, total in 1u32..200) {
            let policy = policy(max);
            let key = key();
            let mut errors = 0;
            let mut warnings = 0;
            let mut infos = 0;
            for n in 1..=total {
                for entry in failure_notices(&policy, &key, n, "boom") {
                    match entry.level {
                        LogLevel::Error => errors += 1,
                        LogLevel::Warn => warnings += 1,
                        LogLevel::Info => infos += 1,
                        _ => prop_assert!(false, "unexpected level"),
                    }
                }
            }

            let summaries = (max + 2..=total).filter(|n| n % SUMMARY_INTERVAL == 0).count();
            prop_assert_eq!(errors, total.min(max) as usize);
            prop_assert_eq!(infos, total.min(max).min(MONITORING_NOTE_LIMIT) as usize);
            prop_assert_eq!(warnings, usize::from(total > max) + summaries);
        }
    }
}
