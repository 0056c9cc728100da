// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Multicast event stream used by producers to publish raw events.
//!
//! An [`EventStream`] is a small subject: any number of observers subscribe to
//! it and every emitted value is delivered to each of them, synchronously, on
//! the emitting thread.
//!
//! ```text
//!   Producer                EventStream              Observers (many)
//!      │                        │                          │
//!      ├── emit(value) ────────>│ ── on_next(&value) ─────>│
//!      ├── error(err) ─────────>│ ── on_error(&err) ──────>│  (terminal)
//!      └── complete() ─────────>│ ── on_complete() ───────>│  (terminal)
//! ```
//!
//! The observer list is snapshotted before delivery, so observers may
//! subscribe or unsubscribe from inside a callback without deadlocking. Once
//! a stream has errored or completed it is terminated: further emissions are
//! dropped and new subscriptions are refused.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use serde_json::Value;
use tracing::trace;

use crate::error::{StreamError, SubscribeError};

/// Receives the notifications of one subscription.
pub trait StreamObserver: Send + Sync {
    fn on_next(&self, value: &Value);

    fn on_error(&self, error: &StreamError);

    fn on_complete(&self) {}
}

type ObserverSlot = (u64, Arc<dyn StreamObserver>);

#[derive(Default)]
struct StreamState {
    observers: Vec<ObserverSlot>,
    next_id: u64,
    terminated: bool,
}

fn lock(state: &Mutex<StreamState>) -> MutexGuard<'_, StreamState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle to a multicast stream. Clones share the same observers.
#[derive(Clone)]
pub struct EventStream {
    name: Arc<str>,
    state: Arc<Mutex<StreamState>>,
}

impl EventStream {
    #[must_use]
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(StreamState::default())),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers an observer. Fails if the stream already errored or completed.
    pub fn subscribe(
        &self,
        observer: Arc<dyn StreamObserver>,
    ) -> Result<Subscription, SubscribeError> {
        let mut state = lock(&self.state);
        if state.terminated {
            return Err(SubscribeError::Terminated);
        }
        let id = state.next_id;
        state.next_id += 1;
        state.observers.push((id, observer));
        trace!("Observer {} subscribed to stream '{}'", id, self.name);

        Ok(Subscription {
            id,
            state: Arc::downgrade(&self.state),
        })
    }

    /// Delivers `value` to every current observer and returns how many
    /// received it. Emitting on a terminated stream is a no-op.
    pub fn emit(&self, value: Value) -> usize {
        let observers = {
            let state = lock(&self.state);
            if state.terminated {
                trace!("Dropping event emitted on terminated stream '{}'", self.name);
                return 0;
            }
            snapshot(&state)
        };

        for observer in &observers {
            observer.on_next(&value);
        }
        observers.len()
    }

    /// Terminates the stream with an error. Observers are notified once and
    /// released.
    pub fn error(&self, error: StreamError) {
        let Some(observers) = self.terminate() else {
            return;
        };
        for observer in &observers {
            observer.on_error(&error);
        }
    }

    /// Terminates the stream normally.
    pub fn complete(&self) {
        let Some(observers) = self.terminate() else {
            return;
        };
        for observer in &observers {
            observer.on_complete();
        }
    }

    pub fn is_terminated(&self) -> bool {
        lock(&self.state).terminated
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.state).observers.len()
    }

    fn terminate(&self) -> Option<Vec<Arc<dyn StreamObserver>>> {
        let mut state = lock(&self.state);
        if state.terminated {
            return None;
        }
        state.terminated = true;
        let observers = std::mem::take(&mut state.observers);
        Some(observers.into_iter().map(|(_, observer)| observer).collect())
    }
}

fn snapshot(state: &StreamState) -> Vec<Arc<dyn StreamObserver>> {
    state
        .observers
        .iter()
        .map(|(_, observer)| Arc::clone(observer))
        .collect()
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("EventStream")
            .field("name", &self.name)
            .field("observers", &state.observers.len())
            .field("terminated", &state.terminated)
            .finish()
    }
}

/// Live subscription to an [`EventStream`]. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    state: Weak<Mutex<StreamState>>,
}

impl Subscription {
    /// Removes the observer from its stream. Safe to call more than once and
    /// after the stream itself is gone.
    pub fn unsubscribe(&self) {
        if let Some(state) = self.state.upgrade() {
            lock(&state).observers.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
