// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Built-in transformers for the stream kinds the service's own components
//! publish.
//!
//! - **[`logs`]**: plain log lines from a [`LogEmitter`](crate::emitter::LogEmitter)
//! - **[`state`]**: state machine transitions
//! - **[`repository`]**: persistence operations and their failures

pub mod logs;
pub mod repository;
pub mod state;

use std::sync::Arc;

use crate::transformer::StreamTransformer;

pub use logs::LogStreamTransformer;
pub use repository::RepositoryEventTransformer;
pub use state::StateChangeTransformer;

/// One instance of every built-in transformer.
#[must_use]
pub fn builtin() -> Vec<Arc<dyn StreamTransformer>> {
    vec![
        Arc::new(LogStreamTransformer),
        Arc::new(StateChangeTransformer),
        Arc::new(RepositoryEventTransformer),
    ]
}
