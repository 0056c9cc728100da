// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stream kind to transformer lookup.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::transformer::StreamTransformer;
use crate::transformers;

/// Maps stream kinds to transformers. Registration can happen at any time,
/// including while subscriptions for other kinds are live; the last
/// registration for a kind wins.
#[derive(Default)]
pub struct TransformerRegistry {
    transformers: RwLock<HashMap<String, Arc<dyn StreamTransformer>>>,
}

impl TransformerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-loaded with the built-in `logs`, `state` and
    /// `repository` transformers.
    #[must_use]
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for transformer in transformers::builtin() {
            registry.register(transformer);
        }
        registry
    }

    /// Stores `transformer` under its stream kind and returns the one it
    /// replaced, if any.
    pub fn register(
        &self,
        transformer: Arc<dyn StreamTransformer>,
    ) -> Option<Arc<dyn StreamTransformer>> {
        let kind = transformer.stream_kind().to_string();
        let previous = self
            .transformers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind.clone(), transformer);
        if previous.is_some() {
            debug!("Replaced transformer for stream kind '{}'", kind);
        } else {
            debug!("Registered transformer for stream kind '{}'", kind);
        }
        previous
    }

    pub fn unregister(&self, stream_kind: &str) -> Option<Arc<dyn StreamTransformer>> {
        self.transformers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(stream_kind)
    }

    pub fn lookup(&self, stream_kind: &str) -> Option<Arc<dyn StreamTransformer>> {
        self.transformers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(stream_kind)
            .cloned()
    }

    pub fn contains(&self, stream_kind: &str) -> bool {
        self.transformers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(stream_kind)
    }

    /// Registered stream kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self
            .transformers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        kinds.sort();
        kinds
    }

    pub fn len(&self) -> usize {
        self.transformers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for TransformerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}
