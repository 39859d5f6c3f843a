//! Tag → factory registry used to rebuild actions from parcels.
//!
//! Populated once at startup, before any socket I/O, then shared read-only
//! (behind an `Arc`) with the dispatch loop.

use std::collections::HashMap;

use bytes::Bytes;

use crate::action::{Action, TypedAction};
use crate::envelope::{decode_payload, encode_action};
use crate::{ProtocolError, Result};

/// Builds an action from its serialized body.
pub type ActionFactory<C> = Box<dyn Fn(&[u8]) -> Result<Box<dyn Action<C>>> + Send + Sync>;

pub struct ActionRegistry<C: ?Sized + 'static> {
    factories: HashMap<String, ActionFactory<C>>,
}

impl<C: ?Sized + 'static> ActionRegistry<C> {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a decoder for `tag`. A second registration replaces the first.
    pub fn register(&mut self, tag: impl Into<String>, factory: ActionFactory<C>) {
        let tag = tag.into();
        if self.factories.insert(tag.clone(), factory).is_some() {
            tracing::warn!(%tag, "registry: replaced existing action factory");
        } else {
            tracing::debug!(%tag, "registry: action registered");
        }
    }

    /// Register the serde decoder for a typed action.
    pub fn register_typed<A: TypedAction<C>>(&mut self) {
        self.register(
            A::TAG,
            Box::new(|body: &[u8]| -> Result<Box<dyn Action<C>>> {
                let action: A = serde_json::from_slice(body)?;
                Ok(Box::new(action) as Box<dyn Action<C>>)
            }),
        );
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.factories.contains_key(tag)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered tags, sorted.
    pub fn tags(&self) -> Vec<&str> {
        let mut tags: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        tags.sort_unstable();
        tags
    }

    /// Encode an action into a payload. Encoding does not consult the
    /// registry, but keeping it here pairs it with [`Self::decode`].
    pub fn encode(&self, action: &dyn Action<C>) -> Result<Bytes> {
        encode_action(action)
    }

    /// Rebuild an action from a payload.
    pub fn decode(&self, payload: &[u8]) -> Result<Box<dyn Action<C>>> {
        let (tag, body) = decode_payload(payload)?;
        let factory = self
            .factories
            .get(tag)
            .ok_or_else(|| ProtocolError::UnknownActionType(tag.to_string()))?;
        factory(body)
    }
}

impl<C: ?Sized + 'static> Default for ActionRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ?Sized + 'static> std::fmt::Debug for ActionRegistry<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("tags", &self.tags())
            .finish()
    }
}
