//! Handler registry module
//!
//! Routes command and event type tags to the user-supplied handlers that
//! evaluate and apply them. Registration happens once at startup; lookups
//! are concurrent-safe and a miss fails the operation with
//! `InvalidHandler`.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::aggregate::{Aggregate, Command, EventDraft};
use crate::error::RuntimeError;
use crate::store::{EventRecord, StoreError};

/// Error raised by user handler code
///
/// Converted into `RuntimeError::HandlerFault` at the actor boundary; the
/// aggregate's state is left unchanged.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    pub kind: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(error: serde_json::Error) -> Self {
        Self::new("serialization", error.to_string())
    }
}

/// Evaluates a command against the aggregate's current state
///
/// Must be deterministic and side-effect-free: the commit path re-runs it
/// after hydration whenever the append loses a sequence race.
pub trait CommandHandler: Send + Sync + std::fmt::Debug {
    fn eval(&self, aggregate: &Aggregate, command: &Command)
        -> Result<Vec<EventDraft>, HandlerError>;
}

/// Folds one event into the aggregate's state
///
/// Must be total and deterministic for every event kind it is registered
/// under: replay and hydration depend on it.
pub trait EventHandler: Send + Sync + std::fmt::Debug {
    fn apply(
        &self,
        state: serde_json::Value,
        event: &EventRecord,
    ) -> Result<serde_json::Value, HandlerError>;
}

/// Read-model hook invoked by the store inside the commit
///
/// A projection failure fails the whole append.
#[async_trait]
pub trait Projection: Send + Sync {
    async fn project(&self, events: &[EventRecord]) -> Result<(), StoreError>;
}

/// Tag-to-handler tables for commands and events
#[derive(Default)]
pub struct HandlerRegistry {
    commands: DashMap<String, Arc<dyn CommandHandler>>,
    events: DashMap<String, Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_command(&self, tag: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.commands.insert(tag.into(), handler);
    }

    pub fn register_event(&self, tag: impl Into<String>, handler: Arc<dyn EventHandler>) {
        self.events.insert(tag.into(), handler);
    }

    /// Resolve the command handler for a type tag
    pub fn command(&self, tag: &str) -> Result<Arc<dyn CommandHandler>, RuntimeError> {
        self.commands
            .get(tag)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RuntimeError::InvalidHandler(tag.to_string()))
    }

    /// Resolve the event handler for a type tag
    pub fn event(&self, tag: &str) -> Result<Arc<dyn EventHandler>, RuntimeError> {
        self.events
            .get(tag)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| RuntimeError::InvalidHandler(tag.to_string()))
    }
}

/// Derive a dotted lowercase type tag from a fully-qualified name
///
/// Drops the leading `prefix` segments when they match, then converts each
/// remaining CamelCase segment to snake case:
/// `tag_from_path("Bank.Account", "Bank.Account.Transfer.MoneyDeposited")`
/// is `"transfer.money_deposited"`.
pub fn tag_from_path(prefix: &str, path: &str) -> String {
    let prefix_segments: Vec<&str> = if prefix.is_empty() {
        Vec::new()
    } else {
        prefix.split('.').collect()
    };
    let segments: Vec<&str> = path.split('.').collect();

    let rest = if segments.len() > prefix_segments.len()
        && segments[..prefix_segments.len()] == prefix_segments[..]
    {
        &segments[prefix_segments.len()..]
    } else {
        &segments[..]
    };

    rest.iter()
        .map(|segment| camel_to_snake(segment))
        .collect::<Vec<_>>()
        .join(".")
}

fn camel_to_snake(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len() + 4);
    for (index, ch) in segment.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if index > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
