//! Directory module
//!
//! Maps aggregate ids to their running actors, starting one on demand. One
//! directory serves one aggregate root: the handler registry, store, clock
//! and configuration are fixed at construction, and every id resolved
//! through the directory gets an actor wired to them.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::actor::{self, ActorHandle};
use crate::aggregate::{AggregateConfig, AggregateRuntime, Command};
use crate::clock::{HlcClock, Timestamp};
use crate::error::RuntimeResult;
use crate::registry::HandlerRegistry;
use crate::store::EventStore;

const DEFAULT_MAILBOX: usize = 64;

/// Id-to-actor directory for one aggregate root
pub struct Directory {
    runtime: AggregateRuntime,
    clock: Arc<HlcClock>,
    actors: DashMap<Timestamp, ActorHandle>,
    mailbox: usize,
}

impl Directory {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<HlcClock>,
        config: AggregateConfig,
    ) -> Self {
        Self {
            runtime: AggregateRuntime::new(store, registry, clock.clone(), config),
            clock,
            actors: DashMap::new(),
            mailbox: DEFAULT_MAILBOX,
        }
    }

    pub fn with_mailbox(mut self, mailbox: usize) -> Self {
        self.mailbox = mailbox;
        self
    }

    /// Mint a fresh aggregate id from the clock and start its actor
    pub fn create(&self) -> RuntimeResult<ActorHandle> {
        let id = self.clock.now()?;
        Ok(self.whereis(id))
    }

    /// The running actor for `id`, started on demand
    ///
    /// The map's entry lock makes startup race-free: at most one actor per
    /// id exists at a time. An actor that terminated (crash or explicit
    /// stop) is replaced with a fresh one here, which re-hydrates from the
    /// store on spawn.
    pub fn whereis(&self, id: Timestamp) -> ActorHandle {
        let mut entry = self
            .actors
            .entry(id)
            .or_insert_with(|| actor::spawn(id, self.runtime.clone(), self.mailbox));
        if !entry.value().is_alive() {
            *entry.value_mut() = actor::spawn(id, self.runtime.clone(), self.mailbox);
        }
        entry.value().clone()
    }

    /// Number of actors currently registered
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// In-memory state of `id`, no store access
    pub async fn get(&self, id: Timestamp) -> RuntimeResult<Value> {
        self.whereis(id).get().await
    }

    /// Hydrated state of `id`
    pub async fn fetch(&self, id: Timestamp) -> RuntimeResult<Value> {
        self.whereis(id).fetch().await
    }

    /// State of `id` reconstructed at `target`
    pub async fn replay(&self, id: Timestamp, target: u64) -> RuntimeResult<Value> {
        self.whereis(id).replay(target).await
    }

    /// Route a command to its aggregate's actor
    pub async fn evaluate(&self, command: Command) -> RuntimeResult<()> {
        self.whereis(command.aggregate_id).evaluate(command).await
    }

    /// Capture a snapshot of `id` at its current sequence
    pub async fn snapshot(&self, id: Timestamp) -> RuntimeResult<()> {
        self.whereis(id).snapshot().await
    }

    /// Stop the actor for `id`, if one is running
    pub async fn stop(&self, id: Timestamp) {
        if let Some((_, handle)) = self.actors.remove(&id) {
            handle.stop().await;
        }
    }

    /// Stop every running actor
    pub async fn shutdown(&self) {
        let handles: Vec<ActorHandle> = self
            .actors
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.actors.clear();
        for handle in handles {
            handle.stop().await;
        }
        tracing::info!("directory shut down");
    }
}
