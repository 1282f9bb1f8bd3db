//! In-memory store adapter
//!
//! Reference adapter used by tests and local development. Conflict
//! detection intersects the incoming batch's sequence numbers with the
//! sequences already stored for the aggregate.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::clock::Timestamp;
use crate::registry::Projection;

use super::{EventRecord, EventStore, SnapshotRecord, StoreError};

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<Timestamp, BTreeMap<u64, EventRecord>>,
    snapshots: HashMap<Timestamp, SnapshotRecord>,
}

/// In-memory event and snapshot store
#[derive(Debug, Default, Clone)]
pub struct InMemoryEventStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of events stored for an aggregate
    pub async fn event_count(&self, aggregate_id: Timestamp) -> u64 {
        let inner = self.inner.read().await;
        inner
            .events
            .get(&aggregate_id)
            .map(|stream| stream.len() as u64)
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        events: &[EventRecord],
        projections: &[Arc<dyn Projection>],
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        // The write lock is the commit critical section: conflicts are
        // checked, projections run, and rows become visible under it.
        let mut inner = self.inner.write().await;

        for event in events {
            let taken = inner
                .events
                .get(&event.aggregate_id)
                .map(|stream| stream.contains_key(&event.sequence))
                .unwrap_or(false);
            if taken {
                return Err(StoreError::Conflict {
                    aggregate_id: event.aggregate_id,
                    sequence: event.sequence,
                });
            }
        }

        for projection in projections {
            projection.project(events).await?;
        }

        for event in events {
            inner
                .events
                .entry(event.aggregate_id)
                .or_default()
                .insert(event.sequence, event.clone());
        }

        tracing::debug!(
            aggregate_id = %events[0].aggregate_id,
            count = events.len(),
            "appended events"
        );
        Ok(())
    }

    async fn events(
        &self,
        aggregate_id: Timestamp,
        after: u64,
        max: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let inner = self.inner.read().await;
        let events = inner
            .events
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .range((Bound::Excluded(after), Bound::Included(max)))
                    .map(|(_, event)| event.clone())
                    .collect()
            })
            .unwrap_or_default();
        Ok(events)
    }

    async fn snapshot(
        &self,
        aggregate_id: Timestamp,
        min: u64,
        max: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let inner = self.inner.read().await;
        let snapshot = inner
            .snapshots
            .get(&aggregate_id)
            .filter(|snapshot| snapshot.sequence > min && snapshot.sequence <= max)
            .cloned();
        Ok(snapshot)
    }

    async fn commit_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        match inner.snapshots.get(&snapshot.aggregate_id) {
            Some(stored) if stored.sequence >= snapshot.sequence => {}
            _ => {
                inner
                    .snapshots
                    .insert(snapshot.aggregate_id, snapshot.clone());
            }
        }
        Ok(())
    }
}
