//! Store adapter module
//!
//! Append-only event log plus a single-row-per-aggregate snapshot store,
//! both behind an optimistic-concurrency contract. Two adapters ship with
//! the runtime: [`InMemoryEventStore`] for tests and [`PostgresEventStore`]
//! for durable deployments.

mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use memory::InMemoryEventStore;
pub use postgres::{PostgresEventStore, MIGRATION_SQL};

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::registry::Projection;

/// A committed event row
///
/// Sequences are dense and start at 1 within each aggregate; timestamps are
/// strictly increasing with sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub aggregate_id: Timestamp,
    pub sequence: u64,
    pub kind: String,
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
}

/// A cached view of an aggregate's state at some sequence
///
/// At most one snapshot is retained per aggregate; newer-sequence bodies
/// replace older ones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub aggregate_id: Timestamp,
    pub sequence: u64,
    pub body: serde_json::Value,
}

/// Store adapter contract
///
/// `append` must be linearizable per aggregate id. Snapshots are an
/// optimization, never a source of truth: events remain authoritative past
/// the snapshot point.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically append a batch of events and run every projection.
    ///
    /// Returns [`StoreError::Conflict`] iff any event's
    /// `(aggregate_id, sequence)` collides with an existing row. A
    /// projection failure aborts the whole commit.
    async fn append(
        &self,
        events: &[EventRecord],
        projections: &[Arc<dyn Projection>],
    ) -> Result<(), StoreError>;

    /// Events with `after < sequence <= max`, ordered by sequence ascending
    async fn events(
        &self,
        aggregate_id: Timestamp,
        after: u64,
        max: u64,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// The aggregate's snapshot, if one exists with `min < sequence <= max`
    async fn snapshot(
        &self,
        aggregate_id: Timestamp,
        min: u64,
        max: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError>;

    /// Persist a snapshot. Idempotent: a snapshot at a sequence at or below
    /// the stored one is a no-op.
    async fn commit_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), StoreError>;

    /// Ceiling value used as the default upper bound for reads
    fn max_sequence(&self) -> u64 {
        u64::MAX
    }
}
