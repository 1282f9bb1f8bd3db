//! Postgres store adapter
//!
//! Durable event log keyed by `(aggregate_id, sequence)` with the snapshot
//! table keyed by aggregate id alone. Optimistic concurrency rides on the
//! primary key: a duplicate insert surfaces as a unique violation and is
//! reported as a conflict.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgPool;

use crate::clock::Timestamp;
use crate::registry::Projection;

use super::{EventRecord, EventStore, SnapshotRecord, StoreError};

/// Schema for the two runtime tables
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    aggregate_id TEXT NOT NULL,
    sequence BIGINT NOT NULL,
    kind TEXT NOT NULL,
    data JSONB NOT NULL,
    ts TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    PRIMARY KEY (aggregate_id, sequence)
);

CREATE TABLE IF NOT EXISTS event_snapshots (
    aggregate_id TEXT PRIMARY KEY,
    sequence BIGINT NOT NULL,
    body JSONB NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Event and snapshot store backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the runtime tables if they do not exist
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for statement in MIGRATION_SQL.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&self.pool).await?;
            }
        }
        Ok(())
    }
}

// Sequences are u64 in the data model but BIGINT in Postgres; reads clamp
// the upper bound instead of wrapping it negative.
fn bind_seq(sequence: u64) -> i64 {
    sequence.min(i64::MAX as u64) as i64
}

fn parse_timestamp(text: &str) -> Result<Timestamp, StoreError> {
    text.parse()
        .map_err(|_| StoreError::InvalidData(format!("corrupt timestamp column: {text}")))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

#[async_trait]
impl EventStore for PostgresEventStore {
    async fn append(
        &self,
        events: &[EventRecord],
        projections: &[Arc<dyn Projection>],
    ) -> Result<(), StoreError> {
        if events.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for event in events {
            let result = sqlx::query(
                r#"
                INSERT INTO events (aggregate_id, sequence, kind, data, ts)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(event.aggregate_id.to_string())
            .bind(bind_seq(event.sequence))
            .bind(&event.kind)
            .bind(&event.data)
            .bind(event.timestamp.to_string())
            .execute(&mut *tx)
            .await;

            if let Err(error) = result {
                if is_unique_violation(&error) {
                    return Err(StoreError::Conflict {
                        aggregate_id: event.aggregate_id,
                        sequence: event.sequence,
                    });
                }
                return Err(error.into());
            }
        }

        // A projection failure drops the transaction, rolling back the
        // event rows with it.
        for projection in projections {
            projection.project(events).await?;
        }

        tx.commit().await?;

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
        let rows: Vec<(i64, String, serde_json::Value, String)> = sqlx::query_as(
            r#"
            SELECT sequence, kind, data, ts
            FROM events
            WHERE aggregate_id = $1 AND sequence > $2 AND sequence <= $3
            ORDER BY sequence ASC
            "#,
        )
        .bind(aggregate_id.to_string())
        .bind(bind_seq(after))
        .bind(bind_seq(max))
        .fetch_all(&self.pool)
        .await?;

        let mut events = Vec::with_capacity(rows.len());
        for (sequence, kind, data, ts) in rows {
            events.push(EventRecord {
                aggregate_id,
                sequence: sequence as u64,
                kind,
                data,
                timestamp: parse_timestamp(&ts)?,
            });
        }
        Ok(events)
    }

    async fn snapshot(
        &self,
        aggregate_id: Timestamp,
        min: u64,
        max: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        let row: Option<(i64, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT sequence, body
            FROM event_snapshots
            WHERE aggregate_id = $1 AND sequence > $2 AND sequence <= $3
            "#,
        )
        .bind(aggregate_id.to_string())
        .bind(bind_seq(min))
        .bind(bind_seq(max))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(sequence, body)| SnapshotRecord {
            aggregate_id,
            sequence: sequence as u64,
            body,
        }))
    }

    async fn commit_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO event_snapshots (aggregate_id, sequence, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (aggregate_id)
            DO UPDATE SET sequence = EXCLUDED.sequence, body = EXCLUDED.body, updated_at = NOW()
            WHERE event_snapshots.sequence < EXCLUDED.sequence
            "#,
        )
        .bind(snapshot.aggregate_id.to_string())
        .bind(bind_seq(snapshot.sequence))
        .bind(&snapshot.body)
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            aggregate_id = %snapshot.aggregate_id,
            sequence = snapshot.sequence,
            "snapshot committed"
        );
        Ok(())
    }
}
