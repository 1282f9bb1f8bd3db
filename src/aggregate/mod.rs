//! Aggregate module
//!
//! The in-memory aggregate value, its configuration, and the runtime
//! pipeline around it: hydration from snapshot plus trailing events, the
//! command evaluation loop with optimistic commit and retry, pure replay,
//! and snapshot capture.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{HlcClock, Timestamp};
use crate::error::{RuntimeError, RuntimeResult};
use crate::registry::{HandlerRegistry, Projection};
use crate::store::{EventRecord, EventStore, SnapshotRecord};

const RETRY_BASE: Duration = Duration::from_millis(10);
const RETRY_CAP: Duration = Duration::from_secs(1);

/// A request to change an aggregate's state; evaluated, never stored
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub aggregate_id: Timestamp,
    pub kind: String,
    pub data: Value,
}

impl Command {
    pub fn new(aggregate_id: Timestamp, kind: impl Into<String>, data: Value) -> Self {
        Self {
            aggregate_id,
            kind: kind.into(),
            data,
        }
    }
}

/// An event as produced by a command handler, before the runtime assigns
/// its sequence and timestamp
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub kind: String,
    pub data: Value,
}

impl EventDraft {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: kind.into(),
            data,
        }
    }
}

/// In-memory aggregate value
///
/// `sequence` is the highest event sequence folded into `state`. State is
/// produced only by the initial-state constructor, `use_snapshot`, or
/// successive event-handler folds.
#[derive(Debug, Clone)]
pub struct Aggregate {
    id: Timestamp,
    sequence: u64,
    state: Value,
}

impl Aggregate {
    pub fn new(id: Timestamp, state: Value) -> Self {
        Self {
            id,
            sequence: 0,
            state,
        }
    }

    pub fn id(&self) -> Timestamp {
        self.id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Replace the state in place. Reserved for extension turns delivered
    /// through the actor's `call` operation; normal state transitions go
    /// through event folds.
    pub fn set_state(&mut self, state: Value) {
        self.state = state;
    }
}

type InitialStateFn = Arc<dyn Fn() -> Value + Send + Sync>;
type PrepareSnapshotFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
type UseSnapshotFn = Arc<dyn Fn(&Aggregate, &SnapshotRecord) -> Value + Send + Sync>;

/// Per-root configuration: overridable lifecycle callbacks, commit-time
/// projections, and the automatic snapshot interval
#[derive(Clone)]
pub struct AggregateConfig {
    initial_state: InitialStateFn,
    prepare_snapshot: PrepareSnapshotFn,
    use_snapshot: UseSnapshotFn,
    projections: Vec<Arc<dyn Projection>>,
    snapshot_every: Option<u64>,
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            initial_state: Arc::new(|| Value::Object(Default::default())),
            prepare_snapshot: Arc::new(Clone::clone),
            use_snapshot: Arc::new(|_, snapshot| snapshot.body.clone()),
            projections: Vec::new(),
            snapshot_every: None,
        }
    }
}

impl AggregateConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial_state(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.initial_state = Arc::new(f);
        self
    }

    pub fn with_prepare_snapshot(
        mut self,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.prepare_snapshot = Arc::new(f);
        self
    }

    pub fn with_use_snapshot(
        mut self,
        f: impl Fn(&Aggregate, &SnapshotRecord) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.use_snapshot = Arc::new(f);
        self
    }

    pub fn with_projection(mut self, projection: Arc<dyn Projection>) -> Self {
        self.projections.push(projection);
        self
    }

    /// Capture a snapshot automatically each time the sequence crosses a
    /// multiple of `every`
    pub fn with_snapshot_every(mut self, every: u64) -> Self {
        self.snapshot_every = Some(every);
        self
    }
}

impl fmt::Debug for AggregateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateConfig")
            .field("projections", &self.projections.len())
            .field("snapshot_every", &self.snapshot_every)
            .finish()
    }
}

/// The aggregate runtime: hydration, evaluation, replay, snapshots
///
/// Shared by every actor of one aggregate root. All methods take the
/// aggregate value explicitly; serialization per id is the actor's job.
#[derive(Clone)]
pub struct AggregateRuntime {
    store: Arc<dyn EventStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<HlcClock>,
    config: AggregateConfig,
}

impl AggregateRuntime {
    pub fn new(
        store: Arc<dyn EventStore>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<HlcClock>,
        config: AggregateConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            config,
        }
    }

    /// A fresh aggregate at sequence 0 with the configured initial state
    pub fn blank(&self, id: Timestamp) -> Aggregate {
        Aggregate::new(id, (self.config.initial_state)())
    }

    /// Bring the aggregate up to date with everything in the store
    pub async fn hydrate(&self, aggregate: &mut Aggregate) -> RuntimeResult<()> {
        self.hydrate_to(aggregate, self.store.max_sequence()).await
    }

    /// Hydrate, reading no event or snapshot past `max_seq`
    ///
    /// The best snapshot above the current sequence is applied first, then
    /// trailing events are folded. The aggregate is only modified if every
    /// fold succeeds.
    pub async fn hydrate_to(&self, aggregate: &mut Aggregate, max_seq: u64) -> RuntimeResult<()> {
        let mut state = aggregate.state.clone();
        let mut sequence = aggregate.sequence;

        if let Some(snapshot) = self
            .store
            .snapshot(aggregate.id, sequence, max_seq)
            .await?
        {
            if snapshot.sequence > sequence {
                state = (self.config.use_snapshot)(aggregate, &snapshot);
                sequence = snapshot.sequence;
                tracing::debug!(
                    aggregate_id = %aggregate.id,
                    sequence,
                    "restored snapshot"
                );
            }
        }

        let events = self.store.events(aggregate.id, sequence, max_seq).await?;
        let (state, last) = self.fold(state, &events)?;

        aggregate.state = state;
        aggregate.sequence = last.unwrap_or(sequence);
        Ok(())
    }

    /// What the state would be at `sequence == target`, reconstructed from
    /// a fresh initial state; never touches a live aggregate
    pub async fn replay(&self, id: Timestamp, target: u64) -> RuntimeResult<Value> {
        let mut fresh = self.blank(id);
        self.hydrate_to(&mut fresh, target).await?;
        Ok(fresh.state)
    }

    /// Evaluate a command: hydrate, run the command handler, commit the
    /// produced events, fold them into state
    ///
    /// A sequence conflict means another writer appended since hydration;
    /// the loop re-hydrates and re-evaluates the same command, backing off
    /// between attempts. Command handlers must therefore be deterministic
    /// and side-effect-free.
    pub async fn evaluate(&self, aggregate: &mut Aggregate, command: &Command) -> RuntimeResult<()> {
        if command.aggregate_id != aggregate.id {
            return Err(RuntimeError::InvalidCommand(format!(
                "command for {} delivered to aggregate {}",
                command.aggregate_id, aggregate.id
            )));
        }

        let mut backoff = RETRY_BASE;
        loop {
            self.hydrate(aggregate).await?;

            let handler = self.registry.command(&command.kind)?;
            let drafts = handler.eval(aggregate, command).map_err(RuntimeError::from)?;
            if drafts.is_empty() {
                return Ok(());
            }

            let events = self.prepare(aggregate, drafts)?;
            match self.store.append(&events, &self.config.projections).await {
                Ok(()) => {
                    let (state, last) = self.fold(aggregate.state.clone(), &events)?;
                    let before = aggregate.sequence;
                    aggregate.state = state;
                    aggregate.sequence = last.unwrap_or(before);

                    tracing::debug!(
                        aggregate_id = %aggregate.id,
                        command = %command.kind,
                        sequence = aggregate.sequence,
                        events = events.len(),
                        "command committed"
                    );

                    self.snapshot_if_due(aggregate, before).await;
                    return Ok(());
                }
                Err(error) if error.is_conflict() => {
                    tracing::warn!(
                        aggregate_id = %aggregate.id,
                        command = %command.kind,
                        backoff_ms = backoff.as_millis() as u64,
                        "sequence conflict, retrying after hydration"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(RETRY_CAP);
                }
                Err(error) => return Err(error.into()),
            }
        }
    }

    /// Capture a snapshot of the aggregate at its current sequence
    pub async fn snapshot(&self, aggregate: &Aggregate) -> RuntimeResult<()> {
        let snapshot = SnapshotRecord {
            aggregate_id: aggregate.id,
            sequence: aggregate.sequence,
            body: (self.config.prepare_snapshot)(&aggregate.state),
        };
        self.store.commit_snapshot(&snapshot).await?;
        tracing::debug!(
            aggregate_id = %aggregate.id,
            sequence = aggregate.sequence,
            "snapshot captured"
        );
        Ok(())
    }

    /// Assign sequences and timestamps to drafted events, preserving the
    /// order the command handler emitted them
    fn prepare(
        &self,
        aggregate: &Aggregate,
        drafts: Vec<EventDraft>,
    ) -> RuntimeResult<Vec<EventRecord>> {
        let mut events = Vec::with_capacity(drafts.len());
        for (offset, draft) in drafts.into_iter().enumerate() {
            events.push(EventRecord {
                aggregate_id: aggregate.id,
                sequence: aggregate.sequence + offset as u64 + 1,
                kind: draft.kind,
                data: draft.data,
                timestamp: self.clock.now()?,
            });
        }
        Ok(events)
    }

    /// Fold events into a state, returning the new state and the last
    /// applied sequence. Observing each event's timestamp keeps the local
    /// clock ahead of every writer seen for this aggregate.
    fn fold(&self, mut state: Value, events: &[EventRecord]) -> RuntimeResult<(Value, Option<u64>)> {
        let mut last = None;
        for event in events {
            let handler = self.registry.event(&event.kind)?;
            state = handler.apply(state, event).map_err(RuntimeError::from)?;
            self.clock.observe(event.timestamp);
            last = Some(event.sequence);
        }
        Ok((state, last))
    }

    async fn snapshot_if_due(&self, aggregate: &Aggregate, before: u64) {
        let Some(every) = self.config.snapshot_every else {
            return;
        };
        if every == 0 || aggregate.sequence / every == before / every {
            return;
        }
        if let Err(error) = self.snapshot(aggregate).await {
            tracing::warn!(
                aggregate_id = %aggregate.id,
                %error,
                "automatic snapshot failed"
            );
        }
    }
}
