//! Common test utilities
//!
//! Account fixture domain for the end-to-end tests, plus store wrappers for
//! observing hydration reads and forcing sequence races.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};

use eventfold::{
    Aggregate, AggregateConfig, Command, CommandHandler, Directory, EventDraft, EventHandler,
    EventRecord, EventStore, HandlerError, HandlerRegistry, HlcClock, InMemoryEventStore,
    Projection, SnapshotRecord, StoreError, Timestamp,
};

/// Initialize test logging once per process
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "eventfold=debug".into()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

fn amount_of(data: &Value) -> Result<i64, HandlerError> {
    data["amount"]
        .as_i64()
        .ok_or_else(|| HandlerError::new("invalid_amount", "amount must be an integer"))
}

/// Balance field of an account state
pub fn balance_of(state: &Value) -> i64 {
    state["balance"].as_i64().unwrap_or(0)
}

#[derive(Debug)]
pub struct DepositHandler;

impl CommandHandler for DepositHandler {
    fn eval(
        &self,
        _aggregate: &Aggregate,
        command: &Command,
    ) -> Result<Vec<EventDraft>, HandlerError> {
        let amount = amount_of(&command.data)?;
        if amount <= 0 {
            return Err(HandlerError::new("invalid_amount", "deposit must be positive"));
        }
        Ok(vec![EventDraft::new(
            "account.deposited",
            json!({ "amount": amount }),
        )])
    }
}

#[derive(Debug)]
pub struct WithdrawHandler;

impl CommandHandler for WithdrawHandler {
    fn eval(
        &self,
        aggregate: &Aggregate,
        command: &Command,
    ) -> Result<Vec<EventDraft>, HandlerError> {
        let amount = amount_of(&command.data)?;
        // Overdrafts are rejected by emitting nothing.
        if amount > balance_of(aggregate.state()) {
            return Ok(Vec::new());
        }
        Ok(vec![EventDraft::new(
            "account.withdrawn",
            json!({ "amount": amount }),
        )])
    }
}

#[derive(Debug)]
pub struct DepositedHandler;

impl EventHandler for DepositedHandler {
    fn apply(&self, state: Value, event: &EventRecord) -> Result<Value, HandlerError> {
        let amount = amount_of(&event.data)?;
        Ok(json!({ "balance": balance_of(&state) + amount }))
    }
}

#[derive(Debug)]
pub struct WithdrawnHandler;

impl EventHandler for WithdrawnHandler {
    fn apply(&self, state: Value, event: &EventRecord) -> Result<Value, HandlerError> {
        let amount = amount_of(&event.data)?;
        Ok(json!({ "balance": balance_of(&state) - amount }))
    }
}

pub fn account_registry() -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::new();
    registry.register_command("account.deposit", Arc::new(DepositHandler));
    registry.register_command("account.withdraw", Arc::new(WithdrawHandler));
    registry.register_event("account.deposited", Arc::new(DepositedHandler));
    registry.register_event("account.withdrawn", Arc::new(WithdrawnHandler));
    Arc::new(registry)
}

pub fn account_config() -> AggregateConfig {
    AggregateConfig::new().with_initial_state(|| json!({ "balance": 0 }))
}

pub fn account_directory(store: Arc<dyn EventStore>, clock: Arc<HlcClock>) -> Directory {
    Directory::new(store, account_registry(), clock, account_config())
}

pub fn deposit(id: Timestamp, amount: i64) -> Command {
    Command::new(id, "account.deposit", json!({ "amount": amount }))
}

pub fn withdraw(id: Timestamp, amount: i64) -> Command {
    Command::new(id, "account.withdraw", json!({ "amount": amount }))
}

/// Store wrapper counting how many events its reads return
///
/// Used to assert that snapshot-backed hydration does not replay events.
pub struct CountingStore {
    inner: InMemoryEventStore,
    events_returned: AtomicU64,
}

impl CountingStore {
    pub fn new(inner: InMemoryEventStore) -> Self {
        Self {
            inner,
            events_returned: AtomicU64::new(0),
        }
    }

    pub fn reset(&self) {
        self.events_returned.store(0, Ordering::SeqCst);
    }

    pub fn events_returned(&self) -> u64 {
        self.events_returned.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for CountingStore {
    async fn append(
        &self,
        events: &[EventRecord],
        projections: &[Arc<dyn Projection>],
    ) -> Result<(), StoreError> {
        self.inner.append(events, projections).await
    }

    async fn events(
        &self,
        aggregate_id: Timestamp,
        after: u64,
        max: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let events = self.inner.events(aggregate_id, after, max).await?;
        self.events_returned
            .fetch_add(events.len() as u64, Ordering::SeqCst);
        Ok(events)
    }

    async fn snapshot(
        &self,
        aggregate_id: Timestamp,
        min: u64,
        max: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        self.inner.snapshot(aggregate_id, min, max).await
    }

    async fn commit_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), StoreError> {
        self.inner.commit_snapshot(snapshot).await
    }
}

/// Store wrapper simulating a second writer racing the commit
///
/// While armed, the next `append` first injects the rival event, so the
/// forwarded batch loses the sequence race exactly once.
pub struct RacingStore {
    inner: InMemoryEventStore,
    rival: Mutex<Option<EventRecord>>,
}

impl RacingStore {
    pub fn new(inner: InMemoryEventStore) -> Self {
        Self {
            inner,
            rival: Mutex::new(None),
        }
    }

    pub fn arm(&self, rival: EventRecord) {
        *self.rival.lock().unwrap() = Some(rival);
    }
}

#[async_trait]
impl EventStore for RacingStore {
    async fn append(
        &self,
        events: &[EventRecord],
        projections: &[Arc<dyn Projection>],
    ) -> Result<(), StoreError> {
        let rival = { self.rival.lock().unwrap().take() };
        if let Some(rival) = rival {
            self.inner.append(&[rival], &[]).await?;
        }
        self.inner.append(events, projections).await
    }

    async fn events(
        &self,
        aggregate_id: Timestamp,
        after: u64,
        max: u64,
    ) -> Result<Vec<EventRecord>, StoreError> {
        self.inner.events(aggregate_id, after, max).await
    }

    async fn snapshot(
        &self,
        aggregate_id: Timestamp,
        min: u64,
        max: u64,
    ) -> Result<Option<SnapshotRecord>, StoreError> {
        self.inner.snapshot(aggregate_id, min, max).await
    }

    async fn commit_snapshot(&self, snapshot: &SnapshotRecord) -> Result<(), StoreError> {
        self.inner.commit_snapshot(snapshot).await
    }
}
