//! Aggregate actor module
//!
//! One long-lived task per live aggregate. The task owns the aggregate
//! value and drains a bounded mailbox one operation at a time, so commands
//! and hydrations for an id never overlap. Callers hold an [`ActorHandle`]
//! and impose their own deadlines with `tokio::time::timeout`; an expired
//! wait abandons the reply but does not cancel the in-flight turn.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use crate::aggregate::{Aggregate, AggregateRuntime, Command};
use crate::clock::Timestamp;
use crate::error::{RuntimeError, RuntimeResult};

type Reply<T> = oneshot::Sender<RuntimeResult<T>>;

enum Op {
    Get(Reply<Value>),
    Fetch(Reply<Value>),
    Replay(u64, Reply<Value>),
    Evaluate(Command, Reply<()>),
    Snapshot(Reply<()>),
    Call(Box<dyn FnOnce(&mut Aggregate) + Send>),
    Stop,
}

/// Address of a running aggregate actor
#[derive(Debug, Clone)]
pub struct ActorHandle {
    id: Timestamp,
    ops: mpsc::Sender<Op>,
}

/// Start the actor task for an aggregate id
pub(crate) fn spawn(id: Timestamp, runtime: AggregateRuntime, mailbox: usize) -> ActorHandle {
    let (ops, inbox) = mpsc::channel(mailbox);
    tokio::spawn(run(id, runtime, inbox));
    ActorHandle { id, ops }
}

async fn run(id: Timestamp, runtime: AggregateRuntime, mut inbox: mpsc::Receiver<Op>) {
    let mut aggregate = runtime.blank(id);

    // Initial hydration. A failure is not fatal: the actor stays up with
    // what it has, and the next fetch or evaluate retries the store.
    if let Err(error) = runtime.hydrate(&mut aggregate).await {
        tracing::warn!(aggregate_id = %id, %error, "initial hydration failed");
    }

    while let Some(op) = inbox.recv().await {
        match op {
            Op::Get(reply) => {
                let _ = reply.send(Ok(aggregate.state().clone()));
            }
            Op::Fetch(reply) => {
                let result = runtime
                    .hydrate(&mut aggregate)
                    .await
                    .map(|_| aggregate.state().clone());
                let _ = reply.send(result);
            }
            Op::Replay(target, reply) => {
                let _ = reply.send(runtime.replay(id, target).await);
            }
            Op::Evaluate(command, reply) => {
                let _ = reply.send(runtime.evaluate(&mut aggregate, &command).await);
            }
            Op::Snapshot(reply) => {
                let _ = reply.send(runtime.snapshot(&aggregate).await);
            }
            Op::Call(turn) => {
                turn(&mut aggregate);
            }
            Op::Stop => break,
        }
    }

    tracing::debug!(aggregate_id = %id, "aggregate actor terminated");
}

impl ActorHandle {
    pub fn id(&self) -> Timestamp {
        self.id
    }

    /// Whether the actor task is still draining its mailbox
    pub fn is_alive(&self) -> bool {
        !self.ops.is_closed()
    }

    /// Current in-memory state; no store access
    pub async fn get(&self) -> RuntimeResult<Value> {
        self.request(Op::Get).await
    }

    /// Hydrate from the store, then return the state
    pub async fn fetch(&self) -> RuntimeResult<Value> {
        self.request(Op::Fetch).await
    }

    /// State reconstructed at `target`, leaving the live state untouched
    pub async fn replay(&self, target: u64) -> RuntimeResult<Value> {
        self.request(|reply| Op::Replay(target, reply)).await
    }

    /// Evaluate a command; replies once the commit has succeeded or failed
    pub async fn evaluate(&self, command: Command) -> RuntimeResult<()> {
        self.request(|reply| Op::Evaluate(command, reply)).await
    }

    /// Capture a snapshot at the current sequence
    pub async fn snapshot(&self) -> RuntimeResult<()> {
        self.request(Op::Snapshot).await
    }

    /// Run a closure inside the actor's serialized turn
    ///
    /// Escape hatch for extension operations that need the aggregate value;
    /// the closure must not block.
    pub async fn call<F, T>(&self, turn: F) -> RuntimeResult<T>
    where
        F: FnOnce(&mut Aggregate) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply, response) = oneshot::channel();
        let op = Op::Call(Box::new(move |aggregate| {
            let _ = reply.send(turn(aggregate));
        }));
        self.ops
            .send(op)
            .await
            .map_err(|_| RuntimeError::Terminated(self.id.to_string()))?;
        response
            .await
            .map_err(|_| RuntimeError::Terminated(self.id.to_string()))
    }

    /// Ask the actor to shut down after the operations already queued
    pub async fn stop(&self) {
        let _ = self.ops.send(Op::Stop).await;
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Op) -> RuntimeResult<T> {
        let (reply, response) = oneshot::channel();
        self.ops
            .send(make(reply))
            .await
            .map_err(|_| RuntimeError::Terminated(self.id.to_string()))?;
        response
            .await
            .map_err(|_| RuntimeError::Terminated(self.id.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::aggregate::{AggregateConfig, EventDraft};
    use crate::clock::HlcClock;
    use crate::registry::{CommandHandler, EventHandler, HandlerError, HandlerRegistry};
    use crate::store::{EventRecord, InMemoryEventStore};

    #[derive(Debug)]
    struct Tick;

    impl CommandHandler for Tick {
        fn eval(
            &self,
            _aggregate: &Aggregate,
            _command: &Command,
        ) -> Result<Vec<EventDraft>, HandlerError> {
            Ok(vec![EventDraft::new("clockwork.ticked", serde_json::json!({}))])
        }
    }

    #[derive(Debug)]
    struct Ticked;

    impl EventHandler for Ticked {
        fn apply(&self, state: Value, _event: &EventRecord) -> Result<Value, HandlerError> {
            let ticks = state["ticks"].as_u64().unwrap_or(0);
            Ok(serde_json::json!({ "ticks": ticks + 1 }))
        }
    }

    fn runtime() -> AggregateRuntime {
        let registry = HandlerRegistry::new();
        registry.register_command("clockwork.tick", Arc::new(Tick));
        registry.register_event("clockwork.ticked", Arc::new(Ticked));
        AggregateRuntime::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(registry),
            Arc::new(HlcClock::new(0)),
            AggregateConfig::new().with_initial_state(|| serde_json::json!({ "ticks": 0 })),
        )
    }

    #[tokio::test]
    async fn test_operations_run_in_submission_order() {
        let id = Timestamp::new(1, 0, 0);
        let handle = spawn(id, runtime(), 16);

        for _ in 0..3 {
            let command = Command::new(id, "clockwork.tick", serde_json::json!({}));
            handle.evaluate(command).await.unwrap();
        }

        let state = handle.get().await.unwrap();
        assert_eq!(state["ticks"].as_u64(), Some(3));
    }

    #[tokio::test]
    async fn test_get_does_not_touch_the_store() {
        let id = Timestamp::new(1, 0, 0);
        let handle = spawn(id, runtime(), 16);
        let state = handle.get().await.unwrap();
        assert_eq!(state["ticks"].as_u64(), Some(0));
    }

    #[tokio::test]
    async fn test_call_runs_in_the_serialized_turn() {
        let id = Timestamp::new(1, 0, 0);
        let handle = spawn(id, runtime(), 16);

        let sequence = handle.call(|aggregate| aggregate.sequence()).await.unwrap();
        assert_eq!(sequence, 0);

        handle
            .call(|aggregate| aggregate.set_state(serde_json::json!({ "ticks": 99 })))
            .await
            .unwrap();
        let state = handle.get().await.unwrap();
        assert_eq!(state["ticks"].as_u64(), Some(99));
    }

    #[tokio::test]
    async fn test_stopped_actor_reports_terminated() {
        let id = Timestamp::new(1, 0, 0);
        let handle = spawn(id, runtime(), 16);

        handle.stop().await;
        // The mailbox drains in order, so this get is observed after Stop.
        let err = handle.get().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Terminated(_)));
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_handler_failure_keeps_the_actor_alive() {
        let id = Timestamp::new(1, 0, 0);
        let handle = spawn(id, runtime(), 16);

        let command = Command::new(id, "clockwork.unknown", serde_json::json!({}));
        let err = handle.evaluate(command).await.unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidHandler(_)));

        assert!(handle.is_alive());
        let command = Command::new(id, "clockwork.tick", serde_json::json!({}));
        handle.evaluate(command).await.unwrap();
        let state = handle.get().await.unwrap();
        assert_eq!(state["ticks"].as_u64(), Some(1));
    }
}
