//! eventfold — execution core of an event-sourced domain runtime.
//!
//! Each aggregate is a single-owner actor that serializes its operations:
//! commands are evaluated against the current state to produce events, the
//! events are appended atomically under optimistic concurrency (retrying on
//! sequence conflicts), then folded back into the in-memory state. Hydration
//! replays the best snapshot plus trailing events; hybrid-logical-clock
//! timestamps serve as aggregate ids and event timestamps. Applications
//! supply command/event handlers through a [`HandlerRegistry`] and reach
//! their aggregates through a [`Directory`].

pub mod actor;
pub mod aggregate;
pub mod clock;
pub mod config;
pub mod directory;
pub mod registry;
pub mod store;

mod error;

pub use actor::ActorHandle;
pub use aggregate::{Aggregate, AggregateConfig, AggregateRuntime, Command, EventDraft};
pub use clock::{HlcClock, Timestamp};
pub use config::{Config, ConfigError};
pub use directory::Directory;
pub use error::{RuntimeError, RuntimeResult};
pub use registry::{
    tag_from_path, CommandHandler, EventHandler, HandlerError, HandlerRegistry, Projection,
};
pub use store::{
    EventRecord, EventStore, InMemoryEventStore, PostgresEventStore, SnapshotRecord, StoreError,
};
