#![deny(unsafe_code)]

//! Highlight matching core.
//!
//! Decides which guild members should be notified about a chat message
//! because it contains a word or phrase they subscribed to, or matches a
//! regular expression they registered. Matching runs in two isolated worker
//! units, one per [`TriggerKind`], coordinated by the [`HighlightManager`].

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, used where a trait must stay
/// object-safe (see [`store::SubscriptionStore`]).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Scan logic: matching, deduplication, and emphasis markup.
pub mod engine;
/// Per-guild trigger → subscribers index.
pub mod index;
/// Coordinator for the worker units.
pub mod manager;
/// Memoized regular-expression compilation.
pub mod pattern;
/// Subscription store contract and in-memory store.
pub mod store;
/// Trigger kinds and trigger text markers.
pub mod trigger;
/// Isolated execution units hosting one match engine each.
pub mod worker;

pub use engine::{HighlightResult, InvalidTrigger, MatchEngine, ParseOutcome};
pub use index::GuildIndex;
pub use manager::{HighlightManager, ManagerError, ManagerStatus, MessageHighlights, WorkerStatus};
pub use pattern::PatternCache;
pub use store::{MemoryStore, StoreError, Subscription, SubscriptionStore};
pub use trigger::TriggerKind;
pub use worker::WorkerState;
