// Copyright 2026 tally Project Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use serde::{Deserialize, Serialize};
use tally_common::{
    error::{Error, ErrorKind, Result},
    event::{EventBus, StoreEvent, StoreEventListener, StoreId},
    metrics::{registry::noop::NoopMetricsRegistry, BoxedRegistry, Metrics},
};
use tally_storage::{
    ballot::{Actor, Key, Vote},
    storage::VoteStorage,
};

use crate::{
    lock_based::LockBasedCounter,
    non_blocking::{NonBlockingCounter, NonBlockingCounterConfig},
    striped::DEFAULT_STRIPES,
};

/// A thread-safe persistent `(key, actor) -> vote` map that keeps a running total per key.
///
/// Each actor votes at most once per key, up or down. Repeating a vote changes nothing. Voting the opposite way
/// withdraws the previous vote.
pub trait VotingCounter: Send + Sync + Debug + 'static {
    /// Up vote of `actor` for `key`. Returns the total of `key` after the vote.
    fn increment(&self, key: Key, actor: Actor) -> Result<i64>;

    /// Down vote of `actor` for `key`. Returns the total of `key` after the vote.
    fn decrement(&self, key: Key, actor: Actor) -> Result<i64>;

    /// The vote of `actor` for `key`.
    fn get_vote(&self, key: Key, actor: Actor) -> Result<Vote>;

    /// The votes of `actor` for each of `keys`.
    fn get_votes(&self, keys: &[Key], actor: Actor) -> Result<HashMap<Key, Vote>>;

    /// The total of `key`.
    fn estimate_count(&self, key: Key) -> Result<i64>;

    /// The totals of `keys`.
    fn estimate_counts(&self, keys: &[Key]) -> Result<HashMap<Key, i64>>;

    /// The totals of every key resident in memory.
    fn estimate_all_counts(&self) -> HashMap<Key, i64>;

    /// Persist the votes cast since the last flush.
    fn flush(&self) -> Result<()>;

    /// Drop every resident key without touching the storage.
    ///
    /// Votes not flushed yet are lost.
    fn clear_cache(&self);

    /// Flush before shutdown.
    fn close(&self) -> Result<()> {
        self.flush()
    }

    /// Identity of the storage behind the counter.
    fn store_id(&self) -> &StoreId;
}

/// Concurrency strategy of a [`Counter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// One reader-writer lock over all keys. Every vote is totally ordered.
    LockBased,
    /// Lock-free key map with a mutex per key. Votes of different keys never contend.
    #[default]
    NonBlocking,
}

/// Storage link shared by both strategies: the storage and its dirty flag.
#[derive(Debug)]
pub(crate) struct StoreLink {
    pub(crate) name: String,
    pub(crate) storage: Arc<dyn VoteStorage>,
    dirty: AtomicBool,
}

impl StoreLink {
    pub(crate) fn new(name: String, storage: Arc<dyn VoteStorage>) -> Self {
        Self {
            name,
            storage,
            dirty: AtomicBool::new(false),
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    pub(crate) fn on_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Changed(id) if id == self.storage.store_id() => {
                tracing::info!(
                    "[counter {}]: external change detected for {id}, marking the store dirty",
                    self.name
                );
                self.mark_dirty();
            }
            StoreEvent::Changed(_) => {}
        }
    }
}

/// Builder of a [`Counter`].
pub struct CounterBuilder {
    storage: Arc<dyn VoteStorage>,
    name: String,
    strategy: Strategy,
    stripes: usize,
    prefill: bool,
    registry: BoxedRegistry,
    event_bus: Option<EventBus>,
}

impl Debug for CounterBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CounterBuilder")
            .field("storage", self.storage.store_id())
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("stripes", &self.stripes)
            .field("prefill", &self.prefill)
            .finish()
    }
}

impl CounterBuilder {
    /// Create a counter builder over `storage`.
    pub fn new(storage: Arc<dyn VoteStorage>) -> Self {
        Self {
            storage,
            name: "tally".to_string(),
            strategy: Strategy::default(),
            stripes: DEFAULT_STRIPES,
            prefill: false,
            registry: Box::new(NoopMetricsRegistry),
            event_bus: None,
        }
    }

    /// Set the name of the counter, used in logs and as the metrics label.
    ///
    /// Default: `tally`.
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    /// Set the concurrency strategy.
    ///
    /// Default: [`Strategy::NonBlocking`].
    pub fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the stripes of each per-key aggregate of the non-blocking counter.
    ///
    /// Default: [`DEFAULT_STRIPES`].
    pub fn with_stripes(mut self, stripes: usize) -> Self {
        self.stripes = stripes;
        self
    }

    /// Load every persisted key while building a non-blocking counter.
    ///
    /// The lock-based counter always loads every key. Default: `false`.
    pub fn with_prefill(mut self, prefill: bool) -> Self {
        self.prefill = prefill;
        self
    }

    /// Set metrics registry.
    ///
    /// Default: [`NoopMetricsRegistry`].
    pub fn with_metrics_registry(mut self, registry: BoxedRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Subscribe the counter to change notifications of its storage.
    ///
    /// Default: not subscribed.
    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Build the counter. Loads from the storage according to the strategy.
    pub fn build(self) -> Result<Counter> {
        if self.stripes == 0 {
            return Err(Error::new(ErrorKind::Config, "stripes must be positive").with_context("counter", &self.name));
        }

        let metrics = Arc::new(Metrics::new(self.name.clone(), self.registry.as_ref()));
        let link = StoreLink::new(self.name, self.storage);

        let counter = match self.strategy {
            Strategy::LockBased => Counter::LockBased(Arc::new(LockBasedCounter::open(link, metrics)?)),
            Strategy::NonBlocking => Counter::NonBlocking(Arc::new(NonBlockingCounter::open(
                link,
                metrics,
                NonBlockingCounterConfig {
                    stripes: self.stripes,
                    prefill: self.prefill,
                },
            )?)),
        };

        if let Some(bus) = self.event_bus {
            bus.subscribe(counter.listener());
        }

        Ok(counter)
    }
}

/// A voting counter of either strategy.
#[derive(Clone)]
pub enum Counter {
    /// Lock-based counter.
    LockBased(Arc<LockBasedCounter>),
    /// Non-blocking counter.
    NonBlocking(Arc<NonBlockingCounter>),
}

impl Debug for Counter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LockBased(_) => f.debug_tuple("Counter::LockBased").finish(),
            Self::NonBlocking(_) => f.debug_tuple("Counter::NonBlocking").finish(),
        }
    }
}

impl Counter {
    /// Strategy of the counter.
    pub fn strategy(&self) -> Strategy {
        match self {
            Counter::LockBased(_) => Strategy::LockBased,
            Counter::NonBlocking(_) => Strategy::NonBlocking,
        }
    }

    fn listener(&self) -> Weak<dyn StoreEventListener> {
        match self {
            Counter::LockBased(counter) => Arc::downgrade(counter) as Weak<dyn StoreEventListener>,
            Counter::NonBlocking(counter) => Arc::downgrade(counter) as Weak<dyn StoreEventListener>,
        }
    }
}

impl VotingCounter for Counter {
    fn increment(&self, key: Key, actor: Actor) -> Result<i64> {
        match self {
            Counter::LockBased(counter) => counter.increment(key, actor),
            Counter::NonBlocking(counter) => counter.increment(key, actor),
        }
    }

    fn decrement(&self, key: Key, actor: Actor) -> Result<i64> {
        match self {
            Counter::LockBased(counter) => counter.decrement(key, actor),
            Counter::NonBlocking(counter) => counter.decrement(key, actor),
        }
    }

    fn get_vote(&self, key: Key, actor: Actor) -> Result<Vote> {
        match self {
            Counter::LockBased(counter) => counter.get_vote(key, actor),
            Counter::NonBlocking(counter) => counter.get_vote(key, actor),
        }
    }

    fn get_votes(&self, keys: &[Key], actor: Actor) -> Result<HashMap<Key, Vote>> {
        match self {
            Counter::LockBased(counter) => counter.get_votes(keys, actor),
            Counter::NonBlocking(counter) => counter.get_votes(keys, actor),
        }
    }

    fn estimate_count(&self, key: Key) -> Result<i64> {
        match self {
            Counter::LockBased(counter) => counter.estimate_count(key),
            Counter::NonBlocking(counter) => counter.estimate_count(key),
        }
    }

    fn estimate_counts(&self, keys: &[Key]) -> Result<HashMap<Key, i64>> {
        match self {
            Counter::LockBased(counter) => counter.estimate_counts(keys),
            Counter::NonBlocking(counter) => counter.estimate_counts(keys),
        }
    }

    fn estimate_all_counts(&self) -> HashMap<Key, i64> {
        match self {
            Counter::LockBased(counter) => counter.estimate_all_counts(),
            Counter::NonBlocking(counter) => counter.estimate_all_counts(),
        }
    }

    fn flush(&self) -> Result<()> {
        match self {
            Counter::LockBased(counter) => counter.flush(),
            Counter::NonBlocking(counter) => counter.flush(),
        }
    }

    fn clear_cache(&self) {
        match self {
            Counter::LockBased(counter) => counter.clear_cache(),
            Counter::NonBlocking(counter) => counter.clear_cache(),
        }
    }

    fn store_id(&self) -> &StoreId {
        match self {
            Counter::LockBased(counter) => counter.store_id(),
            Counter::NonBlocking(counter) => counter.store_id(),
        }
    }
}
