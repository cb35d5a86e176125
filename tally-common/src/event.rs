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
    fmt::Display,
    sync::{Arc, Weak},
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Kind of the durable backend behind a vote storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageKind {
    /// Relational table with one row per `(key, actor)`.
    Sql,
    /// Key-value store with one value per key.
    KeyValue,
}

impl Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageKind::Sql => write!(f, "sql"),
            StorageKind::KeyValue => write!(f, "kv"),
        }
    }
}

/// Identity of a durable backend, used to route change notifications.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreId {
    kind: StorageKind,
    name: String,
}

impl StoreId {
    /// Create a store id.
    pub fn new(kind: StorageKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    /// Backend kind.
    pub fn kind(&self) -> StorageKind {
        self.kind
    }

    /// Backend name, e.g. the table name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}

/// Event identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// The persisted data of the store was changed by someone other than its counter.
    Changed(StoreId),
}

/// Trait for the customized store event listener.
pub trait StoreEventListener: Send + Sync + 'static {
    /// Called for every event published on the bus the listener is subscribed to.
    fn on_event(&self, event: &StoreEvent);
}

/// A synchronous fan-out bus for [`StoreEvent`]s.
///
/// Listeners are held weakly, so subscribing never extends the lifetime of a counter.
#[derive(Default, Clone)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Weak<dyn StoreEventListener>>>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

impl EventBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a listener.
    pub fn subscribe(&self, listener: Weak<dyn StoreEventListener>) {
        self.listeners.write().push(listener);
    }

    /// Deliver the event to every live listener, dropping the dead ones.
    pub fn publish(&self, event: StoreEvent) {
        let live = {
            let mut listeners = self.listeners.write();
            let before = listeners.len();
            listeners.retain(|l| l.strong_count() > 0);
            if listeners.len() < before {
                tracing::debug!("[event bus]: dropped {} dead listeners", before - listeners.len());
            }
            listeners.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
        };
        // Listeners run outside of the lock section.
        for listener in live {
            listener.on_event(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: AtomicUsize,
    }

    impl StoreEventListener for Recorder {
        fn on_event(&self, _: &StoreEvent) {
            self.seen.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test_log::test]
    fn test_publish_to_live_listeners() {
        let bus = EventBus::new();
        let a = Arc::new(Recorder::default());
        let b = Arc::new(Recorder::default());
        bus.subscribe(Arc::downgrade(&a) as Weak<dyn StoreEventListener>);
        bus.subscribe(Arc::downgrade(&b) as Weak<dyn StoreEventListener>);

        let id = StoreId::new(StorageKind::Sql, "votes");
        bus.publish(StoreEvent::Changed(id.clone()));
        assert_eq!(a.seen.load(Ordering::Relaxed), 1);
        assert_eq!(b.seen.load(Ordering::Relaxed), 1);

        drop(b);
        bus.publish(StoreEvent::Changed(id));
        assert_eq!(a.seen.load(Ordering::Relaxed), 2);
        assert_eq!(bus.listeners.read().len(), 1);
    }

    #[test]
    fn test_store_id_display() {
        assert_eq!(StoreId::new(StorageKind::Sql, "user_rate").to_string(), "sql:user_rate");
        assert_eq!(StoreId::new(StorageKind::KeyValue, "votes").to_string(), "kv:votes");
    }
}
