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
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
    time::Instant,
};

use itertools::Itertools;
use parking_lot::{RwLock, RwLockUpgradableReadGuard, RwLockWriteGuard};
use tally_common::{
    assert_actor, assert_key,
    error::Result,
    event::{StoreEvent, StoreEventListener, StoreId},
    metrics::Metrics,
};
use tally_storage::{
    ballot::{Actor, BallotMap, Key, Vote},
    storage::Baseline,
};

use crate::{
    cell::LockedCell,
    counter::{StoreLink, VotingCounter},
};

/// Voting counter guarding all keys with one reader-writer lock.
///
/// Every persisted key is loaded when the counter is opened. Votes take the write lock, reads take the read lock and
/// only upgrade it to load a key that is not resident. A flush writes the whole cache against freshly loaded
/// persisted state, so the in-memory state always wins.
#[derive(Debug)]
pub struct LockBasedCounter {
    link: StoreLink,
    cache: RwLock<HashMap<Key, LockedCell>>,
    metrics: Arc<Metrics>,
}

impl LockBasedCounter {
    pub(crate) fn open(link: StoreLink, metrics: Arc<Metrics>) -> Result<Self> {
        let mut cache = HashMap::new();
        link.storage.load_all(&mut |key, set| {
            cache.insert(key, LockedCell::new(set));
        })?;
        metrics.counter_resident_keys.absolute(cache.len() as _);
        tracing::debug!(
            "[lock-based counter]: {} loaded {} keys from {}",
            link.name,
            cache.len(),
            link.storage.store_id()
        );

        Ok(Self {
            link,
            cache: RwLock::new(cache),
            metrics,
        })
    }

    fn update(&self, key: Key, actor: Actor, up: bool) -> Result<i64> {
        assert_key!(key);
        assert_actor!(actor);

        let mut cache = self.cache.write();
        let cell = match cache.entry(key) {
            Entry::Occupied(o) => {
                self.metrics.counter_hit.increase(1);
                o.into_mut()
            }
            Entry::Vacant(v) => {
                self.metrics.counter_miss.increase(1);
                let set = self.link.storage.load(key)?;
                self.metrics.counter_resident_keys.increase(1);
                v.insert(LockedCell::new(set))
            }
        };

        let count = if up {
            self.metrics.counter_increment.increase(1);
            cell.increment(actor)
        } else {
            self.metrics.counter_decrement.increase(1);
            cell.decrement(actor)
        };
        Ok(count)
    }

    /// Run `f` over the cache once every key of `keys` is resident.
    fn read<R>(&self, keys: &[Key], f: impl FnOnce(&HashMap<Key, LockedCell>) -> R) -> Result<R> {
        keys.iter().for_each(|key| assert_key!(*key));

        {
            let cache = self.cache.read();
            if keys.iter().all(|key| cache.contains_key(key)) {
                self.metrics.counter_hit.increase(keys.len() as _);
                return Ok(f(&*cache));
            }
        }

        let cache = self.cache.upgradable_read();
        let missing = keys
            .iter()
            .copied()
            .filter(|key| !cache.contains_key(key))
            .sorted_unstable()
            .dedup()
            .collect_vec();
        self.metrics.counter_hit.increase((keys.len() - missing.len()) as _);
        if missing.is_empty() {
            return Ok(f(&*cache));
        }

        self.metrics.counter_miss.increase(missing.len() as _);
        let mut loaded = self.link.storage.load_batch_map(&missing)?;

        let mut cache = RwLockUpgradableReadGuard::upgrade(cache);
        for key in missing {
            cache.insert(key, LockedCell::new(loaded.remove(&key).unwrap_or_default()));
        }
        self.metrics.counter_resident_keys.absolute(cache.len() as _);

        Ok(f(&*RwLockWriteGuard::downgrade(cache)))
    }

    /// Up vote of `actor` for `key`. Returns the total of `key` after the vote.
    pub fn increment(&self, key: Key, actor: Actor) -> Result<i64> {
        self.update(key, actor, true)
    }

    /// Down vote of `actor` for `key`. Returns the total of `key` after the vote.
    pub fn decrement(&self, key: Key, actor: Actor) -> Result<i64> {
        self.update(key, actor, false)
    }

    /// The vote of `actor` for `key`.
    pub fn get_vote(&self, key: Key, actor: Actor) -> Result<Vote> {
        assert_actor!(actor);
        self.read(&[key], |cache| cache[&key].vote_of(actor))
    }

    /// The votes of `actor` for each of `keys`.
    pub fn get_votes(&self, keys: &[Key], actor: Actor) -> Result<HashMap<Key, Vote>> {
        assert_actor!(actor);
        self.read(keys, |cache| {
            keys.iter().map(|key| (*key, cache[key].vote_of(actor))).collect()
        })
    }

    /// The total of `key`.
    pub fn estimate_count(&self, key: Key) -> Result<i64> {
        self.read(&[key], |cache| cache[&key].aggregate())
    }

    /// The totals of `keys`.
    pub fn estimate_counts(&self, keys: &[Key]) -> Result<HashMap<Key, i64>> {
        self.read(keys, |cache| {
            keys.iter().map(|key| (*key, cache[key].aggregate())).collect()
        })
    }

    /// The totals of every resident key.
    pub fn estimate_all_counts(&self) -> HashMap<Key, i64> {
        self.cache
            .read()
            .iter()
            .map(|(key, cell)| (*key, cell.aggregate()))
            .collect()
    }

    /// Persist the whole cache against the freshly loaded persisted state.
    ///
    /// Votes wait for the flush to finish. After an external change, persisted keys that are not resident are
    /// loaded once the cache is written.
    pub fn flush(&self) -> Result<()> {
        let now = Instant::now();

        let cache = self.cache.upgradable_read();
        let curr = cache
            .iter()
            .map(|(key, cell)| (*key, cell.ballots().clone()))
            .collect::<BallotMap>();

        let report = self.link.storage.store_batch(&curr, Baseline::Fresh)?;
        if report.fallback {
            self.link.mark_dirty();
        }

        if self.link.take_dirty() {
            let mut cache = RwLockUpgradableReadGuard::upgrade(cache);
            let mut loaded = 0;
            if let Err(e) = self.link.storage.load_all(&mut |key, set| {
                if let Entry::Vacant(v) = cache.entry(key) {
                    v.insert(LockedCell::new(set));
                    loaded += 1;
                }
            }) {
                self.link.mark_dirty();
                return Err(e);
            }
            self.metrics.counter_resident_keys.absolute(cache.len() as _);
            tracing::info!(
                "[lock-based counter]: {} reloaded {loaded} keys changed outside of the counter",
                self.link.name
            );
        }

        self.metrics.counter_flush.increase(1);
        self.metrics.counter_flush_duration.record(now.elapsed().as_secs_f64());
        tracing::debug!(
            "[lock-based counter]: {} flushed {} keys to {}: {report:?}",
            self.link.name,
            curr.len(),
            self.link.storage.store_id()
        );
        Ok(())
    }

    /// Drop every resident key without touching the storage.
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        self.metrics.counter_clear.increase(1);
        self.metrics.counter_resident_keys.absolute(0);
    }

    /// Identity of the storage behind the counter.
    pub fn store_id(&self) -> &StoreId {
        self.link.storage.store_id()
    }
}

impl StoreEventListener for LockBasedCounter {
    fn on_event(&self, event: &StoreEvent) {
        self.link.on_event(event);
    }
}

impl VotingCounter for LockBasedCounter {
    fn increment(&self, key: Key, actor: Actor) -> Result<i64> {
        self.increment(key, actor)
    }

    fn decrement(&self, key: Key, actor: Actor) -> Result<i64> {
        self.decrement(key, actor)
    }

    fn get_vote(&self, key: Key, actor: Actor) -> Result<Vote> {
        self.get_vote(key, actor)
    }

    fn get_votes(&self, keys: &[Key], actor: Actor) -> Result<HashMap<Key, Vote>> {
        self.get_votes(keys, actor)
    }

    fn estimate_count(&self, key: Key) -> Result<i64> {
        self.estimate_count(key)
    }

    fn estimate_counts(&self, keys: &[Key]) -> Result<HashMap<Key, i64>> {
        self.estimate_counts(keys)
    }

    fn estimate_all_counts(&self) -> HashMap<Key, i64> {
        self.estimate_all_counts()
    }

    fn flush(&self) -> Result<()> {
        self.flush()
    }

    fn clear_cache(&self) {
        self.clear_cache()
    }

    fn store_id(&self) -> &StoreId {
        self.store_id()
    }
}
