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

use std::{collections::HashMap, sync::Arc, time::Instant};

use dashmap::DashMap;
use itertools::Itertools;
use tally_common::{
    assert_actor, assert_key,
    error::Result,
    event::{StoreEvent, StoreEventListener, StoreId},
    metrics::Metrics,
};
use tally_storage::{
    ballot::{Actor, BallotMap, BallotSet, Key, Vote},
    storage::Baseline,
};

use crate::{
    cell::SharedCell,
    counter::{StoreLink, VotingCounter},
};

#[derive(Debug, Clone, Copy)]
pub(crate) struct NonBlockingCounterConfig {
    pub(crate) stripes: usize,
    pub(crate) prefill: bool,
}

/// Voting counter with one independently locked cell per key.
///
/// Keys are loaded on first access, or all at once when prefill is enabled. Votes of different keys never contend
/// and totals are read without locking. Each cell remembers the set believed to be persisted, so a flush only writes
/// what changed since.
#[derive(Debug)]
pub struct NonBlockingCounter {
    link: StoreLink,
    cells: DashMap<Key, Arc<SharedCell>>,
    stripes: usize,
    metrics: Arc<Metrics>,
}

impl NonBlockingCounter {
    pub(crate) fn open(link: StoreLink, metrics: Arc<Metrics>, config: NonBlockingCounterConfig) -> Result<Self> {
        let cells = DashMap::new();
        if config.prefill {
            link.storage.load_all(&mut |key, set| {
                cells.insert(key, Arc::new(SharedCell::new(set, config.stripes)));
            })?;
            tracing::debug!(
                "[non-blocking counter]: {} prefilled {} keys from {}",
                link.name,
                cells.len(),
                link.storage.store_id()
            );
        }
        metrics.counter_resident_keys.absolute(cells.len() as _);

        Ok(Self {
            link,
            cells,
            stripes: config.stripes,
            metrics,
        })
    }

    fn cell(&self, key: Key) -> Result<Arc<SharedCell>> {
        assert_key!(key);

        if let Some(cell) = self.cells.get(&key) {
            self.metrics.counter_hit.increase(1);
            return Ok(cell.clone());
        }

        self.metrics.counter_miss.increase(1);
        let set = self.link.storage.load(key)?;
        Ok(self.insert(key, set))
    }

    fn cells_of(&self, keys: &[Key]) -> Result<Vec<(Key, Arc<SharedCell>)>> {
        let mut cells = Vec::with_capacity(keys.len());
        let mut missing = vec![];
        for &key in keys {
            assert_key!(key);
            match self.cells.get(&key) {
                Some(cell) => cells.push((key, cell.clone())),
                None => missing.push(key),
            }
        }
        self.metrics.counter_hit.increase(cells.len() as _);

        if !missing.is_empty() {
            missing.sort_unstable();
            missing.dedup();
            self.metrics.counter_miss.increase(missing.len() as _);

            let mut loaded = self.link.storage.load_batch_map(&missing)?;
            for key in missing {
                let set = loaded.remove(&key).unwrap_or_default();
                cells.push((key, self.insert(key, set)));
            }
        }

        Ok(cells)
    }

    /// Insert a freshly loaded cell unless another thread won the race.
    fn insert(&self, key: Key, set: BallotSet) -> Arc<SharedCell> {
        let cell = self
            .cells
            .entry(key)
            .or_insert_with(|| Arc::new(SharedCell::new(set, self.stripes)))
            .clone();
        self.metrics.counter_resident_keys.absolute(self.cells.len() as _);
        cell
    }

    /// Up vote of `actor` for `key`. Returns the total of `key` after the vote.
    pub fn increment(&self, key: Key, actor: Actor) -> Result<i64> {
        assert_actor!(actor);
        let cell = self.cell(key)?;
        self.metrics.counter_increment.increase(1);
        Ok(cell.increment(actor))
    }

    /// Down vote of `actor` for `key`. Returns the total of `key` after the vote.
    pub fn decrement(&self, key: Key, actor: Actor) -> Result<i64> {
        assert_actor!(actor);
        let cell = self.cell(key)?;
        self.metrics.counter_decrement.increase(1);
        Ok(cell.decrement(actor))
    }

    /// The vote of `actor` for `key`.
    pub fn get_vote(&self, key: Key, actor: Actor) -> Result<Vote> {
        assert_actor!(actor);
        Ok(self.cell(key)?.vote_of(actor))
    }

    /// The votes of `actor` for each of `keys`.
    ///
    /// Not read-consistent across keys under concurrent votes.
    pub fn get_votes(&self, keys: &[Key], actor: Actor) -> Result<HashMap<Key, Vote>> {
        assert_actor!(actor);
        Ok(self
            .cells_of(keys)?
            .into_iter()
            .map(|(key, cell)| (key, cell.vote_of(actor)))
            .collect())
    }

    /// The total of `key`.
    pub fn estimate_count(&self, key: Key) -> Result<i64> {
        Ok(self.cell(key)?.estimate())
    }

    /// The totals of `keys`.
    ///
    /// Not read-consistent across keys under concurrent votes.
    pub fn estimate_counts(&self, keys: &[Key]) -> Result<HashMap<Key, i64>> {
        Ok(self
            .cells_of(keys)?
            .into_iter()
            .map(|(key, cell)| (key, cell.estimate()))
            .collect())
    }

    /// The totals of every resident key.
    pub fn estimate_all_counts(&self) -> HashMap<Key, i64> {
        self.cells
            .iter()
            .map(|entry| (*entry.key(), entry.value().estimate()))
            .collect()
    }

    /// Persist the votes cast since the last flush.
    ///
    /// 1. Copy the live set and read the snapshot of every resident cell.
    /// 2. Store the copies against the snapshots, or against the persisted state if the store is dirty.
    /// 3. Swap every snapshot to the stored copy, unless a concurrent flush already replaced it.
    ///
    /// Votes cast after a cell is copied are persisted by the next flush. A lost swap means the writes of two flushes
    /// may have landed out of order, so the store is marked dirty and the next flush diffs against persisted state.
    pub fn flush(&self) -> Result<()> {
        let now = Instant::now();

        let cells = self
            .cells
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect_vec();

        let mut curr = BallotMap::with_capacity(cells.len());
        let mut prev = BallotMap::with_capacity(cells.len());
        let mut expected = Vec::with_capacity(cells.len());
        for (key, cell) in cells.iter() {
            curr.insert(*key, cell.copy_ballots());
            let snapshot = cell.snapshot();
            prev.insert(*key, snapshot.as_ref().clone());
            expected.push(snapshot);
        }

        let baseline = if self.link.take_dirty() {
            Baseline::Fresh
        } else {
            Baseline::Snapshot(&prev)
        };
        let report = match self.link.storage.store_batch(&curr, baseline) {
            Ok(report) => report,
            Err(e) => {
                // The backend may hold any prefix of the batch.
                self.link.mark_dirty();
                return Err(e);
            }
        };
        if report.fallback {
            self.link.mark_dirty();
        }

        let mut dropped = 0;
        for ((key, cell), expected) in cells.into_iter().zip_eq(expected) {
            let stored = curr.remove(&key).unwrap_or_default();
            if !cell.update_snapshot(&expected, Arc::new(stored)) {
                tracing::debug!(
                    "[non-blocking counter]: {} snapshot of key {key} was replaced by a concurrent flush",
                    self.link.name
                );
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.link.mark_dirty();
        }
        self.metrics.counter_cas_drop.increase(dropped);

        self.metrics.counter_flush.increase(1);
        self.metrics.counter_flush_duration.record(now.elapsed().as_secs_f64());
        tracing::debug!(
            "[non-blocking counter]: {} flushed {} keys to {}: {report:?}",
            self.link.name,
            prev.len(),
            self.link.storage.store_id()
        );
        Ok(())
    }

    /// Drop every resident key without touching the storage.
    pub fn clear_cache(&self) {
        self.cells.clear();
        self.metrics.counter_clear.increase(1);
        self.metrics.counter_resident_keys.absolute(0);
    }

    /// Identity of the storage behind the counter.
    pub fn store_id(&self) -> &StoreId {
        self.link.storage.store_id()
    }
}

impl StoreEventListener for NonBlockingCounter {
    fn on_event(&self, event: &StoreEvent) {
        self.link.on_event(event);
    }
}

impl VotingCounter for NonBlockingCounter {
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

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Barrier,
        },
        thread,
    };

    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use tally_storage::{
        ballot::total,
        consistency::ConsistencyCheck,
        diff::VoteRow,
        memory::MemoryVoteTable,
        storage::{StoreReport, VoteStorage},
        table::{TableBackend, VoteTable},
        TableStorage,
    };

    use super::*;

    type Storage = TableStorage<Arc<MemoryVoteTable>>;

    fn setup(consistency: ConsistencyCheck) -> (Arc<MemoryVoteTable>, Arc<Storage>) {
        let table = Arc::new(MemoryVoteTable::new("votes"));
        let storage = Arc::new(
            TableBackend::new(table.clone())
                .into_storage()
                .with_consistency_check(consistency),
        );
        (table, storage)
    }

    fn open(storage: &Arc<Storage>, prefill: bool) -> NonBlockingCounter {
        NonBlockingCounter::open(
            StoreLink::new("test".to_string(), storage.clone()),
            Arc::new(Metrics::noop()),
            NonBlockingCounterConfig { stripes: 4, prefill },
        )
        .unwrap()
    }

    fn row(key: Key, entry: i32) -> VoteRow {
        VoteRow::from_entry(key, entry)
    }

    /// Holds the first `store_batch` until the test releases it.
    #[derive(Debug)]
    struct HeldStorage {
        inner: Arc<Storage>,
        armed: AtomicBool,
        entered: Barrier,
        release: Barrier,
    }

    impl HeldStorage {
        fn new(inner: Arc<Storage>) -> Self {
            Self {
                inner,
                armed: AtomicBool::new(true),
                entered: Barrier::new(2),
                release: Barrier::new(2),
            }
        }
    }

    impl VoteStorage for HeldStorage {
        fn store_id(&self) -> &StoreId {
            self.inner.store_id()
        }

        fn load(&self, key: Key) -> Result<BallotSet> {
            self.inner.load(key)
        }

        fn load_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
            self.inner.load_batch(keys, consumer)
        }

        fn load_all(&self, consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
            self.inner.load_all(consumer)
        }

        fn store_batch(&self, curr: &BallotMap, baseline: Baseline<'_>) -> Result<StoreReport> {
            if self.armed.swap(false, Ordering::AcqRel) {
                self.entered.wait();
                self.release.wait();
            }
            self.inner.store_batch(curr, baseline)
        }
    }

    #[test]
    fn test_lazy_and_prefilled_open() {
        let (table, storage) = setup(ConsistencyCheck::Strict);
        table.insert_batch(&[row(1, 1), row(2, -2)]).unwrap();

        let lazy = open(&storage, false);
        assert!(lazy.estimate_all_counts().is_empty());
        assert_eq!(lazy.estimate_count(2).unwrap(), -1);
        assert_eq!(lazy.estimate_all_counts(), HashMap::from([(2, -1)]));

        let prefilled = open(&storage, true);
        assert_eq!(prefilled.estimate_all_counts(), HashMap::from([(1, 1), (2, -1)]));
    }

    #[test_log::test]
    fn test_flush_writes_only_the_diff() {
        let (table, storage) = setup(ConsistencyCheck::Strict);
        table.insert_batch(&[row(1, 1), row(1, 2)]).unwrap();

        let counter = open(&storage, false);
        counter.decrement(1, 1).unwrap();
        counter.decrement(1, 1).unwrap();
        counter.increment(1, 3).unwrap();
        counter.flush().unwrap();
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([-1, 2, 3]));

        // Snapshot now matches the table, a second flush is a no-op.
        let selects = table.selects();
        counter.flush().unwrap();
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([-1, 2, 3]));
        // One select for the consistency check of the second flush, one for the load above.
        assert_eq!(table.selects(), selects + 2);
    }

    #[test_log::test]
    fn test_dirty_store_flushes_fresh() {
        let (table, storage) = setup(ConsistencyCheck::Warn);
        let counter = open(&storage, false);
        counter.increment(1, 1).unwrap();
        counter.flush().unwrap();

        // Someone else wipes the table and tells the counter.
        table.delete_actors(1, &[1]).unwrap();
        counter.on_event(&StoreEvent::Changed(storage.store_id().clone()));

        counter.flush().unwrap();
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1]));
    }

    #[test_log::test]
    fn test_fallback_marks_dirty() {
        let (table, storage) = setup(ConsistencyCheck::Strict);
        let counter = open(&storage, false);
        counter.increment(1, 1).unwrap();
        counter.increment(1, 2).unwrap();
        counter.flush().unwrap();

        counter.increment(1, 3).unwrap();
        counter.decrement(1, 2).unwrap();
        counter.decrement(1, 2).unwrap();
        assert_eq!(counter.estimate_count(1).unwrap(), 1);

        table.fail_batches(1);
        counter.flush().unwrap();
        // The fallback wrote every vote but could not delete anything.
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1, -2, 3]));

        counter.decrement(1, 2).unwrap();
        counter.flush().unwrap();
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1, 3]));
    }

    #[test_log::test]
    fn test_failed_flush_is_retried() {
        let (table, storage) = setup(ConsistencyCheck::Warn);
        let counter = open(&storage, false);
        counter.increment(1, 1).unwrap();

        table.set_offline(true);
        assert!(counter.flush().is_err());
        table.set_offline(false);

        counter.flush().unwrap();
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1]));
    }

    #[test_log::test]
    fn test_concurrent_votes_and_flushes() {
        const THREADS: u64 = 8;
        const OPS: usize = 5000;

        let (_, storage) = setup(ConsistencyCheck::Warn);
        let counter = Arc::new(open(&storage, false));
        let barrier = Arc::new(Barrier::new(THREADS as usize));

        let handles = (0..THREADS)
            .map(|i| {
                let counter = counter.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut rng = SmallRng::seed_from_u64(i);
                    barrier.wait();
                    for n in 0..OPS {
                        let key = rng.random_range(1..=32);
                        let actor = rng.random_range(1..=10);
                        if rng.random_bool(0.5) {
                            counter.increment(key, actor).unwrap();
                        } else {
                            counter.decrement(key, actor).unwrap();
                        }
                        if n % 1000 == 0 {
                            counter.flush().unwrap();
                        }
                    }
                })
            })
            .collect_vec();
        for handle in handles {
            handle.join().unwrap();
        }

        counter.flush().unwrap();

        let persisted = storage.load_all_map().unwrap();
        for (key, count) in counter.estimate_all_counts() {
            let set = persisted.get(&key).cloned().unwrap_or_default();
            assert_eq!(count, set.aggregate(), "key: {key}");
            assert_eq!(set, counter.cells.get(&key).unwrap().copy_ballots());
        }
        assert_eq!(counter.estimate_all_counts().values().sum::<i64>(), total(&persisted));
    }

    #[test_log::test]
    fn test_overlapping_flushes_keep_newer_vote() {
        let (table, storage) = setup(ConsistencyCheck::Warn);
        table.insert_batch(&[row(1, 1)]).unwrap();
        let held = Arc::new(HeldStorage::new(storage.clone()));
        let counter = NonBlockingCounter::open(
            StoreLink::new("test".to_string(), held.clone()),
            Arc::new(Metrics::noop()),
            NonBlockingCounterConfig {
                stripes: 4,
                prefill: false,
            },
        )
        .unwrap();

        assert_eq!(counter.decrement(1, 1).unwrap(), 0);

        thread::scope(|s| {
            // The older flush copies `{}` and stalls before writing.
            let older = s.spawn(|| counter.flush());
            held.entered.wait();

            // The newer flush sees `{+1}` again, writes nothing and takes the snapshot.
            assert_eq!(counter.increment(1, 1).unwrap(), 1);
            counter.flush().unwrap();
            assert_eq!(storage.load(1).unwrap(), BallotSet::from([1]));

            // The older flush now deletes the vote and loses the snapshot swap.
            held.release.wait();
            older.join().unwrap().unwrap();
        });
        assert_eq!(storage.load(1).unwrap(), BallotSet::new());

        counter.flush().unwrap();
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1]));
        assert_eq!(counter.estimate_count(1).unwrap(), 1);

        counter.flush().unwrap();
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1]));
    }

    #[test_log::test]
    fn test_sequential_flushes_keep_snapshot_in_sync() {
        let (_, storage) = setup(ConsistencyCheck::Strict);
        let counter = open(&storage, false);
        let mut rng = SmallRng::seed_from_u64(114514);

        for round in 0..20 {
            for _ in 0..200 {
                let key = rng.random_range(1..=8);
                let actor = rng.random_range(1..=6);
                if rng.random_bool(0.5) {
                    counter.increment(key, actor).unwrap();
                } else {
                    counter.decrement(key, actor).unwrap();
                }
            }
            counter.flush().unwrap();
            if round % 5 == 4 {
                counter.clear_cache();
            }
        }

        let persisted = storage.load_all_map().unwrap();
        for (key, set) in persisted {
            assert_eq!(counter.estimate_count(key).unwrap(), set.aggregate());
        }
    }
}
