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

use std::{borrow::Cow, fmt::Debug, sync::Arc, time::Instant};

use itertools::Itertools;
use tally_common::{
    error::Result,
    event::StoreId,
    metrics::{registry::noop::NoopMetricsRegistry, Metrics, RegistryOps},
};

use crate::{
    ballot::{BallotMap, BallotSet, Key},
    consistency::{collect_mismatches, report, ConsistencyCheck},
    diff::Diff,
    storage::{Baseline, StoreReport, VoteStorage},
};

/// Raw access to a durable backend, driven by [`DiffStorage`].
pub trait DiffBackend: Send + Sync + Debug + 'static {
    /// Identity of the backend.
    fn store_id(&self) -> &StoreId;

    /// Load the persisted set of one key.
    fn load(&self, key: Key) -> Result<BallotSet>;

    /// Load the persisted sets of `keys` that have at least one vote.
    fn load_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()>;

    /// Load every persisted set that has at least one vote.
    fn load_all(&self, consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()>;

    /// Apply a diff with batched writes.
    ///
    /// `curr` is the target state the diff was computed from. The writes are not atomic: on error, a prefix of the
    /// diff may have been applied.
    fn apply(&self, diff: &Diff, curr: &BallotMap) -> Result<()>;

    /// Write every entry of `curr` one by one, updating the existing row or inserting a new one.
    ///
    /// Nothing is deleted.
    fn apply_ultra_safe(&self, curr: &BallotMap) -> Result<()>;
}

/// [`VoteStorage`] that flushes by applying the minimal [`Diff`] to a [`DiffBackend`].
#[derive(Debug)]
pub struct DiffStorage<B>
where
    B: DiffBackend,
{
    backend: B,
    consistency: ConsistencyCheck,
    metrics: Arc<Metrics>,
}

impl<B> DiffStorage<B>
where
    B: DiffBackend,
{
    /// Wrap a backend with the default consistency check and noop metrics.
    pub fn new(backend: B) -> Self {
        let metrics = Arc::new(Metrics::new(Self::metrics_name(&backend), &NoopMetricsRegistry));
        Self {
            backend,
            consistency: ConsistencyCheck::default(),
            metrics,
        }
    }

    /// Set the verification of caller snapshots.
    ///
    /// Default: [`ConsistencyCheck::Warn`] in debug builds, [`ConsistencyCheck::Disabled`] otherwise.
    pub fn with_consistency_check(mut self, consistency: ConsistencyCheck) -> Self {
        self.consistency = consistency;
        self
    }

    /// Report storage metrics to `registry`, labeled with the store id.
    pub fn with_metrics_registry(mut self, registry: &dyn RegistryOps) -> Self {
        self.metrics = Arc::new(Metrics::new(Self::metrics_name(&self.backend), registry));
        self
    }

    /// The wrapped backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn metrics_name(backend: &B) -> Cow<'static, str> {
        backend.store_id().to_string().into()
    }

    fn resolve_prev<'a>(&self, curr: &BallotMap, baseline: Baseline<'a>) -> Result<Cow<'a, BallotMap>> {
        match baseline {
            Baseline::Snapshot(prev) => {
                if self.consistency != ConsistencyCheck::Disabled {
                    let mismatches = collect_mismatches(&self.backend, curr, prev)?;
                    self.metrics.storage_mismatch.increase(mismatches.len() as _);
                    report(self.backend.store_id(), self.consistency, &mismatches);
                }
                Ok(Cow::Borrowed(prev))
            }
            Baseline::Fresh => {
                let keys = curr.keys().copied().sorted_unstable().collect_vec();
                let mut prev = BallotMap::with_capacity(keys.len());
                self.backend.load_batch(&keys, &mut |key, set| {
                    prev.insert(key, set);
                })?;
                Ok(Cow::Owned(prev))
            }
        }
    }
}

impl<B> VoteStorage for DiffStorage<B>
where
    B: DiffBackend,
{
    fn store_id(&self) -> &StoreId {
        self.backend.store_id()
    }

    fn load(&self, key: Key) -> Result<BallotSet> {
        let now = Instant::now();
        let res = self.backend.load(key);
        self.metrics.storage_load_duration.record(now.elapsed().as_secs_f64());
        res
    }

    fn load_batch(&self, keys: &[Key], consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let res = self.backend.load_batch(keys, consumer);
        self.metrics.storage_load_duration.record(now.elapsed().as_secs_f64());
        res
    }

    fn load_all(&self, consumer: &mut dyn FnMut(Key, BallotSet)) -> Result<()> {
        let now = Instant::now();
        let res = self.backend.load_all(consumer);
        self.metrics.storage_load_duration.record(now.elapsed().as_secs_f64());
        res
    }

    fn store_batch(&self, curr: &BallotMap, baseline: Baseline<'_>) -> Result<StoreReport> {
        let now = Instant::now();

        let prev = self.resolve_prev(curr, baseline)?;
        let diff = Diff::compute(curr, &prev);
        if diff.is_empty() {
            return Ok(StoreReport::default());
        }

        let mut report = StoreReport {
            added: diff.added.len(),
            modified: diff.modified.len(),
            deleted: diff.deleted_rows(),
            fallback: false,
        };

        match self.backend.apply(&diff, curr) {
            Ok(()) => {
                self.metrics.storage_added.increase(report.added as _);
                self.metrics.storage_modified.increase(report.modified as _);
                self.metrics.storage_deleted.increase(report.deleted as _);
            }
            Err(e) => {
                tracing::error!(
                    "[diff storage]: failed to store batch to {}, fall back to ultra-safe method: {e}",
                    self.backend.store_id()
                );
                self.metrics.storage_fallback.increase(1);
                self.backend.apply_ultra_safe(curr)?;
                report.fallback = true;
            }
        }

        self.metrics.storage_store_duration.record(now.elapsed().as_secs_f64());
        tracing::debug!("[diff storage]: stored batch to {}: {report:?}", self.backend.store_id());
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::{
        diff::VoteRow,
        memory::MemoryVoteTable,
        table::{TableBackend, VoteTable},
    };

    fn is_send_sync_static<T: Send + Sync + 'static>() {}

    #[test]
    fn test_send_sync_static() {
        is_send_sync_static::<DiffStorage<TableBackend<MemoryVoteTable>>>();
    }

    fn storage(table: &Arc<MemoryVoteTable>) -> DiffStorage<TableBackend<Arc<MemoryVoteTable>>> {
        DiffStorage::new(TableBackend::new(table.clone())).with_consistency_check(ConsistencyCheck::Strict)
    }

    fn map<const N: usize>(entries: [(Key, &[i32]); N]) -> BallotMap {
        entries
            .into_iter()
            .map(|(key, set)| (key, set.iter().copied().collect()))
            .collect()
    }

    #[test_log::test]
    fn test_store_fresh_then_snapshot() {
        let table = Arc::new(MemoryVoteTable::new("votes"));
        let storage = storage(&table);

        let curr = map([(1000, &[1, 2, 99])]);
        let report = storage.store_batch(&curr, Baseline::Fresh).unwrap();
        assert_eq!(report.added, 3);
        assert_eq!(storage.load(1000).unwrap(), BallotSet::from([1, 2, 99]));

        let next = map([(1000, &[-1, 99, 5])]);
        let report = storage.store_batch(&next, Baseline::Snapshot(&curr)).unwrap();
        assert_eq!(
            report,
            StoreReport {
                added: 1,
                modified: 1,
                deleted: 1,
                fallback: false
            }
        );
        assert_eq!(storage.load_all_map().unwrap(), next);
    }

    #[test_log::test]
    fn test_store_is_idempotent() {
        let table = Arc::new(MemoryVoteTable::new("votes"));
        let storage = storage(&table);

        let curr = map([(1, &[1, -2]), (2, &[3])]);
        storage.store_batch(&curr, Baseline::Fresh).unwrap();
        let report = storage.store_batch(&curr, Baseline::Fresh).unwrap();
        assert!(report.is_noop());
        let report = storage.store_batch(&curr, Baseline::Snapshot(&curr)).unwrap();
        assert!(report.is_noop());
        assert_eq!(storage.load_all_map().unwrap(), curr);
    }

    #[test_log::test]
    fn test_fallback_on_batch_failure() {
        let table = Arc::new(MemoryVoteTable::new("votes"));
        let storage = storage(&table);

        storage.store_batch(&map([(1, &[1, 2])]), Baseline::Fresh).unwrap();

        table.fail_batches(1);
        let report = storage.store_batch(&map([(1, &[-1, 2, 3])]), Baseline::Fresh).unwrap();
        assert!(report.fallback);
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([-1, 2, 3]));
    }

    #[test_log::test]
    fn test_fallback_keeps_deleted_rows() {
        let table = Arc::new(MemoryVoteTable::new("votes"));
        let storage = storage(&table);

        storage.store_batch(&map([(1, &[1, 2])]), Baseline::Fresh).unwrap();

        table.fail_batches(1);
        let report = storage.store_batch(&map([(1, &[2])]), Baseline::Fresh).unwrap();
        assert!(report.fallback);
        // The ultra-safe path does not replay deletions.
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1, 2]));

        let report = storage.store_batch(&map([(1, &[2])]), Baseline::Fresh).unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([2]));
    }

    #[test_log::test]
    fn test_fallback_failure_propagates() {
        let table = Arc::new(MemoryVoteTable::new("votes"));
        let storage =
            DiffStorage::new(TableBackend::new(table.clone())).with_consistency_check(ConsistencyCheck::Disabled);

        table.set_offline(true);
        assert!(storage.store_batch(&map([(1, &[1])]), Baseline::Snapshot(&BallotMap::new())).is_err());
        table.set_offline(false);
        assert!(storage.load_all_map().unwrap().is_empty());
    }

    #[test_log::test]
    fn test_constraint_violation_falls_back() {
        let table = Arc::new(MemoryVoteTable::new("votes"));
        let storage = DiffStorage::new(TableBackend::new(table.clone())).with_consistency_check(ConsistencyCheck::Warn);

        // Someone else inserted the row the snapshot does not know about.
        table
            .insert_batch(&[VoteRow {
                key: 1,
                actor: 1,
                value: -1,
            }])
            .unwrap();

        let report = storage
            .store_batch(&map([(1, &[1])]), Baseline::Snapshot(&BallotMap::new()))
            .unwrap();
        assert!(report.fallback);
        assert_eq!(storage.load(1).unwrap(), BallotSet::from([1]));
    }

    #[test]
    #[should_panic]
    fn test_strict_consistency_check() {
        let table = Arc::new(MemoryVoteTable::new("votes"));
        let storage = storage(&table);

        table
            .insert_batch(&[VoteRow {
                key: 1,
                actor: 7,
                value: 1,
            }])
            .unwrap();
        let _ = storage.store_batch(&map([(1, &[1])]), Baseline::Snapshot(&HashMap::new()));
    }
}
